use backtrace::SymbolName;

/// Demangles a raw symbol name and strips the rustc hash suffix.
///
/// Names that are not mangled (e.g. C symbols) are returned as they are.
pub fn demangle(raw: &str) -> String {
    let name = SymbolName::new(raw.as_bytes());
    trim_hash(&format!("{name}")).to_string()
}

/// Removes a trailing `::h0123456789abcdef` disambiguator.
pub fn trim_hash(name: &str) -> &str {
    let Some(pos) = name.rfind("::") else {
        return name;
    };

    let last = &name[pos + 2..];
    let is_hash = last.len() == 17
        && last.starts_with('h')
        && last[1..].chars().all(|c| c.is_ascii_hexdigit());
    if is_hash { &name[..pos] } else { name }
}
