use std::ffi::c_void;

use super::{GlobalSymbol, Location, Symbols, demangle};

/// Resolves program counters of the current process through the `backtrace` crate.
///
/// Meant for inspecting an allocator image that lives inside this very process; the roots still
/// have to be supplied by the caller, since `backtrace` cannot enumerate data symbols.
#[derive(Debug, Clone, Default)]
pub struct ProcessSymbols {
    globals: Vec<GlobalSymbol>,
}

impl ProcessSymbols {
    pub fn new(globals: Vec<GlobalSymbol>) -> Self {
        Self { globals }
    }
}

impl Symbols for ProcessSymbols {
    fn globals(&self) -> Vec<GlobalSymbol> {
        self.globals.clone()
    }

    fn resolve_pc(&self, pc: u64) -> Location {
        let mut location = None;
        backtrace::resolve(pc as usize as *mut c_void, |symbol| {
            if location.is_some() {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };

            location = Some(Location {
                function: demangle::trim_hash(&format!("{name}")).to_string(),
                file: symbol.filename().map(|path| path.display().to_string()),
                line: symbol.lineno(),
            });
        });

        location.unwrap_or_else(Location::unknown)
    }
}
