mod demangle;
mod process;

use std::collections::BTreeMap;

pub use self::process::ProcessSymbols;

pub const UNKNOWN: &str = "<unknown>";

/// A global or static object of the target; its bytes are scanned as leak roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// Source location of a program counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Location {
    pub fn unknown() -> Self {
        Self {
            function: UNKNOWN.to_string(),
            file: None,
            line: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.function != UNKNOWN
    }
}

/// One captured return address, resolved unless simple output was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    pub location: Option<Location>,
}

/// Symbol information of the target.
pub trait Symbols {
    /// Lists every global object.
    fn globals(&self) -> Vec<GlobalSymbol>;

    /// Resolves a program counter; unknown addresses yield [`Location::unknown`].
    fn resolve_pc(&self, pc: u64) -> Location;
}

impl<S: Symbols + ?Sized> Symbols for &S {
    fn globals(&self) -> Vec<GlobalSymbol> {
        (**self).globals()
    }

    fn resolve_pc(&self, pc: u64) -> Location {
        (**self).resolve_pc(pc)
    }
}

/// A symbol table assembled ahead of time, e.g. from the target's ELF `.symtab`.
///
/// Function names may be given mangled: they are demangled when resolved.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    globals: Vec<GlobalSymbol>,
    functions: BTreeMap<u64, FunctionSymbol>,
}

#[derive(Debug, Clone)]
struct FunctionSymbol {
    name: String,
    size: u64,
    file: Option<String>,
    line: Option<u32>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a global object.
    pub fn add_global(&mut self, name: impl Into<String>, address: u64, size: u64) {
        self.globals.push(GlobalSymbol {
            name: name.into(),
            address,
            size,
        });
    }

    /// Registers a function covering `[address, address + size)`.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        address: u64,
        size: u64,
        file: Option<String>,
        line: Option<u32>,
    ) {
        self.functions.insert(
            address,
            FunctionSymbol {
                name: name.into(),
                size,
                file,
                line,
            },
        );
    }

    /// Iterates over the global objects.
    pub fn iter_globals(&self) -> impl Iterator<Item = &GlobalSymbol> {
        self.globals.iter()
    }
}

impl Symbols for SymbolTable {
    fn globals(&self) -> Vec<GlobalSymbol> {
        self.globals.clone()
    }

    fn resolve_pc(&self, pc: u64) -> Location {
        let Some((address, function)) = self.functions.range(..=pc).next_back() else {
            return Location::unknown();
        };
        if pc - address >= function.size {
            return Location::unknown();
        }

        Location {
            function: demangle::demangle(&function.name),
            file: function.file.clone(),
            line: function.line,
        }
    }
}
