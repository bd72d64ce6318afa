//! Common definitions that are shared between different parts of the compiler.

// Use sorted sets and maps for consistent output: the pipeline is a
// deterministic, cooperatively-scheduled loop, so hash-map iteration order
// anywhere in it would make two runs over the same input diverge.
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers: fully qualified symbol names, interned so call-graph edges,
/// frame slots, and IL operands can all carry `Id` by value.
pub type Id = internment::Intern<String>;

/// Interns a string, the canonical way to build an `Id` from source text.
pub fn intern(s: &str) -> Id {
    Id::new(s.to_string())
}

/// A position in a source file, carried on every AST/IL/ASM-IL node so
/// diagnostics can point back at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Span {
    pub file: Id,
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl Span {
    pub fn new(file: Id, line: u32, column: u32, offset: u32) -> Self {
        Span {
            file,
            line,
            column,
            offset,
        }
    }

    /// A placeholder span for synthetic nodes the compiler itself introduces
    /// (e.g. BASIC-stub bytes) that have no corresponding source text.
    pub fn synthetic() -> Self {
        Span {
            file: intern("<generated>"),
            line: 0,
            column: 0,
            offset: 0,
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}
