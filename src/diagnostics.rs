//! Accumulable compiler diagnostics.
//!
//! Diagnostics never unwind. Every phase takes a `&mut Diagnostics` sink
//! and keeps going as long as doing so yields useful information; whether a
//! phase stops is encoded by its own return type, not by this module.

use std::fmt;

use derive_more::Display;

use crate::common::Span;

/// How serious a diagnostic is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Severity {
    #[display("info")]
    Info,
    #[display("warning")]
    Warning,
    #[display("error")]
    Error,
}

/// One machine-readable diagnostic code. New phases add variants here
/// rather than stringly-typed codes, so callers can `match` on failure
/// modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Code {
    #[display("SFA_RECURSION")]
    SfaRecursion,
    #[display("SFA_ZP_OVERFLOW")]
    SfaZpOverflow,
    #[display("SFA_FRAME_OVERFLOW")]
    SfaFrameOverflow,
    #[display("SFA_MULTITHREAD_CALL")]
    SfaMultithreadCall,
    #[display("SFA_NO_ENTRY")]
    SfaNoEntry,
    #[display("SFA_BAD_ENTRY_SIGNATURE")]
    SfaBadEntrySignature,
    #[display("SFA_UNREACHABLE_FUNCTION")]
    SfaUnreachableFunction,
    #[display("SFA_INVALID_MAP_ADDRESS")]
    SfaInvalidMapAddress,
    #[display("IL_ITERATION_CAP")]
    IlIterationCap,
    #[display("CODEGEN_SPILL_OVERFLOW")]
    CodegenSpillOverflow,
    #[display("CODEGEN_UNSUPPORTED_INSTRUCTION")]
    CodegenUnsupportedInstruction,
    #[display("ASM_UNDEFINED_LABEL")]
    AsmUndefinedLabel,
    #[display("ASM_BRANCH_OUT_OF_RANGE")]
    AsmBranchOutOfRange,
    #[display("ASM_IMMEDIATE_OUT_OF_RANGE")]
    AsmImmediateOutOfRange,
    #[display("BUILTIN_ARGUMENT_OUT_OF_RANGE")]
    BuiltinArgumentOutOfRange,
    #[display("BUILTIN_HARDWARE_ACCESS")]
    BuiltinHardwareAccess,
    #[display("BUILTIN_ROM_WRITE")]
    BuiltinRomWrite,
    #[display("CONFIG_UNKNOWN_TARGET")]
    ConfigUnknownTarget,
    #[display("ACME_SUBPROCESS_FAILED")]
    AcmeSubprocessFailed,
    #[display("ACME_NOT_FOUND")]
    AcmeNotFound,
}

/// A single diagnostic: severity, code, message, optional location and
/// suggestions.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Code,
    pub message: String,
    pub location: Option<Span>,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, code: Code, message: impl Into<String>) -> Self {
        Diagnostic {
            severity,
            code,
            message: message.into(),
            location: None,
            suggestions: Vec::new(),
        }
    }

    pub fn error(code: Code, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    pub fn warning(code: Code, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn info(code: Code, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, code, message)
    }

    pub fn at(mut self, location: Span) -> Self {
        self.location = Some(location);
        self
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.severity, self.code, self.message)?;
        if let Some(loc) = &self.location {
            write!(f, "\n --> {loc}")?;
        }
        for suggestion in &self.suggestions {
            write!(f, "\n     = suggestion: {suggestion}")?;
        }
        Ok(())
    }
}

/// Accumulated diagnostics for one compilation run. Phases append to this;
/// nothing in this module ever clears it.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn error(&mut self, code: Code, message: impl Into<String>) {
        self.push(Diagnostic::error(code, message));
    }

    pub fn warning(&mut self, code: Code, message: impl Into<String>) {
        self.push(Diagnostic::warning(code, message));
    }

    pub fn info(&mut self, code: Code, message: impl Into<String>) {
        self.push(Diagnostic::info(code, message));
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    /// Promotes every warning to an error, per the `strict` config flag.
    /// Applied once at the pipeline boundary, never mid-phase.
    pub fn promote_warnings_to_errors(&mut self) {
        for diagnostic in &mut self.items {
            if diagnostic.severity == Severity::Warning {
                diagnostic.severity = Severity::Error;
            }
        }
    }

    /// Stable output order: file, then line, then column, then severity.
    /// Diagnostics with no location sort after all that do.
    pub fn sorted(&self) -> Vec<&Diagnostic> {
        let mut items: Vec<&Diagnostic> = self.items.iter().collect();
        items.sort_by(|a, b| {
            let key = |d: &Diagnostic| {
                d.location
                    .map(|s| (s.file, s.line, s.column))
                    .unwrap_or((crate::common::intern("\u{10FFFF}"), u32::MAX, u32::MAX))
            };
            key(a).cmp(&key(b)).then(a.severity.cmp(&b.severity))
        });
        items
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.sorted().into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_by_file_then_line_then_column_then_severity() {
        let mut diags = Diagnostics::new();
        let f = |name: &str, line, column| Span::new(crate::common::intern(name), line, column, 0);
        diags.push(Diagnostic::warning(Code::SfaMultithreadCall, "b").at(f("a.b65", 2, 1)));
        diags.push(Diagnostic::error(Code::SfaRecursion, "a").at(f("a.b65", 1, 5)));
        diags.push(Diagnostic::error(Code::SfaZpOverflow, "c").at(f("a.b65", 2, 1)));

        let sorted = diags.sorted();
        assert_eq!(sorted[0].message, "a");
        assert_eq!(sorted[1].code, Code::SfaZpOverflow);
        assert_eq!(sorted[2].code, Code::SfaMultithreadCall);
    }

    #[test]
    fn strict_promotes_warnings() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::warning(Code::SfaMultithreadCall, "w"));
        assert!(!diags.has_errors());
        diags.promote_warnings_to_errors();
        assert!(diags.has_errors());
    }
}
