//! The front end — lexer, parser, and semantic analyzer — is an external
//! collaborator: this module only defines the AST/symbol-table shape the
//! core consumes from it, not the analysis that produces it.

pub mod ast;
pub mod symbols;

pub use ast::*;
pub use symbols::*;
