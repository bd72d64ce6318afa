//! The global symbol table consumed from the semantic analyzer: qualified
//! name to declaration, used by the frame allocator to resolve types and
//! storage directives without re-walking the AST.

use crate::common::{Id, Map};
use crate::front::ast::{FunctionDecl, GlobalDecl, Type};

#[derive(Clone, Debug)]
pub enum Symbol {
    Global(GlobalDecl),
    Function(FunctionDecl),
}

impl Symbol {
    pub fn name(&self) -> Id {
        match self {
            Symbol::Global(g) => g.name,
            Symbol::Function(f) => f.name,
        }
    }
}

/// A flat, qualified-name-keyed table of every declaration in the
/// compilation unit.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    symbols: Map<Id, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn insert(&mut self, symbol: Symbol) {
        self.symbols.insert(symbol.name(), symbol);
    }

    pub fn get(&self, name: Id) -> Option<&Symbol> {
        self.symbols.get(&name)
    }

    pub fn function(&self, name: Id) -> Option<&FunctionDecl> {
        match self.symbols.get(&name) {
            Some(Symbol::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn global(&self, name: Id) -> Option<&GlobalDecl> {
        match self.symbols.get(&name) {
            Some(Symbol::Global(g)) => Some(g),
            _ => None,
        }
    }

    pub fn type_of(&self, name: Id) -> Option<&Type> {
        match self.symbols.get(&name) {
            Some(Symbol::Global(g)) => Some(&g.ty),
            Some(Symbol::Function(f)) => Some(&f.return_type),
            None => None,
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.symbols.values().filter_map(|s| match s {
            Symbol::Function(f) => Some(f),
            _ => None,
        })
    }

    pub fn globals(&self) -> impl Iterator<Item = &GlobalDecl> {
        self.symbols.values().filter_map(|s| match s {
            Symbol::Global(g) => Some(g),
            _ => None,
        })
    }

    pub fn from_program(program: &crate::front::ast::Program) -> Self {
        let mut table = SymbolTable::new();
        for module in &program.modules {
            for global in &module.globals {
                table.insert(Symbol::Global(global.clone()));
            }
            for function in &module.functions {
                table.insert(Symbol::Function(function.clone()));
            }
        }
        table
    }
}
