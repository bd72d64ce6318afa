//! The 3-address, basic-block-structured IL. Built by the external IL
//! generator (not implemented here — this crate draws the line between the
//! IL generator and the IL optimizer), mutated in place by the optimizer
//! (`middle::optimize`), and consumed by the code generator.
//!
//! Basic blocks are stored in an arena (`Vec<BasicBlock>`) and referenced by
//! index rather than by pointer, so the predecessor/successor cycles every
//! block needs don't become reference cycles.

use crate::common::{Id, Map, Span};
use crate::front::ast::Type;

/// An index into a function's basic-block arena.
pub type BlockId = usize;

/// An SSA temporary. Every temporary has exactly one definition within a
/// function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temp(pub u32);

/// Where a global variable is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageClass {
    ZeroPage,
    Ram,
    Data,
    FixedAddress(u16),
}

#[derive(Clone, Debug)]
pub struct Global {
    pub name: Id,
    pub ty: Type,
    pub storage: StorageClass,
    pub initial_value: Option<Vec<u8>>,
}

/// An IL-level operand: either a temporary's value or an immediate
/// constant. Variable references are lowered to `Load`/`Store`
/// instructions rather than appearing as bare operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Temp(Temp),
    Const(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Lt,
    Eq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    Zero,
    NotZero,
    True,
}

/// One IL instruction. Every variant carries an optional destination
/// temporary and a source-location back-pointer.
#[derive(Clone, Debug)]
pub enum ILInstruction {
    Const {
        dst: Temp,
        value: i64,
        span: Span,
    },
    Binary {
        dst: Temp,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
        span: Span,
    },
    Unary {
        dst: Temp,
        op: UnOp,
        src: Operand,
        span: Span,
    },
    /// `dst = src`, unconditionally. The target of algebraic-identity
    /// rewrites and copy propagation; the external IL generator doesn't
    /// need to emit these directly, but the optimizer does.
    Copy {
        dst: Temp,
        src: Operand,
        span: Span,
    },
    Load {
        dst: Temp,
        var: Id,
        span: Span,
    },
    Store {
        var: Id,
        value: Operand,
        span: Span,
    },
    /// Indexed array load/store — the AST's `Index`/array types require
    /// it, so it's added here rather than guessed at in code generation.
    LoadIndexed {
        dst: Temp,
        base: Id,
        index: Operand,
        span: Span,
    },
    StoreIndexed {
        base: Id,
        index: Operand,
        value: Operand,
        span: Span,
    },
    /// Volatile absolute memory read (`peek`).
    Peek {
        dst: Temp,
        addr: Operand,
        span: Span,
    },
    /// Volatile absolute memory write (`poke`).
    Poke {
        addr: Operand,
        value: Operand,
        span: Span,
    },
    /// Volatile hardware-mapped read, distinguished from `Peek` only for
    /// diagnostics — both are equally non-reorderable.
    HwRead {
        dst: Temp,
        addr: u16,
        span: Span,
    },
    HwWrite {
        addr: u16,
        value: Operand,
        span: Span,
    },
    /// `sys(addr)` — call a machine-language routine directly.
    Sys {
        addr: Operand,
        span: Span,
    },
    Call {
        dst: Option<Temp>,
        callee: Id,
        args: Vec<Operand>,
        span: Span,
    },
    /// SSA merge point. Present only between optimizer passes that
    /// preserve SSA form.
    Phi {
        dst: Temp,
        incoming: Vec<(BlockId, Operand)>,
        span: Span,
    },
}

impl ILInstruction {
    pub fn dest(&self) -> Option<Temp> {
        use ILInstruction::*;
        match self {
            Const { dst, .. }
            | Binary { dst, .. }
            | Unary { dst, .. }
            | Copy { dst, .. }
            | Load { dst, .. }
            | LoadIndexed { dst, .. }
            | Peek { dst, .. }
            | HwRead { dst, .. }
            | Phi { dst, .. } => Some(*dst),
            Call { dst, .. } => *dst,
            Store { .. }
            | StoreIndexed { .. }
            | Poke { .. }
            | HwWrite { .. }
            | Sys { .. } => None,
        }
    }

    pub fn span(&self) -> Span {
        use ILInstruction::*;
        match self {
            Const { span, .. }
            | Binary { span, .. }
            | Unary { span, .. }
            | Copy { span, .. }
            | Load { span, .. }
            | Store { span, .. }
            | LoadIndexed { span, .. }
            | StoreIndexed { span, .. }
            | Peek { span, .. }
            | Poke { span, .. }
            | HwRead { span, .. }
            | HwWrite { span, .. }
            | Sys { span, .. }
            | Call { span, .. }
            | Phi { span, .. } => *span,
        }
    }

    /// True for `peek`/`poke`/hardware read-write: never eliminated,
    /// reordered across another volatile op, or hoisted out of loops.
    pub fn is_volatile(&self) -> bool {
        matches!(
            self,
            ILInstruction::Peek { .. }
                | ILInstruction::Poke { .. }
                | ILInstruction::HwRead { .. }
                | ILInstruction::HwWrite { .. }
        )
    }

    /// True for instructions whose absence changes no observable state —
    /// eligible for dead-code elimination if their result is unused.
    /// Calls are conservatively treated as having side effects unless
    /// proven pure, which this crate does not attempt.
    pub fn is_pure(&self) -> bool {
        use ILInstruction::*;
        matches!(
            self,
            Const { .. }
                | Binary { .. }
                | Unary { .. }
                | Copy { .. }
                | Load { .. }
                | LoadIndexed { .. }
                | Phi { .. }
        )
    }
}

/// The terminator of a basic block: exactly one, as the last instruction.
#[derive(Clone, Debug)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        cond: Condition,
        value: Operand,
        if_true: BlockId,
        if_false: BlockId,
    },
    Return(Option<Operand>),
}

#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub label: Id,
    pub instructions: Vec<ILInstruction>,
    pub terminator: Terminator,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
}

impl BasicBlock {
    pub fn new(label: Id, terminator: Terminator) -> Self {
        BasicBlock {
            label,
            instructions: Vec::new(),
            terminator,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: Id,
    pub params: Vec<(Id, Type)>,
    pub return_type: Type,
    pub blocks: Vec<BasicBlock>,
    pub next_temp: u32,
}

impl Function {
    pub fn new(name: Id, params: Vec<(Id, Type)>, return_type: Type) -> Self {
        Function {
            name,
            params,
            return_type,
            blocks: Vec::new(),
            next_temp: 0,
        }
    }

    pub fn fresh_temp(&mut self) -> Temp {
        let t = Temp(self.next_temp);
        self.next_temp += 1;
        t
    }

    /// Recomputes `predecessors`/`successors` on every block from each
    /// block's terminator, restoring the bidirectional consistency
    /// invariant after an optimizer pass rewrites block contents in place.
    pub fn rebuild_cfg_links(&mut self) {
        for block in &mut self.blocks {
            block.predecessors.clear();
            block.successors.clear();
        }
        let targets: Vec<(BlockId, Vec<BlockId>)> = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let succs = match &b.terminator {
                    Terminator::Jump(t) => vec![*t],
                    Terminator::Branch {
                        if_true, if_false, ..
                    } => vec![*if_true, *if_false],
                    Terminator::Return(_) => vec![],
                };
                (i, succs)
            })
            .collect();
        for (from, succs) in targets {
            for to in succs {
                self.blocks[from].successors.push(to);
                self.blocks[to].predecessors.push(from);
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ILModule {
    pub globals: Map<Id, Global>,
    pub functions: Map<Id, Function>,
    pub entry: Option<Id>,
}

impl ILModule {
    pub fn new() -> Self {
        ILModule::default()
    }
}
