//! The IL optimizer: a fixed-point peephole pass over each function's basic
//! blocks, built on the generic pattern framework in `middle::pattern`.

use crate::common::Set;
use crate::diagnostics::{Code, Diagnostics};
use crate::middle::il::{BinOp, ILInstruction, ILModule, Operand, Temp, UnOp};
use crate::middle::pattern::{run_to_fixed_point, MatchResult, Pattern, PatternContext, PatternRegistry, Savings};

/// Default cap on fixed-point iterations per block.
pub const MAX_ITERATIONS: u32 = 16;

/// Per-block context: which temporaries escape the instruction window a
/// pattern sees (terminator operands and any phi in a successor that
/// references this block), so dead-code/dead-store patterns don't remove
/// a definition that's still live.
struct ILOptContext {
    live_out: Set<u64>,
}

impl PatternContext for ILOptContext {
    fn is_volatile_address(&self, _address: i64) -> bool {
        // IL-level volatility is a property of the instruction variant
        // (Peek/Poke/HwRead/HwWrite), not of an address value; see
        // `ILInstruction::is_volatile`.
        false
    }

    fn is_live_out(&self, value_id: u64) -> bool {
        self.live_out.contains(&value_id)
    }
}

fn temp_key(t: Temp) -> u64 {
    t.0 as u64
}

fn operand_temp(op: &Operand) -> Option<Temp> {
    match op {
        Operand::Temp(t) => Some(*t),
        Operand::Const(_) => None,
    }
}

/// True if `instructions[index]` reads `var` (a named global/local, not an
/// SSA temp) before any write to it, scanning forward from `index`.
fn reads_var_before_write(instructions: &[ILInstruction], start: usize, var: crate::common::Id) -> Option<bool> {
    for instr in &instructions[start..] {
        match instr {
            ILInstruction::Load { var: v, .. } if *v == var => return Some(true),
            ILInstruction::Store { var: v, .. } if *v == var => return Some(false),
            _ => {
                if instruction_has_control_flow(instr) {
                    return None;
                }
            }
        }
    }
    None
}

fn instruction_has_control_flow(_instr: &ILInstruction) -> bool {
    // IL instructions never embed control flow (it lives in the block
    // terminator); kept for symmetry with the ASM-level equivalent check.
    false
}

// ---- Constant folding --------------------------------------------------

struct ConstantFold;

impl Pattern<ILInstruction> for ConstantFold {
    fn name(&self) -> &'static str {
        "constant-folding"
    }
    fn priority(&self) -> i32 {
        100
    }
    fn category(&self) -> &'static str {
        "arithmetic"
    }

    fn match_at(&self, instrs: &[ILInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        match instrs.get(index)? {
            ILInstruction::Binary {
                lhs: Operand::Const(_),
                rhs: Operand::Const(_),
                ..
            } => Some(MatchResult {
                length: 1,
                savings: Savings { cycles: 2, bytes: 2 },
            }),
            ILInstruction::Unary {
                src: Operand::Const(_),
                ..
            } => Some(MatchResult {
                length: 1,
                savings: Savings { cycles: 1, bytes: 1 },
            }),
            _ => None,
        }
    }

    fn apply(&self, instrs: &[ILInstruction], index: usize, _matched: &MatchResult) -> Vec<ILInstruction> {
        match &instrs[index] {
            ILInstruction::Binary {
                dst,
                op,
                lhs: Operand::Const(a),
                rhs: Operand::Const(b),
                span,
            } => {
                let value = eval_binop(*op, *a, *b);
                vec![ILInstruction::Const {
                    dst: *dst,
                    value,
                    span: *span,
                }]
            }
            ILInstruction::Unary {
                dst,
                op,
                src: Operand::Const(a),
                span,
            } => {
                let value = eval_unop(*op, *a);
                vec![ILInstruction::Const {
                    dst: *dst,
                    value,
                    span: *span,
                }]
            }
            other => vec![other.clone()],
        }
    }
}

fn eval_binop(op: BinOp, a: i64, b: i64) -> i64 {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::Shr => a.wrapping_shr(b as u32),
        BinOp::Lt => (a < b) as i64,
        BinOp::Eq => (a == b) as i64,
    }
}

fn eval_unop(op: UnOp, a: i64) -> i64 {
    match op {
        UnOp::Neg => a.wrapping_neg(),
        UnOp::Not => !a,
    }
}

// ---- Algebraic identities -----------------------------------------------

struct AlgebraicIdentity;

impl AlgebraicIdentity {
    fn identity_result(op: BinOp, lhs: Operand, rhs: Operand) -> Option<Operand> {
        match (op, lhs, rhs) {
            (BinOp::Add, x, Operand::Const(0)) => Some(x),
            (BinOp::Add, Operand::Const(0), x) => Some(x),
            (BinOp::Sub, x, Operand::Const(0)) => Some(x),
            (BinOp::Or, x, Operand::Const(0)) => Some(x),
            (BinOp::Or, Operand::Const(0), x) => Some(x),
            (BinOp::Xor, x, Operand::Const(0)) => Some(x),
            (BinOp::And, _, Operand::Const(0)) => Some(Operand::Const(0)),
            (BinOp::And, Operand::Const(0), _) => Some(Operand::Const(0)),
            (BinOp::And, x, Operand::Const(0xFF)) => Some(x),
            (BinOp::Or, _, Operand::Const(0xFF)) => Some(Operand::Const(0xFF)),
            _ => None,
        }
    }
}

impl Pattern<ILInstruction> for AlgebraicIdentity {
    fn name(&self) -> &'static str {
        "algebraic-identity"
    }
    fn priority(&self) -> i32 {
        90
    }
    fn category(&self) -> &'static str {
        "arithmetic"
    }

    fn match_at(&self, instrs: &[ILInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        match instrs.get(index)? {
            ILInstruction::Binary { op, lhs, rhs, .. } => {
                Self::identity_result(*op, *lhs, *rhs).map(|_| MatchResult {
                    length: 1,
                    savings: Savings { cycles: 2, bytes: 2 },
                })
            }
            _ => None,
        }
    }

    fn apply(&self, instrs: &[ILInstruction], index: usize, _matched: &MatchResult) -> Vec<ILInstruction> {
        match &instrs[index] {
            ILInstruction::Binary { dst, op, lhs, rhs, span } => {
                let result = Self::identity_result(*op, *lhs, *rhs).expect("match_at guarantees a result");
                vec![ILInstruction::Copy {
                    dst: *dst,
                    src: result,
                    span: *span,
                }]
            }
            other => vec![other.clone()],
        }
    }
}

// ---- Copy propagation ----------------------------------------------------

struct CopyPropagation;

fn substitute_operand(op: Operand, dst: Temp, src: Operand) -> Operand {
    match op {
        Operand::Temp(t) if t == dst => src,
        other => other,
    }
}

/// Rewrites every `Operand::Temp(dst)` reference in `instr` to `src`.
fn substitute_in_instruction(instr: &ILInstruction, dst: Temp, src: Operand) -> ILInstruction {
    use ILInstruction::*;
    match instr.clone() {
        Binary { dst: d, op, lhs, rhs, span } => Binary {
            dst: d,
            op,
            lhs: substitute_operand(lhs, dst, src),
            rhs: substitute_operand(rhs, dst, src),
            span,
        },
        Unary { dst: d, op, src: s, span } => Unary {
            dst: d,
            op,
            src: substitute_operand(s, dst, src),
            span,
        },
        Copy { dst: d, src: s, span } => Copy {
            dst: d,
            src: substitute_operand(s, dst, src),
            span,
        },
        Store { var, value, span } => Store {
            var,
            value: substitute_operand(value, dst, src),
            span,
        },
        LoadIndexed { dst: d, base, index, span } => LoadIndexed {
            dst: d,
            base,
            index: substitute_operand(index, dst, src),
            span,
        },
        StoreIndexed { base, index, value, span } => StoreIndexed {
            base,
            index: substitute_operand(index, dst, src),
            value: substitute_operand(value, dst, src),
            span,
        },
        Peek { dst: d, addr, span } => Peek {
            dst: d,
            addr: substitute_operand(addr, dst, src),
            span,
        },
        Poke { addr, value, span } => Poke {
            addr: substitute_operand(addr, dst, src),
            value: substitute_operand(value, dst, src),
            span,
        },
        Sys { addr, span } => Sys {
            addr: substitute_operand(addr, dst, src),
            span,
        },
        Call { dst: d, callee, args, span } => Call {
            dst: d,
            callee,
            args: args.into_iter().map(|a| substitute_operand(a, dst, src)).collect(),
            span,
        },
        other => other,
    }
}

fn instruction_reads_temp(instr: &ILInstruction, t: Temp) -> bool {
    use ILInstruction::*;
    let reads: Vec<Operand> = match instr {
        Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
        Unary { src, .. } | Peek { addr: src, .. } | Sys { addr: src, .. } => vec![*src],
        Copy { src, .. } => vec![*src],
        Store { value, .. } => vec![*value],
        LoadIndexed { index, .. } => vec![*index],
        StoreIndexed { index, value, .. } => vec![*index, *value],
        Poke { addr, value, .. } => vec![*addr, *value],
        Call { args, .. } => args.clone(),
        Const { .. } | Load { .. } | HwRead { .. } | HwWrite { .. } | Phi { .. } => vec![],
    };
    reads.into_iter().any(|op| operand_temp(&op) == Some(t))
}

impl Pattern<ILInstruction> for CopyPropagation {
    fn name(&self) -> &'static str {
        "copy-propagation"
    }
    fn priority(&self) -> i32 {
        70
    }
    fn category(&self) -> &'static str {
        "redundancy"
    }

    fn match_at(&self, instrs: &[ILInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let ILInstruction::Copy { dst, .. } = instrs.get(index)? else {
            return None;
        };
        // Find the next instruction that reads `dst`.
        let next_use = instrs[index + 1..]
            .iter()
            .position(|i| instruction_reads_temp(i, *dst))?;
        Some(MatchResult {
            length: next_use + 2,
            savings: Savings { cycles: 0, bytes: 0 },
        })
    }

    fn apply(&self, instrs: &[ILInstruction], index: usize, matched: &MatchResult) -> Vec<ILInstruction> {
        let ILInstruction::Copy { dst, src, .. } = instrs[index].clone() else {
            unreachable!("match_at guarantees a Copy");
        };
        let window = &instrs[index..index + matched.length];
        let mut out = vec![window[0].clone()];
        for instr in &window[1..] {
            out.push(substitute_in_instruction(instr, dst, src));
        }
        out
    }
}

// ---- Constant propagation -------------------------------------------------

struct ConstantPropagation;

impl Pattern<ILInstruction> for ConstantPropagation {
    fn name(&self) -> &'static str {
        "constant-propagation"
    }
    fn priority(&self) -> i32 {
        80
    }
    fn category(&self) -> &'static str {
        "redundancy"
    }

    fn match_at(&self, instrs: &[ILInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let ILInstruction::Const { dst, .. } = instrs.get(index)? else {
            return None;
        };
        let next_use = instrs[index + 1..]
            .iter()
            .position(|i| instruction_reads_temp(i, *dst))?;
        Some(MatchResult {
            length: next_use + 2,
            savings: Savings { cycles: 0, bytes: 1 },
        })
    }

    fn apply(&self, instrs: &[ILInstruction], index: usize, matched: &MatchResult) -> Vec<ILInstruction> {
        let ILInstruction::Const { dst, value, .. } = instrs[index].clone() else {
            unreachable!("match_at guarantees a Const");
        };
        let window = &instrs[index..index + matched.length];
        let mut out = vec![window[0].clone()];
        for instr in &window[1..] {
            out.push(substitute_in_instruction(instr, dst, Operand::Const(value)));
        }
        out
    }
}

// ---- Dead-code / dead-store elimination -----------------------------------

struct DeadCodeElimination;

impl Pattern<ILInstruction> for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }
    fn priority(&self) -> i32 {
        60
    }
    fn category(&self) -> &'static str {
        "redundancy"
    }

    fn match_at(&self, instrs: &[ILInstruction], index: usize, ctx: &dyn PatternContext) -> Option<MatchResult> {
        let instr = instrs.get(index)?;
        if !instr.is_pure() {
            return None;
        }
        let dst = instr.dest()?;
        let used_later = instrs[index + 1..].iter().any(|i| instruction_reads_temp(i, dst));
        if used_later || ctx.is_live_out(temp_key(dst)) {
            return None;
        }
        Some(MatchResult {
            length: 1,
            savings: Savings { cycles: 1, bytes: 1 },
        })
    }

    fn apply(&self, _instrs: &[ILInstruction], _index: usize, _matched: &MatchResult) -> Vec<ILInstruction> {
        vec![]
    }
}

struct DeadStoreElimination;

impl Pattern<ILInstruction> for DeadStoreElimination {
    fn name(&self) -> &'static str {
        "dead-store-elimination"
    }
    fn priority(&self) -> i32 {
        65
    }
    fn category(&self) -> &'static str {
        "redundancy"
    }

    fn match_at(&self, instrs: &[ILInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let ILInstruction::Store { var, .. } = instrs.get(index)? else {
            return None;
        };
        // A store is dead if the next thing touching `var` is another
        // store with no read in between.
        match reads_var_before_write(instrs, index + 1, *var) {
            Some(false) => {
                let distance = instrs[index + 1..]
                    .iter()
                    .position(|i| matches!(i, ILInstruction::Store { var: v, .. } if *v == *var))?;
                Some(MatchResult {
                    length: distance + 1,
                    savings: Savings { cycles: 2, bytes: 2 },
                })
            }
            _ => None,
        }
    }

    fn apply(&self, instrs: &[ILInstruction], index: usize, matched: &MatchResult) -> Vec<ILInstruction> {
        instrs[index + 1..index + matched.length].to_vec()
    }
}

fn build_registry() -> PatternRegistry<ILInstruction> {
    let mut registry = PatternRegistry::new();
    registry.register(Box::new(ConstantFold));
    registry.register(Box::new(AlgebraicIdentity));
    registry.register(Box::new(ConstantPropagation));
    registry.register(Box::new(CopyPropagation));
    registry.register(Box::new(DeadStoreElimination));
    registry.register(Box::new(DeadCodeElimination));
    registry
}

/// Removes basic blocks that became unreachable after an unconditional
/// jump rewrite, then rebuilds CFG links.
fn remove_unreachable_blocks(function: &mut crate::middle::il::Function) {
    if function.blocks.is_empty() {
        return;
    }
    let mut reachable = vec![false; function.blocks.len()];
    let mut stack = vec![0usize];
    while let Some(i) = stack.pop() {
        if reachable[i] {
            continue;
        }
        reachable[i] = true;
        match &function.blocks[i].terminator {
            crate::middle::il::Terminator::Jump(t) => stack.push(*t),
            crate::middle::il::Terminator::Branch { if_true, if_false, .. } => {
                stack.push(*if_true);
                stack.push(*if_false);
            }
            crate::middle::il::Terminator::Return(_) => {}
        }
    }

    if reachable.iter().all(|&r| r) {
        return;
    }

    let mut remap = vec![0usize; function.blocks.len()];
    let mut kept = Vec::new();
    for (old_index, block) in function.blocks.drain(..).enumerate() {
        if reachable[old_index] {
            remap[old_index] = kept.len();
            kept.push(block);
        }
    }
    for block in &mut kept {
        match &mut block.terminator {
            crate::middle::il::Terminator::Jump(t) => *t = remap[*t],
            crate::middle::il::Terminator::Branch { if_true, if_false, .. } => {
                *if_true = remap[*if_true];
                *if_false = remap[*if_false];
            }
            crate::middle::il::Terminator::Return(_) => {}
        }
    }
    function.blocks = kept;
    function.rebuild_cfg_links();
}

fn live_out_for_block(function: &crate::middle::il::Function, block_index: usize) -> Set<u64> {
    let mut live = Set::new();
    let block = &function.blocks[block_index];
    match &block.terminator {
        crate::middle::il::Terminator::Return(Some(op)) => {
            if let Some(t) = operand_temp(op) {
                live.insert(temp_key(t));
            }
        }
        crate::middle::il::Terminator::Branch { value, .. } => {
            if let Some(t) = operand_temp(value) {
                live.insert(temp_key(t));
            }
        }
        _ => {}
    }
    for other in &function.blocks {
        for instr in &other.instructions {
            if let ILInstruction::Phi { incoming, .. } = instr {
                for (from, op) in incoming {
                    if *from == block_index {
                        if let Some(t) = operand_temp(op) {
                            live.insert(temp_key(t));
                        }
                    }
                }
            }
        }
    }
    live
}

/// Runs the IL optimizer to fixed point over every function and block in
/// `module`. No-op (aside from diagnostics) when optimizations are
/// disabled by the caller via `enabled = false` (the `O0` level).
pub fn optimize(module: &mut ILModule, enabled: bool, diagnostics: &mut Diagnostics) {
    if !enabled {
        return;
    }
    let registry = build_registry();

    for name in module.functions.keys().copied().collect::<Vec<_>>() {
        let function = module.functions.get_mut(&name).unwrap();
        let mut capped_any = false;
        for block_index in 0..function.blocks.len() {
            let live_out = live_out_for_block(function, block_index);
            let ctx = ILOptContext { live_out };
            let block = &mut function.blocks[block_index];
            let (_changed, _iters, capped) =
                run_to_fixed_point(&mut block.instructions, &registry, &ctx, MAX_ITERATIONS);
            capped_any |= capped;
        }
        remove_unreachable_blocks(function);
        if capped_any {
            diagnostics.info(
                Code::IlIterationCap,
                format!(
                    "IL optimizer for `{name}` hit the {MAX_ITERATIONS}-iteration cap; \
                     a pattern may be oscillating"
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;
    use crate::middle::il::{BasicBlock, Function, Terminator};
    use crate::front::ast::Type;

    fn single_block_function(instructions: Vec<ILInstruction>, terminator: Terminator) -> Function {
        let mut f = Function::new(intern("f"), vec![], Type::Void);
        f.blocks.push(BasicBlock::new(intern("entry"), terminator));
        f.blocks[0].instructions = instructions;
        f.next_temp = 10;
        f
    }

    fn span() -> crate::common::Span {
        crate::common::Span::synthetic()
    }

    #[test]
    fn folds_constant_binary() {
        let mut module = ILModule::new();
        let f = single_block_function(
            vec![ILInstruction::Binary {
                dst: Temp(0),
                op: BinOp::Add,
                lhs: Operand::Const(2),
                rhs: Operand::Const(3),
                span: span(),
            }],
            Terminator::Return(Some(Operand::Temp(Temp(0)))),
        );
        module.functions.insert(f.name, f);
        let mut diags = Diagnostics::new();
        optimize(&mut module, true, &mut diags);
        let instrs = &module.functions[&intern("f")].blocks[0].instructions;
        assert!(matches!(instrs[0], ILInstruction::Const { value: 5, .. }));
    }

    #[test]
    fn eliminates_dead_store() {
        let mut module = ILModule::new();
        let f = single_block_function(
            vec![
                ILInstruction::Const {
                    dst: Temp(0),
                    value: 1,
                    span: span(),
                },
                ILInstruction::Store {
                    var: intern("x"),
                    value: Operand::Temp(Temp(0)),
                    span: span(),
                },
                ILInstruction::Const {
                    dst: Temp(1),
                    value: 2,
                    span: span(),
                },
                ILInstruction::Store {
                    var: intern("x"),
                    value: Operand::Temp(Temp(1)),
                    span: span(),
                },
            ],
            Terminator::Return(None),
        );
        module.functions.insert(f.name, f);
        let mut diags = Diagnostics::new();
        optimize(&mut module, true, &mut diags);
        let instrs = &module.functions[&intern("f")].blocks[0].instructions;
        let store_count = instrs
            .iter()
            .filter(|i| matches!(i, ILInstruction::Store { .. }))
            .count();
        assert_eq!(store_count, 1);
    }

    #[test]
    fn never_removes_volatile_peek_poke() {
        let mut module = ILModule::new();
        let f = single_block_function(
            vec![ILInstruction::Poke {
                addr: Operand::Const(0xD020),
                value: Operand::Const(5),
                span: span(),
            }],
            Terminator::Return(None),
        );
        module.functions.insert(f.name, f);
        let mut diags = Diagnostics::new();
        optimize(&mut module, true, &mut diags);
        let instrs = &module.functions[&intern("f")].blocks[0].instructions;
        assert_eq!(instrs.len(), 1);
        assert!(instrs[0].is_volatile());
    }

    #[test]
    fn disabled_at_o0_leaves_module_untouched() {
        let mut module = ILModule::new();
        let f = single_block_function(
            vec![ILInstruction::Binary {
                dst: Temp(0),
                op: BinOp::Add,
                lhs: Operand::Const(2),
                rhs: Operand::Const(3),
                span: span(),
            }],
            Terminator::Return(Some(Operand::Temp(Temp(0)))),
        );
        module.functions.insert(f.name, f);
        let mut diags = Diagnostics::new();
        optimize(&mut module, false, &mut diags);
        let instrs = &module.functions[&intern("f")].blocks[0].instructions;
        assert!(matches!(instrs[0], ILInstruction::Binary { .. }));
    }
}
