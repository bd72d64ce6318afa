//! The 6502-specific ASM optimizer: the same fixed-point pattern framework
//! as the IL optimizer (`middle::pattern`), this time parameterized over
//! `AsmInstruction`. Patterns assume the convention codegen follows
//! throughout this crate: every branch target is attached to its owning
//! instruction via `AsmInstruction::label`, never left as a standalone
//! element mid-block, so a pattern can tell "is this instruction a jump
//! target" from the instruction alone.

use crate::config::PlatformConfig;
use crate::middle::pattern::{MatchResult, Pattern, PatternContext, PatternRegistry, Savings};

use super::asm::{AddressingMode, AsmInstruction, Opcode, Operand};

pub const MAX_ITERATIONS: u32 = 16;

struct AsmOptContext<'p> {
    platform: &'p PlatformConfig,
}

impl PatternContext for AsmOptContext<'_> {
    fn is_volatile_address(&self, address: i64) -> bool {
        let address = address as u16;
        self.platform.is_volatile(address)
    }
}

fn same_address(a: &AsmInstruction, b: &AsmInstruction) -> bool {
    matches!((&a.operand, &b.operand), (Operand::Immediate(x), Operand::Immediate(y)) if x == y)
        && a.mode == b.mode
}

fn touches_a(instr: &AsmInstruction) -> bool {
    use Opcode::*;
    matches!(
        instr.opcode,
        LDA | ADC | SBC | AND | ORA | EOR | ASL | LSR | ROL | ROR | TXA | TYA | PLA
    )
}

fn writes_memory(instr: &AsmInstruction, addr: i64) -> bool {
    matches!(instr.opcode, Opcode::STA | Opcode::STX | Opcode::STY | Opcode::INC | Opcode::DEC)
        && instr.address().map(|a| a as i64) == Some(addr)
}

fn reads_memory(instr: &AsmInstruction, addr: i64) -> bool {
    matches!(
        instr.opcode,
        Opcode::LDA | Opcode::LDX | Opcode::LDY | Opcode::ADC | Opcode::SBC | Opcode::AND | Opcode::ORA | Opcode::EOR | Opcode::CMP
    ) && instr.address().map(|a| a as i64) == Some(addr)
}

fn is_control_flow(instr: &AsmInstruction) -> bool {
    instr.opcode.is_branch() || matches!(instr.opcode, Opcode::JMP | Opcode::JSR | Opcode::RTS | Opcode::RTI | Opcode::BRK)
}

// ---- Load/store family (highest priority) ------------------------------

struct StoreLoadElimination;

impl Pattern<AsmInstruction> for StoreLoadElimination {
    fn name(&self) -> &'static str {
        "store-load-elimination"
    }
    fn priority(&self) -> i32 {
        200
    }
    fn category(&self) -> &'static str {
        "load-store"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if a.opcode != Opcode::STA || b.opcode != Opcode::LDA || !same_address(a, b) || b.label.is_some() {
            return None;
        }
        if a.address().is_some_and(|addr| ctx.is_volatile_address(addr as i64)) {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings {
                cycles: 4,
                bytes: b.mode.encoded_length(),
            },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        vec![instrs[index].clone()]
    }
}

struct DeadLoad;

impl Pattern<AsmInstruction> for DeadLoad {
    fn name(&self) -> &'static str {
        "dead-load"
    }
    fn priority(&self) -> i32 {
        190
    }
    fn category(&self) -> &'static str {
        "load-store"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if a.opcode != Opcode::LDA || b.opcode != Opcode::LDA || a.label.is_some() {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings {
                cycles: 2,
                bytes: a.mode.encoded_length(),
            },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let mut second = instrs[index + 1].clone();
        second.label = instrs[index].label;
        vec![second]
    }
}

/// Shared scan for "no intervening write/control-flow touches `addr`"
/// windows, used by redundant-load and dead-store.
fn scan_same_address_window(
    instrs: &[AsmInstruction],
    start: usize,
    addr: i64,
    stop_on_read: bool,
) -> Option<usize> {
    for (offset, instr) in instrs[start..].iter().enumerate() {
        if is_control_flow(instr) {
            return None;
        }
        if instr.label.is_some() {
            return None;
        }
        if stop_on_read && reads_memory(instr, addr) {
            return None;
        }
        match instr.opcode {
            Opcode::LDA if instr.address().map(|a| a as i64) == Some(addr) => return Some(start + offset),
            Opcode::STA if instr.address().map(|a| a as i64) == Some(addr) && !stop_on_read => {
                return Some(start + offset)
            }
            _ => {}
        }
        if !stop_on_read && writes_memory(instr, addr) {
            return None;
        }
    }
    None
}

struct RedundantLoad;

impl Pattern<AsmInstruction> for RedundantLoad {
    fn name(&self) -> &'static str {
        "redundant-load"
    }
    fn priority(&self) -> i32 {
        180
    }
    fn category(&self) -> &'static str {
        "load-store"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, ctx: &dyn PatternContext) -> Option<MatchResult> {
        let first = instrs.get(index)?;
        if first.opcode != Opcode::LDA {
            return None;
        }
        let addr = first.address()? as i64;
        if ctx.is_volatile_address(addr) {
            return None;
        }
        let end = scan_same_address_window(instrs, index + 1, addr, true)?;
        if instrs[end].opcode != Opcode::LDA {
            return None;
        }
        // No A-clobbering instruction (other than reads of other addresses)
        // between index+1 and end, and no write to addr.
        for instr in &instrs[index + 1..end] {
            if writes_memory(instr, addr) {
                return None;
            }
            if touches_a(instr) {
                return None;
            }
        }
        Some(MatchResult {
            length: end - index + 1,
            savings: Savings {
                cycles: 2,
                bytes: instrs[end].mode.encoded_length(),
            },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, matched: &MatchResult) -> Vec<AsmInstruction> {
        let window = &instrs[index..index + matched.length];
        window[..window.len() - 1].to_vec()
    }
}

struct DeadStore;

impl Pattern<AsmInstruction> for DeadStore {
    fn name(&self) -> &'static str {
        "dead-store"
    }
    fn priority(&self) -> i32 {
        170
    }
    fn category(&self) -> &'static str {
        "load-store"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, ctx: &dyn PatternContext) -> Option<MatchResult> {
        let first = instrs.get(index)?;
        if first.opcode != Opcode::STA || first.label.is_some() {
            return None;
        }
        let addr = first.address()? as i64;
        if ctx.is_volatile_address(addr) {
            return None;
        }
        let end = scan_same_address_window(instrs, index + 1, addr, false)?;
        if instrs[end].opcode != Opcode::STA {
            return None;
        }
        for instr in &instrs[index + 1..end] {
            if reads_memory(instr, addr) {
                return None;
            }
        }
        Some(MatchResult {
            length: end - index + 1,
            savings: Savings {
                cycles: 4,
                bytes: first.mode.encoded_length(),
            },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, matched: &MatchResult) -> Vec<AsmInstruction> {
        instrs[index + 1..index + matched.length].to_vec()
    }
}

macro_rules! store_load_reg {
    ($name:ident, $priority:expr, $store:expr, $load:expr) => {
        struct $name;
        impl Pattern<AsmInstruction> for $name {
            fn name(&self) -> &'static str {
                stringify!($name)
            }
            fn priority(&self) -> i32 {
                $priority
            }
            fn category(&self) -> &'static str {
                "load-store"
            }
            fn match_at(&self, instrs: &[AsmInstruction], index: usize, ctx: &dyn PatternContext) -> Option<MatchResult> {
                let [a, b] = instrs.get(index..index + 2)? else { return None };
                if a.opcode != $store || b.opcode != $load || !same_address(a, b) || b.label.is_some() {
                    return None;
                }
                if a.address().is_some_and(|addr| ctx.is_volatile_address(addr as i64)) {
                    return None;
                }
                Some(MatchResult {
                    length: 2,
                    savings: Savings { cycles: 4, bytes: b.mode.encoded_length() },
                })
            }
            fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
                vec![instrs[index].clone()]
            }
        }
    };
}

store_load_reg!(StoreLoadX, 160, Opcode::STX, Opcode::LDX);
store_load_reg!(StoreLoadY, 150, Opcode::STY, Opcode::LDY);

// ---- Flag family --------------------------------------------------------

/// Opcodes that read the carry flag as an input to their own operation —
/// a `CLC`/`SEC` immediately before one of these is live.
fn consumes_carry(op: Opcode) -> bool {
    matches!(op, Opcode::ADC | Opcode::SBC | Opcode::ROL | Opcode::ROR | Opcode::BCC | Opcode::BCS)
}

/// Opcodes that overwrite the carry flag outright, closing the window a
/// preceding `CLC`/`SEC` could still be observed in.
fn overwrites_carry(op: Opcode) -> bool {
    matches!(op, Opcode::CLC | Opcode::SEC | Opcode::CMP | Opcode::CPX | Opcode::CPY | Opcode::ASL | Opcode::LSR)
}

macro_rules! dead_carry_set {
    ($name:ident, $priority:expr, $opcode:expr) => {
        struct $name;
        impl Pattern<AsmInstruction> for $name {
            fn name(&self) -> &'static str {
                stringify!($name)
            }
            fn priority(&self) -> i32 {
                $priority
            }
            fn category(&self) -> &'static str {
                "flags"
            }
            fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
                let first = instrs.get(index)?;
                if first.opcode != $opcode {
                    return None;
                }
                for instr in &instrs[index + 1..] {
                    if instr.label.is_some() || is_control_flow(instr) {
                        return None;
                    }
                    if consumes_carry(instr.opcode) {
                        return None;
                    }
                    if overwrites_carry(instr.opcode) {
                        break;
                    }
                }
                Some(MatchResult {
                    length: 1,
                    savings: Savings { cycles: 2, bytes: 1 },
                })
            }
            fn apply(&self, _instrs: &[AsmInstruction], _index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
                vec![]
            }
        }
    };
}

dead_carry_set!(DeadClc, 138, Opcode::CLC);
dead_carry_set!(DeadSec, 137, Opcode::SEC);

struct RedundantCmpZero;

impl Pattern<AsmInstruction> for RedundantCmpZero {
    fn name(&self) -> &'static str {
        "redundant-CMP-0"
    }
    fn priority(&self) -> i32 {
        140
    }
    fn category(&self) -> &'static str {
        "flags"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if !a.opcode.sets_nz_like_load() || b.label.is_some() {
            return None;
        }
        if b.opcode != Opcode::CMP || b.mode != AddressingMode::Immediate || b.operand != Operand::Immediate(0) {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 2, bytes: 2 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        vec![instrs[index].clone()]
    }
}

macro_rules! duplicate_flag {
    ($name:ident, $priority:expr, $opcode:expr) => {
        struct $name;
        impl Pattern<AsmInstruction> for $name {
            fn name(&self) -> &'static str {
                stringify!($name)
            }
            fn priority(&self) -> i32 {
                $priority
            }
            fn category(&self) -> &'static str {
                "flags"
            }
            fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
                let [a, b] = instrs.get(index..index + 2)? else { return None };
                if a.opcode != $opcode || b.opcode != $opcode || b.label.is_some() {
                    return None;
                }
                Some(MatchResult { length: 2, savings: Savings { cycles: 2, bytes: 1 } })
            }
            fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
                vec![instrs[index].clone()]
            }
        }
    };
}

duplicate_flag!(DuplicateClc, 130, Opcode::CLC);
duplicate_flag!(DuplicateSec, 125, Opcode::SEC);

struct SignedComparison;

impl Pattern<AsmInstruction> for SignedComparison {
    fn name(&self) -> &'static str {
        "signed-comparison"
    }
    fn priority(&self) -> i32 {
        120
    }
    fn category(&self) -> &'static str {
        "flags"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if a.opcode != Opcode::CMP || a.mode != AddressingMode::Immediate || a.operand != Operand::Immediate(0x80) {
            return None;
        }
        if b.opcode != Opcode::BCS || b.label.is_some() {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 0, bytes: 0 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let mut branch = instrs[index + 1].clone();
        branch.opcode = Opcode::BMI;
        vec![branch]
    }
}

struct PositiveComparison;

impl Pattern<AsmInstruction> for PositiveComparison {
    fn name(&self) -> &'static str {
        "positive-comparison"
    }
    fn priority(&self) -> i32 {
        115
    }
    fn category(&self) -> &'static str {
        "flags"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if a.opcode != Opcode::CMP || a.mode != AddressingMode::Immediate || a.operand != Operand::Immediate(0x80) {
            return None;
        }
        if b.opcode != Opcode::BCC || b.label.is_some() {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 0, bytes: 0 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let mut branch = instrs[index + 1].clone();
        branch.opcode = Opcode::BPL;
        vec![branch]
    }
}

// ---- Branch family --------------------------------------------------------

struct UnreachableCode;

impl Pattern<AsmInstruction> for UnreachableCode {
    fn name(&self) -> &'static str {
        "unreachable-code"
    }
    fn priority(&self) -> i32 {
        110
    }
    fn category(&self) -> &'static str {
        "branch"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let first = instrs.get(index)?;
        if !first.opcode.is_unconditional_terminator() {
            return None;
        }
        let mut end = index + 1;
        while end < instrs.len() && instrs[end].label.is_none() {
            end += 1;
        }
        if end == index + 1 {
            return None;
        }
        Some(MatchResult {
            length: end - index,
            savings: Savings {
                cycles: 0,
                bytes: instrs[index + 1..end].iter().map(|i| i.mode.encoded_length()).sum(),
            },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        vec![instrs[index].clone()]
    }
}

struct BranchOverNop;

impl Pattern<AsmInstruction> for BranchOverNop {
    fn name(&self) -> &'static str {
        "branch-over-NOP"
    }
    fn priority(&self) -> i32 {
        100
    }
    fn category(&self) -> &'static str {
        "branch"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [branch, nop, skip] = instrs.get(index..index + 3)? else { return None };
        if !branch.opcode.is_branch() || nop.opcode != Opcode::NOP || nop.label.is_some() {
            return None;
        }
        let Operand::Label(target) = &branch.operand else { return None };
        if skip.label != Some(*target) {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 2, bytes: 3 },
        })
    }

    fn apply(&self, _instrs: &[AsmInstruction], _index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        vec![]
    }
}

struct BranchInversion;

impl Pattern<AsmInstruction> for BranchInversion {
    fn name(&self) -> &'static str {
        "branch-inversion"
    }
    fn priority(&self) -> i32 {
        95
    }
    fn category(&self) -> &'static str {
        "branch"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [branch, jmp, skip] = instrs.get(index..index + 3)? else { return None };
        if !branch.opcode.is_branch() || jmp.opcode != Opcode::JMP || jmp.label.is_some() {
            return None;
        }
        let Operand::Label(skip_target) = &branch.operand else { return None };
        if skip.label != Some(*skip_target) {
            return None;
        }
        branch.opcode.invert_branch()?;
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 0, bytes: 0 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let branch = &instrs[index];
        let jmp = &instrs[index + 1];
        let mut inverted = branch.clone();
        inverted.opcode = branch.opcode.invert_branch().expect("match_at guarantees invertibility");
        inverted.operand = jmp.operand.clone();
        vec![inverted]
    }
}

/// `Bxx L1` where `L1` holds nothing but `JMP L2` retargets straight to
/// `L2`, the conditional-branch counterpart of `BranchChain` below. Any
/// displacement this produces that falls outside relative-branch range is
/// caught downstream by the emitter, which already knows how to suggest
/// branch-inversion for it.
struct ConditionalBranchChain;

impl Pattern<AsmInstruction> for ConditionalBranchChain {
    fn name(&self) -> &'static str {
        "conditional-branch-chain"
    }
    fn priority(&self) -> i32 {
        92
    }
    fn category(&self) -> &'static str {
        "branch"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let first = instrs.get(index)?;
        if !first.opcode.is_branch() {
            return None;
        }
        let Operand::Label(l1) = &first.operand else { return None };
        let target = instrs.iter().find(|i| i.label == Some(*l1))?;
        if target.opcode != Opcode::JMP {
            return None;
        }
        let Operand::Label(l2) = &target.operand else { return None };
        if l2 == l1 {
            return None;
        }
        Some(MatchResult {
            length: 1,
            savings: Savings { cycles: 0, bytes: 0 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let first = &instrs[index];
        let Operand::Label(l1) = &first.operand else {
            unreachable!("match_at guarantees a label operand")
        };
        let target = instrs.iter().find(|i| i.label == Some(*l1)).expect("match_at found it");
        let mut rewritten = first.clone();
        rewritten.operand = target.operand.clone();
        vec![rewritten]
    }
}

struct BranchChain;

impl Pattern<AsmInstruction> for BranchChain {
    fn name(&self) -> &'static str {
        "branch-chain"
    }
    fn priority(&self) -> i32 {
        90
    }
    fn category(&self) -> &'static str {
        "branch"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let first = instrs.get(index)?;
        if first.opcode != Opcode::JMP {
            return None;
        }
        let Operand::Label(l1) = &first.operand else { return None };
        let target = instrs.iter().find(|i| i.label == Some(*l1))?;
        if target.opcode != Opcode::JMP {
            return None;
        }
        let Operand::Label(l2) = &target.operand else { return None };
        if l2 == l1 {
            return None;
        }
        Some(MatchResult {
            length: 1,
            savings: Savings { cycles: 0, bytes: 0 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let first = &instrs[index];
        let Operand::Label(l1) = &first.operand else {
            unreachable!("match_at guarantees a label operand")
        };
        let target = instrs.iter().find(|i| i.label == Some(*l1)).expect("match_at found it");
        let mut rewritten = first.clone();
        rewritten.operand = target.operand.clone();
        vec![rewritten]
    }
}

// ---- Transfer family ----------------------------------------------------

macro_rules! round_trip_transfer {
    ($name:ident, $priority:expr, $to:expr, $from:expr) => {
        struct $name;
        impl Pattern<AsmInstruction> for $name {
            fn name(&self) -> &'static str {
                stringify!($name)
            }
            fn priority(&self) -> i32 {
                $priority
            }
            fn category(&self) -> &'static str {
                "transfer"
            }
            fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
                let [a, b] = instrs.get(index..index + 2)? else { return None };
                if a.opcode != $to || b.opcode != $from || b.label.is_some() {
                    return None;
                }
                Some(MatchResult { length: 2, savings: Savings { cycles: 2, bytes: 1 } })
            }
            fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
                vec![instrs[index].clone()]
            }
        }
    };
}

round_trip_transfer!(RoundTripTax, 80, Opcode::TAX, Opcode::TXA);
round_trip_transfer!(RoundTripTay, 79, Opcode::TAY, Opcode::TYA);
round_trip_transfer!(RoundTripTxa, 78, Opcode::TXA, Opcode::TAX);
round_trip_transfer!(RoundTripTya, 77, Opcode::TYA, Opcode::TAY);

macro_rules! duplicate_transfer {
    ($name:ident, $priority:expr, $opcode:expr) => {
        struct $name;
        impl Pattern<AsmInstruction> for $name {
            fn name(&self) -> &'static str {
                stringify!($name)
            }
            fn priority(&self) -> i32 {
                $priority
            }
            fn category(&self) -> &'static str {
                "transfer"
            }
            fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
                let [a, b] = instrs.get(index..index + 2)? else { return None };
                if a.opcode != $opcode || b.opcode != $opcode || b.label.is_some() {
                    return None;
                }
                Some(MatchResult { length: 2, savings: Savings { cycles: 2, bytes: 1 } })
            }
            fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
                vec![instrs[index].clone()]
            }
        }
    };
}

duplicate_transfer!(DuplicateTax, 70, Opcode::TAX);
duplicate_transfer!(DuplicateTay, 69, Opcode::TAY);
duplicate_transfer!(DuplicateTxa, 68, Opcode::TXA);
duplicate_transfer!(DuplicateTya, 67, Opcode::TYA);

/// Addressing modes `STX` accepts — a strict subset of `STA`'s, missing
/// indexed-by-X forms since storing X indexed by itself makes no sense.
fn stx_supports(mode: AddressingMode) -> bool {
    matches!(mode, AddressingMode::ZeroPage | AddressingMode::ZeroPageY | AddressingMode::Absolute)
}

/// Addressing modes `STY` accepts — the index-register mirror of
/// `stx_supports`.
fn sty_supports(mode: AddressingMode) -> bool {
    matches!(mode, AddressingMode::ZeroPage | AddressingMode::ZeroPageX | AddressingMode::Absolute)
}

struct TransferStoreFoldX;

impl Pattern<AsmInstruction> for TransferStoreFoldX {
    fn name(&self) -> &'static str {
        "transfer-store-fold-x"
    }
    fn priority(&self) -> i32 {
        84
    }
    fn category(&self) -> &'static str {
        "transfer"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if a.opcode != Opcode::TXA || b.opcode != Opcode::STA || b.label.is_some() {
            return None;
        }
        if !stx_supports(b.mode) {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 2, bytes: 1 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let mut folded = instrs[index + 1].clone();
        folded.opcode = Opcode::STX;
        folded.label = instrs[index].label;
        vec![folded]
    }
}

struct TransferStoreFoldY;

impl Pattern<AsmInstruction> for TransferStoreFoldY {
    fn name(&self) -> &'static str {
        "transfer-store-fold-y"
    }
    fn priority(&self) -> i32 {
        83
    }
    fn category(&self) -> &'static str {
        "transfer"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if a.opcode != Opcode::TYA || b.opcode != Opcode::STA || b.label.is_some() {
            return None;
        }
        if !sty_supports(b.mode) {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 2, bytes: 1 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let mut folded = instrs[index + 1].clone();
        folded.opcode = Opcode::STY;
        folded.label = instrs[index].label;
        vec![folded]
    }
}

struct TsxTxs;

impl Pattern<AsmInstruction> for TsxTxs {
    fn name(&self) -> &'static str {
        "TSX;TXS"
    }
    fn priority(&self) -> i32 {
        60
    }
    fn category(&self) -> &'static str {
        "transfer"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if a.opcode != Opcode::TSX || b.opcode != Opcode::TXS || b.label.is_some() {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 2, bytes: 1 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        vec![instrs[index].clone()]
    }
}

struct LoadTransferFold;

impl Pattern<AsmInstruction> for LoadTransferFold {
    fn name(&self) -> &'static str {
        "load-transfer-fold"
    }
    fn priority(&self) -> i32 {
        50
    }
    fn category(&self) -> &'static str {
        "transfer"
    }

    fn match_at(&self, instrs: &[AsmInstruction], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
        let [a, b] = instrs.get(index..index + 2)? else { return None };
        if a.opcode != Opcode::LDA || b.opcode != Opcode::TAX || b.label.is_some() {
            return None;
        }
        // LDX supports the same modes LDA does except indirect-indexed ones.
        if matches!(a.mode, AddressingMode::IndexedIndirect | AddressingMode::IndirectIndexed | AddressingMode::AbsoluteX) {
            return None;
        }
        Some(MatchResult {
            length: 2,
            savings: Savings { cycles: 2, bytes: 1 },
        })
    }

    fn apply(&self, instrs: &[AsmInstruction], index: usize, _m: &MatchResult) -> Vec<AsmInstruction> {
        let mut folded = instrs[index].clone();
        folded.opcode = Opcode::LDX;
        if folded.mode == AddressingMode::ZeroPageX {
            folded.mode = AddressingMode::ZeroPageY;
        }
        vec![folded]
    }
}

fn build_registry() -> PatternRegistry<AsmInstruction> {
    let mut r = PatternRegistry::new();
    r.register(Box::new(StoreLoadElimination));
    r.register(Box::new(DeadLoad));
    r.register(Box::new(RedundantLoad));
    r.register(Box::new(DeadStore));
    r.register(Box::new(StoreLoadX));
    r.register(Box::new(StoreLoadY));
    r.register(Box::new(RedundantCmpZero));
    r.register(Box::new(DeadClc));
    r.register(Box::new(DeadSec));
    r.register(Box::new(DuplicateClc));
    r.register(Box::new(DuplicateSec));
    r.register(Box::new(SignedComparison));
    r.register(Box::new(PositiveComparison));
    r.register(Box::new(UnreachableCode));
    r.register(Box::new(BranchOverNop));
    r.register(Box::new(BranchInversion));
    r.register(Box::new(ConditionalBranchChain));
    r.register(Box::new(BranchChain));
    r.register(Box::new(RoundTripTax));
    r.register(Box::new(RoundTripTay));
    r.register(Box::new(RoundTripTxa));
    r.register(Box::new(RoundTripTya));
    r.register(Box::new(DuplicateTax));
    r.register(Box::new(DuplicateTay));
    r.register(Box::new(DuplicateTxa));
    r.register(Box::new(DuplicateTya));
    r.register(Box::new(TransferStoreFoldX));
    r.register(Box::new(TransferStoreFoldY));
    r.register(Box::new(TsxTxs));
    r.register(Box::new(LoadTransferFold));
    r
}

/// Runs the ASM optimizer to fixed point over every code section's
/// instruction stream. Sections that mix instructions with
/// labels/data/directives are left untouched — by convention (see module
/// doc), only pure-instruction "code" sections are optimization targets.
pub fn optimize(module: &mut super::asm::AsmModule, platform: &PlatformConfig) -> bool {
    let registry = build_registry();
    let ctx = AsmOptContext { platform };
    let mut any_changed = false;

    for section in &mut module.sections {
        let all_instructions = section
            .elements
            .iter()
            .all(|e| matches!(e, super::asm::AsmElement::Instruction(_)));
        if !all_instructions || section.elements.is_empty() {
            continue;
        }
        let mut instrs: Vec<AsmInstruction> = section
            .elements
            .drain(..)
            .map(|e| match e {
                super::asm::AsmElement::Instruction(i) => i,
                _ => unreachable!(),
            })
            .collect();
        let (changed, _iters, _capped) = crate::middle::pattern::run_to_fixed_point(
            &mut instrs,
            &registry,
            &ctx,
            MAX_ITERATIONS,
        );
        any_changed |= changed;
        section.elements = instrs.into_iter().map(super::asm::AsmElement::Instruction).collect();
    }

    any_changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{intern, Span};
    use crate::back::asm::{AsmElement, AsmModule, AsmSection};

    fn instr(opcode: Opcode, mode: AddressingMode, operand: Operand) -> AsmInstruction {
        AsmInstruction::new(opcode, mode, operand, Span::synthetic())
    }

    fn module_of(instrs: Vec<AsmInstruction>) -> AsmModule {
        AsmModule {
            sections: vec![AsmSection {
                name: "code".into(),
                elements: instrs.into_iter().map(AsmElement::Instruction).collect(),
            }],
        }
    }

    #[test]
    fn eliminates_dead_load_after_store() {
        let mut module = module_of(vec![
            instr(Opcode::LDA, AddressingMode::Immediate, Operand::Immediate(5)),
            instr(Opcode::STA, AddressingMode::ZeroPage, Operand::Immediate(0x50)),
            instr(Opcode::LDA, AddressingMode::ZeroPage, Operand::Immediate(0x50)),
            instr(Opcode::STA, AddressingMode::Absolute, Operand::Immediate(0xD020)),
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let remaining: Vec<_> = module.instructions().map(|i| i.opcode).collect();
        assert_eq!(remaining, vec![Opcode::LDA, Opcode::STA, Opcode::STA]);
    }

    #[test]
    fn never_eliminates_store_to_volatile_address() {
        let mut module = module_of(vec![
            instr(Opcode::STA, AddressingMode::Absolute, Operand::Immediate(0xD020)),
            instr(Opcode::LDA, AddressingMode::Absolute, Operand::Immediate(0xD020)),
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        assert_eq!(module.instructions().count(), 2);
    }

    #[test]
    fn removes_redundant_cmp_zero() {
        let mut module = module_of(vec![
            instr(Opcode::LDA, AddressingMode::Immediate, Operand::Immediate(5)),
            instr(Opcode::CMP, AddressingMode::Immediate, Operand::Immediate(0)),
            instr(Opcode::BEQ, AddressingMode::Relative, Operand::Label(intern("done"))),
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let remaining: Vec<_> = module.instructions().map(|i| i.opcode).collect();
        assert_eq!(remaining, vec![Opcode::LDA, Opcode::BEQ]);
    }

    #[test]
    fn folds_branch_chain() {
        let mut module = module_of(vec![
            instr(Opcode::JMP, AddressingMode::Absolute, Operand::Label(intern("l1"))),
            {
                let mut i = instr(Opcode::JMP, AddressingMode::Absolute, Operand::Label(intern("l2")));
                i.label = Some(intern("l1"));
                i
            },
            {
                let mut i = instr(Opcode::RTS, AddressingMode::Implied, Operand::None);
                i.label = Some(intern("l2"));
                i
            },
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let first = module.instructions().next().unwrap();
        assert_eq!(first.operand, Operand::Label(intern("l2")));
    }

    #[test]
    fn folds_conditional_branch_chain() {
        let mut module = module_of(vec![
            instr(Opcode::BEQ, AddressingMode::Relative, Operand::Label(intern("l1"))),
            {
                let mut i = instr(Opcode::JMP, AddressingMode::Absolute, Operand::Label(intern("l2")));
                i.label = Some(intern("l1"));
                i
            },
            {
                let mut i = instr(Opcode::RTS, AddressingMode::Implied, Operand::None);
                i.label = Some(intern("l2"));
                i
            },
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let first = module.instructions().next().unwrap();
        assert_eq!(first.opcode, Opcode::BEQ);
        assert_eq!(first.operand, Operand::Label(intern("l2")));
    }

    #[test]
    fn drops_dead_clc_with_no_carry_consumer() {
        let mut module = module_of(vec![
            instr(Opcode::CLC, AddressingMode::Implied, Operand::None),
            instr(Opcode::LDA, AddressingMode::Immediate, Operand::Immediate(1)),
            instr(Opcode::STA, AddressingMode::ZeroPage, Operand::Immediate(0x50)),
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let remaining: Vec<_> = module.instructions().map(|i| i.opcode).collect();
        assert_eq!(remaining, vec![Opcode::LDA, Opcode::STA]);
    }

    #[test]
    fn keeps_clc_consumed_by_adc() {
        let mut module = module_of(vec![
            instr(Opcode::CLC, AddressingMode::Implied, Operand::None),
            instr(Opcode::ADC, AddressingMode::Immediate, Operand::Immediate(1)),
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let remaining: Vec<_> = module.instructions().map(|i| i.opcode).collect();
        assert_eq!(remaining, vec![Opcode::CLC, Opcode::ADC]);
    }

    #[test]
    fn folds_txa_sta_zeropage_into_stx() {
        let mut module = module_of(vec![
            instr(Opcode::TXA, AddressingMode::Implied, Operand::None),
            instr(Opcode::STA, AddressingMode::ZeroPage, Operand::Immediate(0x50)),
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let remaining: Vec<_> = module.instructions().map(|i| i.opcode).collect();
        assert_eq!(remaining, vec![Opcode::STX]);
    }

    #[test]
    fn does_not_fold_tya_sta_zeropage_y_into_sty() {
        // STY has no zero-page,Y mode, so this combination must survive
        // untouched rather than producing an unencodable instruction.
        let mut module = module_of(vec![
            instr(Opcode::TYA, AddressingMode::Implied, Operand::None),
            instr(Opcode::STA, AddressingMode::ZeroPageY, Operand::Immediate(0x50)),
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let remaining: Vec<_> = module.instructions().map(|i| i.opcode).collect();
        assert_eq!(remaining, vec![Opcode::TYA, Opcode::STA]);
    }

    #[test]
    fn eliminates_duplicate_txa() {
        let mut module = module_of(vec![
            instr(Opcode::TXA, AddressingMode::Implied, Operand::None),
            instr(Opcode::TXA, AddressingMode::Implied, Operand::None),
            instr(Opcode::STA, AddressingMode::ZeroPage, Operand::Immediate(0x50)),
        ]);
        let platform = PlatformConfig::c64();
        optimize(&mut module, &platform);
        let remaining: Vec<_> = module.instructions().map(|i| i.opcode).collect();
        assert_eq!(remaining, vec![Opcode::STX]);
    }
}
