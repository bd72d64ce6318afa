//! Register allocation over A/X/Y with zero-page spill: the usual
//! interference-graph-plus-spill-cost shape, retargeted from a
//! general-purpose register file to the 6502's three single-purpose
//! registers.

use crate::common::Map;
use crate::config::PlatformConfig;
use crate::diagnostics::{Code, Diagnostics};
use crate::middle::il::{BasicBlock, Function, ILInstruction, Operand, Temp, Terminator};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Register {
    A,
    X,
    Y,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TempLocation {
    Register(Register),
    /// Byte address in the platform's scratch zero-page range.
    Scratch(u16),
}

pub struct Allocation {
    locations: Map<Temp, TempLocation>,
    pub scratch_bytes_used: u32,
}

impl Allocation {
    pub fn location(&self, temp: Temp) -> Option<TempLocation> {
        self.locations.get(&temp).copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Requirement {
    Accumulator,
    Index,
    None,
}

/// Every operand-position a temp can occupy in an `ILInstruction`, used
/// both for requirement classification and for liveness's use-set.
fn operand_temps(instr: &ILInstruction) -> Vec<Temp> {
    let mut out = Vec::new();
    let mut push = |op: &Operand| {
        if let Operand::Temp(t) = op {
            out.push(*t);
        }
    };
    match instr {
        ILInstruction::Binary { lhs, rhs, .. } => {
            push(lhs);
            push(rhs);
        }
        ILInstruction::Unary { src, .. } | ILInstruction::Copy { src, .. } => push(src),
        ILInstruction::Store { value, .. } => push(value),
        ILInstruction::Poke { addr, value, .. } => {
            push(addr);
            push(value);
        }
        ILInstruction::LoadIndexed { index, .. } => push(index),
        ILInstruction::StoreIndexed { index, value, .. } => {
            push(index);
            push(value);
        }
        ILInstruction::Peek { addr, .. } => push(addr),
        ILInstruction::HwWrite { value, .. } => push(value),
        ILInstruction::Sys { addr, .. } => push(addr),
        ILInstruction::Call { args, .. } => {
            for arg in args {
                push(arg);
            }
        }
        ILInstruction::Phi { incoming, .. } => {
            for (_, op) in incoming {
                push(op);
            }
        }
        ILInstruction::Const { .. } | ILInstruction::Load { .. } | ILInstruction::HwRead { .. } => {}
    }
    out
}

fn terminator_temps(term: &Terminator) -> Vec<Temp> {
    match term {
        Terminator::Branch { value: Operand::Temp(t), .. } => vec![*t],
        Terminator::Return(Some(Operand::Temp(t))) => vec![*t],
        _ => vec![],
    }
}

/// Index operands (array subscripts) prefer X/Y; everything else that
/// funnels through the accumulator requires A.
fn classify(function: &Function, temp: Temp) -> Requirement {
    let mut seen_accumulator_use = false;
    let mut seen_index_use = false;
    let mut any_use = false;

    for block in &function.blocks {
        for instr in &block.instructions {
            match instr {
                ILInstruction::LoadIndexed { index: Operand::Temp(t), .. } if *t == temp => {
                    seen_index_use = true;
                    any_use = true;
                }
                ILInstruction::StoreIndexed { index: Operand::Temp(t), .. } if *t == temp => {
                    seen_index_use = true;
                    any_use = true;
                }
                _ => {
                    if operand_temps(instr).contains(&temp) {
                        seen_accumulator_use = true;
                        any_use = true;
                    }
                }
            }
        }
        if terminator_temps(&block.terminator).contains(&temp) {
            seen_accumulator_use = true;
            any_use = true;
        }
    }

    if !any_use {
        Requirement::None
    } else if seen_accumulator_use {
        Requirement::Accumulator
    } else if seen_index_use {
        Requirement::Index
    } else {
        Requirement::None
    }
}

/// Upward-exposed uses and definitions for one block, for the standard
/// `live_in = use ∪ (live_out − def)` dataflow equation. A phi's incoming
/// operand for predecessor `p` counts as a use of `p`, not of this block
/// (handled by the caller).
fn block_def_use(block: &BasicBlock) -> (std::collections::BTreeSet<Temp>, std::collections::BTreeSet<Temp>) {
    let mut def = std::collections::BTreeSet::new();
    let mut upward_use = std::collections::BTreeSet::new();

    for instr in &block.instructions {
        if let ILInstruction::Phi { .. } = instr {
            continue; // phi uses are attributed to the predecessor below
        }
        for t in operand_temps(instr) {
            if !def.contains(&t) {
                upward_use.insert(t);
            }
        }
        if let Some(d) = instr.dest() {
            def.insert(d);
        }
    }
    for t in terminator_temps(&block.terminator) {
        if !def.contains(&t) {
            upward_use.insert(t);
        }
    }

    (def, upward_use)
}

fn compute_liveness(function: &Function) -> (Vec<std::collections::BTreeSet<Temp>>, Vec<std::collections::BTreeSet<Temp>>) {
    let n = function.blocks.len();
    let mut live_in = vec![std::collections::BTreeSet::new(); n];
    let mut live_out = vec![std::collections::BTreeSet::new(); n];
    let def_use: Vec<_> = function.blocks.iter().map(block_def_use).collect();

    loop {
        let mut changed = false;
        for b in (0..n).rev() {
            let mut out = std::collections::BTreeSet::new();
            for &succ in &function.blocks[b].successors {
                out.extend(live_in[succ].iter().copied());
                // Phi operands incoming from `b` are live-out of `b`.
                for instr in &function.blocks[succ].instructions {
                    if let ILInstruction::Phi { incoming, .. } = instr {
                        for (pred, op) in incoming {
                            if *pred == b {
                                if let Operand::Temp(t) = op {
                                    out.insert(*t);
                                }
                            }
                        }
                    }
                }
            }
            if out != live_out[b] {
                live_out[b] = out.clone();
                changed = true;
            }
            let (def, use_) = &def_use[b];
            let mut inn = use_.clone();
            inn.extend(out.difference(def).copied());
            if inn != live_in[b] {
                live_in[b] = inn;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    (live_in, live_out)
}

/// Builds the interference graph: an adjacency map keyed by temp, derived
/// from a forward walk of each block seeded with that block's live-in set.
fn build_interference(function: &Function) -> Map<Temp, std::collections::BTreeSet<Temp>> {
    let (live_in, _) = compute_liveness(function);
    let mut graph: Map<Temp, std::collections::BTreeSet<Temp>> = Map::new();
    let mut add_edge = |graph: &mut Map<Temp, std::collections::BTreeSet<Temp>>, a: Temp, b: Temp| {
        if a != b {
            graph.entry(a).or_default().insert(b);
            graph.entry(b).or_default().insert(a);
        }
    };

    for (index, block) in function.blocks.iter().enumerate() {
        let mut live: std::collections::BTreeSet<Temp> = live_in[index].clone();
        for instr in &block.instructions {
            if let Some(dst) = instr.dest() {
                for &other in &live {
                    add_edge(&mut graph, dst, other);
                }
                graph.entry(dst).or_default();
                live.insert(dst);
            }
        }
    }

    graph
}

/// "Pure" producers with no dependency on memory or hardware state —
/// these are the only instructions safe to sink later within a block.
fn is_movable_producer(instr: &ILInstruction) -> bool {
    matches!(
        instr,
        ILInstruction::Const { .. } | ILInstruction::Unary { .. } | ILInstruction::Binary { .. } | ILInstruction::Copy { .. }
    )
}

/// Sinks a producer down to sit immediately before its single consumer
/// within the same block, when every instruction between them is also a
/// movable producer. Shrinks the value's live range so a later
/// accumulator-chained op can consume it straight out of A instead of
/// forcing a spill. Run once, before liveness/interference are computed.
fn reorder_accumulator_chains(function: &mut Function) {
    for block in &mut function.blocks {
        loop {
            let mut moved = false;
            for i in 0..block.instructions.len() {
                let Some(dst) = block.instructions[i].dest() else { continue };
                if !is_movable_producer(&block.instructions[i]) {
                    continue;
                }
                let mut use_index = None;
                let mut use_count = 0;
                for (k, instr) in block.instructions.iter().enumerate().skip(i + 1) {
                    if operand_temps(instr).contains(&dst) {
                        use_count += 1;
                        use_index = Some(k);
                    }
                }
                let (Some(j), 1) = (use_index, use_count) else { continue };
                if j == i + 1 {
                    continue;
                }
                if !block.instructions[i + 1..j].iter().all(is_movable_producer) {
                    continue;
                }
                let producer = block.instructions.remove(i);
                block.instructions.insert(j - 1, producer);
                moved = true;
                break;
            }
            if !moved {
                break;
            }
        }
    }
}

/// Loop nesting depth per block, from the natural loops of every back
/// edge found by a DFS over the block CFG (a back edge targets a node
/// still on the DFS stack). A block inside nested loops counts once per
/// enclosing loop.
fn compute_loop_depth(function: &Function) -> Vec<u32> {
    let n = function.blocks.len();
    let mut depth = vec![0u32; n];
    if n == 0 {
        return depth;
    }

    fn dfs(node: usize, blocks: &[BasicBlock], visited: &mut [bool], on_stack: &mut [bool], back_edges: &mut Vec<(usize, usize)>) {
        visited[node] = true;
        on_stack[node] = true;
        for &succ in &blocks[node].successors {
            if on_stack[succ] {
                back_edges.push((node, succ));
            } else if !visited[succ] {
                dfs(succ, blocks, visited, on_stack, back_edges);
            }
        }
        on_stack[node] = false;
    }

    let mut visited = vec![false; n];
    let mut on_stack = vec![false; n];
    let mut back_edges = Vec::new();
    dfs(0, &function.blocks, &mut visited, &mut on_stack, &mut back_edges);

    for (tail, header) in back_edges {
        let mut in_loop = std::collections::BTreeSet::new();
        in_loop.insert(header);
        in_loop.insert(tail);
        let mut stack = vec![tail];
        while let Some(node) = stack.pop() {
            for &pred in &function.blocks[node].predecessors {
                if in_loop.insert(pred) {
                    stack.push(pred);
                }
            }
        }
        for &node in &in_loop {
            depth[node] += 1;
        }
    }

    depth
}

/// Spill cost per temp: total use+def occurrences across the function,
/// each weighted `10^loop_depth` by the block it occurs in — an access
/// nested three nested loops deep costs a thousand times one at top
/// level, so the allocator strongly prefers spilling temps that never
/// see a loop body.
fn spill_costs(function: &Function, loop_depth: &[u32]) -> Map<Temp, u64> {
    let mut costs: Map<Temp, u64> = Map::new();
    for (index, block) in function.blocks.iter().enumerate() {
        let weight = 10u64.pow(loop_depth[index].min(18));
        for instr in &block.instructions {
            if let Some(d) = instr.dest() {
                *costs.entry(d).or_insert(0) += weight;
            }
            for t in operand_temps(instr) {
                *costs.entry(t).or_insert(0) += weight;
            }
        }
        for t in terminator_temps(&block.terminator) {
            *costs.entry(t).or_insert(0) += weight;
        }
    }
    costs
}

/// Allocates registers and spill slots for every temp in `function`.
/// `word_temps` are temps whose value is two bytes wide (always spilled
/// — the register file has no wide registers).
pub fn allocate(
    function: &Function,
    word_temps: &std::collections::BTreeSet<Temp>,
    platform: &PlatformConfig,
    diagnostics: &mut Diagnostics,
) -> Option<Allocation> {
    let mut working = function.clone();
    reorder_accumulator_chains(&mut working);

    let loop_depth = compute_loop_depth(&working);
    let costs = spill_costs(&working, &loop_depth);

    let graph = build_interference(&working);
    let mut requirements: Map<Temp, Requirement> = Map::new();
    for temp in graph.keys() {
        requirements.insert(*temp, classify(&working, *temp));
    }

    let mut order: Vec<Temp> = graph.keys().copied().collect();
    order.sort_by_key(|t| {
        let priority = match requirements.get(t).copied().unwrap_or(Requirement::None) {
            Requirement::Accumulator => 0,
            Requirement::Index => 1,
            Requirement::None => 2,
        };
        let degree = graph.get(t).map(|n| n.len()).unwrap_or(0);
        (priority, std::cmp::Reverse(degree), t.0)
    });

    let mut colors: Map<Temp, Register> = Map::new();
    let mut spilled: Vec<Temp> = Vec::new();

    for &temp in &order {
        if word_temps.contains(&temp) {
            spilled.push(temp);
            continue;
        }
        let candidates: &[Register] = match requirements[&temp] {
            Requirement::Accumulator => &[Register::A],
            Requirement::Index => &[Register::X, Register::Y],
            Requirement::None => &[Register::X, Register::Y, Register::A],
        };

        loop {
            let neighbor_colors: std::collections::BTreeSet<Register> = graph
                .get(&temp)
                .into_iter()
                .flatten()
                .filter_map(|n| colors.get(n).copied())
                .collect();

            if let Some(&r) = candidates.iter().find(|r| !neighbor_colors.contains(r)) {
                colors.insert(temp, r);
                break;
            }

            // No free color: between this temp and its colored,
            // color-blocking neighbors, evict whichever has the lowest
            // spill cost and retry. If this temp is itself the cheapest,
            // it's the one that spills.
            let temp_cost = costs.get(&temp).copied().unwrap_or(0);
            let cheapest_neighbor = graph
                .get(&temp)
                .into_iter()
                .flatten()
                .copied()
                .filter(|n| colors.get(n).map(|c| candidates.contains(c)).unwrap_or(false))
                .min_by_key(|n| costs.get(n).copied().unwrap_or(0));

            match cheapest_neighbor {
                Some(n) if costs.get(&n).copied().unwrap_or(0) < temp_cost => {
                    colors.remove(&n);
                    spilled.push(n);
                }
                _ => {
                    spilled.push(temp);
                    break;
                }
            }
        }
    }

    // Deterministic spill-slot assignment: by temp id, words taking two
    // contiguous bytes.
    spilled.sort_by_key(|t| t.0);
    let scratch = platform.zero_page_scratch;
    let mut cursor = u32::from(scratch.start);
    let region_end = u32::from(scratch.end);
    let mut locations: Map<Temp, TempLocation> = Map::new();

    for &temp in &spilled {
        let width = if word_temps.contains(&temp) { 2 } else { 1 };
        if cursor + width - 1 > region_end {
            diagnostics.error(
                Code::CodegenSpillOverflow,
                format!(
                    "function `{}` needs more spill space than the scratch zero page (${:02X}-${:02X}) provides",
                    function.name, scratch.start, scratch.end
                ),
            );
            return None;
        }
        locations.insert(temp, TempLocation::Scratch(cursor as u16));
        cursor += width;
    }
    for (temp, register) in colors {
        locations.insert(temp, TempLocation::Register(register));
    }

    Some(Allocation {
        locations,
        scratch_bytes_used: cursor - u32::from(scratch.start),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{intern, Span};
    use crate::front::ast::Type;
    use crate::middle::il::{BinOp, Function};

    fn span() -> Span {
        Span::synthetic()
    }

    #[test]
    fn non_overlapping_temps_share_a_register() {
        let mut f = Function::new(intern("f"), vec![], Type::Void);
        let mut block = BasicBlock::new(intern("entry"), Terminator::Return(None));
        let t0 = Temp(0);
        let t1 = Temp(1);
        block.instructions.push(ILInstruction::Const { dst: t0, value: 1, span: span() });
        block.instructions.push(ILInstruction::Store { var: intern("a"), value: Operand::Temp(t0), span: span() });
        block.instructions.push(ILInstruction::Const { dst: t1, value: 2, span: span() });
        block.instructions.push(ILInstruction::Store { var: intern("b"), value: Operand::Temp(t1), span: span() });
        f.blocks.push(block);
        f.next_temp = 2;

        let platform = PlatformConfig::c64();
        let mut diags = Diagnostics::new();
        let alloc = allocate(&f, &Default::default(), &platform, &mut diags).unwrap();
        assert_eq!(alloc.location(t0), Some(TempLocation::Register(Register::A)));
        assert_eq!(alloc.location(t1), Some(TempLocation::Register(Register::A)));
    }

    #[test]
    fn overlapping_accumulator_temps_force_a_spill() {
        let mut f = Function::new(intern("f"), vec![], Type::Void);
        let mut block = BasicBlock::new(intern("entry"), Terminator::Return(None));
        let t0 = Temp(0);
        let t1 = Temp(1);
        let t2 = Temp(2);
        block.instructions.push(ILInstruction::Const { dst: t0, value: 1, span: span() });
        block.instructions.push(ILInstruction::Const { dst: t1, value: 2, span: span() });
        block.instructions.push(ILInstruction::Binary {
            dst: t2,
            op: BinOp::Add,
            lhs: Operand::Temp(t0),
            rhs: Operand::Temp(t1),
            span: span(),
        });
        block.instructions.push(ILInstruction::Store { var: intern("c"), value: Operand::Temp(t2), span: span() });
        f.blocks.push(block);
        f.next_temp = 3;

        let platform = PlatformConfig::c64();
        let mut diags = Diagnostics::new();
        let alloc = allocate(&f, &Default::default(), &platform, &mut diags).unwrap();
        let locations = [alloc.location(t0), alloc.location(t1)];
        assert!(locations.iter().any(|l| matches!(l, Some(TempLocation::Scratch(_)))));
    }

    #[test]
    fn index_temp_prefers_x_or_y() {
        let mut f = Function::new(intern("f"), vec![], Type::Void);
        let mut block = BasicBlock::new(intern("entry"), Terminator::Return(None));
        let idx = Temp(0);
        let dst = Temp(1);
        block.instructions.push(ILInstruction::Const { dst: idx, value: 0, span: span() });
        block.instructions.push(ILInstruction::LoadIndexed { dst, base: intern("arr"), index: Operand::Temp(idx), span: span() });
        f.blocks.push(block);
        f.next_temp = 2;

        let platform = PlatformConfig::c64();
        let mut diags = Diagnostics::new();
        let alloc = allocate(&f, &Default::default(), &platform, &mut diags).unwrap();
        assert!(matches!(
            alloc.location(idx),
            Some(TempLocation::Register(Register::X)) | Some(TempLocation::Register(Register::Y))
        ));
    }
}
