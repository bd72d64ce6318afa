//! Zero-page scoring and the zero-page / general-RAM allocation passes.

use crate::common::{Id, Map};
use crate::config::PlatformConfig;
use crate::diagnostics::{Code, Diagnostics};
use crate::front::ast::{Expr, FunctionDecl, Program, Stmt, StorageDirective, Type};

use super::{FrameMap, FrameSlot, Location};

fn type_weight(ty: &Type) -> u32 {
    match ty {
        Type::Pointer(_) => 0x800,
        Type::Byte => 0x100,
        Type::Word => 0x080,
        Type::Array(_, _) => 0,
        Type::Void => 0,
    }
}

/// Counts read/write references to `name` in `function`'s body, weighting
/// accesses inside a loop by `depth × 4` (capped at `loop_bonus_cap`).
fn access_score(function: &FunctionDecl, name: Id, loop_bonus_cap: u32) -> u32 {
    fn walk_expr(expr: &Expr, name: Id, depth: u32, cap: u32, score: &mut u32) {
        let bonus = if depth == 0 { 1 } else { (depth * 4).min(cap) };
        match expr {
            Expr::Var(v) if *v == name => *score += bonus,
            Expr::Var(_) | Expr::Const(_) => {}
            Expr::Binary(_, lhs, rhs) => {
                walk_expr(lhs, name, depth, cap, score);
                walk_expr(rhs, name, depth, cap, score);
            }
            Expr::Negate(e) | Expr::Not(e) | Expr::Deref(e) => walk_expr(e, name, depth, cap, score),
            Expr::Index(base, index) => {
                walk_expr(base, name, depth, cap, score);
                walk_expr(index, name, depth, cap, score);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    walk_expr(arg, name, depth, cap, score);
                }
            }
        }
    }

    fn walk_stmts(stmts: &[Stmt], name: Id, depth: u32, cap: u32, score: &mut u32) {
        for stmt in stmts {
            match stmt {
                Stmt::Let(decl, init) => {
                    if decl.name == name {
                        *score += if depth == 0 { 1 } else { (depth * 4).min(cap) };
                    }
                    if let Some(e) = init {
                        walk_expr(e, name, depth, cap, score);
                    }
                }
                Stmt::Assign(target, value) => {
                    if *target == name {
                        *score += if depth == 0 { 1 } else { (depth * 4).min(cap) };
                    }
                    walk_expr(value, name, depth, cap, score);
                }
                Stmt::ExprStmt(e) => walk_expr(e, name, depth, cap, score),
                Stmt::If {
                    guard,
                    then_branch,
                    else_branch,
                } => {
                    walk_expr(guard, name, depth, cap, score);
                    walk_stmts(then_branch, name, depth, cap, score);
                    walk_stmts(else_branch, name, depth, cap, score);
                }
                Stmt::Loop { body } => walk_stmts(body, name, depth + 1, cap, score),
                Stmt::Return(Some(e)) => walk_expr(e, name, depth, cap, score),
                Stmt::Return(None) => {}
            }
        }
    }

    let mut score = 0;
    for param in &function.params {
        if param.name == name {
            score += 1;
        }
    }
    walk_stmts(&function.body, name, 0, loop_bonus_cap, &mut score);
    score
}

/// Computes `hotness` for every local/parameter slot across every
/// function, and for every module global across the whole program.
pub(super) fn score_slots(program: &Program, frames: &mut Map<Id, super::Frame>, globals: &mut Map<Id, FrameSlot>) {
    // A flat cap on the loop-bonus multiplier, configurable per-platform in
    // practice, but the algorithm itself only needs a number.
    const LOOP_BONUS_CAP: u32 = 64;

    for function in program.functions() {
        if let Some(frame) = frames.get_mut(&function.name) {
            for slot in &mut frame.slots {
                slot.hotness = access_score(function, slot.name, LOOP_BONUS_CAP) * type_weight(&slot.ty);
            }
        }
    }

    for (name, slot) in globals.iter_mut() {
        let mut total = 0;
        for function in program.functions() {
            total += access_score(function, *name, LOOP_BONUS_CAP);
        }
        slot.hotness = total * type_weight(&slot.ty);
    }
}

struct ZpPool {
    occupied: Vec<bool>,
    start: u16,
}

impl ZpPool {
    fn new(platform: &PlatformConfig) -> Self {
        let len = platform.zero_page.len() as usize;
        let mut occupied = vec![false; len];
        for reserved in &platform.zero_page_reserved {
            mark(&mut occupied, platform.zero_page.start, reserved.start, reserved.len());
        }
        mark(
            &mut occupied,
            platform.zero_page.start,
            platform.zero_page_scratch.start,
            platform.zero_page_scratch.len(),
        );
        ZpPool {
            occupied,
            start: platform.zero_page.start,
        }
    }

    /// First-fit search for `size` contiguous free bytes, aligned so the
    /// low byte sits at an even offset when `align_pair` is set (pointer
    /// slots need this for `(zp),Y` addressing).
    fn first_fit(&self, size: u32, align_pair: bool) -> Option<u16> {
        let size = size as usize;
        if size == 0 {
            return Some(self.start);
        }
        let mut offset = 0usize;
        while offset + size <= self.occupied.len() {
            if align_pair && (self.start as usize + offset) % 2 != 0 {
                offset += 1;
                continue;
            }
            if self.occupied[offset..offset + size].iter().all(|b| !b) {
                return Some(self.start + offset as u16);
            }
            offset += 1;
        }
        None
    }

    fn place(&mut self, address: u16, size: u32) {
        let offset = (address - self.start) as usize;
        for b in &mut self.occupied[offset..offset + size as usize] {
            *b = true;
        }
    }

    fn bytes_used(&self) -> u32 {
        self.occupied.iter().filter(|b| **b).count() as u32
    }
}

fn mark(occupied: &mut [bool], pool_start: u16, region_start: u16, region_len: u32) {
    let start = (region_start.saturating_sub(pool_start)) as usize;
    let end = (start + region_len as usize).min(occupied.len());
    for b in &mut occupied[start.min(occupied.len())..end] {
        *b = true;
    }
}

/// Collects every slot eligible for zero-page placement: all frame locals
/// (not parameters/return values — those are allocated as part of the
/// owning frame's frame-region layout unless `@zp`), plus `@zp`/`None`
/// module globals. `RequireRam` slots never participate.
fn candidate_refs(map: &mut FrameMap) -> Vec<(Id, Option<Id>)> {
    let mut refs = Vec::new();
    for (fn_name, frame) in &map.frames {
        for slot in &frame.slots {
            if slot.directive != StorageDirective::RequireRam {
                refs.push((*fn_name, Some(slot.name)));
            }
        }
    }
    for slot in map.globals.values() {
        if slot.directive != StorageDirective::RequireRam && slot.address.is_none() {
            refs.push((slot.name, None));
        }
    }
    refs
}

fn slot_mut<'a>(map: &'a mut FrameMap, owner: Id, local: Option<Id>) -> &'a mut FrameSlot {
    match local {
        Some(name) => map
            .frames
            .get_mut(&owner)
            .unwrap()
            .slots
            .iter_mut()
            .find(|s| s.name == name)
            .unwrap(),
        None => map.globals.get_mut(&owner).unwrap(),
    }
}

/// Places every `RequireZP` slot first, then greedily places
/// `None`-directive slots by descending score. A `@zp` slot that doesn't
/// fit doesn't abort the pass immediately — every other `@zp` slot is
/// still attempted, so the caller sees every overflow in one run instead
/// of being sent back to fix them one at a time.
pub(super) fn allocate_zero_page(
    map: &mut FrameMap,
    platform: &PlatformConfig,
    diagnostics: &mut Diagnostics,
) -> Option<()> {
    let mut pool = ZpPool::new(platform);
    let mut refs = candidate_refs(map);

    refs.sort_by(|(oa, la), (ob, lb)| {
        let a = slot_ref(map, *oa, *la);
        let b = slot_ref(map, *ob, *lb);
        b.hotness.cmp(&a.hotness).then(a.name.cmp(&b.name))
    });

    let (required, optional): (Vec<_>, Vec<_>) = refs
        .into_iter()
        .partition(|(owner, local)| slot_ref(map, *owner, *local).directive == StorageDirective::RequireZp);

    let mut overflowed = false;
    for (owner, local) in required {
        let (size, is_pointer) = {
            let slot = slot_ref(map, owner, local);
            (slot.size, slot.ty.is_pointer())
        };
        match pool.first_fit(size, is_pointer) {
            Some(address) => {
                pool.place(address, size);
                let slot = slot_mut(map, owner, local);
                slot.location = Some(Location::ZeroPage);
                slot.address = Some(address);
            }
            None => {
                let slot = slot_ref(map, owner, local);
                diagnostics.error(
                    Code::SfaZpOverflow,
                    format!("`{}` is marked `@zp` but zero page has no room for it", slot.name),
                );
                overflowed = true;
            }
        }
    }

    if overflowed {
        return None;
    }

    for (owner, local) in optional {
        let (size, is_pointer) = {
            let slot = slot_ref(map, owner, local);
            (slot.size, slot.ty.is_pointer())
        };
        if let Some(address) = pool.first_fit(size, is_pointer) {
            pool.place(address, size);
            let slot = slot_mut(map, owner, local);
            slot.location = Some(Location::ZeroPage);
            slot.address = Some(address);
        }
    }

    map.zero_page_bytes_used = pool.bytes_used();
    Some(())
}

fn slot_ref<'a>(map: &'a FrameMap, owner: Id, local: Option<Id>) -> &'a FrameSlot {
    match local {
        Some(name) => map.frames[&owner].slots.iter().find(|s| s.name == name).unwrap(),
        None => &map.globals[&owner],
    }
}

/// Places everything still unassigned (non-ZP locals without a frame slot
/// don't exist — frame-region allocation owns those — but `@ram` globals
/// and anything zero-page allocation skipped do) sequentially in general
/// RAM.
pub(super) fn allocate_general_ram(map: &mut FrameMap, platform: &PlatformConfig) {
    let mut cursor = u32::from(platform.general_ram.start);
    let mut names: Vec<Id> = map
        .globals
        .iter()
        .filter(|(_, s)| s.address.is_none())
        .map(|(name, _)| *name)
        .collect();
    names.sort();
    for name in names {
        let slot = map.globals.get_mut(&name).unwrap();
        slot.location = Some(Location::GeneralRam);
        slot.address = Some(cursor as u16);
        cursor += slot.size as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;
    use crate::front::ast::FunctionDecl;

    fn span() -> crate::common::Span {
        crate::common::Span::synthetic()
    }

    #[test]
    fn weights_pointer_accesses_higher_than_bytes() {
        assert!(type_weight(&Type::Pointer(Box::new(Type::Byte))) > type_weight(&Type::Byte));
        assert!(type_weight(&Type::Byte) > type_weight(&Type::Word));
    }

    #[test]
    fn loop_accesses_score_higher_than_straight_line() {
        let straight = FunctionDecl {
            name: intern("f"),
            exported: false,
            is_callback: false,
            params: vec![],
            return_type: Type::Void,
            body: vec![Stmt::ExprStmt(Expr::Var(intern("x")))],
            span: span(),
        };
        let looped = FunctionDecl {
            body: vec![Stmt::Loop {
                body: vec![Stmt::ExprStmt(Expr::Var(intern("x")))],
            }],
            ..straight.clone_for_test()
        };
        let flat = access_score(&straight, intern("x"), 64);
        let loop_score = access_score(&looped, intern("x"), 64);
        assert!(loop_score > flat);
    }

    impl FunctionDecl {
        fn clone_for_test(&self) -> Self {
            self.clone()
        }
    }

    #[test]
    fn zp_pool_avoids_scratch_range() {
        let platform = PlatformConfig::c64();
        let pool = ZpPool::new(&platform);
        let addr = pool.first_fit(1, false).unwrap();
        assert!(!platform.zero_page_scratch.contains(addr));
    }
}
