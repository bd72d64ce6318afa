//! The static frame allocator: assigns every declared variable a final
//! absolute address, using call-graph-driven coalescing to minimize
//! memory use and a hotness score to maximize zero-page residency. Runs
//! as a sequence of numbered phases over the call graph, merging each
//! phase's results into one map.

mod coalesce;
mod thread_context;
mod zp_score;

pub use thread_context::ThreadGroup;

use crate::common::{Id, Map};
use crate::config::PlatformConfig;
use crate::diagnostics::{Code, Diagnostics};
use crate::front::ast::{Program, StorageDirective, Type};
use crate::middle::call_graph::CallGraph;

/// Where a slot ended up after allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    ZeroPage,
    FrameRegion,
    GeneralRam,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    Local,
    Parameter,
    ReturnValue,
    Global,
}

/// One allocated variable.
#[derive(Clone, Debug)]
pub struct FrameSlot {
    pub name: Id,
    pub size: u32,
    pub kind: SlotKind,
    pub directive: StorageDirective,
    pub ty: Type,
    pub hotness: u32,
    pub location: Option<Location>,
    pub address: Option<u16>,
}

impl FrameSlot {
    fn new(name: Id, ty: Type, kind: SlotKind, directive: StorageDirective) -> Self {
        FrameSlot {
            size: ty.size_bytes(),
            ty,
            name,
            kind,
            directive,
            hotness: 0,
            location: None,
            address: None,
        }
    }
}

/// The per-function allocation record.
#[derive(Clone, Debug)]
pub struct Frame {
    pub function: Id,
    pub slots: Vec<FrameSlot>,
    pub total_size: u32,
    pub thread_context: crate::middle::call_graph::ThreadContext,
    pub coalesce_group: Option<usize>,
    pub base_address: Option<u16>,
}

impl Frame {
    pub fn slot(&self, name: Id) -> Option<&FrameSlot> {
        self.slots.iter().find(|s| s.name == name)
    }
}

/// The allocator's full output. Read-only once built.
#[derive(Clone, Debug, Default)]
pub struct FrameMap {
    pub frames: Map<Id, Frame>,
    pub globals: Map<Id, FrameSlot>,
    pub coalesce_groups: Vec<CoalesceGroup>,
    pub zero_page_bytes_used: u32,
    pub frame_region_bytes_used: u32,
}

#[derive(Clone, Debug)]
pub struct CoalesceGroup {
    pub members: Vec<Id>,
    pub size: u32,
    pub base_address: u16,
}

impl FrameMap {
    /// `1 − coalesced_bytes / naive_sum_bytes`.
    pub fn coalescing_savings(&self) -> f64 {
        let naive: u32 = self.frames.values().map(|f| f.total_size).sum();
        if naive == 0 {
            return 0.0;
        }
        let coalesced: u32 = self.coalesce_groups.iter().map(|g| g.size).sum();
        1.0 - (coalesced as f64 / naive as f64)
    }
}

/// Runs the full allocation algorithm. Returns `None` if a
/// fatal diagnostic was raised; `diagnostics` always receives every
/// diagnostic produced, fatal or not.
pub fn allocate(
    program: &Program,
    call_graph: &CallGraph,
    platform: &PlatformConfig,
    diagnostics: &mut Diagnostics,
) -> Option<FrameMap> {
    // Step 1: recursion gate.
    if let Some(cycle) = call_graph.find_cycle() {
        let path = cycle
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        diagnostics.error(Code::SfaRecursion, format!("recursive call cycle: {path}"));
        return None;
    }

    // `main` must exist, be exported, and take no parameters / return void.
    let main_name = crate::common::intern("main");
    let main_fn = match program.find_function(main_name) {
        Some(f) => f,
        None => {
            diagnostics.error(Code::SfaNoEntry, "no `main` function found");
            return None;
        }
    };
    if !main_fn.exported {
        diagnostics.error(Code::SfaNoEntry, "`main` is not exported");
        return None;
    }
    if !main_fn.params.is_empty() || main_fn.return_type != Type::Void {
        diagnostics.error(
            Code::SfaBadEntrySignature,
            "`main` must take no parameters and return void",
        );
        return None;
    }

    // Step 2: thread-context tagging.
    let classes = call_graph.classify_threads(main_name);
    for (name, ctx) in &classes {
        if *ctx == crate::middle::call_graph::ThreadContext::Shared {
            diagnostics.warning(
                Code::SfaMultithreadCall,
                format!("`{name}` is called from multiple thread contexts"),
            );
        }
        if *ctx == crate::middle::call_graph::ThreadContext::Unreachable && !call_graph.is_callback(*name) {
            diagnostics.warning(Code::SfaUnreachableFunction, format!("`{name}` is never called"));
        }
    }

    // Step 3: frame-size computation.
    let mut frames: Map<Id, Frame> = Map::new();
    for function in program.functions() {
        let mut slots = Vec::new();
        for param in &function.params {
            slots.push(FrameSlot::new(
                param.name,
                param.ty.clone(),
                SlotKind::Parameter,
                param.directive,
            ));
        }
        for stmt in &function.body {
            collect_locals(stmt, &mut slots);
        }
        if function.return_type != Type::Void {
            slots.push(FrameSlot::new(
                crate::common::intern(&format!("{}$return", function.name)),
                function.return_type.clone(),
                SlotKind::ReturnValue,
                StorageDirective::None,
            ));
        }
        let total_size = slots.iter().map(|s| s.size).sum();
        frames.insert(
            function.name,
            Frame {
                function: function.name,
                slots,
                total_size,
                thread_context: classes
                    .get(&function.name)
                    .copied()
                    .unwrap_or(crate::middle::call_graph::ThreadContext::Unreachable),
                coalesce_group: None,
                base_address: None,
            },
        );
    }

    // Step 4: coalesce-group construction.
    let groups = coalesce::build_groups(&frames, call_graph);

    // Step 6/7: allocate ZP then the frame region, module globals along the
    // way (step 8).
    let mut map = FrameMap {
        frames,
        globals: Map::new(),
        coalesce_groups: Vec::new(),
        zero_page_bytes_used: 0,
        frame_region_bytes_used: 0,
    };

    for global in program.globals() {
        let mut slot = FrameSlot::new(global.name, global.ty.clone(), SlotKind::Global, global.directive);
        if let Some(addr) = global.fixed_address {
            if !platform.frame_region.contains(addr)
                && !platform.general_ram.contains(addr)
                && !platform.zero_page.contains(addr)
                && platform.hardware_range_containing(addr).is_none()
            {
                diagnostics.error(
                    Code::SfaInvalidMapAddress,
                    format!("`{}` maps to an address outside any recognized region: ${addr:04X}", global.name),
                );
                return None;
            }
            slot.location = Some(Location::GeneralRam);
            slot.address = Some(addr);
        }
        map.globals.insert(global.name, slot);
    }

    // Step 5: zero-page scoring, computed once every slot (local and
    // global) exists.
    zp_score::score_slots(program, &mut map.frames, &mut map.globals);

    zp_score::allocate_zero_page(&mut map, platform, diagnostics)?;
    coalesce::allocate_frame_region(&mut map, &groups, platform, diagnostics)?;
    zp_score::allocate_general_ram(&mut map, platform);

    Some(map)
}

fn collect_locals(stmt: &crate::front::ast::Stmt, slots: &mut Vec<FrameSlot>) {
    use crate::front::ast::Stmt;
    match stmt {
        Stmt::Let(decl, _) => slots.push(FrameSlot::new(decl.name, decl.ty.clone(), SlotKind::Local, decl.directive)),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            for s in then_branch {
                collect_locals(s, slots);
            }
            for s in else_branch {
                collect_locals(s, slots);
            }
        }
        Stmt::Loop { body } => {
            for s in body {
                collect_locals(s, slots);
            }
        }
        Stmt::Assign(_, _) | Stmt::ExprStmt(_) | Stmt::Return(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;
    use crate::front::ast::{FunctionDecl, GlobalDecl, Module, VarDecl};

    fn span() -> crate::common::Span {
        crate::common::Span::synthetic()
    }

    fn main_fn() -> FunctionDecl {
        FunctionDecl {
            name: intern("main"),
            exported: true,
            is_callback: false,
            params: vec![],
            return_type: Type::Void,
            body: vec![crate::front::ast::Stmt::Let(
                VarDecl {
                    name: intern("x"),
                    ty: Type::Byte,
                    directive: StorageDirective::None,
                    span: span(),
                },
                None,
            )],
            span: span(),
        }
    }

    fn program_with(functions: Vec<FunctionDecl>, globals: Vec<GlobalDecl>) -> Program {
        Program {
            modules: vec![Module {
                qualified_name: intern("root"),
                imports: vec![],
                exports: vec![],
                globals,
                functions,
            }],
        }
    }

    #[test]
    fn allocates_simple_main() {
        let program = program_with(vec![main_fn()], vec![]);
        let graph = CallGraph::from_program(&program);
        let platform = PlatformConfig::c64();
        let mut diags = Diagnostics::new();
        let map = allocate(&program, &graph, &platform, &mut diags).expect("allocation should succeed");
        assert!(!diags.has_errors());
        let frame = &map.frames[&intern("main")];
        assert_eq!(frame.slots.len(), 1);
    }

    #[test]
    fn rejects_missing_main() {
        let program = program_with(vec![], vec![]);
        let graph = CallGraph::from_program(&program);
        let platform = PlatformConfig::c64();
        let mut diags = Diagnostics::new();
        assert!(allocate(&program, &graph, &platform, &mut diags).is_none());
        assert!(diags.has_errors());
    }

    #[test]
    fn rejects_recursive_call_graph() {
        let mut recursive = main_fn();
        recursive.body.push(crate::front::ast::Stmt::ExprStmt(crate::front::ast::Expr::Call(
            intern("main"),
            vec![],
        )));
        let program = program_with(vec![recursive], vec![]);
        let graph = CallGraph::from_program(&program);
        let platform = PlatformConfig::c64();
        let mut diags = Diagnostics::new();
        assert!(allocate(&program, &graph, &platform, &mut diags).is_none());
        assert!(diags.iter().any(|d| d.code == Code::SfaRecursion));
    }
}
