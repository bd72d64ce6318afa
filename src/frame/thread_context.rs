//! Coalesce-compatibility rules derived from thread context.

use crate::common::Id;
use crate::middle::call_graph::{CallGraph, ThreadContext};

/// Whether a function's thread context forces it into a dedicated,
/// non-coalescing group: functions reachable from both `main` and a
/// `callback` are always placed in a dedicated non-coalescing group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadGroup {
    Solo,
    Coalescable,
}

pub fn thread_group(ctx: ThreadContext) -> ThreadGroup {
    match ctx {
        ThreadContext::Shared => ThreadGroup::Solo,
        ThreadContext::MainThread | ThreadContext::IsrThread | ThreadContext::Unreachable => {
            ThreadGroup::Coalescable
        }
    }
}

/// True if `a` and `b` may be simultaneously live: one transitively calls
/// the other, or they run in different thread contexts (main vs. ISR).
/// Frames for which this is true are never placed in the same coalesce
/// group.
pub fn may_be_simultaneously_live(graph: &CallGraph, a: Id, b: Id, a_ctx: ThreadContext, b_ctx: ThreadContext) -> bool {
    if graph.transitively_calls(a, b) || graph.transitively_calls(b, a) {
        return true;
    }
    matches!(
        (a_ctx, b_ctx),
        (ThreadContext::MainThread, ThreadContext::IsrThread) | (ThreadContext::IsrThread, ThreadContext::MainThread)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;

    #[test]
    fn caller_callee_are_live_together() {
        let mut g = CallGraph::new();
        g.add_function(intern("a"), false, false);
        g.add_function(intern("b"), false, false);
        g.add_edge(intern("a"), intern("b"));
        assert!(may_be_simultaneously_live(
            &g,
            intern("a"),
            intern("b"),
            ThreadContext::MainThread,
            ThreadContext::MainThread
        ));
    }

    #[test]
    fn unrelated_same_context_functions_are_compatible() {
        let mut g = CallGraph::new();
        g.add_function(intern("a"), false, false);
        g.add_function(intern("b"), false, false);
        assert!(!may_be_simultaneously_live(
            &g,
            intern("a"),
            intern("b"),
            ThreadContext::MainThread,
            ThreadContext::MainThread
        ));
    }

    #[test]
    fn main_and_isr_functions_are_incompatible() {
        let g = CallGraph::new();
        assert!(may_be_simultaneously_live(
            &g,
            intern("a"),
            intern("b"),
            ThreadContext::MainThread,
            ThreadContext::IsrThread
        ));
    }
}
