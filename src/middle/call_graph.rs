//! The call graph: a directed multigraph of function nodes, consumed by
//! the frame allocator. Nodes and edges are stored in an arena indexed by
//! function name rather than carrying direct references to one another, so
//! cycles in the graph don't become cycles in the data structure.

use crate::common::{Id, Map, Set};
use crate::front::ast::Program;

/// One call site: caller calls callee at `span`.
#[derive(Clone, Copy, Debug)]
pub struct CallEdge {
    pub caller: Id,
    pub callee: Id,
}

#[derive(Clone, Debug, Default)]
struct Node {
    /// Outgoing call edges, in declaration order.
    callees: Vec<Id>,
    is_callback: bool,
    exported: bool,
}

/// The call graph: function name -> node, queryable for cycles,
/// reachability, and thread-context classification.
#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    nodes: Map<Id, Node>,
}

/// Whether a function is reachable only from `main`, only from a
/// `callback`, from both (and therefore flagged), or from neither.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadContext {
    MainThread,
    IsrThread,
    Shared,
    Unreachable,
}

impl CallGraph {
    pub fn new() -> Self {
        CallGraph::default()
    }

    pub fn add_function(&mut self, name: Id, is_callback: bool, exported: bool) {
        self.nodes.entry(name).or_default().is_callback = is_callback;
        self.nodes.entry(name).or_default().exported = exported;
    }

    pub fn add_edge(&mut self, caller: Id, callee: Id) {
        self.nodes.entry(caller).or_default();
        self.nodes.entry(callee).or_default();
        self.nodes.get_mut(&caller).unwrap().callees.push(callee);
    }

    pub fn contains(&self, name: Id) -> bool {
        self.nodes.contains_key(&name)
    }

    pub fn is_callback(&self, name: Id) -> bool {
        self.nodes.get(&name).map(|n| n.is_callback).unwrap_or(false)
    }

    pub fn is_exported(&self, name: Id) -> bool {
        self.nodes.get(&name).map(|n| n.exported).unwrap_or(false)
    }

    /// Function names in stable (lexical) order, for deterministic
    /// iteration everywhere downstream.
    pub fn functions(&self) -> Vec<Id> {
        self.nodes.keys().copied().collect()
    }

    pub fn callback_functions(&self) -> Vec<Id> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.is_callback)
            .map(|(name, _)| *name)
            .collect()
    }

    fn callees(&self, name: Id) -> &[Id] {
        self.nodes
            .get(&name)
            .map(|n| n.callees.as_slice())
            .unwrap_or(&[])
    }

    /// Finds one cycle reachable from any node, if any exists — any cycle
    /// is fatal, since this allocator has no notion of a recursive frame.
    /// Returns the cycle as a path `a -> b -> ... -> a`.
    pub fn find_cycle(&self) -> Option<Vec<Id>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut mark: Map<Id, Mark> = Map::new();
        let mut stack: Vec<Id> = Vec::new();

        fn visit(
            graph: &CallGraph,
            node: Id,
            mark: &mut Map<Id, Mark>,
            stack: &mut Vec<Id>,
        ) -> Option<Vec<Id>> {
            stack.push(node);
            mark.insert(node, Mark::Visiting);

            for &callee in graph.callees(node) {
                match mark.get(&callee) {
                    Some(Mark::Visiting) => {
                        let start = stack.iter().position(|&n| n == callee).unwrap();
                        let mut cycle: Vec<Id> = stack[start..].to_vec();
                        cycle.push(callee);
                        return Some(cycle);
                    }
                    Some(Mark::Done) => continue,
                    None => {
                        if let Some(cycle) = visit(graph, callee, mark, stack) {
                            return Some(cycle);
                        }
                    }
                }
            }

            stack.pop();
            mark.insert(node, Mark::Done);
            None
        }

        for name in self.functions() {
            if mark.contains_key(&name) {
                continue;
            }
            if let Some(cycle) = visit(self, name, &mut mark, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// All function names transitively reachable from `root` (inclusive).
    pub fn reachable_from(&self, root: Id) -> Set<Id> {
        let mut visited: Set<Id> = Set::new();
        let mut stack = vec![root];
        while let Some(name) = stack.pop() {
            if !visited.insert(name) {
                continue;
            }
            for &callee in self.callees(name) {
                if !visited.contains(&callee) {
                    stack.push(callee);
                }
            }
        }
        visited
    }

    /// True iff `a` transitively calls `b` or `b` transitively calls `a` —
    /// one of the conditions under which two frames may be simultaneously
    /// live and therefore must never coalesce.
    pub fn transitively_calls(&self, a: Id, b: Id) -> bool {
        self.reachable_from(a).contains(&b)
    }

    /// Classifies every function as main-thread, ISR-thread, shared, or
    /// unreachable.
    pub fn classify_threads(&self, main: Id) -> Map<Id, ThreadContext> {
        let from_main = self.reachable_from(main);
        let mut from_any_callback: Set<Id> = Set::new();
        for callback in self.callback_functions() {
            from_any_callback.extend(self.reachable_from(callback));
        }

        let mut result: Map<Id, ThreadContext> = Map::new();
        for name in self.functions() {
            let in_main = from_main.contains(&name);
            let in_isr = from_any_callback.contains(&name);
            let context = match (in_main, in_isr) {
                (true, true) => ThreadContext::Shared,
                (true, false) => ThreadContext::MainThread,
                (false, true) => ThreadContext::IsrThread,
                (false, false) => ThreadContext::Unreachable,
            };
            result.insert(name, context);
        }
        result
    }

    /// Builds a call graph from a typed AST by walking each function body
    /// for `Call` expressions. This is a convenience for tests and for
    /// hosts that don't already have a call graph from their own semantic
    /// analyzer — the call graph is ordinarily externally produced, but its
    /// shape is this one.
    pub fn from_program(program: &Program) -> Self {
        let mut graph = CallGraph::new();
        for module in &program.modules {
            for function in &module.functions {
                graph.add_function(function.name, function.is_callback, function.exported);
                collect_calls(&function.body, function.name, &mut graph);
            }
        }
        graph
    }
}

fn collect_calls(stmts: &[crate::front::ast::Stmt], caller: Id, graph: &mut CallGraph) {
    use crate::front::ast::{Expr, Stmt};

    fn walk_expr(expr: &Expr, caller: Id, graph: &mut CallGraph) {
        match expr {
            Expr::Call(callee, args) => {
                const BUILTINS: &[&str] = &["peek", "poke", "peekw", "pokew", "sys"];
                if !BUILTINS.contains(&callee.as_str()) {
                    graph.add_edge(caller, *callee);
                }
                for arg in args {
                    walk_expr(arg, caller, graph);
                }
            }
            Expr::Binary(_, lhs, rhs) => {
                walk_expr(lhs, caller, graph);
                walk_expr(rhs, caller, graph);
            }
            Expr::Negate(e) | Expr::Not(e) | Expr::Deref(e) => walk_expr(e, caller, graph),
            Expr::Index(base, index) => {
                walk_expr(base, caller, graph);
                walk_expr(index, caller, graph);
            }
            Expr::Var(_) | Expr::Const(_) => {}
        }
    }

    for stmt in stmts {
        match stmt {
            Stmt::Let(_, Some(e)) => walk_expr(e, caller, graph),
            Stmt::Let(_, None) => {}
            Stmt::Assign(_, e) | Stmt::ExprStmt(e) => walk_expr(e, caller, graph),
            Stmt::If {
                guard,
                then_branch,
                else_branch,
            } => {
                walk_expr(guard, caller, graph);
                collect_calls(then_branch, caller, graph);
                collect_calls(else_branch, caller, graph);
            }
            Stmt::Loop { body } => collect_calls(body, caller, graph),
            Stmt::Return(Some(e)) => walk_expr(e, caller, graph),
            Stmt::Return(None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Id {
        crate::common::intern(s)
    }

    #[test]
    fn detects_direct_recursion() {
        let mut g = CallGraph::new();
        g.add_function(id("ping"), false, false);
        g.add_edge(id("ping"), id("ping"));
        assert!(g.find_cycle().is_some());
    }

    #[test]
    fn detects_mutual_recursion() {
        let mut g = CallGraph::new();
        g.add_function(id("ping"), false, false);
        g.add_function(id("pong"), false, false);
        g.add_function(id("main"), false, true);
        g.add_edge(id("ping"), id("pong"));
        g.add_edge(id("pong"), id("ping"));
        g.add_edge(id("main"), id("ping"));
        let cycle = g.find_cycle().expect("cycle expected");
        assert!(cycle.contains(&id("ping")));
        assert!(cycle.contains(&id("pong")));
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let mut g = CallGraph::new();
        g.add_function(id("main"), false, true);
        g.add_function(id("a"), false, false);
        g.add_function(id("b"), false, false);
        g.add_edge(id("main"), id("a"));
        g.add_edge(id("a"), id("b"));
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn classifies_main_isr_and_shared() {
        let mut g = CallGraph::new();
        g.add_function(id("main"), false, true);
        g.add_function(id("irq"), true, false);
        g.add_function(id("helper"), false, false);
        g.add_function(id("shared_fn"), false, false);
        g.add_function(id("orphan"), false, false);
        g.add_edge(id("main"), id("helper"));
        g.add_edge(id("main"), id("shared_fn"));
        g.add_edge(id("irq"), id("shared_fn"));

        let classes = g.classify_threads(id("main"));
        assert_eq!(classes[&id("helper")], ThreadContext::MainThread);
        assert_eq!(classes[&id("shared_fn")], ThreadContext::Shared);
        assert_eq!(classes[&id("orphan")], ThreadContext::Unreachable);
    }
}
