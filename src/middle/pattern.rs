//! The generic peephole-pattern framework shared by the IL optimizer
//! (`middle::optimize`) and the ASM optimizer (`back::asm_opt`): one
//! `Pattern<I>` capability and two concrete registries (IL, ASM), not a
//! class hierarchy. Patterns own no mutable state.

/// What firing a pattern is worth, for reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Savings {
    pub cycles: u32,
    pub bytes: u32,
}

/// The result of a successful match: which window of instructions matched
/// and what it's worth.
pub struct MatchResult {
    /// Number of instructions consumed by the match, starting at the index
    /// passed to `Pattern::match_at`.
    pub length: usize,
    pub savings: Savings,
}

/// A single correctness-preserving rewrite rule over a window of
/// instructions of type `I`. Patterns are forbidden from mutating their
/// input in place — `apply` returns a fresh replacement slice and the
/// driver performs the splice.
pub trait Pattern<I> {
    fn name(&self) -> &'static str;

    /// Higher fires first when multiple patterns match at the same index.
    fn priority(&self) -> i32;

    fn category(&self) -> &'static str;

    /// Inspects `instructions[index..]` and decides whether to fire.
    fn match_at(&self, instructions: &[I], index: usize, ctx: &dyn PatternContext) -> Option<MatchResult>;

    /// Returns the replacement for `instructions[index..index + matched.length]`.
    fn apply(&self, instructions: &[I], index: usize, matched: &MatchResult) -> Vec<I>;
}

/// Read-only, pass-specific context a pattern may need beyond the
/// instruction window itself (e.g. which addresses are volatile). Kept
/// abstract here so `middle::optimize` and `back::asm_opt` can each supply
/// their own without this module depending on either.
pub trait PatternContext {
    /// True if the given numeric address must never be elided, reordered
    /// across another volatile access, or duplicated.
    fn is_volatile_address(&self, address: i64) -> bool;

    /// True if the value identified by `value_id` is used somewhere
    /// outside the instruction window a pattern can see directly — e.g. a
    /// block terminator or a successor block's phi. Dead-code and
    /// dead-store patterns consult this before removing a definition whose
    /// last use they can't see in their own window. Defaults to `true`
    /// (assume live) so contexts that don't track this stay safe.
    fn is_live_out(&self, value_id: u64) -> bool {
        let _ = value_id;
        true
    }
}

/// A no-op context for patterns (or tests) that don't care about
/// volatility.
pub struct NoVolatileContext;

impl PatternContext for NoVolatileContext {
    fn is_volatile_address(&self, _address: i64) -> bool {
        false
    }
}

/// A registry of patterns for one instruction type, grouped and ordered by
/// priority. Holds no mutable state itself; patterns are boxed trait
/// objects registered once at construction.
pub struct PatternRegistry<I> {
    patterns: Vec<Box<dyn Pattern<I>>>,
}

impl<I> PatternRegistry<I> {
    pub fn new() -> Self {
        PatternRegistry {
            patterns: Vec::new(),
        }
    }

    pub fn register(&mut self, pattern: Box<dyn Pattern<I>>) {
        self.patterns.push(pattern);
        self.patterns.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Pattern<I>> {
        self.patterns.iter().map(|p| p.as_ref())
    }
}

impl<I> Default for PatternRegistry<I> {
    fn default() -> Self {
        PatternRegistry::new()
    }
}

/// The fixed-point driver: repeatedly scans `instructions` left to right,
/// applying the highest-priority matching pattern at each index, until no
/// pattern fires or `max_iterations` is hit.
///
/// Returns `(changed, iterations_used, capped)`.
pub fn run_to_fixed_point<I>(
    instructions: &mut Vec<I>,
    registry: &PatternRegistry<I>,
    ctx: &dyn PatternContext,
    max_iterations: u32,
) -> (bool, u32, bool) {
    let mut any_changed = false;
    let mut iterations = 0;

    loop {
        if iterations >= max_iterations {
            return (any_changed, iterations, true);
        }
        iterations += 1;

        let mut changed_this_pass = false;
        let mut i = 0;
        'outer: while i < instructions.len() {
            for pattern in registry.iter() {
                if let Some(matched) = pattern.match_at(instructions, i, ctx) {
                    let replacement = pattern.apply(instructions, i, &matched);
                    instructions.splice(i..i + matched.length, replacement);
                    changed_this_pass = true;
                    any_changed = true;
                    // Re-examine predecessors: back up by the matched
                    // length minus one, floored at zero.
                    i = i.saturating_sub(matched.length.saturating_sub(1));
                    continue 'outer;
                }
            }
            i += 1;
        }

        if !changed_this_pass {
            return (any_changed, iterations, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A trivial instruction type for exercising the driver in isolation.
    #[derive(Clone, Debug, PartialEq, Eq)]
    enum TestInsn {
        Push(i32),
        Pop,
    }

    struct CancelPushPop;

    impl Pattern<TestInsn> for CancelPushPop {
        fn name(&self) -> &'static str {
            "cancel-push-pop"
        }
        fn priority(&self) -> i32 {
            10
        }
        fn category(&self) -> &'static str {
            "test"
        }
        fn match_at(&self, insns: &[TestInsn], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
            match insns.get(index..index + 2) {
                Some([TestInsn::Push(_), TestInsn::Pop]) => Some(MatchResult {
                    length: 2,
                    savings: Savings { cycles: 1, bytes: 1 },
                }),
                _ => None,
            }
        }
        fn apply(&self, _insns: &[TestInsn], _index: usize, _matched: &MatchResult) -> Vec<TestInsn> {
            vec![]
        }
    }

    #[test]
    fn fixed_point_removes_all_cancelling_pairs() {
        let mut insns = vec![
            TestInsn::Push(1),
            TestInsn::Push(2),
            TestInsn::Pop,
            TestInsn::Pop,
        ];
        let mut registry = PatternRegistry::new();
        registry.register(Box::new(CancelPushPop));
        let (changed, _iters, capped) =
            run_to_fixed_point(&mut insns, &registry, &NoVolatileContext, 16);
        assert!(changed);
        assert!(!capped);
        assert!(insns.is_empty());
    }

    #[test]
    fn reports_iteration_cap() {
        struct NeverStop;
        impl Pattern<TestInsn> for NeverStop {
            fn name(&self) -> &'static str {
                "never-stop"
            }
            fn priority(&self) -> i32 {
                0
            }
            fn category(&self) -> &'static str {
                "test"
            }
            fn match_at(&self, insns: &[TestInsn], index: usize, _ctx: &dyn PatternContext) -> Option<MatchResult> {
                insns.get(index).map(|_| MatchResult {
                    length: 1,
                    savings: Savings::default(),
                })
            }
            fn apply(&self, insns: &[TestInsn], index: usize, _matched: &MatchResult) -> Vec<TestInsn> {
                vec![insns[index].clone()]
            }
        }

        let mut insns = vec![TestInsn::Push(1)];
        let mut registry = PatternRegistry::new();
        registry.register(Box::new(NeverStop));
        let (_changed, iterations, capped) =
            run_to_fixed_point(&mut insns, &registry, &NoVolatileContext, 4);
        assert!(capped);
        assert_eq!(iterations, 4);
    }
}
