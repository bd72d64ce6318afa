//! Coalesce-group construction: greedy merging of function frames that
//! can never be live at the same time, so they share one region of
//! memory.

use crate::common::{Id, Map};
use crate::config::PlatformConfig;
use crate::diagnostics::{Code, Diagnostics};
use crate::middle::call_graph::CallGraph;

use super::thread_context::{may_be_simultaneously_live, thread_group, ThreadGroup};
use super::{CoalesceGroup, Frame, FrameMap, Location};

/// A group under construction: which functions it holds and the largest
/// frame size among them — group size always equals the maximum frame
/// size in the group.
pub(super) struct GroupPlan {
    pub members: Vec<Id>,
    pub size: u32,
}

/// Builds coalesce groups for every frame in `frames`. Functions whose
/// thread context forces solo placement always start (and stay in) their
/// own group.
pub(super) fn build_groups(frames: &Map<Id, Frame>, graph: &CallGraph) -> Vec<GroupPlan> {
    let mut ordered: Vec<&Frame> = frames.values().collect();
    // Decreasing frame size, then lexical name for determinism.
    ordered.sort_by(|a, b| b.total_size.cmp(&a.total_size).then(a.function.cmp(&b.function)));

    let mut groups: Vec<GroupPlan> = Vec::new();

    for frame in ordered {
        if thread_group(frame.thread_context) == ThreadGroup::Solo {
            groups.push(GroupPlan {
                members: vec![frame.function],
                size: frame.total_size,
            });
            continue;
        }

        let mut candidate: Option<(usize, u32)> = None;
        for (index, group) in groups.iter().enumerate() {
            if group.size < frame.total_size {
                continue;
            }
            let compatible = group.members.iter().all(|&member| {
                let member_frame = &frames[&member];
                if thread_group(member_frame.thread_context) == ThreadGroup::Solo {
                    return false;
                }
                !may_be_simultaneously_live(
                    graph,
                    member,
                    frame.function,
                    member_frame.thread_context,
                    frame.thread_context,
                )
            });
            if !compatible {
                continue;
            }
            // Tie-break: prefer the group closest to (but not below) the
            // new frame's size.
            match candidate {
                Some((_, best_size)) if group.size >= best_size => {}
                _ => candidate = Some((index, group.size)),
            }
        }

        match candidate {
            Some((index, _)) => groups[index].members.push(frame.function),
            None => groups.push(GroupPlan {
                members: vec![frame.function],
                size: frame.total_size,
            }),
        }
    }

    groups
}

/// Assigns base addresses to each group sequentially in the frame region,
/// then fixes up every member frame's slot addresses.
pub(super) fn allocate_frame_region(
    map: &mut FrameMap,
    groups: &[GroupPlan],
    platform: &PlatformConfig,
    diagnostics: &mut Diagnostics,
) -> Option<()> {
    let region = platform.frame_region;
    let mut cursor = u32::from(region.start);
    let region_end = u32::from(region.end);

    for group in groups {
        if cursor + group.size > region_end + 1 {
            let sizes: Vec<String> = group.members.iter().map(|m| m.to_string()).collect();
            diagnostics.error(
                Code::SfaFrameOverflow,
                format!(
                    "frame region exhausted placing group [{}] ({} bytes needed, {} available)",
                    sizes.join(", "),
                    group.size,
                    region_end + 1 - cursor
                ),
            );
            return None;
        }
        let base = cursor as u16;
        for &member in &group.members {
            let frame = map.frames.get_mut(&member).unwrap();
            frame.base_address = Some(base);
            frame.coalesce_group = Some(map.coalesce_groups.len());
            let mut offset = base;
            for slot in &mut frame.slots {
                // A slot already placed in zero page keeps that address;
                // its lexical position still reserves frame-region space
                // so the group's fixed size, computed before zero-page
                // allocation, stays accurate.
                if slot.location.is_none() {
                    slot.location = Some(Location::FrameRegion);
                    slot.address = Some(offset);
                }
                offset += slot.size as u16;
            }
        }
        map.coalesce_groups.push(CoalesceGroup {
            members: group.members.clone(),
            size: group.size,
            base_address: base,
        });
        cursor += group.size;
    }

    map.frame_region_bytes_used = cursor - u32::from(region.start);
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;
    use crate::front::ast::{StorageDirective, Type};
    use crate::frame::{FrameSlot, SlotKind};
    use crate::middle::call_graph::ThreadContext;

    fn frame(name: &str, size: u32, ctx: ThreadContext) -> Frame {
        Frame {
            function: intern(name),
            slots: vec![FrameSlot {
                name: intern(&format!("{name}_slot")),
                size,
                kind: SlotKind::Local,
                directive: StorageDirective::None,
                ty: Type::Byte,
                hotness: 0,
                location: None,
                address: None,
            }],
            total_size: size,
            thread_context: ctx,
            coalesce_group: None,
            base_address: None,
        }
    }

    #[test]
    fn unrelated_functions_coalesce_into_one_group() {
        let mut frames = Map::new();
        frames.insert(intern("a"), frame("a", 4, ThreadContext::MainThread));
        frames.insert(intern("b"), frame("b", 2, ThreadContext::MainThread));
        let graph = CallGraph::new();
        let groups = build_groups(&frames, &graph);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].size, 4);
    }

    #[test]
    fn caller_and_callee_never_share_a_group() {
        let mut frames = Map::new();
        frames.insert(intern("a"), frame("a", 4, ThreadContext::MainThread));
        frames.insert(intern("b"), frame("b", 2, ThreadContext::MainThread));
        let mut graph = CallGraph::new();
        graph.add_function(intern("a"), false, false);
        graph.add_function(intern("b"), false, false);
        graph.add_edge(intern("a"), intern("b"));
        let groups = build_groups(&frames, &graph);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn main_and_isr_functions_never_share_a_group() {
        let mut frames = Map::new();
        frames.insert(intern("a"), frame("a", 4, ThreadContext::MainThread));
        frames.insert(intern("b"), frame("b", 2, ThreadContext::IsrThread));
        let graph = CallGraph::new();
        let groups = build_groups(&frames, &graph);
        assert_eq!(groups.len(), 2);
    }
}
