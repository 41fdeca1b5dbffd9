//! The next-use oracle consumed by the spiller.
//!
//! Distances are measured in scheduled instructions within a single block;
//! `Proj`s piggyback on their tuple and do not count as steps. A value with
//! no further use in the block reports [`DIST_INFINITY`] — the caller
//! cannot tell "live-out" from "dead" here; the spiller's dead-value fixup
//! disambiguates.

use opal_ir::{Graph, NodeId, Opcode};

/// Sentinel distance: not used again in this block.
pub const DIST_INFINITY: u32 = u32::MAX;

#[derive(Debug, Default)]
pub struct NextUses;

impl NextUses {
    pub fn new() -> Self {
        Self
    }

    /// Distance from `from` (at step `from_step`) to the next use of
    /// `value` in the same block. With `skip_from`, uses at `from` itself
    /// do not count.
    ///
    /// A `dont_spill` value reports 0 at every query: it has to stay in
    /// the working set.
    pub fn distance(
        &self,
        graph: &Graph,
        from: NodeId,
        from_step: u32,
        value: NodeId,
        skip_from: bool,
    ) -> u32 {
        if graph.reg_info(value).dont_spill {
            return 0;
        }

        let (mut cur, mut steps) = if skip_from {
            (graph.schedule.next_of(from), 1u32)
        } else {
            (Some(from), 0u32)
        };

        while let Some(node) = cur {
            if graph.opcode(node) != Opcode::Proj {
                if graph.inputs(node).contains(&value) {
                    return from_step.saturating_add(steps);
                }
                steps += 1;
            }
            cur = graph.schedule.next_of(node);
        }

        DIST_INFINITY
    }

    /// Distance of the first use of `value` from the start of `block`.
    pub fn distance_from_start(&self, graph: &Graph, block: NodeId, value: NodeId) -> u32 {
        match graph.schedule.first_of(block) {
            Some(first) => self.distance(graph, first, 0, value, false),
            None => DIST_INFINITY,
        }
    }
}
