//! Stack-pointer bias simulation.
//!
//! Walks the CFG from the entry block, carrying two running values per
//! path: `offset`, the actual displacement of the stack pointer below its
//! value at function entry, and `wanted_bias`, the displacement the ABI
//! wants at that point (it lags behind when alignment padding was added).
//! Both live in non-negative "bias space"; an `IncSp` node's *amount* is
//! the signed SP delta, so an amount of −n is a bias of +n.
//!
//! `IncSp` nodes are patched in place: an aligning one grows by the slack
//! the requested alignment needs, a compensating one (alignment 0) absorbs
//! the difference between `offset` and `wanted_bias`. `MemPerm` nodes get
//! the current bias recorded for later frame indexing. Every other node is
//! delegated to the caller's simulation callback; a returned offset of 0
//! means the stack pointer was re-established from a frame pointer and
//! resets the wanted bias.

use cranelift_entity::SecondaryMap;
use tracing::debug;

use opal_ir::{Attr, ControlFlowGraph, Graph, NodeId, Opcode};

use crate::stack::round_up_misaligned;

/// Simulates the stack pointer over the whole graph. Each block is
/// visited once, in DFS order from the entry; `offset ≥ wanted_bias`
/// holds at every block end.
pub fn sim_stack_pointer(
    graph: &mut Graph,
    misalign: u32,
    p2align: u32,
    sim: &mut dyn FnMut(&Graph, NodeId, i32) -> i32,
) {
    let mut cfg = ControlFlowGraph::new();
    cfg.compute(graph);
    let Some(entry) = cfg.entry() else {
        return;
    };

    let mut visited = SecondaryMap::<NodeId, bool>::default();
    let mut stack = vec![(entry, 0i32, 0i32)];

    while let Some((block, mut offset, mut wanted_bias)) = stack.pop() {
        if visited[block] {
            continue;
        }
        visited[block] = true;

        let schedule: Vec<NodeId> = graph.schedule.iter(block).collect();
        for node in schedule {
            match graph.opcode(node) {
                Opcode::IncSp => {
                    let Attr::IncSp {
                        amount,
                        p2align: node_align,
                    } = graph.node(node).attr
                    else {
                        unreachable!("IncSp without its attribute")
                    };
                    let ofs = -amount;
                    let align = node_align.max(p2align);
                    if align > 0 {
                        // Fill in the real, aligned frame size.
                        debug_assert!(ofs >= 0);
                        let alignment = 1u32 << align;
                        let aligned =
                            round_up_misaligned((offset + ofs) as u32, alignment, misalign) as i32;
                        let slack = aligned - (offset + ofs);
                        if slack > 0 {
                            debug!(?node, slack, "padding IncSp for alignment");
                            graph.node_mut(node).attr = Attr::IncSp {
                                amount: -(ofs + slack),
                                p2align: node_align,
                            };
                            offset += slack;
                        }
                    } else {
                        // Make the adjustment land on the wanted bias.
                        let delta = wanted_bias - offset;
                        debug_assert!(delta <= 0);
                        if delta != 0 {
                            debug!(?node, delta, "compensating IncSp");
                            graph.node_mut(node).attr = Attr::IncSp {
                                amount: -(ofs + delta),
                                p2align: node_align,
                            };
                            offset += delta;
                        }
                    }
                    offset += ofs;
                    wanted_bias += ofs;
                }
                Opcode::MemPerm => {
                    graph.node_mut(node).attr = Attr::MemPerm {
                        entry_bias: Some(offset),
                    };
                }
                _ => {
                    let new_offset = sim(&*graph, node, offset);
                    wanted_bias = if new_offset == 0 {
                        0
                    } else {
                        wanted_bias + (new_offset - offset)
                    };
                    offset = new_offset;
                }
            }
        }

        assert!(offset >= wanted_bias);

        for &succ in cfg.succs_of(block) {
            if !visited[succ] {
                stack.push((succ, offset, wanted_bias));
            }
        }
    }
}
