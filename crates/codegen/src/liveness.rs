//! Liveness of register-relevant values, per block.
//!
//! Computed by backward path exploration from uses: starting at every use,
//! the CFG is traversed backwards until the definition is reached, marking
//! the value live-in and live-out along the way (Appel's formulation).
//!
//! A phi input counts as a use by the associated predecessor block, not by
//! the block containing the phi; a phi result is live-in for its own block
//! but live-out of no predecessor. `Unknown` values are never live: they
//! are available everywhere by convention.

use cranelift_entity::SecondaryMap;
use opal_ir::{ControlFlowGraph, Graph, NodeId, Opcode};

use crate::bitset::BitSet;

#[derive(Default)]
pub struct Liveness {
    live_ins: SecondaryMap<NodeId, BitSet<NodeId>>,
    live_outs: SecondaryMap<NodeId, BitSet<NodeId>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&mut self, graph: &Graph, cfg: &ControlFlowGraph) {
        self.clear();

        for block in cfg.post_order() {
            for node in graph.schedule.iter(block) {
                for &value in graph.inputs(node) {
                    if tracked(graph, value) {
                        self.up_and_mark(graph, cfg, block, value);
                    }
                }
            }
            for &phi in graph.phis_of(block) {
                for (i, &value) in graph.inputs(phi).iter().enumerate() {
                    if tracked(graph, value) {
                        let pred = graph.pred_blocks(block)[i];
                        self.up_and_mark(graph, cfg, pred, value);
                    }
                }
            }
        }
    }

    pub fn live_ins(&self, block: NodeId) -> &BitSet<NodeId> {
        &self.live_ins[block]
    }

    pub fn live_outs(&self, block: NodeId) -> &BitSet<NodeId> {
        &self.live_outs[block]
    }

    pub fn is_live_in(&self, block: NodeId, value: NodeId) -> bool {
        self.live_ins[block].contains(value)
    }

    pub fn is_live_out(&self, block: NodeId, value: NodeId) -> bool {
        self.live_outs[block].contains(value)
    }

    pub fn clear(&mut self) {
        self.live_ins.clear();
        self.live_outs.clear();
    }

    /// Propagate liveness of `value` upward from a use in `block`.
    fn up_and_mark(
        &mut self,
        graph: &Graph,
        cfg: &ControlFlowGraph,
        block: NodeId,
        value: NodeId,
    ) {
        let def_block = graph.block_of(value);

        // An ordinary definition in this block ends the path.
        if def_block == Some(block) && !graph.is_phi(value) {
            return;
        }

        if self.live_ins[block].contains(value) {
            // Already marked, so propagation to the preds happened too.
            return;
        }
        self.live_ins[block].insert(value);

        // A phi result is live-in for its block but live-out of no
        // predecessor.
        if def_block == Some(block) {
            return;
        }

        for &pred in cfg.preds_of(block) {
            self.live_outs[pred].insert(value);
            self.up_and_mark(graph, cfg, pred, value);
        }
    }
}

fn tracked(graph: &Graph, value: NodeId) -> bool {
    graph.opcode(value) != Opcode::Unknown && graph.reg_info(value).class.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{builder::test_util::test_bank, builder::GraphBuilder, Mode};

    #[test]
    fn straight_line_liveness() {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        let v0 = b.op_in_class(gp, Mode::I32, &[]);
        b.jump();

        let next = b.block(&[entry]);
        b.switch_to_block(next);
        b.op_in_class(gp, Mode::I32, &[v0]);
        b.ret(None);

        let graph = b.finish();
        let mut cfg = ControlFlowGraph::new();
        cfg.compute(&graph);
        let mut live = Liveness::new();
        live.compute(&graph, &cfg);

        assert!(!live.is_live_in(entry, v0));
        assert!(live.is_live_out(entry, v0));
        assert!(live.is_live_in(next, v0));
        assert!(!live.is_live_out(next, v0));
    }

    #[test]
    fn phi_input_is_a_use_in_the_pred() {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        let v0 = b.op_in_class(gp, Mode::I32, &[]);
        b.jump();

        let left = b.block(&[entry]);
        b.switch_to_block(left);
        let v1 = b.op_in_class(gp, Mode::I32, &[]);
        b.jump();

        let right = b.block(&[entry]);
        b.switch_to_block(right);
        let v2 = b.op_in_class(gp, Mode::I32, &[v0]);
        b.jump();

        let merge = b.block(&[left, right]);
        let phi = b.phi_in_class(merge, gp, Mode::I32, &[v1, v2]);
        b.switch_to_block(merge);
        b.op_in_class(gp, Mode::I32, &[phi]);
        b.ret(None);

        let graph = b.finish();
        let mut cfg = ControlFlowGraph::new();
        cfg.compute(&graph);
        let mut live = Liveness::new();
        live.compute(&graph, &cfg);

        // v1/v2 are used by their preds, not by the merge block.
        assert!(!live.is_live_in(merge, v1));
        assert!(!live.is_live_in(merge, v2));
        assert!(!live.is_live_out(left, v1));
        assert!(!live.is_live_out(right, v2));

        // The phi result is live-in for the merge block only.
        assert!(live.is_live_in(merge, phi));
        assert!(!live.is_live_out(left, phi));

        // v0 is live through to the right block.
        assert!(live.is_live_out(entry, v0));
        assert!(live.is_live_in(right, v0));
        assert!(!live.is_live_in(left, v0));
    }

    #[test]
    fn loop_carried_value_is_live_through() {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        let v0 = b.op_in_class(gp, Mode::I32, &[]);
        b.jump();

        let header = b.block(&[entry]);
        let body = b.block(&[header]);
        b.graph.add_block_pred(header, body);
        let exit = b.block(&[header]);

        b.switch_to_block(header);
        b.branch(v0);

        b.switch_to_block(body);
        b.op_in_class(gp, Mode::I32, &[v0]);
        b.jump();

        b.switch_to_block(exit);
        b.ret(Some(v0));

        let graph = b.finish();
        let mut cfg = ControlFlowGraph::new();
        cfg.compute(&graph);
        let mut live = Liveness::new();
        live.compute(&graph, &cfg);

        for block in [header, body, exit] {
            assert!(live.is_live_in(block, v0));
        }
        assert!(live.is_live_out(header, v0));
        assert!(live.is_live_out(body, v0));
    }
}
