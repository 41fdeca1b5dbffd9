//! Stack-pointer SSA reconstruction.
//!
//! After layout and bias simulation many nodes define the stack pointer.
//! Collect them, let the SSA reconstructor insert the phis and rewire the
//! users to the dominating definition, annotate the new phis with the SP
//! requirement, then drop keep edges on SP producers that ended up
//! without users.

use tracing::debug;

use opal_ir::{ControlFlowGraph, Graph, Mode, NodeId, RegId, RegisterBank};

use crate::domtree::DomTree;
use crate::ssa::SsaReconstruction;

pub fn fix_stack_nodes(graph: &mut Graph, bank: &RegisterBank, sp: RegId) {
    let sp_nodes: Vec<NodeId> = graph
        .iter_nodes()
        .filter(|&node| {
            graph.mode(node) != Mode::Tuple && graph.reg_info(node).reg.expand() == Some(sp)
        })
        .collect();

    // Nothing to be done without any definition; in fact we must not
    // continue, endless loops may have elided the keep edges already.
    if sp_nodes.is_empty() {
        return;
    }
    debug!(count = sp_nodes.len(), "rewiring stack pointer definitions");

    let mut cfg = ControlFlowGraph::new();
    cfg.compute(graph);
    let mut domtree = DomTree::new();
    domtree.compute(&cfg);
    let df = domtree.compute_df(&cfg);

    let mut ssa = SsaReconstruction::new(&domtree, &df);
    ssa.add_definitions(graph, &sp_nodes);
    for &node in &sp_nodes {
        ssa.fix_users(graph, node);
    }

    let sp_class = bank.reg(sp).class;
    for &phi in ssa.new_phis() {
        graph.set_reg_class(phi, sp_class);
        graph.set_reg(phi, sp);
    }

    // With frame pointers the last SP producers often only survive
    // through their keep edge; remove those edges and the orphaned
    // producers with them.
    let Some(end) = graph.end() else {
        return;
    };
    let mut idx = graph.inputs(end).len();
    while idx > 0 {
        idx -= 1;
        let input = graph.inputs(end)[idx];
        if graph.mode(input) == Mode::Tuple || graph.reg_info(input).reg.expand() != Some(sp) {
            continue;
        }
        graph.remove_input(end, idx);
        if graph.users_num(input) == 0 {
            if graph.schedule.is_scheduled(input) {
                graph.schedule.remove(input);
            }
            graph.kill_node(input);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{builder::test_util::test_bank, builder::GraphBuilder, Mode};

    #[test]
    fn diverging_definitions_are_merged_by_a_phi() {
        let (bank, _gp, sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        let sp0 = b.incsp(None, -16, 2);
        b.set_reg(sp0, sp);
        b.jump();

        let left = b.block(&[entry]);
        b.switch_to_block(left);
        let sp1 = b.incsp(Some(sp0), -8, 0);
        b.set_reg(sp1, sp);
        b.jump();

        let right = b.block(&[entry]);
        b.switch_to_block(right);
        let sp2 = b.incsp(Some(sp0), -24, 0);
        b.set_reg(sp2, sp);
        b.jump();

        let merge = b.block(&[left, right]);
        b.switch_to_block(merge);
        // Still refers to the entry SP; the reconstruction must reroute
        // it through a phi of the two adjusted pointers.
        let sp_use = b.op(Mode::Ptr, &[sp0]);
        b.ret(None);

        let mut graph = b.finish();
        fix_stack_nodes(&mut graph, &bank, sp);

        let merged = graph.inputs(sp_use)[0];
        assert!(graph.is_phi(merged));
        assert_eq!(graph.block_of(merged), Some(merge));
        assert_eq!(graph.inputs(merged), &[sp1, sp2]);

        // The phi carries the SP requirement and assignment.
        assert_eq!(graph.reg_info(merged).reg.expand(), Some(sp));
        assert_eq!(
            graph.reg_info(merged).class.expand(),
            Some(bank.reg(sp).class)
        );

        // The adjustments themselves still chain off the entry SP.
        assert_eq!(graph.inputs(sp1), &[sp0]);
        assert_eq!(graph.inputs(sp2), &[sp0]);
    }

    #[test]
    fn orphaned_sp_keeps_are_removed() {
        let (bank, _gp, sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        b.entry_block();
        let sp0 = b.incsp(None, -16, 2);
        b.set_reg(sp0, sp);
        let dead = b.incsp(Some(sp0), 16, 0);
        b.set_reg(dead, sp);
        b.ret(None);
        let end = b.keep_alive(dead);

        let mut graph = b.finish();
        assert!(graph.schedule.is_scheduled(dead));

        fix_stack_nodes(&mut graph, &bank, sp);

        // The keep edge is gone and the producer with it.
        assert!(graph.inputs(end).is_empty());
        assert!(!graph.schedule.is_scheduled(dead));
        assert!(graph.inputs(dead).is_empty());

        // sp0 is still referenced by nothing but stays in the arena.
        assert_eq!(graph.users_num(sp0), 0);
    }

    #[test]
    fn no_sp_nodes_is_a_silent_no_op() {
        let (bank, gp, sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        b.entry_block();
        let v = b.op_in_class(gp, Mode::I32, &[]);
        b.ret(Some(v));

        let mut graph = b.finish();
        fix_stack_nodes(&mut graph, &bank, sp);

        assert_eq!(graph.inputs(v), &[] as &[NodeId]);
    }
}
