//! Generic SSA reconstruction.
//!
//! Contract: given a set of nodes that all define "the same" value, insert
//! the phis the definition set requires (at the iterated dominance frontier
//! of the defining blocks) and rewrite users so that every use sees the
//! nearest dominating definition. The caller decides which users to fix —
//! typically the users of the original, single definition — and may
//! annotate the inserted phis afterwards (register requirements, spill
//! slot association).
//!
//! Within a block, definitions are ordered by schedule position; phis sit
//! before everything scheduled. A phi user searches from the end of the
//! incoming predecessor.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use opal_ir::{ControlFlowGraph, Graph, NodeId, Opcode};

use crate::domtree::{DomFrontiers, DomTree};

pub struct SsaReconstruction<'a> {
    domtree: &'a DomTree,
    df: &'a DomFrontiers,
    /// block -> definitions in it, kept sorted by schedule position.
    defs_in: FxHashMap<NodeId, SmallVec<[NodeId; 2]>>,
    def_set: FxHashSet<NodeId>,
    renumbered: FxHashSet<NodeId>,
    new_phis: Vec<NodeId>,
}

impl<'a> SsaReconstruction<'a> {
    pub fn new(domtree: &'a DomTree, df: &'a DomFrontiers) -> Self {
        Self {
            domtree,
            df,
            defs_in: FxHashMap::default(),
            def_set: FxHashSet::default(),
            renumbered: FxHashSet::default(),
            new_phis: Vec::new(),
        }
    }

    /// Registers `defs` as the definition set and inserts the phis it
    /// needs. Must be called exactly once, before fixing users.
    pub fn add_definitions(&mut self, graph: &mut Graph, defs: &[NodeId]) {
        debug_assert!(self.defs_in.is_empty());
        debug_assert!(!defs.is_empty());

        let mode = graph.mode(defs[0]);
        for &def in defs {
            let block = graph.block_of(def).expect("definition outside any block");
            self.defs_in.entry(block).or_default().push(def);
            self.def_set.insert(def);
        }

        // Iterated dominance frontier of the defining blocks.
        let mut phi_blocks = FxHashSet::default();
        let mut worklist: Vec<NodeId> = self.defs_in.keys().copied().collect();
        while let Some(block) = worklist.pop() {
            for &frontier in self.df.of(block) {
                if phi_blocks.insert(frontier) {
                    worklist.push(frontier);
                }
            }
        }

        // Placeholder phis first so that they act as definitions during
        // the input search below.
        let mut placed: Vec<(NodeId, NodeId)> = Vec::new();
        for block in sorted(phi_blocks) {
            let arity = graph.pred_blocks(block).len();
            let inputs = vec![defs[0]; arity];
            let phi = graph.make_phi(block, mode, &inputs);
            self.defs_in.entry(block).or_default().push(phi);
            self.new_phis.push(phi);
            placed.push((phi, block));
        }

        for (phi, block) in placed {
            let preds: SmallVec<[NodeId; 4]> = graph.pred_blocks(block).into();
            for (i, &pred) in preds.iter().enumerate() {
                let def = self.def_at_end(graph, pred);
                graph.set_input(phi, i, def);
            }
        }
    }

    /// Rewrites every user of `value` to the nearest dominating
    /// definition. `value` itself is usually part of the definition set.
    pub fn fix_users(&mut self, graph: &mut Graph, value: NodeId) {
        let users: Vec<NodeId> = graph.users(value).collect();
        for user in users {
            if self.new_phis.contains(&user) {
                // Inputs of the inserted phis are already correct.
                continue;
            }
            if user != value && self.def_set.contains(&user) && graph.opcode(user) == Opcode::Reload
            {
                // A reload that is itself a definition keeps its input:
                // that edge is its memory source, not a value use. Other
                // defining users (stack-pointer adjustments chaining the
                // previous definition) are rewired like any use.
                continue;
            }
            if matches!(graph.opcode(user), Opcode::End | Opcode::Keep) {
                // Keep-alive edges have no program point to search from;
                // stale ones are the caller's to clean up.
                continue;
            }
            let arity = graph.inputs(user).len();
            for idx in 0..arity {
                if graph.inputs(user)[idx] != value {
                    continue;
                }
                let def = if graph.is_phi(user) {
                    let block = graph.block_of(user).unwrap();
                    let pred = graph.pred_blocks(block)[idx];
                    self.def_at_end(graph, pred)
                } else {
                    self.def_before(graph, user)
                };
                if def != value {
                    graph.set_input(user, idx, def);
                }
            }
        }
    }

    /// The phis inserted by [`Self::add_definitions`].
    pub fn new_phis(&self) -> &[NodeId] {
        &self.new_phis
    }

    /// Nearest definition reaching the end of `block`.
    fn def_at_end(&mut self, graph: &mut Graph, block: NodeId) -> NodeId {
        self.search_def(graph, block, u32::MAX)
    }

    /// Nearest definition strictly before the scheduled `user`.
    fn def_before(&mut self, graph: &mut Graph, user: NodeId) -> NodeId {
        debug_assert!(graph.schedule.is_scheduled(user));
        let block = graph.schedule.block_of(user);
        self.renumber(graph, block);
        let step = graph.schedule.step_of(user);
        self.search_def(graph, block, step)
    }

    /// Walks the dominator tree from `block`, looking for the latest
    /// definition at a position < `before_step` (phis are at step 0).
    fn search_def(&mut self, graph: &mut Graph, block: NodeId, before_step: u32) -> NodeId {
        let mut cur = block;
        let mut limit = before_step;
        loop {
            self.renumber(graph, cur);
            if let Some(defs) = self.defs_in.get(&cur) {
                let best = defs
                    .iter()
                    .copied()
                    .map(|def| (def_step(graph, def), def))
                    .filter(|&(step, _)| step < limit)
                    .max_by_key(|&(step, _)| step);
                if let Some((_, def)) = best {
                    return def;
                }
            }
            cur = self
                .domtree
                .idom_of(cur)
                .expect("no reaching definition for use");
            limit = u32::MAX;
        }
    }

    fn renumber(&mut self, graph: &mut Graph, block: NodeId) {
        if self.renumbered.insert(block) {
            graph.schedule.renumber(block);
        }
    }
}

fn def_step(graph: &Graph, def: NodeId) -> u32 {
    if graph.schedule.is_scheduled(def) {
        graph.schedule.step_of(def)
    } else {
        // Phis (and other floating definitions) sit before the schedule.
        0
    }
}

fn sorted(set: FxHashSet<NodeId>) -> Vec<NodeId> {
    let mut v: Vec<_> = set.into_iter().collect();
    v.sort_unstable();
    v
}

/// Convenience entry: compute dominance info for `graph`, register `defs`,
/// fix the users of `value`, and return the inserted phis.
pub fn reconstruct_value(
    graph: &mut Graph,
    cfg: &ControlFlowGraph,
    value: NodeId,
    defs: &[NodeId],
) -> Vec<NodeId> {
    let mut domtree = DomTree::new();
    domtree.compute(cfg);
    let df = domtree.compute_df(cfg);

    let mut ssa = SsaReconstruction::new(&domtree, &df);
    ssa.add_definitions(graph, defs);
    ssa.fix_users(graph, value);
    ssa.new_phis
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{builder::test_util::test_bank, builder::GraphBuilder, Mode};

    #[test]
    fn diamond_redefinition_gets_a_phi() {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        let v = b.op_in_class(gp, Mode::I32, &[]);
        b.branch(v);

        let left = b.block(&[entry]);
        b.switch_to_block(left);
        let redef = b.op_in_class(gp, Mode::I32, &[]);
        b.jump();

        let right = b.block(&[entry]);
        b.switch_to_block(right);
        b.jump();

        let merge = b.block(&[left, right]);
        b.switch_to_block(merge);
        let use_site = b.op_in_class(gp, Mode::I32, &[v]);
        b.ret(None);

        let mut graph = b.finish();
        let mut cfg = ControlFlowGraph::new();
        cfg.compute(&graph);

        let phis = reconstruct_value(&mut graph, &cfg, v, &[v, redef]);

        assert_eq!(phis.len(), 1);
        let phi = phis[0];
        assert_eq!(graph.block_of(phi), Some(merge));

        // The phi merges the redefinition from the left and the original
        // from the right, in predecessor order.
        assert_eq!(graph.inputs(phi), &[redef, v]);
        assert_eq!(graph.inputs(use_site), &[phi]);
    }

    #[test]
    fn same_block_use_picks_latest_def() {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let _entry = b.entry_block();
        let v = b.op_in_class(gp, Mode::I32, &[]);
        let between = b.op_in_class(gp, Mode::I32, &[v]);
        let redef = b.op_in_class(gp, Mode::I32, &[]);
        let after = b.op_in_class(gp, Mode::I32, &[v]);
        b.ret(None);

        let mut graph = b.finish();
        let mut cfg = ControlFlowGraph::new();
        cfg.compute(&graph);

        let phis = reconstruct_value(&mut graph, &cfg, v, &[v, redef]);
        assert!(phis.is_empty());

        // The use before the redefinition keeps the original; the one
        // after it is rewired.
        assert_eq!(graph.inputs(between), &[v]);
        assert_eq!(graph.inputs(after), &[redef]);
    }

    #[test]
    fn loop_redefinition_inserts_header_phi() {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        let v = b.op_in_class(gp, Mode::I32, &[]);
        b.jump();

        let header = b.block(&[entry]);
        let body = b.block(&[header]);
        b.graph.add_block_pred(header, body);
        let exit = b.block(&[header]);

        b.switch_to_block(header);
        b.branch(v);

        b.switch_to_block(body);
        let redef = b.op_in_class(gp, Mode::I32, &[]);
        b.jump();

        b.switch_to_block(exit);
        let use_site = b.op_in_class(gp, Mode::I32, &[v]);
        b.ret(None);

        let mut graph = b.finish();
        let mut cfg = ControlFlowGraph::new();
        cfg.compute(&graph);

        let phis = reconstruct_value(&mut graph, &cfg, v, &[v, redef]);

        assert_eq!(phis.len(), 1);
        let phi = phis[0];
        assert_eq!(graph.block_of(phi), Some(header));
        assert_eq!(graph.inputs(phi), &[v, redef]);

        // Both the branch in the header and the use in the exit see the
        // phi now.
        assert_eq!(graph.inputs(use_site), &[phi]);
    }
}
