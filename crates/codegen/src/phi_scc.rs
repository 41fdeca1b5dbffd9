//! Removal of redundant phi SCCs.
//!
//! Cycles of phis whose combined external input is a single value are
//! semantically that value; every phi in such a cycle is replaced by it.
//! One Tarjan pass is not enough: removing the rim of a non-redundant SCC
//! can expose smaller redundant SCCs nested in its interior, so discovered
//! SCCs go through a work queue and interiors are re-seeded with a bumped
//! iteration id instead of running the whole pass to a fixpoint.
//! (See "Simple and Efficient Construction of Static Single Assignment
//! Form", Braun et al., for the underlying observation.)

use std::collections::VecDeque;

use cranelift_entity::SecondaryMap;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace};

use opal_ir::{Graph, NodeId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhiSccError {
    /// A phi cycle without any external input is malformed IR.
    #[error("completely isolated phi cycle")]
    IsolatedPhiCycle,
}

/// Runs the pass. The graph is only mutated when no error occurs.
pub fn remove_unnecessary_phi_sccs(graph: &mut Graph) -> Result<(), PhiSccError> {
    let mut env = SccEnv::default();

    for node in graph.iter_nodes() {
        env.find_scc_at(graph, node, 0);
    }

    while let Some(scc) = env.queue.pop_front() {
        env.evaluate(graph, scc)?;
    }

    env.rewire(graph);
    Ok(())
}

#[derive(Clone, Default)]
struct SccInfo {
    dfn: u32,
    uplink: u32,
    /// Iteration id; nodes fall off the walk once the current id passes
    /// theirs (rim nodes of evaluated SCCs).
    scc_id: u32,
    in_stack: bool,
}

#[derive(Default)]
struct SccEnv {
    infos: SecondaryMap<NodeId, SccInfo>,
    stack: Vec<NodeId>,
    next_dfn: u32,
    queue: VecDeque<Vec<NodeId>>,
    /// node -> replacement; resolved to its fixed point on every lookup
    /// because earlier rewrites are not materialized until the end.
    replacements: FxHashMap<NodeId, NodeId>,
    current_id: u32,
}

impl SccEnv {
    /// A node takes part in the SCC walk iff it is a phi, not marked as a
    /// loop-carry keeper, and not excluded by an earlier iteration.
    fn is_removable(&self, graph: &Graph, node: NodeId, id: u32) -> bool {
        graph.is_phi(node) && !graph.is_loop_keep_phi(node) && self.infos[node].scc_id >= id
    }

    fn canonical(&self, mut node: NodeId) -> NodeId {
        while let Some(&replacement) = self.replacements.get(&node) {
            node = replacement;
        }
        node
    }

    /// Tarjan rooted at `node`, restricted to removable phis; non-phi
    /// predecessors are SCC boundaries. Discovered SCCs of size > 1 are
    /// pushed onto the work queue in the reverse topological order the
    /// algorithm produces them in.
    fn find_scc_at(&mut self, graph: &Graph, node: NodeId, id: u32) {
        if !self.is_removable(graph, node, id) || self.infos[node].dfn != 0 {
            return;
        }

        let mut frames = vec![self.open(node)];

        while !frames.is_empty() {
            let top = frames.len() - 1;
            let n = frames[top].node;
            if frames[top].input_idx < graph.inputs(n).len() {
                let raw = graph.inputs(n)[frames[top].input_idx];
                frames[top].input_idx += 1;

                let pred = self.canonical(raw);
                if !self.is_removable(graph, pred, id) {
                    continue;
                }
                if self.infos[pred].dfn == 0 {
                    frames.push(self.open(pred));
                } else if self.infos[pred].in_stack {
                    let dfn = self.infos[pred].dfn;
                    let info = &mut self.infos[n];
                    info.uplink = info.uplink.min(dfn);
                }
            } else {
                frames.pop();
                if self.infos[n].dfn == self.infos[n].uplink {
                    self.pop_scc(n);
                }
                if let Some(parent) = frames.last() {
                    let uplink = self.infos[n].uplink;
                    let parent_info = &mut self.infos[parent.node];
                    parent_info.uplink = parent_info.uplink.min(uplink);
                }
            }
        }
    }

    fn open(&mut self, node: NodeId) -> Frame {
        self.next_dfn += 1;
        let info = &mut self.infos[node];
        info.dfn = self.next_dfn;
        info.uplink = self.next_dfn;
        info.in_stack = true;
        self.stack.push(node);
        Frame {
            node,
            input_idx: 0,
        }
    }

    fn pop_scc(&mut self, root: NodeId) {
        let mut scc = Vec::new();
        loop {
            let n = self.stack.pop().unwrap();
            self.infos[n].in_stack = false;
            scc.push(n);
            if n == root {
                break;
            }
        }
        // Trivial phis are excluded by construction; their removal is a
        // prerequisite handled by the surrounding compiler.
        if scc.len() > 1 {
            trace!(size = scc.len(), "phi scc discovered");
            self.queue.push_back(scc);
        }
    }

    /// Decides the fate of one SCC: map everything to the unique external
    /// predecessor, or drop the rim and re-seed the interior.
    fn evaluate(&mut self, graph: &Graph, scc: Vec<NodeId>) -> Result<(), PhiSccError> {
        let in_scc: FxHashSet<NodeId> = scc.iter().copied().collect();

        let mut externals: SmallVec<[NodeId; 2]> = SmallVec::new();
        let mut unique_pred = None;
        let mut interior: SmallVec<[NodeId; 4]> = SmallVec::new();

        for &n in &scc {
            let mut eligible = true;
            for &raw in graph.inputs(n) {
                let pred = self.canonical(raw);
                if pred == n {
                    // Self loops say nothing about redundancy.
                    continue;
                }
                if !in_scc.contains(&pred) {
                    if !externals.contains(&pred) {
                        externals.push(pred);
                    }
                    // Incidental tie-break: the last external predecessor
                    // wins. The value only matters on the redundant path,
                    // where it is unambiguous anyway.
                    unique_pred = Some(pred);
                    eligible = false;
                }
            }
            if eligible {
                interior.push(n);
            }
        }

        match externals.len() {
            0 => Err(PhiSccError::IsolatedPhiCycle),
            1 => {
                let pred = unique_pred.expect("one external implies a predecessor");
                debug!(scc_size = scc.len(), "redundant phi scc");
                for n in scc {
                    self.replacements.insert(n, pred);
                }
                Ok(())
            }
            _ => {
                // The rim keeps its old id and becomes a boundary; the
                // interior is searched again for nested SCCs.
                self.current_id += 1;
                let id = self.current_id;
                for &n in &interior {
                    let info = &mut self.infos[n];
                    info.scc_id = id;
                    info.dfn = 0;
                }
                for &n in &interior {
                    self.find_scc_at(graph, n, id);
                }
                Ok(())
            }
        }
    }

    /// Materializes the replacement map: every input edge pointing at a
    /// mapped node is redirected to its canonical value. Unreachable phis
    /// are left behind for downstream pruning.
    fn rewire(&mut self, graph: &mut Graph) {
        let mapped: Vec<NodeId> = self.replacements.keys().copied().collect();
        for node in mapped {
            let replacement = self.canonical(node);
            let users: Vec<NodeId> = graph.users(node).collect();
            for user in users {
                let arity = graph.inputs(user).len();
                for idx in 0..arity {
                    if graph.inputs(user)[idx] == node {
                        graph.set_input(user, idx, replacement);
                    }
                }
            }
        }
    }
}

struct Frame {
    node: NodeId,
    input_idx: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{builder::test_util::test_bank, builder::GraphBuilder, Attr, Mode, NodeId};

    /// entry -> header <-> latch, with a two-phi cycle in the header.
    fn two_phi_cycle(cross_input: impl FnOnce(&mut GraphBuilder, NodeId) -> NodeId) -> TestGraph {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        let x = b.op_in_class(gp, Mode::I32, &[]);
        let second = cross_input(&mut b, x);
        b.jump();

        let latch = b.block(&[]);
        let header = b.block(&[entry, latch]);
        // Pre-create the latch edge before the phis exist.
        b.graph.add_block_pred(latch, header);

        // p1 = phi(x, p2); p2 = phi(p1, second) — built with temporary
        // self inputs, then tied together.
        let p1 = b.phi_in_class(header, gp, Mode::I32, &[x, x]);
        let p2 = b.phi_in_class(header, gp, Mode::I32, &[p1, second]);
        b.graph.set_input(p1, 1, p2);

        b.switch_to_block(header);
        let consumer = b.op_in_class(gp, Mode::I32, &[p1]);
        let consumer2 = b.op_in_class(gp, Mode::I32, &[p2]);
        b.ret(None);

        TestGraph {
            graph: b.finish(),
            x,
            p1,
            p2,
            consumer,
            consumer2,
        }
    }

    struct TestGraph {
        graph: opal_ir::Graph,
        x: NodeId,
        p1: NodeId,
        p2: NodeId,
        consumer: NodeId,
        consumer2: NodeId,
    }

    #[test]
    fn redundant_cycle_collapses_to_its_input() {
        let mut t = two_phi_cycle(|_, x| x);

        remove_unnecessary_phi_sccs(&mut t.graph).unwrap();

        assert_eq!(t.graph.inputs(t.consumer), &[t.x]);
        assert_eq!(t.graph.inputs(t.consumer2), &[t.x]);
        // The phis themselves now only reference the replacement.
        assert_eq!(t.graph.inputs(t.p1), &[t.x, t.x]);
        assert_eq!(t.graph.inputs(t.p2), &[t.x, t.x]);
        assert_eq!(t.graph.users_num(t.p1), 0);
        assert_eq!(t.graph.users_num(t.p2), 0);
    }

    #[test]
    fn two_external_inputs_keep_the_cycle() {
        let mut t = two_phi_cycle(|b, _x| b.op(Mode::I32, &[]));

        remove_unnecessary_phi_sccs(&mut t.graph).unwrap();

        assert_eq!(t.graph.inputs(t.consumer), &[t.p1]);
        assert_eq!(t.graph.inputs(t.consumer2), &[t.p2]);
    }

    #[test]
    fn loop_keep_phi_is_a_boundary() {
        let mut t = two_phi_cycle(|_, x| x);
        t.graph.node_mut(t.p1).attr = Attr::Phi { loop_keep: true };

        remove_unnecessary_phi_sccs(&mut t.graph).unwrap();

        // p1 blocks the walk, p2 alone is trivial: nothing changes.
        assert_eq!(t.graph.inputs(t.consumer), &[t.p1]);
        assert_eq!(t.graph.inputs(t.consumer2), &[t.p2]);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut t = two_phi_cycle(|_, x| x);

        remove_unnecessary_phi_sccs(&mut t.graph).unwrap();
        let consumer_inputs: Vec<_> = t.graph.inputs(t.consumer).to_vec();
        let p1_inputs: Vec<_> = t.graph.inputs(t.p1).to_vec();

        remove_unnecessary_phi_sccs(&mut t.graph).unwrap();
        assert_eq!(t.graph.inputs(t.consumer), &consumer_inputs[..]);
        assert_eq!(t.graph.inputs(t.p1), &p1_inputs[..]);
    }

    #[test]
    fn isolated_cycle_is_rejected() {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        b.jump();
        let latch = b.block(&[]);
        let header = b.block(&[entry, latch]);
        b.graph.add_block_pred(latch, header);

        // p1 = phi(p2, p2); p2 = phi(p1, p1): no external input at all.
        let p1 = b.phi_in_class(header, gp, Mode::I32, &[header, header]);
        let p2 = b.phi_in_class(header, gp, Mode::I32, &[p1, p1]);
        b.graph.set_input(p1, 0, p2);
        b.graph.set_input(p1, 1, p2);

        assert_eq!(
            remove_unnecessary_phi_sccs(&mut b.graph),
            Err(PhiSccError::IsolatedPhiCycle)
        );
    }

    #[test]
    fn nested_interior_collapses_after_rim_removal() {
        let (_bank, gp, _sp) = test_bank(4);
        let mut b = GraphBuilder::new();

        let entry = b.entry_block();
        let x = b.op_in_class(gp, Mode::I32, &[]);
        let y = b.op_in_class(gp, Mode::I32, &[]);
        b.jump();

        let latch = b.block(&[]);
        let header = b.block(&[entry, latch]);
        b.graph.add_block_pred(latch, header);

        // r1 = phi(x, r2)   rim, external x
        // r2 = phi(y, i1)   rim, external y
        // i1 = phi(r1, i2)  interior
        // i2 = phi(i1, i1)  interior
        // The interior {i1, i2} only sees r1 from outside itself, so it
        // collapses to r1 once the rim is peeled off.
        let r1 = b.phi_in_class(header, gp, Mode::I32, &[x, x]);
        let r2 = b.phi_in_class(header, gp, Mode::I32, &[y, y]);
        let i1 = b.phi_in_class(header, gp, Mode::I32, &[r1, r1]);
        let i2 = b.phi_in_class(header, gp, Mode::I32, &[i1, i1]);
        b.graph.set_input(r1, 1, r2);
        b.graph.set_input(r2, 1, i1);
        b.graph.set_input(i1, 1, i2);

        b.switch_to_block(header);
        let use_i1 = b.op_in_class(gp, Mode::I32, &[i1]);
        let use_i2 = b.op_in_class(gp, Mode::I32, &[i2]);
        let use_r2 = b.op_in_class(gp, Mode::I32, &[r2]);
        b.ret(None);

        let mut graph = b.finish();
        remove_unnecessary_phi_sccs(&mut graph).unwrap();

        // The interior phis are gone, replaced by r1.
        assert_eq!(graph.inputs(use_i1), &[r1]);
        assert_eq!(graph.inputs(use_i2), &[r1]);
        // The rim survives, rewired through the replacement.
        assert_eq!(graph.inputs(use_r2), &[r2]);
        assert_eq!(graph.inputs(r2), &[y, r1]);
        assert_eq!(graph.inputs(r1), &[x, r2]);
    }
}
