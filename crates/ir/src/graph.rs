//! The Opal IR graph: an arena of nodes with a maintained reverse users
//! index, per-node backend info, per-block phi lists, the schedule and the
//! function frame.
//!
//! Nodes are owned by the graph and never freed; passes mutate edges and
//! attributes but keep handles stable. Pass-private annotations live in
//! pass-local side tables keyed by [`NodeId`], not in the graph.

use std::collections::BTreeSet;

use cranelift_entity::{packed_option::PackedOption, PrimaryMap, SecondaryMap};

use crate::{
    frame::FrameType,
    node::{Attr, Mode, NodeData, NodeId, Opcode},
    reg::{RegClassId, RegId, RegInfo},
    schedule::Schedule,
};

pub struct Graph {
    nodes: PrimaryMap<NodeId, NodeData>,
    users: SecondaryMap<NodeId, BTreeSet<NodeId>>,
    reg_info: SecondaryMap<NodeId, RegInfo>,
    /// block -> phis belonging to it.
    phis: SecondaryMap<NodeId, Vec<NodeId>>,
    pub schedule: Schedule,
    pub frame: FrameType,
    entry: PackedOption<NodeId>,
    end: PackedOption<NodeId>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            users: SecondaryMap::new(),
            reg_info: SecondaryMap::new(),
            phis: SecondaryMap::new(),
            schedule: Schedule::new(),
            frame: FrameType::new(),
            entry: None.into(),
            end: None.into(),
        }
    }

    pub fn make_node(&mut self, data: NodeData) -> NodeId {
        let node = self.nodes.push(data);
        for i in 0..self.nodes[node].inputs.len() {
            let input = self.nodes[node].inputs[i];
            self.users[input].insert(node);
        }
        node
    }

    pub fn make_block(&mut self, preds: &[NodeId]) -> NodeId {
        debug_assert!(preds.iter().all(|&p| self.opcode(p) == Opcode::Block));
        self.make_node(NodeData::new(Opcode::Block, Mode::Ctrl, preds))
    }

    /// Creates a phi in `block`. The `i`-th input flows in over the `i`-th
    /// control predecessor.
    pub fn make_phi(&mut self, block: NodeId, mode: Mode, inputs: &[NodeId]) -> NodeId {
        debug_assert_eq!(self.opcode(block), Opcode::Block);
        debug_assert_eq!(inputs.len(), self.inputs(block).len());

        let data = NodeData::new(Opcode::Phi, mode, inputs)
            .with_attr(Attr::Phi { loop_keep: false });
        let phi = self.make_node(data);
        self.nodes[phi].block = block.into();
        self.phis[block].push(phi);
        phi
    }

    pub fn node(&self, node: NodeId) -> &NodeData {
        &self.nodes[node]
    }

    pub fn node_mut(&mut self, node: NodeId) -> &mut NodeData {
        &mut self.nodes[node]
    }

    pub fn opcode(&self, node: NodeId) -> Opcode {
        self.nodes[node].opcode
    }

    pub fn mode(&self, node: NodeId) -> Mode {
        self.nodes[node].mode
    }

    pub fn inputs(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].inputs
    }

    /// The block a node belongs to; `None` for blocks themselves and for
    /// floating nodes.
    pub fn block_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].block.expand()
    }

    pub fn set_block(&mut self, node: NodeId, block: NodeId) {
        debug_assert_eq!(self.opcode(block), Opcode::Block);
        self.nodes[node].block = block.into();
    }

    pub fn is_phi(&self, node: NodeId) -> bool {
        self.opcode(node) == Opcode::Phi
    }

    pub fn is_loop_keep_phi(&self, node: NodeId) -> bool {
        matches!(self.nodes[node].attr, Attr::Phi { loop_keep: true })
    }

    /// Control predecessors of a block, in edge order. Phi input `i`
    /// corresponds to `pred_blocks(block)[i]`.
    pub fn pred_blocks(&self, block: NodeId) -> &[NodeId] {
        debug_assert_eq!(self.opcode(block), Opcode::Block);
        self.inputs(block)
    }

    pub fn add_block_pred(&mut self, block: NodeId, pred: NodeId) {
        debug_assert_eq!(self.opcode(block), Opcode::Block);
        debug_assert_eq!(self.opcode(pred), Opcode::Block);
        debug_assert!(self.phis_of(block).is_empty(), "phis would lose arity");
        self.nodes[block].inputs.push(pred);
        self.users[pred].insert(block);
    }

    pub fn phis_of(&self, block: NodeId) -> &[NodeId] {
        &self.phis[block]
    }

    /// Redirects the `idx`-th input of `node` to `new`, keeping the users
    /// index in sync.
    pub fn set_input(&mut self, node: NodeId, idx: usize, new: NodeId) {
        let old = self.nodes[node].inputs[idx];
        if old == new {
            return;
        }
        self.nodes[node].inputs[idx] = new;
        if !self.nodes[node].inputs.contains(&old) {
            self.users[old].remove(&node);
        }
        self.users[new].insert(node);
    }

    /// Removes the `idx`-th input of `node`, shifting the rest down. Only
    /// meaningful for keep-style input lists (`End`, `Keep`).
    pub fn remove_input(&mut self, node: NodeId, idx: usize) {
        debug_assert!(matches!(self.opcode(node), Opcode::End | Opcode::Keep));
        let old = self.nodes[node].inputs.remove(idx);
        if !self.nodes[node].inputs.contains(&old) {
            self.users[old].remove(&node);
        }
    }

    pub fn users(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.users[node].iter().copied()
    }

    pub fn users_num(&self, node: NodeId) -> usize {
        self.users[node].len()
    }

    /// Disconnects `node` from everything it uses. The arena slot stays;
    /// the node simply becomes unreachable.
    pub fn kill_node(&mut self, node: NodeId) {
        debug_assert_eq!(self.users_num(node), 0, "killing a node that is in use");
        while let Some(&input) = self.nodes[node].inputs.last() {
            self.nodes[node].inputs.pop();
            if !self.nodes[node].inputs.contains(&input) {
                self.users[input].remove(&node);
            }
        }
        if self.is_phi(node) {
            if let Some(block) = self.block_of(node) {
                self.phis[block].retain(|&p| p != node);
            }
        }
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys()
    }

    pub fn entry(&self) -> Option<NodeId> {
        self.entry.expand()
    }

    pub fn set_entry(&mut self, block: NodeId) {
        debug_assert_eq!(self.opcode(block), Opcode::Block);
        self.entry = block.into();
    }

    pub fn end(&self) -> Option<NodeId> {
        self.end.expand()
    }

    /// Adds a keep-alive edge for `node`, creating the end node on first
    /// use.
    pub fn add_keep(&mut self, node: NodeId) -> NodeId {
        match self.end() {
            Some(end) => {
                self.nodes[end].inputs.push(node);
                self.users[node].insert(end);
                end
            }
            None => {
                let end = self.make_node(NodeData::new(Opcode::End, Mode::Ctrl, &[node]));
                self.set_end(end);
                end
            }
        }
    }

    pub fn set_end(&mut self, end: NodeId) {
        debug_assert_eq!(self.opcode(end), Opcode::End);
        self.end = end.into();
    }

    pub fn reg_info(&self, node: NodeId) -> RegInfo {
        self.reg_info[node]
    }

    pub fn set_reg_class(&mut self, node: NodeId, class: RegClassId) {
        self.reg_info[node].class = class.into();
    }

    pub fn set_reg(&mut self, node: NodeId, reg: RegId) {
        self.reg_info[node].reg = reg.into();
    }

    pub fn set_dont_spill(&mut self, node: NodeId, dont_spill: bool) {
        self.reg_info[node].dont_spill = dont_spill;
    }

    pub fn clear_reg_info(&mut self, node: NodeId) {
        self.reg_info[node] = RegInfo::default();
    }

    /// `true` if `node` takes part in register allocation for `class`.
    /// `Unknown` never does: it is available everywhere by convention.
    pub fn is_in_class(&self, node: NodeId, class: RegClassId) -> bool {
        self.opcode(node) != Opcode::Unknown
            && self.mode(node).is_data()
            && self.reg_info[node].class.expand() == Some(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users_index_tracks_input_edits() {
        let mut graph = Graph::new();
        let block = graph.make_block(&[]);
        let a = graph.make_node(NodeData::new(Opcode::Const, Mode::I32, &[]));
        let b = graph.make_node(NodeData::new(Opcode::Const, Mode::I32, &[]));
        let op = graph.make_node(NodeData::new(Opcode::Op, Mode::I32, &[a, a]));
        graph.set_block(op, block);

        assert_eq!(graph.users(a).collect::<Vec<_>>(), vec![op]);
        assert_eq!(graph.users_num(b), 0);

        // One of the two edges moves away; `a` is still used.
        graph.set_input(op, 0, b);
        assert_eq!(graph.users(a).collect::<Vec<_>>(), vec![op]);
        assert_eq!(graph.users(b).collect::<Vec<_>>(), vec![op]);

        graph.set_input(op, 1, b);
        assert_eq!(graph.users_num(a), 0);
    }

    #[test]
    fn phi_registration() {
        let mut graph = Graph::new();
        let entry = graph.make_block(&[]);
        let latch = graph.make_block(&[]);
        let header = graph.make_block(&[entry, latch]);

        let x = graph.make_node(NodeData::new(Opcode::Const, Mode::I32, &[]));
        let phi = graph.make_phi(header, Mode::I32, &[x, x]);

        assert_eq!(graph.phis_of(header), &[phi]);
        assert_eq!(graph.block_of(phi), Some(header));
        assert_eq!(graph.pred_blocks(header), &[entry, latch]);
        assert!(graph.is_phi(phi));
        assert!(!graph.is_loop_keep_phi(phi));
    }

    #[test]
    fn kill_node_releases_edges() {
        let mut graph = Graph::new();
        let a = graph.make_node(NodeData::new(Opcode::Const, Mode::I32, &[]));
        let op = graph.make_node(NodeData::new(Opcode::Op, Mode::I32, &[a]));

        assert_eq!(graph.users_num(a), 1);
        graph.kill_node(op);
        assert_eq!(graph.users_num(a), 0);
        assert!(graph.inputs(op).is_empty());
    }
}
