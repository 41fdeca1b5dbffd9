//! The per-block schedule: a total order over the non-phi nodes of each
//! block. Phis logically belong to a block but are never scheduled.

use cranelift_entity::{packed_option::PackedOption, SecondaryMap};

use crate::node::NodeId;

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    nodes: SecondaryMap<NodeId, SchedNode>,
    blocks: SecondaryMap<NodeId, SchedBlock>,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct SchedNode {
    block: PackedOption<NodeId>,
    prev: PackedOption<NodeId>,
    next: PackedOption<NodeId>,
    /// Position within the block, valid after [`Schedule::renumber`].
    step: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct SchedBlock {
    first: PackedOption<NodeId>,
    last: PackedOption<NodeId>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scheduled(&self, node: NodeId) -> bool {
        self.nodes[node].block.is_some()
    }

    pub fn block_of(&self, node: NodeId) -> NodeId {
        debug_assert!(self.is_scheduled(node));
        self.nodes[node].block.unwrap()
    }

    pub fn first_of(&self, block: NodeId) -> Option<NodeId> {
        self.blocks[block].first.expand()
    }

    pub fn last_of(&self, block: NodeId) -> Option<NodeId> {
        self.blocks[block].last.expand()
    }

    pub fn prev_of(&self, node: NodeId) -> Option<NodeId> {
        debug_assert!(self.is_scheduled(node));
        self.nodes[node].prev.expand()
    }

    pub fn next_of(&self, node: NodeId) -> Option<NodeId> {
        debug_assert!(self.is_scheduled(node));
        self.nodes[node].next.expand()
    }

    pub fn iter(&self, block: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        SchedIter {
            next: self.blocks[block].first.expand(),
            nodes: &self.nodes,
        }
    }

    pub fn append(&mut self, node: NodeId, block: NodeId) {
        debug_assert!(!self.is_scheduled(node));

        let block_node = &mut self.blocks[block];
        let mut sched = SchedNode {
            block: block.into(),
            ..Default::default()
        };

        if let Some(last) = block_node.last.expand() {
            sched.prev = last.into();
            block_node.last = node.into();
            self.nodes[last].next = node.into();
        } else {
            block_node.first = node.into();
            block_node.last = node.into();
        }
        self.nodes[node] = sched;
    }

    pub fn prepend(&mut self, node: NodeId, block: NodeId) {
        debug_assert!(!self.is_scheduled(node));

        let block_node = &mut self.blocks[block];
        let mut sched = SchedNode {
            block: block.into(),
            ..Default::default()
        };

        if let Some(first) = block_node.first.expand() {
            sched.next = first.into();
            block_node.first = node.into();
            self.nodes[first].prev = node.into();
        } else {
            block_node.first = node.into();
            block_node.last = node.into();
        }
        self.nodes[node] = sched;
    }

    pub fn insert_before(&mut self, node: NodeId, before: NodeId) {
        debug_assert!(self.is_scheduled(before));
        debug_assert!(!self.is_scheduled(node));

        let block = self.nodes[before].block;
        let mut sched = SchedNode {
            block,
            next: before.into(),
            ..Default::default()
        };

        match self.nodes[before].prev.expand() {
            Some(prev) => {
                sched.prev = prev.into();
                self.nodes[prev].next = node.into();
            }
            None => self.blocks[block.unwrap()].first = node.into(),
        }
        self.nodes[before].prev = node.into();
        self.nodes[node] = sched;
    }

    pub fn insert_after(&mut self, node: NodeId, after: NodeId) {
        debug_assert!(self.is_scheduled(after));
        debug_assert!(!self.is_scheduled(node));

        let block = self.nodes[after].block;
        let mut sched = SchedNode {
            block,
            prev: after.into(),
            ..Default::default()
        };

        match self.nodes[after].next.expand() {
            Some(next) => {
                sched.next = next.into();
                self.nodes[next].prev = node.into();
            }
            None => self.blocks[block.unwrap()].last = node.into(),
        }
        self.nodes[after].next = node.into();
        self.nodes[node] = sched;
    }

    pub fn remove(&mut self, node: NodeId) {
        debug_assert!(self.is_scheduled(node));

        let block = self.nodes[node].block.unwrap();
        let prev = self.nodes[node].prev.expand();
        let next = self.nodes[node].next.expand();

        match prev {
            Some(prev) => self.nodes[prev].next = next.into(),
            None => self.blocks[block].first = next.into(),
        }
        match next {
            Some(next) => self.nodes[next].prev = prev.into(),
            None => self.blocks[block].last = prev.into(),
        }
        self.nodes[node] = SchedNode::default();
    }

    /// Re-establish step numbers for `block` so that positions can be
    /// compared in O(1). Steps start at 1; phi definitions conceptually sit
    /// at step 0, before everything scheduled.
    pub fn renumber(&mut self, block: NodeId) {
        let mut step = 1;
        let mut cur = self.blocks[block].first.expand();
        while let Some(node) = cur {
            self.nodes[node].step = step;
            step += 1;
            cur = self.nodes[node].next.expand();
        }
    }

    /// Position of `node` within its block; only meaningful after the last
    /// [`Schedule::renumber`] of that block.
    pub fn step_of(&self, node: NodeId) -> u32 {
        debug_assert!(self.is_scheduled(node));
        self.nodes[node].step
    }

    /// `true` if `node` comes after `other` in the same block.
    pub fn comes_after(&self, node: NodeId, other: NodeId) -> bool {
        debug_assert_eq!(self.nodes[node].block, self.nodes[other].block);
        self.step_of(node) > self.step_of(other)
    }
}

struct SchedIter<'a> {
    next: Option<NodeId>,
    nodes: &'a SecondaryMap<NodeId, SchedNode>,
}

impl Iterator for SchedIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let next = self.next?;
        self.next = self.nodes[next].next.expand();
        Some(next)
    }
}
