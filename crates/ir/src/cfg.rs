//! Control flow graph over the blocks of a graph.
//!
//! Predecessors come straight from the inputs of each `Block` node; the
//! successor relation is the reverse. The indexed, possibly duplicated
//! predecessor list that phi inputs key off lives on the block node itself
//! ([`Graph::pred_blocks`]); this analysis keeps deduplicated sets for
//! traversal.

use std::collections::BTreeSet;

use cranelift_entity::{packed_option::PackedOption, SecondaryMap};

use crate::{graph::Graph, node::NodeId, node::Opcode};

#[derive(Debug, Default, Clone)]
pub struct ControlFlowGraph {
    entry: PackedOption<NodeId>,
    blocks: SecondaryMap<NodeId, BlockNode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct BlockNode {
    preds: BTreeSet<NodeId>,
    succs: BTreeSet<NodeId>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&mut self, graph: &Graph) {
        self.clear();
        self.entry = graph.entry().into();

        for block in graph.iter_nodes() {
            if graph.opcode(block) != Opcode::Block {
                continue;
            }
            for &pred in graph.pred_blocks(block) {
                self.blocks[block].preds.insert(pred);
                self.blocks[pred].succs.insert(block);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entry = None.into();
        self.blocks.clear();
    }

    pub fn entry(&self) -> Option<NodeId> {
        self.entry.expand()
    }

    pub fn preds_of(&self, block: NodeId) -> impl Iterator<Item = &NodeId> {
        self.blocks[block].preds.iter()
    }

    pub fn succs_of(&self, block: NodeId) -> impl Iterator<Item = &NodeId> {
        self.blocks[block].succs.iter()
    }

    pub fn pred_num_of(&self, block: NodeId) -> usize {
        self.blocks[block].preds.len()
    }

    pub fn post_order(&self) -> CfgPostOrder<'_> {
        CfgPostOrder::new(self)
    }

    /// Blocks in reverse post order from the entry.
    pub fn rpo(&self) -> Vec<NodeId> {
        let mut rpo: Vec<_> = self.post_order().collect();
        rpo.reverse();
        rpo
    }
}

pub struct CfgPostOrder<'a> {
    cfg: &'a ControlFlowGraph,
    state: SecondaryMap<NodeId, VisitState>,
    stack: Vec<NodeId>,
}

impl<'a> CfgPostOrder<'a> {
    fn new(cfg: &'a ControlFlowGraph) -> Self {
        let mut stack = Vec::new();
        if let Some(entry) = cfg.entry() {
            stack.push(entry);
        }
        Self {
            cfg,
            state: SecondaryMap::default(),
            stack,
        }
    }
}

impl Iterator for CfgPostOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        while let Some(&block) = self.stack.last() {
            match self.state[block] {
                VisitState::Unvisited => {
                    self.state[block] = VisitState::Visited;
                    for &succ in self.cfg.succs_of(block) {
                        if self.state[succ] == VisitState::Unvisited {
                            self.stack.push(succ);
                        }
                    }
                }
                VisitState::Visited => {
                    self.stack.pop();
                    self.state[block] = VisitState::Finished;
                    return Some(block);
                }
                VisitState::Finished => {
                    self.stack.pop();
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum VisitState {
    #[default]
    Unvisited,
    Visited,
    Finished,
}
