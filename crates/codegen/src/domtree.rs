//! Dominator tree and dominance frontiers.
//!
//! The iterative scheme of Cooper, Harvey and Kennedy ("A Simple, Fast
//! Dominance Algorithm") over the CFG in reverse post order.

use std::collections::BTreeSet;

use cranelift_entity::{packed_option::PackedOption, SecondaryMap};
use opal_ir::{ControlFlowGraph, NodeId};

#[derive(Debug, Default)]
pub struct DomTree {
    idoms: SecondaryMap<NodeId, PackedOption<NodeId>>,
    rpo: Vec<NodeId>,
}

impl DomTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&mut self, cfg: &ControlFlowGraph) {
        self.idoms.clear();
        self.rpo = cfg.rpo();

        let Some(&entry) = self.rpo.first() else {
            return;
        };

        let mut rpo_num = SecondaryMap::<NodeId, u32>::default();
        let len = self.rpo.len() as u32;
        for (i, &block) in self.rpo.iter().enumerate() {
            rpo_num[block] = len - i as u32;
        }

        self.idoms[entry] = entry.into();

        let mut changed = true;
        while changed {
            changed = false;
            for &block in self.rpo.iter().skip(1) {
                let mut processed = cfg
                    .preds_of(block)
                    .copied()
                    .filter(|&pred| self.idoms[pred].is_some());
                let Some(first) = processed.next() else {
                    continue;
                };

                let mut new_idom = first;
                for pred in processed {
                    new_idom = self.intersect(new_idom, pred, &rpo_num);
                }

                if self.idoms[block].expand() != Some(new_idom) {
                    self.idoms[block] = new_idom.into();
                    changed = true;
                }
            }
        }
    }

    /// The immediate dominator; `None` for the entry block and for blocks
    /// unreachable from it.
    pub fn idom_of(&self, block: NodeId) -> Option<NodeId> {
        if self.rpo.first() == Some(&block) {
            return None;
        }
        self.idoms[block].expand()
    }

    pub fn is_reachable(&self, block: NodeId) -> bool {
        self.idoms[block].is_some()
    }

    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        a == b || self.strictly_dominates(a, b)
    }

    pub fn strictly_dominates(&self, a: NodeId, b: NodeId) -> bool {
        let mut runner = b;
        while let Some(idom) = self.idom_of(runner) {
            if idom == a {
                return true;
            }
            runner = idom;
        }
        false
    }

    pub fn rpo(&self) -> &[NodeId] {
        &self.rpo
    }

    /// Dominance frontiers of every reachable block.
    pub fn compute_df(&self, cfg: &ControlFlowGraph) -> DomFrontiers {
        let mut df = DomFrontiers::default();

        for &block in &self.rpo {
            if cfg.pred_num_of(block) < 2 {
                continue;
            }
            for &pred in cfg.preds_of(block) {
                if !self.is_reachable(pred) {
                    continue;
                }
                let mut runner = pred;
                while PackedOption::from(runner) != self.idoms[block] {
                    df.sets[runner].insert(block);
                    runner = self.idoms[runner].unwrap();
                }
            }
        }

        df
    }

    fn intersect(
        &self,
        mut a: NodeId,
        mut b: NodeId,
        rpo_num: &SecondaryMap<NodeId, u32>,
    ) -> NodeId {
        while a != b {
            while rpo_num[a] < rpo_num[b] {
                a = self.idoms[a].unwrap();
            }
            while rpo_num[b] < rpo_num[a] {
                b = self.idoms[b].unwrap();
            }
        }
        a
    }
}

#[derive(Debug, Default)]
pub struct DomFrontiers {
    sets: SecondaryMap<NodeId, BTreeSet<NodeId>>,
}

impl DomFrontiers {
    pub fn of(&self, block: NodeId) -> impl Iterator<Item = &NodeId> {
        self.sets[block].iter()
    }
}
