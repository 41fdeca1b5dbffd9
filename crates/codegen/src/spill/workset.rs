//! The bounded working set of the Belady spiller: the values modelled as
//! residing in registers at a program point, each paired with its next-use
//! distance. Capacity never exceeds the usable registers of the class; a
//! small inline array with linear scans beats any map for realistic K.

use smallvec::SmallVec;

use opal_ir::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    pub node: NodeId,
    pub time: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workset {
    locs: SmallVec<[Loc; 8]>,
    cap: usize,
}

impl Workset {
    pub fn new(cap: usize) -> Self {
        Self {
            locs: SmallVec::new(),
            cap,
        }
    }

    pub fn from_locs(cap: usize, locs: &[Loc]) -> Self {
        debug_assert!(locs.len() <= cap);
        Self {
            locs: locs.into(),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.locs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.locs.iter().any(|loc| loc.node == node)
    }

    /// Inserts `node` unless it is already present. The set must not be
    /// full.
    pub fn insert(&mut self, node: NodeId) {
        if self.contains(node) {
            return;
        }
        assert!(self.locs.len() < self.cap, "workset already full");
        self.locs.push(Loc { node, time: 0 });
    }

    pub fn remove(&mut self, node: NodeId) {
        if let Some(idx) = self.locs.iter().position(|loc| loc.node == node) {
            self.locs.swap_remove(idx);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.locs.iter().map(|loc| loc.node)
    }

    pub fn locs(&self) -> &[Loc] {
        &self.locs
    }

    pub fn locs_mut(&mut self) -> &mut [Loc] {
        &mut self.locs
    }

    /// Stable sort by ascending next-use distance; equal distances keep
    /// their current order.
    pub fn sort_by_time(&mut self) {
        self.locs.sort_by_key(|loc| loc.time);
    }

    pub fn truncate(&mut self, len: usize) {
        self.locs.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    fn n(i: usize) -> NodeId {
        NodeId::new(i)
    }

    #[test]
    fn insert_is_idempotent_and_bounded() {
        let mut ws = Workset::new(2);
        ws.insert(n(1));
        ws.insert(n(1));
        assert_eq!(ws.len(), 1);
        ws.insert(n(2));
        assert_eq!(ws.len(), 2);
        assert!(ws.contains(n(1)) && ws.contains(n(2)));
    }

    #[test]
    #[should_panic(expected = "workset already full")]
    fn overflow_is_a_bug() {
        let mut ws = Workset::new(1);
        ws.insert(n(1));
        ws.insert(n(2));
    }

    #[test]
    fn sort_is_stable_on_ties() {
        let mut ws = Workset::new(4);
        for (i, time) in [(1, 5), (2, u32::MAX), (3, 0), (4, u32::MAX)] {
            ws.insert(n(i));
            ws.locs_mut().last_mut().unwrap().time = time;
        }
        ws.sort_by_time();
        let order: Vec<_> = ws.iter().collect();
        assert_eq!(order, vec![n(3), n(1), n(2), n(4)]);
    }

    #[test]
    fn remove_missing_is_a_no_op() {
        let mut ws = Workset::new(2);
        ws.insert(n(1));
        ws.remove(n(9));
        assert_eq!(ws.len(), 1);
    }
}
