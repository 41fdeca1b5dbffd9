//! The spill environment: the walks of the spiller only *record* their
//! decisions here; `materialize` turns them into graph mutations at the
//! end — spill-slot entities, `Spill`/`Reload` nodes, memory phis, and the
//! SSA reconstruction that rewires users to the reloaded values.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;

use opal_ir::{
    Attr, ControlFlowGraph, Graph, Mode, NodeData, NodeId, Opcode,
};

use crate::domtree::DomTree;
use crate::ssa::SsaReconstruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadSite {
    /// Reload immediately before this scheduled instruction.
    Before(NodeId),
    /// Reload on the control flow edge `pred_idx` into `block`, placed at
    /// the end of the predecessor (critical edges are a collaborator
    /// concern).
    Edge { block: NodeId, pred_idx: usize },
}

#[derive(Default)]
pub struct SpillEnv {
    /// (value, site) in decision order.
    reloads: Vec<(NodeId, ReloadSite)>,
    spilled_phis: Vec<NodeId>,
    spilled_phi_set: FxHashSet<NodeId>,
}

impl SpillEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reload(&mut self, value: NodeId, before: NodeId) {
        debug!(?value, ?before, "reload before use");
        self.reloads.push((value, ReloadSite::Before(before)));
    }

    pub fn add_reload_on_edge(&mut self, value: NodeId, block: NodeId, pred_idx: usize) {
        debug!(?value, ?block, pred_idx, "reload on edge");
        self.reloads.push((value, ReloadSite::Edge { block, pred_idx }));
    }

    /// Marks a phi whose value lives in memory: its arguments will be
    /// spilled to a common slot on every incoming edge and the phi becomes
    /// a memory phi.
    pub fn spill_phi(&mut self, phi: NodeId) {
        if self.spilled_phi_set.insert(phi) {
            debug!(?phi, "spill phi");
            self.spilled_phis.push(phi);
        }
    }

    pub fn spilled_phis(&self) -> &[NodeId] {
        &self.spilled_phis
    }

    pub fn has_reloads(&self) -> bool {
        !self.reloads.is_empty()
    }

    /// Number of recorded reloads, edge reloads included.
    pub fn reload_count(&self) -> usize {
        self.reloads.len()
    }

    /// Inserts the recorded spills and reloads into the graph and fixes
    /// the users of every spilled value.
    pub fn materialize(&mut self, graph: &mut Graph, cfg: &ControlFlowGraph) {
        // Group the recorded reloads per value, keeping decision order.
        let mut order: Vec<NodeId> = Vec::new();
        let mut sites: FxHashMap<NodeId, SmallVec<[ReloadSite; 4]>> = FxHashMap::default();
        for &(value, site) in &self.reloads {
            let entry = sites.entry(value).or_default();
            if entry.is_empty() {
                order.push(value);
            }
            if !entry.contains(&site) {
                entry.push(site);
            }
        }

        // Mode and class are captured up front: breaking a phi into a
        // memory phi loses them.
        let specs: FxHashMap<NodeId, ValueSpec> = order
            .iter()
            .map(|&value| (value, ValueSpec::of(graph, value)))
            .collect();

        // Break the spilled phis first: their memory lives at the phi.
        let mut phi_mem: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        for &phi in &self.spilled_phis {
            phi_mem.insert(phi, break_phi(graph, phi));
        }

        let mut domtree = DomTree::new();
        domtree.compute(cfg);
        let df = domtree.compute_df(cfg);

        for value in order {
            let spec = specs[&value];
            let mem = match phi_mem.get(&value) {
                Some(&mem) => mem,
                None => spill_after_def(graph, value),
            };

            let mut defs: SmallVec<[NodeId; 4]> = SmallVec::new();
            if !self.spilled_phi_set.contains(&value) {
                // The original definition still produces the value; for a
                // broken phi only the reloads do.
                defs.push(value);
            }

            for &site in &sites[&value] {
                let reload = make_reload(graph, &spec, mem);
                match site {
                    ReloadSite::Before(inst) => {
                        let block = graph.schedule.block_of(inst);
                        graph.set_block(reload, block);
                        graph.schedule.insert_before(reload, inst);
                    }
                    ReloadSite::Edge { block, pred_idx } => {
                        let pred = graph.pred_blocks(block)[pred_idx];
                        schedule_at_end(graph, reload, pred);
                    }
                }
                defs.push(reload);
            }

            let mut ssa = SsaReconstruction::new(&domtree, &df);
            ssa.add_definitions(graph, &defs);
            ssa.fix_users(graph, value);
            for &phi in ssa.new_phis() {
                if let Some(class) = spec.class {
                    graph.set_reg_class(phi, class);
                }
            }
        }

        self.reloads.clear();
    }
}

/// Register mode and class of a spilled value, captured before any node
/// conversion.
#[derive(Clone, Copy)]
struct ValueSpec {
    mode: Mode,
    class: Option<opal_ir::RegClassId>,
}

impl ValueSpec {
    fn of(graph: &Graph, value: NodeId) -> Self {
        Self {
            mode: graph.mode(value),
            class: graph.reg_info(value).class.expand(),
        }
    }
}

/// Creates the spill slot and the `Spill` node for an ordinary value and
/// schedules it right after the definition. Returns the spill (the memory
/// value reloads read).
fn spill_after_def(graph: &mut Graph, value: NodeId) -> NodeId {
    let slot = new_slot(graph, value);
    let spill = graph.make_node(
        NodeData::new(Opcode::Spill, Mode::Mem, &[value]).with_attr(Attr::Entity(slot)),
    );

    if graph.schedule.is_scheduled(value) {
        let block = graph.schedule.block_of(value);
        graph.set_block(spill, block);
        graph.schedule.insert_after(spill, value);
    } else {
        // Phis and other floating definitions materialize at the top of
        // their block.
        let block = graph
            .block_of(value)
            .or_else(|| graph.entry())
            .expect("spilled value without a block");
        graph.set_block(spill, block);
        graph.schedule.prepend(spill, block);
    }
    spill
}

/// Spills every argument of `phi` to one shared slot at the end of the
/// corresponding predecessor and turns `phi` into a memory phi over those
/// spills.
fn break_phi(graph: &mut Graph, phi: NodeId) -> NodeId {
    let slot = new_slot(graph, phi);
    let block = graph.block_of(phi).unwrap();
    let preds: SmallVec<[NodeId; 4]> = graph.pred_blocks(block).into();

    for i in 0..preds.len() {
        let arg = graph.inputs(phi)[i];
        let spill = graph.make_node(
            NodeData::new(Opcode::Spill, Mode::Mem, &[arg]).with_attr(Attr::Entity(slot)),
        );
        graph.set_block(spill, preds[i]);
        schedule_at_end(graph, spill, preds[i]);
        graph.set_input(phi, i, spill);
    }

    let data = graph.node_mut(phi);
    data.mode = Mode::Mem;
    graph.clear_reg_info(phi);
    phi
}

fn make_reload(graph: &mut Graph, spec: &ValueSpec, mem: NodeId) -> NodeId {
    let reload = graph.make_node(NodeData::new(Opcode::Reload, spec.mode, &[mem]));
    if let Some(class) = spec.class {
        graph.set_reg_class(reload, class);
    }
    reload
}

fn new_slot(graph: &mut Graph, value: NodeId) -> opal_ir::EntityId {
    let mode = graph.mode(value);
    let (size, align) = if mode.is_data() {
        (mode.size(), mode.align())
    } else {
        (Mode::Ptr.size(), Mode::Ptr.align())
    };
    graph.frame.new_spill_slot(size, align)
}

/// Appends `node` to `block`, before the terminator if there is one.
fn schedule_at_end(graph: &mut Graph, node: NodeId, block: NodeId) {
    graph.set_block(node, block);
    match graph.schedule.last_of(block) {
        Some(last) if graph.opcode(last).is_terminator() => {
            graph.schedule.insert_before(node, last)
        }
        _ => graph.schedule.append(node, block),
    }
}
