//! Belady-style spilling for one register class.
//!
//! For every program point at most K values are modelled as residing in
//! registers; when a slot has to be freed, the value whose next use is
//! farthest away is evicted. Three walks over the graph:
//!
//! 1. a phi-spill walk computing the start working set of every join
//!    block (and the entry block) and deciding which phis live in memory;
//! 2. a per-block sequential walk inserting reload decisions and evicting
//!    by next-use distance;
//! 3. a border walk adding reloads on control flow edges where a value a
//!    block starts with is not in a register at the end of a predecessor.
//!
//! The walks only record decisions in a [`SpillEnv`]; materialization
//! happens afterwards.

use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, trace};

use opal_ir::{ControlFlowGraph, Graph, NodeId, Opcode, RegClassId, RegisterBank};

use crate::liveness::Liveness;
use crate::next_use::{NextUses, DIST_INFINITY};
use crate::spill::env::SpillEnv;
use crate::spill::workset::{Loc, Workset};

/// Everything the spiller needs about the function under compilation.
pub struct SpillCtx<'a> {
    pub graph: &'a mut Graph,
    pub cfg: &'a ControlFlowGraph,
    pub liveness: &'a Liveness,
    pub bank: &'a RegisterBank,
    pub cls: RegClassId,
}

/// Runs the spiller and materializes its decisions.
pub fn spill_belady(ctx: &mut SpillCtx) {
    let mut senv = SpillEnv::new();
    spill_belady_spill_env(ctx, &mut senv);
}

/// Like [`spill_belady`], but records into a caller-provided environment
/// so that several register classes can share one set of spill slots.
pub fn spill_belady_spill_env(ctx: &mut SpillCtx, senv: &mut SpillEnv) {
    debug!(class = ctx.bank.class(ctx.cls).name, "belady spill");

    let n_regs = ctx.bank.class(ctx.cls).usable_regs();
    let rpo = ctx.cfg.rpo();

    let mut env = BeladyEnv {
        cfg: ctx.cfg,
        liveness: ctx.liveness,
        cls: ctx.cls,
        n_regs,
        uses: NextUses::new(),
        ws: Workset::new(n_regs),
        used: FxHashSet::default(),
        instr: None,
        instr_nr: 0,
        block_info: SecondaryMap::default(),
    };

    // Decide which phis get spilled and compute the join start sets.
    for &block in &rpo {
        env.build_start_info(ctx.graph, block, senv);
    }
    // Fix high register pressure block by block.
    for &block in &rpo {
        env.process_block(ctx.graph, block, senv);
    }
    // The decisions were block local; patch the flow across edges.
    for &block in &rpo {
        env.fix_block_borders(ctx.graph, block, senv);
    }

    senv.materialize(ctx.graph, ctx.cfg);
}

#[derive(Clone, Default)]
struct BlockInfo {
    ws_start: Option<Workset>,
    ws_end: Option<Workset>,
    processed: bool,
}

struct BeladyEnv<'a> {
    cfg: &'a ControlFlowGraph,
    liveness: &'a Liveness,
    cls: RegClassId,
    n_regs: usize,
    uses: NextUses,
    /// The main working set while processing a block.
    ws: Workset,
    /// Values used at least once in the current block.
    used: FxHashSet<NodeId>,
    /// Current instruction of the sequential walk.
    instr: Option<NodeId>,
    /// Its number relative to the block start; phis and projs do not
    /// count.
    instr_nr: u32,
    block_info: SecondaryMap<NodeId, BlockInfo>,
}

impl BeladyEnv<'_> {
    /// Distance to the next use, 0 for values that must not be spilled.
    fn distance(&self, graph: &Graph, from: NodeId, from_step: u32, value: NodeId, skip: bool) -> u32 {
        self.uses.distance(graph, from, from_step, value, skip)
    }

    /// Computes the start working set of `block` when it cannot simply
    /// inherit one: join blocks and the entry. Candidates are the phis of
    /// the block and its live-ins; the K with the nearest first use win.
    /// Phis of the block that lose are spilled at the phi.
    fn build_start_info(&mut self, graph: &mut Graph, block: NodeId, senv: &mut SpillEnv) {
        let is_entry = self.cfg.entry() == Some(block);
        if graph.pred_blocks(block).len() == 1 && !is_entry {
            return;
        }

        graph.schedule.renumber(block);

        let mut starters: Vec<Loc> = Vec::new();

        for &phi in graph.phis_of(block) {
            if !graph.is_in_class(phi, self.cls) {
                continue;
            }
            let time = self.uses.distance_from_start(graph, block, phi);
            starters.push(Loc { node: phi, time });
        }

        for value in self.liveness.live_ins(block).iter() {
            if !graph.is_in_class(value, self.cls) {
                continue;
            }
            if graph.is_phi(value) && graph.block_of(value) == Some(block) {
                // Already collected above.
                continue;
            }
            let time = self.uses.distance_from_start(graph, block, value);
            starters.push(Loc { node: value, time });
        }

        starters.sort_by_key(|loc| loc.time);

        let ws_count = starters.len().min(self.n_regs);
        let info = &mut self.block_info[block];
        info.ws_start = Some(Workset::from_locs(self.n_regs, &starters[..ws_count]));

        // Phis of this block that did not make the cut live in memory.
        for loc in &starters[ws_count..] {
            if graph.is_phi(loc.node) && graph.block_of(loc.node) == Some(block) {
                senv.spill_phi(loc.node);
            }
        }
    }

    /// The sequential walk over one block. A block with a single
    /// predecessor inherits that predecessor's end set, processing it
    /// first if need be.
    fn process_block(&mut self, graph: &mut Graph, block: NodeId, senv: &mut SpillEnv) {
        if self.block_info[block].processed {
            return;
        }

        if self.block_info[block].ws_start.is_none() {
            // Single predecessor: its end set is our start set.
            debug_assert_eq!(graph.pred_blocks(block).len(), 1);
            let pred = graph.pred_blocks(block)[0];
            if !self.block_info[pred].processed {
                self.process_block(graph, pred, senv);
            }
            let inherited = self.block_info[pred]
                .ws_end
                .clone()
                .expect("processed block without an end set");
            self.block_info[block].ws_start = Some(inherited);
        }

        graph.schedule.renumber(block);

        trace!(?block, "deciding");
        self.ws = self.block_info[block].ws_start.clone().unwrap();
        self.used.clear();
        self.instr_nr = 0;

        let schedule: Vec<NodeId> = graph.schedule.iter(block).collect();
        for node in schedule {
            assert!(self.ws.len() <= self.n_regs, "too many values in workset");

            // Projs are handled with their tuple; phis are no real
            // instructions.
            if matches!(graph.opcode(node), Opcode::Proj | Opcode::Phi) {
                continue;
            }
            self.instr = Some(node);

            // Make sure the values used here are in registers.
            let mut new_vals: SmallVec<[NodeId; 4]> = SmallVec::new();
            for &value in graph.inputs(node) {
                if graph.is_in_class(value, self.cls) && !new_vals.contains(&value) {
                    new_vals.push(value);
                }
            }
            self.displace(graph, block, &new_vals, true, senv);

            // And make room for the values defined here.
            new_vals.clear();
            if graph.mode(node) == opal_ir::Mode::Tuple {
                for proj in graph.users(node) {
                    if graph.opcode(proj) == Opcode::Proj && graph.is_in_class(proj, self.cls) {
                        new_vals.push(proj);
                    }
                }
            } else if graph.is_in_class(node, self.cls) {
                new_vals.push(node);
            }
            self.displace(graph, block, &new_vals, false, senv);

            self.instr_nr += 1;
        }

        let info = &mut self.block_info[block];
        info.ws_end = Some(self.ws.clone());
        info.processed = true;
    }

    /// Grants that `new_vals` are in the working set, disposing of as few
    /// and as distant values as possible. With `is_usage`, values not in a
    /// register get a reload recorded.
    fn displace(
        &mut self,
        graph: &Graph,
        block: NodeId,
        new_vals: &[NodeId],
        is_usage: bool,
        senv: &mut SpillEnv,
    ) {
        let instr = self.instr.unwrap();

        let mut to_insert: SmallVec<[NodeId; 4]> = SmallVec::new();
        for &value in new_vals {
            if is_usage {
                self.used.insert(value);
            }
            if !self.ws.contains(value) {
                trace!(?value, "insert into workset");
                to_insert.push(value);
                if is_usage {
                    senv.add_reload(value, instr);
                }
            } else {
                debug_assert!(is_usage, "defined value already in workset");
            }
        }

        let demand = to_insert.len();
        let len = self.ws.len();
        let max_allowed = self.n_regs - demand.min(self.n_regs);

        if len > max_allowed {
            // Compute the current next-use distance of everything held.
            for i in 0..len {
                let value = self.ws.locs()[i].node;
                let time = self.distance(graph, instr, self.instr_nr, value, !is_usage);
                self.ws.locs_mut()[i].time = time;
            }

            self.fix_dead_values(graph, instr);

            self.ws.sort_by_time();

            // Live-ins evicted before their first use were never needed;
            // tighten the start set retroactively. Phis of this block are
            // exempt, the phi-spill walk owns their fate.
            for i in max_allowed..len {
                let value = self.ws.locs()[i].node;
                if graph.is_phi(value) && graph.block_of(value) == Some(block) {
                    continue;
                }
                if !self.used.contains(&value) {
                    trace!(?value, "dispose (never used)");
                    self.block_info[block]
                        .ws_start
                        .as_mut()
                        .unwrap()
                        .remove(value);
                } else {
                    trace!(?value, "dispose");
                }
            }

            self.ws.truncate(max_allowed);
        }

        for value in to_insert {
            self.ws.insert(value);
        }
    }

    /// The next-use oracle cannot tell "live out of the block" from "all
    /// uses already behind us". Values whose users are all scheduled
    /// before the current instruction in this block are dead here: give
    /// them evict-first priority.
    fn fix_dead_values(&mut self, graph: &Graph, instr: NodeId) {
        let block = graph.schedule.block_of(instr);
        let instr_step = graph.schedule.step_of(instr);

        for i in 0..self.ws.len() {
            let loc = self.ws.locs()[i];
            if loc.time == DIST_INFINITY {
                continue;
            }

            let mut all_past = true;
            for user in graph.users(loc.node) {
                if user == instr {
                    all_past = false;
                    break;
                }
                // Unscheduled users (phis, keeps) are never "past".
                if !graph.schedule.is_scheduled(user) {
                    all_past = false;
                    break;
                }
                if graph.schedule.block_of(user) != block {
                    all_past = false;
                    break;
                }
                if graph.schedule.step_of(user) > instr_step {
                    all_past = false;
                    break;
                }
            }

            if all_past {
                trace!(value = ?loc.node, "dead in block, evict first");
                self.ws.locs_mut()[i].time = DIST_INFINITY;
            }
        }
    }

    /// The sequential walk assumed block-local worksets; reload on every
    /// edge whose predecessor does not end with a value the block starts
    /// with.
    fn fix_block_borders(&mut self, graph: &Graph, block: NodeId, senv: &mut SpillEnv) {
        let Some(ws_start) = self.block_info[block].ws_start.clone() else {
            return;
        };

        let preds: SmallVec<[NodeId; 4]> = graph.pred_blocks(block).into();
        for (i, &pred) in preds.iter().enumerate() {
            let Some(ws_end) = self.block_info[pred].ws_end.as_ref() else {
                continue;
            };

            for mut value in ws_start.iter() {
                // A phi of this block needs its argument on the edge, not
                // the phi itself.
                if graph.is_phi(value) && graph.block_of(value) == Some(block) {
                    value = graph.inputs(value)[i];
                    if !graph.is_in_class(value, self.cls) {
                        continue;
                    }
                }

                // Unknowns are available everywhere.
                if graph.opcode(value) == Opcode::Unknown {
                    continue;
                }

                if !ws_end.contains(value) {
                    senv.add_reload_on_edge(value, block, i);
                }
            }
        }
    }
}
