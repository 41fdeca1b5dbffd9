pub mod bitset;
pub mod domtree;
pub mod liveness;
pub mod next_use;
pub mod phi_scc;
pub mod spill;
pub mod ssa;
pub mod stack;

pub use liveness::Liveness;
pub use next_use::{NextUses, DIST_INFINITY};
pub use phi_scc::{remove_unnecessary_phi_sccs, PhiSccError};
pub use spill::{spill_belady, spill_belady_spill_env, SpillCtx, SpillEnv};
pub use stack::{fix_stack_nodes, layout_frame_type, sim_stack_pointer, sort_frame_entities};
