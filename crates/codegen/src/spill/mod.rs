//! The Belady-style register spiller.

pub mod belady;
pub mod env;
pub mod workset;

pub use belady::{spill_belady, spill_belady_spill_env, SpillCtx};
pub use env::SpillEnv;
pub use workset::{Loc, Workset};
