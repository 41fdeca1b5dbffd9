pub mod builder;
pub mod cfg;
pub mod frame;
pub mod graph;
pub mod node;
pub mod reg;
pub mod schedule;

pub use cfg::ControlFlowGraph;
pub use frame::{EntityId, EntityKind, FrameEntity, FrameState, FrameType};
pub use graph::Graph;
pub use node::{Attr, Mode, NodeData, NodeId, Opcode};
pub use reg::{RegClassId, RegId, RegInfo, Register, RegisterBank, RegisterClass};
pub use schedule::Schedule;
