//! Graph construction helpers, mainly for tests and collaborating
//! frontends: create blocks, append scheduled operations, make phis and
//! terminators without spelling out [`NodeData`] every time.

use crate::{
    frame::EntityId,
    graph::Graph,
    node::{Attr, Mode, NodeData, NodeId, Opcode},
    reg::{RegClassId, RegId},
};

pub struct GraphBuilder {
    pub graph: Graph,
    current: Option<NodeId>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            current: None,
        }
    }

    /// Creates the entry block and switches to it.
    pub fn entry_block(&mut self) -> NodeId {
        let block = self.graph.make_block(&[]);
        self.graph.set_entry(block);
        self.current = Some(block);
        block
    }

    pub fn block(&mut self, preds: &[NodeId]) -> NodeId {
        self.graph.make_block(preds)
    }

    pub fn switch_to_block(&mut self, block: NodeId) {
        debug_assert_eq!(self.graph.opcode(block), Opcode::Block);
        self.current = Some(block);
    }

    fn current(&self) -> NodeId {
        self.current.expect("no block selected")
    }

    fn append(&mut self, data: NodeData) -> NodeId {
        let block = self.current();
        let node = self.graph.make_node(data);
        self.graph.set_block(node, block);
        self.graph.schedule.append(node, block);
        node
    }

    /// Appends an ordinary operation to the current block.
    pub fn op(&mut self, mode: Mode, inputs: &[NodeId]) -> NodeId {
        self.append(NodeData::new(Opcode::Op, mode, inputs))
    }

    /// Appends an ordinary operation and assigns it to a register class.
    pub fn op_in_class(&mut self, class: RegClassId, mode: Mode, inputs: &[NodeId]) -> NodeId {
        let node = self.op(mode, inputs);
        self.graph.set_reg_class(node, class);
        node
    }

    /// Appends a tuple-mode operation and one class-assigned `Proj` per
    /// requested result mode.
    pub fn tuple_op(
        &mut self,
        class: RegClassId,
        results: &[Mode],
        inputs: &[NodeId],
    ) -> (NodeId, Vec<NodeId>) {
        let tuple = self.append(NodeData::new(Opcode::Op, Mode::Tuple, inputs));
        let projs = results
            .iter()
            .enumerate()
            .map(|(i, &mode)| {
                let proj = self.append(
                    NodeData::new(Opcode::Proj, mode, &[tuple]).with_attr(Attr::Proj(i as u32)),
                );
                self.graph.set_reg_class(proj, class);
                proj
            })
            .collect();
        (tuple, projs)
    }

    pub fn phi(&mut self, block: NodeId, mode: Mode, inputs: &[NodeId]) -> NodeId {
        self.graph.make_phi(block, mode, inputs)
    }

    pub fn phi_in_class(
        &mut self,
        block: NodeId,
        class: RegClassId,
        mode: Mode,
        inputs: &[NodeId],
    ) -> NodeId {
        let phi = self.graph.make_phi(block, mode, inputs);
        self.graph.set_reg_class(phi, class);
        phi
    }

    /// A floating constant; constants take no register until materialized.
    pub fn imm(&mut self, value: i64, mode: Mode) -> NodeId {
        self.graph
            .make_node(NodeData::new(Opcode::Const, mode, &[]).with_attr(Attr::Imm(value)))
    }

    pub fn unknown(&mut self, mode: Mode) -> NodeId {
        self.graph.make_node(NodeData::new(Opcode::Unknown, mode, &[]))
    }

    pub fn jump(&mut self) -> NodeId {
        self.append(NodeData::new(Opcode::Jump, Mode::Ctrl, &[]))
    }

    pub fn branch(&mut self, cond: NodeId) -> NodeId {
        self.append(NodeData::new(Opcode::Branch, Mode::Ctrl, &[cond]))
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        let inputs: &[NodeId] = match &value {
            Some(v) => std::slice::from_ref(v),
            None => &[],
        };
        self.append(NodeData::new(Opcode::Return, Mode::Ctrl, inputs))
    }

    /// Appends a stack-pointer adjustment producing the new stack pointer.
    /// `prev_sp` is the stack pointer it adjusts, if the graph tracks one.
    pub fn incsp(&mut self, prev_sp: Option<NodeId>, amount: i32, p2align: u32) -> NodeId {
        let inputs: &[NodeId] = match &prev_sp {
            Some(sp) => std::slice::from_ref(sp),
            None => &[],
        };
        self.append(
            NodeData::new(Opcode::IncSp, Mode::Ptr, inputs)
                .with_attr(Attr::IncSp { amount, p2align }),
        )
    }

    pub fn memperm(&mut self, mem: NodeId) -> NodeId {
        self.append(
            NodeData::new(Opcode::MemPerm, Mode::Mem, &[mem])
                .with_attr(Attr::MemPerm { entry_bias: None }),
        )
    }

    pub fn frame_addr(&mut self, entity: EntityId) -> NodeId {
        self.append(NodeData::new(Opcode::FrameAddr, Mode::Ptr, &[]).with_attr(Attr::Entity(entity)))
    }

    /// Creates (or extends) the end node with a keep edge.
    pub fn keep_alive(&mut self, node: NodeId) -> NodeId {
        self.graph.add_keep(node)
    }

    pub fn set_reg(&mut self, node: NodeId, reg: RegId) {
        self.graph.set_reg(node, reg);
    }

    pub fn finish(self) -> Graph {
        self.graph
    }
}

pub mod test_util {
    use crate::reg::{RegClassId, RegId, RegisterBank};

    /// A register bank with a general-purpose class of `n_regs` usable
    /// registers and a one-register stack-pointer class.
    pub fn test_bank(n_regs: u32) -> (RegisterBank, RegClassId, RegId) {
        let mut bank = RegisterBank::new();
        let gp = bank.add_class("gp", n_regs, 0);
        let sp_class = bank.add_class("sp", 1, 1);
        let sp = bank.add_reg("sp", sp_class);
        (bank, gp, sp)
    }
}
