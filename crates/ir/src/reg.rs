//! Register classes and per-node backend info.

use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RegClassId(pub u32);
entity_impl!(RegClassId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RegId(pub u32);
entity_impl!(RegId);

#[derive(Debug, Clone)]
pub struct RegisterClass {
    pub name: &'static str,
    pub n_regs: u32,
    /// Registers reserved by the target (stack pointer and friends); they
    /// never take part in allocation.
    pub n_ignored: u32,
}

impl RegisterClass {
    /// The `K` a spiller works with.
    pub fn usable_regs(&self) -> usize {
        (self.n_regs - self.n_ignored) as usize
    }
}

#[derive(Debug, Clone)]
pub struct Register {
    pub name: &'static str,
    pub class: RegClassId,
}

/// The register file of a target, reduced to what the backend core
/// consumes: classes with cardinalities and named registers within them.
#[derive(Debug, Default)]
pub struct RegisterBank {
    classes: PrimaryMap<RegClassId, RegisterClass>,
    regs: PrimaryMap<RegId, Register>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, name: &'static str, n_regs: u32, n_ignored: u32) -> RegClassId {
        debug_assert!(n_ignored <= n_regs);
        self.classes.push(RegisterClass {
            name,
            n_regs,
            n_ignored,
        })
    }

    pub fn add_reg(&mut self, name: &'static str, class: RegClassId) -> RegId {
        self.regs.push(Register { name, class })
    }

    pub fn class(&self, class: RegClassId) -> &RegisterClass {
        &self.classes[class]
    }

    pub fn reg(&self, reg: RegId) -> &Register {
        &self.regs[reg]
    }
}

/// Backend info attached to a node: the register-class requirement, the
/// assigned register, and the don't-spill constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegInfo {
    pub class: PackedOption<RegClassId>,
    pub reg: PackedOption<RegId>,
    pub dont_spill: bool,
}
