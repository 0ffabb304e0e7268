//! RDMSR/WRMSR exits.
//!
//! The dispatcher demultiplexes by RCX at entry. Whether an access exits
//! at all is the MSR bitmap's business (owned by the vCPU); this
//! component owns the per-MSR delegate lists, the shared default, and the
//! emulated set. A handled access that is not marked emulated is
//! completed against hardware by the vCPU afterwards, so handlers can
//! observe without replacing the access.

use {
    crate::{
        error::HypervisorError,
        intel::exits::{ExitContext, HandlerDelegate, KeyedRegistry},
    },
    alloc::collections::BTreeSet,
};

pub struct MsrComponent {
    registry: KeyedRegistry<u32>,
    emulated: BTreeSet<u32>,
}

impl MsrComponent {
    pub const fn new() -> Self {
        Self {
            registry: KeyedRegistry::new(),
            emulated: BTreeSet::new(),
        }
    }

    pub fn add_handler(&mut self, msr: u32, delegate: HandlerDelegate) {
        self.registry.add(msr, delegate);
    }

    pub fn set_default_handler(&mut self, delegate: HandlerDelegate) {
        self.registry.set_default(delegate);
    }

    /// Marks the MSR as fully emulated: a handled access is not
    /// completed against hardware.
    pub fn emulate(&mut self, msr: u32) {
        self.emulated.insert(msr);
    }

    pub fn is_emulated(&self, msr: u32) -> bool {
        self.emulated.contains(&msr)
    }

    pub fn dispatch(&mut self, msr: u32, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        self.registry.dispatch(&msr, ctx)
    }
}

impl Default for MsrComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn rcx_demultiplexes_to_the_registered_list() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut component = MsrComponent::new();

        let o = order.clone();
        component.add_handler(0x1B, Box::new(move |_| {
            o.borrow_mut().push("h1");
            false
        }));
        let o = order.clone();
        component.add_handler(0x1B, Box::new(move |_| {
            o.borrow_mut().push("h2");
            true
        }));
        let o = order.clone();
        component.set_default_handler(Box::new(move |_| {
            o.borrow_mut().push("default");
            true
        }));

        let mut ctx = ExitContext::default();
        ctx.regs.rcx = 0x1B;
        component.dispatch(ctx.msr_index(), &mut ctx).unwrap();
        assert_eq!(*order.borrow(), ["h1", "h2"]);

        order.borrow_mut().clear();
        ctx.regs.rcx = 0x1C;
        component.dispatch(ctx.msr_index(), &mut ctx).unwrap();
        assert_eq!(*order.borrow(), ["default"]);
    }

    #[test]
    fn emulated_set_is_per_msr() {
        let mut component = MsrComponent::new();
        component.emulate(0x1B);
        assert!(component.is_emulated(0x1B));
        assert!(!component.is_emulated(0x1C));
    }

    #[test]
    fn wrmsr_value_composes_edx_eax() {
        let mut ctx = ExitContext::default();
        ctx.regs.rax = 0xFFFF_FFFF_1111_2222;
        ctx.regs.rdx = 0x3333_4444;
        assert_eq!(ctx.msr_value(), 0x3333_4444_1111_2222);
    }
}
