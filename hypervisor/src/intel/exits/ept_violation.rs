//! EPT violation exits.
//!
//! Three delegate lists, keyed by the read / write / execute cause bit of
//! the exit qualification. Each list carries its own default; a violation
//! whose list has neither a handling delegate nor a default is fatal.

use {
    crate::{
        error::HypervisorError,
        intel::{
            exits::{ExitContext, HandlerDelegate, HandlerRegistry},
            vmerror::EptViolationQualification,
        },
    },
};

pub struct EptViolationComponent {
    read: HandlerRegistry,
    write: HandlerRegistry,
    execute: HandlerRegistry,
}

impl EptViolationComponent {
    pub const fn new() -> Self {
        Self {
            read: HandlerRegistry::new(),
            write: HandlerRegistry::new(),
            execute: HandlerRegistry::new(),
        }
    }

    pub fn add_read_handler(&mut self, delegate: HandlerDelegate) {
        self.read.add(delegate);
    }

    pub fn add_write_handler(&mut self, delegate: HandlerDelegate) {
        self.write.add(delegate);
    }

    pub fn add_execute_handler(&mut self, delegate: HandlerDelegate) {
        self.execute.add(delegate);
    }

    pub fn set_default_read_handler(&mut self, delegate: HandlerDelegate) {
        self.read.set_default(delegate);
    }

    pub fn set_default_write_handler(&mut self, delegate: HandlerDelegate) {
        self.write.set_default(delegate);
    }

    pub fn set_default_execute_handler(&mut self, delegate: HandlerDelegate) {
        self.execute.set_default(delegate);
    }

    /// Selects the list by cause bit, read before write before execute
    /// when several are set.
    pub fn dispatch(
        &mut self,
        qualification: &EptViolationQualification,
        ctx: &mut ExitContext,
    ) -> Result<(), HypervisorError> {
        if qualification.read_access {
            self.read.dispatch(ctx)
        } else if qualification.write_access {
            self.write.dispatch(ctx)
        } else if qualification.execute_access {
            self.execute.dispatch(ctx)
        } else {
            Err(HypervisorError::HandlerFatal)
        }
    }
}

impl Default for EptViolationComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_bit_selects_the_list() {
        let mut component = EptViolationComponent::new();
        component.add_write_handler(Box::new(|ctx| {
            ctx.regs.rax = 0x11;
            true
        }));
        component.set_default_execute_handler(Box::new(|ctx| {
            ctx.regs.rax = 0x22;
            true
        }));

        let mut ctx = ExitContext::default();

        let write = EptViolationQualification::from_exit_qualification(0b010);
        component.dispatch(&write, &mut ctx).unwrap();
        assert_eq!(ctx.regs.rax, 0x11);

        let execute = EptViolationQualification::from_exit_qualification(0b100);
        component.dispatch(&execute, &mut ctx).unwrap();
        assert_eq!(ctx.regs.rax, 0x22);

        // No read delegates at all: fatal.
        let read = EptViolationQualification::from_exit_qualification(0b001);
        assert_eq!(
            component.dispatch(&read, &mut ctx).unwrap_err(),
            HypervisorError::HandlerFatal
        );
    }

    #[test]
    fn each_list_has_its_own_default() {
        let mut component = EptViolationComponent::new();
        component.add_read_handler(Box::new(|_| false));
        component.set_default_read_handler(Box::new(|ctx| {
            ctx.regs.rbx = 0x33;
            true
        }));

        let mut ctx = ExitContext::default();
        let read = EptViolationQualification::from_exit_qualification(0b001);
        component.dispatch(&read, &mut ctx).unwrap();
        assert_eq!(ctx.regs.rbx, 0x33);
    }
}
