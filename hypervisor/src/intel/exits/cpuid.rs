//! CPUID exits.
//!
//! CPUID exits unconditionally, so this class always completes: delegates
//! may rewrite the leaf, and anything unhandled is satisfied from the
//! real CPUID so the guest keeps booting.

use crate::{
    error::HypervisorError,
    intel::exits::{ExitContext, HandlerDelegate, HandlerRegistry},
};

pub struct CpuidComponent {
    registry: HandlerRegistry,
}

impl CpuidComponent {
    pub const fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
        }
    }

    pub fn add_handler(&mut self, delegate: HandlerDelegate) {
        self.registry.add(delegate);
    }

    /// Delegates first; the passthrough result is already loaded into the
    /// context registers, so an empty surface is not fatal.
    pub fn dispatch(&mut self, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        if self.registry.is_empty() {
            return Ok(());
        }

        match self.registry.dispatch(ctx) {
            Ok(()) => Ok(()),
            // Unhandled CPUID falls back to the passthrough value.
            Err(HypervisorError::HandlerFatal) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Default for CpuidComponent {
    fn default() -> Self {
        Self::new()
    }
}
