//! XSETBV exits.
//!
//! The exit is architecturally implicit; only handlers register here.
//! When no delegate claims the exit, the vCPU completes the guest's
//! XSETBV against hardware so the guest makes progress.

use crate::{
    error::HypervisorError,
    intel::exits::{ExitContext, HandlerDelegate, HandlerRegistry},
};

pub struct XsetbvComponent {
    registry: HandlerRegistry,
}

impl XsetbvComponent {
    pub const fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
        }
    }

    pub fn add_handler(&mut self, delegate: HandlerDelegate) {
        self.registry.add(delegate);
    }

    pub fn has_handlers(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn dispatch(&mut self, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        self.registry.dispatch(ctx)
    }
}

impl Default for XsetbvComponent {
    fn default() -> Self {
        Self::new()
    }
}
