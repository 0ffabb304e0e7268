//! Control-register access exits.
//!
//! Exits are decoded from the exit qualification into the accessed
//! register and direction, then dispatched to the matching registry.
//! Write-exiting is governed by the CR0/CR4 guest/host masks; the mask
//! passed at enable time defines which bits the VMM owns, and the read
//! shadow is refreshed from the current guest value.

use {
    crate::{
        error::HypervisorError,
        intel::{
            controls::{set_control_bits, VmxControl},
            exits::{ExitContext, HandlerDelegate, HandlerRegistry},
            support::{vmread, vmwrite},
        },
    },
    x86::vmx::vmcs,
};

const CR3_LOAD_EXITING: u32 = 1 << 15;
const CR3_STORE_EXITING: u32 = 1 << 16;

/// Direction of a control-register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// A decoded control-register access.
///
/// Reference: Intel SDM Vol 3, Table 28-3. Exit Qualification for
/// Control-Register Accesses.
#[derive(Debug, Clone, Copy)]
pub struct CrAccess {
    pub cr: u8,
    pub access: CrAccessType,
    pub gpr: u8,
}

impl CrAccess {
    pub fn decode(qualification: u64) -> Self {
        let access = match (qualification >> 4) & 0b11 {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        };

        Self {
            cr: (qualification & 0xF) as u8,
            access,
            gpr: ((qualification >> 8) & 0xF) as u8,
        }
    }
}

impl ExitContext {
    /// Reads the general-purpose register named by a qualification's GPR
    /// field (SDM encoding: RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI,
    /// R8..R15).
    pub fn gpr(&self, index: u8) -> u64 {
        match index {
            0 => self.regs.rax,
            1 => self.regs.rcx,
            2 => self.regs.rdx,
            3 => self.regs.rbx,
            4 => self.regs.rsp,
            5 => self.regs.rbp,
            6 => self.regs.rsi,
            7 => self.regs.rdi,
            8 => self.regs.r8,
            9 => self.regs.r9,
            10 => self.regs.r10,
            11 => self.regs.r11,
            12 => self.regs.r12,
            13 => self.regs.r13,
            14 => self.regs.r14,
            _ => self.regs.r15,
        }
    }

    pub fn set_gpr(&mut self, index: u8, value: u64) {
        match index {
            0 => self.regs.rax = value,
            1 => self.regs.rcx = value,
            2 => self.regs.rdx = value,
            3 => self.regs.rbx = value,
            4 => self.regs.rsp = value,
            5 => self.regs.rbp = value,
            6 => self.regs.rsi = value,
            7 => self.regs.rdi = value,
            8 => self.regs.r8 = value,
            9 => self.regs.r9 = value,
            10 => self.regs.r10 = value,
            11 => self.regs.r11 = value,
            12 => self.regs.r12 = value,
            13 => self.regs.r13 = value,
            14 => self.regs.r14 = value,
            _ => self.regs.r15 = value,
        }
    }
}

/// Delegate lists for the four intercepted access kinds.
pub struct ControlRegisterComponent {
    pub wrcr0: HandlerRegistry,
    pub rdcr3: HandlerRegistry,
    pub wrcr3: HandlerRegistry,
    pub wrcr4: HandlerRegistry,
}

impl ControlRegisterComponent {
    pub const fn new() -> Self {
        Self {
            wrcr0: HandlerRegistry::new(),
            rdcr3: HandlerRegistry::new(),
            wrcr3: HandlerRegistry::new(),
            wrcr4: HandlerRegistry::new(),
        }
    }

    pub fn add_wrcr0_handler(&mut self, delegate: HandlerDelegate) {
        self.wrcr0.add(delegate);
    }

    pub fn add_rdcr3_handler(&mut self, delegate: HandlerDelegate) {
        self.rdcr3.add(delegate);
    }

    pub fn add_wrcr3_handler(&mut self, delegate: HandlerDelegate) {
        self.wrcr3.add(delegate);
    }

    pub fn add_wrcr4_handler(&mut self, delegate: HandlerDelegate) {
        self.wrcr4.add(delegate);
    }

    /// Routes a decoded access to its registry. Unintercepted
    /// combinations fall through as fatal.
    pub fn dispatch(
        &mut self,
        access: &CrAccess,
        ctx: &mut ExitContext,
    ) -> Result<(), HypervisorError> {
        match (access.cr, access.access) {
            (0, CrAccessType::MovToCr) => self.wrcr0.dispatch(ctx),
            (3, CrAccessType::MovFromCr) => self.rdcr3.dispatch(ctx),
            (3, CrAccessType::MovToCr) => self.wrcr3.dispatch(ctx),
            (4, CrAccessType::MovToCr) => self.wrcr4.dispatch(ctx),
            _ => Err(HypervisorError::HandlerFatal),
        }
    }

    /// Installs the CR0 guest/host mask and refreshes the read shadow.
    pub fn enable_wrcr0_exiting(mask: u64) {
        vmwrite(vmcs::control::CR0_GUEST_HOST_MASK, mask);
        vmwrite(
            vmcs::control::CR0_READ_SHADOW,
            vmread(vmcs::guest::CR0),
        );
    }

    /// Installs the CR4 guest/host mask and refreshes the read shadow.
    pub fn enable_wrcr4_exiting(mask: u64) {
        vmwrite(vmcs::control::CR4_GUEST_HOST_MASK, mask);
        vmwrite(
            vmcs::control::CR4_READ_SHADOW,
            vmread(vmcs::guest::CR4),
        );
    }

    pub fn enable_rdcr3_exiting() {
        set_control_bits(VmxControl::ProcessorBased, CR3_STORE_EXITING, true);
    }

    pub fn disable_rdcr3_exiting() {
        set_control_bits(VmxControl::ProcessorBased, CR3_STORE_EXITING, false);
    }

    pub fn enable_wrcr3_exiting() {
        set_control_bits(VmxControl::ProcessorBased, CR3_LOAD_EXITING, true);
    }

    pub fn disable_wrcr3_exiting() {
        set_control_bits(VmxControl::ProcessorBased, CR3_LOAD_EXITING, false);
    }
}

impl Default for ControlRegisterComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification_decodes_register_access_and_gpr() {
        // MOV CR3, R8: cr=3, access=0, gpr=8.
        let access = CrAccess::decode(0x803);
        assert_eq!(access.cr, 3);
        assert_eq!(access.access, CrAccessType::MovToCr);
        assert_eq!(access.gpr, 8);

        // MOV RDI, CR3: cr=3, access=1, gpr=7.
        let access = CrAccess::decode(0x713);
        assert_eq!(access.access, CrAccessType::MovFromCr);
        assert_eq!(access.gpr, 7);
    }

    #[test]
    fn dispatch_routes_by_register_and_direction() {
        let mut component = ControlRegisterComponent::new();
        component.add_wrcr3_handler(Box::new(|ctx| {
            ctx.regs.rbx = ctx.gpr(8);
            true
        }));

        let mut ctx = ExitContext::default();
        ctx.regs.r8 = 0xDEAD_B000;

        let access = CrAccess::decode(0x803);
        component.dispatch(&access, &mut ctx).unwrap();
        assert_eq!(ctx.regs.rbx, 0xDEAD_B000);

        // No rdcr3 delegate registered: fatal.
        let access = CrAccess::decode(0x713);
        assert_eq!(
            component.dispatch(&access, &mut ctx).unwrap_err(),
            HypervisorError::HandlerFatal
        );
    }

    #[test]
    fn gpr_accessors_cover_the_sdm_encoding() {
        let mut ctx = ExitContext::default();
        ctx.set_gpr(4, 0x1111);
        ctx.set_gpr(15, 0x2222);
        assert_eq!(ctx.regs.rsp, 0x1111);
        assert_eq!(ctx.regs.r15, 0x2222);
        assert_eq!(ctx.gpr(4), 0x1111);
        assert_eq!(ctx.gpr(15), 0x2222);
    }
}
