//! The vCPU: one per logical CPU, owner of that CPU's VMCS, host tables,
//! stacks, bitmaps, and exit-handler components.
//!
//! A vCPU is created boxed at CPU bring-up and never moves afterwards;
//! the VMCS holds raw pointers into it. It is destroyed at CPU teardown
//! and is not copyable. The EPT map is borrowed from its external owner
//! and must stay live for the vCPU's lifetime.

use {
    crate::{
        error::HypervisorError,
        intel::{
            addresses,
            bitmap::{IoBitmaps, MsrBitmap, MsrAccessType},
            capture::GuestRegisters,
            descriptor::HostDescriptors,
            ept::EptMap,
            exits::{
                cpuid::CpuidComponent,
                cr::{ControlRegisterComponent, CrAccess, CrAccessType},
                ept_violation::EptViolationComponent,
                external_interrupt::ExternalInterruptComponent,
                interrupt_window::InterruptWindowComponent,
                io::{IoAccess, IoInstructionComponent},
                mtf::MonitorTrapComponent,
                msr::MsrComponent,
                nmi::{is_nmi, NmiComponent},
                nmi_window::NmiWindowComponent,
                preemption_timer::PreemptionTimerComponent,
                xsetbv::XsetbvComponent,
                ExitContext, ExitType, HandlerDelegate,
            },
            host,
            support::{
                self, inb, inl, inw, outb, outl, outw, rdmsr, vmread, vmwrite, wrmsr,
            },
            vmcs::{self, ControlOptions, Vmcs},
            vmerror::{
                EptViolationQualification, VmInstructionError, VmxBasicExitReason,
                EXIT_REASON_VM_ENTRY_FAILURE,
            },
            vmlaunch::launch_vm,
            vmxon::Vmxon,
        },
    },
    alloc::{boxed::Box, vec},
    mirage_shared::consts::STACK_SIZE,
    x86::{bits64::rflags::RFlags, vmx::vmcs as vmcs_fields},
};

/// Exception vectors the vCPU injects.
const UD_VECTOR: u8 = 6;
const GP_VECTOR: u8 = 13;

pub struct Vcpu {
    id: u32,

    vmxon_region: Box<Vmxon>,
    vmcs_region: Box<Vmcs>,
    host_descriptors: HostDescriptors,

    // Primary stack for the exit handler, IST1 stack for host exceptions.
    // Both twice STACK_SIZE so an overrun has somewhere to die loudly.
    primary_stack: Box<[u8]>,
    ist_stack: Box<[u8]>,

    msr_bitmap: Box<MsrBitmap>,
    io_bitmaps: Box<IoBitmaps>,

    // Borrowed from the externally owned map; kept live by the owner.
    ept: Option<*mut EptMap>,

    guest_registers: GuestRegisters,
    launched: bool,

    control_register: ControlRegisterComponent,
    cpuid: CpuidComponent,
    ept_violation: EptViolationComponent,
    external_interrupt: ExternalInterruptComponent,
    interrupt_window: InterruptWindowComponent,
    io_instruction: IoInstructionComponent,
    monitor_trap: MonitorTrapComponent,
    nmi: NmiComponent,
    nmi_window: NmiWindowComponent,
    preemption_timer: PreemptionTimerComponent,
    rdmsr: MsrComponent,
    wrmsr: MsrComponent,
    xsetbv: XsetbvComponent,
}

// vCPUs are CPU-local: the registry hands each box to exactly one CPU
// and never shares mutable state across CPUs. The EPT pointer inside is
// kept live by its external owner.
unsafe impl Send for Vcpu {}

impl Vcpu {
    /// Allocates a vCPU for the given CPU. Boxed from birth: the VMCS
    /// will hold addresses into it.
    pub fn new(id: u32) -> Box<Self> {
        let ist_stack = vec![0u8; STACK_SIZE * 2].into_boxed_slice();
        let ist_top = ist_stack.as_ptr() as u64 + ist_stack.len() as u64 - 0x10;

        Box::new(Self {
            id,
            vmxon_region: unsafe { box_zeroed::<Vmxon>() },
            vmcs_region: unsafe { box_zeroed::<Vmcs>() },
            host_descriptors: HostDescriptors::new(ist_top),
            primary_stack: vec![0u8; STACK_SIZE * 2].into_boxed_slice(),
            ist_stack,
            msr_bitmap: Box::new(MsrBitmap::new()),
            io_bitmaps: Box::new(IoBitmaps::new()),
            ept: None,
            guest_registers: GuestRegisters::default(),
            launched: false,
            control_register: ControlRegisterComponent::new(),
            cpuid: CpuidComponent::new(),
            ept_violation: EptViolationComponent::new(),
            external_interrupt: ExternalInterruptComponent::new(),
            interrupt_window: InterruptWindowComponent::new(),
            io_instruction: IoInstructionComponent::new(),
            monitor_trap: MonitorTrapComponent::new(),
            nmi: NmiComponent::new(),
            nmi_window: NmiWindowComponent::new(),
            preemption_timer: PreemptionTimerComponent::new(),
            rdmsr: MsrComponent::new(),
            wrmsr: MsrComponent::new(),
            xsetbv: XsetbvComponent::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Enters VMX operation and programs the VMCS: host state, the guest
    /// snapshot (host vCPU only), and the control fields, then applies
    /// the always-on interceptions (VPID, NMI exiting, CR0/CR4 masks).
    pub fn activate(
        &mut self,
        guest_registers: &GuestRegisters,
        is_host_vcpu: bool,
    ) -> Result<(), HypervisorError> {
        let host_state = host::get().ok_or(HypervisorError::HostStateNotInitialized)?;

        self.guest_registers = *guest_registers;
        self.vmxon_region.activate()?;
        self.vmcs_region.activate()?;

        let stack_top =
            self.primary_stack.as_ptr() as u64 + self.primary_stack.len() as u64 - 0x10;
        vmcs::write_host_state(&self.host_descriptors, host_state, stack_top);

        if is_host_vcpu {
            vmcs::write_guest_state(self.guest_registers.rip, self.guest_registers.rsp);
        }

        let eptp = match self.ept() {
            Some(map) => Some(map.eptp()?),
            None => None,
        };
        vmcs::write_control_state(
            &self.msr_bitmap,
            &self.io_bitmaps,
            &ControlOptions {
                eptp,
                vpid: (self.id + 1) as u16,
                is_host_vcpu,
            },
        );

        NmiComponent::enable_exiting();
        ControlRegisterComponent::enable_wrcr0_exiting(0);
        ControlRegisterComponent::enable_wrcr4_exiting(0);

        Ok(())
    }

    /// Enters the guest and services exits until one is unrecoverable.
    pub fn run(&mut self) -> ! {
        log::info!("vcpu {}: entering guest", self.id);

        loop {
            let flags = unsafe {
                launch_vm(&mut self.guest_registers, u64::from(self.launched))
            };
            if let Err(e) = Self::entry_succeeded(RFlags::from_raw(flags)) {
                self.halt(&alloc::format!("VM entry failed: {e}"));
            }
            self.launched = true;

            // Refresh the VMCS-tracked registers so dispatch sees a
            // complete file.
            self.guest_registers.rip = vmread(vmcs_fields::guest::RIP);
            self.guest_registers.rsp = vmread(vmcs_fields::guest::RSP);
            self.guest_registers.rflags = vmread(vmcs_fields::guest::RFLAGS);

            match self.dispatch() {
                Ok(ExitType::IncrementRip) => self.advance_guest_rip(),
                Ok(ExitType::Continue) => {}
                Err(_) => self.halt("unhandled VM exit"),
            }
        }
    }

    /// Decodes the exit reason and routes it through the class surface.
    pub fn dispatch(&mut self) -> Result<ExitType, HypervisorError> {
        let raw_reason = vmread(vmcs_fields::ro::EXIT_REASON) as u32;
        let reason = VmxBasicExitReason::from_u32(raw_reason)
            .ok_or(HypervisorError::UnknownExitReason)?;

        if raw_reason & EXIT_REASON_VM_ENTRY_FAILURE != 0 {
            return Err(HypervisorError::VmxEntryFailure);
        }

        let mut ctx = ExitContext {
            cpu_id: self.id,
            regs: self.guest_registers,
            exit_reason: raw_reason,
            exit_qualification: vmread(vmcs_fields::ro::EXIT_QUALIFICATION),
            guest_physical: vmread(vmcs_fields::ro::GUEST_PHYSICAL_ADDR_FULL),
            guest_linear: vmread(vmcs_fields::ro::GUEST_LINEAR_ADDR),
            instruction_length: vmread(vmcs_fields::ro::VMEXIT_INSTRUCTION_LEN),
        };

        let result = self.dispatch_reason(reason, &mut ctx);

        self.guest_registers = ctx.regs;
        result
    }

    fn dispatch_reason(
        &mut self,
        reason: VmxBasicExitReason,
        ctx: &mut ExitContext,
    ) -> Result<ExitType, HypervisorError> {
        match reason {
            VmxBasicExitReason::ExceptionOrNmi => {
                let info = vmread(vmcs_fields::ro::VMEXIT_INTERRUPTION_INFO) as u32;
                if is_nmi(info) {
                    self.nmi.dispatch(ctx)?;
                    Ok(ExitType::Continue)
                } else {
                    Err(HypervisorError::HandlerFatal)
                }
            }

            VmxBasicExitReason::ExternalInterrupt => {
                self.external_interrupt.dispatch(ctx)?;
                Ok(ExitType::Continue)
            }

            VmxBasicExitReason::InterruptWindow => {
                self.interrupt_window.dispatch(ctx)?;
                Ok(ExitType::Continue)
            }

            VmxBasicExitReason::NmiWindow => {
                self.nmi_window.dispatch(ctx)?;
                Ok(ExitType::Continue)
            }

            VmxBasicExitReason::Cpuid => {
                let leaf = ctx.regs.rax as u32;

                if leaf == crate::vmm::CPUID_VENDOR_AND_MAX_FUNCTIONS {
                    // Bring-up probes this leaf to detect that the CPU
                    // is already virtualized.
                    ctx.regs.rax = crate::vmm::CPUID_VENDOR_AND_MAX_FUNCTIONS as u64;
                    ctx.regs.rbx = crate::vmm::VENDOR_NAME as u64;
                    ctx.regs.rcx = crate::vmm::VENDOR_NAME as u64;
                    ctx.regs.rdx = crate::vmm::VENDOR_NAME as u64;
                } else {
                    let result = x86::cpuid::cpuid!(leaf, ctx.regs.rcx as u32);
                    ctx.regs.rax = result.eax as u64;
                    ctx.regs.rbx = result.ebx as u64;
                    ctx.regs.rcx = result.ecx as u64;
                    ctx.regs.rdx = result.edx as u64;
                }

                self.cpuid.dispatch(ctx)?;
                Ok(ExitType::IncrementRip)
            }

            VmxBasicExitReason::ControlRegisterAccesses => {
                let access = CrAccess::decode(ctx.exit_qualification);
                self.control_register.dispatch(&access, ctx)?;
                self.complete_cr_access(&access, ctx);
                Ok(ExitType::IncrementRip)
            }

            VmxBasicExitReason::IoInstruction => {
                let access = IoAccess::decode(ctx.exit_qualification);
                let emulated = self.io_instruction.is_emulated(access.port);

                // IN preloads the real port value so delegates observe
                // it; OUT completes after they run.
                if access.is_in && !emulated && !access.is_string {
                    Self::complete_io_in(&access, ctx);
                }
                self.io_instruction.dispatch(access.port, ctx)?;
                if !access.is_in && !emulated && !access.is_string {
                    Self::complete_io_out(&access, ctx);
                }
                Ok(ExitType::IncrementRip)
            }

            VmxBasicExitReason::Rdmsr => {
                let index = ctx.msr_index();
                if !self.rdmsr.is_emulated(index) {
                    let value = rdmsr(index);
                    ctx.regs.rax = value & 0xFFFF_FFFF;
                    ctx.regs.rdx = value >> 32;
                }
                self.rdmsr.dispatch(index, ctx)?;
                Ok(ExitType::IncrementRip)
            }

            VmxBasicExitReason::Wrmsr => {
                let index = ctx.msr_index();
                self.wrmsr.dispatch(index, ctx)?;
                if !self.wrmsr.is_emulated(index) {
                    wrmsr(index, ctx.msr_value());
                }
                Ok(ExitType::IncrementRip)
            }

            VmxBasicExitReason::MonitorTrapFlag => {
                self.monitor_trap.dispatch(ctx)?;
                Ok(ExitType::Continue)
            }

            VmxBasicExitReason::EptViolation => {
                let qualification =
                    EptViolationQualification::from_exit_qualification(ctx.exit_qualification);
                self.ept_violation.dispatch(&qualification, ctx)?;
                // Re-execute the faulting access.
                Ok(ExitType::Continue)
            }

            VmxBasicExitReason::VmxPreemptionTimerExpired => {
                self.preemption_timer.dispatch(ctx)?;
                Ok(ExitType::Continue)
            }

            VmxBasicExitReason::Xsetbv => {
                if self.xsetbv.has_handlers() {
                    self.xsetbv.dispatch(ctx)?;
                }
                Ok(Self::complete_xsetbv(ctx))
            }

            // A guest probing VMX instructions gets #UD, like hardware
            // without VMX would deliver.
            VmxBasicExitReason::Vmcall
            | VmxBasicExitReason::Vmclear
            | VmxBasicExitReason::Vmlaunch
            | VmxBasicExitReason::Vmptrld
            | VmxBasicExitReason::Vmptrst
            | VmxBasicExitReason::Vmread
            | VmxBasicExitReason::Vmresume
            | VmxBasicExitReason::Vmwrite
            | VmxBasicExitReason::Vmxoff
            | VmxBasicExitReason::Vmxon
            | VmxBasicExitReason::Invept
            | VmxBasicExitReason::Invvpid => {
                InterruptWindowComponent::inject_exception(UD_VECTOR, None);
                Ok(ExitType::Continue)
            }

            _ => Err(HypervisorError::HandlerFatal),
        }
    }

    fn complete_cr_access(&mut self, access: &CrAccess, ctx: &mut ExitContext) {
        match (access.cr, access.access) {
            (0, CrAccessType::MovToCr) => {
                let value = ctx.gpr(access.gpr);
                vmwrite(vmcs_fields::guest::CR0, value);
                vmwrite(vmcs_fields::control::CR0_READ_SHADOW, value);
            }
            (3, CrAccessType::MovFromCr) => {
                let value = vmread(vmcs_fields::guest::CR3);
                ctx.set_gpr(access.gpr, value);
            }
            (3, CrAccessType::MovToCr) => {
                vmwrite(vmcs_fields::guest::CR3, ctx.gpr(access.gpr));
            }
            (4, CrAccessType::MovToCr) => {
                let value = ctx.gpr(access.gpr);
                vmwrite(vmcs_fields::guest::CR4, value);
                vmwrite(vmcs_fields::control::CR4_READ_SHADOW, value);
            }
            _ => {}
        }
    }

    fn complete_io_in(access: &IoAccess, ctx: &mut ExitContext) {
        match access.size {
            1 => ctx.regs.rax = (ctx.regs.rax & !0xFF) | inb(access.port) as u64,
            2 => ctx.regs.rax = (ctx.regs.rax & !0xFFFF) | inw(access.port) as u64,
            _ => ctx.regs.rax = inl(access.port) as u64,
        }
    }

    fn complete_io_out(access: &IoAccess, ctx: &ExitContext) {
        match access.size {
            1 => outb(access.port, ctx.regs.rax as u8),
            2 => outw(access.port, ctx.regs.rax as u16),
            _ => outl(access.port, ctx.regs.rax as u32),
        }
    }

    fn complete_xsetbv(ctx: &ExitContext) -> ExitType {
        const CR4_OSXSAVE: u64 = 1 << 18;

        let xcr = ctx.regs.rcx as u32;
        if xcr != 0 {
            // The fault is delivered at the instruction, which must not
            // be skipped.
            InterruptWindowComponent::inject_exception(GP_VECTOR, Some(0));
            return ExitType::Continue;
        }

        // The guest already passed the architectural permission checks;
        // make sure the host CR4 allows the write before executing it.
        support::cr4_write(support::cr4() | CR4_OSXSAVE);

        let value = (ctx.regs.rdx << 32) | (ctx.regs.rax & 0xFFFF_FFFF);
        support::xsetbv(value);
        ExitType::IncrementRip
    }

    fn advance_guest_rip(&mut self) {
        let len = vmread(vmcs_fields::ro::VMEXIT_INSTRUCTION_LEN);
        self.guest_registers.rip += len;
        vmwrite(vmcs_fields::guest::RIP, self.guest_registers.rip);
    }

    fn entry_succeeded(flags: RFlags) -> Result<(), HypervisorError> {
        if flags.contains(RFlags::FLAGS_ZF) {
            let error = vmread(vmcs_fields::ro::VM_INSTRUCTION_ERROR) as u32;
            match VmInstructionError::from_u32(error) {
                Some(e) => log::error!("VM instruction error: {e:?}"),
                None => log::error!("unknown VM instruction error: {error:#x}"),
            }
            return Err(HypervisorError::VmxEntryFailure);
        }
        if flags.contains(RFlags::FLAGS_CF) {
            return Err(HypervisorError::VmxEntryFailure);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Fatal-exit protocol
    // ---------------------------------------------------------------

    /// Pretty-prints the guest register file, control registers, the
    /// faulting addresses, and the decoded exit reason. When the exit
    /// indicates a failed VM entry, the full VMCS consistency dump
    /// follows.
    pub fn dump(&self, message: &str) {
        let raw_reason = vmread(vmcs_fields::ro::EXIT_REASON) as u32;

        log::error!("vcpu {}: {message}", self.id);
        log::error!("general purpose registers");
        log::error!("{:?}", self.guest_registers);

        log::error!("control registers");
        log::error!(
            "  cr0: {:#018x}  cr2: {:#018x}  cr3: {:#018x}  cr4: {:#018x}",
            vmread(vmcs_fields::guest::CR0),
            support::cr2(),
            vmread(vmcs_fields::guest::CR3),
            vmread(vmcs_fields::guest::CR4),
        );

        log::error!("addressing");
        log::error!(
            "  linear address: {:#018x}  physical address: {:#018x}",
            vmread(vmcs_fields::ro::GUEST_LINEAR_ADDR),
            vmread(vmcs_fields::ro::GUEST_PHYSICAL_ADDR_FULL),
        );

        log::error!("exit info");
        let description = VmxBasicExitReason::from_u32(raw_reason)
            .map_or("unknown", |reason| reason.description());
        log::error!(
            "  reason: {:#x} ({description})  qualification: {:#018x}",
            raw_reason,
            vmread(vmcs_fields::ro::EXIT_QUALIFICATION),
        );

        if raw_reason & EXIT_REASON_VM_ENTRY_FAILURE != 0 {
            log::error!("VM entry failure; VMCS consistency dump follows");
            log::error!("{:?}", self.vmcs_region);
        }
    }

    /// `dump` then park the CPU. Never returns.
    pub fn halt(&self, message: &str) -> ! {
        self.dump(message);
        support::stop();
    }

    // ---------------------------------------------------------------
    // EPT and address translation
    // ---------------------------------------------------------------

    /// Borrows the externally owned EPT map. The map must outlive this
    /// vCPU; translation and the map_* wrappers use it from here on.
    pub fn set_eptp(&mut self, map: &mut EptMap) {
        self.ept = Some(map as *mut EptMap);
    }

    pub fn disable_ept(&mut self) {
        self.ept = None;
    }

    fn ept(&self) -> Option<&EptMap> {
        self.ept.map(|p| unsafe { &*p })
    }

    fn ept_mut(&mut self) -> Result<&mut EptMap, HypervisorError> {
        match self.ept {
            Some(p) => Ok(unsafe { &mut *p }),
            None => Err(HypervisorError::EptNotConfigured),
        }
    }

    /// Guest-physical to host-physical. Identity without an EPT.
    pub fn gpa_to_hpa(&self, gpa: u64) -> Result<(u64, u64), HypervisorError> {
        addresses::gpa_to_hpa(self.ept(), gpa)
    }

    /// Guest-virtual to guest-physical through the guest's own tables.
    pub fn gva_to_gpa(&self, gva: u64) -> Result<(u64, u64), HypervisorError> {
        addresses::gva_to_gpa(
            self.ept(),
            vmread(vmcs_fields::guest::CR0),
            vmread(vmcs_fields::guest::CR3),
            gva,
        )
    }

    /// Guest-virtual to host-physical.
    pub fn gva_to_hpa(&self, gva: u64) -> Result<(u64, u64), HypervisorError> {
        addresses::gva_to_hpa(
            self.ept(),
            vmread(vmcs_fields::guest::CR0),
            vmread(vmcs_fields::guest::CR3),
            gva,
        )
    }

    pub fn map_1g_ro(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?.map_1g(gpa, hpa, crate::intel::ept::EptAttr::ReadOnly)
    }

    pub fn map_2m_ro(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?.map_2m(gpa, hpa, crate::intel::ept::EptAttr::ReadOnly)
    }

    pub fn map_4k_ro(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?.map_4k(gpa, hpa, crate::intel::ept::EptAttr::ReadOnly)
    }

    pub fn map_1g_rw(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?.map_1g(gpa, hpa, crate::intel::ept::EptAttr::ReadWrite)
    }

    pub fn map_2m_rw(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?.map_2m(gpa, hpa, crate::intel::ept::EptAttr::ReadWrite)
    }

    pub fn map_4k_rw(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?.map_4k(gpa, hpa, crate::intel::ept::EptAttr::ReadWrite)
    }

    pub fn map_1g_rwe(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?
            .map_1g(gpa, hpa, crate::intel::ept::EptAttr::ReadWriteExecute)
    }

    pub fn map_2m_rwe(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?
            .map_2m(gpa, hpa, crate::intel::ept::EptAttr::ReadWriteExecute)
    }

    pub fn map_4k_rwe(&mut self, gpa: u64, hpa: u64) -> Result<(), HypervisorError> {
        self.ept_mut()?
            .map_4k(gpa, hpa, crate::intel::ept::EptAttr::ReadWriteExecute)
    }

    // ---------------------------------------------------------------
    // Control register surface
    // ---------------------------------------------------------------

    pub fn add_wrcr0_handler(&mut self, mask: u64, delegate: HandlerDelegate) {
        self.control_register.add_wrcr0_handler(delegate);
        ControlRegisterComponent::enable_wrcr0_exiting(mask);
    }

    pub fn add_rdcr3_handler(&mut self, delegate: HandlerDelegate) {
        self.control_register.add_rdcr3_handler(delegate);
        ControlRegisterComponent::enable_rdcr3_exiting();
    }

    pub fn add_wrcr3_handler(&mut self, delegate: HandlerDelegate) {
        self.control_register.add_wrcr3_handler(delegate);
        ControlRegisterComponent::enable_wrcr3_exiting();
    }

    pub fn add_wrcr4_handler(&mut self, mask: u64, delegate: HandlerDelegate) {
        self.control_register.add_wrcr4_handler(delegate);
        ControlRegisterComponent::enable_wrcr4_exiting(mask);
    }

    // ---------------------------------------------------------------
    // EPT violation surface
    // ---------------------------------------------------------------

    pub fn add_ept_read_violation_handler(&mut self, delegate: HandlerDelegate) {
        self.ept_violation.add_read_handler(delegate);
    }

    pub fn add_ept_write_violation_handler(&mut self, delegate: HandlerDelegate) {
        self.ept_violation.add_write_handler(delegate);
    }

    pub fn add_ept_execute_violation_handler(&mut self, delegate: HandlerDelegate) {
        self.ept_violation.add_execute_handler(delegate);
    }

    pub fn add_default_ept_read_violation_handler(&mut self, delegate: HandlerDelegate) {
        self.ept_violation.set_default_read_handler(delegate);
    }

    pub fn add_default_ept_write_violation_handler(&mut self, delegate: HandlerDelegate) {
        self.ept_violation.set_default_write_handler(delegate);
    }

    pub fn add_default_ept_execute_violation_handler(&mut self, delegate: HandlerDelegate) {
        self.ept_violation.set_default_execute_handler(delegate);
    }

    // ---------------------------------------------------------------
    // Interrupt surface
    // ---------------------------------------------------------------

    pub fn add_external_interrupt_handler(&mut self, delegate: HandlerDelegate) {
        self.external_interrupt.add_handler(delegate);
        ExternalInterruptComponent::enable_exiting();
    }

    pub fn disable_external_interrupts(&mut self) {
        ExternalInterruptComponent::disable_exiting();
    }

    pub fn queue_external_interrupt(&mut self, vector: u8) {
        self.interrupt_window.queue_external_interrupt(vector);
    }

    pub fn inject_external_interrupt(&mut self, vector: u8) {
        InterruptWindowComponent::inject_external_interrupt(vector);
    }

    pub fn inject_exception(&mut self, vector: u8, error_code: Option<u32>) {
        InterruptWindowComponent::inject_exception(vector, error_code);
    }

    pub fn add_interrupt_window_handler(&mut self, delegate: HandlerDelegate) {
        self.interrupt_window.add_handler(delegate);
    }

    // ---------------------------------------------------------------
    // NMI surface
    // ---------------------------------------------------------------

    pub fn add_nmi_handler(&mut self, delegate: HandlerDelegate) {
        self.nmi.add_handler(delegate);
        NmiComponent::enable_exiting();
    }

    pub fn add_default_nmi_handler(&mut self, delegate: HandlerDelegate) {
        self.nmi.set_default_handler(delegate);
    }

    pub fn enable_nmis(&mut self) {
        NmiComponent::enable_exiting();
    }

    pub fn disable_nmis(&mut self) {
        NmiComponent::disable_exiting();
    }

    pub fn queue_nmi(&mut self) {
        self.nmi_window.queue_nmi();
    }

    pub fn inject_nmi(&mut self) {
        NmiWindowComponent::inject_nmi();
    }

    pub fn add_nmi_window_handler(&mut self, delegate: HandlerDelegate) {
        self.nmi_window.add_handler(delegate);
    }

    // ---------------------------------------------------------------
    // MSR surface
    // ---------------------------------------------------------------

    pub fn trap_on_rdmsr_access(&mut self, msr: u32) {
        self.msr_bitmap.trap_on_access(msr, MsrAccessType::Read);
    }

    pub fn trap_on_wrmsr_access(&mut self, msr: u32) {
        self.msr_bitmap.trap_on_access(msr, MsrAccessType::Write);
    }

    pub fn trap_on_all_rdmsr_accesses(&mut self) {
        self.msr_bitmap.trap_on_all_accesses(MsrAccessType::Read);
    }

    pub fn trap_on_all_wrmsr_accesses(&mut self) {
        self.msr_bitmap.trap_on_all_accesses(MsrAccessType::Write);
    }

    pub fn pass_through_rdmsr_access(&mut self, msr: u32) {
        self.msr_bitmap.pass_through_access(msr, MsrAccessType::Read);
    }

    pub fn pass_through_wrmsr_access(&mut self, msr: u32) {
        self.msr_bitmap.pass_through_access(msr, MsrAccessType::Write);
    }

    pub fn pass_through_all_rdmsr_accesses(&mut self) {
        self.msr_bitmap.pass_through_all_accesses(MsrAccessType::Read);
    }

    pub fn pass_through_all_wrmsr_accesses(&mut self) {
        self.msr_bitmap.pass_through_all_accesses(MsrAccessType::Write);
    }

    /// Traps the MSR and registers a read delegate for it.
    pub fn add_rdmsr_handler(&mut self, msr: u32, delegate: HandlerDelegate) {
        self.trap_on_rdmsr_access(msr);
        self.rdmsr.add_handler(msr, delegate);
    }

    /// Traps the MSR and registers a write delegate for it.
    pub fn add_wrmsr_handler(&mut self, msr: u32, delegate: HandlerDelegate) {
        self.trap_on_wrmsr_access(msr);
        self.wrmsr.add_handler(msr, delegate);
    }

    /// Registers a read delegate whose result replaces the hardware MSR.
    pub fn emulate_rdmsr(&mut self, msr: u32, delegate: HandlerDelegate) {
        self.add_rdmsr_handler(msr, delegate);
        self.rdmsr.emulate(msr);
    }

    /// Registers a write delegate that swallows the hardware write.
    pub fn emulate_wrmsr(&mut self, msr: u32, delegate: HandlerDelegate) {
        self.add_wrmsr_handler(msr, delegate);
        self.wrmsr.emulate(msr);
    }

    pub fn add_default_rdmsr_handler(&mut self, delegate: HandlerDelegate) {
        self.rdmsr.set_default_handler(delegate);
    }

    pub fn add_default_wrmsr_handler(&mut self, delegate: HandlerDelegate) {
        self.wrmsr.set_default_handler(delegate);
    }

    pub fn trap_on_msr_access(&mut self, msr: u32) {
        self.trap_on_rdmsr_access(msr);
        self.trap_on_wrmsr_access(msr);
    }

    pub fn pass_through_msr_access(&mut self, msr: u32) {
        self.pass_through_rdmsr_access(msr);
        self.pass_through_wrmsr_access(msr);
    }

    // ---------------------------------------------------------------
    // I/O surface
    // ---------------------------------------------------------------

    pub fn trap_on_io_access(&mut self, port: u16) {
        self.io_bitmaps.trap_on_access(port);
    }

    pub fn pass_through_io_access(&mut self, port: u16) {
        self.io_bitmaps.pass_through_access(port);
    }

    pub fn trap_on_all_io_accesses(&mut self) {
        self.io_bitmaps.trap_on_all_accesses();
    }

    pub fn pass_through_all_io_accesses(&mut self) {
        self.io_bitmaps.pass_through_all_accesses();
    }

    /// Traps the port and registers a delegate for it.
    pub fn add_io_handler(&mut self, port: u16, delegate: HandlerDelegate) {
        self.trap_on_io_access(port);
        self.io_instruction.add_handler(port, delegate);
    }

    /// Registers a delegate whose result replaces the real port access.
    pub fn emulate_io(&mut self, port: u16, delegate: HandlerDelegate) {
        self.add_io_handler(port, delegate);
        self.io_instruction.emulate(port);
    }

    pub fn add_default_io_handler(&mut self, delegate: HandlerDelegate) {
        self.io_instruction.set_default_handler(delegate);
    }

    // ---------------------------------------------------------------
    // Monitor trap, preemption timer, XSETBV, CPUID
    // ---------------------------------------------------------------

    pub fn add_monitor_trap_handler(&mut self, delegate: HandlerDelegate) {
        self.monitor_trap.add_handler(delegate);
    }

    pub fn enable_monitor_trap_flag(&mut self) {
        MonitorTrapComponent::enable();
    }

    pub fn add_preemption_timer_handler(&mut self, delegate: HandlerDelegate) {
        self.preemption_timer.add_handler(delegate);
    }

    pub fn set_preemption_timer(&mut self, value: u64) {
        PreemptionTimerComponent::set_timer(value);
    }

    pub fn get_preemption_timer(&self) -> u64 {
        PreemptionTimerComponent::get_timer()
    }

    pub fn enable_preemption_timer(&mut self) {
        PreemptionTimerComponent::enable_exiting();
    }

    pub fn disable_preemption_timer(&mut self) {
        PreemptionTimerComponent::disable_exiting();
    }

    pub fn add_xsetbv_handler(&mut self, delegate: HandlerDelegate) {
        self.xsetbv.add_handler(delegate);
    }

    pub fn add_cpuid_handler(&mut self, delegate: HandlerDelegate) {
        self.cpuid.add_handler(delegate);
    }

    /// Tears the CPU out of VMX operation.
    pub fn devirtualize(&mut self) -> Result<(), HypervisorError> {
        support::vmclear(self.vmcs_region.as_ref() as *const _ as u64)?;
        support::vmxoff()
    }
}

/// Allocates and zeros memory for a type, boxed.
///
/// # Safety
///
/// `T` must be valid when fully zeroed.
unsafe fn box_zeroed<T>() -> Box<T> {
    use alloc::alloc::{alloc_zeroed, handle_alloc_error, Layout};

    let layout = Layout::new::<T>();
    let ptr = unsafe { alloc_zeroed(layout) }.cast::<T>();
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    unsafe { Box::from_raw(ptr) }
}
