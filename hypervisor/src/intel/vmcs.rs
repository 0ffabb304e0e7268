//! The VMCS region and its three one-shot writers.
//!
//! `write_host_state`, `write_guest_state`, and `write_control_state`
//! each run exactly once while a vCPU is constructed. Guest state is a
//! snapshot of the context the CPU was virtualized from and is only taken
//! on the host vCPU; application processors inherit from IPI state.
//!
//! Reference: Intel SDM Vol 3, 25.4 Guest-State Area, 25.5 Host-State
//! Area, 25.6-25.8 VM-Execution/Exit/Entry Control Fields.

use {
    crate::{
        error::HypervisorError,
        intel::{
            bitmap::{IoBitmaps, MsrBitmap},
            controls::{adjust_vmx_controls, VmxControl},
            descriptor::{
                access_rights_from_attrib, gdt_descriptor_attrib, gdt_descriptor_base,
                gdt_descriptor_limit, scale_limit, HostDescriptors, ACCESS_RIGHTS_TSS_BUSY,
            },
            host::HostState,
            support::{cr3, cr4, dr7_read, rdmsr, sgdt, sidt, vmclear, vmptrld, vmread, vmwrite},
            vmlaunch::vmexit_landing,
        },
    },
    bit_field::BitField,
    core::fmt,
    x86::{
        bits64::{paging::BASE_PAGE_SIZE, rflags},
        controlregs,
        dtables::ldtr,
        msr,
        segmentation::{cs, ds, es, fs, gs, ss, SegmentSelector},
        task,
        vmx::vmcs,
    },
};

/// The VMCS region: 4 KiB, physical-address aligned.
///
/// Reference: Intel SDM Vol 3, 25.2 Format of the VMCS Region.
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub reserved: [u8; BASE_PAGE_SIZE - 8],
}

impl Vmcs {
    pub fn init(&mut self) {
        self.revision_id = rdmsr(msr::IA32_VMX_BASIC) as u32;
        self.revision_id.set_bit(31, false);
        self.abort_indicator = 0;
    }

    /// Makes this region the current VMCS.
    pub fn activate(&mut self) -> Result<(), HypervisorError> {
        self.init();
        let pa = self as *const _ as u64;
        vmclear(pa)?;
        vmptrld(pa)?;
        Ok(())
    }
}

/// Writes the host-state area: ring-0 selectors into the per-vCPU GDT,
/// control registers from the one-shot host globals, descriptor-table
/// bases, and the exit entry point with its stack.
pub fn write_host_state(
    host: &HostDescriptors,
    state: &HostState,
    primary_stack_top: u64,
) {
    log::debug!("writing host state");

    vmwrite(vmcs::host::CS_SELECTOR, host.cs.bits());
    vmwrite(vmcs::host::SS_SELECTOR, host.ss.bits());
    vmwrite(vmcs::host::DS_SELECTOR, host.ss.bits());
    vmwrite(vmcs::host::ES_SELECTOR, host.ss.bits());
    vmwrite(vmcs::host::FS_SELECTOR, host.fs.bits());
    vmwrite(vmcs::host::GS_SELECTOR, host.gs.bits());
    vmwrite(vmcs::host::TR_SELECTOR, host.tr.bits());

    vmwrite(vmcs::host::CR0, state.cr0);
    vmwrite(vmcs::host::CR3, state.cr3);
    vmwrite(vmcs::host::CR4, state.cr4);
    vmwrite(vmcs::host::IA32_PAT_FULL, state.pat);
    vmwrite(vmcs::host::IA32_EFER_FULL, state.efer);

    vmwrite(vmcs::host::FS_BASE, 0u64);
    vmwrite(vmcs::host::GS_BASE, 0u64);
    vmwrite(vmcs::host::TR_BASE, host.tss_base());
    vmwrite(vmcs::host::GDTR_BASE, host.gdtr().base as u64);
    vmwrite(vmcs::host::IDTR_BASE, host.idtr_base());

    vmwrite(vmcs::host::IA32_SYSENTER_CS, 0u64);
    vmwrite(vmcs::host::IA32_SYSENTER_ESP, 0u64);
    vmwrite(vmcs::host::IA32_SYSENTER_EIP, 0u64);

    // The launch trampoline rewrites both on the first entry; these are
    // the architectural defaults for every later exit.
    vmwrite(vmcs::host::RIP, vmexit_landing as usize as u64);
    vmwrite(vmcs::host::RSP, primary_stack_top);
}

/// Snapshots the executing context into the guest-state area. Only the
/// host vCPU does this; per-segment state is derived from the live GDT.
pub fn write_guest_state(guest_rip: u64, guest_rsp: u64) {
    log::debug!("writing guest state");

    let gdtr = sgdt();
    let idtr = sidt();

    let selectors = [
        (vmcs::guest::ES_SELECTOR, es()),
        (vmcs::guest::CS_SELECTOR, cs()),
        (vmcs::guest::SS_SELECTOR, ss()),
        (vmcs::guest::DS_SELECTOR, ds()),
        (vmcs::guest::FS_SELECTOR, fs()),
        (vmcs::guest::GS_SELECTOR, gs()),
        (vmcs::guest::LDTR_SELECTOR, unsafe { ldtr() }),
        (vmcs::guest::TR_SELECTOR, unsafe { task::tr() }),
    ];

    for (field, selector) in selectors {
        vmwrite(field, selector.bits());
    }

    write_guest_segment(vmcs::guest::ES_SELECTOR, es(), &gdtr, false);
    write_guest_segment(vmcs::guest::CS_SELECTOR, cs(), &gdtr, false);
    write_guest_segment(vmcs::guest::SS_SELECTOR, ss(), &gdtr, false);
    write_guest_segment(vmcs::guest::DS_SELECTOR, ds(), &gdtr, false);
    write_guest_segment(vmcs::guest::FS_SELECTOR, fs(), &gdtr, false);
    write_guest_segment(vmcs::guest::GS_SELECTOR, gs(), &gdtr, false);
    write_guest_segment(vmcs::guest::LDTR_SELECTOR, unsafe { ldtr() }, &gdtr, false);
    write_guest_segment(vmcs::guest::TR_SELECTOR, unsafe { task::tr() }, &gdtr, true);

    // FS/GS bases come from their MSRs, not the descriptor table.
    vmwrite(vmcs::guest::FS_BASE, rdmsr(msr::IA32_FS_BASE));
    vmwrite(vmcs::guest::GS_BASE, rdmsr(msr::IA32_GS_BASE));

    vmwrite(vmcs::guest::GDTR_BASE, gdtr.base as u64);
    vmwrite(vmcs::guest::GDTR_LIMIT, gdtr.limit as u64);
    vmwrite(vmcs::guest::IDTR_BASE, idtr.base as u64);
    vmwrite(vmcs::guest::IDTR_LIMIT, idtr.limit as u64);

    vmwrite(vmcs::guest::CR0, unsafe { controlregs::cr0() }.bits() as u64);
    vmwrite(vmcs::guest::CR3, cr3());
    vmwrite(vmcs::guest::CR4, cr4());
    vmwrite(vmcs::guest::DR7, dr7_read());

    vmwrite(vmcs::guest::RSP, guest_rsp);
    vmwrite(vmcs::guest::RIP, guest_rip);
    vmwrite(vmcs::guest::RFLAGS, rflags::read().bits());

    vmwrite(vmcs::guest::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS));
    vmwrite(vmcs::guest::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP));
    vmwrite(vmcs::guest::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP));

    vmwrite(vmcs::guest::IA32_DEBUGCTL_FULL, rdmsr(msr::IA32_DEBUGCTL));
    vmwrite(vmcs::guest::IA32_PAT_FULL, rdmsr(msr::IA32_PAT));
    vmwrite(vmcs::guest::IA32_EFER_FULL, rdmsr(msr::IA32_EFER));

    // Only meaningful on CPUs reporting architectural performance
    // monitoring version 2 or later.
    let cpuid = x86::cpuid::CpuId::new();
    if cpuid
        .get_performance_monitoring_info()
        .map_or(false, |pm| pm.version_id() >= 2)
    {
        vmwrite(
            vmcs::guest::IA32_PERF_GLOBAL_CTRL_FULL,
            rdmsr(msr::MSR_PERF_GLOBAL_CTRL),
        );
    }

    vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);
}

fn write_guest_segment(
    selector_field: u32,
    selector: SegmentSelector,
    gdtr: &x86::dtables::DescriptorTablePointer<u64>,
    is_tr: bool,
) {
    // Guest segment fields sit at fixed offsets from their selector
    // field encodings (ES base is 0x6806, ES limit 0x4800, ES access
    // rights 0x4814; the rest follow in selector order, stride 2).
    let base_field = selector_field - 0x800 + 0x6806;
    let limit_field = selector_field - 0x800 + 0x4800;
    let access_field = selector_field - 0x800 + 0x4814;

    let index = selector.bits() >> 3;

    if index == 0 && !is_tr {
        vmwrite(base_field, 0u64);
        vmwrite(limit_field, 0u64);
        vmwrite(access_field, access_rights_from_attrib(0));
        return;
    }

    let base = gdt_descriptor_base(gdtr, selector.bits()).unwrap_or(0);
    let attrib = gdt_descriptor_attrib(gdtr, selector.bits()).unwrap_or(0);
    let limit = gdt_descriptor_limit(gdtr, selector.bits()).unwrap_or(0);

    // TR must always be usable; a zero selector still reports a busy TSS.
    let access = if is_tr && attrib == 0 {
        ACCESS_RIGHTS_TSS_BUSY
    } else {
        access_rights_from_attrib(attrib)
    };

    vmwrite(base_field, base);
    vmwrite(limit_field, scale_limit(limit, attrib));
    vmwrite(access_field, access);
}

/// Which optional execution features a vCPU gets.
pub struct ControlOptions {
    /// The EPT pointer to install, if translation is enabled.
    pub eptp: Option<u64>,

    /// The VPID tag for this vCPU; zero disables VPID tagging.
    pub vpid: u16,

    /// The host vCPU additionally passes RDTSCP/INVPCID/XSAVES through.
    pub is_host_vcpu: bool,
}

/// Writes the pin-based, processor-based, VM-exit, and VM-entry control
/// fields. Every write is the capability base `(allowed_0 & allowed_1)`
/// plus optional bits allowed-1 permits.
pub fn write_control_state(
    msr_bitmap: &MsrBitmap,
    io_bitmaps: &IoBitmaps,
    options: &ControlOptions,
) {
    log::debug!("writing control state");

    use vmcs::control::{EntryControls, ExitControls, PrimaryControls, SecondaryControls};

    let primary = PrimaryControls::SECONDARY_CONTROLS
        | PrimaryControls::USE_MSR_BITMAPS
        | PrimaryControls::USE_IO_BITMAPS;

    let mut secondary = SecondaryControls::ENABLE_VPID;
    if options.eptp.is_some() {
        secondary |= SecondaryControls::ENABLE_EPT;
    }
    if options.is_host_vcpu {
        secondary |= SecondaryControls::ENABLE_RDTSCP
            | SecondaryControls::ENABLE_INVPCID
            | SecondaryControls::ENABLE_XSAVES_XRSTORS;
    }

    let exit = ExitControls::SAVE_DEBUG_CONTROLS
        | ExitControls::HOST_ADDRESS_SPACE_SIZE
        | ExitControls::SAVE_IA32_PAT
        | ExitControls::LOAD_IA32_PAT
        | ExitControls::SAVE_IA32_EFER
        | ExitControls::LOAD_IA32_EFER;

    let entry = EntryControls::LOAD_DEBUG_CONTROLS
        | EntryControls::IA32E_MODE_GUEST
        | EntryControls::LOAD_IA32_PAT
        | EntryControls::LOAD_IA32_EFER;

    vmwrite(
        vmcs::control::PINBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::PinBased, 0),
    );
    vmwrite(
        vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::ProcessorBased, primary.bits()),
    );
    vmwrite(
        vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::ProcessorBased2, secondary.bits()),
    );
    vmwrite(
        vmcs::control::VMEXIT_CONTROLS,
        adjust_vmx_controls(VmxControl::VmExit, exit.bits()),
    );
    vmwrite(
        vmcs::control::VMENTRY_CONTROLS,
        adjust_vmx_controls(VmxControl::VmEntry, entry.bits()),
    );

    vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, msr_bitmap.as_ptr());
    vmwrite(vmcs::control::IO_BITMAP_A_ADDR_FULL, io_bitmaps.a_ptr());
    vmwrite(vmcs::control::IO_BITMAP_B_ADDR_FULL, io_bitmaps.b_ptr());

    if let Some(eptp) = options.eptp {
        vmwrite(vmcs::control::EPTP_FULL, eptp);
    }
    vmwrite(vmcs::control::VPID, options.vpid);
}

/// Dumps the live VMCS fields. The fatal-exit path prints this.
impl fmt::Debug for Vmcs {
    #[rustfmt::skip]
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        format.debug_struct("Vmcs")
            .field("Current VMCS", &(self as *const _))
            .field("Revision ID", &self.revision_id)

            .field("Guest CR0", &vmread(vmcs::guest::CR0))
            .field("Guest CR3", &vmread(vmcs::guest::CR3))
            .field("Guest CR4", &vmread(vmcs::guest::CR4))
            .field("Guest DR7", &vmread(vmcs::guest::DR7))
            .field("Guest RSP", &vmread(vmcs::guest::RSP))
            .field("Guest RIP", &vmread(vmcs::guest::RIP))
            .field("Guest RFLAGS", &vmread(vmcs::guest::RFLAGS))

            .field("Guest CS Selector", &vmread(vmcs::guest::CS_SELECTOR))
            .field("Guest SS Selector", &vmread(vmcs::guest::SS_SELECTOR))
            .field("Guest TR Selector", &vmread(vmcs::guest::TR_SELECTOR))
            .field("Guest GDTR Base", &vmread(vmcs::guest::GDTR_BASE))
            .field("Guest IDTR Base", &vmread(vmcs::guest::IDTR_BASE))
            .field("Guest IA32_EFER", &vmread(vmcs::guest::IA32_EFER_FULL))
            .field("Guest IA32_PAT", &vmread(vmcs::guest::IA32_PAT_FULL))
            .field("Guest VMCS Link Pointer", &vmread(vmcs::guest::LINK_PTR_FULL))

            .field("Host CR0", &vmread(vmcs::host::CR0))
            .field("Host CR3", &vmread(vmcs::host::CR3))
            .field("Host CR4", &vmread(vmcs::host::CR4))
            .field("Host RSP", &vmread(vmcs::host::RSP))
            .field("Host RIP", &vmread(vmcs::host::RIP))
            .field("Host CS Selector", &vmread(vmcs::host::CS_SELECTOR))
            .field("Host TR Base", &vmread(vmcs::host::TR_BASE))
            .field("Host GDTR Base", &vmread(vmcs::host::GDTR_BASE))
            .field("Host IDTR Base", &vmread(vmcs::host::IDTR_BASE))

            .field("Pin-Based Controls", &vmread(vmcs::control::PINBASED_EXEC_CONTROLS))
            .field("Primary Proc-Based Controls", &vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS))
            .field("Secondary Proc-Based Controls", &vmread(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS))
            .field("VM-Entry Controls", &vmread(vmcs::control::VMENTRY_CONTROLS))
            .field("VM-Exit Controls", &vmread(vmcs::control::VMEXIT_CONTROLS))
            .field("CR0 Read Shadow", &vmread(vmcs::control::CR0_READ_SHADOW))
            .field("CR4 Read Shadow", &vmread(vmcs::control::CR4_READ_SHADOW))
            .field("MSR Bitmaps Address", &vmread(vmcs::control::MSR_BITMAPS_ADDR_FULL))
            .field("EPT Pointer", &vmread(vmcs::control::EPTP_FULL))
            .finish_non_exhaustive()
    }
}
