//! Decoded VM-exit reasons, VM-instruction errors, and exit
//! qualifications.

/// Basic VM-exit reasons.
///
/// Reference: Intel SDM Vol 3, Appendix C, Table C-1. Basic Exit Reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailureInvalidGuestState = 33,
    EntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    EntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
}

impl VmxBasicExitReason {
    pub fn from_u32(value: u32) -> Option<Self> {
        // Bits 15:0 carry the basic reason; the rest qualify the exit.
        match value & 0xFFFF {
            0 => Some(Self::ExceptionOrNmi),
            1 => Some(Self::ExternalInterrupt),
            2 => Some(Self::TripleFault),
            3 => Some(Self::InitSignal),
            4 => Some(Self::StartupIpi),
            5 => Some(Self::IoSystemManagementInterrupt),
            6 => Some(Self::OtherSmi),
            7 => Some(Self::InterruptWindow),
            8 => Some(Self::NmiWindow),
            9 => Some(Self::TaskSwitch),
            10 => Some(Self::Cpuid),
            11 => Some(Self::Getsec),
            12 => Some(Self::Hlt),
            13 => Some(Self::Invd),
            14 => Some(Self::Invlpg),
            15 => Some(Self::Rdpmc),
            16 => Some(Self::Rdtsc),
            17 => Some(Self::Rsm),
            18 => Some(Self::Vmcall),
            19 => Some(Self::Vmclear),
            20 => Some(Self::Vmlaunch),
            21 => Some(Self::Vmptrld),
            22 => Some(Self::Vmptrst),
            23 => Some(Self::Vmread),
            24 => Some(Self::Vmresume),
            25 => Some(Self::Vmwrite),
            26 => Some(Self::Vmxoff),
            27 => Some(Self::Vmxon),
            28 => Some(Self::ControlRegisterAccesses),
            29 => Some(Self::MovDr),
            30 => Some(Self::IoInstruction),
            31 => Some(Self::Rdmsr),
            32 => Some(Self::Wrmsr),
            33 => Some(Self::EntryFailureInvalidGuestState),
            34 => Some(Self::EntryFailureMsrLoading),
            36 => Some(Self::Mwait),
            37 => Some(Self::MonitorTrapFlag),
            39 => Some(Self::Monitor),
            40 => Some(Self::Pause),
            41 => Some(Self::EntryFailureMachineCheckEvent),
            43 => Some(Self::TprBelowThreshold),
            44 => Some(Self::ApicAccess),
            45 => Some(Self::VirtualizedEoi),
            46 => Some(Self::AccessToGdtrOrIdtr),
            47 => Some(Self::AccessToLdtrOrTr),
            48 => Some(Self::EptViolation),
            49 => Some(Self::EptMisconfiguration),
            50 => Some(Self::Invept),
            51 => Some(Self::Rdtscp),
            52 => Some(Self::VmxPreemptionTimerExpired),
            53 => Some(Self::Invvpid),
            54 => Some(Self::WbinvdOrWbnoinvd),
            55 => Some(Self::Xsetbv),
            56 => Some(Self::ApicWrite),
            57 => Some(Self::Rdrand),
            58 => Some(Self::Invpcid),
            59 => Some(Self::Vmfunc),
            60 => Some(Self::Encls),
            61 => Some(Self::Rdseed),
            62 => Some(Self::PageModificationLogFull),
            63 => Some(Self::Xsaves),
            64 => Some(Self::Xrstors),
            _ => None,
        }
    }

    /// The textual description printed by the fatal-exit dump.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ExceptionOrNmi => "exception or non-maskable interrupt",
            Self::ExternalInterrupt => "external interrupt",
            Self::TripleFault => "triple fault",
            Self::InitSignal => "INIT signal",
            Self::StartupIpi => "start-up IPI",
            Self::IoSystemManagementInterrupt => "I/O system-management interrupt",
            Self::OtherSmi => "other SMI",
            Self::InterruptWindow => "interrupt window",
            Self::NmiWindow => "NMI window",
            Self::TaskSwitch => "task switch",
            Self::Cpuid => "CPUID",
            Self::Getsec => "GETSEC",
            Self::Hlt => "HLT",
            Self::Invd => "INVD",
            Self::Invlpg => "INVLPG",
            Self::Rdpmc => "RDPMC",
            Self::Rdtsc => "RDTSC",
            Self::Rsm => "RSM",
            Self::Vmcall => "VMCALL",
            Self::Vmclear => "VMCLEAR",
            Self::Vmlaunch => "VMLAUNCH",
            Self::Vmptrld => "VMPTRLD",
            Self::Vmptrst => "VMPTRST",
            Self::Vmread => "VMREAD",
            Self::Vmresume => "VMRESUME",
            Self::Vmwrite => "VMWRITE",
            Self::Vmxoff => "VMXOFF",
            Self::Vmxon => "VMXON",
            Self::ControlRegisterAccesses => "control-register access",
            Self::MovDr => "MOV DR",
            Self::IoInstruction => "I/O instruction",
            Self::Rdmsr => "RDMSR",
            Self::Wrmsr => "WRMSR",
            Self::EntryFailureInvalidGuestState => "VM-entry failure: invalid guest state",
            Self::EntryFailureMsrLoading => "VM-entry failure: MSR loading",
            Self::Mwait => "MWAIT",
            Self::MonitorTrapFlag => "monitor trap flag",
            Self::Monitor => "MONITOR",
            Self::Pause => "PAUSE",
            Self::EntryFailureMachineCheckEvent => "VM-entry failure: machine-check event",
            Self::TprBelowThreshold => "TPR below threshold",
            Self::ApicAccess => "APIC access",
            Self::VirtualizedEoi => "virtualized EOI",
            Self::AccessToGdtrOrIdtr => "access to GDTR or IDTR",
            Self::AccessToLdtrOrTr => "access to LDTR or TR",
            Self::EptViolation => "EPT violation",
            Self::EptMisconfiguration => "EPT misconfiguration",
            Self::Invept => "INVEPT",
            Self::Rdtscp => "RDTSCP",
            Self::VmxPreemptionTimerExpired => "VMX-preemption timer expired",
            Self::Invvpid => "INVVPID",
            Self::WbinvdOrWbnoinvd => "WBINVD or WBNOINVD",
            Self::Xsetbv => "XSETBV",
            Self::ApicWrite => "APIC write",
            Self::Rdrand => "RDRAND",
            Self::Invpcid => "INVPCID",
            Self::Vmfunc => "VMFUNC",
            Self::Encls => "ENCLS",
            Self::Rdseed => "RDSEED",
            Self::PageModificationLogFull => "page-modification log full",
            Self::Xsaves => "XSAVES",
            Self::Xrstors => "XRSTORS",
        }
    }
}

/// Bit 31 of the exit reason: the exit was a failed VM entry.
pub const EXIT_REASON_VM_ENTRY_FAILURE: u32 = 1 << 31;

/// VM-instruction error numbers.
///
/// Reference: Intel SDM Vol 3, 31.4 VM Instruction Error Numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmInstructionError {
    VmcallInVmxRoot = 1,
    VmclearInvalidAddress = 2,
    VmclearVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    EntryInvalidControlFields = 7,
    EntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldVmxonPointer = 10,
    VmptrldIncorrectRevision = 11,
    VmreadVmwriteUnsupportedField = 12,
    VmwriteReadOnlyField = 13,
    VmxonInVmxRoot = 15,
    EntryInvalidExecutiveVmcsPointer = 16,
    EntryNonLaunchedExecutiveVmcs = 17,
    EntryExecutiveVmcsPointerNotVmxonPointer = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidExitControlFields = 20,
    VmcallIncorrectMsegRevision = 22,
    VmxoffUnderDualMonitor = 23,
    VmcallInvalidSmmMonitorFeatures = 24,
    EntryInvalidExecutionControlFieldsInExecutiveVmcs = 25,
    EntryEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
}

impl VmInstructionError {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::VmcallInVmxRoot),
            2 => Some(Self::VmclearInvalidAddress),
            3 => Some(Self::VmclearVmxonPointer),
            4 => Some(Self::VmlaunchNonClearVmcs),
            5 => Some(Self::VmresumeNonLaunchedVmcs),
            6 => Some(Self::VmresumeAfterVmxoff),
            7 => Some(Self::EntryInvalidControlFields),
            8 => Some(Self::EntryInvalidHostState),
            9 => Some(Self::VmptrldInvalidAddress),
            10 => Some(Self::VmptrldVmxonPointer),
            11 => Some(Self::VmptrldIncorrectRevision),
            12 => Some(Self::VmreadVmwriteUnsupportedField),
            13 => Some(Self::VmwriteReadOnlyField),
            15 => Some(Self::VmxonInVmxRoot),
            16 => Some(Self::EntryInvalidExecutiveVmcsPointer),
            17 => Some(Self::EntryNonLaunchedExecutiveVmcs),
            18 => Some(Self::EntryExecutiveVmcsPointerNotVmxonPointer),
            19 => Some(Self::VmcallNonClearVmcs),
            20 => Some(Self::VmcallInvalidExitControlFields),
            22 => Some(Self::VmcallIncorrectMsegRevision),
            23 => Some(Self::VmxoffUnderDualMonitor),
            24 => Some(Self::VmcallInvalidSmmMonitorFeatures),
            25 => Some(Self::EntryInvalidExecutionControlFieldsInExecutiveVmcs),
            26 => Some(Self::EntryEventsBlockedByMovSs),
            28 => Some(Self::InvalidOperandToInveptInvvpid),
            _ => None,
        }
    }
}

/// Decoded exit qualification for EPT violations.
///
/// Reference: Intel SDM Vol 3, Table 28-7. Exit Qualification for EPT
/// Violations.
#[derive(Debug, Clone, Copy, Default)]
pub struct EptViolationQualification {
    pub read_access: bool,
    pub write_access: bool,
    pub execute_access: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub valid_guest_linear_address: bool,
    pub caused_by_translation: bool,
}

impl EptViolationQualification {
    pub fn from_exit_qualification(qualification: u64) -> Self {
        Self {
            read_access: qualification & (1 << 0) != 0,
            write_access: qualification & (1 << 1) != 0,
            execute_access: qualification & (1 << 2) != 0,
            readable: qualification & (1 << 3) != 0,
            writable: qualification & (1 << 4) != 0,
            executable: qualification & (1 << 5) != 0,
            valid_guest_linear_address: qualification & (1 << 7) != 0,
            caused_by_translation: qualification & (1 << 8) != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_round_trip_through_the_low_half() {
        assert_eq!(
            VmxBasicExitReason::from_u32(48),
            Some(VmxBasicExitReason::EptViolation)
        );
        assert_eq!(
            VmxBasicExitReason::from_u32(EXIT_REASON_VM_ENTRY_FAILURE | 33),
            Some(VmxBasicExitReason::EntryFailureInvalidGuestState)
        );
        assert_eq!(VmxBasicExitReason::from_u32(0xFFF0), None);
    }

    #[test]
    fn ept_qualification_decodes_cause_bits() {
        let q = EptViolationQualification::from_exit_qualification(0b110);
        assert!(!q.read_access);
        assert!(q.write_access);
        assert!(q.execute_access);
    }
}
