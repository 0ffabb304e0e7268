//! The VMLAUNCH/VMRESUME trampoline.
//!
//! `launch_vm` swaps the full general-purpose and XMM register files
//! between host and guest around a VM entry. On the first entry it points
//! HOST_RSP at the live stack (where the host context was just pushed) and
//! HOST_RIP at `vmexit_landing`, so every subsequent exit funnels back
//! through the same unwinding path and returns to the Rust run loop.

use {crate::intel::capture::GuestRegisters, core::arch::global_asm};

extern "sysv64" {
    /// Launches or resumes the guest described by `registers`.
    ///
    /// `launched` is 0 for the first entry (VMLAUNCH) and nonzero after
    /// (VMRESUME). Returns the RFLAGS value observed after the VMX
    /// instruction; CF/ZF indicate entry failure.
    pub fn launch_vm(registers: &mut GuestRegisters, launched: u64) -> u64;

    /// The VM-exit landing pad installed as HOST_RIP.
    pub fn vmexit_landing();
}

global_asm!(
    r#"
.macro PUSHAQ
    push    rax
    push    rcx
    push    rdx
    push    rbx
    push    rbp
    push    rsi
    push    rdi
    push    r8
    push    r9
    push    r10
    push    r11
    push    r12
    push    r13
    push    r14
    push    r15
.endm

.macro POPAQ
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     r11
    pop     r10
    pop     r9
    pop     r8
    pop     rdi
    pop     rsi
    pop     rbp
    pop     rbx
    pop     rdx
    pop     rcx
    pop     rax
.endm

.macro SAVE_XMM
    sub     rsp, 0x100
    movaps  xmmword ptr [rsp], xmm0
    movaps  xmmword ptr [rsp + 0x10], xmm1
    movaps  xmmword ptr [rsp + 0x20], xmm2
    movaps  xmmword ptr [rsp + 0x30], xmm3
    movaps  xmmword ptr [rsp + 0x40], xmm4
    movaps  xmmword ptr [rsp + 0x50], xmm5
    movaps  xmmword ptr [rsp + 0x60], xmm6
    movaps  xmmword ptr [rsp + 0x70], xmm7
    movaps  xmmword ptr [rsp + 0x80], xmm8
    movaps  xmmword ptr [rsp + 0x90], xmm9
    movaps  xmmword ptr [rsp + 0xA0], xmm10
    movaps  xmmword ptr [rsp + 0xB0], xmm11
    movaps  xmmword ptr [rsp + 0xC0], xmm12
    movaps  xmmword ptr [rsp + 0xD0], xmm13
    movaps  xmmword ptr [rsp + 0xE0], xmm14
    movaps  xmmword ptr [rsp + 0xF0], xmm15
.endm

.macro RESTORE_XMM
    movaps  xmm0, xmmword ptr [rsp]
    movaps  xmm1, xmmword ptr [rsp + 0x10]
    movaps  xmm2, xmmword ptr [rsp + 0x20]
    movaps  xmm3, xmmword ptr [rsp + 0x30]
    movaps  xmm4, xmmword ptr [rsp + 0x40]
    movaps  xmm5, xmmword ptr [rsp + 0x50]
    movaps  xmm6, xmmword ptr [rsp + 0x60]
    movaps  xmm7, xmmword ptr [rsp + 0x70]
    movaps  xmm8, xmmword ptr [rsp + 0x80]
    movaps  xmm9, xmmword ptr [rsp + 0x90]
    movaps  xmm10, xmmword ptr [rsp + 0xA0]
    movaps  xmm11, xmmword ptr [rsp + 0xB0]
    movaps  xmm12, xmmword ptr [rsp + 0xC0]
    movaps  xmm13, xmmword ptr [rsp + 0xD0]
    movaps  xmm14, xmmword ptr [rsp + 0xE0]
    movaps  xmm15, xmmword ptr [rsp + 0xF0]
    add     rsp, 0x100
.endm

// Offsets into the GuestRegisters structure.
.set registers_rax, 0x0
.set registers_rbx, 0x8
.set registers_rcx, 0x10
.set registers_rdx, 0x18
.set registers_rdi, 0x20
.set registers_rsi, 0x28
.set registers_rbp, 0x30
.set registers_r8,  0x38
.set registers_r9,  0x40
.set registers_r10, 0x48
.set registers_r11, 0x50
.set registers_r12, 0x58
.set registers_r13, 0x60
.set registers_r14, 0x68
.set registers_r15, 0x70
.set registers_rip, 0x78
.set registers_rsp, 0x80
.set registers_rflags, 0x88
.set registers_xmm0, 0x90

.set VMCS_HOST_RSP, 0x6C14
.set VMCS_HOST_RIP, 0x6C16

.global launch_vm
launch_vm:
    // Preserve the host context.
    PUSHAQ
    SAVE_XMM

    mov     r15, rdi    // Address of `registers`.
    mov     r14, rsi    // `launched` flag.
    push    rdi         // Kept on the stack for retrieval at VM exit.

    // Load the guest register file.
    mov     rax, [r15 + registers_rax]
    mov     rbx, [r15 + registers_rbx]
    mov     rcx, [r15 + registers_rcx]
    mov     rdx, [r15 + registers_rdx]
    mov     rdi, [r15 + registers_rdi]
    mov     rsi, [r15 + registers_rsi]
    mov     rbp, [r15 + registers_rbp]
    mov     r8,  [r15 + registers_r8]
    mov     r9,  [r15 + registers_r9]
    mov     r10, [r15 + registers_r10]
    mov     r11, [r15 + registers_r11]
    mov     r12, [r15 + registers_r12]

    movaps  xmm0,  [r15 + registers_xmm0 + 0x00]
    movaps  xmm1,  [r15 + registers_xmm0 + 0x10]
    movaps  xmm2,  [r15 + registers_xmm0 + 0x20]
    movaps  xmm3,  [r15 + registers_xmm0 + 0x30]
    movaps  xmm4,  [r15 + registers_xmm0 + 0x40]
    movaps  xmm5,  [r15 + registers_xmm0 + 0x50]
    movaps  xmm6,  [r15 + registers_xmm0 + 0x60]
    movaps  xmm7,  [r15 + registers_xmm0 + 0x70]
    movaps  xmm8,  [r15 + registers_xmm0 + 0x80]
    movaps  xmm9,  [r15 + registers_xmm0 + 0x90]
    movaps  xmm10, [r15 + registers_xmm0 + 0xA0]
    movaps  xmm11, [r15 + registers_xmm0 + 0xB0]
    movaps  xmm12, [r15 + registers_xmm0 + 0xC0]
    movaps  xmm13, [r15 + registers_xmm0 + 0xD0]
    movaps  xmm14, [r15 + registers_xmm0 + 0xE0]
    movaps  xmm15, [r15 + registers_xmm0 + 0xF0]

    test    r14, r14
    je      .Launch

    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
    mov     r15, [r15 + registers_r15]
    vmresume
    jmp     .VmEntryFailure

.Launch:
    // Point the host state at the live stack and the landing pad; the
    // values written by the VMCS programmer are placeholders until here.
    mov     r14, VMCS_HOST_RSP
    vmwrite r14, rsp
    lea     r13, [rip + vmexit_landing]
    mov     r14, VMCS_HOST_RIP
    vmwrite r14, r13
    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
    mov     r15, [r15 + registers_r15]
    vmlaunch

.VmEntryFailure:
    jmp     .Exit

.global vmexit_landing
vmexit_landing:
    // Swap guest R15 with the `registers` pointer stashed on the stack,
    // then spill the guest register file.
    xchg    r15, [rsp]
    mov     [r15 + registers_rax], rax
    mov     [r15 + registers_rbx], rbx
    mov     [r15 + registers_rcx], rcx
    mov     [r15 + registers_rdx], rdx
    mov     [r15 + registers_rsi], rsi
    mov     [r15 + registers_rdi], rdi
    mov     [r15 + registers_rbp], rbp
    mov     [r15 + registers_r8],  r8
    mov     [r15 + registers_r9],  r9
    mov     [r15 + registers_r10], r10
    mov     [r15 + registers_r11], r11
    mov     [r15 + registers_r12], r12
    mov     [r15 + registers_r13], r13
    mov     [r15 + registers_r14], r14

    movaps  [r15 + registers_xmm0 + 0x00], xmm0
    movaps  [r15 + registers_xmm0 + 0x10], xmm1
    movaps  [r15 + registers_xmm0 + 0x20], xmm2
    movaps  [r15 + registers_xmm0 + 0x30], xmm3
    movaps  [r15 + registers_xmm0 + 0x40], xmm4
    movaps  [r15 + registers_xmm0 + 0x50], xmm5
    movaps  [r15 + registers_xmm0 + 0x60], xmm6
    movaps  [r15 + registers_xmm0 + 0x70], xmm7
    movaps  [r15 + registers_xmm0 + 0x80], xmm8
    movaps  [r15 + registers_xmm0 + 0x90], xmm9
    movaps  [r15 + registers_xmm0 + 0xA0], xmm10
    movaps  [r15 + registers_xmm0 + 0xB0], xmm11
    movaps  [r15 + registers_xmm0 + 0xC0], xmm12
    movaps  [r15 + registers_xmm0 + 0xD0], xmm13
    movaps  [r15 + registers_xmm0 + 0xE0], xmm14
    movaps  [r15 + registers_xmm0 + 0xF0], xmm15

    mov     rax, [rsp]
    mov     [r15 + registers_r15], rax

.Exit:
    pop     rax
    RESTORE_XMM
    POPAQ

    pushfq
    pop     rax
    ret
"#
);
