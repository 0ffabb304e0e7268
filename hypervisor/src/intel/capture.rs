//! Captures the live CPU context so the virtualized CPU can continue where
//! the loader left off. The captured state becomes the guest's initial
//! register file; after VMLAUNCH the prior context resumes as the guest.

use core::{arch::global_asm, fmt};

extern "sysv64" {
    /// Stores the current general-purpose registers, RFLAGS, RSP, RIP,
    /// and XMM registers into `registers`. RIP/RSP are captured as the
    /// return address and post-return stack, so a guest resumed from the
    /// snapshot continues in the caller.
    pub fn capture_registers(registers: &mut GuestRegisters);
}

/// The guest register file the VMCS does not track for us.
///
/// General-purpose and XMM registers must be explicitly preserved and
/// restored around VM entries and exits; RIP/RSP/RFLAGS are shadowed here
/// after each exit for the dispatchers.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub xmm0: M128A,
    pub xmm1: M128A,
    pub xmm2: M128A,
    pub xmm3: M128A,
    pub xmm4: M128A,
    pub xmm5: M128A,
    pub xmm6: M128A,
    pub xmm7: M128A,
    pub xmm8: M128A,
    pub xmm9: M128A,
    pub xmm10: M128A,
    pub xmm11: M128A,
    pub xmm12: M128A,
    pub xmm13: M128A,
    pub xmm14: M128A,
    pub xmm15: M128A,
}

#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct M128A {
    pub low: u64,
    pub high: i64,
}

impl fmt::Debug for GuestRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GuestRegisters {{")?;
        writeln!(
            f,
            "  rax: {:#018x}, rbx: {:#018x}, rcx: {:#018x}, rdx: {:#018x}",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(
            f,
            "  rsi: {:#018x}, rdi: {:#018x}, rbp: {:#018x}, r8:  {:#018x}",
            self.rsi, self.rdi, self.rbp, self.r8
        )?;
        writeln!(
            f,
            "  r9:  {:#018x}, r10: {:#018x}, r11: {:#018x}, r12: {:#018x}",
            self.r9, self.r10, self.r11, self.r12
        )?;
        writeln!(
            f,
            "  r13: {:#018x}, r14: {:#018x}, r15: {:#018x}, rip: {:#018x}",
            self.r13, self.r14, self.r15, self.rip
        )?;
        writeln!(f, "  rsp: {:#018x}, rflags: {:#018x}", self.rsp, self.rflags)?;
        write!(f, "}}")
    }
}

global_asm!(
    r#"
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

.global capture_registers
capture_registers:
    mov     [rdi + registers_rax], rax
    mov     [rdi + registers_rbx], rbx
    mov     [rdi + registers_rcx], rcx
    mov     [rdi + registers_rdx], rdx
    mov     [rdi + registers_rdi], rdi
    mov     [rdi + registers_rsi], rsi
    mov     [rdi + registers_rbp], rbp
    mov     [rdi + registers_r8],  r8
    mov     [rdi + registers_r9],  r9
    mov     [rdi + registers_r10], r10
    mov     [rdi + registers_r11], r11
    mov     [rdi + registers_r12], r12
    mov     [rdi + registers_r13], r13
    mov     [rdi + registers_r14], r14
    mov     [rdi + registers_r15], r15

    movaps  [rdi + registers_xmm0 + 0x00], xmm0
    movaps  [rdi + registers_xmm0 + 0x10], xmm1
    movaps  [rdi + registers_xmm0 + 0x20], xmm2
    movaps  [rdi + registers_xmm0 + 0x30], xmm3
    movaps  [rdi + registers_xmm0 + 0x40], xmm4
    movaps  [rdi + registers_xmm0 + 0x50], xmm5
    movaps  [rdi + registers_xmm0 + 0x60], xmm6
    movaps  [rdi + registers_xmm0 + 0x70], xmm7
    movaps  [rdi + registers_xmm0 + 0x80], xmm8
    movaps  [rdi + registers_xmm0 + 0x90], xmm9
    movaps  [rdi + registers_xmm0 + 0xA0], xmm10
    movaps  [rdi + registers_xmm0 + 0xB0], xmm11
    movaps  [rdi + registers_xmm0 + 0xC0], xmm12
    movaps  [rdi + registers_xmm0 + 0xD0], xmm13
    movaps  [rdi + registers_xmm0 + 0xE0], xmm14
    movaps  [rdi + registers_xmm0 + 0xF0], xmm15

    pushfq
    pop     rax
    mov     [rdi + registers_rflags], rax

    // The return address is the resume point; the stack after `ret` is the
    // resume stack.
    mov     rax, [rsp]
    mov     [rdi + registers_rip], rax
    lea     rax, [rsp + 8]
    mov     [rdi + registers_rsp], rax

    mov     rax, [rdi + registers_rax]
    ret
"#
);
