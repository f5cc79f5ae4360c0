//! Trap entry and exit.
//!
//! 256 stubs, 16 bytes apart, each pushing a dummy error code (unless the CPU
//! pushed a real one) and its vector before jumping to a common path. That
//! path saves the general registers to complete a [`TrapFrame`] and hands it
//! to [`Kernel::dispatch`](crate::Kernel::dispatch). On the way out it
//! restores whatever the frame then holds and returns with `iretq`, which is
//! how a rewritten frame becomes a context switch.

use super::{halt_forever, kernel, serial};
use crate::interrupts::{DispatchOutcome, TrapFrame};
use core::arch::{asm, global_asm};

const STUB_SIZE: u64 = 16;

global_asm!(
    r#"
    .section .text
    .balign 16
    .global kestrel_trap_stubs
kestrel_trap_stubs:
    .set kestrel_vec, 0
    .rept 256
    .balign 16
    .if (kestrel_vec == 8) || ((kestrel_vec >= 10) && (kestrel_vec <= 14)) || (kestrel_vec == 17) || (kestrel_vec == 21) || (kestrel_vec == 29) || (kestrel_vec == 30)
    .else
    pushq $0
    .endif
    pushq $kestrel_vec
    jmp kestrel_trap_common
    .set kestrel_vec, kestrel_vec + 1
    .endr

kestrel_trap_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %rsp, %rdi
    cld
    call kestrel_trap_dispatch
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    iretq

    .global kestrel_task_exit
kestrel_task_exit:
    int $0x82
    ud2
"#,
    options(att_syntax)
);

extern "C" {
    fn kestrel_trap_stubs();
    fn kestrel_task_exit();
}

/// Address of the entry stub for `vector`.
pub fn stub_addr(vector: u8) -> u64 {
    kestrel_trap_stubs as usize as u64 + u64::from(vector) * STUB_SIZE
}

/// Address a task returns into when its entry function finishes.
pub fn task_exit_trampoline_addr() -> u64 {
    kestrel_task_exit as usize as u64
}

fn read_cr2() -> u64 {
    let value: u64;
    // SAFETY: reading CR2 has no side effects.
    unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

#[no_mangle]
extern "C" fn kestrel_trap_dispatch(frame: &mut TrapFrame) {
    let fault_addr = read_cr2();
    let outcome = match kernel() {
        Some(kernel) => kernel.dispatch(frame, fault_addr),
        None => {
            serial::unlock_for_panic();
            log::error!(
                "trap on vector {} (error {:#x}, rip {:#x}) before the kernel was up",
                frame.vector,
                frame.error_code,
                frame.rip
            );
            halt_forever();
        }
    };
    if let DispatchOutcome::Halt(report) = outcome {
        serial::unlock_for_panic();
        log::error!("{}", report);
        halt_forever();
    }
}
