//! aarch64 context switching implementation
//!
//! Same surface as the x86_64 module. AAPCS64 callee-saved state is
//! x19-x28, the frame pointer, the link register, sp, and the low
//! halves of v8-v15.

use std::arch::naked_asm;

/// Callee-saved register block for a parked fiber.
///
/// Field order is load-bearing: the assembly in [`switch_context`]
/// addresses these by byte offset.
#[repr(C)]
#[derive(Debug)]
pub struct SavedRegs {
    pub sp: u64,  // 0x00
    pub pc: u64,  // 0x08
    pub fp: u64,  // 0x10 (x29)
    pub lr: u64,  // 0x18 (x30)
    pub x19: u64, // 0x20
    pub x20: u64, // 0x28
    pub x21: u64, // 0x30
    pub x22: u64, // 0x38
    pub x23: u64, // 0x40
    pub x24: u64, // 0x48
    pub x25: u64, // 0x50
    pub x26: u64, // 0x58
    pub x27: u64, // 0x60
    pub x28: u64, // 0x68
    pub d: [u64; 8], // 0x70: d8-d15
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        SavedRegs {
            sp: 0,
            pc: 0,
            fp: 0,
            lr: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            d: [0; 8],
        }
    }
}

/// Initialize a fresh fiber context.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` memory. `stack_top` must be
/// the one-past-the-end address of a live, writable stack.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // AAPCS64 requires sp to stay 16-byte aligned at all times.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    *regs = SavedRegs::zeroed();
    regs.sp = aligned_sp as u64;
    regs.pc = fiber_entry_trampoline as usize as u64;
    regs.x19 = entry_fn as u64; // entry function
    regs.x20 = entry_arg as u64; // entry argument
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function must never return: a finished fiber switches
/// away through its saved resumer context instead.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // Entry functions do not return.
        "brk #0x1",
    );
}

/// Perform a context switch.
///
/// Saves callee-saved registers to `old_regs` and loads `new_regs`.
/// Returns (to the caller) only when something later switches back
/// into `old_regs`. x30 is part of the saved set: the `ret` at the
/// resume point must branch to the parked context's own return
/// address, not whatever x30 holds in the resuming context.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    _old_regs: *mut SavedRegs,
    _new_regs: *const SavedRegs,
) {
    naked_asm!(
        // Save callee-saved registers to old_regs (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "adr x9, 1f",
        "str x9, [x0, #0x08]",
        "stp x29, x30, [x0, #0x10]",
        "stp x19, x20, [x0, #0x20]",
        "stp x21, x22, [x0, #0x30]",
        "stp x23, x24, [x0, #0x40]",
        "stp x25, x26, [x0, #0x50]",
        "stp x27, x28, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xA0]",
        // Load callee-saved registers from new_regs (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x29, x30, [x1, #0x10]",
        "ldp x19, x20, [x1, #0x20]",
        "ldp x21, x22, [x1, #0x30]",
        "ldp x23, x24, [x1, #0x40]",
        "ldp x25, x26, [x1, #0x50]",
        "ldp x27, x28, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xA0]",
        "ldr x9, [x1, #0x08]",
        "br x9",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
