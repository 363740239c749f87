//! Trap frame layout.
//!
//! The frame is an index-addressed array of machine words because it is
//! co-designed with the assembly trap entry: the entry pushes registers in a
//! fixed order and hands the kernel a pointer to the resulting array. The
//! index constants below are that contract; changing them requires changing
//! the entry code.

use core::ops;

pub const TF_GSBASE: usize = 0;
pub const TF_FSBASE: usize = 1;
pub const TF_R15: usize = 2;
pub const TF_R14: usize = 3;
pub const TF_R13: usize = 4;
pub const TF_R12: usize = 5;
pub const TF_R11: usize = 6;
pub const TF_R10: usize = 7;
pub const TF_R9: usize = 8;
pub const TF_R8: usize = 9;
pub const TF_RBP: usize = 10;
pub const TF_RSI: usize = 11;
pub const TF_RDI: usize = 12;
pub const TF_RDX: usize = 13;
pub const TF_RCX: usize = 14;
pub const TF_RBX: usize = 15;
pub const TF_RAX: usize = 16;

/// Number of general-purpose slots; the hardware-pushed part follows.
pub const TF_REGS: usize = 17;

pub const TF_TRAPNO: usize = TF_REGS;
pub const TF_ERROR: usize = TF_REGS + 1;
pub const TF_RIP: usize = TF_REGS + 2;
pub const TF_CS: usize = TF_REGS + 3;
pub const TF_RFLAGS: usize = TF_REGS + 4;
pub const TF_RSP: usize = TF_REGS + 5;
pub const TF_SS: usize = TF_REGS + 6;

pub const TF_SIZE: usize = TF_REGS + 7;

/// IF bit within the saved RFLAGS slot.
pub const TF_FL_IF: usize = 1 << 9;

/// A trap frame as laid out by the assembly entry.
#[repr(transparent)]
#[derive(Clone, Debug)]
pub struct TrapFrame(pub [usize; TF_SIZE]);

assert_eq_size!(TrapFrame, [u64; TF_SIZE]);

impl TrapFrame {
    pub const fn zeroed() -> TrapFrame {
        TrapFrame([0; TF_SIZE])
    }

    #[inline(always)]
    pub fn trapno(&self) -> usize {
        self.0[TF_TRAPNO]
    }

    #[inline(always)]
    pub fn rip(&self) -> usize {
        self.0[TF_RIP]
    }

    #[inline(always)]
    pub fn rsp(&self) -> usize {
        self.0[TF_RSP]
    }

    /// Log the interesting registers. Not for use in interrupt context.
    pub fn dump(&self) {
        log::error!("RIP: {:#x}", self.0[TF_RIP]);
        log::error!("RSP: {:#x}", self.0[TF_RSP]);
        log::error!("RAX: {:#x}", self.0[TF_RAX]);
        log::error!("RBX: {:#x}", self.0[TF_RBX]);
        log::error!("RCX: {:#x}", self.0[TF_RCX]);
        log::error!("RDX: {:#x}", self.0[TF_RDX]);
        log::error!("RDI: {:#x}", self.0[TF_RDI]);
        log::error!("RSI: {:#x}", self.0[TF_RSI]);
    }
}

impl ops::Index<usize> for TrapFrame {
    type Output = usize;

    fn index(&self, idx: usize) -> &usize {
        &self.0[idx]
    }
}

impl ops::IndexMut<usize> for TrapFrame {
    fn index_mut(&mut self, idx: usize) -> &mut usize {
        &mut self.0[idx]
    }
}
