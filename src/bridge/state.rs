//! Guest register snapshot shared with trampolines.

use crate::memory::GuestAddress;

/// PowerPC user-level register file.
///
/// The execution engine owns the authoritative state and hands a mutable reference to each
/// trampoline it invokes. Arguments arrive in `r3`-`r10` and `f1`-`f13`; results are
/// returned in `r3` (and `f1`).
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    /// General purpose registers
    pub gpr: [u32; 32],
    /// Floating point registers
    pub fpr: [f64; 32],
    /// Link register
    pub lr: u32,
    /// Condition register
    pub cr: u32,
    /// Count register
    pub ctr: u32,
    /// Fixed-point exception register
    pub xer: u32,
}

impl Default for MachineState {
    fn default() -> Self {
        MachineState {
            gpr: [0; 32],
            fpr: [0.0; 32],
            lr: 0,
            cr: 0,
            ctr: 0,
            xer: 0,
        }
    }
}

impl MachineState {
    /// A zeroed register file.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Integer argument `index` (0-based), taken from `r3` onwards.
    ///
    /// Arguments past the eighth live on the guest stack and read as 0 here.
    #[must_use]
    pub fn arg(&self, index: usize) -> u32 {
        if index < 8 {
            self.gpr[3 + index]
        } else {
            0
        }
    }

    /// Integer argument `index` as a guest address.
    #[must_use]
    pub fn arg_address(&self, index: usize) -> GuestAddress {
        GuestAddress(self.arg(index))
    }

    /// Set the integer return value in `r3`.
    pub fn set_return(&mut self, value: u32) {
        self.gpr[3] = value;
    }

    /// Set a signed integer return value in `r3`.
    pub fn set_return_signed(&mut self, value: i32) {
        self.gpr[3] = value as u32;
    }

    /// The current integer return value.
    #[must_use]
    pub fn return_value(&self) -> u32 {
        self.gpr[3]
    }

    /// Stack pointer (`r1`).
    #[must_use]
    pub fn stack_pointer(&self) -> u32 {
        self.gpr[1]
    }

    /// TOC pointer (`r2`).
    #[must_use]
    pub fn toc(&self) -> u32 {
        self.gpr[2]
    }
}
