use core::fmt;

/// A machine location: either a register or a stack slot in the frame.
///
/// Registers occupy the numbers below [`VMReg::FIRST_STACK_SLOT`]; stack
/// slots are numbered upwards from there, each slot being
/// [`VMReg::STACK_SLOT_SIZE`] bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VMReg(u32);

impl VMReg {
    /// The number of the first stack slot.
    pub const FIRST_STACK_SLOT: u32 = 256;

    /// Size in bytes of one stack slot.
    pub const STACK_SLOT_SIZE: u32 = 4;

    /// A location that names nothing.
    pub const BAD: VMReg = VMReg(u32::MAX);

    /// The register with machine number `n`.
    pub fn reg(n: u32) -> VMReg {
        assert!(n < Self::FIRST_STACK_SLOT, "register number {n} out of range");
        VMReg(n)
    }

    /// The stack slot `slot` counted from the stack pointer.
    pub fn stack_slot(slot: u32) -> VMReg {
        VMReg(Self::FIRST_STACK_SLOT + slot)
    }

    /// Reconstructs a location from [`VMReg::value`].
    pub fn from_raw(value: u32) -> VMReg {
        VMReg(value)
    }

    /// The raw encoding of this location.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Is this a valid location at all?
    pub fn is_valid(self) -> bool {
        self != Self::BAD
    }

    /// Is this a register?
    pub fn is_reg(self) -> bool {
        self.0 < Self::FIRST_STACK_SLOT
    }

    /// Is this a stack slot?
    pub fn is_stack(self) -> bool {
        self.is_valid() && self.0 >= Self::FIRST_STACK_SLOT
    }

    /// The stack slot number of a stack location.
    pub fn reg2stack(self) -> u32 {
        debug_assert!(self.is_stack());
        self.0 - Self::FIRST_STACK_SLOT
    }

    /// The byte offset from the stack pointer of a stack location.
    pub fn stack_offset_in_bytes(self) -> usize {
        self.reg2stack() as usize * Self::STACK_SLOT_SIZE as usize
    }
}

impl fmt::Debug for VMReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for VMReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "BAD")
        } else if self.is_reg() {
            write!(f, "r{}", self.0)
        } else {
            write!(f, "[sp+{:#x}]", self.stack_offset_in_bytes())
        }
    }
}
