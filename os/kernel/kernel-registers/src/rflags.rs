use bitfield_struct::bitfield;

/// Architectural RFLAGS model for x86-64.
///
/// Only the bits a freshly constructed task cares about are named; the
/// arithmetic flags are lumped together since nothing here sets them.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1 in 64-bit mode.
    #[bits(default = true, access = RO)]
    always1: bool, // 1

    /// PF, AF, ZF, SF and the reserved bits between them.
    #[bits(6)]
    __: u8, // 2–7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level (2 bits)
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Reserved 14–63 for our purposes.
    #[bits(50)]
    __: u64,
}

impl Rflags {
    /// Flags a task starts with when it first enters ring 3:
    /// interrupts enabled, IOPL 0, everything else clear.
    #[must_use]
    pub const fn user_entry() -> Self {
        Self::new().with_if_interrupt_enable(true)
    }
}
