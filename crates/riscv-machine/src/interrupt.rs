//! Asynchronous interrupts and the inter-hart IRQ lines.

/// The six standard interrupt sources, in delivery-priority order
/// (external before software before timer, machine level before
/// supervisor level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    MachineExternal,
    MachineSoftware,
    MachineTimer,
    SupervisorExternal,
    SupervisorSoftware,
    SupervisorTimer,
}

impl Interrupt {
    /// The cause number written to `mcause`/`scause` (without the
    /// interrupt bit, which depends on XLEN).
    pub fn cause(&self) -> u64 {
        match self {
            Interrupt::SupervisorSoftware => 1,
            Interrupt::MachineSoftware => 3,
            Interrupt::SupervisorTimer => 5,
            Interrupt::MachineTimer => 7,
            Interrupt::SupervisorExternal => 9,
            Interrupt::MachineExternal => 11,
        }
    }

    /// The `mip`/`mie` bit for this source.
    pub fn bit(&self) -> u64 {
        1 << self.cause()
    }

    /// Sources in the order interrupts are taken when several are pending.
    pub const PRIORITY: [Interrupt; 6] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
    ];
}

/// The IRQ lines an external controller (CLINT/PLIC shaped collaborator)
/// can drive on one hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqLine {
    SupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    MachineExternal,
}

impl IrqLine {
    /// The `mip` bit this line sets or clears.
    pub fn bit(&self) -> u64 {
        match self {
            IrqLine::SupervisorSoftware => 1 << 1,
            IrqLine::MachineSoftware => 1 << 3,
            IrqLine::SupervisorTimer => 1 << 5,
            IrqLine::MachineTimer => 1 << 7,
            IrqLine::SupervisorExternal => 1 << 9,
            IrqLine::MachineExternal => 1 << 11,
        }
    }
}
