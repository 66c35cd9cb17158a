//! Mode-U standalone execution: run bare guest code in user privilege and
//! hand every trap back to the embedder instead of a guest kernel.

use crate::bus::Bus;
use crate::hart::{Hart, HartSignals, Mode};
use crate::machine::MachineError;
use crate::mem::Dram;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Register indices of the flat userland register file.
pub const REG_X0: u64 = 0;
pub const REG_F0: u64 = 32;
pub const REG_PC: u64 = 1024;
pub const REG_CAUSE: u64 = 1025;
pub const REG_TVAL: u64 = 1026;

/// A user-mode-only execution domain: guest memory plus any number of
/// threads sharing it. No devices, no S-mode, no paging.
pub struct Userland {
    bus: Arc<Bus>,
    mtime: Arc<AtomicU64>,
    rv64: bool,
    next_id: std::sync::atomic::AtomicU64,
}

impl Userland {
    pub fn new(mem_base: u64, mem_size: u64, rv64: bool) -> Result<Self, MachineError> {
        let dram = Dram::new(mem_base, mem_size)?;
        Ok(Self {
            bus: Arc::new(Bus::new(dram)),
            mtime: Arc::new(AtomicU64::new(0)),
            rv64,
            next_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Create a thread at `pc`. Threads share the domain's memory.
    pub fn create_thread(&self, pc: u64) -> UserThread {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let signals = Arc::new(HartSignals::new());
        let mut hart = Hart::new(id, self.rv64, self.bus.clone(), signals, self.mtime.clone());
        hart.reset(pc, 0);
        hart.mode = Mode::User;
        UserThread {
            hart,
            cause: 0,
            tval: 0,
        }
    }

    /// Copy code or data into guest memory.
    pub fn write_mem(&self, addr: u64, data: &[u8]) -> Result<(), MachineError> {
        if !self.bus.dram().contains(addr, data.len() as u64) {
            return Err(MachineError::OutOfRange {
                addr,
                len: data.len() as u64,
            });
        }
        self.bus.dram().write(addr, data);
        Ok(())
    }

    /// Copy guest memory out.
    pub fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<(), MachineError> {
        if !self.bus.dram().contains(addr, buf.len() as u64) {
            return Err(MachineError::OutOfRange {
                addr,
                len: buf.len() as u64,
            });
        }
        self.bus.dram().read(addr, buf);
        Ok(())
    }
}

/// One user-mode hart whose traps return to the embedder.
pub struct UserThread {
    hart: Hart,
    cause: u64,
    tval: u64,
}

impl UserThread {
    /// Execute until the guest traps (ecall, fault, breakpoint). Returns
    /// the trap cause; `REG_CAUSE`/`REG_TVAL` hold it for later reads.
    pub fn run(&mut self) -> u64 {
        loop {
            match self.hart.step() {
                Ok(()) => self.hart.csr.retire(),
                Err(e) => {
                    self.cause = e.cause();
                    self.tval = e.tval();
                    return self.cause;
                }
            }
        }
    }

    /// Read a register by flat index: X0..X31 at 0..31, F0..F31 at 32..63,
    /// PC at 1024, CAUSE at 1025, TVAL at 1026.
    pub fn read_reg(&self, index: u64) -> Option<u64> {
        match index {
            0..=31 => Some(self.hart.xregs.read(index)),
            32..=63 => Some(self.hart.fregs.read_raw(index - REG_F0)),
            REG_PC => Some(self.hart.pc),
            REG_CAUSE => Some(self.cause),
            REG_TVAL => Some(self.tval),
            _ => None,
        }
    }

    /// Write a register by flat index. Returns `false` for an unknown
    /// index; CAUSE and TVAL are read-only.
    pub fn write_reg(&mut self, index: u64, value: u64) -> bool {
        match index {
            0..=31 => self.hart.xregs.write(index, value),
            32..=63 => self.hart.fregs.write_raw(index - REG_F0, value),
            REG_PC => self.hart.pc = value,
            _ => return false,
        }
        true
    }

    /// Drop cached instruction translations after self-modifying code.
    pub fn flush_icache(&mut self) {
        self.hart.fence_i();
    }
}
