//! One RISC-V hardware thread: register state, privilege, the
//! fetch-decode-execute loop and trap delivery.

use crate::bus::{Bus, BusError};
use crate::exception::Exception;
use crate::fpu::RoundMode;
use crate::interrupt::Interrupt;
use crate::mem::AmoOp;
use crate::primitives::constants::{DOUBLEWORD, PAGE_MASK};
use crate::reg::csr::state::CsrFile;
use crate::reg::csr::{
    CsrAddress, CYCLE, CYCLEH, FCSR, FFLAGS, FRM, FS_OFF, INSTRET, INSTRETH, MCOUNTEREN, MEDELEG,
    MEPC, MIDELEG, MIE, MIP, MSTATUS, MSTATUS_FS, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP,
    MSTATUS_MPRV, MTVEC, SATP, SCAUSE, SCOUNTEREN, SEPC, SIE, SIP, SSTATUS, STVEC, TIME, TIMEH,
    MCAUSE, FS_DIRTY, XSTATUS_SIE, XSTATUS_SPIE, XSTATUS_SPP,
};
use crate::reg::{FRegisters, XRegisters};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::trace;

pub mod exec;
pub mod exec_c;
pub mod mmu;

use mmu::Tlb;

/// The privileged mode.
#[derive(Debug, PartialEq, PartialOrd, Eq, Copy, Clone)]
pub enum Mode {
    User = 0b00,
    Supervisor = 0b01,
    Machine = 0b11,
}

impl Mode {
    pub fn bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Mode {
        match bits {
            0b00 => Mode::User,
            0b01 => Mode::Supervisor,
            _ => Mode::Machine,
        }
    }
}

/// Access type that is used in the virtual address translation process. It
/// decides which exception is raised on a failing translation
/// (InstructionPageFault, LoadPageFault or StoreAMOPageFault).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Access {
    /// An instruction fetch.
    Fetch,
    /// A data load.
    Load,
    /// A store or AMO.
    Store,
}

/// The cross-thread face of a hart: the `wait_event` dispatch gate, the
/// shared pending-interrupt word, and a wakeup channel for WFI sleep.
/// Devices, other harts and the machine lifecycle all talk to a hart
/// through this and nothing else.
pub struct HartSignals {
    wait_event: AtomicBool,
    mip: Arc<AtomicU64>,
    sleep: Mutex<()>,
    wake: Condvar,
}

impl HartSignals {
    pub fn new() -> Self {
        Self {
            wait_event: AtomicBool::new(false),
            mip: Arc::new(AtomicU64::new(0)),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// The shared `mip` word.
    pub fn mip(&self) -> &Arc<AtomicU64> {
        &self.mip
    }

    /// True while the dispatch loop may keep running.
    #[inline]
    pub fn wait_event(&self) -> bool {
        self.wait_event.load(Ordering::Acquire)
    }

    /// Re-arm the dispatch gate before (re-)entering the loop.
    pub fn arm(&self) {
        self.wait_event.store(true, Ordering::Release);
    }

    /// Force the dispatch loop to exit at the next instruction boundary and
    /// wake the hart thread if it is sleeping in WFI.
    pub fn ring(&self) {
        self.wait_event.store(false, Ordering::Release);
        let _guard = self.sleep.lock().unwrap();
        self.wake.notify_all();
    }

    /// Set pending-interrupt bits. Release-ordered with respect to the
    /// device state that motivated the interrupt; the hart's acquire read
    /// of `mip` observes that state.
    pub fn raise_irq(&self, bits: u64) {
        self.mip.fetch_or(bits, Ordering::AcqRel);
        self.ring();
    }

    /// Clear pending-interrupt bits.
    pub fn lower_irq(&self, bits: u64) {
        self.mip.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Sleep until something rings the hart or the timeout passes. Spurious
    /// wakeups are fine; callers re-check their condition.
    pub fn park(&self, timeout: Duration) {
        let guard = self.sleep.lock().unwrap();
        let _ = self.wake.wait_timeout(guard, timeout).unwrap();
    }
}

impl Default for HartSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// One hardware thread.
pub struct Hart {
    /// Integer registers.
    pub xregs: XRegisters,
    /// Floating-point registers.
    pub fregs: FRegisters,
    /// Program counter.
    pub pc: u64,
    /// Control and status registers (CSR).
    pub csr: CsrFile,
    /// Privilege level.
    pub mode: Mode,
    /// Register width: true for RV64, false for RV32.
    pub rv64: bool,
    /// This hart's index, mirrored in `mhartid`.
    pub hart_id: u64,
    /// System bus.
    bus: Arc<Bus>,
    signals: Arc<HartSignals>,
    // LR/SC reservation.
    lrsc_active: bool,
    lrsc_addr: u64,
    lrsc_value: u64,
    // Split software TLBs, one per access type.
    pub(crate) tlb_fetch: Tlb,
    pub(crate) tlb_load: Tlb,
    pub(crate) tlb_store: Tlb,
    /// Address of the instruction currently executing; `xepc` on a trap.
    trap_pc: u64,
    /// True between a WFI and the next wake event; the dispatch thread
    /// sleeps instead of spinning while this is set.
    pub idle: bool,
}

impl Hart {
    pub fn new(
        hart_id: u64,
        rv64: bool,
        bus: Arc<Bus>,
        signals: Arc<HartSignals>,
        mtime: Arc<AtomicU64>,
    ) -> Self {
        let csr = CsrFile::new(rv64, hart_id, signals.mip().clone(), mtime);
        Self {
            xregs: XRegisters::new(),
            fregs: FRegisters::new(),
            pc: 0,
            csr,
            mode: Mode::Machine,
            rv64,
            hart_id,
            bus,
            signals,
            lrsc_active: false,
            lrsc_addr: 0,
            lrsc_value: 0,
            tlb_fetch: Tlb::new(),
            tlb_load: Tlb::new(),
            tlb_store: Tlb::new(),
            trap_pc: 0,
            idle: false,
        }
    }

    /// Reset the architectural state to its boot values. Register a0 holds
    /// the hart id and a1 the device-tree address, matching what a
    /// first-stage boot loader leaves behind.
    pub fn reset(&mut self, reset_pc: u64, dtb_addr: u64) {
        self.xregs.reset();
        self.fregs.reset();
        self.csr.reset();
        self.xregs.write(10, self.hart_id);
        self.xregs.write(11, dtb_addr);
        self.pc = self.canon(reset_pc);
        self.mode = Mode::Machine;
        self.lrsc_active = false;
        self.idle = false;
        self.flush_tlbs();
    }

    /// The cross-thread signal block.
    pub fn signals(&self) -> &Arc<HartSignals> {
        &self.signals
    }

    /// The physical address space.
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Bring a value into the canonical register form: RV32 state is kept
    /// sign-extended to 64 bits, the same convention RV64 uses for its
    /// 32-bit "word" results.
    #[inline]
    pub fn canon(&self, value: u64) -> u64 {
        if self.rv64 {
            value
        } else {
            value as i32 as i64 as u64
        }
    }

    /// Mask an address to XLEN before translation.
    #[inline]
    pub fn addr(&self, va: u64) -> u64 {
        if self.rv64 {
            va
        } else {
            va & 0xffff_ffff
        }
    }

    #[inline]
    pub(crate) fn rx(&self, index: u64) -> u64 {
        self.xregs.read(index)
    }

    #[inline]
    pub(crate) fn wx(&mut self, index: u64, value: u64) {
        let value = self.canon(value);
        self.xregs.write(index, value);
    }

    /// Dispatch instructions until something clears `wait_event`: an
    /// injected interrupt, WFI, SFENCE, a pause request. Architectural
    /// traps are delivered inside the loop and do not exit it.
    pub fn run(&mut self) {
        while self.signals.wait_event() {
            if let Err(e) = self.step() {
                self.take_trap(e);
            }
            self.csr.retire();
        }
    }

    /// One fetch-decode-execute iteration.
    pub fn step(&mut self) -> Result<(), Exception> {
        self.xregs.zero_x0();
        self.trap_pc = self.pc;
        let (inst, len) = self.fetch()?;
        self.pc = self.canon(self.pc.wrapping_add(len as u64));
        if len == 2 {
            exec_c::execute_compressed(self, inst as u64)?;
        } else {
            exec::execute_general(self, inst as u64)?;
        }
        Ok(())
    }

    /// The address of the instruction currently executing. Branches and
    /// AUIPC are relative to this, not to the already-advanced `pc`.
    #[inline]
    pub(crate) fn exec_pc(&self) -> u64 {
        self.trap_pc
    }

    /// Read the next instruction parcel at `pc` through the fetch TLB.
    /// Returns the parcel and its length in bytes. When a 32-bit read would
    /// cross a page, the low half is fetched first and decides whether the
    /// high half is needed at all.
    fn fetch(&mut self) -> Result<(u32, usize), Exception> {
        let pc = self.addr(self.pc);
        if pc & 1 != 0 {
            return Err(Exception::InstructionAddressMisaligned(pc));
        }
        if pc & PAGE_MASK == PAGE_MASK - 1 {
            let lo = self.fetch_parcel(pc, 2)?;
            if lo & 0b11 != 0b11 {
                return Ok((lo, 2));
            }
            let hi = self.fetch_parcel(self.addr(pc.wrapping_add(2)), 2)?;
            return Ok(((hi << 16) | lo, 4));
        }
        let word = self.fetch_parcel(pc, 4)?;
        if word & 0b11 != 0b11 {
            Ok((word & 0xffff, 2))
        } else {
            Ok((word, 4))
        }
    }

    fn fetch_parcel(&mut self, va: u64, len: usize) -> Result<u32, Exception> {
        let pa = self.translate(va, Access::Fetch)?;
        self.bus.fetch_inst(pa, len).map_err(|e| match e {
            BusError::OutOfRange { .. } | BusError::DeviceFault { .. } => {
                Exception::InstructionAccessFault(va)
            }
            BusError::Misaligned { .. } => Exception::InstructionAddressMisaligned(va),
        })
    }

    fn load_fault(e: BusError, va: u64) -> Exception {
        match e {
            BusError::Misaligned { .. } => Exception::LoadAddressMisaligned(va),
            _ => Exception::LoadAccessFault(va),
        }
    }

    fn store_fault(e: BusError, va: u64) -> Exception {
        match e {
            BusError::Misaligned { .. } => Exception::StoreAddressMisaligned(va),
            _ => Exception::StoreAccessFault(va),
        }
    }

    /// Load `size` bits (8/16/32/64) from virtual address `va`,
    /// zero-extended. A misaligned access is split into byte accesses when
    /// every byte lands in RAM; it traps otherwise.
    pub fn load(&mut self, va: u64, size: u8) -> Result<u64, Exception> {
        let va = self.addr(va);
        let bytes = (size / 8) as u64;
        if va % bytes == 0 {
            let pa = self.translate(va, Access::Load)?;
            let mut buf = [0u8; 8];
            self.bus
                .read(pa, &mut buf[..bytes as usize])
                .map_err(|e| Self::load_fault(e, va))?;
            return Ok(crate::primitives::bits::read_uint(&buf, bytes as usize));
        }
        let mut value: u64 = 0;
        for i in 0..bytes {
            let byte_va = self.addr(va.wrapping_add(i));
            let pa = self.translate(byte_va, Access::Load)?;
            if !self.bus.is_ram(pa, 1) {
                return Err(Exception::LoadAddressMisaligned(va));
            }
            let mut byte = [0u8; 1];
            self.bus
                .read(pa, &mut byte)
                .map_err(|e| Self::load_fault(e, va))?;
            value |= (byte[0] as u64) << (i * 8);
        }
        Ok(value)
    }

    /// Store the low `size` bits of `value` at virtual address `va`, with
    /// the same misalignment rule as `load`. Stores also kill any LR
    /// reservation on the written word.
    pub fn store(&mut self, va: u64, value: u64, size: u8) -> Result<(), Exception> {
        let va = self.addr(va);
        let bytes = (size / 8) as u64;
        if self.lrsc_active {
            let width = if self.rv64 { 8 } else { 4 };
            if va & !(width - 1) == self.lrsc_addr {
                self.lrsc_active = false;
            }
        }
        if va % bytes == 0 {
            let pa = self.translate(va, Access::Store)?;
            let mut buf = [0u8; 8];
            crate::primitives::bits::write_uint(&mut buf[..bytes as usize], bytes as usize, value);
            return self
                .bus
                .write(pa, &buf[..bytes as usize])
                .map_err(|e| Self::store_fault(e, va));
        }
        for i in 0..bytes {
            let byte_va = self.addr(va.wrapping_add(i));
            let pa = self.translate(byte_va, Access::Store)?;
            if !self.bus.is_ram(pa, 1) {
                return Err(Exception::StoreAddressMisaligned(va));
            }
            let byte = [(value >> (i * 8)) as u8];
            self.bus
                .write(pa, &byte)
                .map_err(|e| Self::store_fault(e, va))?;
        }
        Ok(())
    }

    /// One word/doubleword AMO. The address must be naturally aligned; the
    /// RMW is a single atomic operation on RAM, or one bounce RMW on a
    /// device region. Returns the old value, sign-extended if 32-bit.
    pub fn amo(&mut self, va: u64, op: AmoOp, src: u64, size: u8) -> Result<u64, Exception> {
        let va = self.addr(va);
        let bytes = (size / 8) as u64;
        if va % bytes != 0 {
            return Err(Exception::StoreAddressMisaligned(va));
        }
        if self.lrsc_active && va & !(bytes - 1) == self.lrsc_addr {
            self.lrsc_active = false;
        }
        let pa = self.translate(va, Access::Store)?;
        if size == DOUBLEWORD {
            self.bus
                .amo_u64(pa, op, src)
                .map_err(|e| Self::store_fault(e, va))
        } else {
            let old = self
                .bus
                .amo_u32(pa, op, src as u32)
                .map_err(|e| Self::store_fault(e, va))?;
            Ok(old as i32 as i64 as u64)
        }
    }

    /// LR: load and open a reservation on the naturally aligned address.
    pub fn load_reserved(&mut self, va: u64, size: u8) -> Result<u64, Exception> {
        let va = self.addr(va);
        let bytes = (size / 8) as u64;
        if va % bytes != 0 {
            return Err(Exception::LoadAddressMisaligned(va));
        }
        let pa = self.translate(va, Access::Store)?;
        let value = if size == DOUBLEWORD {
            self.bus
                .load_reserved_u64(pa)
                .map_err(|e| Self::load_fault(e, va))?
        } else {
            self.bus
                .load_reserved_u32(pa)
                .map_err(|e| Self::load_fault(e, va))? as i32 as i64 as u64
        };
        self.lrsc_active = true;
        self.lrsc_addr = va;
        self.lrsc_value = value;
        Ok(value)
    }

    /// SC: store iff the reservation is still open and the memory word is
    /// unchanged. Returns 0 on success, 1 on failure; the reservation is
    /// consumed either way.
    pub fn store_conditional(&mut self, va: u64, value: u64, size: u8) -> Result<u64, Exception> {
        let va = self.addr(va);
        let bytes = (size / 8) as u64;
        if va % bytes != 0 {
            return Err(Exception::StoreAddressMisaligned(va));
        }
        let reserved = self.lrsc_active && self.lrsc_addr == va;
        self.lrsc_active = false;
        if !reserved {
            return Ok(1);
        }
        let pa = self.translate(va, Access::Store)?;
        let success = if size == DOUBLEWORD {
            self.bus
                .store_conditional_u64(pa, self.lrsc_value, value)
                .map_err(|e| Self::store_fault(e, va))?
        } else {
            self.bus
                .store_conditional_u32(pa, self.lrsc_value as u32, value as u32)
                .map_err(|e| Self::store_fault(e, va))?
        };
        Ok(if success { 0 } else { 1 })
    }

    // --- Floating-point plumbing. ---

    /// Every FP instruction is illegal while `mstatus.FS` is Off.
    pub(crate) fn require_fp(&self, inst: u64) -> Result<(), Exception> {
        if self.csr.read_mstatus(MSTATUS_FS) == FS_OFF {
            return Err(Exception::IllegalInstruction(inst));
        }
        Ok(())
    }

    /// Any write to the FP state makes `mstatus.FS` Dirty.
    pub(crate) fn set_fs_dirty(&mut self) {
        self.csr.write_mstatus(MSTATUS_FS, FS_DIRTY);
    }

    /// Resolve an instruction's 3-bit rounding-mode field, falling back to
    /// `fcsr.frm` for DYN. The reserved encodings are illegal.
    pub(crate) fn round_mode(&self, rm: u64, inst: u64) -> Result<RoundMode, Exception> {
        let rm = if rm == 0b111 { self.csr.read(FRM) } else { rm };
        RoundMode::from_bits(rm).ok_or(Exception::IllegalInstruction(inst))
    }

    // --- CSR access with the privilege and legality rules. ---

    fn csr_known(&self, addr: CsrAddress) -> bool {
        matches!(
            addr,
            FFLAGS
                | FRM
                | FCSR
                | CYCLE
                | TIME
                | INSTRET
                | SSTATUS
                | crate::reg::csr::SIE
                | STVEC
                | SCOUNTEREN
                | crate::reg::csr::SSCRATCH
                | SEPC
                | SCAUSE
                | crate::reg::csr::STVAL
                | crate::reg::csr::SIP
                | SATP
                | crate::reg::csr::MVENDORID
                | crate::reg::csr::MARCHID
                | crate::reg::csr::MIMPID
                | crate::reg::csr::MHARTID
                | MSTATUS
                | crate::reg::csr::MISA
                | MEDELEG
                | MIDELEG
                | MIE
                | MTVEC
                | MCOUNTEREN
                | crate::reg::csr::MSCRATCH
                | MEPC
                | MCAUSE
                | crate::reg::csr::MTVAL
                | MIP
                | crate::reg::csr::MCYCLE
                | crate::reg::csr::MINSTRET
        ) || (!self.rv64 && matches!(addr, CYCLEH | TIMEH | INSTRETH))
    }

    fn counter_permitted(&self, addr: CsrAddress) -> bool {
        let bit = match addr {
            CYCLE | CYCLEH => 0,
            TIME | TIMEH => 1,
            INSTRET | INSTRETH => 2,
            _ => return true,
        };
        if self.mode == Mode::Machine {
            return true;
        }
        if self.csr.read(MCOUNTEREN) >> bit & 1 == 0 {
            return false;
        }
        if self.mode == Mode::User && self.csr.read(SCOUNTEREN) >> bit & 1 == 0 {
            return false;
        }
        true
    }

    /// Read a CSR for a Zicsr instruction, enforcing existence, privilege,
    /// FS gating and counter enables.
    pub fn csr_read(&self, addr: u64, inst: u64) -> Result<u64, Exception> {
        let addr = addr as CsrAddress;
        let illegal = Exception::IllegalInstruction(inst);
        if !self.csr_known(addr) {
            return Err(illegal);
        }
        let min_priv = (addr >> 8) as u64 & 0b11;
        if self.mode.bits() < min_priv {
            return Err(illegal);
        }
        if matches!(addr, FFLAGS | FRM | FCSR) {
            self.require_fp(inst)?;
        }
        if !self.counter_permitted(addr) {
            return Err(illegal);
        }
        let value = self.csr.read(addr);
        Ok(if self.rv64 { value } else { value & 0xffff_ffff })
    }

    /// Write a CSR for a Zicsr instruction, with the write side effects of
    /// the privileged architecture (TLB flushes for translation-affecting
    /// registers).
    pub fn csr_write(&mut self, addr: u64, value: u64, inst: u64) -> Result<(), Exception> {
        let addr = addr as CsrAddress;
        let illegal = Exception::IllegalInstruction(inst);
        if !self.csr_known(addr) {
            return Err(illegal);
        }
        // csr[11:10] == 0b11 marks the read-only address space.
        if (addr >> 10) & 0b11 == 0b11 {
            return Err(illegal);
        }
        let min_priv = (addr >> 8) as u64 & 0b11;
        if self.mode.bits() < min_priv {
            return Err(illegal);
        }
        if matches!(addr, FFLAGS | FRM | FCSR) {
            self.require_fp(inst)?;
            self.set_fs_dirty();
        }
        let value = if self.rv64 { value } else { value & 0xffff_ffff };
        self.csr.write(addr, value);
        match addr {
            // A new address space or new protection bits invalidate every
            // cached translation; dropping out of the loop lets the runtime
            // observe the change too.
            SATP => {
                self.flush_tlbs();
                self.signals.ring();
            }
            // Status and interrupt-mask writes can unmask an interrupt
            // that was raised while disabled; the loop has to exit so the
            // runtime delivers it between instructions.
            MSTATUS | SSTATUS => {
                self.flush_tlbs();
                self.interrupt_unmask_check();
            }
            MIE | SIE | MIP | SIP | MIDELEG => self.interrupt_unmask_check(),
            _ => {}
        }
        Ok(())
    }

    /// Ring the dispatch gate when the state change just made an interrupt
    /// deliverable. Every path that can flip `mstatus.{M,S}IE`, `mie` or
    /// `mip` outside of `raise_irq` goes through this.
    fn interrupt_unmask_check(&self) {
        if self.pending_interrupt().is_some() {
            self.signals.ring();
        }
    }

    /// Flush every TLB entry of this hart.
    pub fn flush_tlbs(&mut self) {
        self.tlb_fetch.flush();
        self.tlb_load.flush();
        self.tlb_store.flush();
    }

    /// `sfence.vma`: flush cached translations, all of them or one page,
    /// and force the dispatch loop through its slow path.
    pub fn sfence_vma(&mut self, va: Option<u64>) {
        match va {
            None => self.flush_tlbs(),
            Some(va) => {
                let va = self.addr(va);
                self.tlb_fetch.flush_page(va);
                self.tlb_load.flush_page(va);
                self.tlb_store.flush_page(va);
            }
        }
        self.signals.ring();
    }

    /// `fence.i`: the fetch TLB is the only instruction cache.
    pub fn fence_i(&mut self) {
        self.tlb_fetch.flush();
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    /// `wfi`: stop dispatching until an event arrives. Spurious resumption
    /// is permitted.
    pub(crate) fn wfi(&mut self) {
        self.idle = true;
        self.signals.wait_event.store(false, Ordering::Release);
    }

    // --- Trap flow. ---

    /// Interrupt bit of `xcause` for this XLEN.
    fn interrupt_bit(&self) -> u64 {
        if self.rv64 {
            1 << 63
        } else {
            1 << 31
        }
    }

    /// True when any interrupt is both pending and enabled in `mie`,
    /// ignoring the global enable stack. This is the WFI wake condition:
    /// a hart leaves its idle state even when the interrupt will not be
    /// taken at the current privilege.
    pub fn interrupts_pending_raw(&self) -> bool {
        self.csr.read(MIE) & self.csr.read(MIP) != 0
    }

    /// Pick the highest-priority interrupt that is pending, enabled, and
    /// deliverable at the current privilege. Does not consume the pending
    /// bit: sources are level-sensitive and cleared at the controller.
    pub fn pending_interrupt(&self) -> Option<Interrupt> {
        let pending = self.csr.read(MIE) & self.csr.read(MIP);
        if pending == 0 {
            return None;
        }
        let mideleg = self.csr.read(MIDELEG);
        let m_enabled =
            self.mode < Mode::Machine || self.csr.read_mstatus(MSTATUS_MIE) == 1;
        let s_enabled =
            self.mode < Mode::Supervisor
                || (self.mode == Mode::Supervisor && self.csr.read_sstatus(XSTATUS_SIE) == 1);
        for irq in Interrupt::PRIORITY {
            if pending & irq.bit() == 0 {
                continue;
            }
            let delegated = (mideleg >> irq.cause()) & 1 == 1;
            let deliverable = if delegated {
                // Delegated to S: never taken while in M.
                self.mode != Mode::Machine && s_enabled
            } else {
                m_enabled
            };
            if deliverable {
                return Some(irq);
            }
        }
        None
    }

    /// Deliver a synchronous exception: write the destination trap CSRs,
    /// push the status stack, and redirect `pc`. `xepc` is the faulting
    /// instruction, so an xRET retries it.
    pub fn take_trap(&mut self, e: Exception) {
        trace!(hart = self.hart_id, ?e, pc = self.trap_pc, "trap");
        let cause = e.cause();
        let deleg = self.csr.read(MEDELEG);
        let to_s = self.mode != Mode::Machine && (deleg >> cause) & 1 == 1;
        self.enter_trap(cause, e.tval(), to_s, false, self.trap_pc);
    }

    /// Deliver an interrupt between instructions. `xepc` is the next
    /// instruction that has not executed yet, so an xRET resumes without
    /// replaying anything.
    pub fn take_interrupt(&mut self, irq: Interrupt) {
        trace!(hart = self.hart_id, ?irq, "interrupt");
        let cause = irq.cause();
        let deleg = self.csr.read(MIDELEG);
        let to_s = self.mode != Mode::Machine && (deleg >> cause) & 1 == 1;
        self.enter_trap(cause | self.interrupt_bit(), 0, to_s, true, self.pc);
    }

    fn enter_trap(&mut self, cause: u64, tval: u64, to_s: bool, vectored_ok: bool, epc: u64) {
        let prev = self.mode;
        // Any trap consumes the reservation and invalidates privilege-
        // dependent cached translations.
        self.lrsc_active = false;
        self.flush_tlbs();
        if to_s {
            self.csr.set_trap_state(SCAUSE, cause, tval, epc);
            let sie = self.csr.read_sstatus(XSTATUS_SIE);
            self.csr.write_sstatus(XSTATUS_SPIE, sie);
            self.csr.write_sstatus(XSTATUS_SIE, 0);
            self.csr.write_sstatus(
                XSTATUS_SPP,
                if prev == Mode::User { 0 } else { 1 },
            );
            self.mode = Mode::Supervisor;
            self.pc = self.trap_vector(STVEC, cause, vectored_ok);
        } else {
            self.csr.set_trap_state(MCAUSE, cause, tval, epc);
            let mie = self.csr.read_mstatus(MSTATUS_MIE);
            self.csr.write_mstatus(MSTATUS_MPIE, mie);
            self.csr.write_mstatus(MSTATUS_MIE, 0);
            self.csr.write_mstatus(MSTATUS_MPP, prev.bits());
            self.mode = Mode::Machine;
            self.pc = self.trap_vector(MTVEC, cause, vectored_ok);
        }
    }

    fn trap_vector(&self, tvec: CsrAddress, cause: u64, vectored_ok: bool) -> u64 {
        let tvec = self.csr.read(tvec);
        let base = self.canon(tvec & !0b11);
        if vectored_ok && tvec & 0b11 == 1 {
            let code = cause & !self.interrupt_bit();
            self.canon(base.wrapping_add(code * 4))
        } else {
            base
        }
    }

    /// `mret`: pop the machine status stack.
    pub(crate) fn mret(&mut self, inst: u64) -> Result<(), Exception> {
        if self.mode != Mode::Machine {
            return Err(Exception::IllegalInstruction(inst));
        }
        self.pc = self.canon(self.csr.read(MEPC));
        let mpie = self.csr.read_mstatus(MSTATUS_MPIE);
        self.csr.write_mstatus(MSTATUS_MIE, mpie);
        self.csr.write_mstatus(MSTATUS_MPIE, 1);
        let new_mode = Mode::from_bits(self.csr.read_mstatus(MSTATUS_MPP));
        self.csr.write_mstatus(MSTATUS_MPP, Mode::User.bits());
        // Leaving machine mode drops the modified-privilege override.
        if new_mode != Mode::Machine {
            self.csr.write_mstatus(MSTATUS_MPRV, 0);
        }
        self.mode = new_mode;
        self.lrsc_active = false;
        self.flush_tlbs();
        // The restored MIE (or the lower privilege) can make a still-
        // latched source deliverable right away.
        self.interrupt_unmask_check();
        Ok(())
    }

    /// `sret`: pop the supervisor status stack.
    pub(crate) fn sret(&mut self, inst: u64) -> Result<(), Exception> {
        if self.mode == Mode::User {
            return Err(Exception::IllegalInstruction(inst));
        }
        self.pc = self.canon(self.csr.read(SEPC));
        let spie = self.csr.read_sstatus(XSTATUS_SPIE);
        self.csr.write_sstatus(XSTATUS_SIE, spie);
        self.csr.write_sstatus(XSTATUS_SPIE, 1);
        let new_mode = if self.csr.read_sstatus(XSTATUS_SPP) == 0 {
            Mode::User
        } else {
            Mode::Supervisor
        };
        self.csr.write_sstatus(XSTATUS_SPP, 0);
        self.csr.write_mstatus(MSTATUS_MPRV, 0);
        self.mode = new_mode;
        self.lrsc_active = false;
        self.flush_tlbs();
        self.interrupt_unmask_check();
        Ok(())
    }

    /// The MPRV-adjusted privilege used for data accesses.
    pub(crate) fn effective_mode(&self, access: Access) -> Mode {
        if access != Access::Fetch && self.csr.read_mstatus(MSTATUS_MPRV) == 1 {
            Mode::from_bits(self.csr.read_mstatus(MSTATUS_MPP))
        } else {
            self.mode
        }
    }
}
