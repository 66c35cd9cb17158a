//! Machine lifecycle: RAM + harts + MMIO regions, the per-hart dispatch
//! threads and the device update thread.

use crate::bus::{AttachError, AttachErrorKind, Bus};
use crate::hart::{Hart, HartSignals};
use crate::interrupt::IrqLine;
use crate::mem::Dram;
use crate::mmio::{MmioDescriptor, MmioHandle};
use crate::primitives::constants::{
    DEFAULT_RAM_BASE, DEFAULT_RAM_SIZE, EVENTLOOP_PERIOD_US, MMIO_ZONE_ALIGN, MMIO_ZONE_BASE,
};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Stable version of the embedding surface. Bumped on breaking changes to
/// the machine/MMIO contracts.
pub const ABI_VERSION: u32 = 9;

/// Host-level machine API errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("RAM layout base={base:#x} size={size:#x} is not page-granular")]
    BadRamLayout { base: u64, size: u64 },
    #[error("a machine needs at least one hart")]
    NoHarts,
    #[error("operation requires a paused machine")]
    NotPaused,
    #[error("range {addr:#x}+{len:#x} is outside guest RAM")]
    OutOfRange { addr: u64, len: u64 },
    #[error("image of {len} bytes does not fit at {addr:#x}")]
    ImageTooLarge { addr: u64, len: u64 },
}

/// Construction parameters. Everything has a workable default; a plain
/// `MachineConfig::default()` boots a one-hart RV64 with 128 MiB at the
/// conventional DRAM base.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ram_base: u64,
    pub ram_size: u64,
    pub hart_count: usize,
    pub rv64: bool,
    /// Initial and reset program counter; 0 means "start of RAM".
    pub reset_pc: u64,
    pub cmdline: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_base: DEFAULT_RAM_BASE,
            ram_size: DEFAULT_RAM_SIZE,
            hart_count: 1,
            rv64: true,
            reset_pc: 0,
            cmdline: String::new(),
        }
    }
}

/// The enumerated option map of the embedding API. Reads are always
/// allowed; the last three are read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOpt {
    JitEnable,
    JitCacheBytes,
    JitHarvard,
    Verbosity,
    HwImitate,
    MaxCpuPct,
    ResetPc,
    DtbAddr,
    MemBase,
    MemSize,
    HartCount,
}

#[derive(Debug, Clone)]
struct Options {
    jit_enable: u64,
    jit_cache_bytes: u64,
    jit_harvard: u64,
    verbosity: u64,
    hw_imitate: u64,
    max_cpu_pct: u64,
    reset_pc: u64,
    dtb_addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Paused = 0,
    Running = 1,
    PoweredOff = 2,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            0 => RunState::Paused,
            1 => RunState::Running,
            _ => RunState::PoweredOff,
        }
    }
}

struct HartCell {
    state: Mutex<Hart>,
    signals: Arc<HartSignals>,
}

struct MachineInner {
    bus: Arc<Bus>,
    harts: Vec<HartCell>,
    // Transitions are rare and must be totally ordered: they go through the
    // mutex. The atomic mirror is what the dispatch threads poll.
    state: Mutex<RunState>,
    state_cv: Condvar,
    state_cache: AtomicU8,
    mtime: Arc<AtomicU64>,
}

impl MachineInner {
    fn run_state(&self) -> RunState {
        RunState::from_u8(self.state_cache.load(Ordering::Acquire))
    }

    fn transition(&self, new: RunState) {
        let mut state = self.state.lock().unwrap();
        *state = new;
        self.state_cache.store(new as u8, Ordering::Release);
        self.state_cv.notify_all();
    }
}

/// A whole virtual machine. Created paused; `start` spawns one dispatch
/// thread per hart plus the device update thread.
pub struct Machine {
    inner: Arc<MachineInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    opts: Mutex<Options>,
    cmdline: Mutex<String>,
    dtb: Mutex<Option<(u64, u64)>>,
    plic: Mutex<Option<MmioHandle>>,
    pci_bus: Mutex<Option<MmioHandle>>,
    i2c_bus: Mutex<Option<MmioHandle>>,
    rv64: bool,
}

impl Machine {
    /// Allocate RAM and construct `hart_count` paused harts at the reset
    /// vector. No devices are installed.
    pub fn new(config: MachineConfig) -> Result<Machine, MachineError> {
        if config.hart_count == 0 {
            return Err(MachineError::NoHarts);
        }
        let dram = Dram::new(config.ram_base, config.ram_size)?;
        let bus = Arc::new(Bus::new(dram));
        let mtime = Arc::new(AtomicU64::new(0));
        let reset_pc = if config.reset_pc == 0 {
            config.ram_base
        } else {
            config.reset_pc
        };
        let mut harts = Vec::with_capacity(config.hart_count);
        for id in 0..config.hart_count {
            let signals = Arc::new(HartSignals::new());
            let mut hart = Hart::new(
                id as u64,
                config.rv64,
                bus.clone(),
                signals.clone(),
                mtime.clone(),
            );
            hart.reset(reset_pc, 0);
            harts.push(HartCell {
                state: Mutex::new(hart),
                signals,
            });
        }
        info!(
            harts = config.hart_count,
            ram_base = config.ram_base,
            ram_size = config.ram_size,
            rv64 = config.rv64,
            "machine created"
        );
        Ok(Machine {
            inner: Arc::new(MachineInner {
                bus,
                harts,
                state: Mutex::new(RunState::Paused),
                state_cv: Condvar::new(),
                state_cache: AtomicU8::new(RunState::Paused as u8),
                mtime,
            }),
            threads: Mutex::new(Vec::new()),
            opts: Mutex::new(Options {
                jit_enable: 0,
                jit_cache_bytes: 16 * 1024 * 1024,
                jit_harvard: 0,
                verbosity: 0,
                hw_imitate: 0,
                max_cpu_pct: 100,
                reset_pc,
                dtb_addr: 0,
            }),
            cmdline: Mutex::new(config.cmdline),
            dtb: Mutex::new(None),
            plic: Mutex::new(None),
            pci_bus: Mutex::new(None),
            i2c_bus: Mutex::new(None),
            rv64: config.rv64,
        })
    }

    /// Mark the machine running and spawn the dispatch and update threads
    /// if they are not already alive. Returns `false` if it was already
    /// running.
    pub fn start(&self) -> bool {
        {
            let state = self.inner.state.lock().unwrap();
            if *state == RunState::Running {
                warn!("start on an already-running machine");
                return false;
            }
        }
        let mut threads = self.threads.lock().unwrap();
        if threads.is_empty() {
            for idx in 0..self.inner.harts.len() {
                let inner = self.inner.clone();
                threads.push(std::thread::spawn(move || hart_main(inner, idx)));
            }
            let inner = self.inner.clone();
            threads.push(std::thread::spawn(move || eventloop_main(inner)));
        }
        info!("machine started");
        self.inner.transition(RunState::Running);
        true
    }

    /// Request every hart to leave its dispatch loop, and wait until all of
    /// them have. Returns `false` if the machine was not running.
    pub fn pause(&self) -> bool {
        {
            let state = self.inner.state.lock().unwrap();
            if *state != RunState::Running {
                return false;
            }
        }
        self.inner.transition(RunState::Paused);
        for cell in &self.inner.harts {
            cell.signals.ring();
        }
        // A hart has exited its loop exactly when its state lock is free.
        for cell in &self.inner.harts {
            drop(cell.state.lock().unwrap());
        }
        info!("machine paused");
        true
    }

    /// Pause, re-initialize every hart's architectural state, run every
    /// region's reset hook, and resume if previously running. Attachments
    /// survive a reset.
    pub fn reset(&self) {
        let was_running = self.pause();
        let (reset_pc, dtb_addr) = {
            let opts = self.opts.lock().unwrap();
            (opts.reset_pc, opts.dtb_addr)
        };
        for cell in &self.inner.harts {
            cell.state.lock().unwrap().reset(reset_pc, dtb_addr);
        }
        self.inner.bus.reset_all();
        info!("machine reset");
        if was_running {
            self.start();
        }
    }

    /// Stop all threads. Terminal unless `start` is called again.
    pub fn power_off(&self) {
        {
            let state = self.inner.state.lock().unwrap();
            if *state == RunState::PoweredOff {
                return;
            }
        }
        self.inner.transition(RunState::PoweredOff);
        for cell in &self.inner.harts {
            cell.signals.ring();
        }
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        // A later start() gets fresh threads; leave the state reachable.
        self.inner.transition(RunState::Paused);
        info!("machine powered off");
    }

    /// True while the dispatch threads are live (running or paused, but
    /// not yet powered off).
    pub fn powered(&self) -> bool {
        !self.threads.lock().unwrap().is_empty()
    }

    /// Block until the machine powers down. The device update loop runs on
    /// its own thread; this is the front-end's parking entry.
    pub fn run_eventloop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while *state == RunState::Running {
            state = self.inner.state_cv.wait(state).unwrap();
        }
    }

    // --- Introspection. ---

    pub fn hart_count(&self) -> usize {
        self.inner.harts.len()
    }

    pub fn mem_base(&self) -> u64 {
        self.inner.bus.dram().base()
    }

    pub fn mem_size(&self) -> u64 {
        self.inner.bus.dram().size()
    }

    /// Run a closure against one hart's architectural state. The machine
    /// must be paused; the hart lock serializes against the dispatch loop.
    pub fn with_hart<R>(&self, idx: usize, f: impl FnOnce(&mut Hart) -> R) -> Option<R> {
        if self.inner.run_state() == RunState::Running {
            return None;
        }
        let cell = self.inner.harts.get(idx)?;
        let mut hart = cell.state.lock().unwrap();
        Some(f(&mut hart))
    }

    // --- IRQ fabric. ---

    /// Assert an interrupt line on one hart. Release-ordered with whatever
    /// device state motivated it.
    pub fn raise_irq(&self, hart: usize, line: IrqLine) {
        if let Some(cell) = self.inner.harts.get(hart) {
            cell.signals.raise_irq(line.bit());
        }
    }

    /// Deassert an interrupt line on one hart.
    pub fn lower_irq(&self, hart: usize, line: IrqLine) {
        if let Some(cell) = self.inner.harts.get(hart) {
            cell.signals.lower_irq(line.bit());
        }
    }

    // --- RAM and DMA. ---

    pub fn read_ram(&self, addr: u64, buf: &mut [u8]) -> Result<(), MachineError> {
        let dram = self.inner.bus.dram();
        if !dram.contains(addr, buf.len() as u64) {
            return Err(MachineError::OutOfRange {
                addr,
                len: buf.len() as u64,
            });
        }
        dram.read(addr, buf);
        Ok(())
    }

    pub fn write_ram(&self, addr: u64, buf: &[u8]) -> Result<(), MachineError> {
        let dram = self.inner.bus.dram();
        if !dram.contains(addr, buf.len() as u64) {
            return Err(MachineError::OutOfRange {
                addr,
                len: buf.len() as u64,
            });
        }
        dram.write(addr, buf);
        Ok(())
    }

    /// Raw host pointer for DMA-style device access. `None` when the range
    /// leaves RAM or touches a device region.
    pub fn dma_ptr(&self, addr: u64, len: u64) -> Option<*mut u8> {
        self.inner.bus.direct_ptr(addr, len)
    }

    // --- Image loading. ---

    /// Copy a boot ROM to the reset vector.
    pub fn load_bootrom(&self, image: &[u8]) -> Result<(), MachineError> {
        let addr = self.opts.lock().unwrap().reset_pc;
        self.write_image(addr, image)
    }

    /// Copy a kernel to the conventional load offset for this XLEN.
    pub fn load_kernel(&self, image: &[u8]) -> Result<(), MachineError> {
        let offset = if self.rv64 { 0x20_0000 } else { 0x40_0000 };
        self.write_image(self.mem_base() + offset, image)
    }

    /// Place a device tree near the top of RAM and remember where.
    pub fn load_dtb(&self, image: &[u8]) -> Result<u64, MachineError> {
        let len = image.len() as u64;
        let top = self.mem_base() + self.mem_size();
        let addr = top
            .checked_sub(len)
            .map(|a| a & !0xfff)
            .filter(|&a| a >= self.mem_base())
            .ok_or(MachineError::ImageTooLarge {
                addr: top,
                len,
            })?;
        self.write_image(addr, image)?;
        *self.dtb.lock().unwrap() = Some((addr, len));
        self.opts.lock().unwrap().dtb_addr = addr;
        Ok(addr)
    }

    /// Read back the loaded device tree, if any.
    pub fn dump_dtb(&self) -> Option<Vec<u8>> {
        let (addr, len) = (*self.dtb.lock().unwrap())?;
        let mut buf = vec![0u8; len as usize];
        self.read_ram(addr, &mut buf).ok()?;
        Some(buf)
    }

    fn write_image(&self, addr: u64, image: &[u8]) -> Result<(), MachineError> {
        if !self.inner.bus.dram().contains(addr, image.len() as u64) {
            return Err(MachineError::ImageTooLarge {
                addr,
                len: image.len() as u64,
            });
        }
        self.write_ram(addr, image)
    }

    // --- Cmdline. ---

    pub fn set_cmdline(&self, cmdline: &str) {
        *self.cmdline.lock().unwrap() = cmdline.to_string();
    }

    pub fn append_cmdline(&self, part: &str) {
        let mut cmdline = self.cmdline.lock().unwrap();
        if !cmdline.is_empty() {
            cmdline.push(' ');
        }
        cmdline.push_str(part);
    }

    pub fn cmdline(&self) -> String {
        self.cmdline.lock().unwrap().clone()
    }

    // --- Options. ---

    pub fn get_opt(&self, opt: MachineOpt) -> u64 {
        let opts = self.opts.lock().unwrap();
        match opt {
            MachineOpt::JitEnable => opts.jit_enable,
            MachineOpt::JitCacheBytes => opts.jit_cache_bytes,
            MachineOpt::JitHarvard => opts.jit_harvard,
            MachineOpt::Verbosity => opts.verbosity,
            MachineOpt::HwImitate => opts.hw_imitate,
            MachineOpt::MaxCpuPct => opts.max_cpu_pct,
            MachineOpt::ResetPc => opts.reset_pc,
            MachineOpt::DtbAddr => opts.dtb_addr,
            MachineOpt::MemBase => self.mem_base(),
            MachineOpt::MemSize => self.mem_size(),
            MachineOpt::HartCount => self.hart_count() as u64,
        }
    }

    /// Set a machine option. Returns `false` (and changes nothing) for the
    /// read-only options.
    pub fn set_opt(&self, opt: MachineOpt, value: u64) -> bool {
        let mut opts = self.opts.lock().unwrap();
        match opt {
            MachineOpt::JitEnable => opts.jit_enable = value,
            MachineOpt::JitCacheBytes => opts.jit_cache_bytes = value,
            MachineOpt::JitHarvard => opts.jit_harvard = value,
            MachineOpt::Verbosity => opts.verbosity = value,
            MachineOpt::HwImitate => opts.hw_imitate = value,
            MachineOpt::MaxCpuPct => opts.max_cpu_pct = value.clamp(1, 100),
            MachineOpt::ResetPc => opts.reset_pc = value,
            MachineOpt::DtbAddr => opts.dtb_addr = value,
            MachineOpt::MemBase | MachineOpt::MemSize | MachineOpt::HartCount => {
                warn!(?opt, "attempt to set a read-only machine option");
                return false;
            }
        }
        true
    }

    // --- MMIO. ---

    /// Find a free physical window for a device region.
    pub fn mmio_zone_auto(&self, size: u64) -> Option<u64> {
        self.inner
            .bus
            .free_zone(MMIO_ZONE_BASE, size, MMIO_ZONE_ALIGN)
    }

    /// Attach a device region. The machine must be paused; on failure the
    /// descriptor (and so the device) travels back to the caller.
    pub fn attach_mmio(&self, desc: MmioDescriptor) -> Result<MmioHandle, AttachError> {
        if self.inner.run_state() == RunState::Running {
            return Err(AttachError {
                kind: AttachErrorKind::NotPaused,
                desc,
            });
        }
        self.inner.bus.attach(desc)
    }

    /// Detach a region and run its `remove` hook. The machine must be
    /// paused.
    pub fn remove_mmio(&self, handle: MmioHandle) -> bool {
        if self.inner.run_state() == RunState::Running {
            warn!("remove_mmio on a running machine");
            return false;
        }
        debug!(?handle, "detaching MMIO region");
        self.inner.bus.detach(handle)
    }

    // --- Collaborator slots. ---

    pub fn set_plic(&self, handle: Option<MmioHandle>) {
        *self.plic.lock().unwrap() = handle;
    }

    pub fn get_plic(&self) -> Option<MmioHandle> {
        *self.plic.lock().unwrap()
    }

    pub fn set_pci_bus(&self, handle: Option<MmioHandle>) {
        *self.pci_bus.lock().unwrap() = handle;
    }

    pub fn get_pci_bus(&self) -> Option<MmioHandle> {
        *self.pci_bus.lock().unwrap()
    }

    pub fn set_i2c_bus(&self, handle: Option<MmioHandle>) {
        *self.i2c_bus.lock().unwrap() = handle;
    }

    pub fn get_i2c_bus(&self) -> Option<MmioHandle> {
        *self.i2c_bus.lock().unwrap()
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.power_off();
        self.inner.bus.remove_all();
    }
}

/// Per-hart dispatch thread: deliver any pending interrupt, run until the
/// gate drops, sleep through WFI, park while paused.
fn hart_main(inner: Arc<MachineInner>, idx: usize) {
    let cell = &inner.harts[idx];
    loop {
        match inner.run_state() {
            RunState::PoweredOff => break,
            RunState::Paused => {
                let mut state = inner.state.lock().unwrap();
                while *state == RunState::Paused {
                    state = inner.state_cv.wait(state).unwrap();
                }
            }
            RunState::Running => {
                let mut idle = false;
                {
                    let mut hart = cell.state.lock().unwrap();
                    if let Some(irq) = hart.pending_interrupt() {
                        hart.idle = false;
                        hart.take_interrupt(irq);
                    }
                    cell.signals.arm();
                    if inner.run_state() == RunState::Running {
                        hart.run();
                    }
                    // A WFI with nothing pending means this thread should
                    // sleep rather than spin. A pending-and-enabled source
                    // wakes the hart even when it will not be taken.
                    if hart.idle && !hart.interrupts_pending_raw() {
                        idle = true;
                    } else {
                        hart.idle = false;
                    }
                }
                if idle && inner.run_state() == RunState::Running {
                    cell.signals.park(Duration::from_millis(1));
                }
            }
        }
    }
}

/// Device update thread: run every region's `update` hook periodically and
/// advance the machine clock.
fn eventloop_main(inner: Arc<MachineInner>) {
    loop {
        match inner.run_state() {
            RunState::PoweredOff => break,
            RunState::Paused => {
                let mut state = inner.state.lock().unwrap();
                while *state == RunState::Paused {
                    state = inner.state_cv.wait(state).unwrap();
                }
            }
            RunState::Running => {
                inner.bus.update_all();
                inner
                    .mtime
                    .fetch_add(EVENTLOOP_PERIOD_US, Ordering::AcqRel);
                std::thread::sleep(Duration::from_micros(EVENTLOOP_PERIOD_US));
            }
        }
    }
}
