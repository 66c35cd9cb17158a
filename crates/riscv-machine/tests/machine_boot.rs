//! End-to-end machine lifecycle: reset state, start/pause, reset hooks.

mod common;

use common::RAM_BASE;
use pretty_assertions::assert_eq;
use riscv_machine::hart::Mode;
use riscv_machine::mmio::{MmioDescriptor, MmioHandler};
use riscv_machine::reg::csr::{MSTATUS, MSTATUS_MIE};
use riscv_machine::{Machine, MachineConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[test]
fn reset_state_of_a_fresh_machine() {
    let machine = Machine::new(MachineConfig {
        ram_size: 128 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();

    machine
        .with_hart(0, |hart| {
            assert_eq!(hart.pc, 0x8000_0000);
            assert_eq!(hart.mode, Mode::Machine);
            for reg in 0..32 {
                assert_eq!(hart.xregs.read(reg), 0, "x{reg} must reset to zero");
            }
            assert_eq!(hart.csr.read_mstatus(MSTATUS_MIE), 0);
        })
        .unwrap();

    // A start/pause round trip leaves the machine controllable.
    assert!(machine.start());
    assert!(machine.powered());
    assert!(!machine.start());
    assert!(machine.pause());
    assert!(!machine.pause());
    machine.power_off();
}

#[test]
fn hart_ids_and_boot_registers() {
    let machine = Machine::new(MachineConfig {
        hart_count: 3,
        ..Default::default()
    })
    .unwrap();
    for id in 0..3 {
        machine
            .with_hart(id, |hart| {
                assert_eq!(hart.csr.read(riscv_machine::reg::csr::MHARTID), id as u64);
                assert_eq!(hart.xregs.read(10), id as u64); // a0 = hartid
            })
            .unwrap();
    }
}

#[test]
fn kernel_and_bootrom_loading() {
    let machine = Machine::new(MachineConfig::default()).unwrap();
    machine.load_bootrom(&[0x11, 0x22, 0x33, 0x44]).unwrap();
    let mut buf = [0u8; 4];
    machine.read_ram(RAM_BASE, &mut buf).unwrap();
    assert_eq!(buf, [0x11, 0x22, 0x33, 0x44]);

    // RV64 kernels land at the conventional 2 MiB offset.
    machine.load_kernel(&[0xaa, 0xbb]).unwrap();
    let mut buf = [0u8; 2];
    machine.read_ram(RAM_BASE + 0x20_0000, &mut buf).unwrap();
    assert_eq!(buf, [0xaa, 0xbb]);

    // An image larger than RAM is refused whole.
    let huge = vec![0u8; machine.mem_size() as usize + 1];
    assert!(machine.load_bootrom(&huge).is_err());
}

#[test]
fn mmio_zone_auto_avoids_existing_regions() {
    use riscv_machine::mmio::NullMmio;

    let machine = Machine::new(MachineConfig::default()).unwrap();
    let first = machine.mmio_zone_auto(0x1000).unwrap();
    machine
        .attach_mmio(MmioDescriptor::new(first, 0x1000, Box::new(NullMmio)))
        .unwrap();
    let second = machine.mmio_zone_auto(0x1000).unwrap();
    assert_ne!(first, second);
    assert_eq!(second % 0x1000, 0);
}

struct ResetProbe {
    resets: Arc<AtomicU32>,
    removes: Arc<AtomicU32>,
}

impl MmioHandler for ResetProbe {
    fn read(&mut self, _offset: u64, buf: &mut [u8]) -> bool {
        buf.fill(0x5a);
        true
    }
    fn write(&mut self, _offset: u64, _buf: &[u8]) -> bool {
        true
    }
    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
    fn remove(&mut self) {
        self.removes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn reset_reinitializes_harts_and_keeps_attachments() {
    let resets = Arc::new(AtomicU32::new(0));
    let removes = Arc::new(AtomicU32::new(0));
    let machine = Machine::new(MachineConfig::default()).unwrap();
    machine
        .attach_mmio(MmioDescriptor::new(
            0x1000_0000,
            0x100,
            Box::new(ResetProbe {
                resets: resets.clone(),
                removes: removes.clone(),
            }),
        ))
        .unwrap();

    // Disturb hart state, then reset.
    machine
        .with_hart(0, |hart| {
            hart.pc = 0xdead_0000;
            hart.xregs.write(5, 77);
            hart.csr.write(MSTATUS, 0x8);
        })
        .unwrap();
    machine.reset();

    machine
        .with_hart(0, |hart| {
            assert_eq!(hart.pc, RAM_BASE);
            assert_eq!(hart.xregs.read(5), 0);
            assert_eq!(hart.csr.read_mstatus(MSTATUS_MIE), 0);
            // The region answered after the reset, so it survived it.
            assert_eq!(hart.load(0x1000_0000, 32).unwrap(), 0x5a5a_5a5a);
        })
        .unwrap();
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(removes.load(Ordering::SeqCst), 0);

    drop(machine);
    assert_eq!(removes.load(Ordering::SeqCst), 1);
}
