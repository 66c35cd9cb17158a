//! Virtual memory end to end: page fault delivery, PTE fix-up, retry, and
//! TLB coherence over sfence.vma.

mod common;

use common::{lw, machine_with, step_n, words, RAM_BASE, SRET};
use pretty_assertions::assert_eq;
use riscv_machine::hart::Mode;
use riscv_machine::reg::csr::{MEDELEG, MSTATUS_MPP, MSTATUS_MPRV, SATP, SCAUSE, SEPC, STVAL, STVEC};

const ROOT: u64 = RAM_BASE + 0x1_0000;
const MID: u64 = RAM_BASE + 0x1_1000;
const LEAF: u64 = RAM_BASE + 0x1_2000;
const TARGET: u64 = RAM_BASE + 0x1_3000;
const VA: u64 = 0x1000;

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_X: u64 = 1 << 3;
const PTE_A: u64 = 1 << 6;

fn pte(pa: u64, flags: u64) -> [u8; 8] {
    (((pa >> 12) << 10) | flags).to_le_bytes()
}

#[test]
fn load_page_fault_fix_and_retry() {
    // Supervisor code runs fully translated: VA 0 maps the code page, VA
    // 0x1000 is the (initially unmapped) data page, and the fault is
    // delegated to S-mode so the handler runs under the same satp.
    let machine = machine_with(&words(&[lw(5, 10, 0)]));
    machine.write_ram(RAM_BASE + 0x100, &words(&[SRET])).unwrap();

    // Sv39: root[0] -> mid, mid[0] -> leaf; leaf[0] is the executable code
    // page, leaf[1] the data page (invalid for now).
    machine.write_ram(ROOT, &pte(MID, PTE_V)).unwrap();
    machine.write_ram(MID, &pte(LEAF, PTE_V)).unwrap();
    machine
        .write_ram(LEAF, &pte(RAM_BASE, PTE_V | PTE_R | PTE_X | PTE_A))
        .unwrap();
    machine.write_ram(LEAF + 8, &pte(TARGET, 0)).unwrap();
    machine
        .write_ram(TARGET, &0xcafe_f00du32.to_le_bytes())
        .unwrap();

    machine
        .with_hart(0, |hart| {
            hart.xregs.write(10, VA);
            hart.csr.write(SATP, (8 << 60) | (ROOT >> 12));
            hart.csr.write(MEDELEG, 1 << 13); // delegate load page faults
            hart.csr.write(STVEC, 0x100); // handler VA
            hart.mode = Mode::Supervisor;
            hart.pc = 0; // code VA

            // 1. The load faults; the trap stays in S-mode with the
            //    faulting VA in stval and the load's pc in sepc.
            step_n(hart, 1);
            assert_eq!(hart.csr.read(SCAUSE), 13, "load page fault");
            assert_eq!(hart.csr.read(STVAL), VA);
            assert_eq!(hart.csr.read(SEPC), 0);
            assert_eq!(hart.pc, 0x100);
            assert_eq!(hart.mode, Mode::Supervisor);
        })
        .unwrap();

    // 2. Fix the mapping while the hart sits in the handler.
    machine
        .write_ram(LEAF + 8, &pte(TARGET, PTE_V | PTE_R | PTE_A))
        .unwrap();

    machine
        .with_hart(0, |hart| {
            // 3. sret resumes at the faulting load; the retry succeeds.
            step_n(hart, 1);
            assert_eq!(hart.pc, 0);
            step_n(hart, 1);
            assert_eq!(hart.xregs.read(5) as u32, 0xcafe_f00d);
        })
        .unwrap();
}

#[test]
fn sfence_forces_a_fresh_walk() {
    let machine = machine_with(&words(&[lw(5, 10, 0)]));
    machine.write_ram(ROOT, &pte(MID, PTE_V)).unwrap();
    machine.write_ram(MID, &pte(LEAF, PTE_V)).unwrap();
    machine
        .write_ram(LEAF + 8, &pte(TARGET, PTE_V | PTE_R | PTE_A))
        .unwrap();
    machine.write_ram(TARGET, &1u32.to_le_bytes()).unwrap();
    machine
        .write_ram(TARGET + 0x1000, &2u32.to_le_bytes())
        .unwrap();

    machine
        .with_hart(0, |hart| {
            hart.csr.write(SATP, (8 << 60) | (ROOT >> 12));
            hart.csr.write_mstatus(MSTATUS_MPRV, 1);
            hart.csr.write_mstatus(MSTATUS_MPP, Mode::Supervisor.bits());

            assert_eq!(hart.load(VA, 32).unwrap(), 1);
            // Remap the page. The stale translation keeps answering until
            // the guest fences.
            hart.bus()
                .write(LEAF + 8, &pte(TARGET + 0x1000, PTE_V | PTE_R | PTE_A))
                .unwrap();
            assert_eq!(hart.load(VA, 32).unwrap(), 1, "hit the cached entry");
            hart.sfence_vma(None);
            assert_eq!(hart.load(VA, 32).unwrap(), 2, "walked the new table");
        })
        .unwrap();
}
