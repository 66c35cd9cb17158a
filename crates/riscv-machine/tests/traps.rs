//! Trap delivery, delegation, xRET, interrupts, WFI.

mod common;

use common::{
    addi, blt, csrrc, csrrs, csrrsi, csrrw, jal, lw, machine_with, step_n, sw, words, ECALL, MRET,
    RAM_BASE, WFI,
};
use pretty_assertions::assert_eq;
use riscv_machine::hart::Mode;
use riscv_machine::interrupt::{Interrupt, IrqLine};
use riscv_machine::reg::csr::{
    MCAUSE, MEDELEG, MEPC, MIE, MSIP_BIT, MSTATUS_MIE, MTVAL, MTVEC, SCAUSE, SEPC, SSIP_BIT, STVEC,
};
use riscv_machine::{Machine, MachineConfig};
use std::time::{Duration, Instant};

const HANDLER: u64 = RAM_BASE + 0x100;

#[test]
fn illegal_instruction_reports_parcel_and_pc() {
    // 0xffffffff is a 32-bit parcel with an unassigned major opcode.
    let machine = machine_with(&words(&[addi(31, 0, 5), 0xffff_ffff, addi(31, 0, 6)]));
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MTVEC, HANDLER);
            step_n(hart, 2);
            assert_eq!(hart.csr.read(MCAUSE), 2);
            assert_eq!(hart.csr.read(MEPC), RAM_BASE + 4);
            assert_eq!(hart.csr.read(MTVAL), 0xffff_ffff);
            assert_eq!(hart.pc, HANDLER);
            assert_eq!(hart.xregs.read(31), 5, "first instruction retired");
        })
        .unwrap();
}

#[test]
fn ecall_cause_tracks_privilege() {
    let machine = machine_with(&words(&[ECALL]));
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MTVEC, HANDLER);
            step_n(hart, 1);
            assert_eq!(hart.csr.read(MCAUSE), 11, "ecall from M-mode");
        })
        .unwrap();

    let machine = machine_with(&words(&[ECALL]));
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MTVEC, HANDLER);
            hart.mode = Mode::User;
            step_n(hart, 1);
            assert_eq!(hart.csr.read(MCAUSE), 8, "ecall from U-mode");
            assert_eq!(hart.mode, Mode::Machine, "undelegated traps enter M");
        })
        .unwrap();
}

#[test]
fn delegated_exception_lands_in_supervisor() {
    let machine = machine_with(&words(&[ECALL]));
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MEDELEG, 1 << 8); // delegate U-mode ecalls
            hart.csr.write(STVEC, HANDLER);
            hart.csr.write(MTVEC, HANDLER + 0x100);
            hart.mode = Mode::User;
            step_n(hart, 1);
            assert_eq!(hart.mode, Mode::Supervisor);
            assert_eq!(hart.csr.read(SCAUSE), 8);
            assert_eq!(hart.csr.read(SEPC), RAM_BASE);
            assert_eq!(hart.pc, HANDLER);
        })
        .unwrap();
}

#[test]
fn mret_resumes_after_the_trapping_instruction() {
    // Guest: ecall, then addi x5, x0, 7.
    // Handler: mepc += 4, mret.
    let machine = machine_with(&words(&[ECALL, addi(5, 0, 7)]));
    machine
        .write_ram(
            HANDLER,
            &words(&[
                csrrs(6, MEPC as u32, 0),
                addi(6, 6, 4),
                csrrw(0, MEPC as u32, 6),
                MRET,
            ]),
        )
        .unwrap();
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MTVEC, HANDLER);
            // ecall + 4 handler instructions + the addi after resume.
            step_n(hart, 6);
            assert_eq!(hart.xregs.read(5), 7);
            assert_eq!(hart.mode, Mode::Machine);
            assert_eq!(hart.pc, RAM_BASE + 8);
        })
        .unwrap();
}

#[test]
fn interrupt_delivery_honors_priority_and_vectoring() {
    let machine = machine_with(&[]);
    machine.raise_irq(0, IrqLine::MachineSoftware);
    machine.raise_irq(0, IrqLine::MachineTimer);
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MIE, 0xaaa);
            hart.csr.write_mstatus(MSTATUS_MIE, 1);
            hart.csr.write(MTVEC, HANDLER | 1); // vectored

            let irq = hart.pending_interrupt().expect("pending");
            assert_eq!(irq, Interrupt::MachineSoftware, "software beats timer");
            hart.take_interrupt(irq);
            assert_eq!(hart.csr.read(MCAUSE), (1 << 63) | 3);
            assert_eq!(hart.pc, HANDLER + 4 * 3, "vectored entry");
            // Taking the interrupt cleared the global enable.
            assert_eq!(hart.csr.read_mstatus(MSTATUS_MIE), 0);
            assert!(hart.pending_interrupt().is_none());
        })
        .unwrap();
}

#[test]
fn delegated_interrupt_lands_in_supervisor() {
    use riscv_machine::reg::csr::{MIDELEG, SCAUSE as SC, SSIP_BIT};

    let machine = machine_with(&[]);
    machine.raise_irq(0, IrqLine::SupervisorSoftware);
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MIE, 0xaaa);
            hart.csr.write(MIDELEG, SSIP_BIT);
            hart.csr.write(STVEC, HANDLER);
            hart.mode = Mode::User;

            let irq = hart.pending_interrupt().expect("pending");
            assert_eq!(irq, Interrupt::SupervisorSoftware);
            hart.take_interrupt(irq);
            assert_eq!(hart.mode, Mode::Supervisor);
            assert_eq!(hart.csr.read(SC), (1 << 63) | 1);
            assert_eq!(hart.pc, HANDLER);
        })
        .unwrap();
}

#[test]
fn delegated_interrupt_not_taken_in_machine_mode() {
    use riscv_machine::reg::csr::{MIDELEG, SSIP_BIT};

    let machine = machine_with(&[]);
    machine.raise_irq(0, IrqLine::SupervisorSoftware);
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MIE, 0xaaa);
            hart.csr.write(MIDELEG, SSIP_BIT);
            hart.csr.write_mstatus(MSTATUS_MIE, 1);
            // Delegated-to-S sources never preempt M-mode.
            assert!(hart.pending_interrupt().is_none());
        })
        .unwrap();
}

#[test]
fn masked_interrupts_stay_pending() {
    let machine = machine_with(&[]);
    machine.raise_irq(0, IrqLine::MachineExternal);
    machine
        .with_hart(0, |hart| {
            // Enabled in mie but globally masked in M-mode.
            hart.csr.write(MIE, 0xaaa);
            assert!(hart.pending_interrupt().is_none());
            hart.csr.write_mstatus(MSTATUS_MIE, 1);
            assert_eq!(hart.pending_interrupt(), Some(Interrupt::MachineExternal));
        })
        .unwrap();
}

#[test]
fn csr_unmask_delivers_pending_irq() {
    // The IRQ arrives while both mie and mstatus.MIE mask it. Delivery
    // must happen the moment the guest's own CSR writes unmask it, not
    // only when some later external event rings the hart.
    let flag = RAM_BASE + 0x4000;
    let machine = Machine::new(MachineConfig::default()).unwrap();
    machine
        .write_ram(
            RAM_BASE,
            &words(&[
                csrrs(0, MIE as u32, 5), // mie |= MSIP: still globally masked
                csrrsi(0, 0x300, 8),     // mstatus.MIE = 1: now deliverable
                WFI,
                jal(0, -4),
            ]),
        )
        .unwrap();
    machine
        .write_ram(HANDLER, &words(&[sw(28, 29, 0), WFI, jal(0, -4)]))
        .unwrap();
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MTVEC, HANDLER);
            hart.xregs.write(5, MSIP_BIT);
            hart.xregs.write(28, flag);
            hart.xregs.write(29, 1);
        })
        .unwrap();
    machine.raise_irq(0, IrqLine::MachineSoftware);
    machine.start();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut buf = [0u8; 4];
    loop {
        machine.read_ram(flag, &mut buf).unwrap();
        if u32::from_le_bytes(buf) == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "unmasking never delivered the pending interrupt"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
    machine.pause();
    machine
        .with_hart(0, |hart| {
            // Taken between instructions: mepc is the wfi after the
            // unmasking csrrsi, not the csrrsi itself.
            assert_eq!(hart.csr.read(MEPC), RAM_BASE + 8);
        })
        .unwrap();
    machine.power_off();
}

#[test]
fn mret_with_latched_source_redelivers() {
    // A handler that returns with its source still pending is re-entered
    // immediately off the mret; the second pass clears the source through
    // mip and the main flow then resumes exactly once.
    let counter = RAM_BASE + 0x4100;
    let flag = RAM_BASE + 0x4104;
    let machine = Machine::new(MachineConfig::default()).unwrap();
    machine
        .write_ram(
            RAM_BASE,
            &words(&[
                csrrs(0, MIE as u32, 5), // enable SSIP in mie
                csrrsi(0, 0x300, 8),     // unmask: first delivery lands here
                sw(28, 29, 0),           // runs only after the handler is done
                WFI,
                jal(0, -4),
            ]),
        )
        .unwrap();
    machine
        .write_ram(
            HANDLER,
            &words(&[
                lw(27, 26, 0),
                addi(27, 27, 1),
                sw(26, 27, 0),
                addi(24, 0, 2),
                blt(27, 24, 8),     // first entry leaves the source latched
                csrrc(0, 0x344, 23), // second entry clears mip.SSIP
                MRET,
            ]),
        )
        .unwrap();
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MTVEC, HANDLER);
            hart.xregs.write(5, SSIP_BIT);
            hart.xregs.write(23, SSIP_BIT);
            hart.xregs.write(26, counter);
            hart.xregs.write(28, flag);
            hart.xregs.write(29, 1);
        })
        .unwrap();
    machine.raise_irq(0, IrqLine::SupervisorSoftware);
    machine.start();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut buf = [0u8; 4];
    loop {
        machine.read_ram(flag, &mut buf).unwrap();
        if u32::from_le_bytes(buf) == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "mret never redelivered the latched interrupt"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
    machine.pause();
    machine.read_ram(counter, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 2, "handler entered exactly twice");
    machine.power_off();
}

#[test]
fn wfi_hart_wakes_on_raised_irq() {
    // x28 holds the flag address; the guest parks in WFI, then stores 1
    // after something rings it.
    let flag = RAM_BASE + 0x4000;
    let machine = Machine::new(MachineConfig::default()).unwrap();
    machine
        .write_ram(
            RAM_BASE,
            &words(&[WFI, addi(5, 0, 1), sw(28, 5, 0), WFI, jal(0, -4)]),
        )
        .unwrap();
    machine
        .with_hart(0, |hart| {
            hart.xregs.write(28, flag);
            // Software interrupts enabled in mie, but mstatus.MIE stays 0:
            // the wakeup must not need a trap.
            hart.csr.write(MIE, MSIP_BIT);
        })
        .unwrap();
    machine.start();

    std::thread::sleep(Duration::from_millis(30));
    let mut buf = [0u8; 4];
    machine.read_ram(flag, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0, "hart must sleep in WFI");

    machine.raise_irq(0, IrqLine::MachineSoftware);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        machine.read_ram(flag, &mut buf).unwrap();
        if u32::from_le_bytes(buf) == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "hart never woke from WFI");
        std::thread::sleep(Duration::from_millis(2));
    }
    machine.power_off();
}

#[test]
fn csr_access_is_privilege_checked() {
    // csrrs x5, mstatus, x0 from U-mode must be illegal.
    let machine = machine_with(&words(&[csrrs(5, 0x300, 0)]));
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MTVEC, HANDLER);
            hart.mode = Mode::User;
            step_n(hart, 1);
            assert_eq!(hart.csr.read(MCAUSE), 2);
        })
        .unwrap();
}

#[test]
fn writes_to_read_only_csrs_are_illegal() {
    // csrrw x0, mhartid, x5
    let machine = machine_with(&words(&[csrrw(0, 0xf14, 5)]));
    machine
        .with_hart(0, |hart| {
            hart.csr.write(MTVEC, HANDLER);
            step_n(hart, 1);
            assert_eq!(hart.csr.read(MCAUSE), 2);
        })
        .unwrap();
}

#[test]
fn unknown_csr_is_illegal() {
    let machine = machine_with(&words(&[csrrs(5, 0x123, 0)]));
    machine
        .with_hart(0, |hart| {
            step_n(hart, 1);
            assert_eq!(hart.csr.read(MCAUSE), 2);
        })
        .unwrap();
}
