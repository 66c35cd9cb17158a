//! Full-system RISC-V virtual machine core.
//!
//! Boots unmodified guest operating systems against a synthesized RV32/RV64
//! platform: RAM, a sorted MMIO space, per-hart software TLBs over
//! Sv32/Sv39/Sv48 translation, the IMAFDC + Zicsr + Zca/Zcb + Zba/Zbb/Zbs
//! instruction set, the M/S/U privilege model, and an inter-hart IRQ
//! fabric. Device models, loaders and front-ends live outside this crate
//! and talk to it through [`Machine`] and [`mmio::MmioHandler`].

pub mod bus;
pub mod exception;
pub mod fpu;
pub mod hart;
pub mod interrupt;
pub mod machine;
pub mod mem;
pub mod mmio;
pub mod primitives;
pub mod reg;
pub mod userland;

pub use bus::{AttachError, AttachErrorKind, BusError};
pub use exception::Exception;
pub use interrupt::{Interrupt, IrqLine};
pub use machine::{Machine, MachineConfig, MachineError, MachineOpt, ABI_VERSION};
pub use mmio::{cleanup_mmio_desc, MmioDescriptor, MmioHandle, MmioHandler, NullMmio};
pub use userland::{Userland, UserThread};
