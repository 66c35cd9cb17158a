//! This module holds global constants employed by the virtual machine.

/// This is the number of integer and floating-point registers per hart.
pub const NUM_REGISTERS: usize = 32;

/// One byte len.
pub const BYTE: u8 = 8;

/// Half word len.
pub const HALFWORD: u8 = 16;

/// Whole word len.
pub const WORD: u8 = 32;

/// Doubleword len.
pub const DOUBLEWORD: u8 = 64;

/// The page size (4 KiB) for the virtual memory system.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;

/// Offset mask within one page.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Number of entries in each per-hart TLB. Must be a power of two.
pub const TLB_SIZE: usize = 256;

/// An address where guest RAM starts by default.
pub const DEFAULT_RAM_BASE: u64 = 0x8000_0000;

/// Default size of guest RAM.
pub const DEFAULT_RAM_SIZE: u64 = 0x800_0000;

/// Base of the physical window scanned by automatic MMIO placement.
pub const MMIO_ZONE_BASE: u64 = 0x1000_0000;

/// Alignment granted to automatically placed MMIO regions.
pub const MMIO_ZONE_ALIGN: u64 = 0x1000;

/// How often the device update thread runs its hooks.
pub const EVENTLOOP_PERIOD_US: u64 = 10_000;
