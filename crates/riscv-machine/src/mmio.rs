//! Memory-mapped I/O regions.
//!
//! Devices hang off the physical address space as regions implementing
//! [`MmioHandler`]. The core never touches device state directly: every
//! guest access bounces through a small aligned buffer handed to the
//! handler, one handler call per logical access.

/// Identifies an attached region for later detach. Stable across other
/// attach/detach operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MmioHandle(pub(crate) u64);

/// Device side of an MMIO region.
///
/// `offset` is always aligned to `buf.len()`, and `buf.len()` is within the
/// region's declared `[min_op_size, max_op_size]` window. Returning `false`
/// from `read`/`write` raises a load/store access fault in the guest.
pub trait MmioHandler: Send {
    /// Fill `buf` with the register content at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> bool;

    /// Apply the guest's write of `buf` at `offset`.
    fn write(&mut self, offset: u64, buf: &[u8]) -> bool;

    /// Periodic poll from the event-loop thread.
    fn update(&mut self) {}

    /// Machine reset. Attachments survive; device state should not.
    fn reset(&mut self) {}

    /// Called once when the region is detached or the machine is freed.
    fn remove(&mut self) {}
}

/// Placeholder device: reads as zeros, ignores writes.
pub struct NullMmio;

impl MmioHandler for NullMmio {
    fn read(&mut self, _offset: u64, buf: &mut [u8]) -> bool {
        buf.fill(0);
        true
    }

    fn write(&mut self, _offset: u64, _buf: &[u8]) -> bool {
        true
    }
}

/// Everything needed to attach a region: placement, access-size window and
/// the handler that owns the device state.
pub struct MmioDescriptor {
    /// First guest-physical address of the region.
    pub addr: u64,
    /// Region size in bytes.
    pub size: u64,
    /// Smallest access the device accepts (bytes, power of two).
    pub min_op_size: u8,
    /// Largest access the device accepts (bytes, power of two, <= 8).
    pub max_op_size: u8,
    /// The device.
    pub handler: Box<dyn MmioHandler>,
}

impl MmioDescriptor {
    /// Descriptor with the given placement and a 1..=8 byte access window.
    pub fn new(addr: u64, size: u64, handler: Box<dyn MmioHandler>) -> Self {
        Self {
            addr,
            size,
            min_op_size: 1,
            max_op_size: 8,
            handler,
        }
    }

    /// True if the op-size window is well-formed.
    pub(crate) fn sizes_valid(&self) -> bool {
        let min = self.min_op_size;
        let max = self.max_op_size;
        min >= 1
            && max <= 8
            && min <= max
            && min.is_power_of_two()
            && max.is_power_of_two()
            && self.size > 0
            && self.size % max as u64 == 0
    }
}

impl std::fmt::Debug for MmioDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioDescriptor")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &format_args!("{:#x}", self.size))
            .field("min_op_size", &self.min_op_size)
            .field("max_op_size", &self.max_op_size)
            .finish_non_exhaustive()
    }
}

/// Run the descriptor's `remove` hook and drop it. Front-ends call this on
/// a descriptor that failed to attach.
pub fn cleanup_mmio_desc(mut desc: MmioDescriptor) {
    desc.handler.remove();
}
