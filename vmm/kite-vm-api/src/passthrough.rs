//! Passthrough-driver interface.
//!
//! The kernel's device-passthrough facility exposes a physical PCI function
//! as a set of indexed regions (config space, BARs) and indexed interrupts
//! (INTx, MSI, MSI-X) behind a single device handle. [`PassthroughDevice`]
//! is the VMM-side rendering of that facility.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::error::DeviceError;

/// Region indices of a passthrough PCI function.
///
/// The layout is fixed by the passthrough driver: one region per BAR slot,
/// then the expansion ROM, then config space.
pub mod region {
    /// First BAR region; BAR `n` is `BAR0 + n`.
    pub const BAR0: u32 = 0;
    /// Last BAR region.
    pub const BAR5: u32 = 5;
    /// Expansion ROM region.
    pub const ROM: u32 = 6;
    /// Configuration-space region.
    pub const CONFIG: u32 = 7;
    /// Number of regions the engine tracks.
    pub const COUNT: usize = 8;
}

/// Interrupt indices of a passthrough PCI function.
pub mod irq {
    /// Legacy pin interrupt (INTA-INTD).
    pub const INTX: u32 = 0;
    /// MSI capability.
    pub const MSI: u32 = 1;
    /// MSI-X capability.
    pub const MSIX: u32 = 2;
}

bitflags! {
    /// Properties of a device region, as reported by the passthrough driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegionFlags: u32 {
        /// The region supports reads.
        const READ = 1 << 0;
        /// The region supports writes.
        const WRITE = 1 << 1;
        /// The region may be memory-mapped directly into the guest.
        ///
        /// Regions without this flag are serviced by read/write forwarding.
        const MMAP = 1 << 2;
    }
}

bitflags! {
    /// Properties of a device interrupt index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqFlags: u32 {
        /// The interrupt can be bound to an event fd.
        const EVENTFD = 1 << 0;
        /// The interrupt supports explicit mask/unmask operations.
        const MASKABLE = 1 << 1;
        /// The driver masks the interrupt automatically on delivery
        /// (level-triggered INTx).
        const AUTOMASKED = 1 << 2;
        /// The vector count cannot be changed after the first set-up call.
        const NORESIZE = 1 << 3;
    }
}

bitflags! {
    /// Payload type and action of an [`IrqSet`] call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqSetFlags: u32 {
        /// The payload is an array of event fds.
        const DATA_EVENTFD = 1 << 0;
        /// No payload; clears the affected vectors.
        const DATA_NONE = 1 << 1;
        /// Assign the trigger action.
        const ACTION_TRIGGER = 1 << 4;
        /// Assign the unmask action (level-triggered interrupts).
        const ACTION_UNMASK = 1 << 5;
    }
}

/// Metadata for one device region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionInfo {
    /// Region size in bytes; zero means the region is absent.
    pub size: u64,
    /// Offset of the region within the device handle, for positioned
    /// reads and writes.
    pub offset: u64,
    /// Region properties.
    pub flags: RegionFlags,
}

/// Metadata for one device interrupt index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqInfo {
    /// Number of vectors at this index; zero means the index is absent.
    pub count: u32,
    /// Interrupt properties.
    pub flags: IrqFlags,
}

/// One interrupt-programming call to the passthrough driver.
///
/// Covers `[start, start + count)` vectors of interrupt `index`. When
/// `flags` carries [`IrqSetFlags::DATA_EVENTFD`], `fds` holds one entry per
/// vector; a `None` slot is the placeholder for "no fd yet" and detaches
/// that vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrqSet {
    /// Interrupt index being programmed (see [`irq`]).
    pub index: u32,
    /// First vector covered.
    pub start: u32,
    /// Number of vectors covered.
    pub count: u32,
    /// Payload type and action.
    pub flags: IrqSetFlags,
    /// Event-fd payload; empty unless `flags` carries `DATA_EVENTFD`.
    pub fds: Vec<Option<RawFd>>,
}

/// Handle to a physical PCI function exported by the passthrough driver.
///
/// All operations are synchronous kernel calls and may block briefly.
pub trait PassthroughDevice: Send + Sync {
    /// Queries metadata for a region index.
    ///
    /// An absent region is reported with `size == 0`, not as an error.
    fn region_info(&self, index: u32) -> Result<RegionInfo, DeviceError>;

    /// Queries metadata for an interrupt index.
    fn irq_info(&self, index: u32) -> Result<IrqInfo, DeviceError>;

    /// Programs a range of interrupt vectors.
    fn set_irqs(&self, set: IrqSet) -> Result<(), DeviceError>;

    /// Reads `data.len()` bytes at `offset` within the device handle.
    fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<(), DeviceError>;

    /// Writes `data` at `offset` within the device handle.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
}
