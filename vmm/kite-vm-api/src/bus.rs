//! PCI bus subsystem interface.
//!
//! The bus subsystem owns guest-visible address space and the dispatch
//! tables for config-space, MMIO, and port-IO exits. A device backend
//! publishes a [`PciConfigOps`] implementation and receives config accesses
//! and BAR lifecycle callbacks; it registers [`MmioHandler`]s and
//! [`PioHandler`]s for the windows it wants to interpose on.

use std::sync::Arc;

use crate::error::DeviceError;
use crate::passthrough::PassthroughDevice;

/// A bus-assigned legacy interrupt line and its global system interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyIrq {
    /// Value for the header's interrupt-line register.
    pub line: u8,
    /// GSI the line is routed to.
    pub gsi: u32,
}

/// Handler for a trapped guest MMIO window.
///
/// Offsets are relative to the registered base: handlers capture whatever
/// identity they need at registration time and never reconstruct it from
/// guest addresses.
pub trait MmioHandler: Send + Sync {
    /// Services a guest read of `data.len()` bytes at `offset`.
    fn read(&self, offset: u64, data: &mut [u8]);

    /// Services a guest write of `data` at `offset`.
    fn write(&self, offset: u64, data: &[u8]);
}

/// Handler for a trapped guest port-IO window.
pub trait PioHandler: Send + Sync {
    /// Services a guest `in` of `data.len()` bytes at `offset`.
    fn io_in(&self, offset: u16, data: &mut [u8]);

    /// Services a guest `out` of `data` at `offset`.
    fn io_out(&self, offset: u16, data: &[u8]);
}

/// Config-space callbacks a device publishes to the bus.
///
/// The bus serializes BAR lifecycle callbacks per device. It also owns the
/// BAR sizing protocol: writes inside the BAR window never reach
/// [`cfg_write`](Self::cfg_write); a finalized base change is reported as
/// `bar_deactivate` at the old base followed by `bar_activate` at the new
/// one.
pub trait PciConfigOps: Send + Sync {
    /// Services a guest config-space read at `offset`.
    fn cfg_read(&self, offset: u16, data: &mut [u8]);

    /// Services a guest config-space write at `offset`.
    fn cfg_write(&self, offset: u16, data: &[u8]);

    /// The guest programmed BAR `bar`; its window now starts at
    /// `guest_base` (a guest physical address, or a port number for IO
    /// BARs).
    fn bar_activate(&self, bar: usize, guest_base: u64) -> Result<(), DeviceError>;

    /// The window of BAR `bar` is being torn down.
    fn bar_deactivate(&self, bar: usize) -> Result<(), DeviceError>;
}

/// Guest-facing services of the PCI bus subsystem.
pub trait PciBus: Send + Sync {
    /// Allocates a naturally aligned block of guest IO-port space.
    fn alloc_io_block(&self, size: u32) -> Result<u16, DeviceError>;

    /// Allocates a naturally aligned block of guest MMIO space.
    fn alloc_mmio_block(&self, size: u64) -> Result<u64, DeviceError>;

    /// Allocates a legacy interrupt line for a device.
    fn alloc_legacy_irq(&self) -> Result<LegacyIrq, DeviceError>;

    /// Registers a device on the bus; returns its device identifier, used
    /// to key MSI routes.
    fn register_device(&self, ops: Arc<dyn PciConfigOps>) -> Result<u32, DeviceError>;

    /// Removes a device registered with
    /// [`register_device`](Self::register_device).
    fn unregister_device(&self, devid: u32);

    /// Maps `size` bytes of the device handle at `host_offset` directly
    /// into the guest at `guest_base`. Guest accesses bypass the VMM.
    fn map_direct(
        &self,
        guest_base: u64,
        size: u64,
        device: &Arc<dyn PassthroughDevice>,
        host_offset: u64,
    ) -> Result<(), DeviceError>;

    /// Removes a direct mapping installed by [`map_direct`](Self::map_direct).
    fn unmap_direct(&self, guest_base: u64, size: u64);

    /// Routes guest MMIO in `[guest_base, guest_base + size)` to `handler`.
    fn add_mmio_trap(
        &self,
        guest_base: u64,
        size: u64,
        handler: Arc<dyn MmioHandler>,
    ) -> Result<(), DeviceError>;

    /// Removes an MMIO trap installed by [`add_mmio_trap`](Self::add_mmio_trap).
    fn del_mmio_trap(&self, guest_base: u64, size: u64);

    /// Routes guest port IO in `[port_base, port_base + size)` to `handler`.
    fn add_pio_trap(
        &self,
        port_base: u16,
        size: u16,
        handler: Arc<dyn PioHandler>,
    ) -> Result<(), DeviceError>;

    /// Removes a PIO trap installed by [`add_pio_trap`](Self::add_pio_trap).
    fn del_pio_trap(&self, port_base: u16, size: u16);

    /// Whether the platform can express PCI Express capabilities to the
    /// guest. When false, devices are presented as conventional PCI.
    fn supports_pcie(&self) -> bool;
}
