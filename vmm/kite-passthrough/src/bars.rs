//! BAR lifecycle: region discovery, guest address allocation, and the
//! direct-map versus trap decision.
//!
//! Each present BAR gets a guest address block up front; what happens at
//! activation depends on the BAR. Data BARs whose region supports mapping
//! go straight into the guest; regions without mapping support get
//! forwarding traps that pread/pwrite the device handle. BARs hosting the
//! MSI-X table or PBA are never host-mapped at all -- they are trap-only.

use std::sync::Arc;

use kite_vm_api::passthrough::region;
use kite_vm_api::{MmioHandler, PassthroughDevice, PciBus, PioHandler, RegionFlags};
use log::warn;

use crate::error::Error;
use crate::header::{regs, PciHeader};
use crate::msix::{MsixPba, MsixTable};

/// Address-space kind of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionKind {
    /// IO-port space.
    Io,
    /// Memory space.
    Mmio,
}

/// One device region as presented to the guest.
#[derive(Debug)]
pub(crate) struct Region {
    /// Address-space kind.
    pub kind: RegionKind,
    /// Region size; a power of two for BARs.
    pub host_size: u64,
    /// Offset of the region within the device handle.
    pub host_offset: u64,
    /// Region properties reported by the passthrough driver.
    pub flags: RegionFlags,
    /// Guest base: an IO port or a guest physical address.
    pub guest_base: u64,
    /// Whether the region is currently active (mapped or trapped).
    pub mapped: bool,
}

impl Region {
    /// BAR register value exposing this region's guest base.
    pub(crate) fn fake_bar_value(&self) -> u32 {
        match self.kind {
            RegionKind::Io => (self.guest_base as u32) | regs::BAR_SPACE_IO,
            RegionKind::Mmio => self.guest_base as u32,
        }
    }
}

/// Region table plus MSI-X geometry, guarded by one lock in the owning
/// device.
pub(crate) struct BarState {
    /// One slot per region index; absent regions are `None`.
    pub regions: [Option<Region>; region::COUNT],
    /// MSI-X table geometry, when the device has the capability.
    pub table: Option<MsixTable>,
    /// PBA geometry, when the device has the capability.
    pub pba: Option<MsixPba>,
}

impl BarState {
    pub(crate) fn new() -> Self {
        Self {
            regions: std::array::from_fn(|_| None),
            table: None,
            pba: None,
        }
    }

    /// Whether `bar` hosts the MSI-X table or PBA and is therefore
    /// trap-only.
    pub(crate) fn is_msix_bar(&self, bar: usize) -> bool {
        self.table.is_some_and(|t| t.bar == bar) || self.pba.is_some_and(|p| p.bar == bar)
    }
}

/// Discovers the six BAR regions and allocates their guest address blocks.
///
/// `hdr` must still hold the physical BAR values: the raw words decide
/// IO versus memory and 64-bit versus 32-bit. MSI-X geometry already in
/// `bars` gets its guest addresses and PBA host offset filled in.
pub(crate) fn configure(
    bars: &mut BarState,
    hdr: &PciHeader,
    device: &dyn PassthroughDevice,
    bus: &dyn PciBus,
) -> Result<(), Error> {
    let mut bar = 0;
    while bar < 6 {
        let raw = hdr.bar(bar);
        let is_io = raw & regs::BAR_SPACE_IO != 0;
        let is_64 = !is_io && raw & regs::BAR_MEM_TYPE_MASK == regs::BAR_MEM_TYPE_64;
        // A 64-bit BAR consumes the following slot for its upper half.
        let step = if is_64 { 2 } else { 1 };

        let info = device.region_info(region::BAR0 + bar as u32)?;
        if info.size == 0 {
            bar += step;
            continue;
        }
        if !info.size.is_power_of_two() {
            return Err(Error::BadBarSize {
                bar,
                size: info.size,
            });
        }

        let (kind, guest_base) = if is_io {
            (
                RegionKind::Io,
                u64::from(bus.alloc_io_block(info.size as u32)?),
            )
        } else {
            (RegionKind::Mmio, bus.alloc_mmio_block(info.size)?)
        };

        if let Some(table) = bars.table.as_mut().filter(|t| t.bar == bar) {
            table.guest_phys = guest_base + table.bar_offset;
        }
        if let Some(pba) = bars.pba.as_mut().filter(|p| p.bar == bar) {
            pba.guest_phys = guest_base + pba.bar_offset;
            pba.host_offset = info.offset + pba.bar_offset;
        }

        bars.regions[bar] = Some(Region {
            kind,
            host_size: info.size,
            host_offset: info.offset,
            flags: info.flags,
            guest_base,
            mapped: false,
        });
        bar += step;
    }

    // The MSI-X structures must land in BARs the device actually exposes.
    if let Some(table) = &bars.table {
        if bars.regions[table.bar].is_none() {
            return Err(Error::MsixBarAbsent(table.bar));
        }
    }
    if let Some(pba) = &bars.pba {
        if bars.regions[pba.bar].is_none() {
            return Err(Error::MsixBarAbsent(pba.bar));
        }
    }
    Ok(())
}

/// Rewrites the header's BAR slots with the guest-visible values.
///
/// Second halves of 64-bit BARs stay zero; the expansion ROM BAR and the
/// CardBus pointer are cleared (neither is passed through).
pub(crate) fn write_fake_bars(hdr: &mut PciHeader, bars: &BarState) {
    for bar in 0..6 {
        let val = match &bars.regions[bar] {
            Some(r) => r.fake_bar_value(),
            None => 0,
        };
        hdr.set_bar(bar, val);
    }
    hdr.write_u32(regs::ROM_ADDRESS, 0);
    hdr.write_u32(regs::CARDBUS_CIS, 0);
}

/// Trap handler forwarding guest accesses to the device handle, for
/// regions that cannot be mapped directly.
pub(crate) struct RegionForward {
    name: String,
    device: Arc<dyn PassthroughDevice>,
    host_offset: u64,
    size: u64,
}

impl RegionForward {
    pub(crate) fn new(
        name: String,
        device: Arc<dyn PassthroughDevice>,
        host_offset: u64,
        size: u64,
    ) -> Self {
        Self {
            name,
            device,
            host_offset,
            size,
        }
    }

    fn forward_read(&self, offset: u64, data: &mut [u8]) {
        if offset + data.len() as u64 > self.size {
            warn!("{}: region read outside BAR at {offset:#x}", self.name);
            return;
        }
        if let Err(e) = self.device.read_at(self.host_offset + offset, data) {
            warn!("{}: region read at {offset:#x} failed: {e}", self.name);
        }
    }

    fn forward_write(&self, offset: u64, data: &[u8]) {
        if offset + data.len() as u64 > self.size {
            warn!("{}: region write outside BAR at {offset:#x}", self.name);
            return;
        }
        if let Err(e) = self.device.write_at(self.host_offset + offset, data) {
            warn!("{}: region write at {offset:#x} failed: {e}", self.name);
        }
    }
}

impl MmioHandler for RegionForward {
    fn read(&self, offset: u64, data: &mut [u8]) {
        self.forward_read(offset, data);
    }

    fn write(&self, offset: u64, data: &[u8]) {
        self.forward_write(offset, data);
    }
}

impl PioHandler for RegionForward {
    fn io_in(&self, offset: u16, data: &mut [u8]) {
        self.forward_read(u64::from(offset), data);
    }

    fn io_out(&self, offset: u16, data: &[u8]) {
        self.forward_write(u64::from(offset), data);
    }
}
