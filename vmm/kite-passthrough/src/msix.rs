//! MSI-X table and PBA interposition.
//!
//! The BAR hosting the MSI-X table is never mapped into the guest; accesses
//! trap here. Table reads are served from the in-memory entry images so the
//! guest always reads back exactly what it wrote; table writes flow into
//! the per-vector state machine. PBA reads are forwarded to the physical
//! function (the hardware never masks MSI-X itself -- masking is emulated
//! at the routing layer -- so the physical pending bits are as informative
//! as anything we could synthesize); PBA writes are ignored.

use std::sync::{Arc, Mutex};

use kite_vm_api::{MmioHandler, PassthroughDevice};
use log::warn;

use crate::header::{regs, PciHeader};
use crate::lock;
use crate::vectors::{VectorFlags, VectorGroup};

/// Geometry of the synthesized MSI-X table.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MsixTable {
    /// BAR slot hosting the table.
    pub bar: usize,
    /// Byte offset of the table within that BAR.
    pub bar_offset: u64,
    /// Table span in bytes.
    pub size: u64,
    /// Guest physical address of the table; tracks BAR activation.
    pub guest_phys: u64,
}

/// Geometry of the Pending Bit Array.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MsixPba {
    /// BAR slot hosting the PBA.
    pub bar: usize,
    /// Byte offset of the PBA within that BAR.
    pub bar_offset: u64,
    /// PBA span in bytes.
    pub size: u64,
    /// Guest physical address of the PBA; tracks BAR activation.
    pub guest_phys: u64,
    /// Absolute device-handle offset guest PBA reads are served from.
    pub host_offset: u64,
}

/// Decodes the table and PBA geometry from the MSI-X capability at `pos`.
///
/// `host_offset` of the PBA is filled in later, once the hosting BAR's
/// region metadata is known.
pub(crate) fn parse_geometry(hdr: &PciHeader, pos: u8, nr_entries: usize) -> (MsixTable, MsixPba) {
    let pos = pos as usize;
    let table_reg = hdr.read_u32(pos + regs::MSIX_TABLE);
    let pba_reg = hdr.read_u32(pos + regs::MSIX_PBA);

    let table = MsixTable {
        bar: (table_reg & regs::MSIX_BIR_MASK) as usize,
        bar_offset: u64::from(table_reg & !regs::MSIX_BIR_MASK),
        size: (nr_entries * regs::MSIX_ENTRY_SIZE) as u64,
        guest_phys: 0,
    };
    let pba = MsixPba {
        bar: (pba_reg & regs::MSIX_BIR_MASK) as usize,
        bar_offset: u64::from(pba_reg & !regs::MSIX_BIR_MASK),
        // One pending bit per vector, in qword granules.
        size: (nr_entries.div_ceil(64) * 8) as u64,
        guest_phys: 0,
        host_offset: 0,
    };
    (table, pba)
}

/// Returns `true` for the access widths the table accepts.
fn access_ok(offset: u64, len: usize) -> bool {
    (len == 4 || len == 8) && offset % (len as u64) == 0
}

/// MMIO handler for the synthesized MSI-X table.
///
/// Holds its owning device's identity (name and vector group) from
/// registration time.
pub(crate) struct MsixTableMmio {
    pub(crate) name: String,
    pub(crate) group: Arc<Mutex<VectorGroup>>,
}

impl MmioHandler for MsixTableMmio {
    fn read(&self, offset: u64, data: &mut [u8]) {
        if !access_ok(offset, data.len()) {
            warn!(
                "{}: ignoring {}-byte MSI-X table read at {offset:#x}",
                self.name,
                data.len()
            );
            return;
        }
        let vector = (offset as usize) / regs::MSIX_ENTRY_SIZE;
        let field = (offset as usize) % regs::MSIX_ENTRY_SIZE;

        let group = lock(&self.group);
        let Some(entry) = group.entries.get(vector) else {
            warn!("{}: MSI-X table read outside table (vector {vector})", self.name);
            return;
        };
        // The guest must see exactly what it last wrote.
        entry.config.read(field, data);
    }

    fn write(&self, offset: u64, data: &[u8]) {
        if !access_ok(offset, data.len()) {
            warn!(
                "{}: ignoring {}-byte MSI-X table write at {offset:#x}",
                self.name,
                data.len()
            );
            return;
        }
        let vector = (offset as usize) / regs::MSIX_ENTRY_SIZE;
        let field = (offset as usize) % regs::MSIX_ENTRY_SIZE;

        let mut group = lock(&self.group);
        if vector >= group.entries.len() {
            warn!("{}: MSI-X table write outside table (vector {vector})", self.name);
            return;
        }
        group.entries[vector].config.write(field, data);

        // Only writes reaching the vector-control dword change routing
        // state.
        if field + data.len() <= regs::MSIX_ENTRY_CTRL {
            return;
        }

        let masked = group.entries[vector].config.masked();
        group.entries[vector]
            .guest_flags
            .set(VectorFlags::MASKED, masked);

        if let Err(e) = group.update_vector(vector) {
            warn!("{}: failed to update MSI-X vector {vector}: {e}", self.name);
            return;
        }
        if let Err(e) = group.enable() {
            warn!("{}: failed to enable MSI-X: {e}", self.name);
        }
    }
}

/// The emulated MSI-X capability of one device.
pub(crate) struct MsixBlock {
    /// Config-space offset of the capability.
    pub(crate) pos: u8,
    /// Shared vector state.
    pub(crate) group: Arc<Mutex<VectorGroup>>,
    /// Trap handler for the synthesized table.
    pub(crate) table_trap: Arc<MsixTableMmio>,
    /// Trap handler for the PBA.
    pub(crate) pba_trap: Arc<MsixPbaMmio>,
}

impl MsixBlock {
    /// Handles a config-space write that may touch the MSI-X capability.
    ///
    /// Only the byte carrying the enable and function-mask bits changes
    /// capability state; it is taken from the written bytes themselves.
    pub(crate) fn cfg_write(&self, name: &str, off: u16, data: &[u8]) {
        let ctrl_hi = usize::from(self.pos) + regs::MSIX_CTRL + 1;
        let off = usize::from(off);
        if off > ctrl_hi || off + data.len() <= ctrl_hi {
            return;
        }
        let flags = u16::from(data[ctrl_hi - off]) << 8;
        let enabled = flags & regs::MSIX_CTRL_ENABLE != 0;
        let masked = flags & regs::MSIX_CTRL_MASKALL != 0;

        let mut group = lock(&self.group);
        group.guest_flags.set(VectorFlags::MASKED, masked);
        group.guest_flags.set(VectorFlags::ENABLED, enabled);
        if enabled {
            if let Err(e) = group.enable() {
                warn!("{name}: failed to enable MSI-X: {e}");
            }
        } else if let Err(e) = group.disable() {
            warn!("{name}: failed to disable MSI-X: {e}");
        }
    }
}

/// MMIO handler for the Pending Bit Array.
pub(crate) struct MsixPbaMmio {
    pub(crate) name: String,
    pub(crate) device: Arc<dyn PassthroughDevice>,
    pub(crate) host_offset: u64,
    pub(crate) size: u64,
}

impl MmioHandler for MsixPbaMmio {
    fn read(&self, offset: u64, data: &mut [u8]) {
        if offset + data.len() as u64 > self.size {
            warn!("{}: MSI-X PBA read outside array at {offset:#x}", self.name);
            return;
        }
        if let Err(e) = self.device.read_at(self.host_offset + offset, data) {
            warn!("{}: failed to read MSI-X PBA at {offset:#x}: {e}", self.name);
        }
    }

    fn write(&self, offset: u64, _data: &[u8]) {
        warn!("{}: ignoring write to MSI-X PBA at {offset:#x}", self.name);
    }
}
