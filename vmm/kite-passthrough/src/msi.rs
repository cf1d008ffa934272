//! MSI capability emulation.
//!
//! MSI keeps its message registers in config space, so all state changes
//! arrive through config writes. The dispatcher forwards any write that
//! intersects the capability here, after folding it into the synthesized
//! header; this module re-reads the capability registers from that header
//! and drives the per-vector state machine.

use std::sync::{Arc, Mutex};

use log::warn;

use crate::header::{regs, PciHeader};
use crate::lock;
use crate::vectors::{VectorFlags, VectorGroup};

/// The emulated MSI capability of one device.
pub(crate) struct MsiBlock {
    /// Config-space offset of the capability.
    pub(crate) pos: u8,
    /// Shared vector state.
    pub(crate) group: Arc<Mutex<VectorGroup>>,
}

impl MsiBlock {
    /// Handles a config-space write that may touch the MSI capability.
    ///
    /// `hdr` is the synthesized header with the write already applied.
    pub(crate) fn cfg_write(&self, name: &str, hdr: &PciHeader, off: u16, data: &[u8]) {
        let pos = usize::from(self.pos);
        let off = usize::from(off);
        let sz = data.len();
        let ctrl = hdr.read_u16(pos + regs::MSI_CTRL);
        let is_64 = ctrl & regs::MSI_CTRL_64BIT != 0;

        // Per-vector mask register, present only with per-vector masking.
        if ctrl & regs::MSI_CTRL_MASKBIT != 0 {
            let mask_pos = pos
                + if is_64 {
                    regs::MSI_MASK_64
                } else {
                    regs::MSI_MASK_32
                };
            if off < mask_pos + 4 && off + sz > mask_pos {
                let mask = hdr.read_u32(mask_pos);
                let mut group = lock(&self.group);
                for idx in 0..group.nr_entries().min(32) {
                    let masked = mask & (1u32 << idx) != 0;
                    group.entries[idx]
                        .guest_flags
                        .set(VectorFlags::MASKED, masked);
                    if let Err(e) = group.update_vector(idx) {
                        warn!("{name}: failed to update MSI vector {idx}: {e}");
                        break;
                    }
                }
                return;
            }
        }

        // Only the byte carrying the enable bit changes capability state.
        let flags_pos = pos + regs::MSI_CTRL;
        if off > flags_pos || off + sz <= flags_pos {
            return;
        }

        let enabled = ctrl & regs::MSI_CTRL_ENABLE != 0;
        let mut group = lock(&self.group);
        if group.guest_flags.contains(VectorFlags::ENABLED) == enabled {
            return;
        }
        group.guest_flags.set(VectorFlags::ENABLED, enabled);

        if enabled {
            let nr = (1usize << ((ctrl & regs::MSI_CTRL_QSIZE) >> 4)).min(group.nr_entries());
            let addr_lo = hdr.read_u32(pos + regs::MSI_ADDR_LO);
            let (addr_hi, base_data) = if is_64 {
                (
                    hdr.read_u32(pos + regs::MSI_ADDR_HI),
                    hdr.read_u16(pos + regs::MSI_DATA_64),
                )
            } else {
                (0, hdr.read_u16(pos + regs::MSI_DATA_32))
            };
            for idx in 0..nr {
                let entry = &mut group.entries[idx];
                entry.config.addr_lo = addr_lo;
                entry.config.addr_hi = addr_hi;
                // Vectors share the data payload with the low bits
                // replaced by the vector number.
                entry.config.data = u32::from((base_data & !(nr as u16 - 1)) | idx as u16);
                if let Err(e) = group.update_vector(idx) {
                    warn!("{name}: failed to update MSI vector {idx}: {e}");
                    break;
                }
            }
            if let Err(e) = group.enable() {
                warn!("{name}: failed to enable MSI: {e}");
            }
        } else if let Err(e) = group.disable() {
            warn!("{name}: failed to disable MSI: {e}");
        }
    }
}
