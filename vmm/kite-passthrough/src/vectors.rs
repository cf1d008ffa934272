//! Per-vector interrupt state machine, shared by MSI and MSI-X.
//!
//! Each vector tracks two independent views: what the guest programmed
//! (`guest_flags`) and what the host has materialized (`host_flags`).
//! Masking is emulated at the routing layer by installing or removing the
//! vector's irqfd route; the passthrough driver only ever sees trigger
//! assignments. Toggling a route is much cheaper than reprogramming the
//! driver, and keeps masking independent of capability state.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, OnceLock};

use bitflags::bitflags;
use kite_vm_api::passthrough::irq;
use kite_vm_api::{InterruptRouter, IrqSet, IrqSetFlags, MsiMessage, PassthroughDevice};
use log::warn;
use vmm_sys_util::eventfd::EventFd;

use crate::error::Error;
use crate::header::regs;
use crate::intx::IntxEngine;
use crate::lock;

bitflags! {
    /// State bits of one side (guest or host) of a vector or capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct VectorFlags: u8 {
        /// The capability (or vector) is enabled.
        const ENABLED = 1 << 0;
        /// The vector (or whole capability) is masked.
        const MASKED = 1 << 1;
        /// No event fd has been handed to the passthrough driver yet.
        const EMPTY = 1 << 2;
    }
}

/// Which message-signaled capability a vector group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsiKind {
    /// The MSI capability.
    Msi,
    /// The MSI-X capability.
    Msix,
}

impl MsiKind {
    /// Passthrough-driver interrupt index for this capability.
    pub(crate) fn irq_index(self) -> u32 {
        match self {
            Self::Msi => irq::MSI,
            Self::Msix => irq::MSIX,
        }
    }
}

/// The 16-byte MSI-X table entry image (also used to hold the equivalent
/// fields derived from the MSI capability registers).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MsixTableEntry {
    /// Message address, lower half.
    pub addr_lo: u32,
    /// Message address, upper half.
    pub addr_hi: u32,
    /// Message data.
    pub data: u32,
    /// Vector control; bit 0 is the mask bit.
    pub ctrl: u32,
}

impl MsixTableEntry {
    fn to_bytes(self) -> [u8; regs::MSIX_ENTRY_SIZE] {
        let mut bytes = [0u8; regs::MSIX_ENTRY_SIZE];
        bytes[0..4].copy_from_slice(&self.addr_lo.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.addr_hi.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.ctrl.to_le_bytes());
        bytes
    }

    fn update_from(&mut self, bytes: &[u8; regs::MSIX_ENTRY_SIZE]) {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        self.addr_lo = word(0);
        self.addr_hi = word(4);
        self.data = word(8);
        self.ctrl = word(12);
    }

    /// Copies `data.len()` bytes of the entry image starting at `field`.
    pub(crate) fn read(&self, field: usize, data: &mut [u8]) {
        let bytes = self.to_bytes();
        data.copy_from_slice(&bytes[field..field + data.len()]);
    }

    /// Overlays `data` onto the entry image starting at `field`.
    pub(crate) fn write(&mut self, field: usize, data: &[u8]) {
        let mut bytes = self.to_bytes();
        bytes[field..field + data.len()].copy_from_slice(data);
        self.update_from(&bytes);
    }

    /// The message this entry encodes.
    pub(crate) fn msg(&self) -> MsiMessage {
        MsiMessage {
            addr_lo: self.addr_lo,
            addr_hi: self.addr_hi,
            data: self.data,
        }
    }

    /// Whether the entry's per-vector mask bit is set.
    pub(crate) fn masked(&self) -> bool {
        self.ctrl & regs::MSIX_ENTRY_CTRL_MASKBIT != 0
    }
}

/// One interrupt vector.
#[derive(Debug, Default)]
pub(crate) struct MsiVector {
    /// Entry image as the guest last wrote it.
    pub config: MsixTableEntry,
    /// Route identifier issued by the interrupt-controller backend.
    pub gsi: Option<u32>,
    /// Event object signaled to raise the interrupt.
    pub eventfd: Option<EventFd>,
    /// Guest-side state.
    pub guest_flags: VectorFlags,
    /// Host-side state. `MASKED` holds exactly when no irqfd route is
    /// installed for this vector.
    pub host_flags: VectorFlags,
    /// Message the backend route currently carries.
    routed_msg: Option<MsiMessage>,
}

/// Identity and collaborators shared by every interrupt engine of a device.
///
/// Handed into handlers at construction time so no component ever has to
/// reach back into the owning device.
pub(crate) struct RouteCtx {
    /// Device name for diagnostics.
    pub name: String,
    /// Passthrough-driver handle.
    pub device: Arc<dyn PassthroughDevice>,
    /// Interrupt-controller backend.
    pub router: Arc<dyn InterruptRouter>,
    /// Bus-assigned device identifier, set at registration.
    pub devid: OnceLock<u32>,
    /// Legacy-interrupt engine; `None` when the device has no usable pin.
    pub intx: Mutex<Option<IntxEngine>>,
}

impl RouteCtx {
    fn devid(&self) -> u32 {
        self.devid.get().copied().unwrap_or(0)
    }

    /// Tears down INTx; called before arming MSI or MSI-X (the three
    /// delivery modes are mutually exclusive at the PCI level).
    pub(crate) fn disarm_intx(&self) {
        let mut guard = lock(&self.intx);
        if let Some(intx) = guard.as_mut() {
            if let Err(e) = intx.disable(self) {
                warn!("{}: failed to disable INTx: {e}", self.name);
            }
        }
    }

    /// Re-arms INTx after MSI/MSI-X goes away, when the device has a pin.
    pub(crate) fn rearm_intx(&self) {
        let mut guard = lock(&self.intx);
        if let Some(intx) = guard.as_mut() {
            if let Err(e) = intx.enable(self) {
                warn!("{}: failed to enable INTx: {e}", self.name);
            }
        }
    }
}

/// Common state of one message-signaled capability: the vector array plus
/// the capability-level guest/host flags.
pub(crate) struct VectorGroup {
    kind: MsiKind,
    ctx: Arc<RouteCtx>,
    /// Capability-level guest state (`ENABLED`, `MASKED` = function mask).
    pub guest_flags: VectorFlags,
    /// Capability-level host state (`ENABLED`, `EMPTY`).
    pub host_flags: VectorFlags,
    /// Per-vector state.
    pub entries: Vec<MsiVector>,
    /// Event fds as last handed to the passthrough driver, one slot per
    /// vector.
    programmed: Vec<Option<RawFd>>,
}

impl VectorGroup {
    pub(crate) fn new(kind: MsiKind, ctx: Arc<RouteCtx>, nr_entries: usize) -> Self {
        let entries = (0..nr_entries)
            .map(|_| MsiVector {
                // No route is installed yet, so the host side starts
                // masked.
                host_flags: VectorFlags::MASKED,
                ..MsiVector::default()
            })
            .collect();
        Self {
            kind,
            ctx,
            guest_flags: VectorFlags::empty(),
            host_flags: VectorFlags::empty(),
            entries,
            programmed: vec![None; nr_entries],
        }
    }

    pub(crate) fn nr_entries(&self) -> usize {
        self.entries.len()
    }

    /// Single choke point for per-vector state changes.
    ///
    /// Ensures the vector has an event fd and a backend route carrying its
    /// current message, then reconciles the host mask with the guest mask
    /// by installing or removing the irqfd route.
    pub(crate) fn update_vector(&mut self, idx: usize) -> Result<(), Error> {
        let ctx = self.ctx.clone();
        let entry = &mut self.entries[idx];

        if entry.eventfd.is_none() {
            entry.eventfd = Some(EventFd::new(0).map_err(Error::EventFd)?);
        }

        let msg = entry.config.msg();
        match entry.gsi {
            None => {
                entry.gsi = Some(ctx.router.add_msi_route(msg, ctx.devid())?);
                entry.routed_msg = Some(msg);
            }
            Some(gsi) => {
                if entry.routed_msg != Some(msg) {
                    ctx.router.update_msi_route(gsi, msg)?;
                    entry.routed_msg = Some(msg);
                }
            }
        }

        let guest_masked = entry.guest_flags.contains(VectorFlags::MASKED);
        let host_masked = entry.host_flags.contains(VectorFlags::MASKED);
        if guest_masked == host_masked {
            return Ok(());
        }

        let (Some(gsi), Some(fd)) = (entry.gsi, entry.eventfd.as_ref()) else {
            return Ok(());
        };
        if host_masked {
            ctx.router.add_irqfd(gsi, fd, None)?;
            entry.host_flags.remove(VectorFlags::MASKED);
        } else {
            ctx.router.del_irqfd(gsi, fd)?;
            entry.host_flags.insert(VectorFlags::MASKED);
        }
        Ok(())
    }

    /// Event fd to hand the passthrough driver for vector `idx`, if the
    /// vector has been routed.
    fn desired_fd(&self, idx: usize) -> Option<RawFd> {
        let entry = &self.entries[idx];
        match (entry.gsi, entry.eventfd.as_ref()) {
            (Some(_), Some(fd)) => Some(fd.as_raw_fd()),
            _ => None,
        }
    }

    /// Materializes the guest's capability enable on the host side.
    ///
    /// Two paths: the initial registration programs the whole vector range
    /// in a single call (arming the physical capability even when every
    /// slot is still the placeholder), and the steady-state path emits
    /// single-vector updates for slots whose fd changed. A guest that
    /// enables the capability masked, fills the table, then unmasks gets
    /// exactly one full-range call at unmask time.
    pub(crate) fn enable(&mut self) -> Result<(), Error> {
        if !self.guest_flags.contains(VectorFlags::ENABLED) {
            return Ok(());
        }

        self.ctx.disarm_intx();

        let host_enabled = self.host_flags.contains(VectorFlags::ENABLED);
        let host_empty = self.host_flags.contains(VectorFlags::EMPTY);
        let guest_masked = self.guest_flags.contains(VectorFlags::MASKED);

        if !host_enabled || (host_empty && !guest_masked) {
            let mut empty = true;
            for idx in 0..self.entries.len() {
                let fd = self.desired_fd(idx);
                if fd.is_some() {
                    empty = false;
                }
                self.programmed[idx] = fd;
            }
            self.ctx.device.set_irqs(IrqSet {
                index: self.kind.irq_index(),
                start: 0,
                count: self.entries.len() as u32,
                flags: IrqSetFlags::DATA_EVENTFD | IrqSetFlags::ACTION_TRIGGER,
                fds: self.programmed.clone(),
            })?;
            self.host_flags.insert(VectorFlags::ENABLED);
            self.host_flags.set(VectorFlags::EMPTY, empty);
        } else if !guest_masked {
            for idx in 0..self.entries.len() {
                let fd = self.desired_fd(idx);
                if fd == self.programmed[idx] {
                    continue;
                }
                self.ctx.device.set_irqs(IrqSet {
                    index: self.kind.irq_index(),
                    start: idx as u32,
                    count: 1,
                    flags: IrqSetFlags::DATA_EVENTFD | IrqSetFlags::ACTION_TRIGGER,
                    fds: vec![fd],
                })?;
                self.programmed[idx] = fd;
                if fd.is_some() {
                    self.host_flags.remove(VectorFlags::EMPTY);
                }
            }
        } else {
            // The guest masked the whole capability while the host holds
            // live routes. TODO: mass-mask by removing each vector's irqfd
            // route here instead of leaving the host side untouched.
        }
        Ok(())
    }

    /// Withdraws the capability from the passthrough driver and re-arms
    /// INTx when the device has a pin.
    pub(crate) fn disable(&mut self) -> Result<(), Error> {
        if !self.host_flags.contains(VectorFlags::ENABLED) {
            return Ok(());
        }
        self.ctx.device.set_irqs(IrqSet {
            index: self.kind.irq_index(),
            start: 0,
            count: 0,
            flags: IrqSetFlags::DATA_NONE | IrqSetFlags::ACTION_TRIGGER,
            fds: Vec::new(),
        })?;
        self.host_flags.remove(VectorFlags::ENABLED);
        self.host_flags.insert(VectorFlags::EMPTY);

        self.ctx.rearm_intx();
        Ok(())
    }
}
