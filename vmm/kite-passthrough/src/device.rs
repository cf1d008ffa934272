//! Assigned-device core: setup, config-space dispatch, and teardown.
//!
//! [`AssignedDevice::new`] runs the whole bring-up: it reads and rewrites
//! the physical config space, allocates guest address blocks for the BARs,
//! publishes the device on the bus, and arms the initial interrupt mode.
//! At runtime the device is driven through the [`PciConfigOps`] callbacks
//! the bus invokes, fanning config writes out to the MSI and MSI-X
//! emulation.

use std::sync::{Arc, Mutex, OnceLock};

use kite_vm_api::passthrough::region;
use kite_vm_api::{
    DeviceError, InterruptRouter, PassthroughDevice, PciBus, PciConfigOps, RegionFlags,
};
use log::{debug, info, warn};

use crate::bars::{self, BarState, Region, RegionForward, RegionKind};
use crate::caps;
use crate::error::Error;
use crate::fdlimit;
use crate::header::{regs, PciHeader};
use crate::intx;
use crate::lock;
use crate::msi::MsiBlock;
use crate::msix::{self, MsixBlock, MsixPbaMmio, MsixTableMmio};
use crate::vectors::{MsiKind, RouteCtx, VectorGroup};

/// A physical PCI function assigned to the guest.
pub struct AssignedDevice {
    ctx: Arc<RouteCtx>,
    bus: Arc<dyn PciBus>,
    header: Mutex<PciHeader>,
    bars: Mutex<BarState>,
    config_offset: u64,
    msi: Option<MsiBlock>,
    msix: Option<MsixBlock>,
}

impl AssignedDevice {
    /// Assigns `device` to the guest under the given diagnostic name.
    ///
    /// # Errors
    ///
    /// Setup failures (missing config region, non-endpoint header,
    /// malformed BAR, exhausted guest address space) reject the device;
    /// the VM continues without it.
    pub fn new(
        name: &str,
        device: Arc<dyn PassthroughDevice>,
        router: Arc<dyn InterruptRouter>,
        bus: Arc<dyn PciBus>,
    ) -> Result<Arc<Self>, Error> {
        let cfg_info = device.region_info(region::CONFIG)?;
        if cfg_info.size == 0 {
            return Err(Error::MissingConfigSpace);
        }
        let mut image = [0u8; regs::CONFIG_SPACE_SIZE];
        device.read_at(cfg_info.offset, &mut image)?;
        let mut hdr = PciHeader::from_bytes(image);

        // The guest always sees a single-function device.
        let header_type = hdr.header_type() & !regs::HEADER_TYPE_MULTIFUNCTION;
        hdr.set_header_type(header_type);
        if header_type != regs::HEADER_TYPE_ENDPOINT {
            return Err(Error::NotAnEndpoint(header_type));
        }

        let parsed = caps::parse(&hdr);

        // Legacy interrupt, when the device has a pin and the passthrough
        // driver can service the level-triggered flow.
        let intx_engine = if hdr.irq_pin() != 0 {
            let legacy = bus.alloc_legacy_irq()?;
            hdr.set_irq_line(legacy.line);
            match intx::probe(device.as_ref(), legacy.gsi) {
                Ok(engine) => Some(engine),
                Err(e) => {
                    warn!("{name}: legacy interrupts unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let ctx = Arc::new(RouteCtx {
            name: name.to_string(),
            device: Arc::clone(&device),
            router,
            devid: OnceLock::new(),
            intx: Mutex::new(intx_engine),
        });

        let msi = parsed.msi.map(|(pos, nr)| {
            fdlimit::reserve(nr);
            MsiBlock {
                pos,
                group: Arc::new(Mutex::new(VectorGroup::new(
                    MsiKind::Msi,
                    Arc::clone(&ctx),
                    nr,
                ))),
            }
        });

        let mut bar_state = BarState::new();
        if let Some((pos, nr)) = parsed.msix {
            fdlimit::reserve(nr);
            let (table, pba) = msix::parse_geometry(&hdr, pos, nr);
            bar_state.table = Some(table);
            bar_state.pba = Some(pba);
        }

        bars::configure(&mut bar_state, &hdr, device.as_ref(), bus.as_ref())?;
        bar_state.regions[region::CONFIG as usize] = Some(Region {
            kind: RegionKind::Mmio,
            host_size: cfg_info.size,
            host_offset: cfg_info.offset,
            flags: cfg_info.flags,
            guest_base: 0,
            mapped: false,
        });

        let msix = parsed.msix.map(|(pos, nr)| {
            let group = Arc::new(Mutex::new(VectorGroup::new(
                MsiKind::Msix,
                Arc::clone(&ctx),
                nr,
            )));
            let pba = bar_state.pba.unwrap_or_default();
            MsixBlock {
                pos,
                group: Arc::clone(&group),
                table_trap: Arc::new(MsixTableMmio {
                    name: name.to_string(),
                    group: Arc::clone(&group),
                }),
                pba_trap: Arc::new(MsixPbaMmio {
                    name: name.to_string(),
                    device: Arc::clone(&device),
                    host_offset: pba.host_offset,
                    size: pba.size,
                }),
            }
        });

        // Rewrite the guest view: filtered capability chain, guest BAR
        // values, no ROM or CardBus. The result is written back so the
        // physical function and the passthrough driver see the same
        // layout the guest does.
        caps::rewrite(&mut hdr, bus.supports_pcie());
        bars::write_fake_bars(&mut hdr, &bar_state);
        device.write_at(cfg_info.offset, hdr.as_bytes())?;

        info!(
            "{name}: assigned {:04x}:{:04x}",
            hdr.vendor_id(),
            hdr.device_id()
        );

        let dev = Arc::new(Self {
            ctx,
            bus: Arc::clone(&bus),
            header: Mutex::new(hdr),
            bars: Mutex::new(bar_state),
            config_offset: cfg_info.offset,
            msi,
            msix,
        });

        let devid = bus.register_device(Arc::clone(&dev) as Arc<dyn PciConfigOps>)?;
        let _ = dev.ctx.devid.set(devid);

        // Publish the windows at their initial addresses.
        let initial: Vec<(usize, u64)> = {
            let bar_state = lock(&dev.bars);
            (0..6)
                .filter_map(|i| bar_state.regions[i].as_ref().map(|r| (i, r.guest_base)))
                .collect()
        };
        for (bar, base) in initial {
            dev.bar_activate(bar, base)?;
        }

        // Start out in INTx mode when the device has a pin.
        dev.ctx.rearm_intx();

        Ok(dev)
    }

    /// Device name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Releases the device: quiesces all interrupt modes, tears down guest
    /// windows, and removes the device from the bus. Event objects close
    /// when the device drops.
    pub fn teardown(&self) {
        if let Some(msix) = &self.msix {
            if let Err(e) = lock(&msix.group).disable() {
                warn!("{}: failed to disable MSI-X: {e}", self.ctx.name);
            }
        }
        if let Some(msi) = &self.msi {
            if let Err(e) = lock(&msi.group).disable() {
                warn!("{}: failed to disable MSI: {e}", self.ctx.name);
            }
        }
        self.ctx.disarm_intx();

        for bar in 0..6 {
            if let Err(e) = self.bar_deactivate(bar) {
                warn!("{}: failed to deactivate BAR {bar}: {e}", self.ctx.name);
            }
        }
        if let Some(devid) = self.ctx.devid.get() {
            self.bus.unregister_device(*devid);
        }
    }
}

impl PciConfigOps for AssignedDevice {
    fn cfg_read(&self, offset: u16, data: &mut [u8]) {
        // Dummy read-through: some hardware latches state on config
        // reads. The data the guest sees comes from the synthesized
        // header.
        let mut scratch = vec![0u8; data.len()];
        if let Err(e) = self
            .ctx
            .device
            .read_at(self.config_offset + u64::from(offset), &mut scratch)
        {
            warn!(
                "{}: failed to read {} bytes of config space at {offset:#x}: {e}",
                self.ctx.name,
                data.len()
            );
        }
        lock(&self.header).read(usize::from(offset), data);
    }

    fn cfg_write(&self, offset: u16, data: &[u8]) {
        // The expansion ROM register is never passed through.
        if usize::from(offset) == regs::ROM_ADDRESS {
            return;
        }

        // Hardware first, so the write's side effects land before the
        // guest can observe anything.
        if let Err(e) = self
            .ctx
            .device
            .write_at(self.config_offset + u64::from(offset), data)
        {
            warn!(
                "{}: failed to write {} bytes to config space at {offset:#x}: {e}",
                self.ctx.name,
                data.len()
            );
        }

        // Fold into the synthesized header. The BAR window belongs to the
        // bus layer and is skipped.
        let snapshot = {
            let mut hdr = lock(&self.header);
            let off = usize::from(offset);
            if off >= regs::BAR0 + 24 || off + data.len() <= regs::BAR0 {
                hdr.write(off, data);
            }
            hdr.clone()
        };

        if let Some(msix) = &self.msix {
            msix.cfg_write(&self.ctx.name, offset, data);
        }
        if let Some(msi) = &self.msi {
            msi.cfg_write(&self.ctx.name, &snapshot, offset, data);
        }

        // Read the window back for its side effects; the guest keeps the
        // synthesized view.
        let mut readback = vec![0u8; data.len()];
        if let Err(e) = self
            .ctx
            .device
            .read_at(self.config_offset + u64::from(offset), &mut readback)
        {
            warn!(
                "{}: failed to read back config space at {offset:#x}: {e}",
                self.ctx.name
            );
        }
    }

    fn bar_activate(&self, bar: usize, guest_base: u64) -> Result<(), DeviceError> {
        let mut bar_state = lock(&self.bars);
        let BarState {
            regions,
            table,
            pba,
        } = &mut *bar_state;
        let Some(reg) = regions.get_mut(bar).and_then(Option::as_mut) else {
            warn!("{}: activation of absent BAR {bar}", self.ctx.name);
            return Ok(());
        };

        reg.guest_base = guest_base;
        lock(&self.header).set_bar(bar, reg.fake_bar_value());

        let mut trap_only = false;
        if let (Some(table), Some(block)) = (table.as_mut().filter(|t| t.bar == bar), &self.msix) {
            table.guest_phys = guest_base + table.bar_offset;
            self.bus
                .add_mmio_trap(table.guest_phys, table.size, block.table_trap.clone())?;
            trap_only = true;
        }
        if let (Some(pba), Some(block)) = (pba.as_mut().filter(|p| p.bar == bar), &self.msix) {
            pba.guest_phys = guest_base + pba.bar_offset;
            self.bus
                .add_mmio_trap(pba.guest_phys, pba.size, block.pba_trap.clone())?;
            trap_only = true;
        }

        if !trap_only {
            match reg.kind {
                RegionKind::Io => {
                    let fwd = Arc::new(RegionForward::new(
                        self.ctx.name.clone(),
                        Arc::clone(&self.ctx.device),
                        reg.host_offset,
                        reg.host_size,
                    ));
                    self.bus
                        .add_pio_trap(guest_base as u16, reg.host_size as u16, fwd)?;
                }
                RegionKind::Mmio if reg.flags.contains(RegionFlags::MMAP) => {
                    self.bus.map_direct(
                        guest_base,
                        reg.host_size,
                        &self.ctx.device,
                        reg.host_offset,
                    )?;
                }
                RegionKind::Mmio => {
                    // The driver cannot map this region; trap and forward.
                    let fwd = Arc::new(RegionForward::new(
                        self.ctx.name.clone(),
                        Arc::clone(&self.ctx.device),
                        reg.host_offset,
                        reg.host_size,
                    ));
                    self.bus.add_mmio_trap(guest_base, reg.host_size, fwd)?;
                }
            }
        }

        reg.mapped = true;
        debug!("{}: BAR {bar} active at {guest_base:#x}", self.ctx.name);
        Ok(())
    }

    fn bar_deactivate(&self, bar: usize) -> Result<(), DeviceError> {
        let mut bar_state = lock(&self.bars);
        let BarState {
            regions,
            table,
            pba,
        } = &mut *bar_state;
        let Some(reg) = regions.get_mut(bar).and_then(Option::as_mut) else {
            return Ok(());
        };
        if !reg.mapped {
            return Ok(());
        }

        let mut trap_only = false;
        if let Some(table) = table.as_ref().filter(|t| t.bar == bar) {
            self.bus.del_mmio_trap(table.guest_phys, table.size);
            trap_only = true;
        }
        if let Some(pba) = pba.as_ref().filter(|p| p.bar == bar) {
            self.bus.del_mmio_trap(pba.guest_phys, pba.size);
            trap_only = true;
        }
        if !trap_only {
            match reg.kind {
                RegionKind::Io => self
                    .bus
                    .del_pio_trap(reg.guest_base as u16, reg.host_size as u16),
                RegionKind::Mmio if reg.flags.contains(RegionFlags::MMAP) => {
                    self.bus.unmap_direct(reg.guest_base, reg.host_size);
                }
                RegionKind::Mmio => self.bus.del_mmio_trap(reg.guest_base, reg.host_size),
            }
        }

        reg.mapped = false;
        debug!("{}: BAR {bar} inactive", self.ctx.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ConfigBuilder, FakeBus, FakePassthrough, FakeRouter};
    use kite_vm_api::passthrough::irq;
    use kite_vm_api::IrqSetFlags;

    const MSI_POS: usize = 0x50;
    const MSIX_POS: usize = 0x70;
    const MSI_CTRL_CAPS: u16 = regs::MSI_CTRL_64BIT | regs::MSI_CTRL_MASKBIT | (1 << 1);

    struct Fixture {
        dev: Arc<AssignedDevice>,
        device: Arc<FakePassthrough>,
        router: Arc<FakeRouter>,
        bus: Arc<FakeBus>,
    }

    fn assemble(device: FakePassthrough) -> Fixture {
        let device = Arc::new(device);
        let router = Arc::new(FakeRouter::new());
        let bus = Arc::new(FakeBus::new());
        let dev = AssignedDevice::new(
            "pci-0000:00:01.0",
            device.clone(),
            router.clone(),
            bus.clone(),
        )
        .expect("setup");
        Fixture {
            dev,
            device,
            router,
            bus,
        }
    }

    /// MSI-X device: four vectors, table at BAR0 + 0, PBA at BAR0 + 0x800.
    fn msix_device() -> FakePassthrough {
        let image = ConfigBuilder::new().msix_cap(MSIX_POS, 4, 0, 0x800).finish();
        FakePassthrough::new()
            .with_config(image)
            .with_bar(0, 0x1000, RegionFlags::READ | RegionFlags::WRITE)
    }

    /// MSI device: two vectors, 64-bit, per-vector masking, optional pin.
    fn msi_device(with_pin: bool) -> FakePassthrough {
        let mut builder = ConfigBuilder::new().msi_cap(MSI_POS, MSI_CTRL_CAPS);
        if with_pin {
            builder = builder.irq_pin(1);
        }
        let fake = FakePassthrough::new().with_config(builder.finish());
        if with_pin { fake.with_intx() } else { fake }
    }

    /// Programs the MSI message registers and flips the enable bit, two
    /// vectors.
    fn enable_msi(f: &Fixture) {
        f.dev.cfg_write(
            (MSI_POS + regs::MSI_ADDR_LO) as u16,
            &0xFEE0_0000u32.to_le_bytes(),
        );
        f.dev.cfg_write(
            (MSI_POS + regs::MSI_DATA_64) as u16,
            &0x40u16.to_le_bytes(),
        );
        let ctrl = MSI_CTRL_CAPS | regs::MSI_CTRL_ENABLE | (1 << 4);
        f.dev
            .cfg_write((MSI_POS + regs::MSI_CTRL) as u16, &ctrl.to_le_bytes());
    }

    // -- Setup ----------------------------------------------------------------

    #[test]
    fn setup_rejects_missing_config_region() {
        let device = Arc::new(FakePassthrough::new().without_config());
        let result = AssignedDevice::new(
            "broken",
            device,
            Arc::new(FakeRouter::new()),
            Arc::new(FakeBus::new()),
        );
        assert!(matches!(result, Err(Error::MissingConfigSpace)));
    }

    #[test]
    fn setup_rejects_bridge_header() {
        let image = ConfigBuilder::new().header_type(0x01).finish();
        let device = Arc::new(FakePassthrough::new().with_config(image));
        let result = AssignedDevice::new(
            "bridge",
            device,
            Arc::new(FakeRouter::new()),
            Arc::new(FakeBus::new()),
        );
        assert!(matches!(result, Err(Error::NotAnEndpoint(0x01))));
    }

    #[test]
    fn setup_strips_multifunction_bit() {
        let image = ConfigBuilder::new().header_type(0x80).finish();
        let f = assemble(FakePassthrough::new().with_config(image));
        let mut htype = [0u8; 1];
        f.dev.cfg_read(regs::HEADER_TYPE as u16, &mut htype);
        assert_eq!(htype[0], 0);
    }

    #[test]
    fn setup_writes_back_synthesized_header() {
        let image = ConfigBuilder::new()
            .vendor_cap(0x40)
            .msi_cap(MSI_POS, MSI_CTRL_CAPS)
            .finish();
        let f = assemble(FakePassthrough::new().with_config(image));

        let hw = f
            .device
            .read_back(FakePassthrough::CONFIG_OFFSET, regs::CONFIG_SPACE_SIZE);
        // The chain now starts at MSI; the vendor capability is gone.
        assert_eq!(hw[regs::CAPABILITIES_PTR], MSI_POS as u8);
        assert_eq!(hw[0x40], 0);
        assert_eq!(hw[MSI_POS], regs::CAP_ID_MSI);
    }

    #[test]
    fn setup_exposes_guest_bar_values() {
        let f = assemble(
            FakePassthrough::new()
                .with_config(ConfigBuilder::new().finish())
                .with_bar(
                    0,
                    0x1000,
                    RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MMAP,
                ),
        );
        let mut bar = [0u8; 4];
        f.dev.cfg_read(regs::BAR0 as u16, &mut bar);
        assert_eq!(u64::from(u32::from_le_bytes(bar)), FakeBus::MMIO_BASE);
        // The data BAR is mapped straight through.
        assert_eq!(f.bus.maps.lock().unwrap().len(), 1);
        assert_eq!(f.bus.devices.lock().unwrap().len(), 1);
    }

    #[test]
    fn io_bar_gets_port_forwarding_trap() {
        let image = ConfigBuilder::new()
            .bar_raw(1, regs::BAR_SPACE_IO)
            .finish();
        let f = assemble(
            FakePassthrough::new()
                .with_config(image)
                .with_io_bar(1, 0x40),
        );
        {
            let traps = f.bus.pio_traps.lock().unwrap();
            assert_eq!(traps.len(), 1);
            assert_eq!(traps[0].0, FakeBus::IO_BASE);
        }
        let mut bar = [0u8; 4];
        f.dev.cfg_read((regs::BAR0 + 4) as u16, &mut bar);
        assert_eq!(u32::from_le_bytes(bar) & regs::BAR_SPACE_IO, 1);

        f.dev.bar_deactivate(1).unwrap();
        assert!(f.bus.pio_traps.lock().unwrap().is_empty());
        assert_eq!(f.bus.removed_pio_traps.lock().unwrap().len(), 1);
    }

    #[test]
    fn setup_traps_unmappable_data_bar() {
        let f = assemble(
            FakePassthrough::new()
                .with_config(ConfigBuilder::new().finish())
                .with_bar(0, 0x1000, RegionFlags::READ | RegionFlags::WRITE),
        );
        assert!(f.bus.maps.lock().unwrap().is_empty());
        assert!(f.bus.mmio_handler_at(FakeBus::MMIO_BASE).is_some());
    }

    // -- Dispatcher -----------------------------------------------------------

    #[test]
    fn config_write_read_round_trip() {
        let f = assemble(msi_device(false));
        let payload = 0xFEE0_CAFEu32.to_le_bytes();
        f.dev
            .cfg_write((MSI_POS + regs::MSI_ADDR_LO) as u16, &payload);
        let mut back = [0u8; 4];
        f.dev
            .cfg_read((MSI_POS + regs::MSI_ADDR_LO) as u16, &mut back);
        assert_eq!(back, payload);
    }

    #[test]
    fn cfg_accesses_pass_through_for_side_effects() {
        let f = assemble(FakePassthrough::new().with_config(ConfigBuilder::new().finish()));
        f.device.reads.lock().unwrap().clear();
        f.device.writes.lock().unwrap().clear();

        let mut data = [0u8; 2];
        f.dev.cfg_read(regs::COMMAND as u16, &mut data);
        let cmd_off = FakePassthrough::CONFIG_OFFSET + regs::COMMAND as u64;
        assert!(f
            .device
            .reads
            .lock()
            .unwrap()
            .iter()
            .any(|&(off, len)| off == cmd_off && len == 2));

        f.dev.cfg_write(regs::COMMAND as u16, &[0x06, 0x00]);
        assert!(f
            .device
            .writes
            .lock()
            .unwrap()
            .iter()
            .any(|&(off, len)| off == cmd_off && len == 2));
        // Write is followed by a read-back of the same window.
        assert!(f
            .device
            .reads
            .lock()
            .unwrap()
            .iter()
            .filter(|&&(off, _)| off == cmd_off)
            .count()
            >= 2);
    }

    #[test]
    fn rom_register_is_filtered() {
        let f = assemble(FakePassthrough::new().with_config(ConfigBuilder::new().finish()));
        f.device.writes.lock().unwrap().clear();
        f.dev
            .cfg_write(regs::ROM_ADDRESS as u16, &0xFFFF_F800u32.to_le_bytes());
        assert!(f.device.writes.lock().unwrap().is_empty());
        let mut rom = [0u8; 4];
        f.dev.cfg_read(regs::ROM_ADDRESS as u16, &mut rom);
        assert_eq!(rom, [0; 4]);
    }

    // -- End-to-end scenarios -------------------------------------------------

    #[test]
    fn s1_intx_setup() {
        let image = ConfigBuilder::new().irq_pin(1).finish();
        let f = assemble(FakePassthrough::new().with_config(image).with_intx());

        // Two event fds wired as one resampling route.
        let irqfds = f.router.irqfds.lock().unwrap();
        assert_eq!(irqfds.len(), 1);
        assert_eq!(irqfds[0].0, FakeBus::LEGACY.gsi);
        assert!(irqfds[0].2.is_some());
        drop(irqfds);

        // Two driver calls: trigger and unmask assignment.
        let sets = f.device.irq_sets.lock().unwrap();
        assert_eq!(sets.len(), 2);
        assert!(sets.iter().all(|s| s.index == irq::INTX));
        assert!(sets[0].flags.contains(IrqSetFlags::ACTION_TRIGGER));
        assert!(sets[1].flags.contains(IrqSetFlags::ACTION_UNMASK));
    }

    #[test]
    fn s2_msix_enable_fill_unmask() {
        let f = assemble(msix_device());
        let table = f.bus.mmio_handler_at(FakeBus::MMIO_BASE).expect("table trap");

        // Enable with the function mask set: the one-time arming call,
        // placeholders only.
        let ctrl = regs::MSIX_CTRL_ENABLE | regs::MSIX_CTRL_MASKALL;
        f.dev
            .cfg_write((MSIX_POS + regs::MSIX_CTRL) as u16, &ctrl.to_le_bytes());
        {
            let sets = f.device.irq_sets.lock().unwrap();
            assert_eq!(sets.len(), 1);
            assert_eq!(sets[0].count, 4);
            assert!(sets[0].fds.iter().all(Option::is_none));
        }

        // Fill the table under the mask: routes and irqfds appear, but the
        // driver is not touched.
        for v in 0..4u64 {
            table.write(v * 16, &0xFEE0_0000u32.to_le_bytes());
            table.write(v * 16 + 8, &(0x21 + v as u32).to_le_bytes());
            table.write(v * 16 + 12, &0u32.to_le_bytes());
        }
        assert_eq!(f.device.irq_sets.lock().unwrap().len(), 1);
        assert_eq!(f.router.routes.lock().unwrap().len(), 4);
        assert_eq!(f.router.irqfds.lock().unwrap().len(), 4);

        // Clear the function mask: exactly one multi-vector call carrying
        // all four fds.
        let ctrl = regs::MSIX_CTRL_ENABLE;
        f.dev
            .cfg_write((MSIX_POS + regs::MSIX_CTRL) as u16, &ctrl.to_le_bytes());
        let sets = f.device.irq_sets.lock().unwrap();
        assert_eq!(sets.len(), 2);
        let last = sets.last().unwrap();
        assert_eq!((last.start, last.count), (0, 4));
        assert!(last.fds.iter().all(Option::is_some));
    }

    #[test]
    fn s3_msi_per_vector_mask_toggle() {
        let f = assemble(msi_device(false));
        enable_msi(&f);
        assert_eq!(f.device.irq_sets.lock().unwrap().len(), 1);

        // Flip mask bit 0 from 0 to 1: one route removal, no driver call.
        f.dev
            .cfg_write((MSI_POS + regs::MSI_MASK_64) as u16, &1u32.to_le_bytes());
        assert_eq!(f.router.dels.lock().unwrap().len(), 1);
        assert_eq!(f.device.irq_sets.lock().unwrap().len(), 1);
    }

    #[test]
    fn s4_bar_reprogram_moves_mapping() {
        let f = assemble(
            FakePassthrough::new()
                .with_config(ConfigBuilder::new().finish())
                .with_bar(
                    0,
                    0x1000,
                    RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MMAP,
                ),
        );
        assert_eq!(f.bus.maps.lock().unwrap()[0].0, FakeBus::MMIO_BASE);

        f.dev.bar_deactivate(0).unwrap();
        f.dev.bar_activate(0, 0xD000_0000).unwrap();

        let maps = f.bus.maps.lock().unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].0, 0xD000_0000);
        drop(maps);
        assert_eq!(f.bus.unmaps.lock().unwrap()[0].0, FakeBus::MMIO_BASE);

        // The synthesized header follows the move.
        let mut bar = [0u8; 4];
        f.dev.cfg_read(regs::BAR0 as u16, &mut bar);
        assert_eq!(u32::from_le_bytes(bar), 0xD000_0000);
    }

    #[test]
    fn s4_msix_table_trap_reregisters() {
        let f = assemble(msix_device());
        assert!(f.bus.mmio_handler_at(FakeBus::MMIO_BASE).is_some());

        f.dev.bar_deactivate(0).unwrap();
        assert!(f.bus.mmio_handler_at(FakeBus::MMIO_BASE).is_none());
        // Both the table and PBA traps came down.
        assert_eq!(f.bus.removed_mmio_traps.lock().unwrap().len(), 2);

        f.dev.bar_activate(0, 0xD000_0000).unwrap();
        assert!(f.bus.mmio_handler_at(0xD000_0000).is_some());
        // The PBA trap moves with its BAR, offset preserved.
        assert!(f.bus.mmio_handler_at(0xD000_0000 + 0x800).is_some());
        // Trap-only BAR: never mapped.
        assert!(f.bus.maps.lock().unwrap().is_empty());
    }

    #[test]
    fn s5_msi_disable_falls_back_to_intx() {
        let f = assemble(msi_device(true));
        assert_eq!(f.router.irqfds.lock().unwrap().len(), 1);

        enable_msi(&f);
        // Mutual exclusion: arming MSI disarmed INTx.
        assert_eq!(f.router.dels.lock().unwrap().len(), 1);
        assert!(f
            .device
            .irq_sets
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.index == irq::INTX && s.flags.contains(IrqSetFlags::DATA_NONE)));

        // Disable MSI: the driver call goes away and INTx re-arms with
        // fresh event fds.
        f.dev
            .cfg_write((MSI_POS + regs::MSI_CTRL) as u16, &MSI_CTRL_CAPS.to_le_bytes());
        assert!(f
            .device
            .irq_sets
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.index == irq::MSI && s.flags.contains(IrqSetFlags::DATA_NONE)));
        let intx_arms = f
            .router
            .irqfds
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, resample)| resample.is_some())
            .count();
        assert_eq!(intx_arms, 2);
    }

    #[test]
    fn s6_short_table_access_is_rejected() {
        let f = assemble(msix_device());
        let table = f.bus.mmio_handler_at(FakeBus::MMIO_BASE).expect("table trap");

        let mut short = [0u8; 2];
        table.read(0, &mut short);
        table.write(12, &[0u8; 2]);

        assert!(f.router.routes.lock().unwrap().is_empty());
        assert!(f.router.irqfds.lock().unwrap().is_empty());
    }

    #[test]
    fn pba_reads_serve_from_host_offset() {
        let f = assemble(msix_device());
        // PBA lives at BAR0 region offset + 0x800 within the device handle.
        f.device.seed(0x800, &[0x0F]);
        let pba = f
            .bus
            .mmio_handler_at(FakeBus::MMIO_BASE + 0x800)
            .expect("pba trap");
        let mut data = [0u8; 4];
        pba.read(0, &mut data);
        assert_eq!(data[0], 0x0F);
    }

    #[test]
    fn teardown_quiesces_interrupts_and_windows() {
        let f = assemble(msi_device(true));
        enable_msi(&f);
        f.dev.teardown();

        let sets = f.device.irq_sets.lock().unwrap();
        assert!(sets
            .iter()
            .any(|s| s.index == irq::MSI && s.flags.contains(IrqSetFlags::DATA_NONE)));
        // INTx ends disarmed: the last INTx call is the no-payload clear.
        let last_intx = sets.iter().filter(|s| s.index == irq::INTX).next_back();
        assert!(last_intx.unwrap().flags.contains(IrqSetFlags::DATA_NONE));
    }
}
