//! Recording fakes for the collaborator traits.

use std::collections::BTreeMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use kite_vm_api::passthrough::{irq, region};
use kite_vm_api::{
    DeviceError, InterruptRouter, IrqFlags, IrqInfo, IrqSet, LegacyIrq, MmioHandler, MsiMessage,
    PassthroughDevice, PciBus, PciConfigOps, PioHandler, RegionFlags, RegionInfo,
};
use vmm_sys_util::eventfd::EventFd;

use crate::header::regs;

/// Builds the physical config image a [`FakePassthrough`] serves.
pub(crate) struct ConfigBuilder {
    bytes: [u8; regs::CONFIG_SPACE_SIZE],
    last_next: Option<usize>,
}

impl ConfigBuilder {
    pub(crate) fn new() -> Self {
        let mut bytes = [0u8; regs::CONFIG_SPACE_SIZE];
        bytes[regs::VENDOR_ID] = 0x86;
        bytes[regs::VENDOR_ID + 1] = 0x80;
        bytes[regs::DEVICE_ID] = 0x3E;
        bytes[regs::DEVICE_ID + 1] = 0x15;
        Self {
            bytes,
            last_next: None,
        }
    }

    pub(crate) fn header_type(mut self, val: u8) -> Self {
        self.bytes[regs::HEADER_TYPE] = val;
        self
    }

    pub(crate) fn irq_pin(mut self, pin: u8) -> Self {
        self.bytes[regs::INTERRUPT_PIN] = pin;
        self
    }

    pub(crate) fn bar_raw(mut self, bar: usize, val: u32) -> Self {
        self.bytes[regs::BAR0 + bar * 4..regs::BAR0 + bar * 4 + 4]
            .copy_from_slice(&val.to_le_bytes());
        self
    }

    fn add_cap(&mut self, pos: usize, body: &[u8]) {
        self.bytes[pos..pos + body.len()].copy_from_slice(body);
        self.bytes[pos + 1] = 0;
        match self.last_next {
            Some(link) => self.bytes[link] = pos as u8,
            None => {
                self.bytes[regs::CAPABILITIES_PTR] = pos as u8;
                self.bytes[regs::STATUS] |= regs::STATUS_CAP_LIST as u8;
            }
        }
        self.last_next = Some(pos + 1);
    }

    pub(crate) fn msi_cap(mut self, pos: usize, ctrl: u16) -> Self {
        let mut body = [0u8; 4];
        body[0] = regs::CAP_ID_MSI;
        body[2..4].copy_from_slice(&ctrl.to_le_bytes());
        self.add_cap(pos, &body);
        self
    }

    pub(crate) fn msix_cap(mut self, pos: usize, nr_entries: u16, table: u32, pba: u32) -> Self {
        let mut body = [0u8; 12];
        body[0] = regs::CAP_ID_MSIX;
        body[2..4].copy_from_slice(&(nr_entries - 1).to_le_bytes());
        body[4..8].copy_from_slice(&table.to_le_bytes());
        body[8..12].copy_from_slice(&pba.to_le_bytes());
        self.add_cap(pos, &body);
        self
    }

    pub(crate) fn vendor_cap(mut self, pos: usize) -> Self {
        self.add_cap(pos, &[0x09, 0, 0xAA, 0xBB]);
        self
    }

    pub(crate) fn finish(self) -> [u8; regs::CONFIG_SPACE_SIZE] {
        self.bytes
    }
}

/// In-memory passthrough device recording every driver call.
pub(crate) struct FakePassthrough {
    regions: [RegionInfo; region::COUNT],
    irqs: [IrqInfo; 3],
    mem: Mutex<BTreeMap<u64, u8>>,
    /// Every interrupt-programming call, in order.
    pub irq_sets: Mutex<Vec<IrqSet>>,
    /// Positioned-read log: `(offset, len)`.
    pub reads: Mutex<Vec<(u64, usize)>>,
    /// Positioned-write log: `(offset, len)`.
    pub writes: Mutex<Vec<(u64, usize)>>,
}

impl FakePassthrough {
    /// Device-handle offset of the config-space region.
    pub(crate) const CONFIG_OFFSET: u64 = (region::CONFIG as u64) << 40;

    pub(crate) fn new() -> Self {
        let mut regions: [RegionInfo; region::COUNT] = Default::default();
        regions[region::CONFIG as usize] = RegionInfo {
            size: regs::CONFIG_SPACE_SIZE as u64,
            offset: Self::CONFIG_OFFSET,
            flags: RegionFlags::READ | RegionFlags::WRITE,
        };
        Self {
            regions,
            irqs: Default::default(),
            mem: Mutex::new(BTreeMap::new()),
            irq_sets: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_config(self, image: [u8; regs::CONFIG_SPACE_SIZE]) -> Self {
        self.seed(Self::CONFIG_OFFSET, &image);
        self
    }

    pub(crate) fn without_config(mut self) -> Self {
        self.regions[region::CONFIG as usize] = RegionInfo::default();
        self
    }

    pub(crate) fn with_bar(mut self, bar: usize, size: u64, flags: RegionFlags) -> Self {
        self.regions[bar] = RegionInfo {
            size,
            offset: (bar as u64) << 40,
            flags,
        };
        self
    }

    pub(crate) fn with_io_bar(mut self, bar: usize, size: u64) -> Self {
        self.regions[bar] = RegionInfo {
            size,
            offset: (bar as u64) << 40,
            flags: RegionFlags::READ | RegionFlags::WRITE,
        };
        self
    }

    pub(crate) fn with_intx(mut self) -> Self {
        self.irqs[irq::INTX as usize] = IrqInfo {
            count: 1,
            flags: IrqFlags::EVENTFD | IrqFlags::AUTOMASKED,
        };
        self
    }

    /// Preloads backing bytes at a device-handle offset.
    pub(crate) fn seed(&self, offset: u64, bytes: &[u8]) {
        let mut mem = self.mem.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            mem.insert(offset + i as u64, *b);
        }
    }

    /// Reads back backing bytes (zero where never written).
    pub(crate) fn read_back(&self, offset: u64, len: usize) -> Vec<u8> {
        let mem = self.mem.lock().unwrap();
        (0..len)
            .map(|i| mem.get(&(offset + i as u64)).copied().unwrap_or(0))
            .collect()
    }
}

impl PassthroughDevice for FakePassthrough {
    fn region_info(&self, index: u32) -> Result<RegionInfo, DeviceError> {
        self.regions
            .get(index as usize)
            .copied()
            .ok_or(DeviceError::RegionUnavailable(index))
    }

    fn irq_info(&self, index: u32) -> Result<IrqInfo, DeviceError> {
        self.irqs
            .get(index as usize)
            .copied()
            .ok_or(DeviceError::IrqUnavailable(index))
    }

    fn set_irqs(&self, set: IrqSet) -> Result<(), DeviceError> {
        self.irq_sets.lock().unwrap().push(set);
        Ok(())
    }

    fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<(), DeviceError> {
        self.reads.lock().unwrap().push((offset, data.len()));
        let mem = self.mem.lock().unwrap();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = mem.get(&(offset + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.writes.lock().unwrap().push((offset, data.len()));
        let mut mem = self.mem.lock().unwrap();
        for (i, byte) in data.iter().enumerate() {
            mem.insert(offset + i as u64, *byte);
        }
        Ok(())
    }
}

/// Interrupt-router fake handing out sequential GSIs.
pub(crate) struct FakeRouter {
    next_gsi: Mutex<u32>,
    /// `add_msi_route` log: `(gsi, msg, devid)`.
    pub routes: Mutex<Vec<(u32, MsiMessage, u32)>>,
    /// `update_msi_route` log.
    pub updates: Mutex<Vec<(u32, MsiMessage)>>,
    /// `add_irqfd` log: `(gsi, trigger, resample)`.
    pub irqfds: Mutex<Vec<(u32, RawFd, Option<RawFd>)>>,
    /// `del_irqfd` log.
    pub dels: Mutex<Vec<(u32, RawFd)>>,
}

impl FakeRouter {
    pub(crate) fn new() -> Self {
        Self {
            next_gsi: Mutex::new(0),
            routes: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            irqfds: Mutex::new(Vec::new()),
            dels: Mutex::new(Vec::new()),
        }
    }
}

impl InterruptRouter for FakeRouter {
    fn add_msi_route(&self, msg: MsiMessage, devid: u32) -> Result<u32, DeviceError> {
        let mut next = self.next_gsi.lock().unwrap();
        let gsi = *next;
        *next += 1;
        self.routes.lock().unwrap().push((gsi, msg, devid));
        Ok(gsi)
    }

    fn update_msi_route(&self, gsi: u32, msg: MsiMessage) -> Result<(), DeviceError> {
        self.updates.lock().unwrap().push((gsi, msg));
        Ok(())
    }

    fn add_irqfd(
        &self,
        gsi: u32,
        trigger: &EventFd,
        resample: Option<&EventFd>,
    ) -> Result<(), DeviceError> {
        self.irqfds
            .lock()
            .unwrap()
            .push((gsi, trigger.as_raw_fd(), resample.map(AsRawFd::as_raw_fd)));
        Ok(())
    }

    fn del_irqfd(&self, gsi: u32, trigger: &EventFd) -> Result<(), DeviceError> {
        self.dels.lock().unwrap().push((gsi, trigger.as_raw_fd()));
        Ok(())
    }
}

/// Bus fake with deterministic allocators and live trap/map tables.
pub(crate) struct FakeBus {
    next_io: Mutex<u16>,
    next_mmio: Mutex<u64>,
    pcie: bool,
    /// Registered devices, by devid.
    pub devices: Mutex<Vec<Arc<dyn PciConfigOps>>>,
    /// Active direct maps: `(guest_base, size, host_offset)`.
    pub maps: Mutex<Vec<(u64, u64, u64)>>,
    /// `unmap_direct` log.
    pub unmaps: Mutex<Vec<(u64, u64)>>,
    /// Active MMIO traps.
    pub mmio_traps: Mutex<Vec<(u64, u64, Arc<dyn MmioHandler>)>>,
    /// `del_mmio_trap` log.
    pub removed_mmio_traps: Mutex<Vec<(u64, u64)>>,
    /// Active PIO traps.
    pub pio_traps: Mutex<Vec<(u16, u16, Arc<dyn PioHandler>)>>,
    /// `del_pio_trap` log.
    pub removed_pio_traps: Mutex<Vec<(u16, u16)>>,
}

impl FakeBus {
    /// First guest MMIO block handed out.
    pub(crate) const MMIO_BASE: u64 = 0xC000_0000;
    /// First guest IO-port block handed out.
    pub(crate) const IO_BASE: u16 = 0x1000;
    /// The legacy interrupt line every device gets.
    pub(crate) const LEGACY: LegacyIrq = LegacyIrq { line: 5, gsi: 5 };

    pub(crate) fn new() -> Self {
        Self {
            next_io: Mutex::new(Self::IO_BASE),
            next_mmio: Mutex::new(Self::MMIO_BASE),
            pcie: false,
            devices: Mutex::new(Vec::new()),
            maps: Mutex::new(Vec::new()),
            unmaps: Mutex::new(Vec::new()),
            mmio_traps: Mutex::new(Vec::new()),
            removed_mmio_traps: Mutex::new(Vec::new()),
            pio_traps: Mutex::new(Vec::new()),
            removed_pio_traps: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_pcie(mut self) -> Self {
        self.pcie = true;
        self
    }

    /// The handler behind the MMIO trap at `guest_base`, if any.
    pub(crate) fn mmio_handler_at(&self, guest_base: u64) -> Option<Arc<dyn MmioHandler>> {
        self.mmio_traps
            .lock()
            .unwrap()
            .iter()
            .find(|(base, _, _)| *base == guest_base)
            .map(|(_, _, handler)| Arc::clone(handler))
    }
}

fn align_up<T>(val: T, align: T) -> T
where
    T: Copy
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>
        + std::ops::Not<Output = T>
        + std::ops::BitAnd<Output = T>
        + From<u8>,
{
    (val + align - T::from(1u8)) & !(align - T::from(1u8))
}

impl PciBus for FakeBus {
    fn alloc_io_block(&self, size: u32) -> Result<u16, DeviceError> {
        let mut next = self.next_io.lock().unwrap();
        let base = align_up(*next, size as u16);
        *next = base + size as u16;
        Ok(base)
    }

    fn alloc_mmio_block(&self, size: u64) -> Result<u64, DeviceError> {
        let mut next = self.next_mmio.lock().unwrap();
        let base = align_up(*next, size);
        *next = base + size;
        Ok(base)
    }

    fn alloc_legacy_irq(&self) -> Result<LegacyIrq, DeviceError> {
        Ok(Self::LEGACY)
    }

    fn register_device(&self, ops: Arc<dyn PciConfigOps>) -> Result<u32, DeviceError> {
        let mut devices = self.devices.lock().unwrap();
        devices.push(ops);
        Ok(devices.len() as u32 - 1)
    }

    fn unregister_device(&self, _devid: u32) {}

    fn map_direct(
        &self,
        guest_base: u64,
        size: u64,
        _device: &Arc<dyn PassthroughDevice>,
        host_offset: u64,
    ) -> Result<(), DeviceError> {
        self.maps
            .lock()
            .unwrap()
            .push((guest_base, size, host_offset));
        Ok(())
    }

    fn unmap_direct(&self, guest_base: u64, size: u64) {
        self.maps
            .lock()
            .unwrap()
            .retain(|(base, sz, _)| !(*base == guest_base && *sz == size));
        self.unmaps.lock().unwrap().push((guest_base, size));
    }

    fn add_mmio_trap(
        &self,
        guest_base: u64,
        size: u64,
        handler: Arc<dyn MmioHandler>,
    ) -> Result<(), DeviceError> {
        self.mmio_traps
            .lock()
            .unwrap()
            .push((guest_base, size, handler));
        Ok(())
    }

    fn del_mmio_trap(&self, guest_base: u64, size: u64) {
        self.mmio_traps
            .lock()
            .unwrap()
            .retain(|(base, sz, _)| !(*base == guest_base && *sz == size));
        self.removed_mmio_traps.lock().unwrap().push((guest_base, size));
    }

    fn add_pio_trap(
        &self,
        port_base: u16,
        size: u16,
        handler: Arc<dyn PioHandler>,
    ) -> Result<(), DeviceError> {
        self.pio_traps
            .lock()
            .unwrap()
            .push((port_base, size, handler));
        Ok(())
    }

    fn del_pio_trap(&self, port_base: u16, size: u16) {
        self.pio_traps
            .lock()
            .unwrap()
            .retain(|(base, sz, _)| !(*base == port_base && *sz == size));
        self.removed_pio_traps.lock().unwrap().push((port_base, size));
    }

    fn supports_pcie(&self) -> bool {
        self.pcie
    }
}
