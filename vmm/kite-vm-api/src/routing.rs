//! Interrupt-controller backend interface.

use vmm_sys_util::eventfd::EventFd;

use crate::error::DeviceError;
use crate::msi::MsiMessage;

/// Routes event-fd signals into guest interrupts.
///
/// A route is named by an opaque global system interrupt (GSI) identifier
/// issued by the backend. Implemented by the VMM core on top of the
/// hypervisor's interrupt-controller facility.
pub trait InterruptRouter: Send + Sync {
    /// Allocates a new MSI route for `msg`, keyed to the requesting device.
    ///
    /// Returns the GSI naming the route.
    fn add_msi_route(&self, msg: MsiMessage, devid: u32) -> Result<u32, DeviceError>;

    /// Repoints an existing MSI route at a new message.
    fn update_msi_route(&self, gsi: u32, msg: MsiMessage) -> Result<(), DeviceError>;

    /// Wires `trigger` to raise the guest interrupt behind `gsi`.
    ///
    /// For level-triggered sources, `resample` is signaled back when the
    /// guest acknowledges the interrupt.
    fn add_irqfd(
        &self,
        gsi: u32,
        trigger: &EventFd,
        resample: Option<&EventFd>,
    ) -> Result<(), DeviceError>;

    /// Removes the wiring installed by [`add_irqfd`](Self::add_irqfd).
    fn del_irqfd(&self, gsi: u32, trigger: &EventFd) -> Result<(), DeviceError>;
}
