//! Device-assignment errors.

use kite_vm_api::DeviceError;
use thiserror::Error;

/// Errors raised while assigning a passthrough device to the guest.
///
/// Setup-time variants are fatal to the device being assigned: the device is
/// rejected and the VM continues without it. Runtime interrupt-programming
/// failures are reported to the faulting callback, which logs and carries
/// on with the in-memory model at the last host-accepted state.
#[derive(Debug, Error)]
pub enum Error {
    /// The passthrough driver does not expose a config-space region.
    #[error("config space region is missing")]
    MissingConfigSpace,

    /// The function does not use the standard endpoint header layout.
    #[error("unsupported header type {0:#x}")]
    NotAnEndpoint(u8),

    /// A BAR reported a size that is not a power of two.
    #[error("BAR {bar} has non-power-of-two size {size:#x}")]
    BadBarSize {
        /// BAR slot number.
        bar: usize,
        /// Size reported by the passthrough driver.
        size: u64,
    },

    /// The MSI-X capability points into a BAR the device does not expose.
    #[error("MSI-X structures live in BAR {0}, which is absent")]
    MsixBarAbsent(usize),

    /// Legacy pin interrupts cannot be serviced for this device.
    #[error("{0}")]
    IntxUnsupported(&'static str),

    /// An event fd could not be created.
    #[error("failed to create event fd: {0}")]
    EventFd(std::io::Error),

    /// A collaborator call failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}
