//! Errors returned by VMM-core collaborators.

use thiserror::Error;

/// Errors that can occur in calls to the VMM-core service traits.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The requested region index is not provided by the device.
    #[error("region {0} is not available")]
    RegionUnavailable(u32),

    /// The requested interrupt index is not provided by the device.
    #[error("interrupt index {0} is not available")]
    IrqUnavailable(u32),

    /// The passthrough driver rejected the operation.
    ///
    /// Driver rejections are never retried: they indicate a kernel-side
    /// refusal that a retry will not resolve.
    #[error("operation rejected by the passthrough driver")]
    Rejected,

    /// A guest address block of the requested size could not be allocated.
    #[error("guest address space exhausted")]
    OutOfSpace,

    /// The operation is not supported by this platform.
    #[error("operation not supported")]
    Unsupported,

    /// An I/O error occurred while accessing the device handle.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
