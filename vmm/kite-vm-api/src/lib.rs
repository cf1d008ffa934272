//! Contracts between the kite VMM core and device backends.
//!
//! This crate defines the service surface a device backend consumes, without
//! depending on VMM-core internals:
//!
//! - **Passthrough driver** ([`PassthroughDevice`]) -- the kernel facility
//!   exposing a physical function's regions, interrupts, and config space.
//! - **Interrupt routing** ([`InterruptRouter`]) -- MSI routes and
//!   event-fd-to-guest-interrupt wiring.
//! - **PCI bus** ([`PciBus`], [`PciConfigOps`]) -- guest address allocation,
//!   config-space dispatch, and MMIO/PIO interposition.

pub mod bus;
pub mod error;
pub mod msi;
pub mod passthrough;
pub mod routing;

// Re-export all public types at the crate root for ergonomic imports.
pub use bus::{LegacyIrq, MmioHandler, PciBus, PciConfigOps, PioHandler};
pub use error::DeviceError;
pub use msi::MsiMessage;
pub use passthrough::{
    IrqFlags, IrqInfo, IrqSet, IrqSetFlags, PassthroughDevice, RegionFlags, RegionInfo,
};
pub use routing::InterruptRouter;
