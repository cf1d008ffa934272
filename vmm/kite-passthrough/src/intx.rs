//! Legacy pin-interrupt engine.
//!
//! INTx is level-triggered, so two event objects are needed: a *trigger*
//! the passthrough driver signals to assert the guest interrupt, and an
//! *unmask* the interrupt-controller backend signals back once the guest
//! acknowledges it, letting the driver re-arm the (auto-masked) line.

use std::os::unix::io::AsRawFd;

use kite_vm_api::passthrough::irq;
use kite_vm_api::{IrqFlags, IrqSet, IrqSetFlags, PassthroughDevice};
use log::debug;
use vmm_sys_util::eventfd::EventFd;

use crate::error::Error;
use crate::vectors::RouteCtx;

/// State of a device's legacy pin interrupt.
pub(crate) struct IntxEngine {
    gsi: u32,
    trigger: Option<EventFd>,
    unmask: Option<EventFd>,
}

/// Checks that the passthrough driver can service level-triggered INTx for
/// this device and builds the (disarmed) engine.
pub(crate) fn probe(device: &dyn PassthroughDevice, gsi: u32) -> Result<IntxEngine, Error> {
    let info = device.irq_info(irq::INTX)?;
    if info.count != 1 {
        return Err(Error::IntxUnsupported("no INTx interrupt reported"));
    }
    if !info.flags.contains(IrqFlags::EVENTFD) {
        return Err(Error::IntxUnsupported("INTx cannot signal an event fd"));
    }
    if !info.flags.contains(IrqFlags::AUTOMASKED) {
        return Err(Error::IntxUnsupported(
            "INTx is not auto-masked; level-triggered flow unavailable",
        ));
    }
    Ok(IntxEngine::new(gsi))
}

impl IntxEngine {
    pub(crate) fn new(gsi: u32) -> Self {
        Self {
            gsi,
            trigger: None,
            unmask: None,
        }
    }

    /// Whether the line is currently armed.
    pub(crate) fn armed(&self) -> bool {
        self.trigger.is_some()
    }

    /// Arms the line: creates both event objects, wires them into the
    /// interrupt-controller backend, and hands them to the passthrough
    /// driver. Idempotent while armed.
    pub(crate) fn enable(&mut self, ctx: &RouteCtx) -> Result<(), Error> {
        if self.armed() {
            return Ok(());
        }

        let trigger = EventFd::new(0).map_err(Error::EventFd)?;
        let unmask = EventFd::new(0).map_err(Error::EventFd)?;

        ctx.router.add_irqfd(self.gsi, &trigger, Some(&unmask))?;

        let result = ctx
            .device
            .set_irqs(IrqSet {
                index: irq::INTX,
                start: 0,
                count: 1,
                flags: IrqSetFlags::DATA_EVENTFD | IrqSetFlags::ACTION_TRIGGER,
                fds: vec![Some(trigger.as_raw_fd())],
            })
            .and_then(|()| {
                ctx.device.set_irqs(IrqSet {
                    index: irq::INTX,
                    start: 0,
                    count: 1,
                    flags: IrqSetFlags::DATA_EVENTFD | IrqSetFlags::ACTION_UNMASK,
                    fds: vec![Some(unmask.as_raw_fd())],
                })
            });
        if let Err(e) = result {
            let _ = ctx.device.set_irqs(clear_trigger());
            let _ = ctx.router.del_irqfd(self.gsi, &trigger);
            return Err(e.into());
        }

        debug!("{}: INTx armed on GSI {}", ctx.name, self.gsi);
        self.trigger = Some(trigger);
        self.unmask = Some(unmask);
        Ok(())
    }

    /// Disarms the line: clears the trigger assignment, removes the backend
    /// route, and closes both descriptors. Idempotent while disarmed.
    pub(crate) fn disable(&mut self, ctx: &RouteCtx) -> Result<(), Error> {
        let Some(trigger) = self.trigger.take() else {
            return Ok(());
        };
        drop(self.unmask.take());

        ctx.device.set_irqs(clear_trigger())?;
        ctx.router.del_irqfd(self.gsi, &trigger)?;
        debug!("{}: INTx disarmed", ctx.name);
        Ok(())
    }
}

/// The no-payload call that withdraws the trigger assignment.
fn clear_trigger() -> IrqSet {
    IrqSet {
        index: irq::INTX,
        start: 0,
        count: 0,
        flags: IrqSetFlags::DATA_NONE | IrqSetFlags::ACTION_TRIGGER,
        fds: Vec::new(),
    }
}
