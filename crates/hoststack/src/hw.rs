//! Controller adapter interface
//!
//! The stack is hardware-agnostic beyond this trait: a controller driver
//! (OHCI, EHCI, xHCI, a test double) implements it and the stack routes
//! transfers, interrupt servicing and OTG/LPM plumbing through it.

use crate::transfer::TransferRequest;
use std::sync::Arc;
use usb::{Result, SetupPacket, Speed};

/// OTG role of a controller port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Host,
    Peripheral,
    Idle,
}

/// Hardware adapter for one host controller
///
/// Submission is keyed by (function address, bEndpointAddress); the stack
/// encodes the default control endpoint as the bidirectional sentinel
/// `0x80` regardless of the requested direction. `flush` must eventually
/// complete every outstanding request on the pipe with `Cancelled`.
pub trait ControllerAdapter: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Bring the controller hardware to an operational state
    fn initialize(&self) -> Result<()>;

    /// Stop the controller hardware
    fn uninitialize(&self) -> Result<()>;

    fn enable_interrupts(&self) -> Result<()>;

    /// Speed class of the controller; sizes the bus bandwidth pool
    fn speed(&self) -> Speed;

    /// The controller performs its own bandwidth admission; the stack
    /// bypasses host-side pool bookkeeping for this bus.
    fn self_managed_bandwidth(&self) -> bool {
        false
    }

    /// SuperSpeed controllers that also expose a legacy-speed root hub
    fn dual_capable(&self) -> bool {
        false
    }

    /// Queue a transfer request; `setup` accompanies control submissions
    fn submit(
        &self,
        address: u8,
        endpoint: u8,
        request: Arc<TransferRequest>,
        setup: Option<SetupPacket>,
    ) -> Result<()>;

    /// Request cancellation of everything outstanding on (address, endpoint)
    fn flush(&self, address: u8, endpoint: u8) -> Result<()>;

    /// Reset the data toggle/sequence state of an unstalled endpoint
    fn unstall(&self, address: u8, endpoint: u8) -> Result<()>;

    /// Drop schedule state for an endpoint that left the active setting
    fn disable_endpoint(&self, address: u8, endpoint: u8) -> Result<()>;

    /// Did this controller raise the interrupt being serviced?
    fn interrupt_pending(&self) -> bool;

    /// Process the controller's pending interrupt causes (worker context)
    fn service_interrupt(&self) -> Result<()>;

    /// OTG role of the given port
    fn role(&self, port: u8) -> Result<PortRole>;

    /// Start an OTG session on the given port
    fn start_session(&self, port: u8) -> Result<()>;

    /// End the OTG session on the given port
    fn end_session(&self, port: u8) -> Result<()>;

    /// Link-power-management pass-through; the stack does no LPM arithmetic
    fn update_power_mode(&self, address: u8, mode: u8) -> Result<()> {
        let _ = (address, mode);
        Ok(())
    }

    /// Best-effort latency tolerance (BELT) pass-through
    fn update_belt(&self, address: u8, belt_ns: u32) -> Result<()> {
        let _ = (address, belt_ns);
        Ok(())
    }
}
