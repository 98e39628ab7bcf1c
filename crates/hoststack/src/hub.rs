//! Hub/enumeration collaborator interface
//!
//! Physical port scanning and the wire-level enumeration sequence live
//! entirely behind this trait. The collaborator creates device nodes with
//! [`crate::HostStack::attach_device`] and tears whole subtrees down with
//! [`crate::HostStack::detach_device`]; it is trusted to serialize
//! concurrent enumerations on one bus.

use crate::device::Device;
use crate::stack::HostStack;
use std::sync::Arc;
use usb::{Result, Speed};

/// Hub and enumeration services consumed by the stack
pub trait HubCollaborator: Send + Sync {
    /// Enumerate the device on `port` of `parent` (or a root hub when
    /// `parent` is `None`) and attach it to the bus in `bus_slot`.
    fn enumerate_device(
        &self,
        stack: &HostStack,
        bus_slot: usize,
        parent: Option<&Arc<Device>>,
        port: u8,
        speed: Speed,
    ) -> Result<Arc<Device>>;

    /// De-enumerate `root` and, recursively, its whole subtree
    fn disconnect(&self, stack: &HostStack, root: &Arc<Device>) -> Result<()>;

    /// Selectively suspend the port `port` of the hub `parent`
    fn suspend_port(&self, stack: &HostStack, parent: &Arc<Device>, port: u8) -> Result<()>;

    /// Resume the port `port` of the hub `parent`
    fn resume_port(&self, stack: &HostStack, parent: &Arc<Device>, port: u8) -> Result<()>;
}
