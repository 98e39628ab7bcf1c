//! Device tree model
//!
//! A [`Device`] is one node of the bus topology: parent/child links, the
//! negotiated speed, the descriptor model captured at enumeration, and the
//! per-device lock guarding its configuration state. The descriptor model
//! (`ConfigModel` down to `EndpointModel`) is immutable once the device is
//! attached; everything that changes at runtime lives in [`DeviceState`]
//! behind the device lock.

use crate::bandwidth::endpoint_load;
use crate::driver::DriverId;
use std::sync::{Arc, Mutex, Weak};
use usb::{Direction, Speed, TransferKind, endpoint_direction};

use crate::bus::Bus;

/// Device-descriptor fields the stack routes and matches on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub num_configurations: u8,
}

/// One advertised configuration
#[derive(Debug, Clone)]
pub struct ConfigModel {
    /// bConfigurationValue; never 0
    pub value: u8,
    pub interfaces: Vec<InterfaceModel>,
}

/// One interface and its mutually exclusive alternate settings
#[derive(Debug, Clone)]
pub struct InterfaceModel {
    /// bInterfaceNumber
    pub number: u8,
    pub alt_settings: Vec<AltSettingModel>,
}

/// One alternate setting: an endpoint/bandwidth profile
#[derive(Debug, Clone)]
pub struct AltSettingModel {
    /// bAlternateSetting
    pub setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointModel>,
}

impl AltSettingModel {
    /// Periodic frame time this profile reserves when active (µs)
    pub fn load(&self, speed: Speed) -> u32 {
        self.endpoints.iter().map(|ep| ep.load(speed)).sum()
    }

    /// Does `address` name one of this profile's endpoints?
    pub fn has_endpoint(&self, address: u8) -> bool {
        self.endpoints.iter().any(|ep| ep.address == address)
    }
}

/// One endpoint of an alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointModel {
    /// bEndpointAddress (direction bit included)
    pub address: u8,
    pub kind: TransferKind,
    /// Raw wMaxPacketSize, multiplier bits 11-12 included
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl EndpointModel {
    pub fn direction(&self) -> Direction {
        endpoint_direction(self.address)
    }

    /// Transaction payload: multiplier x max packet size
    pub fn payload_bytes(&self) -> u16 {
        let mult = 1 + ((self.max_packet_size >> 11) & 0x03);
        mult * (self.max_packet_size & 0x07FF)
    }

    /// Frame time this endpoint consumes when its setting is active (µs).
    /// Only periodic endpoints claim pool time.
    pub fn load(&self, speed: Speed) -> u32 {
        if !self.kind.is_periodic() {
            return 0;
        }
        endpoint_load(self.direction(), self.kind, speed, self.payload_bytes())
    }
}

/// Configuration/addressing lifecycle of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStage {
    /// On the default address, not yet addressed
    Default,
    /// Addressed, no active configuration
    Addressed,
    /// A configuration is active
    Configured,
    /// De-enumerated; terminal, all further operations fail validity checks
    Removed,
}

/// Runtime state of one interface of the active configuration
#[derive(Debug, Clone, Default)]
pub struct InterfaceState {
    /// Index of the active alternate setting, if any
    pub current_alt: Option<usize>,
    /// Exclusive claiming driver, at most one at any time
    pub claimed_by: Option<DriverId>,
}

/// Mutable device state, guarded by the device lock
#[derive(Debug)]
pub struct DeviceState {
    pub stage: DeviceStage,
    /// Orthogonal to `stage`; a configured device may be suspended
    pub suspended: bool,
    /// Index into `Device::configurations`
    pub active_config: Option<usize>,
    /// One entry per interface of the active configuration
    pub interfaces: Vec<InterfaceState>,
    /// Aggregate reserved load of the active configuration (µs)
    pub config_load: u32,
    /// Device-level claiming driver (vendor drivers)
    pub claimed_by: Option<DriverId>,
    pub children: Vec<Arc<Device>>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            stage: DeviceStage::Default,
            suspended: false,
            active_config: None,
            interfaces: Vec::new(),
            config_load: 0,
            claimed_by: None,
            children: Vec::new(),
        }
    }
}

/// One node of the device topology
pub struct Device {
    address: u8,
    speed: Speed,
    /// Port of the parent hub this device hangs off
    port: u8,
    /// `None` only for a root hub
    parent: Option<Weak<Device>>,
    bus: Weak<Bus>,
    descriptor: DeviceDescriptor,
    configurations: Vec<ConfigModel>,
    state: Mutex<DeviceState>,
}

impl Device {
    pub(crate) fn new(
        address: u8,
        speed: Speed,
        port: u8,
        parent: Option<&Arc<Device>>,
        bus: &Arc<Bus>,
        descriptor: DeviceDescriptor,
        configurations: Vec<ConfigModel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            speed,
            port,
            parent: parent.map(Arc::downgrade),
            bus: Arc::downgrade(bus),
            descriptor,
            configurations,
            state: Mutex::new(DeviceState::new()),
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn parent(&self) -> Option<Arc<Device>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// A root hub is the only device without a parent
    pub fn is_root_hub(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.upgrade()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn configurations(&self) -> &[ConfigModel] {
        &self.configurations
    }

    /// Find the configuration with the given bConfigurationValue
    pub fn configuration_index(&self, value: u8) -> Option<usize> {
        self.configurations.iter().position(|c| c.value == value)
    }

    /// The device lock: every configuration/alt-setting/link-state change
    /// happens while holding this.
    pub(crate) fn state(&self) -> &Mutex<DeviceState> {
        &self.state
    }

    pub fn stage(&self) -> DeviceStage {
        common::lock(&self.state).stage
    }

    pub fn is_removed(&self) -> bool {
        self.stage() == DeviceStage::Removed
    }

    pub fn is_suspended(&self) -> bool {
        common::lock(&self.state).suspended
    }

    /// bConfigurationValue of the active configuration, if configured
    pub fn active_configuration(&self) -> Option<u8> {
        let state = common::lock(&self.state);
        state.active_config.map(|i| self.configurations[i].value)
    }

    /// Active alternate-setting index for an interface of the active config
    pub fn current_alt_setting(&self, interface_index: usize) -> Option<usize> {
        let state = common::lock(&self.state);
        state
            .interfaces
            .get(interface_index)
            .and_then(|i| i.current_alt)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("speed", &self.speed)
            .field("port", &self.port)
            .field("root_hub", &self.is_root_hub())
            .finish()
    }
}

/// Logical association between a device endpoint and the transfer API
#[derive(Clone)]
pub struct Pipe {
    device: Arc<Device>,
    /// `None` denotes the default control endpoint 0
    endpoint: Option<u8>,
}

impl Pipe {
    /// The default control pipe of a device
    pub fn control(device: Arc<Device>) -> Self {
        Self {
            device,
            endpoint: None,
        }
    }

    /// A pipe onto the endpoint with the given bEndpointAddress
    pub fn new(device: Arc<Device>, endpoint_address: u8) -> Self {
        Self {
            device,
            endpoint: Some(endpoint_address),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn is_control(&self) -> bool {
        self.endpoint.is_none()
    }

    /// bEndpointAddress, `None` for the default control endpoint
    pub fn endpoint(&self) -> Option<u8> {
        self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interrupt_in(address: u8, mps: u16) -> EndpointModel {
        EndpointModel {
            address,
            kind: TransferKind::Interrupt,
            max_packet_size: mps,
            interval: 1,
        }
    }

    #[test]
    fn test_payload_includes_multiplier() {
        // mult bits 11-12 = 2 extra transactions, mps 1024
        let ep = interrupt_in(0x81, (2 << 11) | 1024);
        assert_eq!(ep.payload_bytes(), 3 * 1024);

        let plain = interrupt_in(0x81, 64);
        assert_eq!(plain.payload_bytes(), 64);
    }

    #[test]
    fn test_alt_setting_load_sums_endpoints() {
        let alt = AltSettingModel {
            setting: 1,
            class: 3,
            subclass: 0,
            protocol: 0,
            endpoints: vec![interrupt_in(0x81, 64), interrupt_in(0x02, 64)],
        };
        let sum: u32 = alt.endpoints.iter().map(|e| e.load(Speed::Full)).sum();
        assert_eq!(alt.load(Speed::Full), sum);
        assert!(sum > 0);
    }

    #[test]
    fn test_fresh_state_starts_on_default_address() {
        let state = DeviceState::new();
        assert_eq!(state.stage, DeviceStage::Default);
        assert!(state.active_config.is_none());
        assert_eq!(state.config_load, 0);
    }

    #[test]
    fn test_alt_setting_endpoint_lookup() {
        let alt = AltSettingModel {
            setting: 0,
            class: 8,
            subclass: 6,
            protocol: 0x50,
            endpoints: vec![interrupt_in(0x81, 512)],
        };
        assert!(alt.has_endpoint(0x81));
        assert!(!alt.has_endpoint(0x01));
    }
}
