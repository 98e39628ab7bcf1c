//! The host stack core
//!
//! [`HostStack`] owns the fixed bus-slot table, the driver registry, the
//! serialized control channel and the interrupt hand-off semaphore. It is an
//! explicit context handle: nothing here is process-global, and several
//! stack instances can coexist.
//!
//! # Locking discipline
//!
//! Four lock levels, never nested upward:
//!
//! 1. the stack lock (bus-slot table + driver registry),
//! 2. one lock per device (configuration/alt-setting/link state),
//! 3. the per-bus bandwidth pool lock,
//! 4. the claims ledger.
//!
//! The stack lock and a device lock are never held together; every
//! operation resolves the bus under the stack lock, releases it, and only
//! then takes the device lock. Control transfers suspend on semaphores
//! while holding a device lock, which is what serializes configuration
//! changes on one device while leaving other devices free.

use crate::bus::{Bus, DEFAULT_ADDRESS, ROOT_HUB_ADDRESS};
use crate::config::StackConfig;
use crate::device::{ConfigModel, Device, DeviceDescriptor, DeviceStage, InterfaceState, Pipe};
use crate::driver::{ClassDriver, DriverId};
use crate::hub::HubCollaborator;
use crate::hw::{ControllerAdapter, PortRole};
use crate::transfer::{TransferRequest, TransferStatus};
use common::{Semaphore, SuspendPolicy, lock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use usb::{Error, Result, SetupPacket, Speed, recipient};

/// Endpoint-address sentinel for the bidirectional default control pipe
pub const CONTROL_ENDPOINT_SENTINEL: u8 = 0x80;

struct RegisteredDriver {
    id: DriverId,
    driver: Arc<dyn ClassDriver>,
}

/// State behind the stack lock
struct StackState {
    buses: Vec<Option<Arc<Bus>>>,
    drivers: Vec<RegisteredDriver>,
    next_driver_id: u32,
}

/// One USB host stack instance
pub struct HostStack {
    config: StackConfig,
    hub: Arc<dyn HubCollaborator>,
    state: Mutex<StackState>,
    /// At most one control transfer in flight per stack instance
    ctrl_gate: Semaphore,
    /// Released from interrupt context, consumed by the worker task
    irq: Semaphore,
    worker_running: AtomicBool,
    /// Live claim count per driver, maintained wherever claims change
    claims: Mutex<HashMap<DriverId, usize>>,
}

impl HostStack {
    /// Create a stack sized by `config`, enumerating through `hub`
    pub fn new(config: StackConfig, hub: Arc<dyn HubCollaborator>) -> Arc<Self> {
        let buses = (0..config.max_controllers).map(|_| None).collect();
        Arc::new(Self {
            config,
            hub,
            state: Mutex::new(StackState {
                buses,
                drivers: Vec::new(),
                next_driver_id: 1,
            }),
            ctrl_gate: Semaphore::new(1),
            irq: Semaphore::new(0),
            worker_running: AtomicBool::new(true),
            claims: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    // ---- bus controller registry ----

    /// Register a host controller and enumerate its root hub(s).
    ///
    /// Returns the assigned bus slot. On any failure after the slot was
    /// claimed, exactly the slot allocation is rolled back; hardware and
    /// enumeration errors are propagated and the bus object is discarded.
    pub fn add_controller(&self, adapter: Arc<dyn ControllerAdapter>) -> Result<usize> {
        let bus = {
            let mut state = lock(&self.state);
            let slot = state
                .buses
                .iter()
                .position(Option::is_none)
                .ok_or(Error::MaxExceeded)?;
            let bus = Bus::new(slot, Arc::clone(&adapter));
            state.buses[slot] = Some(Arc::clone(&bus));
            bus
        };
        let slot = bus.slot();
        info!(slot, controller = adapter.name(), "adding host controller");

        // Hardware init and enumeration run outside the stack lock; only
        // the slot claim needs undoing on failure.
        let result = self.bring_up_controller(&bus, &adapter);
        if let Err(ref err) = result {
            warn!(slot, %err, "controller bring-up failed, releasing slot");
            lock(&self.state).buses[slot] = None;
        }
        result.map(|_| slot)
    }

    fn bring_up_controller(&self, bus: &Arc<Bus>, adapter: &Arc<dyn ControllerAdapter>) -> Result<()> {
        adapter.initialize()?;
        adapter.enable_interrupts()?;

        match adapter.speed() {
            Speed::Super | Speed::SuperPlus => {
                // A SuperSpeed root hub is a logical pair: the SuperSpeed
                // half first, then the legacy-speed half on dual-capable
                // controllers.
                self.hub
                    .enumerate_device(self, bus.slot(), None, 0, adapter.speed())?;
                if adapter.dual_capable() {
                    self.hub
                        .enumerate_device(self, bus.slot(), None, 0, Speed::High)?;
                }
            }
            speed => {
                self.hub.enumerate_device(self, bus.slot(), None, 0, speed)?;
            }
        }
        Ok(())
    }

    /// Remove a controller added earlier; the whole device topology under
    /// its root hub(s) is de-enumerated first.
    pub fn remove_controller(&self, adapter: &Arc<dyn ControllerAdapter>) -> Result<()> {
        let bus = {
            let state = lock(&self.state);
            state
                .buses
                .iter()
                .flatten()
                .find(|b| Arc::ptr_eq(b.controller(), adapter))
                .cloned()
                .ok_or(Error::NotPresent)?
        };
        let slot = bus.slot();
        info!(slot, "removing host controller");

        // Slow hub/hardware teardown happens outside the stack lock so
        // unrelated bus operations keep running.
        let mut first_err = None;
        let roots = [bus.ss_root_hub(), bus.root_hub()];
        for root in roots.into_iter().flatten() {
            if let Err(err) = self.hub.disconnect(self, &root) {
                warn!(slot, %err, "root hub disconnect failed");
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = adapter.uninitialize() {
            warn!(slot, %err, "controller uninitialize failed");
            first_err.get_or_insert(err);
        }

        lock(&self.state).buses[slot] = None;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The bus in `slot`, if occupied
    pub fn bus(&self, slot: usize) -> Option<Arc<Bus>> {
        lock(&self.state).buses.get(slot)?.clone()
    }

    /// The bus a device is attached to, by membership scan
    pub fn find_bus(&self, device: &Arc<Device>) -> Option<Arc<Bus>> {
        let state = lock(&self.state);
        state
            .buses
            .iter()
            .flatten()
            .find(|bus| bus.owns(device))
            .cloned()
    }

    /// Guard every mutating API against operating on a torn-down device
    pub fn is_valid_device(&self, device: &Arc<Device>) -> bool {
        !device.is_removed() && self.find_bus(device).is_some()
    }

    // ---- enumeration services (hub collaborator side) ----

    /// Create a device node on a bus.
    ///
    /// Allocates a function address (root hubs take the fixed root-hub
    /// address), links the node into the bus and its parent, then offers
    /// the device to the registered drivers. Staged; the address
    /// allocation is released if a later stage fails.
    pub fn attach_device(
        &self,
        bus_slot: usize,
        parent: Option<&Arc<Device>>,
        port: u8,
        speed: Speed,
        descriptor: DeviceDescriptor,
        configurations: Vec<ConfigModel>,
    ) -> Result<Arc<Device>> {
        self.check_capacities(&configurations)?;

        let (device, drivers) = {
            let state = lock(&self.state);
            let bus = state
                .buses
                .get(bus_slot)
                .and_then(Option::as_ref)
                .cloned()
                .ok_or(Error::NotPresent)?;

            let address = match parent {
                None => ROOT_HUB_ADDRESS,
                Some(_) => lock(&bus.addresses).allocate().ok_or(Error::MaxExceeded)?,
            };

            let device = Device::new(
                address,
                speed,
                port,
                parent,
                &bus,
                descriptor,
                configurations,
            );
            lock(&bus.devices).push(Arc::clone(&device));
            if parent.is_none() {
                let root_slot = if matches!(speed, Speed::Super | Speed::SuperPlus) {
                    &bus.ss_root_hub
                } else {
                    &bus.root_hub
                };
                *lock(root_slot) = Some(Arc::clone(&device));
            }

            let drivers = Self::snapshot_drivers(&state);
            (device, drivers)
        };

        if let Some(parent) = parent {
            lock(parent.state()).children.push(Arc::clone(&device));
        }

        // The node leaves the default-address stage once its function
        // address is assigned and it is linked into the topology.
        lock(device.state()).stage = DeviceStage::Addressed;

        info!(
            bus = bus_slot,
            address = device.address(),
            ?speed,
            root_hub = device.is_root_hub(),
            "device attached"
        );

        // Late failure here would only mean "no driver"; not an error.
        self.offer_device(&device, &drivers);
        Ok(device)
    }

    fn check_capacities(&self, configurations: &[ConfigModel]) -> Result<()> {
        if configurations.len() > self.config.max_configurations {
            return Err(Error::InvalidArgument);
        }
        for config in configurations {
            if config.interfaces.len() > self.config.max_interfaces {
                return Err(Error::InvalidArgument);
            }
            for interface in &config.interfaces {
                if interface.alt_settings.len() > self.config.max_alt_settings {
                    return Err(Error::InvalidArgument);
                }
                for alt in &interface.alt_settings {
                    if alt.endpoints.len() > self.config.max_endpoints {
                        return Err(Error::InvalidArgument);
                    }
                }
            }
        }
        Ok(())
    }

    /// De-enumerate a device and, recursively, its subtree.
    ///
    /// Children go first; claimed drivers get their disconnect callback;
    /// outstanding transfers are flushed; the function address returns to
    /// the bus bitmap; the node becomes `Removed`, terminally.
    pub fn detach_device(&self, device: &Arc<Device>) -> Result<()> {
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;

        let children = {
            let mut state = lock(device.state());
            std::mem::take(&mut state.children)
        };
        for child in &children {
            if let Err(err) = self.detach_device(child) {
                warn!(address = child.address(), %err, "child detach failed");
            }
        }

        // Snapshot what teardown needs, then mark the node Removed so every
        // later validity check fails.
        let (claimed, endpoints, config_load) = {
            let mut state = lock(device.state());
            if state.stage == DeviceStage::Removed {
                return Err(Error::NotPresent);
            }
            let mut claimed: Vec<DriverId> = Vec::new();
            if let Some(id) = state.claimed_by.take() {
                claimed.push(id);
            }
            let mut endpoints = Vec::new();
            if let Some(config_idx) = state.active_config {
                let config = &device.configurations()[config_idx];
                for (i, intf) in state.interfaces.iter_mut().enumerate() {
                    if let Some(id) = intf.claimed_by.take() {
                        if !claimed.contains(&id) {
                            claimed.push(id);
                        }
                    }
                    if let Some(alt_idx) = intf.current_alt {
                        for ep in &config.interfaces[i].alt_settings[alt_idx].endpoints {
                            endpoints.push(ep.address);
                        }
                    }
                }
            }
            let config_load = state.config_load;
            state.config_load = 0;
            state.active_config = None;
            state.interfaces.clear();
            state.stage = DeviceStage::Removed;
            (claimed, endpoints, config_load)
        };

        for id in &claimed {
            self.claim_dec(*id);
            if let Some(driver) = self.driver_by_id(*id) {
                if let Err(err) = driver.disconnect(self, device) {
                    warn!(driver = driver.name(), %err, "disconnect callback failed");
                }
            }
        }

        let adapter = bus.controller();
        for endpoint in endpoints {
            if let Err(err) = adapter.flush(device.address(), endpoint) {
                warn!(endpoint, %err, "pipe flush during detach failed");
            }
        }
        if let Err(err) = adapter.flush(device.address(), CONTROL_ENDPOINT_SENTINEL) {
            warn!(%err, "control pipe flush during detach failed");
        }

        if !bus.self_managed_bandwidth() && config_load > 0 {
            lock(&bus.bandwidth).release(config_load);
        }

        lock(&bus.devices).retain(|d| !Arc::ptr_eq(d, device));
        if !device.is_root_hub() {
            lock(&bus.addresses).release(device.address());
        }
        if let Some(parent) = device.parent() {
            lock(parent.state())
                .children
                .retain(|d| !Arc::ptr_eq(d, device));
        }

        info!(address = device.address(), "device detached");
        Ok(())
    }

    // ---- configuration & bandwidth admission ----

    /// Activate configuration `value` on the device (0 unconfigures).
    ///
    /// The aggregate load of every interface's alternate setting 0 passes
    /// bandwidth admission before SET_CONFIGURATION goes on the wire; a
    /// rejection or wire failure leaves the pool and the previous
    /// configuration exactly as they were.
    pub fn set_configuration(&self, device: &Arc<Device>, value: u8) -> Result<()> {
        if !self.is_valid_device(device) {
            return Err(Error::NotPresent);
        }
        let bus = self.find_bus(device).ok_or(Error::InvalidArgument)?;

        let mut state = lock(device.state());
        if state.stage == DeviceStage::Removed {
            return Err(Error::NotPresent);
        }

        if value == 0 {
            self.control_on_bus(&bus, device, SetupPacket::set_configuration(0), Vec::new())?;
            if !bus.self_managed_bandwidth() && state.config_load > 0 {
                lock(&bus.bandwidth).release(state.config_load);
            }
            self.drop_interface_claims(&mut state.interfaces);
            if let Some(id) = state.claimed_by.take() {
                self.claim_dec(id);
            }
            state.interfaces.clear();
            state.active_config = None;
            state.config_load = 0;
            state.stage = DeviceStage::Addressed;
            debug!(address = device.address(), "device unconfigured");
            return Ok(());
        }

        let config_idx = device
            .configuration_index(value)
            .ok_or(Error::InvalidArgument)?;
        let config = &device.configurations()[config_idx];
        let total_load: u32 = if bus.self_managed_bandwidth() {
            0
        } else {
            config
                .interfaces
                .iter()
                .filter_map(|intf| intf.alt_settings.first())
                .map(|alt| alt.load(device.speed()))
                .sum()
        };
        let previous_load = state.config_load;

        if !bus.self_managed_bandwidth() {
            let mut pool = lock(&bus.bandwidth);
            pool.release(previous_load);
            if !pool.admits(total_load) {
                pool.reserve(previous_load);
                debug!(
                    address = device.address(),
                    value, total_load, "configuration rejected: no bandwidth"
                );
                return Err(Error::NoBandwidth);
            }
            // Reserved before the wire exchange so a concurrent admission
            // on another device cannot double-book the frame time.
            pool.reserve(total_load);
        }

        let setup = SetupPacket::set_configuration(value);
        if let Err(err) = self.control_on_bus(&bus, device, setup, Vec::new()) {
            if !bus.self_managed_bandwidth() {
                let mut pool = lock(&bus.bandwidth);
                pool.release(total_load);
                pool.reserve(previous_load);
            }
            return Err(err);
        }

        self.drop_interface_claims(&mut state.interfaces);
        state.interfaces = config
            .interfaces
            .iter()
            .map(|intf| InterfaceState {
                current_alt: if intf.alt_settings.is_empty() { None } else { Some(0) },
                claimed_by: None,
            })
            .collect();
        state.active_config = Some(config_idx);
        state.config_load = total_load;
        state.stage = DeviceStage::Configured;
        info!(address = device.address(), value, total_load, "device configured");
        Ok(())
    }

    /// Active bConfigurationValue as reported by the device itself
    pub fn get_configuration(&self, device: &Arc<Device>) -> Result<u8> {
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        let _state = lock(device.state());
        let data = self.control_on_bus(&bus, device, SetupPacket::get_configuration(), Vec::new())?;
        data.first().copied().ok_or(Error::TransferFailed)
    }

    /// Select `alt_index` on `interface_index` of the active configuration.
    ///
    /// The admission sequence: optimistically release the current alternate
    /// setting's load, admit the target against the pool, re-reserve the
    /// old load and report `NoBandwidth` on rejection (the current setting
    /// is left active), otherwise exchange SET_INTERFACE and commit — with
    /// the identical compensation if the wire exchange fails.
    pub fn set_interface(
        &self,
        device: &Arc<Device>,
        interface_index: usize,
        alt_index: usize,
    ) -> Result<()> {
        if interface_index >= self.config.max_interfaces
            || alt_index >= self.config.max_alt_settings
        {
            return Err(Error::InvalidArgument);
        }
        if !self.is_valid_device(device) {
            return Err(Error::NotPresent);
        }
        let bus = self.find_bus(device).ok_or(Error::InvalidArgument)?;

        let mut state = lock(device.state());
        let config_idx = state.active_config.ok_or(Error::InvalidArgument)?;
        let config = &device.configurations()[config_idx];
        let interface = config
            .interfaces
            .get(interface_index)
            .ok_or(Error::InvalidArgument)?;
        let target = interface
            .alt_settings
            .get(alt_index)
            .ok_or(Error::InvalidArgument)?;
        let setup = SetupPacket::set_interface(interface.number, target.setting);

        if bus.self_managed_bandwidth() {
            // Admission is the controller's problem; only the exchange and
            // the current pointer are ours.
            self.control_on_bus(&bus, device, setup, Vec::new())?;
            let previous = state.interfaces[interface_index].current_alt;
            state.interfaces[interface_index].current_alt = Some(alt_index);
            drop(state);
            self.retire_stale_endpoints(&bus, device, interface_index, previous, alt_index);
            return Ok(());
        }

        let current_idx = state.interfaces[interface_index].current_alt;
        let current_load = current_idx
            .map(|i| interface.alt_settings[i].load(device.speed()))
            .unwrap_or(0);
        let target_load = target.load(device.speed());

        {
            let mut pool = lock(&bus.bandwidth);
            pool.release(current_load);
            if !pool.admits(target_load) {
                pool.reserve(current_load);
                debug!(
                    address = device.address(),
                    interface_index, alt_index, target_load,
                    available = pool.available,
                    "alt setting rejected: no bandwidth"
                );
                return Err(Error::NoBandwidth);
            }
            pool.reserve(target_load);
        }

        if let Err(err) = self.control_on_bus(&bus, device, setup, Vec::new()) {
            let mut pool = lock(&bus.bandwidth);
            pool.release(target_load);
            pool.reserve(current_load);
            return Err(err);
        }

        state.config_load = state.config_load - current_load + target_load;
        state.interfaces[interface_index].current_alt = Some(alt_index);
        debug!(
            address = device.address(),
            interface_index, alt_index, target_load, "alt setting activated"
        );
        drop(state);
        self.retire_stale_endpoints(&bus, device, interface_index, current_idx, alt_index);
        Ok(())
    }

    /// Drop controller schedule state for endpoints of the previous
    /// alternate setting that the new one does not carry.
    fn retire_stale_endpoints(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        interface_index: usize,
        previous_alt: Option<usize>,
        new_alt: usize,
    ) {
        let Some(previous_alt) = previous_alt else {
            return;
        };
        if previous_alt == new_alt {
            return;
        }
        let state = lock(device.state());
        let Some(config_idx) = state.active_config else {
            return;
        };
        let interface = &device.configurations()[config_idx].interfaces[interface_index];
        let old = &interface.alt_settings[previous_alt];
        let new = &interface.alt_settings[new_alt];
        for ep in &old.endpoints {
            if !new.has_endpoint(ep.address) {
                if let Err(err) = bus.controller().disable_endpoint(device.address(), ep.address) {
                    warn!(endpoint = ep.address, %err, "endpoint disable failed");
                }
            }
        }
    }

    /// Active alternate setting as reported by the device itself
    pub fn get_interface(&self, device: &Arc<Device>, interface_index: usize) -> Result<u8> {
        if interface_index >= self.config.max_interfaces {
            return Err(Error::InvalidArgument);
        }
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        let state = lock(device.state());
        let config_idx = state.active_config.ok_or(Error::InvalidArgument)?;
        let interface = device.configurations()[config_idx]
            .interfaces
            .get(interface_index)
            .ok_or(Error::InvalidArgument)?;
        let setup = SetupPacket::get_interface(interface.number);
        let data = self.control_on_bus(&bus, device, setup, Vec::new())?;
        data.first().copied().ok_or(Error::TransferFailed)
    }

    // ---- status, stall, suspend ----

    /// GET_STATUS on the device (self-powered/remote-wakeup bits)
    pub fn get_device_status(&self, device: &Arc<Device>) -> Result<u16> {
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        let _state = lock(device.state());
        let setup = SetupPacket::get_status(recipient::DEVICE, 0);
        let data = self.control_on_bus(&bus, device, setup, Vec::new())?;
        Self::parse_status(&data)
    }

    /// GET_STATUS on an interface of the active configuration
    pub fn get_interface_status(&self, device: &Arc<Device>, interface_index: usize) -> Result<u16> {
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        let state = lock(device.state());
        let config_idx = state.active_config.ok_or(Error::InvalidArgument)?;
        let interface = device.configurations()[config_idx]
            .interfaces
            .get(interface_index)
            .ok_or(Error::InvalidArgument)?;
        let setup = SetupPacket::get_status(recipient::INTERFACE, u16::from(interface.number));
        let data = self.control_on_bus(&bus, device, setup, Vec::new())?;
        Self::parse_status(&data)
    }

    /// GET_STATUS on an endpoint; bit 0 is the halt flag
    pub fn get_endpoint_status(&self, device: &Arc<Device>, endpoint_address: u8) -> Result<u16> {
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        let _state = lock(device.state());
        let setup = SetupPacket::get_status(recipient::ENDPOINT, u16::from(endpoint_address));
        let data = self.control_on_bus(&bus, device, setup, Vec::new())?;
        Self::parse_status(&data)
    }

    pub fn is_endpoint_stalled(&self, device: &Arc<Device>, endpoint_address: u8) -> Result<bool> {
        Ok(self.get_endpoint_status(device, endpoint_address)? & 0x0001 != 0)
    }

    fn parse_status(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::TransferFailed);
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    /// Halt an endpoint with SET_FEATURE(ENDPOINT_HALT)
    pub fn stall_endpoint(&self, device: &Arc<Device>, endpoint_address: u8) -> Result<()> {
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        let _state = lock(device.state());
        let setup = SetupPacket::set_feature(
            recipient::ENDPOINT,
            usb::feature::ENDPOINT_HALT,
            u16::from(endpoint_address),
        );
        self.control_on_bus(&bus, device, setup, Vec::new())?;
        Ok(())
    }

    /// Clear a halt and reset the controller's data toggle for the endpoint
    pub fn unstall_endpoint(&self, device: &Arc<Device>, endpoint_address: u8) -> Result<()> {
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        let _state = lock(device.state());
        let setup = SetupPacket::clear_feature(
            recipient::ENDPOINT,
            usb::feature::ENDPOINT_HALT,
            u16::from(endpoint_address),
        );
        self.control_on_bus(&bus, device, setup, Vec::new())?;
        bus.controller().unstall(device.address(), endpoint_address)
    }

    /// Selectively suspend the device through its parent hub port
    pub fn suspend_device(&self, device: &Arc<Device>) -> Result<()> {
        let parent = device.parent().ok_or(Error::InvalidArgument)?;
        if !self.is_valid_device(device) {
            return Err(Error::NotPresent);
        }
        let mut state = lock(device.state());
        if state.suspended {
            return Ok(());
        }
        self.hub.suspend_port(self, &parent, device.port())?;
        state.suspended = true;
        debug!(address = device.address(), "device suspended");
        Ok(())
    }

    /// Resume a selectively suspended device
    pub fn resume_device(&self, device: &Arc<Device>) -> Result<()> {
        let parent = device.parent().ok_or(Error::InvalidArgument)?;
        if !self.is_valid_device(device) {
            return Err(Error::NotPresent);
        }
        let mut state = lock(device.state());
        if !state.suspended {
            return Ok(());
        }
        self.hub.resume_port(self, &parent, device.port())?;
        state.suspended = false;
        debug!(address = device.address(), "device resumed");
        Ok(())
    }

    // ---- OTG sessions ----

    /// Start an OTG session on a controller port currently in the host role
    pub fn start_session(&self, bus_slot: usize, port: u8) -> Result<()> {
        let bus = self.bus(bus_slot).ok_or(Error::NotPresent)?;
        match bus.controller().role(port)? {
            PortRole::Host => bus.controller().start_session(port),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// End the OTG session on a controller port
    pub fn end_session(&self, bus_slot: usize, port: u8) -> Result<()> {
        let bus = self.bus(bus_slot).ok_or(Error::NotPresent)?;
        match bus.controller().role(port)? {
            PortRole::Host => bus.controller().end_session(port),
            _ => Err(Error::InvalidArgument),
        }
    }

    // ---- transfer request router ----

    /// Submit a transfer request onto a pipe.
    ///
    /// Unless the pipe is the default control pipe or the device sits on
    /// the default/root-hub address, the endpoint must still belong to the
    /// device's current configuration — a pipe invalidated by a later
    /// `set_interface` reports `NotPresent`.
    pub fn submit_transfer(&self, request: Arc<TransferRequest>, pipe: &Pipe) -> Result<()> {
        let device = pipe.device();
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        self.verify_pipe(device, pipe)?;
        let endpoint = pipe.endpoint().unwrap_or(CONTROL_ENDPOINT_SENTINEL);
        bus.controller()
            .submit(device.address(), endpoint, request, None)
    }

    /// Request cancellation of everything outstanding on the pipe.
    ///
    /// Returns once cancellation has been requested of the hardware; each
    /// outstanding request completes asynchronously with `Cancelled`
    /// through its own callback.
    pub fn flush_pipe(&self, pipe: &Pipe) -> Result<()> {
        let device = pipe.device();
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        self.verify_pipe(device, pipe)?;
        let endpoint = pipe.endpoint().unwrap_or(CONTROL_ENDPOINT_SENTINEL);
        bus.controller().flush(device.address(), endpoint)
    }

    /// Alias of [`HostStack::flush_pipe`]
    pub fn cancel_transfer(&self, pipe: &Pipe) -> Result<()> {
        self.flush_pipe(pipe)
    }

    fn verify_pipe(&self, device: &Arc<Device>, pipe: &Pipe) -> Result<()> {
        let Some(endpoint) = pipe.endpoint() else {
            return Ok(());
        };
        if device.address() == DEFAULT_ADDRESS || device.address() == ROOT_HUB_ADDRESS {
            return Ok(());
        }
        let state = lock(device.state());
        let Some(config_idx) = state.active_config else {
            return Err(Error::NotPresent);
        };
        let config = &device.configurations()[config_idx];
        for (i, intf_state) in state.interfaces.iter().enumerate() {
            if let Some(alt_idx) = intf_state.current_alt {
                if config.interfaces[i].alt_settings[alt_idx].has_endpoint(endpoint) {
                    return Ok(());
                }
            }
        }
        Err(Error::NotPresent)
    }

    // ---- serialized control channel ----

    /// Issue one control transfer on the device's default control pipe.
    ///
    /// `data` is the OUT payload, or the IN buffer (grown to wLength if
    /// shorter); the returned vector is the IN data truncated to the actual
    /// transfer length.
    pub fn control_transfer(
        &self,
        device: &Arc<Device>,
        setup: SetupPacket,
        data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let bus = self.find_bus(device).ok_or(Error::NotPresent)?;
        self.control_on_bus(&bus, device, setup, data)
    }

    fn control_on_bus(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        setup: SetupPacket,
        mut data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        if setup.is_in() && data.len() < usize::from(setup.length) {
            data.resize(usize::from(setup.length), 0);
        }

        // One control transfer in flight per stack instance.
        self.ctrl_gate
            .acquire(SuspendPolicy::Infinite)
            .map_err(|_| Error::TimedOut)?;

        // A fresh semaphore per exchange. A request that was flushed after
        // a timeout may deliver its Cancelled completion arbitrarily late;
        // it must only ever signal the exchange that issued it.
        let done = Arc::new(Semaphore::new(0));
        let signal = Arc::clone(&done);
        let request = TransferRequest::new(data, Box::new(move |_| signal.release()));

        let result = self.exchange_control(bus, device, setup, &request, &done);
        self.ctrl_gate.release();
        result
    }

    fn exchange_control(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        setup: SetupPacket,
        request: &Arc<TransferRequest>,
        done: &Semaphore,
    ) -> Result<Vec<u8>> {
        bus.controller().submit(
            device.address(),
            CONTROL_ENDPOINT_SENTINEL,
            Arc::clone(request),
            Some(setup),
        )?;

        let timeout = SuspendPolicy::Timed(self.config.control_timeout());
        if done.acquire(timeout).is_err() {
            warn!(
                address = device.address(),
                request = setup.request,
                "control transfer timed out"
            );
            if let Err(err) = bus
                .controller()
                .flush(device.address(), CONTROL_ENDPOINT_SENTINEL)
            {
                warn!(%err, "control pipe flush after timeout failed");
            }
            return Err(Error::DeviceNotResponding);
        }

        match request.status() {
            TransferStatus::Completed { actual_len } => {
                let mut data = request.data();
                if setup.is_in() {
                    data.truncate(actual_len);
                }
                Ok(data)
            }
            _ => Err(Error::TransferFailed),
        }
    }

    // ---- driver registry & claim protocol ----

    /// Register a class driver and offer it every unclaimed device and
    /// interface already enumerated.
    pub fn register_driver(&self, driver: Arc<dyn ClassDriver>) -> Result<DriverId> {
        let (id, drivers, buses) = {
            let mut state = lock(&self.state);
            if state.drivers.len() >= self.config.max_drivers {
                return Err(Error::MaxExceeded);
            }
            let id = DriverId(state.next_driver_id);
            state.next_driver_id += 1;
            state.drivers.push(RegisteredDriver {
                id,
                driver: Arc::clone(&driver),
            });
            let drivers = Self::snapshot_drivers(&state);
            let buses: Vec<Arc<Bus>> = state.buses.iter().flatten().cloned().collect();
            (id, drivers, buses)
        };
        info!(driver = driver.name(), id = id.0, "driver registered");

        for bus in buses {
            let devices = lock(&bus.devices).clone();
            for device in devices {
                self.offer_device(&device, &drivers);
            }
        }
        Ok(id)
    }

    /// Remove a registered driver; fails with `DriverActive` while any
    /// device or interface is still claimed by it.
    pub fn deregister_driver(&self, id: DriverId) -> Result<()> {
        let mut state = lock(&self.state);
        let index = state
            .drivers
            .iter()
            .position(|d| d.id == id)
            .ok_or(Error::NotPresent)?;
        if lock(&self.claims).get(&id).copied().unwrap_or(0) > 0 {
            return Err(Error::DriverActive);
        }
        let removed = state.drivers.remove(index);
        info!(driver = removed.driver.name(), id = id.0, "driver deregistered");
        Ok(())
    }

    /// Exclusively bind an interface of a configured device to a driver
    pub fn claim_interface(
        &self,
        device: &Arc<Device>,
        interface_index: usize,
        id: DriverId,
    ) -> Result<()> {
        if !self.is_valid_device(device) {
            return Err(Error::NotPresent);
        }
        let mut state = lock(device.state());
        if state.active_config.is_none() {
            return Err(Error::InvalidArgument);
        }
        let interface = state
            .interfaces
            .get_mut(interface_index)
            .ok_or(Error::InvalidArgument)?;
        match interface.claimed_by {
            None => {
                interface.claimed_by = Some(id);
                self.claim_inc(id);
                Ok(())
            }
            Some(owner) if owner == id => Ok(()),
            Some(_) => Err(Error::DriverActive),
        }
    }

    /// Release an interface claim; releasing an unclaimed interface is a
    /// no-op, releasing another driver's claim is `DriverActive`.
    pub fn release_interface(
        &self,
        device: &Arc<Device>,
        interface_index: usize,
        id: DriverId,
    ) -> Result<()> {
        let mut state = lock(device.state());
        let Some(interface) = state.interfaces.get_mut(interface_index) else {
            return Err(Error::InvalidArgument);
        };
        match interface.claimed_by {
            None => Ok(()),
            Some(owner) if owner == id => {
                interface.claimed_by = None;
                self.claim_dec(id);
                Ok(())
            }
            Some(_) => Err(Error::DriverActive),
        }
    }

    /// Live claim count of a driver (devices plus interfaces)
    pub fn claim_count(&self, id: DriverId) -> usize {
        lock(&self.claims).get(&id).copied().unwrap_or(0)
    }

    fn claim_inc(&self, id: DriverId) {
        *lock(&self.claims).entry(id).or_insert(0) += 1;
    }

    fn claim_dec(&self, id: DriverId) {
        let mut claims = lock(&self.claims);
        if let Some(count) = claims.get_mut(&id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                claims.remove(&id);
            }
        }
    }

    fn driver_by_id(&self, id: DriverId) -> Option<Arc<dyn ClassDriver>> {
        lock(&self.state)
            .drivers
            .iter()
            .find(|d| d.id == id)
            .map(|d| Arc::clone(&d.driver))
    }

    fn snapshot_drivers(state: &StackState) -> Vec<(DriverId, Arc<dyn ClassDriver>)> {
        state
            .drivers
            .iter()
            .map(|d| (d.id, Arc::clone(&d.driver)))
            .collect()
    }

    fn drop_interface_claims(&self, interfaces: &mut [InterfaceState]) {
        for interface in interfaces {
            if let Some(id) = interface.claimed_by.take() {
                self.claim_dec(id);
            }
        }
    }

    /// Offer a device (or its unclaimed interfaces) to the registered
    /// drivers, best score first; registration order breaks ties because
    /// the snapshot preserves it and the sort is stable.
    fn offer_device(&self, device: &Arc<Device>, drivers: &[(DriverId, Arc<dyn ClassDriver>)]) {
        if device.is_root_hub() || device.is_removed() {
            return;
        }

        let configured = {
            let state = lock(device.state());
            state.active_config.is_some()
        };

        if !configured {
            self.offer_whole_device(device, drivers);
        } else {
            self.offer_interfaces(device, drivers);
        }
    }

    fn offer_whole_device(&self, device: &Arc<Device>, drivers: &[(DriverId, Arc<dyn ClassDriver>)]) {
        {
            let state = lock(device.state());
            if state.claimed_by.is_some() {
                return;
            }
        }
        let mut candidates: Vec<(u32, DriverId, &Arc<dyn ClassDriver>)> = drivers
            .iter()
            .filter_map(|(id, driver)| {
                driver
                    .match_spec()
                    .score_device(device.descriptor())
                    .map(|score| (score, *id, driver))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (score, id, driver) in candidates {
            {
                let mut state = lock(device.state());
                if state.claimed_by.is_some() {
                    return;
                }
                state.claimed_by = Some(id);
            }
            self.claim_inc(id);

            debug!(driver = driver.name(), score, address = device.address(), "offering device");
            if driver.connect_device(self, device).is_ok() {
                info!(driver = driver.name(), address = device.address(), "device claimed");
                return;
            }

            // Declined; undo the match and keep scanning
            let mut state = lock(device.state());
            if state.claimed_by == Some(id) {
                state.claimed_by = None;
                drop(state);
                self.claim_dec(id);
            }
        }
    }

    fn offer_interfaces(&self, device: &Arc<Device>, drivers: &[(DriverId, Arc<dyn ClassDriver>)]) {
        let (config_idx, interface_count) = {
            let state = lock(device.state());
            match state.active_config {
                Some(idx) => (idx, state.interfaces.len()),
                None => return,
            }
        };
        let config = &device.configurations()[config_idx];

        for interface_index in 0..interface_count {
            let alt = {
                let state = lock(device.state());
                let Some(intf_state) = state.interfaces.get(interface_index) else {
                    continue;
                };
                if intf_state.claimed_by.is_some() {
                    continue;
                }
                let alt_idx = intf_state.current_alt.unwrap_or(0);
                match config.interfaces[interface_index].alt_settings.get(alt_idx) {
                    Some(alt) => alt.clone(),
                    None => continue,
                }
            };

            let mut candidates: Vec<(u32, DriverId, &Arc<dyn ClassDriver>)> = drivers
                .iter()
                .filter_map(|(id, driver)| {
                    driver
                        .match_spec()
                        .score_interface(&alt)
                        .map(|score| (score, *id, driver))
                })
                .collect();
            candidates.sort_by(|a, b| b.0.cmp(&a.0));

            for (score, id, driver) in candidates {
                if self.claim_interface(device, interface_index, id).is_err() {
                    break;
                }
                debug!(
                    driver = driver.name(),
                    score,
                    address = device.address(),
                    interface_index,
                    "offering interface"
                );
                if driver.connect_interface(self, device, interface_index).is_ok() {
                    info!(
                        driver = driver.name(),
                        address = device.address(),
                        interface_index,
                        "interface claimed"
                    );
                    break;
                }
                let _ = self.release_interface(device, interface_index, id);
            }
        }
    }

    // ---- interrupt hand-off (worker side in worker.rs) ----

    /// Signal the stack from interrupt context. Only releases the IRQ
    /// semaphore; all processing happens on the worker task.
    pub fn interrupt(&self) {
        self.irq.release();
    }

    pub(crate) fn wait_interrupt(&self) -> bool {
        let _ = self.irq.acquire(SuspendPolicy::Infinite);
        self.worker_running.load(Ordering::Acquire)
    }

    pub(crate) fn adapters(&self) -> Vec<Arc<dyn ControllerAdapter>> {
        lock(&self.state)
            .buses
            .iter()
            .flatten()
            .map(|bus| Arc::clone(bus.controller()))
            .collect()
    }

    pub(crate) fn stop_worker(&self) {
        self.worker_running.store(false, Ordering::Release);
        self.irq.release();
    }
}

impl std::fmt::Debug for HostStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("HostStack")
            .field("buses", &state.buses.iter().flatten().count())
            .field("drivers", &state.drivers.len())
            .finish()
    }
}
