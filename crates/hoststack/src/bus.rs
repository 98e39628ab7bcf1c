//! Bus controller registry slots
//!
//! A [`Bus`] is one slot of the stack's fixed controller table: the adapter
//! handle, the device membership list, the function-address bitmap and the
//! periodic bandwidth pool. Slots are created by `add_controller` and
//! cleared by `remove_controller`; everything inside a live slot is guarded
//! by its own locks so different buses never serialize against each other.

use crate::bandwidth::BandwidthPool;
use crate::device::Device;
use crate::hw::ControllerAdapter;
use std::sync::{Arc, Mutex};
use usb::Speed;

/// Address of a device still in the default state
pub const DEFAULT_ADDRESS: u8 = 0;

/// Fixed function address of every root hub
pub const ROOT_HUB_ADDRESS: u8 = 1;

/// Width of the per-bus address space (USB 7-bit function addresses)
pub const MAX_ADDRESSES: usize = 128;

/// Per-bus function-address bitmap with round-robin first-fit allocation
///
/// Bit `i` marks address `i` in use. Allocation starts just after the last
/// assigned address and wraps, so a freed address is not immediately reused.
#[derive(Debug, Clone)]
pub struct AddressBitmap {
    bits: [u8; MAX_ADDRESSES / 8],
    last: u8,
}

impl AddressBitmap {
    /// Fresh map with address 0 and the root-hub address pre-marked
    pub fn new() -> Self {
        let mut map = Self {
            bits: [0; MAX_ADDRESSES / 8],
            last: ROOT_HUB_ADDRESS,
        };
        map.mark(DEFAULT_ADDRESS);
        map.mark(ROOT_HUB_ADDRESS);
        map
    }

    fn mark(&mut self, address: u8) {
        self.bits[usize::from(address) / 8] |= 1 << (usize::from(address) % 8);
    }

    /// Is `address` currently assigned?
    pub fn is_marked(&self, address: u8) -> bool {
        if usize::from(address) >= MAX_ADDRESSES {
            return false;
        }
        self.bits[usize::from(address) / 8] & (1 << (usize::from(address) % 8)) != 0
    }

    /// First-fit allocation starting after the last assigned address
    pub fn allocate(&mut self) -> Option<u8> {
        let start = u32::from(self.last) + 1;
        for offset in 0..MAX_ADDRESSES as u32 {
            let candidate = ((start + offset) % MAX_ADDRESSES as u32) as u8;
            if candidate == DEFAULT_ADDRESS {
                continue;
            }
            if !self.is_marked(candidate) {
                self.mark(candidate);
                self.last = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Clear an assigned address; out-of-range addresses are rejected
    pub fn release(&mut self, address: u8) -> bool {
        if usize::from(address) >= MAX_ADDRESSES {
            return false;
        }
        self.bits[usize::from(address) / 8] &= !(1 << (usize::from(address) % 8));
        true
    }
}

impl Default for AddressBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// One registered host controller and the resources it owns
pub struct Bus {
    slot: usize,
    controller: Arc<dyn ControllerAdapter>,
    speed: Speed,
    /// The controller does its own bandwidth admission; host-side pool
    /// bookkeeping is bypassed for this bus.
    self_managed_bandwidth: bool,
    pub(crate) devices: Mutex<Vec<Arc<Device>>>,
    pub(crate) addresses: Mutex<AddressBitmap>,
    pub(crate) bandwidth: Mutex<BandwidthPool>,
    pub(crate) root_hub: Mutex<Option<Arc<Device>>>,
    /// Second logical root hub on dual-capable SuperSpeed controllers
    pub(crate) ss_root_hub: Mutex<Option<Arc<Device>>>,
}

impl Bus {
    pub(crate) fn new(slot: usize, controller: Arc<dyn ControllerAdapter>) -> Arc<Self> {
        let speed = controller.speed();
        let self_managed_bandwidth = controller.self_managed_bandwidth();
        Arc::new(Self {
            slot,
            controller,
            speed,
            self_managed_bandwidth,
            devices: Mutex::new(Vec::new()),
            addresses: Mutex::new(AddressBitmap::new()),
            bandwidth: Mutex::new(BandwidthPool::for_speed(speed)),
            root_hub: Mutex::new(None),
            ss_root_hub: Mutex::new(None),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn controller(&self) -> &Arc<dyn ControllerAdapter> {
        &self.controller
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn self_managed_bandwidth(&self) -> bool {
        self.self_managed_bandwidth
    }

    /// Snapshot of the pool (diagnostic)
    pub fn bandwidth(&self) -> BandwidthPool {
        *common::lock(&self.bandwidth)
    }

    /// Is this device a member of this bus?
    pub(crate) fn owns(&self, device: &Arc<Device>) -> bool {
        common::lock(&self.devices)
            .iter()
            .any(|d| Arc::ptr_eq(d, device))
    }

    pub fn root_hub(&self) -> Option<Arc<Device>> {
        common::lock(&self.root_hub).clone()
    }

    pub fn ss_root_hub(&self) -> Option<Arc<Device>> {
        common::lock(&self.ss_root_hub).clone()
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("slot", &self.slot)
            .field("speed", &self.speed)
            .field("self_managed_bandwidth", &self.self_managed_bandwidth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_map_premarks_reserved_addresses() {
        let map = AddressBitmap::new();
        assert!(map.is_marked(DEFAULT_ADDRESS));
        assert!(map.is_marked(ROOT_HUB_ADDRESS));
        assert!(!map.is_marked(2));
    }

    #[test]
    fn test_allocation_is_round_robin() {
        let mut map = AddressBitmap::new();
        assert_eq!(map.allocate(), Some(2));
        assert_eq!(map.allocate(), Some(3));
        assert_eq!(map.allocate(), Some(4));

        // A released address is not reused until the cursor wraps past it
        assert!(map.release(3));
        assert_eq!(map.allocate(), Some(5));
        assert!(!map.is_marked(3));
    }

    #[test]
    fn test_released_address_reused_after_wrap() {
        let mut map = AddressBitmap::new();
        // Exhaust every allocatable address (2..=127)
        for expected in 2..MAX_ADDRESSES as u8 {
            assert_eq!(map.allocate(), Some(expected));
        }
        assert_eq!(map.allocate(), None);

        assert!(map.release(5));
        // Only 5 is free; the wrap-around scan must find it
        assert_eq!(map.allocate(), Some(5));
        assert_eq!(map.allocate(), None);
    }

    #[test]
    fn test_release_out_of_range_rejected() {
        let mut map = AddressBitmap::new();
        assert!(!map.release(128));
        assert!(!map.release(200));
    }

    #[test]
    fn test_default_address_never_allocated() {
        let mut map = AddressBitmap::new();
        map.release(DEFAULT_ADDRESS);
        for _ in 0..MAX_ADDRESSES {
            if let Some(addr) = map.allocate() {
                assert_ne!(addr, DEFAULT_ADDRESS);
            }
        }
    }
}
