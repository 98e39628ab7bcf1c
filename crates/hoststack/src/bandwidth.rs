//! Periodic bandwidth accounting
//!
//! Each bus owns a [`BandwidthPool`] of periodic frame time, in microseconds
//! per 1 ms frame. [`endpoint_load`] is the pure USB 2.0 §5.11.3 budgeting
//! formula; an alternate setting's load is the sum over its endpoints.
//! Admission decisions and their compensating rollbacks live in the stack;
//! this module only does the arithmetic, and a release must be the exact
//! inverse of the reservation it undoes.

use usb::{Direction, Speed, TransferKind};

/// Periodic pool for a low/full-speed bus: 90 % of a 1 ms frame (µs)
pub const USB1_BANDWIDTH: u32 = 900;

/// Periodic pool for a high/super-speed bus: 80 % of the microframe budget (µs per frame)
pub const USB2_BANDWIDTH: u32 = 800;

/// Host controller latency added to every transaction (ns)
const HOST_DELAY_NS: u32 = 1000;

/// Hub setup time for a low-speed transaction behind a full-speed hub (ns)
const HUB_LS_SETUP_NS: u32 = 333;

/// Bandwidth pool for one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthPool {
    /// Frame time reservable for periodic transfers (µs)
    pub total: u32,
    /// Currently unreserved frame time (µs)
    pub available: u32,
}

impl BandwidthPool {
    /// Pool sized by the controller's speed class
    pub fn for_speed(speed: Speed) -> Self {
        let total = if speed.is_legacy() {
            USB1_BANDWIDTH
        } else {
            USB2_BANDWIDTH
        };
        Self {
            total,
            available: total,
        }
    }

    /// Would a reservation of `load` be admitted right now?
    pub fn admits(&self, load: u32) -> bool {
        load <= self.available
    }

    /// Commit a reservation
    pub fn reserve(&mut self, load: u32) {
        self.available = self.available.saturating_sub(load);
    }

    /// Return a reservation to the pool
    pub fn release(&mut self, load: u32) {
        self.available = (self.available + load).min(self.total);
    }

    /// Frame time currently reserved (µs)
    pub fn used(&self) -> u32 {
        self.total - self.available
    }
}

/// Frame time one endpoint consumes, in µs
///
/// Ported from the USB 2.0 §5.11.3 per-speed polynomials. `payload_bytes`
/// is the transaction payload: max packet size times the high-bandwidth
/// multiplier. The intermediate arithmetic works in nanoseconds and keeps
/// the original's division ordering so results match it exactly.
/// SuperSpeed controllers schedule their own bandwidth, so SuperSpeed
/// endpoints cost the host-side pool nothing.
pub fn endpoint_load(
    direction: Direction,
    kind: TransferKind,
    speed: Speed,
    payload_bytes: u16,
) -> u32 {
    // Worst-case bit-stuffed byte time: (7 * 8 * bytes / 6) bit times
    let stuffed = 3167 + ((7 * 8 * u32::from(payload_bytes)) / 6) * 1000;
    let iso = kind == TransferKind::Isochronous;

    match speed {
        Speed::High => {
            // Overhead is 55 bytes for non-iso, 38 for iso; 2083 ps/bit
            let x1 = if iso {
                (38 * 8 * 2083) / 1000
            } else {
                (55 * 8 * 2083) / 1000
            };
            let mut x2 = stuffed / 1000;
            x2 *= 2083;
            x2 /= 1000;
            (x1 + x2 + HOST_DELAY_NS + 500) / 1000
        }
        Speed::Full => {
            let mut x2 = stuffed / 1000;
            x2 *= 8354;
            x2 /= 100;
            let overhead = if !iso {
                9107
            } else if direction == Direction::In {
                7268
            } else {
                6265
            };
            (overhead + x2 + HOST_DELAY_NS + 500) / 1000
        }
        Speed::Low => {
            let mut x2 = stuffed / 1000;
            if direction == Direction::In {
                x2 *= 67667;
                x2 /= 100;
                (64060 + 2 * HUB_LS_SETUP_NS + x2 + HOST_DELAY_NS + 500) / 1000
            } else {
                x2 *= 667;
                (64107 + 2 * HUB_LS_SETUP_NS + x2 + HOST_DELAY_NS + 500) / 1000
            }
        }
        Speed::Super | Speed::SuperPlus => 0,
    }
}
