//! USB value types
//!
//! Speeds, transfer kinds, directions and endpoint addressing as defined by
//! USB 2.0/3.x chapter 9. These are plain value types shared by every layer
//! of the stack.

use serde::{Deserialize, Serialize};

/// Negotiated device/controller speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl Speed {
    /// Speeds whose periodic budget is tracked per 1 ms frame
    pub fn is_legacy(self) -> bool {
        matches!(self, Speed::Low | Speed::Full)
    }
}

/// Endpoint transfer kind, in bmAttributes encoding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Control transfer (endpoint 0 and any additional control endpoints)
    Control,
    /// Isochronous transfer, bandwidth reserved per service interval
    Isochronous,
    /// Bulk transfer, uses leftover bus time
    Bulk,
    /// Interrupt transfer, bandwidth reserved per service interval
    Interrupt,
}

impl TransferKind {
    /// Decode the transfer-type bits of bmAttributes
    pub fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x03 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }

    /// Periodic endpoints participate in bandwidth admission
    pub fn is_periodic(self) -> bool {
        matches!(self, TransferKind::Isochronous | TransferKind::Interrupt)
    }
}

/// Transfer direction, host-relative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// Direction bit of a bEndpointAddress byte
pub const ENDPOINT_DIRECTION_BIT: u8 = 0x80;

/// Endpoint number mask of a bEndpointAddress byte
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0F;

/// Compose a bEndpointAddress from an endpoint number and direction
pub fn endpoint_address(number: u8, direction: Direction) -> u8 {
    let number = number & ENDPOINT_NUMBER_MASK;
    match direction {
        Direction::Out => number,
        Direction::In => number | ENDPOINT_DIRECTION_BIT,
    }
}

/// Direction encoded in a bEndpointAddress
pub fn endpoint_direction(address: u8) -> Direction {
    if address & ENDPOINT_DIRECTION_BIT != 0 {
        Direction::In
    } else {
        Direction::Out
    }
}

/// Endpoint number encoded in a bEndpointAddress
pub fn endpoint_number(address: u8) -> u8 {
    address & ENDPOINT_NUMBER_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address_roundtrip() {
        let addr = endpoint_address(3, Direction::In);
        assert_eq!(addr, 0x83);
        assert_eq!(endpoint_number(addr), 3);
        assert_eq!(endpoint_direction(addr), Direction::In);

        let addr = endpoint_address(1, Direction::Out);
        assert_eq!(addr, 0x01);
        assert_eq!(endpoint_direction(addr), Direction::Out);
    }

    #[test]
    fn test_transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(TransferKind::from_attributes(0x01), TransferKind::Isochronous);
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
        // Upper bits (sync/usage for iso) must not affect the kind
        assert_eq!(TransferKind::from_attributes(0x0D), TransferKind::Isochronous);
    }

    #[test]
    fn test_periodic_kinds() {
        assert!(TransferKind::Interrupt.is_periodic());
        assert!(TransferKind::Isochronous.is_periodic());
        assert!(!TransferKind::Bulk.is_periodic());
        assert!(!TransferKind::Control.is_periodic());
    }
}
