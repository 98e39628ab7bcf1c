//! Standard control-request wire encoding
//!
//! The 8-byte SETUP packet layout of USB 2.0 §9.3. Multi-byte fields are
//! little-endian and the byte layout must be bit-exact for real devices to
//! accept the request.

use bytes::{Buf, BufMut};

/// bmRequestType direction/type bits
pub mod request_type {
    /// Host-to-device data phase
    pub const DIR_OUT: u8 = 0x00;
    /// Device-to-host data phase
    pub const DIR_IN: u8 = 0x80;
    /// Standard request
    pub const TYPE_STANDARD: u8 = 0x00;
    /// Class-defined request
    pub const TYPE_CLASS: u8 = 0x20;
    /// Vendor-defined request
    pub const TYPE_VENDOR: u8 = 0x40;
}

/// bmRequestType recipient bits
pub mod recipient {
    pub const DEVICE: u8 = 0x00;
    pub const INTERFACE: u8 = 0x01;
    pub const ENDPOINT: u8 = 0x02;
    pub const OTHER: u8 = 0x03;
}

/// Standard bRequest codes (USB 2.0 table 9-4)
pub mod request_code {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
}

/// Standard feature selectors (USB 2.0 table 9-6)
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
    pub const TEST_MODE: u16 = 2;
}

/// Size of an encoded SETUP packet
pub const SETUP_PACKET_LEN: usize = 8;

/// An 8-byte SETUP packet for the control channel
///
/// Field names follow the USB specification; `encode` produces the exact
/// on-the-wire byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// bmRequestType: direction, type and recipient bits
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength: byte count of the data phase
    pub length: u16,
}

impl SetupPacket {
    /// GET_STATUS for the given recipient; replies with 2 bytes
    pub fn get_status(recip: u8, index: u16) -> Self {
        Self {
            request_type: request_type::DIR_IN | request_type::TYPE_STANDARD | recip,
            request: request_code::GET_STATUS,
            value: 0,
            index,
            length: 2,
        }
    }

    /// SET_FEATURE for the given recipient
    pub fn set_feature(recip: u8, selector: u16, index: u16) -> Self {
        Self {
            request_type: request_type::DIR_OUT | request_type::TYPE_STANDARD | recip,
            request: request_code::SET_FEATURE,
            value: selector,
            index,
            length: 0,
        }
    }

    /// CLEAR_FEATURE for the given recipient
    pub fn clear_feature(recip: u8, selector: u16, index: u16) -> Self {
        Self {
            request_type: request_type::DIR_OUT | request_type::TYPE_STANDARD | recip,
            request: request_code::CLEAR_FEATURE,
            value: selector,
            index,
            length: 0,
        }
    }

    /// SET_CONFIGURATION with the given bConfigurationValue (0 unconfigures)
    pub fn set_configuration(value: u8) -> Self {
        Self {
            request_type: request_type::DIR_OUT | request_type::TYPE_STANDARD | recipient::DEVICE,
            request: request_code::SET_CONFIGURATION,
            value: u16::from(value),
            index: 0,
            length: 0,
        }
    }

    /// GET_CONFIGURATION; replies with the active bConfigurationValue byte
    pub fn get_configuration() -> Self {
        Self {
            request_type: request_type::DIR_IN | request_type::TYPE_STANDARD | recipient::DEVICE,
            request: request_code::GET_CONFIGURATION,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    /// SET_INTERFACE selecting `alt_setting` on `interface`
    pub fn set_interface(interface: u8, alt_setting: u8) -> Self {
        Self {
            request_type: request_type::DIR_OUT | request_type::TYPE_STANDARD | recipient::INTERFACE,
            request: request_code::SET_INTERFACE,
            value: u16::from(alt_setting),
            index: u16::from(interface),
            length: 0,
        }
    }

    /// GET_INTERFACE; replies with the active bAlternateSetting byte
    pub fn get_interface(interface: u8) -> Self {
        Self {
            request_type: request_type::DIR_IN | request_type::TYPE_STANDARD | recipient::INTERFACE,
            request: request_code::GET_INTERFACE,
            value: 0,
            index: u16::from(interface),
            length: 1,
        }
    }

    /// GET_DESCRIPTOR for (descriptor type, descriptor index, language id)
    pub fn get_descriptor(desc_type: u8, desc_index: u8, lang_id: u16, length: u16) -> Self {
        Self {
            request_type: request_type::DIR_IN | request_type::TYPE_STANDARD | recipient::DEVICE,
            request: request_code::GET_DESCRIPTOR,
            value: (u16::from(desc_type) << 8) | u16::from(desc_index),
            index: lang_id,
            length,
        }
    }

    /// Direction of the data phase
    pub fn is_in(&self) -> bool {
        self.request_type & request_type::DIR_IN != 0
    }

    /// Encode into the on-the-wire 8-byte layout
    pub fn encode(&self) -> [u8; SETUP_PACKET_LEN] {
        let mut buf = [0u8; SETUP_PACKET_LEN];
        self.write_to(&mut &mut buf[..]);
        buf
    }

    /// Append the encoded packet to a buffer
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.request_type);
        buf.put_u8(self.request);
        buf.put_u16_le(self.value);
        buf.put_u16_le(self.index);
        buf.put_u16_le(self.length);
    }

    /// Decode from the on-the-wire layout
    pub fn read_from(buf: &mut impl Buf) -> Self {
        Self {
            request_type: buf.get_u8(),
            request: buf.get_u8(),
            value: buf.get_u16_le(),
            index: buf.get_u16_le(),
            length: buf.get_u16_le(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_interface_layout() {
        // USB 2.0 table 9-4: 01h, 0Bh, wValue = alt, wIndex = interface
        let bytes = SetupPacket::set_interface(2, 1).encode();
        assert_eq!(bytes, [0x01, 0x0B, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_set_configuration_layout() {
        let bytes = SetupPacket::set_configuration(1).encode();
        assert_eq!(bytes, [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_get_status_endpoint_layout() {
        // GET_STATUS on endpoint 0x81: 82h, 00h, wIndex = endpoint, wLength = 2
        let bytes = SetupPacket::get_status(recipient::ENDPOINT, 0x0081).encode();
        assert_eq!(bytes, [0x82, 0x00, 0x00, 0x00, 0x81, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_clear_feature_halt_layout() {
        let bytes =
            SetupPacket::clear_feature(recipient::ENDPOINT, feature::ENDPOINT_HALT, 0x0002).encode();
        assert_eq!(bytes, [0x02, 0x01, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_get_descriptor_layout() {
        // Device descriptor (type 1, index 0), 18 bytes
        let bytes = SetupPacket::get_descriptor(1, 0, 0, 18).encode();
        assert_eq!(bytes, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    }

    #[test]
    fn test_wire_roundtrip() {
        let setup = SetupPacket::get_status(recipient::DEVICE, 0);
        let encoded = setup.encode();
        let decoded = SetupPacket::read_from(&mut &encoded[..]);
        assert_eq!(decoded, setup);
        assert!(decoded.is_in());
    }

    #[test]
    fn test_little_endian_fields() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 0x06,
            value: 0x1234,
            index: 0xABCD,
            length: 0x0102,
        };
        let bytes = setup.encode();
        assert_eq!(&bytes[2..4], &[0x34, 0x12]);
        assert_eq!(&bytes[4..6], &[0xCD, 0xAB]);
        assert_eq!(&bytes[6..8], &[0x02, 0x01]);
    }
}
