//! USB chapter-9 primitives for the host stack
//!
//! This crate defines the value types shared across the host stack: device
//! speeds, transfer kinds, endpoint addressing, the bit-exact 8-byte SETUP
//! packet encoding for standard control requests, and the stack-wide error
//! taxonomy.
//!
//! # Example
//!
//! ```
//! use usb::request::SetupPacket;
//!
//! // SET_INTERFACE(alt 2) on interface 1, per USB 2.0 table 9-4.
//! let setup = SetupPacket::set_interface(1, 2);
//! let bytes = setup.encode();
//! assert_eq!(bytes, [0x01, 0x0B, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00]);
//! ```

pub mod error;
pub mod request;
pub mod types;

pub use error::{Error, Result};
pub use request::{SetupPacket, feature, recipient, request_code, request_type};
pub use types::{Direction, Speed, TransferKind, endpoint_address, endpoint_direction, endpoint_number};
