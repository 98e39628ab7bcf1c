//! USB host stack resource-management core
//!
//! Bus/controller registry, device topology, periodic-bandwidth admission
//! control with exact rollback, transfer-request routing and the class
//! driver claim protocol. Controller hardware and hub port machinery plug
//! in through the [`ControllerAdapter`] and [`HubCollaborator`] traits;
//! everything above them is portable.

pub mod bandwidth;
pub mod bus;
pub mod config;
pub mod device;
pub mod driver;
pub mod hub;
pub mod hw;
pub mod stack;
pub mod transfer;
pub mod worker;

pub use bandwidth::{BandwidthPool, USB1_BANDWIDTH, USB2_BANDWIDTH, endpoint_load};
pub use bus::{AddressBitmap, Bus, DEFAULT_ADDRESS, MAX_ADDRESSES, ROOT_HUB_ADDRESS};
pub use config::{ConfigError, StackConfig};
pub use device::{
    AltSettingModel, ConfigModel, Device, DeviceDescriptor, DeviceStage, EndpointModel,
    InterfaceModel, Pipe,
};
pub use driver::{ClassDriver, DriverId, MatchSpec};
pub use hub::HubCollaborator;
pub use hw::{ControllerAdapter, PortRole};
pub use stack::{CONTROL_ENDPOINT_SENTINEL, HostStack};
pub use transfer::{CompletionFn, TransferRequest, TransferStatus};
pub use worker::InterruptWorker;
