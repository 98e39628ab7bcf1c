//! Common utilities for rust-usb-host
//!
//! This crate provides the plumbing shared by the host stack crates:
//! logging setup, blocking synchronization primitives with caller-selectable
//! suspend policies, and error handling.

pub mod error;
pub mod logging;
pub mod sync;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use sync::{Semaphore, SuspendPolicy, WaitError, lock};
