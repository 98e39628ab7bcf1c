//! Stack-wide error taxonomy

use thiserror::Error;

/// Errors reported across the host stack boundary.
///
/// Every public stack operation returns exactly one of these per call; a
/// failed multi-step operation unwinds its completed stages before the error
/// is returned, so callers never observe half-applied state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Null/out-of-range input, or an operation on an unconfigured device
    #[error("Invalid argument")]
    InvalidArgument,

    /// Bus, controller, device or pipe is unknown or stale
    #[error("Not present")]
    NotPresent,

    /// Destructive operation attempted on a resource still claimed/in use
    #[error("Driver still active")]
    DriverActive,

    /// Periodic bandwidth admission rejected the request
    #[error("No bandwidth available")]
    NoBandwidth,

    /// The transfer was attempted but failed on the wire
    #[error("Transfer failed")]
    TransferFailed,

    /// The device did not respond within the control-transfer timeout
    #[error("Device not responding")]
    DeviceNotResponding,

    /// A fixed-size table (bus slots, driver list, address map) is exhausted
    #[error("Maximum capacity exceeded")]
    MaxExceeded,

    /// Teardown attempted while dependent resources are still attached
    #[error("Invalid delete: resources still attached")]
    InvalidDelete,

    /// A timed lock/semaphore acquisition expired; transient, retryable
    #[error("Timed out")]
    TimedOut,

    /// Failure reported by the controller adapter
    #[error("Hardware error: {0}")]
    Hardware(String),
}

/// Type alias for stack results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NoBandwidth.to_string(), "No bandwidth available");
        let err = Error::Hardware("port reset stuck".into());
        assert!(err.to_string().contains("port reset stuck"));
    }

    #[test]
    fn test_errors_compare() {
        assert_eq!(Error::NotPresent, Error::NotPresent);
        assert_ne!(Error::NotPresent, Error::MaxExceeded);
    }
}
