//! Transfer requests (IRPs)
//!
//! A [`TransferRequest`] describes one pending data exchange over a pipe.
//! After submission the request is immutable to the caller until its
//! completion callback has fired with a terminal status; flushing a pipe
//! completes every outstanding request on it with `Cancelled`, exactly once
//! each.

use std::sync::{Arc, Mutex};
use tracing::warn;

/// Terminal and pending request states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Submitted, completion callback not yet fired
    Pending,
    /// Finished on the wire; `actual_len` bytes transferred
    Completed { actual_len: usize },
    /// Flushed/cancelled before completing
    Cancelled,
    /// The hardware reported a transport error
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }
}

/// Completion callback, fired exactly once per request
pub type CompletionFn = Box<dyn Fn(&TransferRequest) + Send + Sync>;

/// One transfer request
pub struct TransferRequest {
    /// Data to send (OUT) or the buffer received data replaces (IN)
    data: Mutex<Vec<u8>>,
    /// Requested transfer length
    length: usize,
    status: Mutex<TransferStatus>,
    callback: CompletionFn,
}

impl TransferRequest {
    /// Build a request over `data`, completing into `callback`
    pub fn new(data: Vec<u8>, callback: CompletionFn) -> Arc<Self> {
        let length = data.len();
        Arc::new(Self {
            data: Mutex::new(data),
            length,
            status: Mutex::new(TransferStatus::Pending),
            callback,
        })
    }

    /// Request with an empty receive buffer of `length` bytes
    pub fn with_length(length: usize, callback: CompletionFn) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; length]),
            length,
            status: Mutex::new(TransferStatus::Pending),
            callback,
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn status(&self) -> TransferStatus {
        *common::lock(&self.status)
    }

    /// Copy of the request buffer
    pub fn data(&self) -> Vec<u8> {
        common::lock(&self.data).clone()
    }

    /// Replace the buffer contents with received bytes (adapter side)
    pub fn fill(&self, bytes: &[u8]) {
        let mut data = common::lock(&self.data);
        data.clear();
        data.extend_from_slice(bytes);
    }

    /// Move the request to a terminal status and fire the callback.
    ///
    /// Exactly-once: a request that already carries a terminal status is
    /// left untouched and the late completion is dropped with a warning.
    pub fn complete(&self, status: TransferStatus) {
        debug_assert!(status.is_terminal());
        {
            let mut current = common::lock(&self.status);
            if current.is_terminal() {
                warn!(?status, "dropping duplicate completion");
                return;
            }
            *current = status;
        }
        // Callback runs outside the status lock; it may inspect the request
        (self.callback)(self);
    }
}

impl std::fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRequest")
            .field("length", &self.length)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_completion_fires_callback_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let request = TransferRequest::new(
            vec![1, 2, 3],
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(request.status(), TransferStatus::Pending);
        request.complete(TransferStatus::Completed { actual_len: 3 });
        // A raced duplicate (e.g. flush after completion) is dropped
        request.complete(TransferStatus::Cancelled);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(request.status(), TransferStatus::Completed { actual_len: 3 });
    }

    #[test]
    fn test_fill_replaces_buffer() {
        let request = TransferRequest::with_length(8, Box::new(|_| {}));
        assert_eq!(request.length(), 8);
        request.fill(&[0xAA, 0xBB]);
        assert_eq!(request.data(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_callback_observes_terminal_status() {
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let request = TransferRequest::new(
            Vec::new(),
            Box::new(move |req| {
                *common::lock(&slot) = Some(req.status());
            }),
        );
        request.complete(TransferStatus::Cancelled);
        assert_eq!(*common::lock(&seen), Some(TransferStatus::Cancelled));
    }
}
