//! Deferred interrupt servicing
//!
//! Interrupt context only releases the stack's IRQ semaphore (see
//! [`HostStack::interrupt`]); this worker owns the slow half. It blocks on
//! the semaphore, and on each wake scans every registered controller and
//! services the ones reporting a pending interrupt. Transfer completion
//! callbacks therefore always run on this thread, never in interrupt
//! context.

use crate::stack::HostStack;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Handle to the spawned interrupt worker thread
pub struct InterruptWorker {
    stack: Arc<HostStack>,
    handle: Option<JoinHandle<()>>,
}

impl InterruptWorker {
    /// Spawn the worker for a stack instance
    pub fn spawn(stack: Arc<HostStack>) -> Self {
        let worker_stack = Arc::clone(&stack);
        let handle = std::thread::Builder::new()
            .name("usb-irq-worker".into())
            .spawn(move || run(worker_stack))
            .ok();
        if handle.is_none() {
            warn!("failed to spawn interrupt worker thread");
        }
        Self {
            stack,
            handle,
        }
    }

    /// Stop the worker and wait for it to exit
    pub fn shutdown(mut self) {
        self.stack.stop_worker();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InterruptWorker {
    fn drop(&mut self) {
        self.stack.stop_worker();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(stack: Arc<HostStack>) {
    debug!("interrupt worker running");
    while stack.wait_interrupt() {
        for adapter in stack.adapters() {
            if adapter.interrupt_pending() {
                if let Err(err) = adapter.service_interrupt() {
                    warn!(controller = adapter.name(), %err, "interrupt service failed");
                }
                // The signalling path masks the controller; re-arm after servicing.
                if let Err(err) = adapter.enable_interrupts() {
                    warn!(controller = adapter.name(), %err, "interrupt re-enable failed");
                }
            }
        }
    }
    debug!("interrupt worker exiting");
}
