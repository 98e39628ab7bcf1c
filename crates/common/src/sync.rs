//! Blocking synchronization primitives
//!
//! The stack suspends by blocking on semaphores and mutexes, never by
//! async/await. `Semaphore` is a counting semaphore whose acquisitions take
//! a caller-selected [`SuspendPolicy`]: no-wait, timed, or infinite. A timed
//! out acquisition is a transient condition reported to the caller, never
//! escalated.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// How long an acquisition may suspend the calling task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPolicy {
    /// Fail immediately if the resource is unavailable
    NoWait,
    /// Suspend up to the given duration
    Timed(Duration),
    /// Suspend until the resource becomes available
    Infinite,
}

/// Acquisition failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The resource was busy and the policy was `NoWait`
    #[error("resource unavailable")]
    Unavailable,
    /// The timed suspension expired
    #[error("acquisition timed out")]
    TimedOut,
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// A poisoned device or stack lock must not wedge the whole stack; the
/// protected state is kept consistent by the rollback ladders of the
/// operations themselves.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting semaphore with blocking acquisition
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `count` permits
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Take one permit according to the suspend policy
    pub fn acquire(&self, policy: SuspendPolicy) -> Result<(), WaitError> {
        let mut count = lock(&self.count);

        match policy {
            SuspendPolicy::NoWait => {
                if *count == 0 {
                    return Err(WaitError::Unavailable);
                }
            }
            SuspendPolicy::Timed(timeout) => {
                let (guard, result) = self
                    .available
                    .wait_timeout_while(count, timeout, |c| *c == 0)
                    .unwrap_or_else(PoisonError::into_inner);
                count = guard;
                if result.timed_out() && *count == 0 {
                    return Err(WaitError::TimedOut);
                }
            }
            SuspendPolicy::Infinite => {
                while *count == 0 {
                    count = self
                        .available
                        .wait(count)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        *count -= 1;
        Ok(())
    }

    /// Return one permit, waking a suspended task if any
    pub fn release(&self) {
        let mut count = lock(&self.count);
        *count += 1;
        drop(count);
        self.available.notify_one();
    }

    /// Force the permit count to `count`, discarding pending releases.
    ///
    /// Used by the control-transfer timeout path to drain a completion
    /// signal that may race with the timeout.
    pub fn reset(&self, count: usize) {
        let mut current = lock(&self.count);
        *current = count;
        drop(current);
        self.available.notify_all();
    }

    /// Current permit count (diagnostic)
    pub fn permits(&self) -> usize {
        *lock(&self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_no_wait_fails_when_empty() {
        let sem = Semaphore::new(0);
        assert_eq!(
            sem.acquire(SuspendPolicy::NoWait),
            Err(WaitError::Unavailable)
        );
        sem.release();
        assert_eq!(sem.acquire(SuspendPolicy::NoWait), Ok(()));
    }

    #[test]
    fn test_timed_acquire_times_out() {
        let sem = Semaphore::new(0);
        let err = sem
            .acquire(SuspendPolicy::Timed(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err, WaitError::TimedOut);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire(SuspendPolicy::Infinite))
        };
        sem.release();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_reset_discards_permits() {
        let sem = Semaphore::new(3);
        sem.reset(0);
        assert_eq!(
            sem.acquire(SuspendPolicy::NoWait),
            Err(WaitError::Unavailable)
        );
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(5));
        let poisoner = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let _guard = mutex.lock().unwrap();
                panic!("poison it");
            })
        };
        let _ = poisoner.join();
        assert_eq!(*lock(&mutex), 5);
    }
}
