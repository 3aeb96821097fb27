//! Binary lock built on an eventfd
//!
//! The counter holds 1 while the lock is free. Acquiring reads (and so
//! zeroes) it, blocking while another holder has it; releasing writes the
//! saved value back. A duplicate of the descriptor is handed to the agent
//! with the connection, so the agent and the broker serialize their use of
//! the live socket through the same counter.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tracing::error;

use crate::sys;

/// Cross-process write lock over an eventfd
#[derive(Debug)]
pub struct FdLock {
    fd: OwnedFd,
}

impl FdLock {
    /// Create an unlocked lock
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            fd: sys::eventfd(1)?,
        })
    }

    /// Block until the lock is held
    pub fn acquire(&self) -> io::Result<FdLockGuard<'_>> {
        let value = sys::eventfd_read(self.fd.as_raw_fd())?;
        Ok(FdLockGuard { lock: self, value })
    }

    /// Duplicate the lock descriptor for another holder
    pub fn duplicate(&self) -> io::Result<OwnedFd> {
        sys::dup_cloexec(self.fd.as_raw_fd())
    }
}

impl AsRawFd for FdLock {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct FdLockGuard<'a> {
    lock: &'a FdLock,
    value: u64,
}

impl Drop for FdLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = sys::eventfd_write(self.lock.fd.as_raw_fd(), self.value) {
            error!(error = %e, "Failed to release write lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_release_reacquire() {
        let lock = FdLock::new().unwrap();
        {
            let _guard = lock.acquire().unwrap();
        }
        let _guard = lock.acquire().unwrap();
    }

    #[test]
    fn test_second_acquire_blocks_until_release() {
        let lock = Arc::new(FdLock::new().unwrap());
        let released = Arc::new(AtomicBool::new(false));

        let guard = lock.acquire().unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let _guard = lock.acquire().unwrap();
                assert!(released.load(Ordering::SeqCst));
            })
        };

        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(guard);

        waiter.join().unwrap();
    }

    #[test]
    fn test_duplicate_shares_the_counter() {
        let lock = FdLock::new().unwrap();
        let dup = lock.duplicate().unwrap();

        // Take the lock through the duplicate, as the agent would
        let value = sys::eventfd_read(dup.as_raw_fd()).unwrap();
        assert_eq!(value, 1);
        sys::eventfd_write(dup.as_raw_fd(), value).unwrap();

        let _guard = lock.acquire().unwrap();
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lock = Arc::new(FdLock::new().unwrap());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = lock.acquire().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
