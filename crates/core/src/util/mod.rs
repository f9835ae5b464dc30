pub mod retry;
pub mod ring_buffer;

pub use retry::{retry_with_backoff, RetryConfig};
pub use ring_buffer::RingBuffer;

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the inner value if a previous holder panicked.
pub(crate) fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!(lock = what, "lock was poisoned; recovering and continuing");
            poisoned.into_inner()
        }
    }
}
