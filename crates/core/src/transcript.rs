use crate::util::lock_unpoisoned;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const TRANSCRIPT_CAPACITY: usize = 64;

/// Shared, append-only view of recently transcribed speech. Clones share the
/// same buffer.
#[derive(Clone, Debug)]
pub struct TranscriptBuffer {
    fragments: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for TranscriptBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::with_capacity(TRANSCRIPT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            fragments: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Blank fragments are ignored.
    pub fn append(&self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if fragment.trim().is_empty() {
            return;
        }
        let mut fragments = lock_unpoisoned(&self.fragments, "transcript");
        if fragments.len() == self.capacity {
            fragments.pop_front();
        }
        fragments.push_back(fragment);
    }

    /// The newest `n` fragments, oldest first.
    pub fn trailing(&self, n: usize) -> Vec<String> {
        let fragments = lock_unpoisoned(&self.fragments, "transcript");
        let skip = fragments.len().saturating_sub(n);
        fragments.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.fragments, "transcript").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.fragments, "transcript").clear();
    }
}
