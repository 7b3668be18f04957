//! Bounded history of terminal output for late joiners.
//!
//! Chunks are kept whole: eviction pops from the front until the total size fits the
//! cap, so the snapshot handed to a new client always starts on a chunk boundary.

use std::collections::VecDeque;

/// Default total-byte cap for a session's history.
pub const DEFAULT_REPLAY_CAP: usize = 500_000;

pub struct ReplayBuffer {
    chunks: VecDeque<Vec<u8>>,
    total: usize,
    cap: usize,
}

impl ReplayBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            cap,
        }
    }

    /// Append a chunk and evict from the front until the cap holds again.
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push_back(chunk);

        while self.total > self.cap {
            match self.chunks.pop_front() {
                Some(evicted) => self.total -= evicted.len(),
                None => break,
            }
        }
    }

    /// Concatenated contents, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn len_bytes(&self) -> usize {
        self.total
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAP)
    }
}
