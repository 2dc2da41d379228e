use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Source of short identifiers used for default deployment names and
/// workspace directories.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Five-digit random tokens. Collisions are possible and are not retried.
#[derive(Debug, Default)]
pub struct RandomIdGenerator;

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> String {
        rand::rng().random_range(10_000..100_000u32).to_string()
    }
}

/// Deterministic generator for tests: yields `start`, `start + 1`, ...
#[derive(Debug)]
pub struct SequenceIdGenerator {
    next: AtomicU64,
}

impl SequenceIdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}
