//! Identifier generation for sessions, streams and generated resources.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of unique identifiers.
pub trait IdGenerator: Send + Sync + 'static {
    /// A new identifier, never returned before by this generator.
    fn next_id(&self) -> String;

    /// A resource name for clients that did not request one.
    fn resource_id(&self) -> String {
        format!("plover-{}", self.next_id())
    }
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn resource_id(&self) -> String {
        format!("plover-{}", &uuid::Uuid::new_v4().to_string()[..8])
    }
}

/// Predictable identifiers (`prefix-1`, `prefix-2`, ...), for tests and tooling.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
