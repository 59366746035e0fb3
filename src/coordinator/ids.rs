//! Task identifiers

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Issues `task-{counter}-{random}` ids, unique per coordinator instance
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    counter: AtomicU64,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let random = Uuid::new_v4().simple().to_string();
        format!("task-{}-{}", n, &random[..8])
    }

    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}
