//! Open streams, by name and by directory slot.

use crate::waiters::TailWaitQueue;
use dashmap::DashMap;
use std::sync::Arc;
use topiclog_durability::StreamLog;

/// A stream's log state and its parked reads.
#[derive(Debug)]
pub(crate) struct StreamHandle {
    pub log: Arc<StreamLog>,
    pub waiters: TailWaitQueue,
}

#[derive(Debug, Default)]
pub(crate) struct StreamRegistry {
    by_name: DashMap<String, Arc<StreamHandle>>,
    by_slot: DashMap<u32, Arc<StreamHandle>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<StreamHandle>> {
        self.by_name.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn by_slot(&self, slot: u32) -> Option<Arc<StreamHandle>> {
        self.by_slot.get(&slot).map(|h| Arc::clone(h.value()))
    }

    /// Register `log` unless its name is already present; returns the
    /// handle that ends up registered.
    pub fn insert(&self, log: StreamLog) -> Arc<StreamHandle> {
        let slot = log.slot();
        let handle = self
            .by_name
            .entry(log.name().to_string())
            .or_insert_with(|| {
                Arc::new(StreamHandle {
                    log: Arc::new(log),
                    waiters: TailWaitQueue::new(),
                })
            })
            .value()
            .clone();
        self.by_slot
            .entry(slot)
            .or_insert_with(|| Arc::clone(&handle));
        handle
    }

    /// Stream names in directory slot order.
    pub fn names(&self) -> Vec<String> {
        let mut named: Vec<(u32, String)> = self
            .by_slot
            .iter()
            .map(|e| (*e.key(), e.value().log.name().to_string()))
            .collect();
        named.sort();
        named.into_iter().map(|(_, name)| name).collect()
    }

    pub fn handles(&self) -> Vec<Arc<StreamHandle>> {
        self.by_slot.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}
