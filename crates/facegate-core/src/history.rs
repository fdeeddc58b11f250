//! Per-user rolling confidence statistics.
//!
//! Each key carries an attempt counter and an exponentially-weighted moving
//! average. Updates for one key are atomic; different keys never contend on
//! a shared lock.

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RollingStats {
    pub attempts: u64,
    pub average: f32,
}

pub struct HistoryStore {
    /// Weight of the newest sample in the moving average.
    weight: f32,
    entries: DashMap<String, RollingStats>,
}

impl HistoryStore {
    pub fn new(weight: f32) -> Self {
        Self {
            weight: weight.clamp(0.0, 1.0),
            entries: DashMap::new(),
        }
    }

    /// Fold one confidence sample into `key`'s statistics. The first sample
    /// seeds the average.
    pub fn record(&self, key: &str, confidence: f32) -> RollingStats {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(RollingStats { attempts: 0, average: confidence });
        if entry.attempts > 0 {
            entry.average = entry.average * (1.0 - self.weight) + confidence * self.weight;
        }
        entry.attempts += 1;
        *entry
    }

    pub fn get(&self, key: &str) -> Option<RollingStats> {
        self.entries.get(key).map(|e| *e)
    }

    pub fn reset(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
