// Host event aggregation: occurrence counters plus timestamped value/string logs.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use super::{fmt_real, push_tuple};

/// Occurrence count per event id since the last drain.
#[derive(Default)]
pub struct EventCounter {
    counts: Mutex<HashMap<i32, u64>>,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, id: i32) {
        *self.counts.lock().entry(id).or_insert(0) += 1;
    }

    pub fn count(&self, id: i32) -> u64 {
        self.counts.lock().get(&id).copied().unwrap_or(0)
    }

    /// Format every `id#count@` pair and clear the counters.
    pub fn drain_to_string(&self) -> String {
        let drained = std::mem::take(&mut *self.counts.lock());
        let mut pairs: Vec<_> = drained.into_iter().collect();
        pairs.sort_unstable_by_key(|(id, _)| *id);

        let mut out = String::new();
        for (id, count) in pairs {
            push_tuple(&mut out, &[&id, &count]);
        }
        out
    }
}

/// Values carried by an [`EventLog`].
pub trait LogValue: Send {
    fn render(&self) -> String;
}

impl LogValue for f64 {
    fn render(&self) -> String {
        fmt_real(*self)
    }
}

impl LogValue for String {
    fn render(&self) -> String {
        self.clone()
    }
}

struct LogEntry<V> {
    id: i32,
    elapsed_secs: u64,
    value: V,
}

/// Append-only `(id, elapsed seconds, value)` log, drained in insertion order.
pub struct EventLog<V> {
    started: Instant,
    entries: Mutex<Vec<LogEntry<V>>>,
}

impl<V: LogValue> EventLog<V> {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, id: i32, value: V) {
        let elapsed_secs = self.started.elapsed().as_secs();
        self.entries.lock().push(LogEntry {
            id,
            elapsed_secs,
            value,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Format every `id#elapsed#value@` entry and clear the log.
    pub fn drain_to_string(&self) -> String {
        let drained = std::mem::take(&mut *self.entries.lock());
        let mut out = String::new();
        for entry in drained {
            push_tuple(&mut out, &[&entry.id, &entry.elapsed_secs, &entry.value.render()]);
        }
        out
    }
}

/// The three host-event aggregators of one session, sharing its start instant.
pub struct EventStats {
    pub counts: EventCounter,
    pub values: EventLog<f64>,
    pub strings: EventLog<String>,
}

impl EventStats {
    pub fn new() -> Self {
        let started = Instant::now();
        Self {
            counts: EventCounter::new(),
            values: EventLog::new(started),
            strings: EventLog::new(started),
        }
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}
