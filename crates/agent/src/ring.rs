// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded in-memory ring of log records with strictly ordered timestamps.
//!
//! Records carry a composite timestamp: the epoch millisecond scaled by
//! 10,000 plus a 4-digit counter that increments for records produced in
//! the same millisecond. Two records added in sequence therefore always
//! compare `r1.ts < r2.ts`, even under bursts.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Where a log record originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Agent,
    Runtime,
}

/// A single buffered log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Composite timestamp: `epoch_ms * 10_000 + intra_ms_counter`.
    pub ts: u64,
    pub level: String,
    pub msg: String,
    pub src: LogSource,
}

/// A record submitted to the ring; the timestamp is optional and assigned
/// on insertion when absent.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub ts: Option<u64>,
    pub level: String,
    pub msg: String,
    pub src: LogSource,
}

impl LogEntry {
    pub fn agent(level: &str, msg: impl Into<String>) -> Self {
        Self { ts: None, level: level.to_owned(), msg: msg.into(), src: LogSource::Agent }
    }

    pub fn runtime(level: &str, msg: impl Into<String>) -> Self {
        Self { ts: None, level: level.to_owned(), msg: msg.into(), src: LogSource::Runtime }
    }
}

struct RingInner {
    buf: VecDeque<LogRecord>,
    capacity: usize,
    last_ms: u64,
    counter: u64,
}

/// Fixed-capacity ring of log records.
///
/// Appends may come from any task; the critical section is short and
/// guarded by a mutex. Live additions are also fanned out on a broadcast
/// channel so the broker client can stream them when log shipping is on.
pub struct LogRing {
    inner: Mutex<RingInner>,
    tx: broadcast::Sender<LogRecord>,
}

/// Records at this level are echoed to the process console in addition to
/// being buffered.
pub const SYSTEM_LEVEL: &str = "system";

const COUNTER_SCALE: u64 = 10_000;

impl LogRing {
    /// Create a ring holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(RingInner {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                last_ms: 0,
                counter: 0,
            }),
            tx,
        }
    }

    /// Append a record, assigning a composite timestamp.
    ///
    /// Returns the stored record (with its final timestamp).
    pub fn add(&self, entry: LogEntry) -> LogRecord {
        let record = {
            let mut inner = self.inner.lock();

            let ms = entry.ts.map(|t| t / COUNTER_SCALE).unwrap_or_else(epoch_ms);
            if ms == inner.last_ms {
                inner.counter += 1;
            } else {
                inner.last_ms = ms;
                inner.counter = 0;
            }
            let ts = ms * COUNTER_SCALE + inner.counter.min(COUNTER_SCALE - 1);

            let record =
                LogRecord { ts, level: entry.level, msg: entry.msg, src: entry.src };
            if inner.buf.len() == inner.capacity {
                inner.buf.pop_front();
            }
            inner.buf.push_back(record.clone());
            record
        };

        if record.level == SYSTEM_LEVEL {
            println!("[{}] {}", record.ts, record.msg);
        }

        let _ = self.tx.send(record.clone());
        record
    }

    /// Copy out the buffered records, oldest first.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.inner.lock().buf.iter().cloned().collect()
    }

    /// Subscribe to live additions.
    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.tx.subscribe()
    }
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "ring_tests.rs"]
mod tests;
