// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn assigns_strictly_increasing_timestamps() {
    let ring = LogRing::new(16);
    let a = ring.add(LogEntry::agent("info", "one"));
    let b = ring.add(LogEntry::agent("info", "two"));
    let c = ring.add(LogEntry::agent("info", "three"));
    assert!(a.ts < b.ts, "{} !< {}", a.ts, b.ts);
    assert!(b.ts < c.ts, "{} !< {}", b.ts, c.ts);
}

#[test]
fn same_millisecond_bumps_counter() {
    let ring = LogRing::new(16);
    let ms = 1_700_000_000_000u64;
    let a = ring.add(LogEntry { ts: Some(ms * 10_000), ..LogEntry::agent("info", "a") });
    let b = ring.add(LogEntry { ts: Some(ms * 10_000), ..LogEntry::agent("info", "b") });
    assert_eq!(a.ts, ms * 10_000);
    assert_eq!(b.ts, ms * 10_000 + 1);
}

#[test]
fn new_millisecond_resets_counter() {
    let ring = LogRing::new(16);
    let ms = 1_700_000_000_000u64;
    ring.add(LogEntry { ts: Some(ms * 10_000), ..LogEntry::agent("info", "a") });
    ring.add(LogEntry { ts: Some(ms * 10_000), ..LogEntry::agent("info", "b") });
    let c = ring.add(LogEntry { ts: Some((ms + 1) * 10_000), ..LogEntry::agent("info", "c") });
    assert_eq!(c.ts, (ms + 1) * 10_000);
}

#[test]
fn wraps_at_capacity() {
    let ring = LogRing::new(3);
    for i in 0..5 {
        ring.add(LogEntry::agent("info", format!("m{i}")));
    }
    let snap = ring.snapshot();
    assert_eq!(snap.len(), 3);
    let msgs: Vec<&str> = snap.iter().map(|r| r.msg.as_str()).collect();
    assert_eq!(msgs, vec!["m2", "m3", "m4"]);
}

#[test]
fn snapshot_is_oldest_to_newest() {
    let ring = LogRing::new(8);
    ring.add(LogEntry::agent("info", "first"));
    ring.add(LogEntry::runtime("warn", "second"));
    let snap = ring.snapshot();
    assert_eq!(snap[0].msg, "first");
    assert_eq!(snap[0].src, LogSource::Agent);
    assert_eq!(snap[1].msg, "second");
    assert_eq!(snap[1].src, LogSource::Runtime);
    assert!(snap[0].ts < snap[1].ts);
}

#[test]
fn broadcasts_additions() {
    let ring = LogRing::new(8);
    let mut rx = ring.subscribe();
    ring.add(LogEntry::agent("info", "live"));
    let got = rx.try_recv().ok();
    assert_eq!(got.map(|r| r.msg), Some("live".to_owned()));
}
