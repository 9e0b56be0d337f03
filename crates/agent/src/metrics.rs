// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime resource sampling over the prometheus text exposition format.
//!
//! The runtime exposes its metrics on the local editor port; samples are
//! folded into broker status publishes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// One resource sample extracted from the runtime metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    /// Resident set size in megabytes.
    pub memory_mb: f64,
    /// CPU utilisation percent since the previous sample.
    pub cpu_percent: f64,
    /// Event-loop lag, milliseconds.
    pub eventloop_lag_mean_ms: f64,
    pub eventloop_lag_p99_ms: f64,
    pub messages_total: u64,
    pub receive_events_total: u64,
    pub send_events_total: u64,
}

/// Parse prometheus text format into per-family sums.
///
/// Comment and blank lines are skipped; labelled series are summed under
/// the bare family name. Unparseable values are ignored.
pub fn parse_metrics(text: &str) -> HashMap<String, f64> {
    let mut families: HashMap<String, f64> = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name_part, rest)) = split_series(line) else {
            continue;
        };
        // Value is the first whitespace-separated field after the name
        // (an optional timestamp may follow it).
        let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok())
        else {
            continue;
        };
        *families.entry(name_part.to_owned()).or_default() += value;
    }
    families
}

/// Split a sample line into (family name, remainder after name/labels).
fn split_series(line: &str) -> Option<(&str, &str)> {
    if let Some(brace) = line.find('{') {
        let name = &line[..brace];
        let close = line[brace..].find('}')? + brace;
        Some((name, line[close + 1..].trim_start()))
    } else {
        let space = line.find(char::is_whitespace)?;
        Some((&line[..space], line[space..].trim_start()))
    }
}

/// Stateful extractor: tracks the previous cumulative CPU reading so a
/// percentage can be derived from the delta.
#[derive(Debug, Default)]
pub struct ResourceSampler {
    last_cpu: Option<(Instant, f64)>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a scraped metrics body into a sample.
    pub fn extract(&mut self, text: &str) -> MetricsSample {
        let at = Instant::now();
        self.extract_at(text, at)
    }

    fn extract_at(&mut self, text: &str, at: Instant) -> MetricsSample {
        let families = parse_metrics(text);
        let get = |name: &str| families.get(name).copied().unwrap_or(0.0);

        let cpu_seconds = get("process_cpu_seconds_total");
        let cpu_percent = match self.last_cpu {
            Some((prev_at, prev_seconds)) => {
                let elapsed = at.saturating_duration_since(prev_at).as_secs_f64();
                let delta = cpu_seconds - prev_seconds;
                // A negative delta means the runtime restarted and the
                // counter reset.
                if elapsed > 0.0 && delta >= 0.0 {
                    (delta / elapsed * 100.0 * 100.0).round() / 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((at, cpu_seconds));

        MetricsSample {
            memory_mb: (get("process_resident_memory_bytes") / (1024.0 * 1024.0) * 100.0).round()
                / 100.0,
            cpu_percent,
            eventloop_lag_mean_ms: get("nodejs_eventloop_lag_mean_seconds") * 1000.0,
            eventloop_lag_p99_ms: get("nodejs_eventloop_lag_p99_seconds") * 1000.0,
            messages_total: get("nodered_messages_total") as u64,
            receive_events_total: get("node_receive_events_total") as u64,
            send_events_total: get("node_send_events_total") as u64,
        }
    }

    /// Forget the previous CPU reading (used when the runtime restarts).
    pub fn reset(&mut self) {
        self.last_cpu = None;
    }
}

/// Scraper bound to the local runtime metrics endpoint.
pub struct MetricsScraper {
    client: reqwest::Client,
    url: String,
    sampler: ResourceSampler,
}

impl MetricsScraper {
    pub fn new(port: u16, https: bool) -> Self {
        let proto = if https { "https" } else { "http" };
        crate::run::ensure_crypto();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: format!("{proto}://127.0.0.1:{port}/metrics"),
            sampler: ResourceSampler::new(),
        }
    }

    /// Scrape and extract one sample; `None` when the runtime is not
    /// reachable (not running yet, or mid-restart).
    pub async fn sample(&mut self) -> Option<MetricsSample> {
        let resp = self.client.get(&self.url).send().await.ok()?;
        let text = resp.error_for_status().ok()?.text().await.ok()?;
        Some(self.sampler.extract(&text))
    }

    pub fn reset(&mut self) {
        self.sampler.reset();
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
