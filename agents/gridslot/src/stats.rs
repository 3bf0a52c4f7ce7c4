// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;
use serde::Deserialize;
use serde::Serialize;

/// Point in time view of the slot pool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotGauges {
    pub free_cores: usize,
    pub free_disk_mb: u64,
    pub ttl_remaining_secs: u64,
    pub active_workers: usize,
    pub consecutive_failures: u32,
}

impl SlotGauges {
    pub fn format(&self) -> String {
        format!(
            "free_cores={} free_disk={}MB ttl={}s active={} failures={}",
            self.free_cores,
            self.free_disk_mb,
            self.ttl_remaining_secs,
            self.active_workers,
            self.consecutive_failures
        )
    }
}

pub struct Metrics {
    admissions: Counter,
    no_match: Counter,
    payload_failures: Counter,
    payload_successes: Counter,
    preempted: Counter,
    expired: Counter,
    free_cores: Gauge,
    free_disk_mb: Gauge,
    ttl_remaining: Gauge,
    active_workers: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            admissions: counter!("admissions_total"),
            no_match: counter!("workers_finished_total", "outcome" => "no_match"),
            payload_failures: counter!("workers_finished_total", "outcome" => "failed"),
            payload_successes: counter!("workers_finished_total", "outcome" => "success"),
            preempted: counter!("workers_finished_total", "outcome" => "preempted"),
            expired: counter!("workers_finished_total", "outcome" => "expired"),

            free_cores: gauge!("free_cores"),
            free_disk_mb: gauge!("free_disk_mb"),
            ttl_remaining: gauge!("ttl_remaining_secs"),
            active_workers: gauge!("active_workers"),
        }
    }

    pub fn admitted(&self) {
        self.admissions.increment(1);
    }

    pub fn no_match(&self) {
        self.no_match.increment(1);
    }

    pub fn payload_failed(&self) {
        self.payload_failures.increment(1);
    }

    pub fn payload_succeeded(&self) {
        self.payload_successes.increment(1);
    }

    pub fn preempted(&self) {
        self.preempted.increment(1);
    }

    pub fn expired(&self) {
        self.expired.increment(1);
    }

    pub fn report(&self, gauges: &SlotGauges) {
        self.free_cores.set(gauges.free_cores as f64);
        self.free_disk_mb.set(gauges.free_disk_mb as f64);
        self.ttl_remaining.set(gauges.ttl_remaining_secs as f64);
        self.active_workers.set(gauges.active_workers as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
