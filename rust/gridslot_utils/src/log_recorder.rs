// Copyright (c) Netflix, Inc.
// Author: Jose Fernandez

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use log::info;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics::Key;
use metrics::KeyName;
use metrics::Metadata;
use metrics::Recorder;
use metrics::SharedString;
use metrics::Unit;
use metrics_util::registry::AtomicStorage;
use metrics_util::registry::Registry;

/// A builder for creating a new instance of `LogRecorder` and installing it as
/// the global recorder.
///
/// Example:
///
/// ```no_run
/// use std::time::Duration;
/// use gridslot_utils::LogRecorderBuilder;
///
/// LogRecorderBuilder::new()
///     .with_reporting_interval(Duration::from_secs(30))
///     .install()
///     .unwrap();
/// ```
pub struct LogRecorderBuilder {
    reporting_interval: Duration,
}

impl Default for LogRecorderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRecorderBuilder {
    pub fn new() -> LogRecorderBuilder {
        Self {
            reporting_interval: Duration::from_secs(30),
        }
    }

    /// Sets the interval at which the recorder will log the metrics.
    pub fn with_reporting_interval(mut self, interval: Duration) -> Self {
        self.reporting_interval = interval;
        self
    }

    /// Installs the log recorder as the global recorder.
    pub fn install(self) -> Result<()> {
        let recorder = LogRecorder {
            registry: Arc::new(Registry::<Key, AtomicStorage>::atomic()),
        };
        recorder.start(self.reporting_interval);
        metrics::set_global_recorder(recorder)?;
        Ok(())
    }
}

/// A metrics recorder that logs slot gauges and counters.
///
/// Gauges are logged as their current value, counters as their total and the
/// rate since the previous report. Histograms are not used by the governor
/// and are dropped.
struct LogRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Recorder for LogRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

impl LogRecorder {
    fn start(&self, reporting_interval: Duration) {
        let registry = self.registry.clone();

        thread::spawn(move || {
            let mut prev_counters: HashMap<Key, u64> = HashMap::new();
            let mut prev_instant = Instant::now();

            loop {
                thread::sleep(reporting_interval);
                let period_secs = prev_instant.elapsed().as_secs_f64();
                prev_instant = Instant::now();

                let line = format_gauges(&registry);
                if !line.is_empty() {
                    info!("slot: {}", line);
                }
                let line = format_counters(&registry, &mut prev_counters, period_secs);
                if !line.is_empty() {
                    info!("events: {}", line);
                }
            }
        });
    }
}

fn key_label(key: &Key) -> String {
    let mut name = key.name().to_string();
    for label in key.labels() {
        name.push_str(&format!("[{}={}]", label.key(), label.value()));
    }
    name
}

fn format_gauges(registry: &Registry<Key, AtomicStorage>) -> String {
    let values: BTreeMap<String, f64> = registry
        .get_gauge_handles()
        .iter()
        .map(|(key, gauge)| (key_label(key), f64::from_bits(gauge.load(Relaxed))))
        .collect();

    values
        .iter()
        .map(|(name, value)| format!("{}={:.0}", name, value))
        .collect::<Vec<String>>()
        .join(" ")
}

fn format_counters(
    registry: &Registry<Key, AtomicStorage>,
    prev_counters: &mut HashMap<Key, u64>,
    period_secs: f64,
) -> String {
    let mut values: BTreeMap<String, (u64, f64)> = BTreeMap::new();
    for (key, counter) in registry.get_counter_handles() {
        let value = counter.load(Relaxed);
        let prev = prev_counters.insert(key.clone(), value).unwrap_or(0);
        let rate = if period_secs > 0.0 {
            value.saturating_sub(prev) as f64 / period_secs
        } else {
            0.0
        };
        values.insert(key_label(&key), (value, rate));
    }

    values
        .iter()
        .map(|(name, (value, rate))| format!("{}={} [{:.2}/s]", name, value, rate))
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_gauges_and_counters() {
        let registry = Registry::<Key, AtomicStorage>::atomic();
        let gauge_key = Key::from_name("free_cpus");
        registry
            .get_or_create_gauge(&gauge_key, |g| g.clone())
            .store(6.0f64.to_bits(), Relaxed);
        let counter_key = Key::from_name("admissions_total");
        registry
            .get_or_create_counter(&counter_key, |c| c.clone())
            .store(10, Relaxed);

        assert_eq!(format_gauges(&registry), "free_cpus=6");

        let mut prev = HashMap::new();
        assert_eq!(
            format_counters(&registry, &mut prev, 2.0),
            "admissions_total=10 [5.00/s]"
        );
        assert_eq!(
            format_counters(&registry, &mut prev, 2.0),
            "admissions_total=10 [0.00/s]"
        );
    }
}
