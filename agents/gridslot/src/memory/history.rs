// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Memory a grid job is expected to use per core. Growth is expressed as a
/// fraction of it.
pub const NORM_KB_PER_CORE: f64 = 2_000_000.0;

/// The previous derivative is divided by this before being blended in.
pub const GROWTH_DECAY: f64 = 3.0;

/// Two consecutive virtual memory readings of a job and its smoothed growth.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MemorySample {
    pub past_kb: u64,
    pub current_kb: u64,
    pub derivative: f64,
}

/// Smoothed growth rate after a job went from @past_kb to @current_kb.
pub fn growth_derivative(past_kb: u64, current_kb: u64, previous: f64, cores: usize) -> f64 {
    let delta = current_kb as f64 - past_kb as f64;
    delta / (NORM_KB_PER_CORE * cores.max(1) as f64) + previous / GROWTH_DECAY
}

/// Per job memory history, owned by the memory controller.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    samples: BTreeMap<u64, MemorySample>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new reading. The first reading of a job has no growth.
    pub fn observe(&mut self, job_id: u64, vmem_kb: u64, cores: usize) -> MemorySample {
        let sample = match self.samples.get(&job_id) {
            Some(prev) => MemorySample {
                past_kb: prev.current_kb,
                current_kb: vmem_kb,
                derivative: growth_derivative(prev.current_kb, vmem_kb, prev.derivative, cores),
            },
            None => MemorySample {
                past_kb: vmem_kb,
                current_kb: vmem_kb,
                derivative: 0.0,
            },
        };
        self.samples.insert(job_id, sample);
        sample
    }

    /// Forget every job not in @active.
    pub fn retain(&mut self, active: &BTreeSet<u64>) {
        self.samples.retain(|job_id, _| active.contains(job_id));
    }

    pub fn get(&self, job_id: u64) -> Option<&MemorySample> {
        self.samples.get(&job_id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivative_is_deterministic() {
        let a = growth_derivative(1_000_000, 3_000_000, 0.3, 2);
        let b = growth_derivative(1_000_000, 3_000_000, 0.3, 2);
        assert_eq!(a, b);
        assert!((a - 0.6).abs() < 1e-9);
        assert!((growth_derivative(0, 0, 0.9, 0) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_history_shifts_readings() {
        let mut history = MemoryHistory::new();
        let first = history.observe(7, 1_000_000, 1);
        assert_eq!(first.past_kb, 1_000_000);
        assert_eq!(first.derivative, 0.0);

        let second = history.observe(7, 3_000_000, 1);
        assert_eq!(second.past_kb, 1_000_000);
        assert_eq!(second.current_kb, 3_000_000);
        assert!((second.derivative - 1.0).abs() < 1e-9);

        let third = history.observe(7, 3_000_000, 1);
        assert!((third.derivative - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_jobs_do_not_leak_into_each_other() {
        let mut history = MemoryHistory::new();
        history.observe(1, 100, 1);
        history.observe(1, 5_000_000, 1);
        let other = history.observe(2, 100, 1);
        assert_eq!(other.derivative, 0.0);

        history.retain(&BTreeSet::from([2]));
        assert!(history.get(1).is_none());
        assert_eq!(history.len(), 1);

        let again = history.observe(1, 5_000_000, 1);
        assert_eq!(again.derivative, 0.0);
    }
}
