// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Victim selection.
//!
//! A strategy scores every running job; the highest score is preempted and
//! ties go to the most recently admitted job (highest id). Jobs using less
//! than the guaranteed memory per core are spared unless every job does.

use anyhow::anyhow;
use anyhow::Result;
use ordered_float::OrderedFloat;

use super::history::NORM_KB_PER_CORE;

/// What the controller knows about a job when picking a victim.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub job_id: u64,
    pub rss_kb: u64,
    pub vmem_kb: u64,
    pub cores: usize,
    pub requested_memory_kb: Option<u64>,
    pub derivative: f64,
}

impl Candidate {
    pub fn rss_per_core_kb(&self) -> u64 {
        self.rss_kb / self.cores.max(1) as u64
    }
}

pub trait VictimStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, job: &Candidate) -> f64;
}

/// Largest resident memory.
pub struct ByMemory;

impl VictimStrategy for ByMemory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn score(&self, job: &Candidate) -> f64 {
        job.rss_kb as f64
    }
}

/// Largest resident memory relative to what the job asked for. Jobs without
/// a declared request are measured against the per-core norm.
pub struct ByRelativeMemory;

impl VictimStrategy for ByRelativeMemory {
    fn name(&self) -> &'static str {
        "relative"
    }

    fn score(&self, job: &Candidate) -> f64 {
        let budget = match job.requested_memory_kb {
            Some(kb) if kb > 0 => kb as f64,
            _ => NORM_KB_PER_CORE * job.cores.max(1) as f64,
        };
        job.rss_kb as f64 / budget
    }
}

/// Fastest recent growth.
pub struct ByGrowth;

impl VictimStrategy for ByGrowth {
    fn name(&self) -> &'static str {
        "growth"
    }

    fn score(&self, job: &Candidate) -> f64 {
        job.derivative
    }
}

type StrategyCtor = fn() -> Box<dyn VictimStrategy>;

const STRATEGIES: &[(&str, StrategyCtor)] = &[
    ("memory", || Box::new(ByMemory) as Box<dyn VictimStrategy>),
    ("relative", || Box::new(ByRelativeMemory) as Box<dyn VictimStrategy>),
    ("growth", || Box::new(ByGrowth) as Box<dyn VictimStrategy>),
];

pub fn strategy_names() -> Vec<&'static str> {
    STRATEGIES.iter().map(|(name, _)| *name).collect()
}

pub fn strategy_from_name(name: &str) -> Result<Box<dyn VictimStrategy>> {
    STRATEGIES
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, ctor)| ctor())
        .ok_or_else(|| {
            anyhow!(
                "Unknown victim strategy '{}', expected one of {:?}",
                name,
                strategy_names()
            )
        })
}

pub fn pick_victim(
    strategy: &dyn VictimStrategy,
    jobs: &[Candidate],
    min_memory_per_core_kb: u64,
) -> Option<u64> {
    let eligible: Vec<&Candidate> = jobs
        .iter()
        .filter(|j| j.rss_per_core_kb() >= min_memory_per_core_kb)
        .collect();
    let pool: Vec<&Candidate> = if eligible.is_empty() {
        jobs.iter().collect()
    } else {
        eligible
    };

    pool.into_iter()
        .max_by_key(|j| (OrderedFloat(strategy.score(j)), j.job_id))
        .map(|j| j.job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(
        job_id: u64,
        rss_kb: u64,
        cores: usize,
        requested: Option<u64>,
        derivative: f64,
    ) -> Candidate {
        Candidate {
            job_id,
            rss_kb,
            vmem_kb: rss_kb * 2,
            cores,
            requested_memory_kb: requested,
            derivative,
        }
    }

    #[test]
    fn test_strategies_disagree() {
        let jobs = vec![
            job(1, 4_000_000, 2, Some(8_000_000), 0.1),
            job(2, 3_000_000, 1, Some(2_000_000), 0.0),
            job(3, 1_000_000, 1, None, 0.9),
        ];
        assert_eq!(pick_victim(&ByMemory, &jobs, 0), Some(1));
        assert_eq!(pick_victim(&ByRelativeMemory, &jobs, 0), Some(2));
        assert_eq!(pick_victim(&ByGrowth, &jobs, 0), Some(3));
    }

    #[test]
    fn test_ties_pick_latest_job() {
        let jobs = vec![job(4, 1_000, 1, None, 0.0), job(9, 1_000, 1, None, 0.0)];
        assert_eq!(pick_victim(&ByMemory, &jobs, 0), Some(9));
    }

    #[test]
    fn test_min_per_core_spares_small_jobs() {
        let jobs = vec![
            job(1, 900_000, 1, None, 5.0),
            job(2, 2_000_000, 1, None, 0.1),
        ];
        assert_eq!(pick_victim(&ByGrowth, &jobs, 1_000_000), Some(2));
        assert_eq!(pick_victim(&ByGrowth, &jobs, 3_000_000), Some(1));
        assert_eq!(pick_victim(&ByGrowth, &[], 0), None);
    }

    #[test]
    fn test_registry() {
        assert_eq!(strategy_from_name("growth").unwrap().name(), "growth");
        assert_eq!(strategy_from_name("Memory").unwrap().name(), "memory");
        assert!(strategy_from_name("random").is_err());
        assert_eq!(strategy_names(), vec!["memory", "relative", "growth"]);
    }
}
