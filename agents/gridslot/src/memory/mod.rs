// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Memory preemption controller
//!
//! A single background thread samples the slot's memory every few seconds.
//! When the slot gets within a safety margin of one of its limits and at
//! least two jobs share it, one job is picked as the victim. The controller
//! does not kill anything itself: it flags the victim through `ActiveJobs`,
//! whose worker terminates its own payload, and it records the decision with
//! the accounting collaborator. No new victim is chosen until the previous
//! one has left the slot.
//!
//! Limits are resolved once at start-up, see `limits::resolve_policy`.

pub mod expr;
pub mod history;
pub mod limits;
pub mod tunables;
pub mod victim;

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use gridslot_utils::CgroupLimits;
use gridslot_utils::CgroupTopology;
use gridslot_utils::CgroupVersion;
use gridslot_utils::MemInfo;
use log::debug;
use log::info;
use log::trace;
use log::warn;
use metrics::counter;
use serde::Deserialize;
use serde::Serialize;

use crate::batch::batch_system_from_name;
use crate::collab::Accounting;
use crate::config::SiteConfig;
use crate::sleep_unless_shutdown;
use history::MemoryHistory;
pub use limits::LimitPolicy;
pub use limits::LimitType;
use tunables::HttpTunables;
use tunables::Tunables;
use victim::Candidate;
use victim::VictimStrategy;

/// Memory figures a job worker reports about its payload.
#[derive(Clone, Debug, PartialEq)]
pub struct JobReading {
    pub job_id: u64,
    pub rss_kb: u64,
    pub vmem_kb: u64,
    pub cores: usize,
    pub requested_memory_kb: Option<u64>,
}

/// The running jobs, as seen by the controller.
pub trait ActiveJobs: Send + Sync {
    fn readings(&self) -> Vec<JobReading>;

    /// Ask the victim's worker to terminate its payload.
    fn flag(&self, decision: &PreemptionDecision);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotUsage {
    pub rss_kb: u64,
    pub swap_kb: Option<u64>,
    pub combined_kb: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreemptionDecision {
    pub victim: u64,
    pub usage: SlotUsage,
    pub limit_type: LimitType,
    pub bound_kb: u64,
}

/// What the accounting collaborator stores about a preemption.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreemptionRecord {
    pub timestamp: u64,
    pub hostname: String,
    pub victim: u64,
    pub slot_rss_kb: u64,
    pub slot_swap_kb: Option<u64>,
    pub slot_combined_kb: Option<u64>,
    pub limit_type: LimitType,
    pub bound_kb: u64,
    pub victim_rss_kb: u64,
    pub per_core_kb: u64,
    pub growth: f64,
    pub round: u64,
    pub strategy: String,
}

pub struct ControllerSettings {
    pub cgroup: Option<CgroupTopology>,
    pub policy: LimitPolicy,
    pub tunables: Tunables,
    pub strategy: Box<dyn VictimStrategy>,
    /// Total cores of the slot. Safety margins are per core.
    pub slot_cores: usize,
    pub meminfo_path: PathBuf,
    pub hostname: String,
}

pub struct MemoryController {
    cgroup: Option<CgroupTopology>,
    policy: LimitPolicy,
    tunables: Tunables,
    strategy: Box<dyn VictimStrategy>,
    slot_cores: usize,
    meminfo_path: PathBuf,
    hostname: String,
    history: MemoryHistory,
    in_flight: Option<u64>,
    breach_logged: bool,
    disabled_logged: bool,
    round: u64,
    jobs: Arc<dyn ActiveJobs>,
    accounting: Arc<dyn Accounting>,
}

impl MemoryController {
    pub fn new(
        settings: ControllerSettings,
        jobs: Arc<dyn ActiveJobs>,
        accounting: Arc<dyn Accounting>,
    ) -> Self {
        Self {
            cgroup: settings.cgroup,
            policy: settings.policy,
            tunables: settings.tunables,
            strategy: settings.strategy,
            slot_cores: settings.slot_cores,
            meminfo_path: settings.meminfo_path,
            hostname: settings.hostname,
            history: MemoryHistory::new(),
            in_flight: None,
            breach_logged: false,
            disabled_logged: false,
            round: 0,
            jobs,
            accounting,
        }
    }

    /// Resolve cgroup, limits and tunables of the running host.
    pub fn from_config(
        config: &SiteConfig,
        slot_cores: usize,
        jobs: Arc<dyn ActiveJobs>,
        accounting: Arc<dyn Accounting>,
    ) -> Result<Self> {
        let mem = &config.memory;
        let strategy = victim::strategy_from_name(&mem.victim_strategy)?;
        let batch = batch_system_from_name(&mem.batch_system, mem)?;

        let cgroup = match &mem.cgroup_root {
            Some(path) => {
                let version = if mem.cgroup_mount.join("cgroup.controllers").exists() {
                    CgroupVersion::V2
                } else {
                    CgroupVersion::V1
                };
                Some(CgroupTopology::with_slot_path(version, &mem.cgroup_mount, path))
            }
            None => CgroupTopology::discover_at(Path::new("/proc/self/cgroup"), &mem.cgroup_mount)
                .unwrap_or_else(|e| {
                    warn!("Failed to resolve the slot cgroup: {:#}", e);
                    None
                }),
        };
        match &cgroup {
            Some(cg) => info!("Slot cgroup {} {} ({})", cg.version(), cg.slot_path(), cg.path()),
            None => info!("No memory cgroup, summing job readings"),
        }

        let policy = limits::resolve_policy(cgroup.as_ref(), batch.as_ref(), &mem.limits_file);

        let hostname = config.hostname();
        let tunables = match &mem.tunables_url {
            Some(url) => match HttpTunables::new(url, &hostname, &config.slot.site) {
                Ok(source) => tunables::load_tunables(Some(&source)),
                Err(e) => {
                    warn!("{:#}", e);
                    Tunables::default()
                }
            },
            None => tunables::load_tunables(None),
        };

        Ok(Self::new(
            ControllerSettings {
                cgroup,
                policy,
                tunables,
                strategy,
                slot_cores,
                meminfo_path: PathBuf::from("/proc/meminfo"),
                hostname,
            },
            jobs,
            accounting,
        ))
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    pub fn history(&self) -> &MemoryHistory {
        &self.history
    }

    /// Preemption rounds so far.
    pub fn rounds(&self) -> u64 {
        self.round
    }

    fn machine_memory(&self) -> Option<MemInfo> {
        MemInfo::read_from(&self.meminfo_path)
            .map_err(|e| warn!("Failed to read machine memory: {:#}", e))
            .ok()
    }

    fn slot_usage(&self, readings: &[JobReading]) -> Option<SlotUsage> {
        match &self.cgroup {
            Some(cgroup) => match cgroup.sample() {
                Ok(mem) => Some(SlotUsage {
                    rss_kb: mem.rss_kb,
                    swap_kb: mem.swap_kb,
                    combined_kb: mem.combined_kb,
                }),
                Err(e) => {
                    warn!("Failed to sample cgroup {}: {:#}", cgroup.slot_path(), e);
                    None
                }
            },
            None => Some(SlotUsage {
                rss_kb: readings.iter().map(|r| r.rss_kb).sum(),
                swap_kb: None,
                combined_kb: None,
            }),
        }
    }

    fn numeric_breach(&self, usage: &SlotUsage, limits: &CgroupLimits) -> Option<(LimitType, u64)> {
        let cores = self.slot_cores.max(1) as u64;
        let t = &self.tunables;

        if let Some(limit) = limits.rss_kb {
            let mut bound = limit.saturating_sub(t.memory_margin_kb * cores);
            if limits.combined_kb.is_none() && limits.swap_kb.is_none() && t.allow_swap {
                bound += self.machine_memory().map_or(0, |m| m.swap_free_kb);
            }
            if usage.rss_kb >= bound {
                return Some((LimitType::Rss, bound));
            }
        }

        if let Some(limit) = limits.combined_kb {
            let bound = limit.saturating_sub(t.swap_margin_kb * cores);
            let combined = usage
                .combined_kb
                .unwrap_or(usage.rss_kb + usage.swap_kb.unwrap_or(0));
            if combined >= bound {
                return Some((LimitType::Combined, bound));
            }
        }

        match limits.swap_kb {
            Some(limit) if limit > 0 => {
                let bound = limit.saturating_sub(t.swap_margin_kb * cores);
                if usage.swap_kb.unwrap_or(0) >= bound {
                    return Some((LimitType::Swap, bound));
                }
            }
            _ => {}
        }

        if !limits.is_configured() {
            let info = self.machine_memory()?;
            let free = info.mem_available_kb + info.swap_free_kb;
            let bound = t.machine_margin_kb * cores;
            if free <= bound {
                return Some((LimitType::Machine, bound));
            }
        }
        None
    }

    fn expression_breach(&self, readings: &[JobReading]) -> Option<(LimitType, u64)> {
        let LimitPolicy::Expression {
            expr,
            memory_limit_kb,
            attributes,
        } = &self.policy
        else {
            return None;
        };

        for reading in readings {
            let mut vars = attributes.clone();
            vars.insert("ResidentSetSize".to_string(), reading.rss_kb as f64);
            vars.insert("JobMemoryLimit".to_string(), *memory_limit_kb as f64);
            match expr.is_breached(&vars) {
                Ok(true) => return Some((LimitType::Expression, *memory_limit_kb)),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Failed to evaluate '{}' for job {}: {:#}",
                        expr.source(),
                        reading.job_id,
                        e
                    );
                    return None;
                }
            }
        }
        None
    }

    /// One sampling iteration. Returns the decision taken, if any.
    pub fn step(&mut self) -> Option<PreemptionDecision> {
        if let LimitPolicy::Disabled { reason } = &self.policy {
            if !self.disabled_logged {
                warn!("Memory control disabled: {}", reason);
                self.disabled_logged = true;
            }
            return None;
        }

        let readings = self.jobs.readings();
        let active: BTreeSet<u64> = readings.iter().map(|r| r.job_id).collect();
        self.history.retain(&active);
        for reading in readings.iter() {
            self.history
                .observe(reading.job_id, reading.vmem_kb, reading.cores);
        }

        if let Some(victim) = self.in_flight {
            if active.contains(&victim) {
                debug!("Waiting for job {} to leave the slot", victim);
                return None;
            }
            info!("Preempted job {} has left the slot", victim);
            self.in_flight = None;
        }

        if readings.len() < 2 {
            self.breach_logged = false;
            return None;
        }

        let usage = self.slot_usage(&readings)?;
        if self.tunables.debug {
            info!("slot memory {:?} over {} jobs", usage, readings.len());
        } else {
            trace!("slot memory {:?} over {} jobs", usage, readings.len());
        }

        let breach = match &self.policy {
            LimitPolicy::Numeric { limits, .. } => self.numeric_breach(&usage, limits),
            LimitPolicy::Expression { .. } => self.expression_breach(&readings),
            LimitPolicy::Disabled { .. } => None,
        };
        let Some((limit_type, bound_kb)) = breach else {
            if self.breach_logged {
                info!("Slot memory back under its limits");
            }
            self.breach_logged = false;
            return None;
        };
        if !self.breach_logged {
            warn!(
                "Slot memory near {} limit: rss={}KB swap={:?} bound={}KB",
                limit_type.as_str(),
                usage.rss_kb,
                usage.swap_kb,
                bound_kb
            );
            self.breach_logged = true;
        }

        let candidates: Vec<Candidate> = readings
            .iter()
            .map(|r| Candidate {
                job_id: r.job_id,
                rss_kb: r.rss_kb,
                vmem_kb: r.vmem_kb,
                cores: r.cores,
                requested_memory_kb: r.requested_memory_kb,
                derivative: self.history.get(r.job_id).map_or(0.0, |s| s.derivative),
            })
            .collect();
        let victim = victim::pick_victim(
            self.strategy.as_ref(),
            &candidates,
            self.tunables.min_memory_per_core_kb,
        )?;
        let chosen = candidates.iter().find(|c| c.job_id == victim)?;

        self.round += 1;
        let decision = PreemptionDecision {
            victim,
            usage,
            limit_type,
            bound_kb,
        };
        self.jobs.flag(&decision);

        let record = PreemptionRecord {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            hostname: self.hostname.clone(),
            victim,
            slot_rss_kb: usage.rss_kb,
            slot_swap_kb: usage.swap_kb,
            slot_combined_kb: usage.combined_kb,
            limit_type,
            bound_kb,
            victim_rss_kb: chosen.rss_kb,
            per_core_kb: chosen.rss_per_core_kb(),
            growth: chosen.derivative,
            round: self.round,
            strategy: self.strategy.name().to_string(),
        };
        if let Err(e) = self.accounting.record(&record) {
            warn!("Failed to record preemption of job {}: {:#}", victim, e);
        }
        counter!("preemptions_total", "limit" => limit_type.as_str()).increment(1);
        info!(
            "Preempting job {} ({} strategy, round {}): rss={}KB growth={:.3} {} bound={}KB",
            victim,
            self.strategy.name(),
            self.round,
            chosen.rss_kb,
            chosen.derivative,
            limit_type.as_str(),
            bound_kb
        );

        self.in_flight = Some(victim);
        Some(decision)
    }

    /// Sample every @interval until @shutdown is set.
    pub fn run(mut self, shutdown: Arc<AtomicBool>, interval: Duration) {
        info!(
            "Memory controller: {} victim={} slot_cores={}",
            self.policy.audit(),
            self.strategy.name(),
            self.slot_cores
        );
        while !shutdown.load(Ordering::Relaxed) {
            self.step();
            if matches!(self.policy, LimitPolicy::Disabled { .. }) {
                return;
            }
            sleep_unless_shutdown(&shutdown, interval);
        }
    }
}
