// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Interfaces to the job agent around the governor: the broker handing out
//! payloads, the executor running them and the accounting sink recording
//! preemptions.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::memory::PreemptionRecord;

/// What the slot can offer to a new payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotOffer {
    pub free_cores: usize,
    pub free_disk_mb: u64,
    pub ttl_secs: u64,
    pub platform: String,
    pub site: String,
    pub hostname: String,
}

/// A payload matched to the slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: u64,
    #[serde(default = "default_cores")]
    pub cores: usize,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub disk_mb: Option<u64>,
    pub command: Vec<String>,
    /// Let neighbours run on this job's idle cores.
    #[serde(default)]
    pub share_idle: bool,
}

fn default_cores() -> usize {
    1
}

pub trait Broker: Send + Sync {
    /// Ok(None) means nothing matched the offer.
    fn request_job(&self, offer: &SlotOffer) -> Result<Option<JobAssignment>>;
}

#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub job_id: u64,
    pub command: Vec<String>,
    pub workdir: PathBuf,
    /// Comma separated cores the payload is pinned to.
    pub core_list: String,
    pub memory_limit_kb: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessMemory {
    pub rss_kb: u64,
    pub vmem_kb: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobExit {
    /// Exited with this status code.
    Code(i32),
    /// Killed by a signal.
    Signaled,
}

impl JobExit {
    pub fn success(&self) -> bool {
        *self == JobExit::Code(0)
    }
}

/// A running payload. Owned by exactly one job worker thread.
pub trait JobHandle: Send {
    fn pid(&self) -> i32;

    fn memory(&self) -> Result<ProcessMemory>;

    fn runtime(&self) -> Duration;

    /// Ok(None) while the payload is still alive.
    fn try_wait(&mut self) -> Result<Option<JobExit>>;

    fn terminate(&mut self) -> Result<()>;
}

pub trait JobExecutor: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn JobHandle>>;
}

pub trait Accounting: Send + Sync {
    fn record(&self, record: &PreemptionRecord) -> Result<()>;
}
