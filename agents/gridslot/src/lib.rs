// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # gridslot
//!
//! Worker-node resource governor of a grid job agent. Inside the batch slot
//! it was started in, gridslot decides when another payload may start, pins
//! every payload to NUMA local cores and preempts one payload when the slot
//! is about to run out of memory.
//!
//! - `coordinator::SlotCoordinator` admits job workers while the slot has
//!   time, disk and cores left.
//! - `allocator::CpuAllocator` hands cores to jobs.
//! - `memory::MemoryController` watches the slot's memory and nominates
//!   victims.
//!
//! Everything the three share lives in one `SlotContext` per process.

pub mod affinity;
pub mod allocator;
pub mod batch;
pub mod collab;
pub mod config;
pub mod coordinator;
pub mod local;
pub mod memory;
pub mod stats;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use allocator::CpuAllocator;
use collab::Broker;
use collab::JobExecutor;
use config::SiteConfig;
use coordinator::JobRegistry;

/// State shared by the coordinator, its job workers and the memory
/// controller of one slot.
pub struct SlotContext {
    pub config: SiteConfig,
    pub hostname: String,
    pub allocator: Arc<CpuAllocator>,
    pub jobs: Arc<JobRegistry>,
    pub broker: Arc<dyn Broker>,
    pub executor: Arc<dyn JobExecutor>,
    pub shutdown: Arc<AtomicBool>,
}

impl SlotContext {
    pub fn new(
        config: SiteConfig,
        allocator: Arc<CpuAllocator>,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn JobExecutor>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let hostname = config.hostname();
        Self {
            config,
            hostname,
            allocator,
            jobs: Arc::new(JobRegistry::new()),
            broker,
            executor,
            shutdown,
        }
    }
}

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Sleep for @dur, returning early once @shutdown is set.
pub fn sleep_unless_shutdown(shutdown: &AtomicBool, dur: Duration) {
    let deadline = Instant::now() + dur;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}
