// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Slot admission
//!
//! A single admission loop owns the slot pool (free cores, free disk,
//! remaining time, active workers and the consecutive-failure counter). Every
//! pool mutation happens under one mutex, and the loop sleeps on a condition
//! variable paired with it which workers notify whenever they correct or
//! return their share.
//!
//! Each admitted worker runs on its own thread: it asks the broker for a
//! payload, fixes up the pool once the payload's real needs are known, gets
//! cores from the allocator, launches the payload and supervises it until it
//! exits. The worker is the only owner of its payload's handle, so
//! preemption and shutdown reach it as `WorkerSignal`s over a channel and
//! the worker performs the termination itself.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::info;
use log::trace;
use log::warn;
use nix::sys::statvfs::statvfs;
use walkdir::WalkDir;

use crate::allocator::CoreRequest;
use crate::allocator::Placement;
use crate::collab::JobAssignment;
use crate::collab::LaunchSpec;
use crate::collab::ProcessMemory;
use crate::collab::SlotOffer;
use crate::config::BackoffConfig;
use crate::memory::ActiveJobs;
use crate::memory::JobReading;
use crate::memory::PreemptionDecision;
use crate::stats::Metrics;
use crate::stats::SlotGauges;
use crate::SlotContext;

const MB: u64 = 1024 * 1024;

/// Messages to the worker supervising a payload.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerSignal {
    Preempt(PreemptionDecision),
    Shutdown,
}

struct JobEntry {
    sender: Sender<WorkerSignal>,
    cores: usize,
    requested_memory_kb: Option<u64>,
    memory: Option<ProcessMemory>,
    flagged: bool,
    workdir: PathBuf,
    disk_mb: u64,
}

/// Running payloads keyed by job id. Workers publish memory readings here
/// and the memory controller reads them and flags victims.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<BTreeMap<u64, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a job and return the receiving end of its signal
    /// channel.
    pub fn register(
        &self,
        job_id: u64,
        cores: usize,
        requested_memory_kb: Option<u64>,
        workdir: &Path,
        disk_mb: u64,
    ) -> Receiver<WorkerSignal> {
        let (sender, receiver) = channel::unbounded();
        self.lock().insert(
            job_id,
            JobEntry {
                sender,
                cores,
                requested_memory_kb,
                memory: None,
                flagged: false,
                workdir: workdir.to_path_buf(),
                disk_mb,
            },
        );
        receiver
    }

    pub fn update(&self, job_id: u64, memory: ProcessMemory) {
        if let Some(entry) = self.lock().get_mut(&job_id) {
            entry.memory = Some(memory);
        }
    }

    pub fn remove(&self, job_id: u64) {
        self.lock().remove(&job_id);
    }

    pub fn is_flagged(&self, job_id: u64) -> bool {
        self.lock().get(&job_id).map_or(false, |e| e.flagged)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn broadcast_shutdown(&self) {
        for entry in self.lock().values() {
            let _ = entry.sender.send(WorkerSignal::Shutdown);
        }
    }

    /// Private work directory and declared disk of every running job.
    pub fn disk_claims(&self) -> Vec<(PathBuf, u64)> {
        self.lock()
            .values()
            .map(|e| (e.workdir.clone(), e.disk_mb))
            .collect()
    }
}

impl ActiveJobs for JobRegistry {
    fn readings(&self) -> Vec<JobReading> {
        self.lock()
            .iter()
            .filter_map(|(&job_id, e)| {
                e.memory.map(|m| JobReading {
                    job_id,
                    rss_kb: m.rss_kb,
                    vmem_kb: m.vmem_kb,
                    cores: e.cores,
                    requested_memory_kb: e.requested_memory_kb,
                })
            })
            .collect()
    }

    fn flag(&self, decision: &PreemptionDecision) {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(&decision.victim) else {
            warn!("Victim {} is no longer running", decision.victim);
            return;
        };
        entry.flagged = true;
        if entry
            .sender
            .send(WorkerSignal::Preempt(decision.clone()))
            .is_err()
        {
            debug!("job {} worker already gone", decision.victim);
        }
    }
}

/// Disk used below @dir in MB.
pub fn dir_usage_mb(dir: &Path) -> u64 {
    let bytes: u64 = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum();
    bytes / MB
}

/// Free disk of @workdir's filesystem minus what running jobs declared but
/// have not written yet.
pub fn probe_free_disk_mb(workdir: &Path, claims: &[(PathBuf, u64)]) -> Result<u64> {
    let st = statvfs(workdir).with_context(|| format!("Failed to statvfs {:?}", workdir))?;
    let free = st.blocks_available() as u64 * st.fragment_size() as u64 / MB;
    let pending: u64 = claims
        .iter()
        .map(|(dir, declared)| declared.saturating_sub(dir_usage_mb(dir)))
        .sum();
    Ok(free.saturating_sub(pending))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Expired,
    TooManyFailures,
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Expired => write!(f, "time to live exhausted"),
            ExitReason::TooManyFailures => write!(f, "too many workers without a payload"),
            ExitReason::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

/// How a worker ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    NoMatch,
    Succeeded,
    Failed,
    Preempted,
    Expired,
    Cancelled,
}

#[derive(Debug)]
pub struct SlotPool {
    pub free_cores: usize,
    pub free_disk_mb: u64,
    pub active: usize,
    /// Admitted workers still talking to the broker.
    pub matching: usize,
    pub consecutive_failures: u32,
    pub payload_failures: u32,
    pub not_before: Option<Instant>,
    /// Bumped whenever a disk claim is registered or released.
    pub disk_epoch: u64,
}

impl SlotPool {
    fn new(free_cores: usize) -> Self {
        Self {
            free_cores,
            free_disk_mb: 0,
            active: 0,
            matching: 0,
            consecutive_failures: 0,
            payload_failures: 0,
            not_before: None,
            disk_epoch: 0,
        }
    }

    /// Account a finished worker. Only workers that never got a payload
    /// count towards fail-fast, failed payloads back off instead.
    pub fn settle(&mut self, outcome: WorkerOutcome, backoff: &BackoffConfig, now: Instant) {
        match outcome {
            WorkerOutcome::NoMatch => self.consecutive_failures += 1,
            WorkerOutcome::Failed => {
                self.consecutive_failures = 0;
                self.payload_failures += 1;
                let delay = backoff.delay(self.payload_failures);
                debug!("payload failure {}, backing off {:?}", self.payload_failures, delay);
                self.not_before = Some(now + delay);
            }
            WorkerOutcome::Succeeded => {
                self.consecutive_failures = 0;
                self.payload_failures = 0;
                self.not_before = None;
            }
            WorkerOutcome::Preempted | WorkerOutcome::Expired => {
                self.consecutive_failures = 0;
            }
            WorkerOutcome::Cancelled => {}
        }
    }
}

struct Shared {
    pool: Mutex<SlotPool>,
    cond: Condvar,
    deadline: Instant,
    metrics: Metrics,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SlotPool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stops a running coordinator from another thread (signal handler).
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    shared: Arc<Shared>,
    ctx: Arc<SlotContext>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.ctx.jobs.broadcast_shutdown();
        let _guard = self.shared.lock();
        self.shared.cond.notify_all();
    }
}

pub struct SlotCoordinator {
    ctx: Arc<SlotContext>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl SlotCoordinator {
    pub fn new(ctx: Arc<SlotContext>) -> Self {
        let slot = &ctx.config.slot;
        let mut cores = ctx.allocator.usable_cores();
        if slot.max_cpu > 0 {
            cores = cores.min(slot.max_cpu);
        }
        info!(
            "Slot: {} cores, ttl {}s, workdir {:?}",
            cores, slot.ttl_secs, slot.workdir
        );
        let shared = Arc::new(Shared {
            pool: Mutex::new(SlotPool::new(cores)),
            cond: Condvar::new(),
            deadline: Instant::now() + Duration::from_secs(slot.ttl_secs),
            metrics: Metrics::new(),
        });
        Self {
            ctx,
            shared,
            workers: vec![],
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.ctx.shutdown.clone(),
            shared: self.shared.clone(),
            ctx: self.ctx.clone(),
        }
    }

    pub fn gauges(&self) -> SlotGauges {
        gauges_of(&self.shared, &self.shared.lock())
    }

    pub fn is_flagged(&self, job_id: u64) -> bool {
        self.ctx.jobs.is_flagged(job_id)
    }

    fn refresh_disk(&self) {
        let epoch = self.shared.lock().disk_epoch;
        let claims = self.ctx.jobs.disk_claims();
        match probe_free_disk_mb(&self.ctx.config.slot.workdir, &claims) {
            Ok(free) => {
                let mut pool = self.shared.lock();
                if pool.disk_epoch == epoch {
                    pool.free_disk_mb = free;
                } else {
                    trace!("disk claims changed while probing, keeping {}MB", pool.free_disk_mb);
                }
            }
            Err(e) => warn!("Disk probe failed, keeping last value: {:#}", e),
        }
    }

    /// Why a new worker may not start now, if anything prevents it.
    fn admission_blocker(&self, pool: &SlotPool, now: Instant) -> Option<String> {
        let slot = &self.ctx.config.slot;
        if pool.matching > 0 {
            return Some("a worker is still matching".to_string());
        }
        if pool.free_cores == 0 {
            return Some("no free cores".to_string());
        }
        if pool.free_disk_mb < slot.min_disk_mb {
            return Some(format!("{}MB free disk", pool.free_disk_mb));
        }
        if let Some(t) = pool.not_before {
            if now < t {
                return Some(format!("backing off for {:?}", t - now));
            }
        }
        None
    }

    fn spawn_worker(&mut self, pool: &mut SlotPool, seq: u64) -> Result<()> {
        pool.free_cores -= 1;
        pool.active += 1;
        pool.matching += 1;
        self.shared.metrics.admitted();

        let ctx = self.ctx.clone();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("gridslot-worker-{}", seq))
            .spawn(move || worker(ctx, shared))
            .context("Failed to spawn job worker")?;
        self.workers.push(handle);
        Ok(())
    }

    /// Admit job workers until the slot expires, fails too often or is shut
    /// down, then wait for the running workers.
    pub fn run(&mut self) -> Result<ExitReason> {
        let slot = self.ctx.config.slot.clone();
        let wait = Duration::from_secs(slot.admission_wait_secs);
        let min_ttl = Duration::from_secs(slot.min_ttl_secs);
        let mut seq = 0;

        let reason = loop {
            self.refresh_disk();

            let shared = self.shared.clone();
            let mut pool = shared.lock();
            let now = Instant::now();
            if self.ctx.shutdown.load(Ordering::Relaxed) {
                break ExitReason::Shutdown;
            }
            if pool.consecutive_failures >= slot.max_consecutive_failures {
                break ExitReason::TooManyFailures;
            }
            if shared.deadline.saturating_duration_since(now) < min_ttl {
                break ExitReason::Expired;
            }

            match self.admission_blocker(&pool, now) {
                Some(why) => trace!("not admitting: {}", why),
                None => {
                    seq += 1;
                    self.spawn_worker(&mut pool, seq)?;
                    debug!("admitted worker {}: {}", seq, gauges_of(&shared, &pool).format());
                }
            }
            shared.metrics.report(&gauges_of(&shared, &pool));

            let (guard, _) = shared
                .cond
                .wait_timeout(pool, wait)
                .unwrap_or_else(|e| e.into_inner());
            drop(guard);
        };
        info!("Admission stopped: {}", reason);

        self.drain();
        Ok(reason)
    }

    fn drain(&mut self) {
        let shared = self.shared.clone();
        let mut pool = shared.lock();
        let mut broadcast = false;
        while pool.active > 0 {
            if !broadcast && self.ctx.shutdown.load(Ordering::Relaxed) {
                self.ctx.jobs.broadcast_shutdown();
                broadcast = true;
            }
            debug!("waiting for {} workers", pool.active);
            pool = shared
                .cond
                .wait_timeout(pool, Duration::from_secs(1))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        shared.metrics.report(&gauges_of(&shared, &pool));
        drop(pool);

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("A job worker panicked");
            }
        }
    }
}

fn gauges_of(shared: &Shared, pool: &SlotPool) -> SlotGauges {
    SlotGauges {
        free_cores: pool.free_cores,
        free_disk_mb: pool.free_disk_mb,
        ttl_remaining_secs: shared
            .deadline
            .saturating_duration_since(Instant::now())
            .as_secs(),
        active_workers: pool.active,
        consecutive_failures: pool.consecutive_failures,
    }
}

/// Body of a job worker thread. Holds one speculatively reserved core on
/// entry and returns everything it holds on exit.
fn worker(ctx: Arc<SlotContext>, shared: Arc<Shared>) {
    let slot = &ctx.config.slot;
    let offer = {
        let pool = shared.lock();
        SlotOffer {
            free_cores: pool.free_cores + 1,
            free_disk_mb: pool.free_disk_mb,
            ttl_secs: shared
                .deadline
                .saturating_duration_since(Instant::now())
                .as_secs(),
            platform: slot.platform.clone(),
            site: slot.site.clone(),
            hostname: ctx.hostname.clone(),
        }
    };

    let job = match ctx.broker.request_job(&offer) {
        Ok(job) => job,
        Err(e) => {
            warn!("Broker request failed: {:#}", e);
            None
        }
    };

    let mut held_cores = 1;
    let mut held_disk = 0;
    let outcome = match job {
        None => WorkerOutcome::NoMatch,
        Some(job) => {
            let workdir = slot.workdir.join(format!("job_{}", job.job_id));
            let signals = {
                let mut pool = shared.lock();
                pool.matching -= 1;
                let extra = job.cores.saturating_sub(1).min(pool.free_cores);
                pool.free_cores -= extra;
                held_cores += extra;
                let disk = job.disk_mb.unwrap_or(slot.default_disk_mb);
                held_disk = disk.min(pool.free_disk_mb);
                pool.free_disk_mb -= held_disk;
                // Registered under the pool lock so the next disk probe
                // counts it.
                let signals = ctx.jobs.register(
                    job.job_id,
                    held_cores,
                    job.memory_mb.map(|mb| mb * 1024),
                    &workdir,
                    held_disk,
                );
                pool.disk_epoch += 1;
                shared.cond.notify_all();
                signals
            };
            info!(
                "job {} matched: {} cores ({} granted), {}MB disk",
                job.job_id, job.cores, held_cores, held_disk
            );
            execute(&ctx, &shared, &job, held_cores, &workdir, signals)
        }
    };

    match outcome {
        WorkerOutcome::NoMatch => shared.metrics.no_match(),
        WorkerOutcome::Succeeded => shared.metrics.payload_succeeded(),
        WorkerOutcome::Failed => shared.metrics.payload_failed(),
        WorkerOutcome::Preempted => shared.metrics.preempted(),
        WorkerOutcome::Expired => shared.metrics.expired(),
        WorkerOutcome::Cancelled => {}
    }

    let mut pool = shared.lock();
    if outcome == WorkerOutcome::NoMatch {
        pool.matching -= 1;
    }
    pool.free_cores += held_cores;
    pool.free_disk_mb += held_disk;
    if outcome != WorkerOutcome::NoMatch {
        pool.disk_epoch += 1;
    }
    pool.active -= 1;
    pool.settle(outcome, &ctx.config.backoff, Instant::now());
    debug!("worker done ({:?}): {}", outcome, gauges_of(&shared, &pool).format());
    shared.cond.notify_all();
}

/// Place, launch and supervise a matched payload on the @cores the pool
/// granted it, then clean up after it.
fn execute(
    ctx: &SlotContext,
    shared: &Shared,
    job: &JobAssignment,
    cores: usize,
    workdir: &Path,
    signals: Receiver<WorkerSignal>,
) -> WorkerOutcome {
    let req = CoreRequest {
        job_id: job.job_id,
        cores,
        share_idle: job.share_idle,
    };
    let outcome = match ctx.allocator.pick_cores(&req) {
        Ok(placement) => match supervise(ctx, shared, job, &placement, workdir, signals) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("job {} failed: {:#}", job.job_id, e);
                WorkerOutcome::Failed
            }
        },
        Err(e) => {
            warn!("No cores for job {}: {:#}", job.job_id, e);
            WorkerOutcome::Failed
        }
    };

    ctx.jobs.remove(job.job_id);
    ctx.allocator.refill(job.job_id);
    if workdir.exists() {
        if let Err(e) = fs::remove_dir_all(workdir) {
            warn!("Failed to remove {:?}: {}", workdir, e);
        }
    }
    outcome
}

fn supervise(
    ctx: &SlotContext,
    shared: &Shared,
    job: &JobAssignment,
    placement: &Placement,
    workdir: &Path,
    signals: Receiver<WorkerSignal>,
) -> Result<WorkerOutcome> {
    fs::create_dir_all(workdir).with_context(|| format!("Failed to create {:?}", workdir))?;
    let memory_limit_kb = job.memory_mb.map(|mb| mb * 1024);

    let spec = LaunchSpec {
        job_id: job.job_id,
        command: job.command.clone(),
        workdir: workdir.to_path_buf(),
        core_list: placement.core_list(),
        memory_limit_kb,
    };
    let mut handle = ctx.executor.launch(&spec)?;
    if let Err(e) = ctx.allocator.attach_pid(job.job_id, handle.pid()) {
        warn!("Failed to pin job {}: {:#}", job.job_id, e);
    }

    let mut deadline = shared.deadline;
    if ctx.config.job.ttl_secs > 0 {
        deadline = deadline.min(Instant::now() + Duration::from_secs(ctx.config.job.ttl_secs));
    }
    let interval = Duration::from_secs(ctx.config.job.check_interval_secs);

    loop {
        if let Some(exit) = handle.try_wait()? {
            info!(
                "job {} exited after {:?}: {:?}",
                job.job_id,
                handle.runtime(),
                exit
            );
            return Ok(if exit.success() {
                WorkerOutcome::Succeeded
            } else {
                WorkerOutcome::Failed
            });
        }

        match handle.memory() {
            Ok(memory) => ctx.jobs.update(job.job_id, memory),
            Err(e) => debug!("job {}: memory unavailable: {:#}", job.job_id, e),
        }

        if ctx.shutdown.load(Ordering::Relaxed) {
            handle.terminate()?;
            return Ok(WorkerOutcome::Cancelled);
        }
        if Instant::now() >= deadline {
            info!("job {} ran out of time, terminating", job.job_id);
            handle.terminate()?;
            return Ok(WorkerOutcome::Expired);
        }

        let timeout = interval.min(deadline.saturating_duration_since(Instant::now()));
        match signals.recv_timeout(timeout) {
            Ok(WorkerSignal::Preempt(decision)) => {
                info!(
                    "job {} preempted: slot rss {}KB over {} bound {}KB",
                    job.job_id,
                    decision.usage.rss_kb,
                    decision.limit_type.as_str(),
                    decision.bound_kb
                );
                handle.terminate()?;
                return Ok(WorkerOutcome::Preempted);
            }
            Ok(WorkerSignal::Shutdown) => {
                handle.terminate()?;
                return Ok(WorkerOutcome::Cancelled);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(interval),
        }
    }
}
