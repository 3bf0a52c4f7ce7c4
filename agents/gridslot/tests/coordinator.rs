// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use gridslot::affinity::RecordingPinner;
use gridslot::allocator::CpuAllocator;
use gridslot::collab::Broker;
use gridslot::collab::JobAssignment;
use gridslot::collab::JobExecutor;
use gridslot::collab::JobExit;
use gridslot::collab::JobHandle;
use gridslot::collab::LaunchSpec;
use gridslot::collab::ProcessMemory;
use gridslot::collab::SlotOffer;
use gridslot::config::SiteConfig;
use gridslot::coordinator::ExitReason;
use gridslot::coordinator::SlotCoordinator;
use gridslot::memory::ActiveJobs;
use gridslot::memory::LimitType;
use gridslot::memory::PreemptionDecision;
use gridslot::memory::SlotUsage;
use gridslot::SlotContext;
use gridslot_utils::Cpumask;
use gridslot_utils::NumaTopology;
use tempfile::TempDir;

/// Hands out a fixed script of replies, then nothing.
struct ScriptedBroker {
    replies: Mutex<VecDeque<JobAssignment>>,
    offers: Mutex<Vec<SlotOffer>>,
    empty_delay: Duration,
}

impl ScriptedBroker {
    fn new(jobs: Vec<JobAssignment>, empty_delay: Duration) -> Self {
        Self {
            replies: Mutex::new(jobs.into()),
            offers: Mutex::new(vec![]),
            empty_delay,
        }
    }

    fn offers(&self) -> Vec<SlotOffer> {
        self.offers.lock().unwrap().clone()
    }
}

impl Broker for ScriptedBroker {
    fn request_job(&self, offer: &SlotOffer) -> Result<Option<JobAssignment>> {
        self.offers.lock().unwrap().push(offer.clone());
        let job = self.replies.lock().unwrap().pop_front();
        if job.is_none() {
            thread::sleep(self.empty_delay);
        }
        Ok(job)
    }
}

#[derive(Default)]
struct ExecutorLog {
    launched: Vec<LaunchSpec>,
    terminated: BTreeSet<u64>,
}

/// Payloads with a `linger` command keep running until terminated, the
/// others exit right away with the status given as their first word.
#[derive(Default)]
struct FakeExecutor {
    log: Arc<Mutex<ExecutorLog>>,
}

struct FakeHandle {
    job_id: u64,
    exit: Option<JobExit>,
    linger: bool,
    log: Arc<Mutex<ExecutorLog>>,
}

impl JobHandle for FakeHandle {
    fn pid(&self) -> i32 {
        1000 + self.job_id as i32
    }

    fn memory(&self) -> Result<ProcessMemory> {
        Ok(ProcessMemory {
            rss_kb: 500_000,
            vmem_kb: 900_000,
        })
    }

    fn runtime(&self) -> Duration {
        Duration::ZERO
    }

    fn try_wait(&mut self) -> Result<Option<JobExit>> {
        if self.linger {
            return Ok(None);
        }
        Ok(self.exit)
    }

    fn terminate(&mut self) -> Result<()> {
        self.linger = false;
        self.exit = Some(JobExit::Signaled);
        self.log.lock().unwrap().terminated.insert(self.job_id);
        Ok(())
    }
}

impl JobExecutor for FakeExecutor {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn JobHandle>> {
        self.log.lock().unwrap().launched.push(spec.clone());
        let linger = spec.command[0] == "linger";
        let code = spec.command[0].parse().unwrap_or(0);
        Ok(Box::new(FakeHandle {
            job_id: spec.job_id,
            exit: Some(JobExit::Code(code)),
            linger,
            log: self.log.clone(),
        }))
    }
}

fn job(job_id: u64, cores: usize, command: &str) -> JobAssignment {
    JobAssignment {
        job_id,
        cores,
        memory_mb: Some(2000),
        disk_mb: Some(0),
        command: vec![command.to_string()],
        share_idle: false,
    }
}

struct Slot {
    ctx: Arc<SlotContext>,
    broker: Arc<ScriptedBroker>,
    log: Arc<Mutex<ExecutorLog>>,
    _workdir: TempDir,
}

fn slot(jobs: Vec<JobAssignment>, tweak: impl FnOnce(&mut SiteConfig)) -> Slot {
    let workdir = TempDir::new().unwrap();
    let mut config = SiteConfig::default();
    config.slot.workdir = workdir.path().to_path_buf();
    config.slot.hostname = Some("wn01".to_string());
    config.slot.min_disk_mb = 0;
    config.slot.min_ttl_secs = 0;
    config.slot.admission_wait_secs = 1;
    config.slot.max_consecutive_failures = 3;
    config.backoff.base_secs = 0;
    config.job.check_interval_secs = 1;
    tweak(&mut config);

    let spans = vec![
        (0, Cpumask::from_cpulist("0-3", 8).unwrap()),
        (1, Cpumask::from_cpulist("4-7", 8).unwrap()),
    ];
    let top = NumaTopology::from_spans(8, &spans, &Cpumask::new(8));
    let allocator = Arc::new(CpuAllocator::new(
        &top,
        Arc::new(RecordingPinner::new()),
        false,
    ));

    let broker = Arc::new(ScriptedBroker::new(jobs, Duration::from_millis(20)));
    let executor = FakeExecutor::default();
    let log = executor.log.clone();
    let ctx = Arc::new(SlotContext::new(
        config,
        allocator,
        broker.clone(),
        Arc::new(executor),
        Arc::new(AtomicBool::new(false)),
    ));
    Slot {
        ctx,
        broker,
        log,
        _workdir: workdir,
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_fail_fast_without_payloads() {
    let slot = slot(vec![], |_| {});
    let mut coordinator = SlotCoordinator::new(slot.ctx.clone());
    assert_eq!(coordinator.gauges().free_cores, 8);

    assert_eq!(coordinator.run().unwrap(), ExitReason::TooManyFailures);

    let gauges = coordinator.gauges();
    assert_eq!(gauges.consecutive_failures, 3);
    assert_eq!(gauges.free_cores, 8);
    assert_eq!(gauges.active_workers, 0);

    let offers = slot.broker.offers();
    assert_eq!(offers.len(), 3);
    assert!(offers.iter().all(|o| o.free_cores == 8 && o.hostname == "wn01"));
    assert!(slot.log.lock().unwrap().launched.is_empty());
}

#[test]
fn test_pool_restored_after_jobs_finish() {
    let slot = slot(vec![job(10, 2, "0"), job(11, 3, "0")], |_| {});
    let mut coordinator = SlotCoordinator::new(slot.ctx.clone());

    assert_eq!(coordinator.run().unwrap(), ExitReason::TooManyFailures);

    let log = slot.log.lock().unwrap();
    assert_eq!(log.launched.len(), 2);
    let launched = |id: u64| log.launched.iter().find(|s| s.job_id == id).unwrap();
    assert_eq!(launched(10).core_list, "0,1");
    assert_eq!(launched(10).memory_limit_kb, Some(2000 * 1024));
    assert_eq!(launched(11).core_list.split(',').count(), 3);
    assert!(log.terminated.is_empty());

    let gauges = coordinator.gauges();
    assert_eq!(gauges.free_cores, 8);
    assert_eq!(gauges.active_workers, 0);
    assert!(slot.ctx.allocator.jobs().is_empty());
    assert_eq!(slot.ctx.allocator.free_cores(), 8);
    assert!(slot.ctx.jobs.is_empty());
    assert!(!slot.ctx.config.slot.workdir.join("job_10").exists());
}

#[test]
fn test_preemption_reaches_the_victim_worker() {
    let slot = slot(vec![job(20, 2, "linger")], |_| {});
    let ctx = slot.ctx.clone();
    let runner = thread::spawn(move || SlotCoordinator::new(ctx).run().unwrap());

    wait_for("a memory reading", || slot.ctx.jobs.readings().len() == 1);
    let readings = slot.ctx.jobs.readings();
    let reading = &readings[0];
    assert_eq!(reading.job_id, 20);
    assert_eq!(reading.cores, 2);
    assert_eq!(reading.rss_kb, 500_000);
    assert_eq!(slot.ctx.allocator.jobs().len(), 1);

    slot.ctx.jobs.flag(&PreemptionDecision {
        victim: 20,
        usage: SlotUsage {
            rss_kb: 500_000,
            swap_kb: None,
            combined_kb: None,
        },
        limit_type: LimitType::Rss,
        bound_kb: 400_000,
    });

    assert_eq!(runner.join().unwrap(), ExitReason::TooManyFailures);
    assert!(slot.log.lock().unwrap().terminated.contains(&20));
    assert!(slot.ctx.allocator.jobs().is_empty());
    assert!(slot.ctx.jobs.is_empty());
}

#[test]
fn test_shutdown_terminates_running_payloads() {
    let slot = slot(vec![job(30, 1, "linger")], |c| {
        c.slot.max_consecutive_failures = 1000;
    });
    let mut coordinator = SlotCoordinator::new(slot.ctx.clone());
    let handle = coordinator.shutdown_handle();
    let runner = thread::spawn(move || {
        let reason = coordinator.run().unwrap();
        (reason, coordinator.gauges())
    });

    wait_for("the payload", || !slot.ctx.jobs.is_empty());
    handle.trigger();

    let (reason, gauges) = runner.join().unwrap();
    assert_eq!(reason, ExitReason::Shutdown);
    assert_eq!(gauges.free_cores, 8);
    assert_eq!(gauges.active_workers, 0);
    assert!(slot.ctx.shutdown.load(Ordering::Relaxed));
    assert!(slot.log.lock().unwrap().terminated.contains(&30));
}

#[test]
fn test_payload_gets_only_the_granted_cores() {
    let big = JobAssignment {
        disk_mb: Some(1),
        ..job(51, 4, "linger")
    };
    let slot = slot(vec![job(50, 6, "linger"), big], |c| {
        c.slot.max_consecutive_failures = 1000;
    });
    let mut coordinator = SlotCoordinator::new(slot.ctx.clone());
    let handle = coordinator.shutdown_handle();
    let runner = thread::spawn(move || coordinator.run().unwrap());

    wait_for("both payloads", || slot.ctx.jobs.readings().len() == 2);
    let canonical = |id: u64| {
        slot.ctx
            .allocator
            .jobs()
            .iter()
            .find(|j| j.job_id == id)
            .map(|j| j.mask.weight())
    };
    assert_eq!(canonical(50), Some(6));
    assert_eq!(canonical(51), Some(2));
    assert_eq!(slot.ctx.allocator.free_cores(), 0);

    let readings = slot.ctx.jobs.readings();
    assert_eq!(readings.iter().find(|r| r.job_id == 51).unwrap().cores, 2);
    {
        let log = slot.log.lock().unwrap();
        let spec = log.launched.iter().find(|s| s.job_id == 51).unwrap();
        assert_eq!(spec.core_list.split(',').count(), 2);
    }
    let workdir = slot.ctx.config.slot.workdir.join("job_51");
    assert!(slot.ctx.jobs.disk_claims().contains(&(workdir, 1)));

    handle.trigger();
    assert_eq!(runner.join().unwrap(), ExitReason::Shutdown);
    assert_eq!(slot.ctx.allocator.free_cores(), 8);
}

#[test]
fn test_slot_expires() {
    let slot = slot(vec![], |c| {
        c.slot.ttl_secs = 2;
        c.slot.min_ttl_secs = 1;
        c.slot.max_consecutive_failures = 1000;
    });
    let start = Instant::now();
    let mut coordinator = SlotCoordinator::new(slot.ctx.clone());
    assert_eq!(coordinator.run().unwrap(), ExitReason::Expired);
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(coordinator.gauges().active_workers, 0);
}

#[test]
fn test_failed_payload_backs_off() {
    // The first payload holds every core, so nothing else is admitted
    // before it fails.
    let slot = slot(vec![job(40, 8, "3"), job(41, 1, "0")], |c| {
        c.backoff.base_secs = 1;
        c.backoff.max_secs = 1;
    });
    let start = Instant::now();
    let mut coordinator = SlotCoordinator::new(slot.ctx.clone());
    assert_eq!(coordinator.run().unwrap(), ExitReason::TooManyFailures);

    // The second payload only starts after the back-off delay.
    assert!(start.elapsed() >= Duration::from_secs(1));
    let log = slot.log.lock().unwrap();
    assert_eq!(log.launched.len(), 2);
    assert_eq!(log.launched[1].job_id, 41);
}
