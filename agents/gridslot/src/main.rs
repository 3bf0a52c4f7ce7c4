// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use gridslot::affinity::current_affinity;
use gridslot::affinity::CpuPinner;
use gridslot::affinity::SchedAffinityPinner;
use gridslot::allocator::CpuAllocator;
use gridslot::collab::Accounting;
use gridslot::config::SiteConfig;
use gridslot::coordinator::SlotCoordinator;
use gridslot::local::JsonLinesAccounting;
use gridslot::local::ProcessExecutor;
use gridslot::local::SpoolBroker;
use gridslot::memory::MemoryController;
use gridslot::SlotContext;
use gridslot_utils::nr_cpu_ids;
use gridslot_utils::Cpumask;
use gridslot_utils::LogRecorderBuilder;
use gridslot_utils::NumaTopology;
use log::info;
use log::warn;
use metrics_exporter_prometheus::PrometheusBuilder;

/// gridslot: worker-node resource governor.
///
/// Runs payload jobs inside one batch slot. New jobs are admitted while the
/// slot has time, disk and cores left, each job is pinned to NUMA local
/// cores, and when the slot approaches its memory limit one job is
/// preempted before the kernel or the batch system kills the whole slot.
///
/// Jobs are taken from JSON descriptions in the spool directory:
///
///   {"job_id": 42, "cores": 4, "memory_mb": 8000, "command": ["./run.sh"]}
#[derive(Debug, Parser)]
struct Opts {
    /// Site configuration file (TOML). Built-in defaults apply without one.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,

    /// Directory job descriptions are claimed from.
    #[clap(short = 's', long, default_value = "/var/spool/gridslot")]
    spool_dir: PathBuf,

    /// Override slot.workdir.
    #[clap(short = 'w', long)]
    workdir: Option<PathBuf>,

    /// Override slot.max_cpu.
    #[clap(short = 'n', long)]
    max_cpu: Option<usize>,

    /// Override slot.ttl_secs.
    #[clap(short = 't', long)]
    ttl: Option<u64>,

    /// Override memory.victim_strategy (memory, relative, growth).
    #[clap(long)]
    victim_strategy: Option<String>,

    /// Override memory.batch_system (htcondor, slurm, none).
    #[clap(long)]
    batch_system: Option<String>,

    /// Disable memory-pressure preemption.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_memory_control: bool,
}

impl Opts {
    fn site_config(&self) -> Result<SiteConfig> {
        let mut config = match &self.config {
            Some(path) => SiteConfig::load(path)?,
            None => SiteConfig::default(),
        };
        if let Some(workdir) = &self.workdir {
            config.slot.workdir = workdir.clone();
        }
        if let Some(max_cpu) = self.max_cpu {
            config.slot.max_cpu = max_cpu;
        }
        if let Some(ttl) = self.ttl {
            config.slot.ttl_secs = ttl;
        }
        if let Some(strategy) = &self.victim_strategy {
            config.memory.victim_strategy = strategy.clone();
        }
        if let Some(batch) = &self.batch_system {
            config.memory.batch_system = batch.clone();
        }
        if self.no_memory_control {
            config.memory.enabled = false;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Cores this governor may not hand out: those outside its own affinity and
/// those configured as foreign.
fn foreign_cores(config: &SiteConfig, nr_cpus: usize) -> Result<Cpumask> {
    let mut exclude = match current_affinity(nr_cpus) {
        Ok(mask) => mask.not(),
        Err(e) => {
            warn!("Failed to read own affinity, assuming every core: {:#}", e);
            Cpumask::new(nr_cpus)
        }
    };
    if !config.cpu.foreign_cpus.is_empty() {
        let foreign = Cpumask::from_cpulist(&config.cpu.foreign_cpus, nr_cpus)
            .context("Invalid cpu.foreign_cpus")?;
        exclude |= &foreign;
    }
    Ok(exclude)
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let config = opts.site_config()?;
    fs::create_dir_all(&config.slot.workdir)
        .with_context(|| format!("Failed to create workdir {:?}", config.slot.workdir))?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    } else {
        LogRecorderBuilder::new()
            .with_reporting_interval(Duration::from_secs(3))
            .install()
            .context("Failed to install log recorder")?;
    }

    let nr_cpus = nr_cpu_ids(Path::new("/sys"));
    let exclude = foreign_cores(&config, nr_cpus)?;
    let top = NumaTopology::discover(&exclude);
    info!(
        "NUMA: {} groups, free cores {}{}",
        top.nr_nodes(),
        top.free_span().to_cpulist(),
        if top.is_synthetic() { " (single node fallback)" } else { "" }
    );

    let pinner = Arc::new(SchedAffinityPinner);
    let allocator = Arc::new(CpuAllocator::new(
        &top,
        pinner.clone(),
        config.cpu.extend_idle_cores,
    ));
    let slot_cores = match config.cpu.governor_cores {
        0 => config.slot.max_cpu,
        n => n,
    };
    let slot_mask = allocator.compute_initial_mask(slot_cores, config.slot.queue_id)?;
    if config.cpu.pin_governor {
        if let Err(e) = pinner.pin(0, &slot_mask) {
            warn!("Failed to pin the governor: {:#}", e);
        }
    }

    let accounting: Arc<dyn Accounting> = Arc::new(JsonLinesAccounting::new(
        &config.slot.workdir.join("preemptions.jsonl"),
    ));
    let shutdown = Arc::new(AtomicBool::new(false));
    let ctx = Arc::new(SlotContext::new(
        config.clone(),
        allocator,
        Arc::new(SpoolBroker::new(&opts.spool_dir)?),
        Arc::new(ProcessExecutor),
        shutdown.clone(),
    ));

    let mut coordinator = SlotCoordinator::new(ctx.clone());
    let handle = coordinator.shutdown_handle();
    ctrlc::set_handler(move || {
        handle.trigger();
    })
    .context("Error setting Ctrl-C handler")?;

    let mut memory_thread = None;
    if config.memory.enabled {
        let cores = ctx.allocator.usable_cores();
        match MemoryController::from_config(&config, cores, ctx.jobs.clone(), accounting) {
            Ok(controller) => {
                let shutdown = shutdown.clone();
                let interval = Duration::from_secs(config.memory.interval_secs);
                memory_thread = Some(
                    thread::Builder::new()
                        .name("gridslot-memory".to_string())
                        .spawn(move || controller.run(shutdown, interval))
                        .context("Failed to spawn the memory controller")?,
                );
            }
            Err(e) => warn!("Memory control disabled: {:#}", e),
        }
    } else {
        info!("Memory control disabled by configuration");
    }

    let reason = coordinator.run()?;
    info!("Slot finished: {} ({})", reason, coordinator.gauges().format());

    shutdown.store(true, Ordering::Relaxed);
    if let Some(t) = memory_thread {
        if t.join().is_err() {
            warn!("Memory controller panicked");
        }
    }
    Ok(())
}
