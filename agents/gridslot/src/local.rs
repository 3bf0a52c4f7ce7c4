// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Stand-alone collaborators used by the gridslot binary.
//!
//! `SpoolBroker` hands out JSON job descriptions dropped into a spool
//! directory, `ProcessExecutor` runs them as local processes and
//! `JsonLinesAccounting` appends preemption records to a file. A job agent
//! embedding the governor provides its own implementations.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use gridslot_utils::misc::read_file_kv;
use log::debug;
use log::info;
use log::warn;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::collab::Accounting;
use crate::collab::Broker;
use crate::collab::JobAssignment;
use crate::collab::JobExecutor;
use crate::collab::JobExit;
use crate::collab::JobHandle;
use crate::collab::LaunchSpec;
use crate::collab::ProcessMemory;
use crate::collab::SlotOffer;
use crate::memory::PreemptionRecord;

/// Claims `*.json` job descriptions from a spool directory, oldest name
/// first. A claim is an atomic rename, so several slots may share a spool.
pub struct SpoolBroker {
    dir: PathBuf,
}

impl SpoolBroker {
    pub fn new(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            bail!("Spool directory {:?} does not exist", dir);
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn fits(job: &JobAssignment, offer: &SlotOffer) -> bool {
        job.cores <= offer.free_cores && job.disk_mb.map_or(true, |mb| mb <= offer.free_disk_mb)
    }
}

impl Broker for SpoolBroker {
    fn request_job(&self, offer: &SlotOffer) -> Result<Option<JobAssignment>> {
        let pattern = format!("{}/*.json", self.dir.display());
        let mut paths: Vec<PathBuf> = glob(&pattern)?.filter_map(Result::ok).collect();
        paths.sort();

        for path in paths {
            let job: JobAssignment = match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
            {
                Ok(job) => job,
                Err(e) => {
                    warn!("Rejecting malformed job description {:?}: {:#}", path, e);
                    let _ = fs::rename(&path, path.with_extension("bad"));
                    continue;
                }
            };
            if !Self::fits(&job, offer) {
                debug!("job {} does not fit {:?}", job.job_id, offer);
                continue;
            }
            let claimed = path.with_extension(format!("claimed.{}", offer.hostname));
            match fs::rename(&path, &claimed) {
                Ok(()) => {
                    info!("Claimed job {} from {:?}", job.job_id, path);
                    return Ok(Some(job));
                }
                Err(e) => debug!("Lost the race for {:?}: {}", path, e),
            }
        }
        Ok(None)
    }
}

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

pub struct ProcessHandle {
    child: Child,
    started: Instant,
}

/// Resident and virtual memory of @pid from a /proc/<pid>/status file.
pub fn read_process_memory(status: &Path) -> Result<ProcessMemory> {
    let kv = read_file_kv(status)?;
    Ok(ProcessMemory {
        rss_kb: kv.get("VmRSS").copied().unwrap_or(0),
        vmem_kb: kv.get("VmSize").copied().unwrap_or(0),
    })
}

impl JobHandle for ProcessHandle {
    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn memory(&self) -> Result<ProcessMemory> {
        read_process_memory(&PathBuf::from(format!("/proc/{}/status", self.child.id())))
    }

    fn runtime(&self) -> Duration {
        self.started.elapsed()
    }

    fn try_wait(&mut self) -> Result<Option<JobExit>> {
        Ok(self.child.try_wait()?.map(|status| match status.code() {
            Some(code) => JobExit::Code(code),
            None => JobExit::Signaled,
        }))
    }

    fn terminate(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = Pid::from_raw(self.pid());
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        warn!("pid {} ignored SIGTERM, killing", pid);
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

/// Runs payload commands as child processes of the governor.
#[derive(Debug, Default)]
pub struct ProcessExecutor;

impl JobExecutor for ProcessExecutor {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn JobHandle>> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| anyhow!("Job {} has an empty command", spec.job_id))?;
        fs::create_dir_all(&spec.workdir)
            .with_context(|| format!("Failed to create {:?}", spec.workdir))?;
        let stdout = File::create(spec.workdir.join("stdout"))?;
        let stderr = File::create(spec.workdir.join("stderr"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.workdir)
            .env("GRIDSLOT_JOB_ID", spec.job_id.to_string())
            .env("GRIDSLOT_CORES", &spec.core_list)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(kb) = spec.memory_limit_kb {
            cmd.env("GRIDSLOT_MEMORY_LIMIT_KB", kb.to_string());
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {:?} for job {}", program, spec.job_id))?;
        info!("job {} started as pid {}", spec.job_id, child.id());
        Ok(Box::new(ProcessHandle {
            child,
            started: Instant::now(),
        }))
    }
}

/// Appends one JSON object per preemption.
pub struct JsonLinesAccounting {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesAccounting {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }
}

impl Accounting for JsonLinesAccounting {
    fn record(&self, record: &PreemptionRecord) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {:?}", self.path))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LimitType;
    use tempfile::TempDir;

    fn offer(cores: usize) -> SlotOffer {
        SlotOffer {
            free_cores: cores,
            free_disk_mb: 10_000,
            ttl_secs: 3600,
            platform: "linux-x86_64".to_string(),
            site: "TEST".to_string(),
            hostname: "wn01".to_string(),
        }
    }

    #[test]
    fn test_spool_claims_fitting_jobs_once() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("001.json"),
            r#"{"job_id": 1, "cores": 8, "command": ["true"]}"#,
        )
        .unwrap();
        fs::write(
            tmp.path().join("002.json"),
            r#"{"job_id": 2, "cores": 2, "disk_mb": 500, "command": ["true"]}"#,
        )
        .unwrap();
        fs::write(tmp.path().join("003.json"), "not json").unwrap();

        let broker = SpoolBroker::new(tmp.path()).unwrap();
        let job = broker.request_job(&offer(4)).unwrap().unwrap();
        assert_eq!(job.job_id, 2);
        assert_eq!(job.disk_mb, Some(500));
        assert!(!job.share_idle);
        assert!(tmp.path().join("002.claimed.wn01").exists());
        assert!(tmp.path().join("003.bad").exists());

        assert!(broker.request_job(&offer(4)).unwrap().is_none());
        assert_eq!(broker.request_job(&offer(8)).unwrap().unwrap().job_id, 1);
        assert!(SpoolBroker::new(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_process_memory_from_status() {
        let tmp = TempDir::new().unwrap();
        let status = tmp.path().join("status");
        fs::write(
            &status,
            "Name:\tpayload\nVmPeak:\t  300000 kB\nVmSize:\t  250000 kB\nVmRSS:\t  120000 kB\n",
        )
        .unwrap();
        let mem = read_process_memory(&status).unwrap();
        assert_eq!(mem.rss_kb, 120_000);
        assert_eq!(mem.vmem_kb, 250_000);
    }

    #[test]
    fn test_process_executor_runs_payload() {
        let tmp = TempDir::new().unwrap();
        let spec = LaunchSpec {
            job_id: 5,
            command: vec!["sh".to_string(), "-c".to_string(), "echo $GRIDSLOT_CORES".to_string()],
            workdir: tmp.path().join("job_5"),
            core_list: "0,1".to_string(),
            memory_limit_kb: None,
        };
        let mut handle = ProcessExecutor.launch(&spec).unwrap();
        let exit = loop {
            if let Some(exit) = handle.try_wait().unwrap() {
                break exit;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert!(exit.success());
        let out = fs::read_to_string(tmp.path().join("job_5/stdout")).unwrap();
        assert_eq!(out.trim(), "0,1");

        let empty = LaunchSpec {
            command: vec![],
            ..spec
        };
        assert!(ProcessExecutor.launch(&empty).is_err());
    }

    #[test]
    fn test_terminate_running_payload() {
        let tmp = TempDir::new().unwrap();
        let spec = LaunchSpec {
            job_id: 6,
            command: vec!["sleep".to_string(), "30".to_string()],
            workdir: tmp.path().join("job_6"),
            core_list: "0".to_string(),
            memory_limit_kb: Some(1024),
        };
        let mut handle = ProcessExecutor.launch(&spec).unwrap();
        assert!(handle.try_wait().unwrap().is_none());
        handle.terminate().unwrap();
        assert_eq!(handle.try_wait().unwrap(), Some(JobExit::Signaled));
    }

    #[test]
    fn test_json_lines_accounting() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("preemptions.jsonl");
        let accounting = JsonLinesAccounting::new(&path);
        let record = PreemptionRecord {
            timestamp: 1,
            hostname: "wn01".to_string(),
            victim: 3,
            slot_rss_kb: 100,
            slot_swap_kb: None,
            slot_combined_kb: None,
            limit_type: LimitType::Rss,
            bound_kb: 90,
            victim_rss_kb: 60,
            per_core_kb: 60,
            growth: 0.5,
            round: 1,
            strategy: "memory".to_string(),
        };
        accounting.record(&record).unwrap();
        accounting.record(&record).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: PreemptionRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(back, record);
        assert!(lines[0].contains("\"limit_type\":\"rss\""));
    }
}
