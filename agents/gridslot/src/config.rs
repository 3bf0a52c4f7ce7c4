// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Site configuration.
//!
//! The slot description comes from a TOML file, every key of which has a
//! default so a missing file still yields a runnable governor:
//!
//! ```toml
//! [slot]
//! max_cpu = 8
//! ttl_secs = 172800
//! workdir = "/scratch/gridslot"
//!
//! [cpu]
//! foreign_cpus = "0-1"
//!
//! [memory]
//! victim_strategy = "growth"
//! batch_system = "htcondor"
//! ```

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub slot: SlotConfig,
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub backoff: BackoffConfig,
    pub job: JobConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    /// Cores the slot may use. 0 means every usable core of the host.
    pub max_cpu: usize,
    pub ttl_secs: u64,
    /// Do not admit new jobs with less than this much time left.
    pub min_ttl_secs: u64,
    pub workdir: PathBuf,
    /// Disk reserved for a job that does not declare its needs.
    pub default_disk_mb: u64,
    /// Do not admit new jobs with less free disk than this.
    pub min_disk_mb: u64,
    pub max_consecutive_failures: u32,
    pub admission_wait_secs: u64,
    pub queue_id: u64,
    pub site: String,
    pub hostname: Option<String>,
    pub platform: String,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_cpu: 0,
            ttl_secs: 48 * 3600,
            min_ttl_secs: 3600,
            workdir: PathBuf::from("/tmp/gridslot"),
            default_disk_mb: 10 * 1024,
            min_disk_mb: 1024,
            max_consecutive_failures: 5,
            admission_wait_secs: 180,
            queue_id: 0,
            site: "UNKNOWN".to_string(),
            hostname: None,
            platform: "linux-x86_64".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Cpulist of cores pinned by workloads the governor does not control.
    pub foreign_cpus: String,
    /// Let jobs run on idle cores of their NUMA scope.
    pub extend_idle_cores: bool,
    /// Pin the governor itself to the slot's cores at start-up.
    pub pin_governor: bool,
    /// Cores to reserve for the governor's own pinning mask. 0 means max_cpu.
    pub governor_cores: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            foreign_cpus: String::new(),
            extend_idle_cores: true,
            pin_governor: true,
            governor_cores: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub victim_strategy: String,
    pub batch_system: String,
    /// HTCondor job ClassAd. Defaults to $_CONDOR_JOB_AD.
    pub job_ad: Option<PathBuf>,
    pub tunables_url: Option<String>,
    /// Override the slot cgroup path instead of deriving it.
    pub cgroup_root: Option<String>,
    pub cgroup_mount: PathBuf,
    pub limits_file: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            victim_strategy: "memory".to_string(),
            batch_system: "none".to_string(),
            job_ad: None,
            tunables_url: None,
            cgroup_root: None,
            cgroup_mount: PathBuf::from("/sys/fs/cgroup"),
            limits_file: PathBuf::from("/proc/self/limits"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 30,
            max_secs: 600,
        }
    }
}

impl BackoffConfig {
    /// Delay after the @failures'th consecutive payload failure.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(16);
        let secs = self.base_secs.saturating_mul(1 << shift).min(self.max_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// How often a job worker samples its payload.
    pub check_interval_secs: u64,
    /// Wall-clock limit of a single payload. 0 means bounded only by the slot.
    pub ttl_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            ttl_secs: 0,
        }
    }
}

impl SiteConfig {
    pub fn load(path: &Path) -> Result<SiteConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<SiteConfig> {
        let config: SiteConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory.interval_secs == 0 {
            bail!("memory.interval_secs must be positive");
        }
        if self.job.check_interval_secs == 0 {
            bail!("job.check_interval_secs must be positive");
        }
        if self.slot.max_consecutive_failures == 0 {
            bail!("slot.max_consecutive_failures must be positive");
        }
        Ok(())
    }

    pub fn hostname(&self) -> String {
        if let Some(name) = &self.slot.hostname {
            return name.clone();
        }
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SiteConfig::parse("").unwrap();
        assert_eq!(config, SiteConfig::default());
        assert!(config.cpu.extend_idle_cores);
        assert_eq!(config.memory.interval_secs, 5);
    }

    #[test]
    fn test_partial_sections() {
        let config = SiteConfig::parse(
            r#"
            [slot]
            max_cpu = 8
            site = "CERN"

            [memory]
            victim_strategy = "growth"
            batch_system = "htcondor"
            "#,
        )
        .unwrap();
        assert_eq!(config.slot.max_cpu, 8);
        assert_eq!(config.slot.site, "CERN");
        assert_eq!(config.slot.ttl_secs, SlotConfig::default().ttl_secs);
        assert_eq!(config.memory.victim_strategy, "growth");
        assert!(config.memory.enabled);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SiteConfig::parse("[memory]\ninterval_secs = 0\n").is_err());
        assert!(SiteConfig::parse("[slot]\nmax_cpu = \"lots\"\n").is_err());
    }

    #[test]
    fn test_backoff_escalates_and_caps() {
        let backoff = BackoffConfig {
            base_secs: 10,
            max_secs: 60,
        };
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(20));
        assert_eq!(backoff.delay(3), Duration::from_secs(40));
        assert_eq!(backoff.delay(4), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
    }
}
