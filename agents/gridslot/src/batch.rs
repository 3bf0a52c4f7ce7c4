// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Batch systems the slot may have been obtained from.
//!
//! The memory controller only needs three things from the local batch
//! system: its version, the memory limit it declared for the slot and the
//! expression it will use to remove the slot. Implementations are selected
//! by name from a fixed table.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;
use sscanf::sscanf;

use crate::config::MemoryConfig;

/// Oldest HTCondor whose job ad removal expressions we can evaluate.
pub const HTCONDOR_EXPRESSION_MIN_VERSION: &str = "8.9.0";

pub trait BatchSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Version of the batch system tooling, if known.
    fn version(&self) -> Option<String>;

    /// Memory limit declared for the slot, in KB.
    fn job_memory_limit_kb(&self) -> Option<u64>;

    /// Expression the batch system evaluates to remove the slot.
    fn removal_expression(&self) -> Option<String> {
        None
    }

    /// Oldest version whose removal expression may be evaluated locally.
    fn min_expression_version(&self) -> Option<&'static str> {
        None
    }

    /// Numeric attributes usable in the removal expression.
    fn attributes(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// Whether @batch's tooling is recent enough for expression mode.
pub fn expression_supported(batch: &dyn BatchSystem) -> bool {
    let Some(min) = batch.min_expression_version() else {
        return true;
    };
    match batch.version() {
        Some(ver) => matches!(
            version_compare::compare(&ver, min),
            Ok(version_compare::Cmp::Gt) | Ok(version_compare::Cmp::Eq)
        ),
        None => false,
    }
}

/// Parsed HTCondor job ClassAd.
#[derive(Clone, Debug, Default)]
pub struct HtCondor {
    ad: BTreeMap<String, String>,
}

impl HtCondor {
    pub fn from_ad(content: &str) -> HtCondor {
        let ad = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        HtCondor { ad }
    }

    pub fn from_ad_file(path: &Path) -> Result<HtCondor> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job ad {:?}", path))?;
        Ok(Self::from_ad(&content))
    }

    fn from_config(config: &MemoryConfig) -> Box<dyn BatchSystem> {
        let path = config
            .job_ad
            .clone()
            .or_else(|| std::env::var_os("_CONDOR_JOB_AD").map(PathBuf::from));
        let condor = match path {
            Some(path) => Self::from_ad_file(&path).unwrap_or_else(|e| {
                warn!("{:#}", e);
                HtCondor::default()
            }),
            None => {
                warn!("No HTCondor job ad available");
                HtCondor::default()
            }
        };
        Box::new(condor)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.ad
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    fn get_num(&self, key: &str) -> Option<f64> {
        self.get(key)?.trim_matches('"').parse::<f64>().ok()
    }
}

impl BatchSystem for HtCondor {
    fn name(&self) -> &'static str {
        "htcondor"
    }

    fn version(&self) -> Option<String> {
        let raw = self.get("CondorVersion")?.trim_matches('"');
        let rest = sscanf!(raw, "$CondorVersion: {String}").ok()?;
        rest.split_whitespace().next().map(|v| v.to_string())
    }

    fn job_memory_limit_kb(&self) -> Option<u64> {
        ["MemoryProvisioned", "RequestMemory"]
            .iter()
            .find_map(|key| self.get_num(key))
            .map(|mb| (mb * 1024.0) as u64)
    }

    fn removal_expression(&self) -> Option<String> {
        let expr = self.get("PeriodicRemove")?;
        if expr.eq_ignore_ascii_case("false") {
            return None;
        }
        Some(expr.to_string())
    }

    fn min_expression_version(&self) -> Option<&'static str> {
        Some(HTCONDOR_EXPRESSION_MIN_VERSION)
    }

    fn attributes(&self) -> BTreeMap<String, f64> {
        self.ad
            .keys()
            .filter_map(|key| self.get_num(key).map(|v| (key.clone(), v)))
            .collect()
    }
}

/// Slurm exports the allocation through the job environment.
#[derive(Clone, Debug, Default)]
pub struct Slurm {
    mem_per_node_mb: Option<u64>,
    mem_per_cpu_mb: Option<u64>,
    cpus_on_node: Option<u64>,
    version: Option<String>,
}

impl Slurm {
    pub fn from_vars<F>(lookup: F) -> Slurm
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        Slurm {
            mem_per_node_mb: num("SLURM_MEM_PER_NODE"),
            mem_per_cpu_mb: num("SLURM_MEM_PER_CPU"),
            cpus_on_node: num("SLURM_CPUS_ON_NODE"),
            version: lookup("SLURM_VERSION"),
        }
    }

    fn from_config(_config: &MemoryConfig) -> Box<dyn BatchSystem> {
        Box::new(Self::from_vars(|key| std::env::var(key).ok()))
    }
}

impl BatchSystem for Slurm {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    fn job_memory_limit_kb(&self) -> Option<u64> {
        let mb = match (self.mem_per_node_mb, self.mem_per_cpu_mb) {
            (Some(node), _) => node,
            (None, Some(cpu)) => cpu * self.cpus_on_node.unwrap_or(1),
            (None, None) => return None,
        };
        Some(mb * 1024)
    }
}

/// No batch system, or one that declares nothing.
#[derive(Clone, Debug, Default)]
pub struct NoBatch;

impl NoBatch {
    fn from_config(_config: &MemoryConfig) -> Box<dyn BatchSystem> {
        Box::new(NoBatch)
    }
}

impl BatchSystem for NoBatch {
    fn name(&self) -> &'static str {
        "none"
    }

    fn version(&self) -> Option<String> {
        None
    }

    fn job_memory_limit_kb(&self) -> Option<u64> {
        None
    }
}

type BatchCtor = fn(&MemoryConfig) -> Box<dyn BatchSystem>;

const BATCH_SYSTEMS: &[(&str, BatchCtor)] = &[
    ("htcondor", HtCondor::from_config),
    ("slurm", Slurm::from_config),
    ("none", NoBatch::from_config),
];

pub fn batch_system_names() -> Vec<&'static str> {
    BATCH_SYSTEMS.iter().map(|(name, _)| *name).collect()
}

pub fn batch_system_from_name(name: &str, config: &MemoryConfig) -> Result<Box<dyn BatchSystem>> {
    let (_, ctor) = BATCH_SYSTEMS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            anyhow!(
                "Unknown batch system '{}', expected one of {:?}",
                name,
                batch_system_names()
            )
        })?;
    let batch = ctor(config);
    debug!(
        "Batch system {} version={:?} memory_limit_kb={:?}",
        batch.name(),
        batch.version(),
        batch.job_memory_limit_kb()
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AD: &str = r#"
ClusterId = 4242
CondorVersion = "$CondorVersion: 10.0.3 2023-03-21 BuildID: 634000 $"
RequestMemory = 2000
MemoryProvisioned = 2048
PeriodicRemove = ResidentSetSize > JobMemoryLimit
Owner = "grid"
"#;

    #[test]
    fn test_htcondor_job_ad() {
        let condor = HtCondor::from_ad(AD);
        assert_eq!(condor.version().as_deref(), Some("10.0.3"));
        assert_eq!(condor.job_memory_limit_kb(), Some(2048 * 1024));
        assert_eq!(
            condor.removal_expression().as_deref(),
            Some("ResidentSetSize > JobMemoryLimit")
        );
        assert_eq!(condor.attributes().get("ClusterId"), Some(&4242.0));
        assert!(!condor.attributes().contains_key("Owner"));
        assert!(expression_supported(&condor));
    }

    #[test]
    fn test_old_or_unknown_htcondor_rejected() {
        let old = HtCondor::from_ad("CondorVersion = \"$CondorVersion: 8.8.12 Nov 24 2020 $\"\n");
        assert!(!expression_supported(&old));
        assert!(!expression_supported(&HtCondor::default()));
        assert!(HtCondor::from_ad("PeriodicRemove = FALSE\n")
            .removal_expression()
            .is_none());
    }

    #[test]
    fn test_slurm_env() {
        let env = BTreeMap::from([
            ("SLURM_MEM_PER_CPU", "1500"),
            ("SLURM_CPUS_ON_NODE", "4"),
        ]);
        let slurm = Slurm::from_vars(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(slurm.job_memory_limit_kb(), Some(6000 * 1024));
        assert!(slurm.removal_expression().is_none());
        assert!(expression_supported(&slurm));

        let slurm = Slurm::from_vars(|k| (k == "SLURM_MEM_PER_NODE").then(|| "8000".to_string()));
        assert_eq!(slurm.job_memory_limit_kb(), Some(8000 * 1024));
    }

    #[test]
    fn test_registry() {
        let config = MemoryConfig::default();
        assert_eq!(batch_system_from_name("none", &config).unwrap().name(), "none");
        assert_eq!(batch_system_from_name("SLURM", &config).unwrap().name(), "slurm");
        assert!(batch_system_from_name("pbs", &config).is_err());
    }
}
