// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cgroup topology
//!
//! Resolves the resource group this process lives in and reads its memory
//! counters.
//!
//! The group path comes from /proc/self/cgroup. On cgroup v1 the memory
//! controller's line is used; on v2 the unified "0::" line. The governor does
//! not care about the leaf group it was started in but about the *slot*: the
//! allocation boundary shared by every job the batch system gave us. That
//! boundary is the deepest path segment naming a batch slot
//! ("..._slot1_3@host" under HTCondor) or a batch job ("job_1234" under
//! Slurm). When no such segment exists the whole path is the slot.
//!
//! All values returned by this module are in KB.

use crate::misc::read_file_kv;
use crate::misc::read_from_file;
use crate::misc::read_limit_file;
use crate::misc::parse_kv;
use crate::misc::sub_or_zero;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

/// cgroup v1 reports "no limit" as PAGE_COUNTER_MAX pages, which depending on
/// page size lands somewhere above this.
const V1_UNLIMITED_THRESHOLD: u64 = 1 << 62;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupVersion::V1 => write!(f, "v1"),
            CgroupVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Point in time memory reading of the slot group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CgroupMemory {
    /// Resident memory (v1: rss + cache, v2: memory.current).
    pub rss_kb: u64,
    /// Swap in use, when the kernel accounts it.
    pub swap_kb: Option<u64>,
    /// Memory plus swap, when the kernel exposes a combined counter (v1 memsw).
    pub combined_kb: Option<u64>,
}

/// Hard limits configured on the slot group. None means not configured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CgroupLimits {
    pub rss_kb: Option<u64>,
    /// v1 memory+swap limit.
    pub combined_kb: Option<u64>,
    /// v2 swap-only limit.
    pub swap_kb: Option<u64>,
}

impl CgroupLimits {
    /// Whether any limit bounds usage. A zero swap limit only forbids swap,
    /// so on its own it leaves the group unbounded.
    pub fn is_configured(&self) -> bool {
        self.rss_kb.is_some()
            || self.combined_kb.is_some()
            || self.swap_kb.map_or(false, |s| s > 0)
    }
}

#[derive(Clone, Debug)]
pub struct CgroupTopology {
    version: CgroupVersion,
    mount: PathBuf,
    path: String,
    slot_path: String,
}

impl CgroupTopology {
    /// Resolve the cgroup of the running process. Ok(None) means the process
    /// is not in any usable memory cgroup.
    pub fn discover() -> Result<Option<CgroupTopology>> {
        Self::discover_at(Path::new("/proc/self/cgroup"), Path::new("/sys/fs/cgroup"))
    }

    pub fn discover_at(proc_cgroup: &Path, mount: &Path) -> Result<Option<CgroupTopology>> {
        let content = std::fs::read_to_string(proc_cgroup)
            .with_context(|| format!("Failed to read {:?}", proc_cgroup))?;
        let Some((version, path)) = parse_proc_cgroup(&content)? else {
            return Ok(None);
        };
        let slot_path = slot_segment(&path);
        let top = CgroupTopology {
            version,
            mount: mount.to_path_buf(),
            path,
            slot_path,
        };
        if !top.memory_dir().is_dir() {
            debug!("cgroup memory directory {:?} is not accessible", top.memory_dir());
            return Ok(None);
        }
        Ok(Some(top))
    }

    /// Build a topology for an explicitly configured slot path.
    pub fn with_slot_path(version: CgroupVersion, mount: &Path, slot_path: &str) -> CgroupTopology {
        CgroupTopology {
            version,
            mount: mount.to_path_buf(),
            path: slot_path.to_string(),
            slot_path: slot_path.to_string(),
        }
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// The group path of the process itself.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The group path of the slot boundary.
    pub fn slot_path(&self) -> &str {
        &self.slot_path
    }

    /// Directory holding the memory controller files of the slot.
    pub fn memory_dir(&self) -> PathBuf {
        let rel = self.slot_path.trim_start_matches('/');
        match self.version {
            CgroupVersion::V1 => self.mount.join("memory").join(rel),
            CgroupVersion::V2 => self.mount.join(rel),
        }
    }

    /// Read the current memory usage of the slot.
    pub fn sample(&self) -> Result<CgroupMemory> {
        let dir = self.memory_dir();
        match self.version {
            CgroupVersion::V1 => {
                let stat = read_file_kv(&dir.join("memory.stat"))?;
                let rss = match (stat.get("total_rss"), stat.get("total_cache")) {
                    (Some(rss), Some(cache)) => rss + cache,
                    _ => match (stat.get("rss"), stat.get("cache")) {
                        (Some(rss), Some(cache)) => rss + cache,
                        _ => bail!("memory.stat in {:?} has no rss/cache", dir),
                    },
                };
                let memsw = dir.join("memory.memsw.usage_in_bytes");
                let (swap_kb, combined_kb) = if memsw.exists() {
                    let memsw: u64 = read_from_file(&memsw)?;
                    let usage: u64 = read_from_file(&dir.join("memory.usage_in_bytes"))?;
                    let swap = sub_or_zero(memsw, usage) / 1024;
                    (Some(swap), Some(rss / 1024 + swap))
                } else {
                    (None, None)
                };
                Ok(CgroupMemory {
                    rss_kb: rss / 1024,
                    swap_kb,
                    combined_kb,
                })
            }
            CgroupVersion::V2 => {
                let current: u64 = read_from_file(&dir.join("memory.current"))?;
                let swap = dir.join("memory.swap.current");
                let swap_kb = if swap.exists() {
                    Some(read_from_file::<u64>(&swap)? / 1024)
                } else {
                    None
                };
                Ok(CgroupMemory {
                    rss_kb: current / 1024,
                    swap_kb,
                    combined_kb: None,
                })
            }
        }
    }

    /// Read the hard limits of the slot. Sentinel "unlimited" values map to
    /// None.
    pub fn limits(&self) -> Result<CgroupLimits> {
        let dir = self.memory_dir();
        match self.version {
            CgroupVersion::V1 => {
                let stat = read_file_kv(&dir.join("memory.stat"))?;
                let limit = |key: &str| {
                    stat.get(key)
                        .copied()
                        .filter(|v| *v < V1_UNLIMITED_THRESHOLD)
                        .map(|v| v / 1024)
                };
                Ok(CgroupLimits {
                    rss_kb: limit("hierarchical_memory_limit"),
                    combined_kb: limit("hierarchical_memsw_limit"),
                    swap_kb: None,
                })
            }
            CgroupVersion::V2 => {
                let swap = dir.join("memory.swap.max");
                let swap_kb = if swap.exists() {
                    read_limit_file(&swap)?.map(|v| v / 1024)
                } else {
                    None
                };
                Ok(CgroupLimits {
                    rss_kb: read_limit_file(&dir.join("memory.max"))?.map(|v| v / 1024),
                    combined_kb: None,
                    swap_kb,
                })
            }
        }
    }
}

/// Parse /proc/self/cgroup content into the memory group path.
fn parse_proc_cgroup(content: &str) -> Result<Option<(CgroupVersion, String)>> {
    let mut unified = None;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(3, ':').collect();
        if fields.len() != 3 {
            bail!("Malformed cgroup line {:?}", line);
        }
        if fields[1].split(',').any(|c| c == "memory") {
            return Ok(Some((CgroupVersion::V1, fields[2].to_string())));
        }
        if fields[0] == "0" && fields[1].is_empty() {
            unified = Some(fields[2].to_string());
        }
    }
    Ok(unified.map(|path| (CgroupVersion::V2, path)))
}

/// Truncate a group path at the deepest segment that identifies the batch
/// slot or job.
pub fn slot_segment(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let boundary = segments.iter().rposition(|seg| {
        (seg.contains("slot") && !seg.ends_with(".slice")) || seg.starts_with("job_")
    });
    match boundary {
        Some(idx) => {
            let joined = segments[..=idx].join("/");
            if joined.starts_with('/') {
                joined
            } else {
                format!("/{}", joined)
            }
        }
        None => path.to_string(),
    }
}

/// Whole machine memory figures from /proc/meminfo.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub mem_total_kb: u64,
    pub mem_free_kb: u64,
    pub mem_available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

impl MemInfo {
    pub fn read() -> Result<MemInfo> {
        Self::read_from(Path::new("/proc/meminfo"))
    }

    pub fn read_from(path: &Path) -> Result<MemInfo> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let kv = parse_kv(&content);
        let Some(&mem_free_kb) = kv.get("MemFree") else {
            bail!("{:?} has no MemFree", path);
        };
        Ok(MemInfo {
            mem_total_kb: kv.get("MemTotal").copied().unwrap_or(0),
            mem_free_kb,
            // Kernels before 3.14 do not report MemAvailable.
            mem_available_kb: kv.get("MemAvailable").copied().unwrap_or(mem_free_kb),
            swap_total_kb: kv.get("SwapTotal").copied().unwrap_or(0),
            swap_free_kb: kv.get("SwapFree").copied().unwrap_or(0),
        })
    }
}
