// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # NUMA Topology
//!
//! Discovers, once, how the host's CPU cores are grouped into NUMA nodes and
//! which of them are available to the governor.
//!
//! A NumaTopology is made of one or more NodeSpan objects. Each NodeSpan is an
//! *ordinal*: a logical group of cores that placement treats as one locality
//! domain. Usually there is one ordinal per NUMA node, but a node whose cpulist
//! holds several disjoint ranges (e.g. "0-7,32-39") is split into one ordinal
//! per range, all of them sharing the node's NUMA id:
//!
//!```text
//!     NumaTopology
//!          |
//!          o-------------------------o-------------------------o
//!          |                         |                         |
//!     NodeSpan 0                NodeSpan 1                NodeSpan 2
//!     numa_id 0                 numa_id 0                 numa_id 1
//!     span  0-7                 span  32-39               span  8-15
//!     free  0-5                 free  32-39               free  8-15
//!```
//!
//! `span` is every core of the ordinal; `free` is the subset not already
//! pinned by a workload outside the governor's control.
//!
//! If the kernel exposes no node information, or any node listing fails to
//! parse, the whole host collapses into a single synthetic ordinal. A
//! partially parsed topology could hand the same core out twice, so it is
//! never used.

use crate::misc::read_from_file;
use crate::Cpumask;
use crate::cpumask::parse_cpulist_group;
use crate::cpumask::read_cpulist;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use log::warn;
use sscanf::sscanf;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NodeSpan {
    ordinal: usize,
    numa_id: usize,
    span: Cpumask,
    free: Cpumask,
}

impl NodeSpan {
    /// Get the ordinal of this core group.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Get the absolute NUMA node id the group belongs to.
    pub fn numa_id(&self) -> usize {
        self.numa_id
    }

    /// Get a Cpumask of every core in the group.
    pub fn span(&self) -> &Cpumask {
        &self.span
    }

    /// Get a Cpumask of the cores in the group which are available.
    pub fn free(&self) -> &Cpumask {
        &self.free
    }

    /// Number of available cores.
    pub fn nr_free(&self) -> usize {
        self.free.weight()
    }
}

#[derive(Debug, Clone)]
pub struct NumaTopology {
    nr_cpus: usize,
    nodes: Vec<NodeSpan>,
    cpu_ordinal: BTreeMap<usize, usize>,
    synthetic: bool,
}

impl NumaTopology {
    /// Discover the host topology from sysfs. Cores set in @exclude are
    /// considered already taken.
    pub fn discover(exclude: &Cpumask) -> NumaTopology {
        Self::discover_at(Path::new("/sys"), exclude.len(), exclude)
    }

    /// Discover the topology below an arbitrary sysfs root, for @nr_cpus CPU
    /// ids.
    pub fn discover_at(sysfs: &Path, nr_cpus: usize, exclude: &Cpumask) -> NumaTopology {
        let node_root = sysfs.join("devices/system/node");
        match read_numa_nodes(&node_root, nr_cpus) {
            Ok(listing) if !listing.is_empty() => Self::from_listing(nr_cpus, listing, exclude),
            Ok(_) => {
                debug!(
                    "No NUMA information under {:?}, using a single node",
                    node_root
                );
                Self::synthetic(nr_cpus, exclude)
            }
            Err(e) => {
                warn!("Failed to parse NUMA topology ({:#}), using a single node", e);
                Self::synthetic(nr_cpus, exclude)
            }
        }
    }

    /// Single node covering every core not in @exclude.
    pub fn synthetic(nr_cpus: usize, exclude: &Cpumask) -> NumaTopology {
        let span = Cpumask::full(nr_cpus);
        let free = span.and_not(exclude);
        let cpu_ordinal = (0..nr_cpus).map(|cpu| (cpu, 0)).collect();
        NumaTopology {
            nr_cpus,
            nodes: vec![NodeSpan {
                ordinal: 0,
                numa_id: 0,
                span,
                free,
            }],
            cpu_ordinal,
            synthetic: true,
        }
    }

    /// Build a topology from explicit (numa_id, span) pairs, one per ordinal.
    pub fn from_spans(
        nr_cpus: usize,
        spans: &[(usize, Cpumask)],
        exclude: &Cpumask,
    ) -> NumaTopology {
        let listing = spans.iter().map(|(id, mask)| (*id, mask.clone())).collect();
        Self::from_listing(nr_cpus, listing, exclude)
    }

    fn from_listing(
        nr_cpus: usize,
        listing: Vec<(usize, Cpumask)>,
        exclude: &Cpumask,
    ) -> NumaTopology {
        let mut nodes = Vec::new();
        let mut cpu_ordinal = BTreeMap::new();
        for (ordinal, (numa_id, span)) in listing.into_iter().enumerate() {
            for cpu in span.iter() {
                cpu_ordinal.insert(cpu, ordinal);
            }
            let free = span.and_not(exclude);
            nodes.push(NodeSpan {
                ordinal,
                numa_id,
                span,
                free,
            });
        }

        NumaTopology {
            nr_cpus,
            nodes,
            cpu_ordinal,
            synthetic: false,
        }
    }

    /// Width of every mask produced from this topology.
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Get a slice of the core groups on the host, indexed by ordinal.
    pub fn nodes(&self) -> &[NodeSpan] {
        &self.nodes
    }

    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Ordinal owning @cpu, if the core is known.
    pub fn cpu_ordinal(&self, cpu: usize) -> Option<usize> {
        self.cpu_ordinal.get(&cpu).copied()
    }

    /// Map of ordinal to absolute NUMA id.
    pub fn ordinal_numa_ids(&self) -> BTreeMap<usize, usize> {
        self.nodes.iter().map(|n| (n.ordinal, n.numa_id)).collect()
    }

    /// Union of the available cores of every ordinal.
    pub fn free_span(&self) -> Cpumask {
        let mut mask = Cpumask::new(self.nr_cpus);
        for node in self.nodes.iter() {
            mask |= &node.free;
        }
        mask
    }

    /// Whether the single-node fallback is in use.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }
}

/// Number of possible CPU ids, from /sys/devices/system/cpu/possible. Falls
/// back to the configured processor count.
pub fn nr_cpu_ids(sysfs: &Path) -> usize {
    let path = sysfs.join("devices/system/cpu/possible");
    match std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|list| read_cpulist(&list))
    {
        Ok(cpus) if !cpus.is_empty() => cpus.iter().max().map_or(1, |max| max + 1),
        _ => {
            let nr = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
            if nr > 0 {
                nr as usize
            } else {
                1
            }
        }
    }
}

/**********************************************
 * Helper functions for reading the topology  *
 **********************************************/

/// Split a node cpulist into ordinals. A listing with more than one "a-b"
/// range yields one span per range plus, if present, one span holding the
/// remaining singletons. Anything else is a single span.
fn split_node_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Vec<Cpumask>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let groups: Vec<&str> = cpulist.split(',').filter(|g| !g.trim().is_empty()).collect();
    let nr_ranges = groups.iter().filter(|g| g.contains('-')).count();

    if nr_ranges <= 1 {
        return Ok(vec![Cpumask::from_cpulist(cpulist, nr_cpus)?]);
    }

    let mut spans = Vec::new();
    let mut singles = Cpumask::new(nr_cpus);
    for group in groups {
        let (min, max) = parse_cpulist_group(group)?;
        if min == max {
            singles.set_cpu(min)?;
        } else {
            spans.push(Cpumask::from_cpus(min..=max, nr_cpus)?);
        }
    }
    if !singles.is_empty() {
        spans.push(singles);
    }
    Ok(spans)
}

fn read_numa_nodes(node_root: &Path, nr_cpus: usize) -> Result<Vec<(usize, Cpumask)>> {
    let mut node_dirs: Vec<(usize, PathBuf)> = Vec::new();
    let pattern = node_root.join("node[0-9]*");
    for numa_path in glob(pattern.to_string_lossy().as_ref())?.filter_map(Result::ok) {
        let name = numa_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let node_id = match sscanf!(name.as_str(), "node{usize}") {
            Ok(val) => val,
            Err(_) => {
                bail!("Failed to parse NUMA node ID {}", name);
            }
        };
        node_dirs.push((node_id, numa_path));
    }
    node_dirs.sort_by_key(|(id, _)| *id);

    let mut listing = Vec::new();
    let mut seen = Cpumask::new(nr_cpus);
    for (node_id, path) in node_dirs {
        let cpulist: String = read_from_file(&path.join("cpulist"))
            .with_context(|| format!("Failed to read cpulist of NUMA node {}", node_id))?;
        // Memory-only nodes carry no cores.
        if cpulist.trim().is_empty() {
            continue;
        }
        for span in split_node_cpulist(&cpulist, nr_cpus)
            .with_context(|| format!("NUMA node {} cpulist {:?}", node_id, cpulist))?
        {
            if seen.intersects(&span) {
                bail!("NUMA node {} repeats cores {}", node_id, span.and(&seen).to_cpulist());
            }
            seen |= &span;
            listing.push((node_id, span));
        }
    }

    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_node(root: &Path, id: usize, cpulist: &str) {
        let dir = root.join(format!("devices/system/node/node{}", id));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cpulist"), format!("{}\n", cpulist)).unwrap();
    }

    #[test]
    fn test_two_regular_nodes() {
        let tmp = TempDir::new().unwrap();
        fake_node(tmp.path(), 0, "0-3");
        fake_node(tmp.path(), 1, "4-7");

        let top = NumaTopology::discover_at(tmp.path(), 8, &Cpumask::new(8));
        assert!(!top.is_synthetic());
        assert_eq!(top.nr_nodes(), 2);
        assert_eq!(top.nodes()[0].free().to_cpulist(), "0-3");
        assert_eq!(top.nodes()[1].nr_free(), 4);
        assert_eq!(top.cpu_ordinal(5), Some(1));
        assert_eq!(top.ordinal_numa_ids()[&1], 1);
    }

    #[test]
    fn test_singleton_listing_is_one_ordinal() {
        let tmp = TempDir::new().unwrap();
        fake_node(tmp.path(), 0, "0,2,4,6");
        fake_node(tmp.path(), 1, "1,3,5,7");

        let top = NumaTopology::discover_at(tmp.path(), 8, &Cpumask::new(8));
        assert_eq!(top.nr_nodes(), 2);
        assert_eq!(top.nodes()[1].span().to_core_list(), "1,3,5,7");
    }

    #[test]
    fn test_irregular_node_is_split() {
        let tmp = TempDir::new().unwrap();
        fake_node(tmp.path(), 0, "0-1,4-5");
        fake_node(tmp.path(), 1, "2-3,6-7");

        let top = NumaTopology::discover_at(tmp.path(), 8, &Cpumask::new(8));
        assert_eq!(top.nr_nodes(), 4);
        let ids: Vec<usize> = top.nodes().iter().map(|n| n.numa_id()).collect();
        assert_eq!(ids, vec![0, 0, 1, 1]);
        assert_eq!(top.cpu_ordinal(4), Some(1));
        assert_eq!(top.cpu_ordinal(6), Some(3));
    }

    #[test]
    fn test_excluded_cores_start_unavailable() {
        let tmp = TempDir::new().unwrap();
        fake_node(tmp.path(), 0, "0-3");
        fake_node(tmp.path(), 1, "4-7");

        let exclude = Cpumask::from_cpulist("0,1,7", 8).unwrap();
        let top = NumaTopology::discover_at(tmp.path(), 8, &exclude);
        assert_eq!(top.nodes()[0].free().to_cpulist(), "2-3");
        assert_eq!(top.nodes()[1].free().to_cpulist(), "4-6");
        assert_eq!(top.free_span().weight(), 5);
    }

    #[test]
    fn test_no_topology_falls_back_to_single_node() {
        let tmp = TempDir::new().unwrap();
        let exclude = Cpumask::from_cpulist("3", 4).unwrap();

        let top = NumaTopology::discover_at(tmp.path(), 4, &exclude);
        assert!(top.is_synthetic());
        assert_eq!(top.nr_nodes(), 1);
        assert_eq!(top.nodes()[0].free().to_cpulist(), "0-2");
    }

    #[test]
    fn test_malformed_node_falls_back_to_single_node() {
        let tmp = TempDir::new().unwrap();
        fake_node(tmp.path(), 0, "0-3");
        fake_node(tmp.path(), 1, "4-x");

        let top = NumaTopology::discover_at(tmp.path(), 8, &Cpumask::new(8));
        assert!(top.is_synthetic());
        assert_eq!(top.nodes()[0].nr_free(), 8);
    }

    #[test]
    fn test_overlapping_nodes_fall_back() {
        let tmp = TempDir::new().unwrap();
        fake_node(tmp.path(), 0, "0-4");
        fake_node(tmp.path(), 1, "4-7");

        let top = NumaTopology::discover_at(tmp.path(), 8, &Cpumask::new(8));
        assert!(top.is_synthetic());
    }

    #[test]
    fn test_memory_only_node_is_skipped() {
        let tmp = TempDir::new().unwrap();
        fake_node(tmp.path(), 0, "0-3");
        fake_node(tmp.path(), 1, "");

        let top = NumaTopology::discover_at(tmp.path(), 4, &Cpumask::new(4));
        assert_eq!(top.nr_nodes(), 1);
        assert!(!top.is_synthetic());
    }

    #[test]
    fn test_nr_cpu_ids_from_possible() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("devices/system/cpu");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("possible"), "0-11\n").unwrap();
        assert_eq!(nr_cpu_ids(tmp.path()), 12);
    }
}
