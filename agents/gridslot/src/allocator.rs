// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # NUMA aware core allocator
//!
//! Splits the slot's cores among the jobs running in it.
//!
//! Placement
//! ---------
//!
//! Every job asks for a number of cores. The allocator first looks for a
//! single core group (ordinal, see `NumaTopology`) with enough free cores,
//! starting at `job_id % nr_ordinals` so that concurrent jobs spread over the
//! nodes, and takes the lowest free cores of the first group that fits.
//!
//! When no group fits, the existing jobs are *rearranged*: the free masks are
//! rebuilt from the baseline and every running job is placed again, largest
//! request first, each into the fullest group that still fits it. If that
//! frees a group for the new job, the new layout is committed and every job
//! whose cores moved is re-pinned before the new job is placed. Otherwise the
//! old layout stays and the new job is *partitioned* over the ordinals of the
//! NUMA node with the most free cores, or *spread* over the whole machine if
//! no single node can hold it. A request larger than what is free gets every
//! free core; refusing work is the coordinator's business, not ours.
//!
//! Canonical and effective masks
//! -----------------------------
//!
//! The cores handed out above form the *canonical* assignment: no core is
//! ever in two canonical masks. On top of it, when idle extension is enabled,
//! each job may also run on the idle cores of its NUMA scope (its node, or
//! the whole machine for spread jobs) and on the cores of jobs that agreed to
//! share theirs. These *effective* masks may overlap between jobs. They are
//! derived from the canonical assignment after every change and are never
//! used as ground truth.
//!
//! All state lives behind a single mutex and every affinity update caused by
//! a change is applied before that mutex is released.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::bail;
use anyhow::Result;
use gridslot_utils::Cpumask;
use gridslot_utils::NumaTopology;
use log::debug;
use log::info;
use log::warn;
use metrics::counter;

use crate::affinity::CpuPinner;

/// Where a job's canonical cores live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Home {
    /// Entirely inside one ordinal.
    Node(usize),
    /// Partitioned across the ordinals of one NUMA node.
    Numa(usize),
    /// Spread over the whole machine.
    Spread,
}

impl fmt::Display for Home {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Home::Node(ord) => write!(f, "node[{}]", ord),
            Home::Numa(id) => write!(f, "numa[{}]", id),
            Home::Spread => write!(f, "spread"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementReason {
    Fit,
    Rearranged,
    Partitioned,
    Spread,
    BestEffort,
}

impl PlacementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementReason::Fit => "fit",
            PlacementReason::Rearranged => "rearranged",
            PlacementReason::Partitioned => "partitioned",
            PlacementReason::Spread => "spread",
            PlacementReason::BestEffort => "best_effort",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoreRequest {
    pub job_id: u64,
    pub cores: usize,
    /// The job accepts that other jobs of its scope run on its idle cores.
    pub share_idle: bool,
}

#[derive(Clone, Debug)]
pub struct Placement {
    pub job_id: u64,
    pub home: Home,
    pub reason: PlacementReason,
    /// Canonical cores of the job.
    pub mask: Cpumask,
    /// Cores the job may run on, idle extension included.
    pub effective: Cpumask,
}

impl Placement {
    /// The core list to hand to the payload's affinity call.
    pub fn core_list(&self) -> String {
        self.effective.to_core_list()
    }
}

/// Snapshot of one job's assignment.
#[derive(Clone, Debug, PartialEq)]
pub struct JobCores {
    pub job_id: u64,
    pub cores: usize,
    pub home: Home,
    pub mask: Cpumask,
    pub effective: Cpumask,
    pub pid: Option<i32>,
}

#[derive(Clone, Debug)]
struct NodeState {
    numa_id: usize,
    baseline: Cpumask,
    free: Cpumask,
}

#[derive(Clone, Debug)]
struct JobEntry {
    job_id: u64,
    cores: usize,
    share_idle: bool,
    home: Home,
    mask: Cpumask,
    effective: Cpumask,
    pid: Option<i32>,
}

#[derive(Clone, Debug)]
struct AllocState {
    nr_cpus: usize,
    nodes: Vec<NodeState>,
    cpu_ordinal: BTreeMap<usize, usize>,
    /// In admission order, which is also the tie-break order of rearrangement.
    jobs: Vec<JobEntry>,
    extend_idle: bool,
}

impl AllocState {
    fn start_ordinal(&self, id: u64) -> usize {
        (id % self.nodes.len() as u64) as usize
    }

    fn scan_order(&self, start: usize) -> impl Iterator<Item = usize> + '_ {
        let nr = self.nodes.len();
        (0..nr).map(move |i| (start + i) % nr)
    }

    fn first_fit_node(&self, cores: usize, start: usize) -> Option<usize> {
        self.scan_order(start)
            .find(|&ord| self.nodes[ord].free.weight() >= cores)
    }

    /// Fitting ordinal with the fewest free cores, earliest in scan order on
    /// ties.
    fn best_fit_node(&self, cores: usize, start: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for ord in self.scan_order(start) {
            let free = self.nodes[ord].free.weight();
            if free < cores {
                continue;
            }
            if best.map_or(true, |(_, best_free)| free < best_free) {
                best = Some((ord, free));
            }
        }
        best.map(|(ord, _)| ord)
    }

    fn take(&mut self, ord: usize, cores: usize) -> Cpumask {
        let node = &mut self.nodes[ord];
        let picked = node
            .free
            .first_n(cores.min(node.free.weight()))
            .unwrap_or_else(|| Cpumask::new(node.free.len()));
        node.free = node.free.and_not(&picked);
        picked
    }

    /// Partition @cores over the NUMA node with the most free cores, or over
    /// every ordinal if no node is large enough.
    fn partition(&mut self, cores: usize) -> (Home, Cpumask) {
        let mut by_numa: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (ord, node) in self.nodes.iter().enumerate() {
            by_numa.entry(node.numa_id).or_default().push(ord);
        }

        let mut best: Option<(usize, usize)> = None;
        for (numa_id, ords) in by_numa.iter() {
            let free: usize = ords.iter().map(|&o| self.nodes[o].free.weight()).sum();
            if best.map_or(true, |(_, best_free)| free > best_free) {
                best = Some((*numa_id, free));
            }
        }

        let (home, ords) = match best {
            Some((numa_id, free)) if free >= cores => {
                (Home::Numa(numa_id), by_numa[&numa_id].clone())
            }
            _ => (Home::Spread, (0..self.nodes.len()).collect()),
        };

        let mut mask = Cpumask::new(self.nr_cpus);
        let mut remaining = cores;
        for ord in ords {
            if remaining == 0 {
                break;
            }
            let picked = self.take(ord, remaining);
            remaining -= picked.weight();
            mask |= &picked;
        }
        (home, mask)
    }

    fn release(&mut self, mask: &Cpumask) {
        for cpu in mask.iter() {
            match self.cpu_ordinal.get(&cpu) {
                Some(&ord) => {
                    let _ = self.nodes[ord].free.set_cpu(cpu);
                }
                None => warn!("Released CPU {} belongs to no core group", cpu),
            }
        }
    }

    fn scope_mask(&self, home: Home) -> Cpumask {
        let numa_id = match home {
            Home::Node(ord) => Some(self.nodes[ord].numa_id),
            Home::Numa(id) => Some(id),
            Home::Spread => None,
        };
        let mut scope = Cpumask::new(self.nr_cpus);
        for node in self.nodes.iter() {
            if numa_id.map_or(true, |id| id == node.numa_id) {
                scope |= &node.baseline;
            }
        }
        scope
    }

    /// Recompute every job's effective mask. Returns the indices of jobs whose
    /// effective mask changed.
    fn refresh_effective(&mut self) -> Vec<usize> {
        let mut idle = Cpumask::new(self.nr_cpus);
        for node in self.nodes.iter() {
            idle |= &node.free;
        }
        let mut shared = Cpumask::new(self.nr_cpus);
        for job in self.jobs.iter().filter(|j| j.share_idle) {
            shared |= &job.mask;
        }
        let idle = idle.or(&shared);

        let mut changed = vec![];
        for idx in 0..self.jobs.len() {
            let effective = if self.extend_idle {
                let scope = self.scope_mask(self.jobs[idx].home);
                self.jobs[idx].mask.or(&idle.and(&scope))
            } else {
                self.jobs[idx].mask.clone()
            };
            if effective != self.jobs[idx].effective {
                self.jobs[idx].effective = effective;
                changed.push(idx);
            }
        }
        changed
    }

    /// Replay every running job from the baseline, largest request first.
    /// Returns the rebuilt state if it leaves room for @cores on one ordinal.
    fn rearranged(&self, new_job: u64, cores: usize) -> Option<AllocState> {
        let mut trial = self.clone();
        for node in trial.nodes.iter_mut() {
            node.free = node.baseline.clone();
        }

        let mut order: Vec<usize> = (0..trial.jobs.len()).collect();
        order.sort_by(|&a, &b| trial.jobs[b].cores.cmp(&trial.jobs[a].cores));

        for idx in order {
            let (job_id, assigned) = (trial.jobs[idx].job_id, trial.jobs[idx].mask.weight());
            let start = trial.start_ordinal(job_id);
            let (home, mask) = match trial.best_fit_node(assigned, start) {
                Some(ord) => (Home::Node(ord), trial.take(ord, assigned)),
                None => trial.partition(assigned),
            };
            trial.jobs[idx].home = home;
            trial.jobs[idx].mask = mask;
        }

        let start = trial.start_ordinal(new_job);
        trial.best_fit_node(cores, start).map(|_| trial)
    }

    /// Assert the canonical assignment is consistent: no core in two jobs and
    /// no assigned core marked free.
    fn verify(&self) {
        let mut free = Cpumask::new(self.nr_cpus);
        let mut baseline = Cpumask::new(self.nr_cpus);
        for node in self.nodes.iter() {
            free |= &node.free;
            baseline |= &node.baseline;
        }
        let mut used = Cpumask::new(self.nr_cpus);
        for job in self.jobs.iter() {
            assert!(
                !used.intersects(&job.mask),
                "job {} shares cores {} with another job",
                job.job_id,
                used.and(&job.mask).to_cpulist()
            );
            assert!(
                !free.intersects(&job.mask),
                "job {} holds cores {} which are marked free",
                job.job_id,
                free.and(&job.mask).to_cpulist()
            );
            used |= &job.mask;
        }
        assert!(
            baseline.contains(&used),
            "assigned cores {} outside the slot baseline",
            used.and_not(&baseline).to_cpulist()
        );
    }

    fn find(&self, job_id: u64) -> Option<usize> {
        self.jobs.iter().position(|j| j.job_id == job_id)
    }
}

pub struct CpuAllocator {
    state: Mutex<AllocState>,
    pinner: Arc<dyn CpuPinner>,
}

impl CpuAllocator {
    pub fn new(top: &NumaTopology, pinner: Arc<dyn CpuPinner>, extend_idle: bool) -> Self {
        let nodes = top
            .nodes()
            .iter()
            .map(|n| NodeState {
                numa_id: n.numa_id(),
                baseline: n.free().clone(),
                free: n.free().clone(),
            })
            .collect();
        let cpu_ordinal = (0..top.nr_cpus())
            .filter_map(|cpu| top.cpu_ordinal(cpu).map(|ord| (cpu, ord)))
            .collect();

        Self {
            state: Mutex::new(AllocState {
                nr_cpus: top.nr_cpus(),
                nodes,
                cpu_ordinal,
                jobs: vec![],
                extend_idle,
            }),
            pinner,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn repin(&self, state: &AllocState, changed: &[usize]) {
        for &idx in changed {
            let job = &state.jobs[idx];
            if let Some(pid) = job.pid {
                debug!(
                    "job {} (pid {}) re-pinned to {}",
                    job.job_id,
                    pid,
                    job.effective.to_cpulist()
                );
                if let Err(e) = self.pinner.pin(pid, &job.effective) {
                    warn!("Failed to re-pin job {}: {:#}", job.job_id, e);
                }
            }
        }
    }

    /// Choose the governor's own mask of @cores cores before any job runs and
    /// shrink the baseline to it. @cores of 0 takes every free core.
    pub fn compute_initial_mask(&self, cores: usize, queue_id: u64) -> Result<Cpumask> {
        let mut state = self.lock();
        if !state.jobs.is_empty() {
            bail!("Initial mask requested with {} jobs running", state.jobs.len());
        }
        let total: usize = state.nodes.iter().map(|n| n.free.weight()).sum();
        let cores = if cores == 0 || cores > total { total } else { cores };

        let start = state.start_ordinal(queue_id);
        let (home, mask) = match state.first_fit_node(cores, start) {
            Some(ord) => (Home::Node(ord), state.take(ord, cores)),
            None => state.partition(cores),
        };

        for node in state.nodes.iter_mut() {
            node.baseline = node.baseline.and(&mask);
            node.free = node.baseline.clone();
        }
        info!(
            "Slot cores {} ({} of {} requested, {})",
            mask.to_cpulist(),
            mask.weight(),
            cores,
            home
        );
        Ok(mask)
    }

    /// Place a new job. Returns its canonical and effective masks.
    pub fn pick_cores(&self, req: &CoreRequest) -> Result<Placement> {
        if req.cores == 0 {
            bail!("Job {} requested zero cores", req.job_id);
        }
        let mut state = self.lock();
        if state.find(req.job_id).is_some() {
            bail!("Job {} already holds cores", req.job_id);
        }

        let start = state.start_ordinal(req.job_id);
        let (home, mask, reason) = if let Some(ord) = state.first_fit_node(req.cores, start) {
            (Home::Node(ord), state.take(ord, req.cores), PlacementReason::Fit)
        } else if self.rearrange_locked(&mut state, req.job_id, req.cores) {
            match state.first_fit_node(req.cores, start) {
                Some(ord) => (
                    Home::Node(ord),
                    state.take(ord, req.cores),
                    PlacementReason::Rearranged,
                ),
                None => {
                    let (home, mask) = state.partition(req.cores);
                    (home, mask, PlacementReason::Partitioned)
                }
            }
        } else {
            let (home, mask) = state.partition(req.cores);
            let reason = match home {
                _ if mask.weight() < req.cores => PlacementReason::BestEffort,
                Home::Spread => PlacementReason::Spread,
                _ => PlacementReason::Partitioned,
            };
            (home, mask, reason)
        };

        state.jobs.push(JobEntry {
            job_id: req.job_id,
            cores: req.cores,
            share_idle: req.share_idle,
            home,
            mask: mask.clone(),
            effective: mask.clone(),
            pid: None,
        });
        let changed = state.refresh_effective();
        state.verify();
        self.repin(&state, &changed);

        let effective = state.jobs[state.jobs.len() - 1].effective.clone();
        counter!("placements_total", "reason" => reason.as_str()).increment(1);
        info!(
            "job {} got {} cores on {} ({}): {} effective {}",
            req.job_id,
            mask.weight(),
            home,
            reason.as_str(),
            mask.to_cpulist(),
            effective.to_cpulist()
        );

        Ok(Placement {
            job_id: req.job_id,
            home,
            reason,
            mask,
            effective,
        })
    }

    fn rearrange_locked(&self, state: &mut AllocState, new_job: u64, cores: usize) -> bool {
        let start = state.start_ordinal(new_job);
        if state.first_fit_node(cores, start).is_some() {
            return true;
        }
        let Some(mut trial) = state.rearranged(new_job, cores) else {
            debug!("Rearrangement cannot make room for {} cores", cores);
            return false;
        };

        let mut moved = vec![];
        for (idx, (old, new)) in state.jobs.iter().zip(trial.jobs.iter()).enumerate() {
            if old.mask != new.mask {
                info!(
                    "job {} moved from {} {} to {} {}",
                    new.job_id,
                    old.home,
                    old.mask.to_cpulist(),
                    new.home,
                    new.mask.to_cpulist()
                );
                moved.push(idx);
            }
        }
        let changed = trial.refresh_effective();
        trial.verify();
        *state = trial;
        self.repin(state, &changed);
        counter!("rearrangements_total").increment(1);
        info!("Rearranged {} jobs to make room for {} cores", moved.len(), cores);
        true
    }

    /// Rearrange the running jobs so that @cores cores fit on one ordinal.
    /// Leaves the assignment untouched if they already fit or if no
    /// rearrangement helps. Returns whether the request now fits.
    pub fn rearrange(&self, new_job: u64, cores: usize) -> bool {
        let mut state = self.lock();
        self.rearrange_locked(&mut state, new_job, cores)
    }

    /// Record the payload pid of a placed job and pin it.
    pub fn attach_pid(&self, job_id: u64, pid: i32) -> Result<()> {
        let mut state = self.lock();
        let Some(idx) = state.find(job_id) else {
            bail!("Job {} holds no cores", job_id);
        };
        state.jobs[idx].pid = Some(pid);
        self.pinner.pin(pid, &state.jobs[idx].effective)
    }

    /// Return a finished job's cores to their groups. Returns the number of
    /// canonical cores released.
    pub fn refill(&self, job_id: u64) -> Option<usize> {
        let mut state = self.lock();
        let idx = state.find(job_id)?;
        let job = state.jobs.remove(idx);
        state.release(&job.mask);
        let changed = state.refresh_effective();
        state.verify();
        self.repin(&state, &changed);
        info!(
            "job {} released {} cores: {}",
            job_id,
            job.mask.weight(),
            job.mask.to_cpulist()
        );
        Some(job.mask.weight())
    }

    /// Current effective mask of a job.
    pub fn effective_mask(&self, job_id: u64) -> Option<Cpumask> {
        let state = self.lock();
        state.find(job_id).map(|idx| state.jobs[idx].effective.clone())
    }

    pub fn jobs(&self) -> Vec<JobCores> {
        self.lock()
            .jobs
            .iter()
            .map(|j| JobCores {
                job_id: j.job_id,
                cores: j.cores,
                home: j.home,
                mask: j.mask.clone(),
                effective: j.effective.clone(),
                pid: j.pid,
            })
            .collect()
    }

    /// Free core count of each ordinal.
    pub fn node_free(&self) -> Vec<usize> {
        self.lock().nodes.iter().map(|n| n.free.weight()).collect()
    }

    pub fn free_mask(&self) -> Cpumask {
        let state = self.lock();
        let mut mask = Cpumask::new(state.nr_cpus);
        for node in state.nodes.iter() {
            mask |= &node.free;
        }
        mask
    }

    pub fn free_cores(&self) -> usize {
        self.lock().nodes.iter().map(|n| n.free.weight()).sum()
    }

    /// Cores of the slot baseline, used or not.
    pub fn usable_cores(&self) -> usize {
        self.lock().nodes.iter().map(|n| n.baseline.weight()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::RecordingPinner;

    fn two_by_four(extend_idle: bool) -> (CpuAllocator, Arc<RecordingPinner>) {
        let spans = vec![
            (0, Cpumask::from_cpulist("0-3", 8).unwrap()),
            (1, Cpumask::from_cpulist("4-7", 8).unwrap()),
        ];
        let top = NumaTopology::from_spans(8, &spans, &Cpumask::new(8));
        let pinner = Arc::new(RecordingPinner::new());
        (CpuAllocator::new(&top, pinner.clone(), extend_idle), pinner)
    }

    fn req(job_id: u64, cores: usize) -> CoreRequest {
        CoreRequest {
            job_id,
            cores,
            share_idle: false,
        }
    }

    fn assert_disjoint(alloc: &CpuAllocator) {
        let jobs = alloc.jobs();
        for (i, a) in jobs.iter().enumerate() {
            for b in jobs.iter().skip(i + 1) {
                assert!(!a.mask.intersects(&b.mask), "{:?} overlaps {:?}", a, b);
            }
        }
        let assigned: usize = jobs.iter().map(|j| j.mask.weight()).sum();
        assert!(assigned + alloc.free_cores() == alloc.usable_cores());
    }

    #[test]
    fn test_two_node_scenario() {
        let (alloc, _) = two_by_four(false);

        let a = alloc.pick_cores(&req(0, 3)).unwrap();
        assert_eq!(a.home, Home::Node(0));
        assert_eq!(a.mask.to_cpulist(), "0-2");
        assert_eq!(a.reason, PlacementReason::Fit);

        let b = alloc.pick_cores(&req(2, 3)).unwrap();
        assert_eq!(b.home, Home::Node(1));
        assert_eq!(b.mask.to_cpulist(), "4-6");

        let c = alloc.pick_cores(&req(3, 2)).unwrap();
        assert_eq!(c.mask.to_cpulist(), "3,7");
        assert_eq!(c.home, Home::Spread);
        assert_eq!(c.reason, PlacementReason::Spread);
        assert_eq!(alloc.free_cores(), 0);
        assert_disjoint(&alloc);
    }

    #[test]
    fn test_start_ordinal_follows_job_id() {
        let (alloc, _) = two_by_four(false);
        let p = alloc.pick_cores(&req(5, 2)).unwrap();
        assert_eq!(p.home, Home::Node(1));
        assert_eq!(p.core_list(), "4,5");
    }

    #[test]
    fn test_refill_restores_node() {
        let (alloc, _) = two_by_four(false);
        alloc.pick_cores(&req(0, 3)).unwrap();
        alloc.pick_cores(&req(1, 2)).unwrap();
        assert_eq!(alloc.node_free(), vec![1, 2]);

        assert_eq!(alloc.refill(0), Some(3));
        assert_eq!(alloc.node_free(), vec![4, 2]);
        assert!(!alloc.free_mask().and(&Cpumask::from_cpulist("0-2", 8).unwrap()).is_empty());
        assert_eq!(alloc.refill(0), None);

        let again = alloc.pick_cores(&req(0, 3)).unwrap();
        assert_eq!(again.home, Home::Node(0));
        assert_eq!(again.mask.to_cpulist(), "0-2");
    }

    #[test]
    fn test_rearrangement_consolidates() {
        let (alloc, pinner) = two_by_four(false);
        alloc.pick_cores(&req(0, 1)).unwrap();
        alloc.pick_cores(&req(1, 1)).unwrap();
        alloc.attach_pid(1, 101).unwrap();
        assert_eq!(alloc.node_free(), vec![3, 3]);

        let big = alloc.pick_cores(&req(3, 4)).unwrap();
        assert_eq!(big.reason, PlacementReason::Rearranged);
        assert_eq!(big.home, Home::Node(1));
        assert_eq!(big.mask.to_cpulist(), "4-7");

        let jobs = alloc.jobs();
        assert_eq!(jobs[1].home, Home::Node(0));
        assert_eq!(jobs[1].mask.to_cpulist(), "1");
        assert_eq!(pinner.mask_of(101).unwrap().to_cpulist(), "1");
        assert_disjoint(&alloc);
    }

    #[test]
    fn test_rearrange_is_noop_when_request_fits() {
        let (alloc, _) = two_by_four(false);
        alloc.pick_cores(&req(0, 3)).unwrap();
        alloc.pick_cores(&req(1, 1)).unwrap();
        let before = alloc.jobs();

        assert!(alloc.rearrange(7, 3));
        assert_eq!(alloc.jobs(), before);
        assert!(alloc.rearrange(7, 3));
        assert_eq!(alloc.jobs(), before);
    }

    #[test]
    fn test_failed_rearrangement_keeps_layout() {
        let (alloc, _) = two_by_four(false);
        alloc.pick_cores(&req(0, 3)).unwrap();
        alloc.pick_cores(&req(1, 3)).unwrap();
        let before = alloc.jobs();
        assert!(!alloc.rearrange(2, 2));
        assert_eq!(alloc.jobs(), before);
    }

    #[test]
    fn test_partition_within_numa_node() {
        let spans = vec![
            (0, Cpumask::from_cpulist("0-1", 8).unwrap()),
            (0, Cpumask::from_cpulist("4-5", 8).unwrap()),
            (1, Cpumask::from_cpulist("2-3", 8).unwrap()),
            (1, Cpumask::from_cpulist("6-7", 8).unwrap()),
        ];
        let top = NumaTopology::from_spans(8, &spans, &Cpumask::from_cpulist("2", 8).unwrap());
        let alloc = CpuAllocator::new(&top, Arc::new(RecordingPinner::new()), false);

        let p = alloc.pick_cores(&req(0, 4)).unwrap();
        assert_eq!(p.home, Home::Numa(0));
        assert_eq!(p.reason, PlacementReason::Partitioned);
        assert_eq!(p.mask.to_cpulist(), "0-1,4-5");
    }

    #[test]
    fn test_oversized_request_is_best_effort() {
        let (alloc, _) = two_by_four(false);
        alloc.pick_cores(&req(0, 2)).unwrap();
        let p = alloc.pick_cores(&req(1, 16)).unwrap();
        assert_eq!(p.reason, PlacementReason::BestEffort);
        assert_eq!(p.mask.weight(), 6);
        assert_eq!(alloc.free_cores(), 0);
        assert_disjoint(&alloc);
    }

    #[test]
    fn test_duplicate_and_empty_requests_rejected() {
        let (alloc, _) = two_by_four(false);
        alloc.pick_cores(&req(0, 1)).unwrap();
        assert!(alloc.pick_cores(&req(0, 1)).is_err());
        assert!(alloc.pick_cores(&req(1, 0)).is_err());
    }

    #[test]
    fn test_idle_extension_follows_admissions() {
        let (alloc, pinner) = two_by_four(true);
        let a = alloc.pick_cores(&req(0, 2)).unwrap();
        assert_eq!(a.mask.to_cpulist(), "0-1");
        assert_eq!(a.effective.to_cpulist(), "0-3");
        alloc.attach_pid(0, 100).unwrap();
        assert_eq!(pinner.mask_of(100).unwrap().to_cpulist(), "0-3");

        let b = alloc.pick_cores(&req(2, 1)).unwrap();
        assert_eq!(b.mask.to_cpulist(), "2");
        assert_eq!(b.effective.to_cpulist(), "2-3");
        assert_eq!(pinner.mask_of(100).unwrap().to_cpulist(), "0-1,3");

        alloc.refill(2).unwrap();
        assert_eq!(pinner.mask_of(100).unwrap().to_cpulist(), "0-3");
    }

    #[test]
    fn test_shared_cores_extend_neighbours() {
        let (alloc, _) = two_by_four(true);
        alloc
            .pick_cores(&CoreRequest {
                job_id: 0,
                cores: 2,
                share_idle: true,
            })
            .unwrap();
        alloc.pick_cores(&req(2, 2)).unwrap();
        let jobs = alloc.jobs();
        assert_eq!(jobs[1].mask.to_cpulist(), "2-3");
        assert_eq!(jobs[1].effective.to_cpulist(), "0-3");
        assert_eq!(jobs[0].effective.to_cpulist(), "0-1");
    }

    #[test]
    fn test_exhausted_machine_is_best_effort() {
        let (alloc, _) = two_by_four(true);
        alloc.pick_cores(&req(0, 3)).unwrap();
        alloc.pick_cores(&req(1, 3)).unwrap();
        let c = alloc.pick_cores(&req(2, 1)).unwrap();
        assert_eq!(c.home, Home::Node(0));
        let d = alloc.pick_cores(&req(3, 5)).unwrap();
        assert_eq!(d.reason, PlacementReason::BestEffort);
        assert_eq!(d.home, Home::Spread);
        assert_eq!(d.mask.to_cpulist(), "7");
    }

    #[test]
    fn test_initial_mask_shrinks_baseline() {
        let (alloc, _) = two_by_four(false);
        let mask = alloc.compute_initial_mask(3, 1).unwrap();
        assert_eq!(mask.to_cpulist(), "4-6");
        assert_eq!(alloc.usable_cores(), 3);
        assert_eq!(alloc.node_free(), vec![0, 3]);

        let p = alloc.pick_cores(&req(0, 2)).unwrap();
        assert_eq!(p.mask.to_cpulist(), "4-5");
        assert!(alloc.compute_initial_mask(1, 0).is_err());
    }

    #[test]
    fn test_initial_mask_partitions_when_needed() {
        let (alloc, _) = two_by_four(false);
        let mask = alloc.compute_initial_mask(6, 0).unwrap();
        assert_eq!(mask.to_cpulist(), "0-5");
        assert_eq!(alloc.node_free(), vec![4, 2]);
        assert_eq!(alloc.compute_initial_mask(0, 0).unwrap().weight(), 6);
    }

    #[test]
    fn test_admit_retire_sequence_never_overlaps() {
        let (alloc, _) = two_by_four(true);
        let mut running: Vec<u64> = vec![];
        let mut seed: u64 = 0x2545f4914f6cdd1d;
        for step in 0..400u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let retire = !running.is_empty() && (seed % 3 == 0 || alloc.free_cores() == 0);
            if retire {
                let victim = running.remove((seed as usize / 3) % running.len());
                assert!(alloc.refill(victim).is_some());
            } else {
                let cores = 1 + (seed as usize >> 8) % 4;
                alloc.pick_cores(&req(step, cores)).unwrap();
                running.push(step);
            }
            assert_disjoint(&alloc);
        }
    }
}
