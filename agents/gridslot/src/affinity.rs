// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! OS level CPU affinity.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Result;
use gridslot_utils::Cpumask;

/// Applies a core mask to a running process.
pub trait CpuPinner: Send + Sync {
    fn pin(&self, pid: i32, mask: &Cpumask) -> Result<()>;
}

/// Pins through sched_setaffinity(2).
#[derive(Debug, Default)]
pub struct SchedAffinityPinner;

impl CpuPinner for SchedAffinityPinner {
    fn pin(&self, pid: i32, mask: &Cpumask) -> Result<()> {
        if mask.is_empty() {
            bail!("Refusing to pin pid {} to an empty mask", pid);
        }
        let cpu_set = to_cpu_set(mask)?;
        let ret = unsafe {
            libc::sched_setaffinity(pid, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set)
        };
        if ret != 0 {
            bail!(
                "sched_setaffinity({}, {}) failed: {}",
                pid,
                mask.to_cpulist(),
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }
}

fn to_cpu_set(mask: &Cpumask) -> Result<libc::cpu_set_t> {
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let max = std::mem::size_of::<libc::cpu_set_t>() * 8;
    for cpu in mask.iter() {
        if cpu >= max {
            bail!("CPU {} does not fit in cpu_set_t", cpu);
        }
        unsafe { libc::CPU_SET(cpu, &mut cpu_set) };
    }
    Ok(cpu_set)
}

/// Cores the calling process is currently allowed to run on.
pub fn current_affinity(nr_cpus: usize) -> Result<Cpumask> {
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let ret =
        unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut cpu_set) };
    if ret != 0 {
        bail!("sched_getaffinity failed: {}", std::io::Error::last_os_error());
    }
    let mut mask = Cpumask::new(nr_cpus);
    for cpu in 0..nr_cpus.min(std::mem::size_of::<libc::cpu_set_t>() * 8) {
        if unsafe { libc::CPU_ISSET(cpu, &cpu_set) } {
            mask.set_cpu(cpu)?;
        }
    }
    Ok(mask)
}

/// Remembers the last mask applied to each pid instead of touching the OS.
/// Used for dry runs and by tests.
#[derive(Debug, Default)]
pub struct RecordingPinner {
    pins: Mutex<BTreeMap<i32, Cpumask>>,
    calls: Mutex<Vec<(i32, String)>>,
}

impl RecordingPinner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mask_of(&self, pid: i32) -> Option<Cpumask> {
        self.pins.lock().ok()?.get(&pid).cloned()
    }

    /// Every pin call so far, as (pid, cpulist).
    pub fn calls(&self) -> Vec<(i32, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CpuPinner for RecordingPinner {
    fn pin(&self, pid: i32, mask: &Cpumask) -> Result<()> {
        if let Ok(mut pins) = self.pins.lock() {
            pins.insert(pid, mask.clone());
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((pid, mask.to_cpulist()));
        }
        Ok(())
    }
}
