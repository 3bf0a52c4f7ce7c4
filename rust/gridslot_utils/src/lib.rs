// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utility collection for gridslot governors
//!
//! A gridslot governor decides, on one worker node, how many grid jobs run
//! side by side inside the batch slot it was given, which cores each of them
//! is pinned to and which one has to go when the slot runs out of memory.
//!
//! This crate holds the parts of that work which only inspect the host:
//!
//! - `Cpumask`, the fixed-width core bitset every placement is expressed in.
//! - `NumaTopology`, the host's core to NUMA node mapping.
//! - `CgroupTopology` and `MemInfo`, the slot's memory counters and limits and
//!   the machine-wide free memory.
//! - `LogRecorderBuilder`, a `metrics` recorder logging the slot gauges when
//!   no Prometheus endpoint is wanted.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;
pub use cpumask::CpumaskIterator;

mod topology;
pub use topology::nr_cpu_ids;
pub use topology::NodeSpan;
pub use topology::NumaTopology;

mod cgroup;
pub use cgroup::slot_segment;
pub use cgroup::CgroupLimits;
pub use cgroup::CgroupMemory;
pub use cgroup::CgroupTopology;
pub use cgroup::CgroupVersion;
pub use cgroup::MemInfo;

pub mod misc;

mod log_recorder;
pub use log_recorder::LogRecorderBuilder;
