// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use gridslot_utils::CgroupLimits;
use gridslot_utils::CgroupTopology;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use super::expr::ExpressionEvaluator;
use super::expr::RemovalExpr;
use crate::batch::expression_supported;
use crate::batch::BatchSystem;

/// Which limit a preemption protects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Rss,
    Combined,
    Swap,
    Machine,
    Expression,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Rss => "rss",
            LimitType::Combined => "combined",
            LimitType::Swap => "swap",
            LimitType::Machine => "machine",
            LimitType::Expression => "expression",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitSource {
    Cgroup,
    BatchLimit,
    ProcessLimits,
    Machine,
}

impl fmt::Display for LimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitSource::Cgroup => "cgroup",
            LimitSource::BatchLimit => "batch system limit",
            LimitSource::ProcessLimits => "process limits",
            LimitSource::Machine => "machine free memory",
        };
        write!(f, "{}", name)
    }
}

/// The one way the controller decides that the slot is near its limit.
pub enum LimitPolicy {
    /// Compare slot usage against numeric limits. All None means the
    /// machine-wide free memory is watched instead.
    Numeric {
        source: LimitSource,
        limits: CgroupLimits,
    },
    /// Evaluate the batch system's removal expression for every job.
    Expression {
        expr: Box<dyn ExpressionEvaluator>,
        memory_limit_kb: u64,
        attributes: BTreeMap<String, f64>,
    },
    /// The host's tooling cannot be trusted; the controller does nothing.
    Disabled { reason: String },
}

impl LimitPolicy {
    pub fn machine() -> LimitPolicy {
        LimitPolicy::Numeric {
            source: LimitSource::Machine,
            limits: CgroupLimits::default(),
        }
    }

    /// Human readable description for audit logs.
    pub fn audit(&self) -> String {
        match self {
            LimitPolicy::Numeric { source, limits } => format!(
                "{}: rss={} combined={} swap={}",
                source,
                fmt_kb(limits.rss_kb),
                fmt_kb(limits.combined_kb),
                fmt_kb(limits.swap_kb)
            ),
            LimitPolicy::Expression {
                expr,
                memory_limit_kb,
                ..
            } => format!(
                "batch system expression '{}' with JobMemoryLimit={}KB",
                expr.source(),
                memory_limit_kb
            ),
            LimitPolicy::Disabled { reason } => format!("disabled: {}", reason),
        }
    }
}

impl fmt::Debug for LimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LimitPolicy({})", self.audit())
    }
}

fn fmt_kb(kb: Option<u64>) -> String {
    kb.map_or("none".to_string(), |kb| format!("{}KB", kb))
}

/// Hard limits from a /proc/<pid>/limits file, in KB. "Max resident set" is
/// preferred over "Max address space".
pub fn read_process_limits(path: &Path) -> Result<Option<u64>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(parse_process_limits(&content))
}

fn parse_process_limits(content: &str) -> Option<u64> {
    let hard_limit = |name: &str| -> Option<u64> {
        let line = content.lines().find(|l| l.starts_with(name))?;
        let mut fields = line[name.len()..].split_whitespace();
        let _soft = fields.next()?;
        fields.next()?.parse::<u64>().ok().map(|bytes| bytes / 1024)
    };
    hard_limit("Max resident set").or_else(|| hard_limit("Max address space"))
}

/// JobMemoryLimit for expression mode in KB: the job's own attribute when it
/// carries one, else the limit the batch system declared.
fn expression_memory_limit_kb(
    batch: &dyn BatchSystem,
    attributes: &BTreeMap<String, f64>,
) -> Option<u64> {
    attributes
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("JobMemoryLimit"))
        .map(|(_, kb)| *kb)
        .filter(|kb| *kb > 0.0)
        .map(|kb| kb as u64)
        .or_else(|| batch.job_memory_limit_kb())
        .filter(|kb| *kb > 0)
}

/// Pick the limit policy for the slot, most trusted source first.
pub fn resolve_policy(
    cgroup: Option<&CgroupTopology>,
    batch: &dyn BatchSystem,
    limits_file: &Path,
) -> LimitPolicy {
    let policy = resolve(cgroup, batch, limits_file);
    info!("Memory limits from {}", policy.audit());
    policy
}

fn resolve(
    cgroup: Option<&CgroupTopology>,
    batch: &dyn BatchSystem,
    limits_file: &Path,
) -> LimitPolicy {
    if let Some(cgroup) = cgroup {
        match cgroup.limits() {
            Ok(limits) if limits.is_configured() => {
                return LimitPolicy::Numeric {
                    source: LimitSource::Cgroup,
                    limits,
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read cgroup limits of {}: {:#}", cgroup.slot_path(), e),
        }
    }

    if let Some(source) = batch.removal_expression() {
        if !expression_supported(batch) {
            return LimitPolicy::Disabled {
                reason: format!(
                    "{} version {} cannot evaluate removal expressions (need >= {})",
                    batch.name(),
                    batch.version().unwrap_or_else(|| "unknown".to_string()),
                    batch.min_expression_version().unwrap_or("?")
                ),
            };
        }
        let attributes = batch.attributes();
        match (RemovalExpr::parse(&source), expression_memory_limit_kb(batch, &attributes)) {
            (Ok(expr), Some(memory_limit_kb)) => {
                return LimitPolicy::Expression {
                    expr: Box::new(expr),
                    memory_limit_kb,
                    attributes,
                }
            }
            (Ok(_), None) => warn!(
                "Ignoring removal expression '{}': {} declares no job memory limit",
                source,
                batch.name()
            ),
            (Err(e), _) => warn!("Ignoring unparsable removal expression '{}': {:#}", source, e),
        }
    }

    if let Some(limit) = batch.job_memory_limit_kb() {
        return LimitPolicy::Numeric {
            source: LimitSource::BatchLimit,
            limits: CgroupLimits {
                rss_kb: Some(limit),
                ..Default::default()
            },
        };
    }

    match read_process_limits(limits_file) {
        Ok(Some(limit)) => {
            return LimitPolicy::Numeric {
                source: LimitSource::ProcessLimits,
                limits: CgroupLimits {
                    rss_kb: Some(limit),
                    ..Default::default()
                },
            }
        }
        Ok(None) => {}
        Err(e) => warn!("{:#}", e),
    }

    LimitPolicy::machine()
}
