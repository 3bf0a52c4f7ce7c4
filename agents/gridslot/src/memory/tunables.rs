// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Safety margins of the memory controller.
//!
//! Sites can publish per-host margins through a small HTTP service which
//! answers `GET <url>?hostname=<host>&site=<site>` with a flat JSON object of
//! numbers. Anything unreachable or unparsable leaves the built-in defaults in
//! place.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tunables {
    /// Kept free below the RSS limit, per slot core.
    pub memory_margin_kb: u64,
    /// Kept free below the swap or memory+swap limit, per slot core.
    pub swap_margin_kb: u64,
    /// Kept free on the machine when no limit is configured, per slot core.
    pub machine_margin_kb: u64,
    /// Jobs below this resident memory per core are not preempted first.
    pub min_memory_per_core_kb: u64,
    /// Count free host swap as usable when only an RSS limit exists.
    pub allow_swap: bool,
    pub debug: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            memory_margin_kb: 50_000,
            swap_margin_kb: 50_000,
            machine_margin_kb: 100_000,
            min_memory_per_core_kb: 1_000_000,
            allow_swap: false,
            debug: false,
        }
    }
}

impl Tunables {
    /// Override the fields named in @values. Unknown keys are ignored.
    pub fn apply(&mut self, values: &BTreeMap<String, f64>) {
        for (key, &value) in values.iter() {
            let kb = value.max(0.0) as u64;
            match key.as_str() {
                "memory_margin_kb" => self.memory_margin_kb = kb,
                "swap_margin_kb" => self.swap_margin_kb = kb,
                "machine_margin_kb" => self.machine_margin_kb = kb,
                "min_memory_per_core_kb" => self.min_memory_per_core_kb = kb,
                "allow_swap" => self.allow_swap = value != 0.0,
                "debug" => self.debug = value != 0.0,
                _ => debug!("Ignoring unknown tunable {}={}", key, value),
            }
        }
    }
}

pub trait TunablesSource: Send + Sync {
    fn fetch(&self) -> Result<BTreeMap<String, f64>>;
}

/// Fetch margins from the site limits service.
pub fn load_tunables(source: Option<&dyn TunablesSource>) -> Tunables {
    let mut tunables = Tunables::default();
    let Some(source) = source else {
        return tunables;
    };
    match source.fetch() {
        Ok(values) => {
            tunables.apply(&values);
            info!("Memory tunables: {:?}", tunables);
        }
        Err(e) => warn!("Failed to fetch memory tunables, using defaults: {:#}", e),
    }
    tunables
}

pub struct HttpTunables {
    client: reqwest::blocking::Client,
    url: String,
    hostname: String,
    site: String,
}

impl HttpTunables {
    pub fn new(url: &str, hostname: &str, site: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            hostname: hostname.to_string(),
            site: site.to_string(),
        })
    }
}

impl TunablesSource for HttpTunables {
    fn fetch(&self) -> Result<BTreeMap<String, f64>> {
        let body: BTreeMap<String, serde_json::Value> = self
            .client
            .get(&self.url)
            .query(&[("hostname", &self.hostname), ("site", &self.site)])
            .send()
            .with_context(|| format!("Failed to reach {}", self.url))?
            .error_for_status()?
            .json()
            .context("Malformed tunables response")?;
        Ok(numeric_values(body))
    }
}

fn numeric_values(body: BTreeMap<String, serde_json::Value>) -> BTreeMap<String, f64> {
    body.into_iter()
        .filter_map(|(key, value)| {
            let num = match value {
                serde_json::Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
                v => v.as_f64(),
            };
            num.map(|n| (key, n))
        })
        .collect()
}

/// A fixed answer, for tests and sites without a limits service.
#[derive(Clone, Debug, Default)]
pub struct StaticTunables(pub BTreeMap<String, f64>);

impl TunablesSource for StaticTunables {
    fn fetch(&self) -> Result<BTreeMap<String, f64>> {
        Ok(self.0.clone())
    }
}
