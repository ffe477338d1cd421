// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! This module handles fleet configuration and configuration file parsing

use crate::error::{ErrorKind, Result};

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default location of the configuration file on a deployed node
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hiveminer/hiveminer.toml";

/// How often the orchestrator looks for dispatchable work
pub const DEFAULT_WORK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How often the Mine API is polled for a new challenge
pub const DEFAULT_CHALLENGE_FETCH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often in-flight work is checked against challenge expiry
pub const DEFAULT_EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// How often a worker refreshes its liveness file
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// How often the reclaimer leader looks for dead workers
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Staleness used on the allocator boot path where a slot is urgently needed
pub const DEFAULT_ALLOCATOR_STALE: Duration = Duration::from_secs(90);

/// Staleness used by the periodic reclaimer to keep steady-state churn low
pub const DEFAULT_RECLAIMER_STALE: Duration = Duration::from_secs(30 * 60);

fn default_bucket_prefix() -> String {
    "hiveminer".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/hiveminer")
}

fn default_addresses_per_instance() -> usize {
    25
}

fn default_api_timeout() -> u64 {
    30
}

fn default_work_check() -> u64 {
    DEFAULT_WORK_CHECK_INTERVAL.as_secs()
}

fn default_challenge_fetch() -> u64 {
    DEFAULT_CHALLENGE_FETCH_INTERVAL.as_secs()
}

fn default_expiry_scan() -> u64 {
    DEFAULT_EXPIRY_SCAN_INTERVAL.as_secs()
}

fn default_heartbeat() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL.as_secs()
}

fn default_reclaim() -> u64 {
    DEFAULT_RECLAIM_INTERVAL.as_secs()
}

fn default_allocator_stale() -> u64 {
    DEFAULT_ALLOCATOR_STALE.as_secs()
}

fn default_reclaimer_stale() -> u64 {
    DEFAULT_RECLAIMER_STALE.as_secs()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub base_url: String,
    /// Endpoint returning a donation address; donations are skipped when absent
    pub donation_url: Option<String>,
    /// Terms-and-conditions version signed during address registration;
    /// registration is skipped when absent
    pub terms_version: Option<String>,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MiningConfig {
    /// Number of concurrent miner subprocesses; defaults to the CPU count
    pub workers: Option<usize>,
    #[serde(default = "default_addresses_per_instance")]
    pub addresses_per_instance: usize,
    pub miner_binary: PathBuf,
    pub signer_binary: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct IntervalConfig {
    #[serde(default = "default_work_check")]
    pub work_check_secs: u64,
    #[serde(default = "default_challenge_fetch")]
    pub challenge_fetch_secs: u64,
    #[serde(default = "default_expiry_scan")]
    pub expiry_scan_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reclaim")]
    pub reclaim_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            work_check_secs: default_work_check(),
            challenge_fetch_secs: default_challenge_fetch(),
            expiry_scan_secs: default_expiry_scan(),
            heartbeat_secs: default_heartbeat(),
            reclaim_secs: default_reclaim(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ThresholdConfig {
    #[serde(default = "default_allocator_stale")]
    pub allocator_stale_secs: u64,
    #[serde(default = "default_reclaimer_stale")]
    pub reclaimer_stale_secs: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            allocator_stale_secs: default_allocator_stale(),
            reclaimer_stale_secs: default_reclaimer_stale(),
        }
    }
}

/// Controller-side knobs for launching and tagging fleet instances
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    pub launch_template: Option<String>,
    pub fleet_tag: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Region override; normally discovered from instance metadata
    pub region: Option<String>,
    #[serde(default = "default_bucket_prefix")]
    pub bucket_prefix: String,
    pub api: ApiConfig,
    pub mining: MiningConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
}

impl Configuration {
    pub fn add_args<'a, 'b>(app: clap::App<'a, 'b>) -> clap::App<'a, 'b> {
        app.arg(
            clap::Arg::with_name("config")
                .long("config")
                .help("Set config file path")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("region")
                .long("region")
                .help("Override the region discovered from instance metadata")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("workers")
                .long("workers")
                .help("Number of concurrent miner subprocesses")
                .required(false)
                .takes_value(true),
        )
    }

    /// Load the configuration file and layer command line overrides on top
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);
        let mut configuration: Self =
            crate::parse(config_path).map_err(|e| ErrorKind::File(e))?;

        if let Some(value) = matches.value_of("region") {
            configuration.region = Some(value.to_string());
        }
        if let Some(value) = matches.value_of("workers") {
            let workers = value
                .parse::<usize>()
                .map_err(|_| ErrorKind::Value("workers is not a number".to_string()))?;
            configuration.mining.workers = Some(workers);
        }
        Ok(configuration)
    }

    /// Resolved miner subprocess pool size
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.mining.workers.unwrap_or_else(num_cpus::get)
    }

    #[inline]
    pub fn work_check_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.work_check_secs)
    }

    #[inline]
    pub fn challenge_fetch_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.challenge_fetch_secs)
    }

    #[inline]
    pub fn expiry_scan_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.expiry_scan_secs)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.heartbeat_secs)
    }

    #[inline]
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.reclaim_secs)
    }

    #[inline]
    pub fn allocator_stale(&self) -> Duration {
        Duration::from_secs(self.thresholds.allocator_stale_secs)
    }

    #[inline]
    pub fn reclaimer_stale(&self) -> Duration {
        Duration::from_secs(self.thresholds.reclaimer_stale_secs)
    }

    /// Path of the local assignment cache consulted before the registry
    #[inline]
    pub fn address_cache_path(&self) -> PathBuf {
        self.mining.cache_dir.join("addresses.json")
    }
}
