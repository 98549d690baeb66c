use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{Cond, RmId, Topology};

/// Everything a process needs at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub cluster: Option<ClusterSpec>,
    pub logging: LoggingConfig,
    pub timing: Timing,
}

/// The operator's statement of what the cluster should look like. Field
/// names follow the external file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub cluster_id: String,
    pub version: u32,
    pub hosts: Vec<String>,
    pub f: u8,
    #[serde(rename = "maxRMCount")]
    pub max_rm_count: u8,
    #[serde(default)]
    pub async_flush: bool,
    /// Present while a reconfiguration is in flight; omitted when stable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitioning_to: Option<TransitioningTo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitioningTo {
    pub configuration: Box<ClusterSpec>,
    #[serde(default)]
    pub all_hosts: Vec<String>,
    #[serde(rename = "newRMIds", default)]
    pub new_rm_ids: Vec<RmId>,
    #[serde(default)]
    pub pending_install: Vec<RmId>,
    #[serde(default)]
    pub pending: BTreeMap<u32, Cond>,
}

impl ClusterSpec {
    /// The goal topology this spec describes.
    pub fn to_goal(&self) -> Topology {
        Topology::goal(
            self.cluster_id.clone(),
            self.version,
            self.hosts.clone(),
            self.f,
            self.max_rm_count,
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            format: LogFormat::Compact,
            filter: None,
        }
    }
}

/// Delays and retry counts; the defaults are the production values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Shortest idle-beat interval.
    pub var_idle_timeout_min_ms: u64,
    /// Random extra added on top of the minimum.
    pub var_idle_timeout_range_ms: u64,
    /// Cap on randomized resubmission delay.
    pub max_submit_delay_ms: u64,
    /// Client submissions retry this many times before backing off.
    pub submission_initial_attempts: u32,
    /// First backoff step for client submissions.
    pub submission_initial_backoff_us: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            var_idle_timeout_min_ms: 50,
            var_idle_timeout_range_ms: 250,
            max_submit_delay_ms: 2_000,
            submission_initial_attempts: 5,
            submission_initial_backoff_us: 2,
        }
    }
}
