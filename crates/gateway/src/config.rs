use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sds_comfyui::reconnect::ReconnectConfig;

/// Progress-normalizer tuning.
#[derive(Debug, Clone, Default)]
pub struct NormalizerConfig {
    pub reconnect: ReconnectConfig,
    /// Fail the job after this many unrecognized frames. `None` keeps
    /// them ignorable forever (they are still logged).
    pub unrecognized_frame_limit: Option<u32>,
}

/// Per-task tuning shared by every task a registry creates.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub normalizer: NormalizerConfig,
    /// How many times to look for the result after the success signal.
    pub result_poll_attempts: u32,
    /// Delay between result lookups.
    pub result_poll_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            result_poll_attempts: 20,
            result_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Idle-task eviction.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Terminal tasks not read for this long are dropped.
    pub idle_ttl: Duration,
    /// How often the sweeper runs.
    pub interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(3600),
            interval: Duration::from_secs(60),
        }
    }
}

/// Gateway configuration loaded from environment variables.
///
/// All fields have defaults suitable for a ComfyUI instance on the local
/// machine. In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub ws_url: String,
    pub workflow_dir: PathBuf,
    pub obj_workflow: String,
    pub hdri_workflow: String,
    pub task: TaskConfig,
    pub eviction: EvictionConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl GatewayConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                     |
    /// |-----------------------------|-----------------------------|
    /// | `COMFYUI_API_URL`           | `http://localhost:8188`     |
    /// | `COMFYUI_WS_URL`            | `ws://localhost:8188`       |
    /// | `WORKFLOW_DIR`              | `workflows`                 |
    /// | `OBJ_WORKFLOW`              | `sketch23d_api_faster.json` |
    /// | `HDRI_WORKFLOW`             | `panorama2.json`            |
    /// | `RECONNECT_MAX_ATTEMPTS`    | `20` (`0` = unbounded)      |
    /// | `RECONNECT_MAX_OUTAGE_SECS` | `300` (`0` = unbounded)     |
    /// | `RESULT_POLL_ATTEMPTS`      | `20`                        |
    /// | `RESULT_POLL_INTERVAL_MS`   | `500`                       |
    /// | `UNRECOGNIZED_FRAME_LIMIT`  | `0` (never escalate)        |
    /// | `TASK_IDLE_TTL_SECS`        | `3600`                      |
    /// | `EVICTION_INTERVAL_SECS`    | `60`                        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let max_attempts: u32 = parse(&lookup, "RECONNECT_MAX_ATTEMPTS", 20)?;
        let max_outage_secs: u64 = parse(&lookup, "RECONNECT_MAX_OUTAGE_SECS", 300)?;
        let unrecognized_limit: u32 = parse(&lookup, "UNRECOGNIZED_FRAME_LIMIT", 0)?;

        let reconnect = ReconnectConfig {
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            max_outage: (max_outage_secs > 0).then(|| Duration::from_secs(max_outage_secs)),
            ..Default::default()
        };

        let task = TaskConfig {
            normalizer: NormalizerConfig {
                reconnect,
                unrecognized_frame_limit: (unrecognized_limit > 0).then_some(unrecognized_limit),
            },
            result_poll_attempts: parse(&lookup, "RESULT_POLL_ATTEMPTS", 20)?,
            result_poll_interval: Duration::from_millis(parse(&lookup, "RESULT_POLL_INTERVAL_MS", 500)?),
        };

        let eviction = EvictionConfig {
            idle_ttl: Duration::from_secs(parse(&lookup, "TASK_IDLE_TTL_SECS", 3600)?),
            interval: Duration::from_secs(parse(&lookup, "EVICTION_INTERVAL_SECS", 60)?),
        };

        Ok(Self {
            api_url: string("COMFYUI_API_URL", "http://localhost:8188"),
            ws_url: string("COMFYUI_WS_URL", "ws://localhost:8188"),
            workflow_dir: PathBuf::from(string("WORKFLOW_DIR", "workflows")),
            obj_workflow: string("OBJ_WORKFLOW", "sketch23d_api_faster.json"),
            hdri_workflow: string("HDRI_WORKFLOW", "panorama2.json"),
            task,
            eviction,
        })
    }

    pub fn obj_workflow_path(&self) -> PathBuf {
        self.workflow_dir.join(&self.obj_workflow)
    }

    pub fn hdri_workflow_path(&self) -> PathBuf {
        self.workflow_dir.join(&self.hdri_workflow)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
