//! Monitor definitions.
//!
//! ```yaml
//! interval: 10
//! timeout: 5
//! up_threshold: 3
//! down_threshold: 3
//! probe: { type: http, port: 8080, path: /health, expect_status: 200 }
//! ```

use crate::error::Error;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::time::{Duration, SystemTime};

const DEFAULT_THRESHOLD: u32 = 3;

fn default_threshold() -> u32 {
    DEFAULT_THRESHOLD
}

fn default_http_port() -> u16 {
    80
}

fn default_http_path() -> String {
    "/".to_string()
}

/// The check run against an endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum Probe {
    /// Succeeds when a TCP connection to `port` is accepted.
    Tcp { port: u16 },
    /// Succeeds on a 2xx response, or exactly `expect_status` when given.
    Http {
        #[serde(default = "default_http_port")]
        port: u16,
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        expect_status: Option<u16>,
    },
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MonitorDefinition {
    #[serde_as(as = "DurationSeconds<u64>")]
    interval: Duration,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    timeout: Option<Duration>,
    #[serde(default = "default_threshold")]
    up_threshold: u32,
    #[serde(default = "default_threshold")]
    down_threshold: u32,
    probe: Probe,
}

/// A loaded and validated monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct MonitorConfig {
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive successes needed to go from down to up.
    pub up_threshold: u32,
    /// Consecutive failures needed to go from up to down.
    pub down_threshold: u32,
    pub probe: Probe,
    pub last_modified: SystemTime,
}

impl MonitorConfig {
    /// Parse and validate a YAML monitor definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidYAML`] for malformed documents and [`Error::InvalidMonitor`] when
    /// the interval, timeout, thresholds or probe parameters are out of range.
    pub fn from_yaml(name: &str, content: &[u8], last_modified: SystemTime) -> Result<Self, Error> {
        let definition: MonitorDefinition = serde_yaml::from_slice(content)?;
        let invalid = |message: &str| Error::InvalidMonitor(format!("{name}: {message}"));

        if definition.interval.is_zero() {
            return Err(invalid("interval must be positive"));
        }
        let timeout = definition
            .timeout
            .unwrap_or_else(|| (definition.interval / 2).max(Duration::from_secs(1)));
        if timeout.is_zero() {
            return Err(invalid("timeout must be positive"));
        }
        if timeout > definition.interval {
            return Err(invalid("timeout must not exceed interval"));
        }
        if definition.up_threshold == 0 || definition.down_threshold == 0 {
            return Err(invalid("thresholds must be positive"));
        }
        match &definition.probe {
            Probe::Tcp { port: 0 } | Probe::Http { port: 0, .. } => {
                return Err(invalid("probe port must be positive"));
            }
            Probe::Http { path, .. } if !path.starts_with('/') => {
                return Err(invalid("http probe path must start with '/'"));
            }
            _ => {}
        }

        Ok(MonitorConfig {
            name: name.to_string(),
            interval: definition.interval,
            timeout,
            up_threshold: definition.up_threshold,
            down_threshold: definition.down_threshold,
            probe: definition.probe,
            last_modified,
        })
    }
}
