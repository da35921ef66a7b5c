//! Daemon configuration loaded from environment variables.
//!
//! `NODENAME` and `NAMESPACE` are required. Everything else has a default.
//! Empty values are treated as unset.

use crate::error::ControllerError;
use fec_device_client::SysfsDeviceClient;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 600;
const DEFAULT_BACKOFF_MIN_SECS: u64 = 1;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;
const DEFAULT_SYSFS_ROOT: &str = "/sys";
const DEFAULT_FIRMWARE_DIR: &str = "/sriov_artifacts";
const DEFAULT_STATE_DIR: &str = "/var/lib/sriov-fec";
const DEFAULT_BITSTREAM_TOOL: &str = "pf_bb_config";

/// Probe bind address value that disables the probe server
const PROBES_DISABLED: &str = "0";

/// Runtime configuration of the node daemon
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Node this daemon manages; also the name of its SriovFecNodeConfig
    pub node_name: String,
    /// Namespace holding the SriovFecNodeConfig records
    pub namespace: String,
    /// Interval of the periodic resync enqueue
    pub resync_interval: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// `None` disables the health/metrics server
    pub probe_bind_address: Option<SocketAddr>,
    pub sysfs_root: PathBuf,
    pub firmware_dir: PathBuf,
    pub state_dir: PathBuf,
    pub bitstream_tool: PathBuf,
}

impl DaemonConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let node_name = get("NODENAME").ok_or_else(|| {
            ControllerError::InvalidConfig("NODENAME environment variable is required".to_string())
        })?;
        let namespace = get("NAMESPACE").ok_or_else(|| {
            ControllerError::InvalidConfig("NAMESPACE environment variable is required".to_string())
        })?;

        let resync_secs = parse_secs(get("RESYNC_INTERVAL_SECS"), "RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_INTERVAL_SECS)?;
        let backoff_min_secs = parse_secs(get("BACKOFF_MIN_SECS"), "BACKOFF_MIN_SECS", DEFAULT_BACKOFF_MIN_SECS)?;
        let backoff_max_secs = parse_secs(get("BACKOFF_MAX_SECS"), "BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX_SECS)?;

        if resync_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "RESYNC_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if backoff_min_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "BACKOFF_MIN_SECS must be greater than zero".to_string(),
            ));
        }
        if backoff_max_secs < backoff_min_secs {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_MAX_SECS ({}) must not be lower than BACKOFF_MIN_SECS ({})",
                backoff_max_secs, backoff_min_secs
            )));
        }

        let probe_bind_address = match get("PROBE_BIND_ADDRESS") {
            None => None,
            Some(value) => parse_bind_address(&value)?,
        };

        Ok(Self {
            node_name,
            namespace,
            resync_interval: Duration::from_secs(resync_secs),
            backoff_min: Duration::from_secs(backoff_min_secs),
            backoff_max: Duration::from_secs(backoff_max_secs),
            probe_bind_address,
            sysfs_root: get("SYSFS_ROOT").unwrap_or_else(|| DEFAULT_SYSFS_ROOT.to_string()).into(),
            firmware_dir: get("FIRMWARE_DIR").unwrap_or_else(|| DEFAULT_FIRMWARE_DIR.to_string()).into(),
            state_dir: get("STATE_DIR").unwrap_or_else(|| DEFAULT_STATE_DIR.to_string()).into(),
            bitstream_tool: get("BITSTREAM_TOOL").unwrap_or_else(|| DEFAULT_BITSTREAM_TOOL.to_string()).into(),
        })
    }

    /// Build the production device client for this configuration
    pub fn device_client(&self) -> SysfsDeviceClient {
        SysfsDeviceClient::builder()
            .sysfs_root(&self.sysfs_root)
            .firmware_dir(&self.firmware_dir)
            .state_dir(&self.state_dir)
            .bitstream_tool(&self.bitstream_tool)
            .build()
    }
}

fn parse_secs(value: Option<String>, name: &str, default: u64) -> Result<u64, ControllerError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            ControllerError::InvalidConfig(format!("{} must be a whole number of seconds, got '{}'", name, v))
        }),
    }
}

/// Parses `host:port`, `:port` (all interfaces) or `0` (disabled).
fn parse_bind_address(value: &str) -> Result<Option<SocketAddr>, ControllerError> {
    let value = value.trim();
    if value == PROBES_DISABLED {
        return Ok(None);
    }
    let candidate = if value.starts_with(':') {
        format!("0.0.0.0{}", value)
    } else {
        value.to_string()
    };
    candidate.parse::<SocketAddr>().map(Some).map_err(|_| {
        ControllerError::InvalidConfig(format!("PROBE_BIND_ADDRESS '{}' is not a valid socket address", value))
    })
}
