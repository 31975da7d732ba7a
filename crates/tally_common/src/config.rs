//! Configuration management for tallyd and tallyctl.
//!
//! Loads settings from /etc/tally/config.toml or uses defaults.
//! Every field has a serde default so partial files are valid.

use crate::clock::{parse_wall_time, ZoneSetting};
use crate::error::{Result, TallyError};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/tally/config.toml";

/// Default ledger location
pub const DEFAULT_DB_PATH: &str = "/var/lib/tally/tally.db";

// ============================================================================
// SECTIONS
// ============================================================================

/// Where the ledger lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

/// Zone used for day and month boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// "local", "utc" or a fixed offset such as "+03:00"
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Legacy explicit offset; must agree with `timezone` when both are set
    #[serde(default)]
    pub utc_offset: Option<String>,
}

fn default_timezone() -> String {
    "local".to_string()
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            utc_offset: None,
        }
    }
}

/// Job cadences and the daily fixation window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Polling interval for both source types
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Peer discovery/sync interval
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Local time the day is fixed and polling pauses
    #[serde(default = "default_fix_time")]
    pub fix_time: String,

    /// Local time polling resumes for the new period
    #[serde(default = "default_resume_time")]
    pub resume_time: String,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    300
}

fn default_fix_time() -> String {
    "23:59".to_string()
}

fn default_resume_time() -> String {
    "00:00".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            sync_interval_secs: default_sync_interval(),
            fix_time: default_fix_time(),
            resume_time: default_resume_time(),
        }
    }
}

/// How much history is kept
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Daily buckets older than this many days are purged
    #[serde(default = "default_daily_days")]
    pub daily_days: u32,

    /// Maximum rows in the connection history
    #[serde(default = "default_history_cap")]
    pub history_cap: u32,
}

fn default_daily_days() -> u32 {
    7
}

fn default_history_cap() -> u32 {
    100
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily_days: default_daily_days(),
            history_cap: default_history_cap(),
        }
    }
}

/// Peer-status source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardConfig {
    #[serde(default = "default_wg_command")]
    pub command: PathBuf,

    #[serde(default = "default_wg_args")]
    pub args: Vec<String>,

    /// Server configs carrying `# Client = name` comments; later files win
    #[serde(default = "default_client_configs")]
    pub client_configs: Vec<PathBuf>,

    /// A handshake younger than this marks the peer online
    #[serde(default = "default_online_window")]
    pub online_window_secs: u64,
}

fn default_wg_command() -> PathBuf {
    PathBuf::from("/usr/bin/wg")
}

fn default_wg_args() -> Vec<String> {
    vec!["show".to_string()]
}

fn default_client_configs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/wireguard/vpn.conf"),
        PathBuf::from("/etc/wireguard/antizapret.conf"),
    ]
}

fn default_online_window() -> u64 {
    180
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            command: default_wg_command(),
            args: default_wg_args(),
            client_configs: default_client_configs(),
            online_window_secs: default_online_window(),
        }
    }
}

/// One session status log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLogConfig {
    pub path: PathBuf,
    pub protocol: String,
}

/// Session-log source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenVpnConfig {
    /// Stripped from client names before they are stored
    #[serde(default = "default_client_prefix")]
    pub client_prefix: String,

    #[serde(default = "default_logs")]
    pub logs: Vec<SessionLogConfig>,
}

fn default_client_prefix() -> String {
    "antizapret-".to_string()
}

fn default_logs() -> Vec<SessionLogConfig> {
    [
        ("antizapret-udp-status.log", "UDP"),
        ("antizapret-tcp-status.log", "TCP"),
        ("vpn-udp-status.log", "VPN-UDP"),
        ("vpn-tcp-status.log", "VPN-TCP"),
        ("antizapret-no-cipher-status.log", "NoCipher"),
    ]
    .into_iter()
    .map(|(file, protocol)| SessionLogConfig {
        path: Path::new("/etc/openvpn/server/logs").join(file),
        protocol: protocol.to_string(),
    })
    .collect()
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            client_prefix: default_client_prefix(),
            logs: default_logs(),
        }
    }
}

// ============================================================================
// ROOT
// ============================================================================

/// Complete configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub wireguard: WireGuardConfig,
    #[serde(default)]
    pub openvpn: OpenVpnConfig,
}

/// Values derived from a validated config
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub zone: ZoneSetting,
    pub fix_time: NaiveTime,
    pub resume_time: NaiveTime,
    pub poll_interval: Duration,
    pub sync_interval: Duration,
}

impl TallyConfig {
    /// Load from a path; a missing file means defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)?;
        let config: TallyConfig = toml::from_str(&raw).map_err(|e| {
            TallyError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load and validate in one step
    pub fn load_validated(path: impl AsRef<Path>) -> Result<(Self, Timing)> {
        let config = Self::load(path)?;
        let timing = config.validate()?;
        Ok((config, timing))
    }

    /// Resolve the zone, checking `utc_offset` does not contradict it
    pub fn zone(&self) -> Result<ZoneSetting> {
        let zone: ZoneSetting = self.clock.timezone.parse()?;
        if let Some(offset) = &self.clock.utc_offset {
            let offset_zone: ZoneSetting = offset.parse()?;
            match zone {
                // An explicit offset refines "local"
                ZoneSetting::Local => {
                    warn!("clock.utc_offset overrides timezone=local");
                    return Ok(offset_zone);
                }
                _ if zone != offset_zone => {
                    return Err(TallyError::config(format!(
                        "clock.timezone '{}' conflicts with clock.utc_offset '{}'",
                        self.clock.timezone, offset
                    )));
                }
                _ => {}
            }
        }
        Ok(zone)
    }

    /// Check every field the day-boundary logic depends on
    pub fn validate(&self) -> Result<Timing> {
        let zone = self.zone()?;
        let fix_time = parse_wall_time(&self.schedule.fix_time)?;
        let resume_time = parse_wall_time(&self.schedule.resume_time)?;

        if fix_time == resume_time {
            return Err(TallyError::config(format!(
                "schedule.fix_time and schedule.resume_time are both {}",
                self.schedule.fix_time
            )));
        }
        if self.schedule.poll_interval_secs == 0 {
            return Err(TallyError::config("schedule.poll_interval_secs must be > 0"));
        }
        if self.schedule.sync_interval_secs == 0 {
            return Err(TallyError::config("schedule.sync_interval_secs must be > 0"));
        }
        if self.retention.daily_days == 0 {
            return Err(TallyError::config("retention.daily_days must be > 0"));
        }
        if self.retention.history_cap == 0 {
            return Err(TallyError::config("retention.history_cap must be > 0"));
        }
        if self.wireguard.online_window_secs == 0 {
            return Err(TallyError::config("wireguard.online_window_secs must be > 0"));
        }

        Ok(Timing {
            zone,
            fix_time,
            resume_time,
            poll_interval: Duration::from_secs(self.schedule.poll_interval_secs),
            sync_interval: Duration::from_secs(self.schedule.sync_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        let config = TallyConfig::default();
        let timing = config.validate().unwrap();
        assert_eq!(timing.zone, ZoneSetting::Local);
        assert_eq!(timing.poll_interval, Duration::from_secs(30));
        assert_eq!(config.retention.history_cap, 100);
        assert_eq!(config.openvpn.logs.len(), 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[schedule]
poll_interval_secs = 10

[[openvpn.logs]]
path = "/tmp/udp.log"
protocol = "UDP"
"#
        )
        .unwrap();

        let config = TallyConfig::load(file.path()).unwrap();
        assert_eq!(config.schedule.poll_interval_secs, 10);
        assert_eq!(config.schedule.fix_time, "23:59");
        assert_eq!(config.openvpn.logs.len(), 1);
        assert_eq!(config.openvpn.client_prefix, "antizapret-");
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = TallyConfig::load("/nonexistent/tally.toml").unwrap();
        assert_eq!(config.retention.daily_days, 7);
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[schedule\npoll = ").unwrap();
        let err = TallyConfig::load(file.path()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_conflicting_zone_is_rejected() {
        let mut config = TallyConfig::default();
        config.clock.timezone = "utc".into();
        config.clock.utc_offset = Some("+03:00".into());
        assert!(config.validate().unwrap_err().is_fatal());

        config.clock.timezone = "+03:00".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_offset_refines_local() {
        let mut config = TallyConfig::default();
        config.clock.utc_offset = Some("+02:00".into());
        assert!(matches!(config.zone().unwrap(), ZoneSetting::Fixed(_)));
    }

    #[test]
    fn test_fix_equal_resume_is_rejected() {
        let mut config = TallyConfig::default();
        config.schedule.resume_time = "23:59".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TallyError::Configuration(_)));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = TallyConfig::default();
        config.retention.history_cap = 0;
        assert!(config.validate().is_err());

        let mut config = TallyConfig::default();
        config.schedule.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
