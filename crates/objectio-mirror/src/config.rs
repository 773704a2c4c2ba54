//! Mirror job configuration
//!
//! Defines the options accepted when a mirror job is started, their defaults
//! and the validation applied before a job is created.

use crate::device::DeviceInfo;
use crate::error::{MirrorError, MirrorResult};
use crate::{DEFAULT_BUF_SIZE, MAX_GRANULARITY, MIN_GRANULARITY};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which regions are copied before the job starts following new writes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Copy everything the source chain holds
    #[default]
    Full,
    /// Copy what was allocated above the base snapshot point
    SinceBase,
    /// Copy only what the top layer of the source holds
    #[serde(alias = "top")]
    TopLayerOnly,
    /// Copy nothing up front, only writes made while the job runs
    None,
}

/// What to do when a transfer fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorAction {
    /// Fail the job
    #[default]
    Report,
    /// Re-dirty the range and keep going
    Ignore,
    /// Re-dirty the range and pause the job until it is resumed
    Stop,
}

/// Mirror job configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Job identifier used in logs and status
    pub job_id: String,
    /// Chunk granularity in bytes (None = derive from the target)
    pub granularity: Option<u64>,
    /// Buffer pool size in bytes (None = 16 MiB)
    pub buf_size: Option<u64>,
    /// Copy speed limit in bytes per second (0 = unlimited)
    pub speed: u64,
    /// Initial sync mode
    pub sync_mode: SyncMode,
    /// Policy for source read failures
    pub on_source_error: ErrorAction,
    /// Policy for target write failures
    pub on_target_error: ErrorAction,
    /// Allow zero writes to unmap target clusters
    pub unmap: bool,
    /// Complete as soon as the target is in sync
    pub auto_complete: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            job_id: format!("mirror-{}", Uuid::new_v4()),
            granularity: None,
            buf_size: None,
            speed: 0,
            sync_mode: SyncMode::Full,
            on_source_error: ErrorAction::Report,
            on_target_error: ErrorAction::Report,
            unmap: true,
            auto_complete: false,
        }
    }
}

impl MirrorConfig {
    /// Parse a JSON configuration; missing fields keep their defaults
    pub fn from_json(json: &str) -> MirrorResult<Self> {
        serde_json::from_str(json).map_err(|e| MirrorError::InvalidConfig(e.to_string()))
    }

    /// Reject configurations no job can run with
    pub fn validate(&self) -> MirrorResult<()> {
        if self.job_id.is_empty() {
            return Err(MirrorError::InvalidConfig("job id is empty".to_string()));
        }

        if let Some(granularity) = self.granularity {
            if !granularity.is_power_of_two() {
                return Err(MirrorError::InvalidConfig(format!(
                    "granularity {granularity} is not a power of two"
                )));
            }
            if !(MIN_GRANULARITY..=MAX_GRANULARITY).contains(&granularity) {
                return Err(MirrorError::InvalidConfig(format!(
                    "granularity {granularity} outside {MIN_GRANULARITY}..={MAX_GRANULARITY}"
                )));
            }
        }

        if self.buf_size == Some(0) {
            return Err(MirrorError::InvalidConfig(
                "buffer size must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Granularity to use against a target with the given characteristics
    pub fn effective_granularity(&self, target: &DeviceInfo) -> u64 {
        self.granularity
            .unwrap_or_else(|| default_granularity(target))
    }

    /// Buffer pool size, rounded up to the granularity
    pub fn effective_buf_size(&self, granularity: u64) -> u64 {
        let size = self.buf_size.unwrap_or(DEFAULT_BUF_SIZE);
        size.div_ceil(granularity) * granularity
    }
}

/// Granularity derived from the target's cluster size
///
/// The cluster size is used when it falls within 4 KiB..=64 KiB and clamped
/// otherwise; targets that report no cluster size get 64 KiB.
pub fn default_granularity(target: &DeviceInfo) -> u64 {
    if target.cluster_size == 0 {
        return 64 * 1024;
    }
    target.cluster_size.clamp(4096, 64 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MirrorConfig::default();
        assert!(config.job_id.starts_with("mirror-"));
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_buf_size(64 * 1024), DEFAULT_BUF_SIZE);
    }

    #[test]
    fn test_rejects_bad_granularity() {
        let config = MirrorConfig {
            granularity: Some(3000),
            ..MirrorConfig::default()
        };
        assert!(config.validate().unwrap_err().is_config());

        let config = MirrorConfig {
            granularity: Some(256),
            ..MirrorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MirrorConfig {
            granularity: Some(128 * 1024 * 1024),
            ..MirrorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let config = MirrorConfig {
            buf_size: Some(0),
            ..MirrorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_granularity_derivation() {
        let mut info = DeviceInfo::default();
        assert_eq!(default_granularity(&info), 64 * 1024);

        info.cluster_size = 512;
        assert_eq!(default_granularity(&info), 4096);

        info.cluster_size = 16 * 1024;
        assert_eq!(default_granularity(&info), 16 * 1024);

        info.cluster_size = 2 * 1024 * 1024;
        assert_eq!(default_granularity(&info), 64 * 1024);

        let config = MirrorConfig {
            granularity: Some(1024 * 1024),
            ..MirrorConfig::default()
        };
        assert_eq!(config.effective_granularity(&info), 1024 * 1024);
    }

    #[test]
    fn test_buf_size_rounds_up() {
        let config = MirrorConfig {
            buf_size: Some(100 * 1024),
            ..MirrorConfig::default()
        };
        assert_eq!(config.effective_buf_size(64 * 1024), 128 * 1024);
    }

    #[test]
    fn test_from_json() {
        let config = MirrorConfig::from_json(
            r#"{"job_id": "vm0-disk", "speed": 1048576, "sync_mode": "top-layer-only",
                "on_target_error": "ignore"}"#,
        )
        .unwrap();
        assert_eq!(config.job_id, "vm0-disk");
        assert_eq!(config.speed, 1024 * 1024);
        assert_eq!(config.sync_mode, SyncMode::TopLayerOnly);
        assert_eq!(config.on_target_error, ErrorAction::Ignore);
        assert_eq!(config.on_source_error, ErrorAction::Report);
        assert!(config.unmap);

        assert!(MirrorConfig::from_json("{\"speed\": \"fast\"}").is_err());
    }
}
