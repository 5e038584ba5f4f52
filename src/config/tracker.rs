use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::TRACKER_CLEANUP_INTERVAL_MS;
use crate::constants::TRACKER_CLEANUP_THRESHOLD;
use crate::Error;
use crate::Result;

/// Dead response trackers are swept once a property holds more than
/// `cleanup_threshold` of them, at most once per `cleanup_interval_ms`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TrackerConfig {
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_threshold: usize,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cleanup_threshold: default_cleanup_threshold(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cleanup_threshold == 0 {
            return Err(Error::Config(ConfigError::Message(
                "tracker cleanup_threshold must be > 0".to_string(),
            )));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "tracker cleanup_interval_ms must be > 0".to_string(),
            )));
        }
        Ok(())
    }
}

fn default_cleanup_threshold() -> usize {
    TRACKER_CLEANUP_THRESHOLD
}
fn default_cleanup_interval_ms() -> u64 {
    TRACKER_CLEANUP_INTERVAL_MS
}
