use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_EVENT_CHANNEL_CAPACITY;
use crate::constants::DEFAULT_SERVER_NAME;
use crate::constants::MAX_OUTSTANDING_REQUESTS;
use crate::Error;
use crate::Result;

/// Property server parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Name used in logs and metric labels
    #[serde(default = "default_name")]
    pub name: String,

    /// Capacity of the bounded batch channel; submitters wait when it is full
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Outstanding request limit; sending beyond it is a protocol violation
    #[serde(default = "default_max_outstanding_requests")]
    pub max_outstanding_requests: usize,

    /// Panic on protocol violations instead of logging and returning an error
    #[serde(default)]
    pub strict_protocol: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            event_channel_capacity: default_event_channel_capacity(),
            max_outstanding_requests: default_max_outstanding_requests(),
            strict_protocol: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "server name must not be empty".to_string(),
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "event_channel_capacity must be > 0".to_string(),
            )));
        }
        if self.max_outstanding_requests == 0 || self.max_outstanding_requests > MAX_OUTSTANDING_REQUESTS {
            return Err(Error::Config(ConfigError::Message(format!(
                "max_outstanding_requests {} must be within 1..={}",
                self.max_outstanding_requests, MAX_OUTSTANDING_REQUESTS
            ))));
        }
        Ok(())
    }
}

fn default_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}
fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}
fn default_max_outstanding_requests() -> usize {
    MAX_OUTSTANDING_REQUESTS
}
