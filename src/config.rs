use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer timer period. A transfer times out after two silent periods.
    pub keep_alive_ms: u64,
    /// Entries per transfer data chunk.
    pub transfer_chunk_entries: usize,
    /// Chunks granted per clear-to-send.
    pub transfer_quota: usize,
    pub op_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive_ms: 1000,
            transfer_chunk_entries: 64,
            transfer_quota: 4,
            op_timeout_ms: 5000,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let config = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Ok(config)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms * 2)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = serde_json::from_str::<Config>(r#"{"transfer_quota": 1}"#).unwrap();
        assert_eq!(config.transfer_quota, 1);
        assert_eq!(config.keep_alive_ms, Config::default().keep_alive_ms);
        assert_eq!(config.transfer_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn no_path() {
        assert_eq!(Config::load(None).unwrap(), Config::default())
    }
}
