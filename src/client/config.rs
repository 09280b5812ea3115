use crate::error::{BittorrentError, Result};
use crate::peer::PeerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the BitTorrent client
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    /// First port tried for incoming connections
    pub listen_port: u16,
    /// Concurrent peer connections; extra addresses wait in a queue
    pub max_peers: usize,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub disk_timeout_secs: u64,
    pub keepalive_secs: u64,
    /// Block requests kept in flight per connection
    pub pipeline_depth: usize,
    /// Block responses a single peer may have waiting to be sent
    pub max_queued_uploads: usize,
    pub tracker_timeout_secs: u64,
    /// Consecutive failed announce rounds before trackers are abandoned
    pub tracker_failure_budget: u32,
    pub numwant: u32,
    /// Download pieces in order
    pub sequential: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_port: 6881,
            max_peers: 50,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            read_timeout_secs: 180,
            write_timeout_secs: 30,
            disk_timeout_secs: 30,
            keepalive_secs: 120,
            pipeline_depth: 5,
            max_queued_uploads: 500,
            tracker_timeout_secs: 15,
            tracker_failure_budget: 5,
            numwant: 50,
            sequential: false,
        }
    }
}

impl ClientConfig {
    /// Read a JSON configuration file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(BittorrentError::ConfigError(message.to_string()));

        if self.listen_port == 0 {
            return invalid("listen_port must be non-zero");
        }
        if self.max_peers == 0 {
            return invalid("max_peers must be at least 1");
        }
        if self.pipeline_depth == 0 {
            return invalid("pipeline_depth must be at least 1");
        }
        if self.max_queued_uploads == 0 {
            return invalid("max_queued_uploads must be at least 1");
        }
        if self.tracker_failure_budget == 0 {
            return invalid("tracker_failure_budget must be at least 1");
        }
        let timeouts = [
            self.connect_timeout_secs,
            self.handshake_timeout_secs,
            self.read_timeout_secs,
            self.write_timeout_secs,
            self.disk_timeout_secs,
            self.keepalive_secs,
            self.tracker_timeout_secs,
        ];
        if timeouts.contains(&0) {
            return invalid("timeouts must be non-zero");
        }
        if self.keepalive_secs >= self.read_timeout_secs {
            return invalid("keepalive_secs must be shorter than read_timeout_secs");
        }

        Ok(())
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_secs),
            pipeline_depth: self.pipeline_depth,
            max_queued_uploads: self.max_queued_uploads,
            sequential: self.sequential,
        }
    }

    pub fn disk_timeout(&self) -> Duration {
        Duration::from_secs(self.disk_timeout_secs)
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.peer_config().keepalive_interval, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_partial_json_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("client.json");
        std::fs::write(&path, r#"{ "max_peers": 8, "sequential": true }"#).unwrap();

        let config = ClientConfig::load(&path).await.unwrap();
        assert_eq!(config.max_peers, 8);
        assert!(config.sequential);
        assert_eq!(config.listen_port, 6881);
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("client.json");
        std::fs::write(&path, "{ max_peers: ").unwrap();

        assert!(matches!(
            ClientConfig::load(&path).await,
            Err(BittorrentError::JsonError(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = ClientConfig {
            max_peers: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(BittorrentError::ConfigError(_))));

        let config = ClientConfig {
            keepalive_secs: 300,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
