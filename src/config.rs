//! Client configuration
//!
//! All tunables for the download engine: the output directory, the port we
//! advertise to trackers, and the protocol timeouts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a torrent download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory the output file is created in
    pub output_dir: PathBuf,

    /// Port reported to trackers as our listen port.
    /// This client never accepts incoming connections, but trackers
    /// require a port in every announce.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// TCP connect timeout for peer connections, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// General peer read deadline, in seconds
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Deadline for downloading one whole piece from a peer, in seconds
    #[serde(default = "default_piece_timeout_secs")]
    pub piece_timeout_secs: u64,

    /// HTTP tracker announce timeout, in seconds
    #[serde(default = "default_announce_timeout_secs")]
    pub announce_timeout_secs: u64,

    /// Per-attempt deadline for UDP tracker exchanges, in seconds
    #[serde(default = "default_udp_announce_timeout_secs")]
    pub udp_announce_timeout_secs: u64,

    /// Number of UDP announce attempts before giving up on a tracker
    #[serde(default = "default_udp_announce_attempts")]
    pub udp_announce_attempts: u32,

    /// How long a supervisor waits before reconnecting to a dead peer,
    /// in seconds
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,

    /// Idle sleep when the work queue is empty or the peer lacks the
    /// dequeued piece, in seconds
    #[serde(default = "default_idle_wait_secs")]
    pub idle_wait_secs: u64,
}

fn default_listen_port() -> u16 {
    6881
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_piece_timeout_secs() -> u64 {
    60
}

fn default_announce_timeout_secs() -> u64 {
    15
}

fn default_udp_announce_timeout_secs() -> u64 {
    10
}

fn default_udp_announce_attempts() -> u32 {
    3
}

fn default_restart_delay_secs() -> u64 {
    10
}

fn default_idle_wait_secs() -> u64 {
    1
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            listen_port: default_listen_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            piece_timeout_secs: default_piece_timeout_secs(),
            announce_timeout_secs: default_announce_timeout_secs(),
            udp_announce_timeout_secs: default_udp_announce_timeout_secs(),
            udp_announce_attempts: default_udp_announce_attempts(),
            restart_delay_secs: default_restart_delay_secs(),
            idle_wait_secs: default_idle_wait_secs(),
        }
    }
}

impl ClientConfig {
    /// Config writing into the given output directory, defaults elsewhere
    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn piece_timeout(&self) -> Duration {
        Duration::from_secs(self.piece_timeout_secs)
    }

    pub fn announce_timeout(&self) -> Duration {
        Duration::from_secs(self.announce_timeout_secs)
    }

    pub fn udp_announce_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_announce_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.listen_port, 6881);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.piece_timeout(), Duration::from_secs(60));
        assert_eq!(config.udp_announce_attempts, 3);
    }

    #[test]
    fn test_deserialize_with_missing_fields() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"output_dir": "/tmp/downloads"}"#).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.restart_delay_secs, 10);
    }
}
