use crate::{ChatError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Everything a replica needs to know at startup: its own identity, the
/// static peer set, and the protocol timing knobs.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,

    /// Initial peer set, `host:port`, excluding self.
    pub replicas: Vec<String>,

    pub data_dir: PathBuf,

    /// Election timeout is drawn uniformly from this range per cycle.
    pub election_timeout_ms: (u64, u64),
    pub heartbeat_interval: Duration,

    /// Budget for a client write to reach a majority.
    pub write_deadline: Duration,
    /// Budget for one peer RPC.
    pub peer_timeout: Duration,

    /// Per-subscription queue bound; a subscriber that falls further behind
    /// is dropped.
    pub subscriber_queue: usize,
    pub max_content_len: usize,
    pub max_username_len: usize,

    /// Heartbeat traffic logs at this level so it can be silenced
    /// independently of everything else.
    pub heartbeat_log_level: log::Level,
}

impl ClusterConfig {
    pub fn new(host: &str, port: u16, replicas: Vec<String>) -> Self {
        ClusterConfig {
            host: host.to_string(),
            port,
            replicas,
            data_dir: PathBuf::from(format!("data-{}", port)),
            election_timeout_ms: (150, 300),
            heartbeat_interval: Duration::from_millis(50),
            write_deadline: Duration::from_secs(2),
            peer_timeout: Duration::from_millis(500),
            subscriber_queue: 64,
            max_content_len: 4096,
            max_username_len: 64,
            heartbeat_log_level: log::Level::Trace,
        }
    }

    /// This server's identity on the wire.
    pub fn self_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cluster_size(&self) -> usize {
        self.replicas.len() + 1
    }

    /// Strict majority of the configured cluster, counting self.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn parse_replicas(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn parse_log_level(raw: &str) -> Result<log::LevelFilter> {
        log::LevelFilter::from_str(raw)
            .map_err(|_| ChatError::validation("invalid", format!("bad log level: {}", raw)))
    }

    pub fn parse_heartbeat_level(raw: &str) -> Result<log::Level> {
        log::Level::from_str(raw)
            .map_err(|_| ChatError::validation("invalid", format!("bad log level: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_math() {
        let single = ClusterConfig::new("127.0.0.1", 50051, vec![]);
        assert_eq!(single.majority(), 1);

        let three = ClusterConfig::new(
            "127.0.0.1",
            50051,
            vec!["127.0.0.1:50052".into(), "127.0.0.1:50053".into()],
        );
        assert_eq!(three.cluster_size(), 3);
        assert_eq!(three.majority(), 2);

        let five = ClusterConfig::new(
            "127.0.0.1",
            50051,
            (2..6).map(|i| format!("127.0.0.1:5005{}", i)).collect(),
        );
        assert_eq!(five.majority(), 3);
    }

    #[test]
    fn replica_list_parsing() {
        assert!(ClusterConfig::parse_replicas("").is_empty());
        assert_eq!(
            ClusterConfig::parse_replicas("a:1, b:2 ,,c:3"),
            vec!["a:1", "b:2", "c:3"]
        );
    }

    #[test]
    fn level_parsing() {
        assert!(ClusterConfig::parse_log_level("debug").is_ok());
        assert!(ClusterConfig::parse_log_level("noisy").is_err());
        assert!(ClusterConfig::parse_heartbeat_level("trace").is_ok());
    }
}
