use crate::broker::Broker;
use crate::config::ClusterConfig;
use crate::replication::ReplicaNode;
use crate::transport::TcpTransport;
use crate::{server, ChatError, Result};
use replichat_store::chatstore::ChatStore;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "replichat")]
pub struct ServerArgs {
    /// Interface to bind
    #[structopt(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind; host:port is this server's identity in the cluster
    #[structopt(long)]
    pub port: u16,

    /// Initial peer set, comma-separated host:port pairs, excluding self
    #[structopt(long, default_value = "")]
    pub replicas: String,

    /// Directory for durable state; defaults to ./data-<port>
    #[structopt(long, parse(from_os_str))]
    pub data_dir: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace
    #[structopt(long, default_value = "info")]
    pub log_level: String,

    /// Separate log level for heartbeat traffic
    #[structopt(long, default_value = "trace")]
    pub heartbeat_log_level: String,
}

pub async fn process() -> Result<()> {
    let args = ServerArgs::from_args();

    let filter = ClusterConfig::parse_log_level(&args.log_level)?;
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .init();

    let mut config = ClusterConfig::new(
        &args.host,
        args.port,
        ClusterConfig::parse_replicas(&args.replicas),
    );
    config.heartbeat_log_level = ClusterConfig::parse_heartbeat_level(&args.heartbeat_log_level)?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let store = Arc::new(ChatStore::open(config.data_dir.clone()).map_err(ChatError::Any)?);
    let broker = Arc::new(Broker::new(config.subscriber_queue));
    let transport = Arc::new(TcpTransport::new(config.peer_timeout));
    let node = ReplicaNode::new(config, store, broker, transport);

    server::run(node).await
}
