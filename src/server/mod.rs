pub mod client_api;
pub mod peer_api;

use crate::envelope::{reason, Envelope, MessageType};
use crate::replication::peer::PeerEnvelope;
use crate::replication::ReplicaNode;
use crate::session::Session;
use crate::transport::{read_frame, write_frame};
use crate::{ChatError, Result};
use anyhow::anyhow;
use log::{debug, info};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Clients and peers share the listening port; a peer envelope carries a
/// term, a client envelope carries a type tag.
#[derive(Deserialize)]
#[serde(untagged)]
enum Inbound {
    Peer(PeerEnvelope),
    Client(Envelope),
}

/// Binds the server socket, starts the replication tasks and serves
/// connections until the process dies.
pub async fn run(node: Arc<ReplicaNode>) -> Result<()> {
    let addr = node.config.self_id();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ChatError::Any(anyhow!("cannot bind {}: {}", addr, e)))?;
    info!("listening on {}", addr);
    node.start();

    loop {
        let (stream, remote) = listener.accept().await?;
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(node, stream).await {
                debug!("connection from {} ended: {}", remote, e);
            }
        });
    }
}

async fn handle_connection(node: Arc<ReplicaNode>, stream: TcpStream) -> Result<()> {
    let (mut rd, mut wr) = stream.into_split();
    let mut session = Session::default();

    loop {
        let inbound: Option<Inbound> = match read_frame(&mut rd).await {
            Ok(inbound) => inbound,
            Err(ChatError::Serde(e)) => {
                let err = Envelope::error(reason::INVALID, "malformed envelope");
                write_frame(&mut wr, &err).await?;
                return Err(ChatError::Serde(e));
            }
            Err(e) => return Err(e),
        };

        match inbound {
            None => return Ok(()),
            Some(Inbound::Peer(env)) => {
                let resp = peer_api::handle_replication(&node, env).await;
                write_frame(&mut wr, &resp).await?;
            }
            Some(Inbound::Client(env)) => {
                if env.kind == MessageType::ReadMessages {
                    return client_api::stream_messages(&node, &session, env, &mut rd, &mut wr)
                        .await;
                }
                let resp = client_api::dispatch(&node, &mut session, env).await;
                write_frame(&mut wr, &resp).await?;
            }
        }
    }
}
