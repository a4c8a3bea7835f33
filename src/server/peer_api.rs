use crate::replication::peer::{PeerEnvelope, PeerPayload};
use crate::replication::ReplicaNode;
use crate::server::client_api;
use log::debug;
use std::sync::Arc;

/// Inbound server-to-server dispatch. One envelope in, one envelope out;
/// the term rule is applied by each payload handler before anything else.
pub async fn handle_replication(node: &Arc<ReplicaNode>, env: PeerEnvelope) -> PeerEnvelope {
    match env.payload.clone() {
        PeerPayload::Heartbeat { commit_index } => {
            log::log!(
                node.config.heartbeat_log_level,
                "heartbeat from {} at term {}",
                env.server_id,
                env.term
            );
            node.handle_heartbeat(&env.server_id, env.term, commit_index)
                .await
        }
        PeerPayload::VoteRequest {
            last_log_term,
            last_log_index,
        } => {
            debug!("vote request from {} for term {}", env.server_id, env.term);
            node.handle_vote_request(&env.server_id, env.term, last_log_term, last_log_index)
                .await
        }
        PeerPayload::Replicate { record } => {
            node.handle_replicate(&env.server_id, env.term, record).await
        }
        PeerPayload::MarkDeliveredRequest { ids } => {
            node.handle_mark_delivered(env.term, ids).await
        }
        PeerPayload::Forwarded { principal, request } => {
            if env.term > node.current_term() {
                node.step_down(env.term).await;
            }
            debug!("forwarded {:?} from {}", request.kind, env.server_id);
            let response = client_api::dispatch_forwarded(node, principal.as_deref(), request).await;
            PeerEnvelope::new(
                node.current_term(),
                &node.config.self_id(),
                PeerPayload::ForwardedResponse { response },
            )
        }
        PeerPayload::SnapshotRequest => {
            debug!("snapshot requested by {}", env.server_id);
            node.handle_snapshot_request().await
        }
        // response payloads only travel back on the requester's connection
        PeerPayload::VoteResponse { .. }
        | PeerPayload::ReplicationResponse { .. }
        | PeerPayload::SnapshotResponse { .. }
        | PeerPayload::ForwardedResponse { .. } => {
            debug!(
                "unexpected inbound response payload from {}",
                env.server_id
            );
            PeerEnvelope::new(
                node.current_term(),
                &node.config.self_id(),
                PeerPayload::ReplicationResponse {
                    success: false,
                    applied: 0,
                },
            )
        }
    }
}
