use crate::envelope::{unix_now, Envelope};
use replichat_store::chatstore::Record;
use serde::{Deserialize, Serialize};

/// Everything servers say to each other. The term rides on the envelope so
/// every handler can apply the stale-term rule before touching the payload.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PeerEnvelope {
    pub term: u64,
    pub server_id: String,
    pub timestamp: u64,
    pub payload: PeerPayload,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerPayload {
    /// Periodic leader beacon; also advances follower commit.
    Heartbeat { commit_index: u64 },

    VoteRequest {
        last_log_term: u64,
        last_log_index: u64,
    },
    VoteResponse { vote_granted: bool },

    /// One replicated operation, typed by its record.
    Replicate { record: Record },

    /// Ack for heartbeats and replicates; `applied` is the responder's
    /// highest gap-free operation id.
    ReplicationResponse { success: bool, applied: u64 },

    /// A replica asks the leader to flip delivery flags it cannot flip
    /// itself (the replica just pushed these ids to a subscriber).
    MarkDeliveredRequest { ids: Vec<u64> },

    /// A client write relayed by the replica that received it, with the
    /// principal that replica authenticated against its own session. Riding
    /// the peer channel keeps the relayed-principal path out of reach of
    /// direct client envelopes.
    Forwarded {
        principal: Option<String>,
        request: Envelope,
    },
    ForwardedResponse { response: Envelope },

    /// Late-joiner catch-up.
    SnapshotRequest,
    SnapshotResponse {
        commit_index: u64,
        records: Vec<Record>,
    },
}

impl PeerEnvelope {
    pub fn new(term: u64, server_id: &str, payload: PeerPayload) -> Self {
        PeerEnvelope {
            term,
            server_id: server_id.to_string(),
            timestamp: unix_now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tags() {
        let env = PeerEnvelope::new(
            3,
            "127.0.0.1:50051",
            PeerPayload::Heartbeat { commit_index: 9 },
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["term"], 3);
        assert_eq!(value["payload"]["type"], "heartbeat");
        assert_eq!(value["payload"]["commit_index"], 9);

        let raw = r#"{
            "term": 4,
            "server_id": "127.0.0.1:50052",
            "timestamp": 0,
            "payload": {"type": "vote_request", "last_log_term": 2, "last_log_index": 17}
        }"#;
        let parsed: PeerEnvelope = serde_json::from_str(raw).unwrap();
        match parsed.payload {
            PeerPayload::VoteRequest {
                last_log_term,
                last_log_index,
            } => {
                assert_eq!((last_log_term, last_log_index), (2, 17));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn forwarded_write_roundtrip() {
        use crate::envelope::MessageType;
        use serde_json::json;

        let request = Envelope::new(MessageType::DeleteAccount).with("username", json!("alice"));
        let env = PeerEnvelope::new(
            2,
            "b:2",
            PeerPayload::Forwarded {
                principal: Some("alice".to_string()),
                request,
            },
        );
        let round: PeerEnvelope =
            serde_json::from_slice(&serde_json::to_vec(&env).unwrap()).unwrap();
        match round.payload {
            PeerPayload::Forwarded { principal, request } => {
                assert_eq!(principal.as_deref(), Some("alice"));
                assert_eq!(request.kind, MessageType::DeleteAccount);
                assert_eq!(request.str_field("username"), Some("alice"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn replicate_carries_typed_record() {
        let env = PeerEnvelope::new(
            1,
            "a:1",
            PeerPayload::Replicate {
                record: Record::CreateAccount {
                    id: 5,
                    username: "alice".to_string(),
                    verifier: "v".to_string(),
                    created_at: 0,
                },
            },
        );
        let round: PeerEnvelope =
            serde_json::from_slice(&serde_json::to_vec(&env).unwrap()).unwrap();
        match round.payload {
            PeerPayload::Replicate { record } => assert_eq!(record.id(), 5),
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
