use crate::broker::Subscription;
use crate::envelope::{reason, unix_now, Envelope, MessageType};
use crate::replication::peer::{PeerEnvelope, PeerPayload};
use crate::replication::ReplicaNode;
use crate::session::Session;
use crate::transport::{self, read_frame, write_frame};
use crate::{ChatError, Result};
use log::{debug, info, warn};
use replichat_store::chatstore::{MessageRecord, Record};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

/// Entry point for requests read off a client connection: writes landing on
/// a non-leader are relayed to the leader, everything else runs locally.
pub async fn dispatch(node: &Arc<ReplicaNode>, session: &mut Session, env: Envelope) -> Envelope {
    if is_replicated_write(env.kind) && !node.is_leader().await {
        return forward_to_leader(node, session, env).await;
    }
    dispatch_local(node, session, env).await
}

/// Runs a write relayed over the peer channel. The relaying replica already
/// authenticated `principal` against its own session; this path is only
/// reachable through a `Forwarded` peer payload, never through a client
/// envelope.
pub async fn dispatch_forwarded(
    node: &Arc<ReplicaNode>,
    principal: Option<&str>,
    env: Envelope,
) -> Envelope {
    if !node.is_leader().await {
        // the origin held a stale leader hint; let the client retry
        return Envelope::error(reason::RETRY, "not the leader");
    }
    let mut session = Session::default();
    if let Some(user) = principal {
        session.login(user);
    }
    dispatch_local(node, &mut session, env).await
}

fn is_replicated_write(kind: MessageType) -> bool {
    matches!(
        kind,
        MessageType::CreateAccount
            | MessageType::SendMessage
            | MessageType::DeleteMessages
            | MessageType::DeleteAccount
            | MessageType::MarkRead
    )
}

/// Routes one request to its handler and turns errors into ERROR envelopes.
async fn dispatch_local(node: &Arc<ReplicaNode>, session: &mut Session, env: Envelope) -> Envelope {
    let result = match env.kind {
        MessageType::CreateAccount => create_account(node, &env).await,
        MessageType::Login => login(node, session, &env),
        MessageType::ListAccounts => list_accounts(node, &env),
        MessageType::SendMessage => send_message(node, session, &env).await,
        MessageType::ReadConversation => read_conversation(node, &env),
        MessageType::DeleteMessages => delete_messages(node, session, &env).await,
        MessageType::DeleteAccount => delete_account(node, session, &env).await,
        MessageType::MarkRead => mark_read(node, session, &env).await,
        MessageType::ListChatPartners => list_chat_partners(node, &env),
        MessageType::GetLeader => get_leader(node).await,
        MessageType::GetClusterNodes => Ok(cluster_nodes(node)),
        MessageType::ReadMessages | MessageType::Success | MessageType::Error => Err(
            ChatError::validation(reason::INVALID, "unexpected request type"),
        ),
    };
    result.unwrap_or_else(error_envelope)
}

fn error_envelope(err: ChatError) -> Envelope {
    match err {
        ChatError::Validation { reason, detail } => Envelope::error(&reason, &detail),
        ChatError::NotLeader { leader_hint } => {
            let mut env = Envelope::error(reason::NO_LEADER, "write must go to the leader");
            if let Some(leader) = leader_hint {
                env.payload.insert("leader".to_string(), json!(leader));
            }
            env
        }
        ChatError::Transient(detail) => Envelope::error(reason::RETRY, &detail),
        other => Envelope::error(reason::RETRY, &other.to_string()),
    }
}

/// Relays a client write to the known leader over the peer channel and
/// hands its response back. The principal this replica authenticated rides
/// in the peer payload, since the session itself does not travel.
async fn forward_to_leader(
    node: &Arc<ReplicaNode>,
    session: &mut Session,
    env: Envelope,
) -> Envelope {
    let leader = match node
        .leader_hint()
        .await
        .filter(|leader| *leader != node.config.self_id())
    {
        Some(leader) => leader,
        None => return Envelope::error(reason::NO_LEADER, "no leader, retry"),
    };

    let request = PeerEnvelope::new(
        node.current_term(),
        &node.config.self_id(),
        PeerPayload::Forwarded {
            principal: session.user().map(String::from),
            request: env.clone(),
        },
    );
    debug!("forwarding {:?} to leader {}", env.kind, leader);
    match transport::request::<_, PeerEnvelope>(&leader, &request, node.config.write_deadline).await
    {
        Ok(reply) => match reply.payload {
            PeerPayload::ForwardedResponse { response } => {
                if env.kind == MessageType::DeleteAccount && !response.is_error() {
                    session.logout();
                }
                response
            }
            _ => Envelope::error(reason::RETRY, "unexpected forward reply"),
        },
        Err(e) => error_envelope(e),
    }
}

/// Replicates one operation within the client write deadline.
async fn replicate_write<F>(node: &Arc<ReplicaNode>, build: F) -> Result<Record>
where
    F: FnOnce(u64) -> Record + Send,
{
    match timeout(node.config.write_deadline, node.replicate(build)).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::Transient("write deadline expired".into())),
    }
}

fn validate_username(node: &ReplicaNode, username: &str) -> Result<()> {
    let ok = !username.is_empty()
        && username.len() <= node.config.max_username_len
        && !username
            .chars()
            .any(|c| c.is_whitespace() || c == '*' || c == '?');
    if ok {
        Ok(())
    } else {
        Err(ChatError::validation(reason::INVALID, "invalid username"))
    }
}

async fn create_account(node: &Arc<ReplicaNode>, env: &Envelope) -> Result<Envelope> {
    let username = env.str_field("username").unwrap_or("").to_string();
    let verifier = env.str_field("password_verifier").unwrap_or("").to_string();
    validate_username(node, &username)?;
    if verifier.is_empty() {
        return Err(ChatError::validation(
            reason::INVALID,
            "missing password_verifier",
        ));
    }

    if node.store.account_exists(&username) {
        return Err(ChatError::validation(reason::USERNAME_TAKEN, &username));
    }

    let created_at = unix_now();
    replicate_write(node, move |id| Record::CreateAccount {
        id,
        username,
        verifier,
        created_at,
    })
    .await?;
    Ok(Envelope::success())
}

fn login(node: &Arc<ReplicaNode>, session: &mut Session, env: &Envelope) -> Result<Envelope> {
    let username = env.str_field("username").unwrap_or("");
    let verifier = env.str_field("password_verifier").unwrap_or("");

    match node.store.verify_login(username, verifier) {
        None => Err(ChatError::validation(reason::NO_SUCH_USER, username)),
        Some(false) => Err(ChatError::validation(reason::BAD_CREDENTIALS, "")),
        Some(true) => {
            session.login(username);
            info!("{} logged in", username);
            Ok(Envelope::success())
        }
    }
}

fn list_accounts(node: &Arc<ReplicaNode>, env: &Envelope) -> Result<Envelope> {
    let pattern = env.str_field("pattern").unwrap_or("*");
    let accounts = node
        .store
        .list_accounts(pattern)
        .map_err(|e| ChatError::validation(reason::INVALID, e.to_string()))?;
    Ok(Envelope::success().with("accounts", json!(accounts)))
}

async fn send_message(
    node: &Arc<ReplicaNode>,
    session: &mut Session,
    env: &Envelope,
) -> Result<Envelope> {
    let sender = env
        .sender
        .clone()
        .ok_or_else(|| ChatError::validation(reason::INVALID, "missing sender"))?;
    let recipient = env
        .recipient
        .clone()
        .ok_or_else(|| ChatError::validation(reason::INVALID, "missing recipient"))?;
    let content = env.str_field("content").unwrap_or("").to_string();
    if content.is_empty() || content.len() > node.config.max_content_len {
        return Err(ChatError::validation(reason::INVALID, "bad content length"));
    }

    match session.user() {
        Some(user) if user == sender => {}
        Some(_) => {
            return Err(ChatError::validation(
                reason::UNAUTHORIZED,
                "session does not match sender",
            ))
        }
        None => return Err(ChatError::validation(reason::UNAUTHORIZED, "login required")),
    }

    if !node.store.account_exists(&recipient) {
        return Err(ChatError::validation(reason::NO_SUCH_USER, &recipient));
    }

    let timestamp = unix_now();
    let record = replicate_write(node, move |id| Record::InsertMessage {
        id,
        sender,
        recipient,
        content,
        timestamp,
    })
    .await?;
    Ok(Envelope::success()
        .with("message_id", json!(record.id()))
        .with("timestamp", json!(timestamp)))
}

fn read_conversation(node: &Arc<ReplicaNode>, env: &Envelope) -> Result<Envelope> {
    let username = env
        .str_field("username")
        .ok_or_else(|| ChatError::validation(reason::INVALID, "missing username"))?;
    let partner = env
        .str_field("partner")
        .ok_or_else(|| ChatError::validation(reason::INVALID, "missing partner"))?;
    let limit = env.u64_field("limit").unwrap_or(50) as usize;
    let before_id = env.u64_field("before_id");

    let messages = node
        .store
        .fetch_conversation(username, partner, limit, before_id);
    Ok(Envelope::success().with("messages", json!(messages)))
}

async fn delete_messages(
    node: &Arc<ReplicaNode>,
    session: &mut Session,
    env: &Envelope,
) -> Result<Envelope> {
    let requester = session
        .user()
        .ok_or_else(|| ChatError::validation(reason::UNAUTHORIZED, "login required"))?
        .to_string();
    let ids = env.id_list("ids");
    if ids.is_empty() {
        return Err(ChatError::validation(reason::INVALID, "no ids"));
    }

    // the answer is the pre-state subset the requester actually owns
    let deleted = node.store.deletable_ids(&ids, &requester);
    replicate_write(node, move |id| Record::DeleteMessages {
        id,
        ids,
        requester,
    })
    .await?;
    Ok(Envelope::success().with("deleted", json!(deleted)))
}

async fn delete_account(
    node: &Arc<ReplicaNode>,
    session: &mut Session,
    env: &Envelope,
) -> Result<Envelope> {
    let username = env
        .str_field("username")
        .ok_or_else(|| ChatError::validation(reason::INVALID, "missing username"))?
        .to_string();
    match session.user() {
        Some(user) if user == username => {}
        _ => {
            return Err(ChatError::validation(
                reason::UNAUTHORIZED,
                "session does not match username",
            ))
        }
    }

    if !node.store.account_exists(&username) {
        return Err(ChatError::validation(reason::NO_SUCH_USER, &username));
    }

    replicate_write(node, move |id| Record::DeleteAccount { id, username }).await?;
    session.logout();
    Ok(Envelope::success())
}

async fn mark_read(
    node: &Arc<ReplicaNode>,
    session: &mut Session,
    env: &Envelope,
) -> Result<Envelope> {
    let username = env
        .str_field("username")
        .ok_or_else(|| ChatError::validation(reason::INVALID, "missing username"))?
        .to_string();
    match session.user() {
        Some(user) if user == username => {}
        _ => {
            return Err(ChatError::validation(
                reason::UNAUTHORIZED,
                "session does not match username",
            ))
        }
    }
    let ids = env.id_list("ids");
    if ids.is_empty() {
        return Err(ChatError::validation(reason::INVALID, "no ids"));
    }

    replicate_write(node, move |id| Record::MarkRead {
        id,
        ids,
        requester: username,
    })
    .await?;
    Ok(Envelope::success())
}

fn list_chat_partners(node: &Arc<ReplicaNode>, env: &Envelope) -> Result<Envelope> {
    let username = env
        .str_field("username")
        .ok_or_else(|| ChatError::validation(reason::INVALID, "missing username"))?;
    let partners = node.store.list_chat_partners(username);
    Ok(Envelope::success().with("partners", json!(partners)))
}

async fn get_leader(node: &Arc<ReplicaNode>) -> Result<Envelope> {
    let leader = node.leader_hint().await;
    Ok(Envelope::success().with("leader", json!(leader)))
}

fn cluster_nodes(node: &Arc<ReplicaNode>) -> Envelope {
    Envelope::success().with("nodes", json!(node.cluster_nodes()))
}

fn message_envelope(message: &MessageRecord) -> Envelope {
    let mut env = Envelope::success()
        .with("message_id", json!(message.id))
        .with("sender", json!(message.sender))
        .with("recipient", json!(message.recipient))
        .with("content", json!(message.content))
        .with("timestamp", json!(message.timestamp));
    env.sender = Some(message.sender.clone());
    env.recipient = Some(message.recipient.clone());
    env
}

/// The server half of a READ_MESSAGES subscription: flush the committed
/// undelivered backlog, then push messages as they commit here, until the
/// client goes away or the broker drops us.
pub async fn stream_messages<R, W>(
    node: &Arc<ReplicaNode>,
    session: &Session,
    env: Envelope,
    rd: &mut R,
    wr: &mut W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let username = match env.str_field("username") {
        Some(username) => username.to_string(),
        None => {
            let err = Envelope::error(reason::INVALID, "missing username");
            return write_frame(wr, &err).await;
        }
    };
    if !session.is(&username) {
        let err = Envelope::error(reason::UNAUTHORIZED, "login required");
        return write_frame(wr, &err).await;
    }

    let mut sub: Subscription = node.broker.subscribe(&username);
    info!("{} subscribed for live messages", username);

    let limit = env
        .u64_field("limit")
        .map(|n| n as usize)
        .unwrap_or(usize::MAX);
    let backlog = node
        .store
        .undelivered_for(&username, node.store.commit_index());

    let mut last_pushed = 0;
    let mut flushed = Vec::new();
    for message in backlog.into_iter().take(limit) {
        last_pushed = message.id;
        flushed.push(message.id);
        write_frame(wr, &message_envelope(&message)).await?;
    }
    if !flushed.is_empty() {
        acknowledge_delivery(node, flushed).await;
    }

    loop {
        tokio::select! {
            received = sub.rx.recv() => match received {
                Some(message) => {
                    // the backlog flush may overlap the first queued pushes
                    if message.id <= last_pushed {
                        continue;
                    }
                    last_pushed = message.id;
                    write_frame(wr, &message_envelope(&message)).await?;
                    acknowledge_delivery(node, vec![message.id]).await;
                }
                None => {
                    warn!("subscription for {} dropped: queue overflow", username);
                    return Ok(());
                }
            },
            // subscribers never speak mid-stream; any read activity is
            // either noise or the disconnect we are waiting for
            gone = read_frame::<_, serde_json::Value>(rd) => match gone {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    debug!("{} unsubscribed", username);
                    return Ok(());
                }
            },
        }
    }
}

/// Flips the delivered flags for ids just pushed on a stream. On the
/// leader this is a direct replicated write; elsewhere it is handed to the
/// leader over the peer channel.
async fn acknowledge_delivery(node: &Arc<ReplicaNode>, ids: Vec<u64>) {
    if node.is_leader().await {
        if let Err(e) = node
            .replicate(move |id| Record::MarkDelivered { id, ids })
            .await
        {
            debug!("mark-delivered replication failed: {}", e);
        }
        return;
    }

    if let Some(leader) = node.leader_hint().await {
        let request = PeerEnvelope::new(
            node.current_term(),
            &node.config.self_id(),
            PeerPayload::MarkDeliveredRequest { ids },
        );
        if let Err(e) =
            transport::request::<_, PeerEnvelope>(&leader, &request, node.config.peer_timeout)
                .await
        {
            debug!("mark-delivered forward to {} failed: {}", leader, e);
        }
    }
}
