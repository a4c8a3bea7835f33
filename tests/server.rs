use replichat::broker::Broker;
use replichat::config::ClusterConfig;
use replichat::envelope::{Envelope, MessageType};
use replichat::replication::ReplicaNode;
use replichat::transport::{read_frame, write_frame, TcpTransport};
use replichat::{server, Result};
use replichat_store::chatstore::ChatStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::sleep;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Boots a single-node cluster (majority of one) and returns its address.
fn start_server(dir: &TempDir) -> String {
    let port = free_port();
    let mut config = ClusterConfig::new("127.0.0.1", port, vec![]);
    config.data_dir = dir.path().to_path_buf();
    let addr = config.self_id();

    let store = Arc::new(ChatStore::open(dir.path()).unwrap());
    let broker = Arc::new(Broker::new(config.subscriber_queue));
    let transport = Arc::new(TcpTransport::new(config.peer_timeout));
    let node = ReplicaNode::new(config, store, broker, transport);
    tokio::spawn(async move {
        let _ = server::run(node).await;
    });
    addr
}

async fn roundtrip(stream: &mut TcpStream, env: &Envelope) -> Result<Envelope> {
    write_frame(stream, env).await?;
    Ok(read_frame(stream).await?.expect("server closed connection"))
}

/// Polls GET_LEADER until the node has elected itself.
async fn await_leader(addr: &str) {
    for _ in 0..100 {
        if let Ok(mut stream) = TcpStream::connect(addr).await {
            let env = Envelope::new(MessageType::GetLeader);
            if let Ok(resp) = roundtrip(&mut stream, &env).await {
                if resp.str_field("leader") == Some(addr) {
                    return;
                }
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("no leader elected");
}

fn create_account(username: &str) -> Envelope {
    Envelope::new(MessageType::CreateAccount)
        .with("username", json!(username))
        .with("password_verifier", json!(format!("{}-pw", username)))
}

fn login(username: &str) -> Envelope {
    Envelope::new(MessageType::Login)
        .with("username", json!(username))
        .with("password_verifier", json!(format!("{}-pw", username)))
}

#[tokio::test]
async fn account_and_message_flow() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir);
    await_leader(&addr).await;

    let mut conn = TcpStream::connect(&addr).await.unwrap();

    let resp = roundtrip(&mut conn, &create_account("alice")).await.unwrap();
    assert_eq!(resp.kind, MessageType::Success);

    // second create with the same name is refused
    let resp = roundtrip(&mut conn, &create_account("alice")).await.unwrap();
    assert_eq!(resp.kind, MessageType::Error);
    assert_eq!(resp.error_reason(), Some("username_taken"));

    let resp = roundtrip(&mut conn, &create_account("bob")).await.unwrap();
    assert_eq!(resp.kind, MessageType::Success);

    let resp = roundtrip(&mut conn, &login("alice")).await.unwrap();
    assert_eq!(resp.kind, MessageType::Success);

    let list = Envelope::new(MessageType::ListAccounts).with("pattern", json!("*"));
    let resp = roundtrip(&mut conn, &list).await.unwrap();
    assert_eq!(resp.payload["accounts"], json!(["alice", "bob"]));

    let mut send = Envelope::new(MessageType::SendMessage).with("content", json!("hi bob"));
    send.sender = Some("alice".to_string());
    send.recipient = Some("bob".to_string());
    let resp = roundtrip(&mut conn, &send).await.unwrap();
    assert_eq!(resp.kind, MessageType::Success);
    let message_id = resp.u64_field("message_id").unwrap();
    assert!(message_id > 0);

    let conv = Envelope::new(MessageType::ReadConversation)
        .with("username", json!("alice"))
        .with("partner", json!("bob"));
    let resp = roundtrip(&mut conn, &conv).await.unwrap();
    let messages = resp.payload["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "hi bob");

    let partners = Envelope::new(MessageType::ListChatPartners).with("username", json!("alice"));
    let resp = roundtrip(&mut conn, &partners).await.unwrap();
    assert_eq!(resp.payload["partners"], json!(["bob"]));

    // alice owns the message she sent; unknown ids are silently skipped
    let del = Envelope::new(MessageType::DeleteMessages).with("ids", json!([message_id, 9999]));
    let resp = roundtrip(&mut conn, &del).await.unwrap();
    assert_eq!(resp.kind, MessageType::Success);
    assert_eq!(resp.payload["deleted"], json!([message_id]));

    let resp = roundtrip(&mut conn, &conv).await.unwrap();
    assert!(resp.payload["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unauthenticated_writes_are_rejected() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir);
    await_leader(&addr).await;

    let mut conn = TcpStream::connect(&addr).await.unwrap();
    roundtrip(&mut conn, &create_account("alice")).await.unwrap();

    let mut send = Envelope::new(MessageType::SendMessage).with("content", json!("hi"));
    send.sender = Some("alice".to_string());
    send.recipient = Some("alice".to_string());
    let resp = roundtrip(&mut conn, &send).await.unwrap();
    assert_eq!(resp.error_reason(), Some("unauthorized"));

    let del = Envelope::new(MessageType::DeleteAccount).with("username", json!("alice"));
    let resp = roundtrip(&mut conn, &del).await.unwrap();
    assert_eq!(resp.error_reason(), Some("unauthorized"));

    let empty = roundtrip(&mut conn, &create_account("")).await.unwrap();
    assert_eq!(empty.error_reason(), Some("invalid"));
}

#[tokio::test]
async fn subscription_receives_live_messages() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir);
    await_leader(&addr).await;

    let mut alice = TcpStream::connect(&addr).await.unwrap();
    roundtrip(&mut alice, &create_account("alice")).await.unwrap();
    roundtrip(&mut alice, &create_account("bob")).await.unwrap();
    roundtrip(&mut alice, &login("alice")).await.unwrap();

    // bob subscribes on his own authenticated connection
    let mut bob = TcpStream::connect(&addr).await.unwrap();
    roundtrip(&mut bob, &login("bob")).await.unwrap();
    let subscribe = Envelope::new(MessageType::ReadMessages).with("username", json!("bob"));
    write_frame(&mut bob, &subscribe).await.unwrap();

    for content in &["hi1", "hi2"] {
        let mut send = Envelope::new(MessageType::SendMessage).with("content", json!(content));
        send.sender = Some("alice".to_string());
        send.recipient = Some("bob".to_string());
        let resp = roundtrip(&mut alice, &send).await.unwrap();
        assert_eq!(resp.kind, MessageType::Success);
    }

    // both pushes arrive, in commit order
    let first: Envelope = read_frame(&mut bob).await.unwrap().unwrap();
    assert_eq!(first.str_field("content"), Some("hi1"));
    let second: Envelope = read_frame(&mut bob).await.unwrap().unwrap();
    assert_eq!(second.str_field("content"), Some("hi2"));
    assert!(first.u64_field("message_id").unwrap() < second.u64_field("message_id").unwrap());

    // a late subscriber only sees the undelivered tail
    drop(bob);
    let mut send = Envelope::new(MessageType::SendMessage).with("content", json!("hi3"));
    send.sender = Some("alice".to_string());
    send.recipient = Some("bob".to_string());
    roundtrip(&mut alice, &send).await.unwrap();

    sleep(Duration::from_millis(200)).await;
    let mut bob2 = TcpStream::connect(&addr).await.unwrap();
    roundtrip(&mut bob2, &login("bob")).await.unwrap();
    let subscribe = Envelope::new(MessageType::ReadMessages).with("username", json!("bob"));
    write_frame(&mut bob2, &subscribe).await.unwrap();

    let tail: Envelope = read_frame(&mut bob2).await.unwrap().unwrap();
    assert_eq!(tail.str_field("content"), Some("hi3"));
}

#[tokio::test]
async fn delete_account_cascades_everywhere() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir);
    await_leader(&addr).await;

    let mut conn = TcpStream::connect(&addr).await.unwrap();
    roundtrip(&mut conn, &create_account("alice")).await.unwrap();
    roundtrip(&mut conn, &create_account("bob")).await.unwrap();
    roundtrip(&mut conn, &login("alice")).await.unwrap();

    for content in &["one", "two"] {
        let mut send = Envelope::new(MessageType::SendMessage).with("content", json!(content));
        send.sender = Some("alice".to_string());
        send.recipient = Some("bob".to_string());
        roundtrip(&mut conn, &send).await.unwrap();
    }

    let del = Envelope::new(MessageType::DeleteAccount).with("username", json!("alice"));
    let resp = roundtrip(&mut conn, &del).await.unwrap();
    assert_eq!(resp.kind, MessageType::Success);

    let list = Envelope::new(MessageType::ListAccounts).with("pattern", json!("*"));
    let resp = roundtrip(&mut conn, &list).await.unwrap();
    assert_eq!(resp.payload["accounts"], json!(["bob"]));

    let conv = Envelope::new(MessageType::ReadConversation)
        .with("username", json!("bob"))
        .with("partner", json!("alice"));
    let resp = roundtrip(&mut conn, &conv).await.unwrap();
    assert!(resp.payload["messages"].as_array().unwrap().is_empty());
}
