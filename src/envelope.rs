use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Error reasons surfaced to clients.
pub mod reason {
    pub const USERNAME_TAKEN: &str = "username_taken";
    pub const INVALID: &str = "invalid";
    pub const NO_SUCH_USER: &str = "no_such_user";
    pub const BAD_CREDENTIALS: &str = "bad_credentials";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NO_LEADER: &str = "no_leader";
    pub const RETRY: &str = "retry";
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    CreateAccount,
    Login,
    ListAccounts,
    SendMessage,
    ReadMessages,
    ReadConversation,
    DeleteMessages,
    DeleteAccount,
    Error,
    Success,
    ListChatPartners,
    GetLeader,
    MarkRead,
    GetClusterNodes,
}

/// The single client envelope shape. Every client-facing request and
/// response is one of these; operation-specific fields live in the untyped
/// `payload` map.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default)]
    pub payload: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Envelope {
            kind,
            payload: Map::new(),
            sender: None,
            recipient: None,
            timestamp: unix_now(),
        }
    }

    pub fn success() -> Self {
        Envelope::new(MessageType::Success)
    }

    pub fn error(reason: &str, detail: &str) -> Self {
        let mut env = Envelope::new(MessageType::Error);
        env.payload.insert("reason".to_string(), json!(reason));
        if !detail.is_empty() {
            env.payload.insert("detail".to_string(), json!(detail));
        }
        env
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    /// Collects `key` as a list of ids, tolerating single values.
    pub fn id_list(&self, key: &str) -> Vec<u64> {
        match self.payload.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_u64).collect(),
            Some(Value::Number(n)) => n.as_u64().into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    pub fn error_reason(&self) -> Option<&str> {
        self.str_field("reason")
    }
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
