use anyhow::{anyhow, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub type Result<T> = anyhow::Result<T>;

pub const STATE_FILE: &str = "state.db";
pub const TERM_FILE: &str = "term.dat";
pub const VOTED_FOR_FILE: &str = "voted_for.dat";
pub const COMMIT_INDEX_FILE: &str = "commit_index.dat";

/// One replicated operation as it is appended to `state.db`.
///
/// Records are keyed by the operation id assigned by the leader. Replaying
/// the record stream in id order reproduces the full chat state, which is
/// also how followers catch up and how late joiners install a snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Record {
    CreateAccount {
        id: u64,
        username: String,
        verifier: String,
        created_at: u64,
    },
    DeleteAccount {
        id: u64,
        username: String,
    },
    InsertMessage {
        id: u64,
        sender: String,
        recipient: String,
        content: String,
        timestamp: u64,
    },
    DeleteMessages {
        id: u64,
        ids: Vec<u64>,
        requester: String,
    },
    MarkRead {
        id: u64,
        ids: Vec<u64>,
        requester: String,
    },
    MarkDelivered {
        id: u64,
        ids: Vec<u64>,
    },
}

impl Record {
    pub fn id(&self) -> u64 {
        match self {
            Record::CreateAccount { id, .. } => *id,
            Record::DeleteAccount { id, .. } => *id,
            Record::InsertMessage { id, .. } => *id,
            Record::DeleteMessages { id, .. } => *id,
            Record::MarkRead { id, .. } => *id,
            Record::MarkDelivered { id, .. } => *id,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AccountRecord {
    pub username: String,
    pub verifier: String,
    pub created_at: u64,
    /// Operation that created the account; rows above the commit index are
    /// not served to clients.
    pub op_id: u64,
}

/// A message joined with its delivery and read flags.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageRecord {
    pub id: u64,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub timestamp: u64,
    pub delivered: bool,
    pub read: bool,
}

#[derive(Clone, Debug)]
struct MessageRow {
    sender: String,
    recipient: String,
    content: String,
    timestamp: u64,
}

struct Inner {
    dir: PathBuf,
    log: File,

    accounts: BTreeMap<String, AccountRecord>,
    messages: BTreeMap<u64, MessageRow>,
    delivered: HashSet<u64>,
    read: HashSet<u64>,

    // full record log by operation id, kept for idempotence and catch-up
    records: BTreeMap<u64, Record>,
    // largest n with every record 1..=n present
    contiguous: u64,

    current_term: u64,
    voted_for: Option<String>,
    commit_index: u64,
}

/// Durable chat state for one replica.
///
/// All state mutations go through `apply`, which appends one record to
/// `state.db` and fsyncs before returning. Records carry the operation id
/// assigned by the leader; applying an id twice is a no-op, so followers can
/// be re-sent operations freely.
pub struct ChatStore {
    inner: Mutex<Inner>,
}

impl ChatStore {
    /// Opens the store in `dir`, replaying `state.db` and loading the
    /// durable replication metadata. Unparseable state aborts the open.
    pub fn open<T: Into<PathBuf>>(dir: T) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let current_term = read_u64_file(dir.join(TERM_FILE))?.unwrap_or(0);
        let commit_index = read_u64_file(dir.join(COMMIT_INDEX_FILE))?.unwrap_or(0);
        let voted_for = read_string_file(dir.join(VOTED_FOR_FILE))?;

        let path = dir.join(STATE_FILE);
        let log = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut inner = Inner {
            dir,
            log,
            accounts: BTreeMap::new(),
            messages: BTreeMap::new(),
            delivered: HashSet::new(),
            read: HashSet::new(),
            records: BTreeMap::new(),
            contiguous: 0,
            current_term,
            voted_for,
            commit_index,
        };

        let reader = BufReader::new(File::open(&path)?);
        let mut stream = Deserializer::from_reader(reader).into_iter::<Record>();
        while let Some(record) = stream.next() {
            let record = record.context("corrupt record in state.db")?;
            inner.apply(record, false)?;
        }

        Ok(ChatStore {
            inner: Mutex::new(inner),
        })
    }

    /// True when nothing has ever been replicated into this store.
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.records.is_empty() && inner.commit_index == 0
    }

    /// Applies a replicated record, durably. Returns false when the
    /// operation id was already applied.
    pub fn apply(&self, record: Record) -> Result<bool> {
        self.lock().apply(record, true)
    }

    pub fn create_account(
        &self,
        id: u64,
        username: &str,
        verifier: &str,
        created_at: u64,
    ) -> Result<bool> {
        self.apply(Record::CreateAccount {
            id,
            username: username.to_string(),
            verifier: verifier.to_string(),
            created_at,
        })
    }

    pub fn delete_account(&self, id: u64, username: &str) -> Result<bool> {
        self.apply(Record::DeleteAccount {
            id,
            username: username.to_string(),
        })
    }

    pub fn insert_message(
        &self,
        id: u64,
        sender: &str,
        recipient: &str,
        content: &str,
        timestamp: u64,
    ) -> Result<bool> {
        self.apply(Record::InsertMessage {
            id,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            content: content.to_string(),
            timestamp,
        })
    }

    /// Deletes the subset of `ids` that `requester` sent or received and
    /// returns that subset.
    pub fn delete_messages(&self, id: u64, ids: &[u64], requester: &str) -> Result<Vec<u64>> {
        let mut inner = self.lock();
        let deletable = inner.owned_ids(ids, requester);
        inner.apply(
            Record::DeleteMessages {
                id,
                ids: ids.to_vec(),
                requester: requester.to_string(),
            },
            true,
        )?;
        Ok(deletable)
    }

    pub fn mark_read(&self, id: u64, ids: &[u64], requester: &str) -> Result<bool> {
        self.apply(Record::MarkRead {
            id,
            ids: ids.to_vec(),
            requester: requester.to_string(),
        })
    }

    pub fn mark_delivered(&self, id: u64, ids: &[u64]) -> Result<bool> {
        self.apply(Record::MarkDelivered {
            id,
            ids: ids.to_vec(),
        })
    }

    pub fn account_exists(&self, username: &str) -> bool {
        self.lock().accounts.contains_key(username)
    }

    /// The subset of `ids` that `requester` sent or received, against the
    /// current state.
    pub fn deletable_ids(&self, ids: &[u64], requester: &str) -> Vec<u64> {
        self.lock().owned_ids(ids, requester)
    }

    /// None when the account does not exist, otherwise whether the verifier
    /// matches.
    pub fn verify_login(&self, username: &str, verifier: &str) -> Option<bool> {
        let inner = self.lock();
        inner.accounts.get(username).map(|a| a.verifier == verifier)
    }

    /// Lists committed usernames matching a shell-style glob (`*` and `?`).
    /// An empty pattern lists everything.
    pub fn list_accounts(&self, pattern: &str) -> Result<Vec<String>> {
        let re = glob_to_regex(pattern)?;
        let inner = self.lock();
        Ok(inner
            .accounts
            .values()
            .filter(|account| account.op_id <= inner.commit_index && re.is_match(&account.username))
            .map(|account| account.username.clone())
            .collect())
    }

    /// Committed messages between `a` and `b` in either direction,
    /// id-descending, optionally only ids below `before_id`, at most
    /// `limit`. Applied-but-uncommitted messages stay invisible.
    pub fn fetch_conversation(
        &self,
        a: &str,
        b: &str,
        limit: usize,
        before_id: Option<u64>,
    ) -> Vec<MessageRecord> {
        let inner = self.lock();
        inner
            .messages
            .range(..=inner.commit_index)
            .rev()
            .filter(|(id, row)| {
                before_id.map_or(true, |bound| **id < bound)
                    && ((row.sender == a && row.recipient == b)
                        || (row.sender == b && row.recipient == a))
            })
            .take(limit)
            .map(|(id, row)| inner.to_record(*id, row))
            .collect()
    }

    /// Distinct counterparts over all committed messages where `user` is
    /// sender or recipient.
    pub fn list_chat_partners(&self, user: &str) -> Vec<String> {
        let inner = self.lock();
        let mut partners: Vec<String> = inner
            .messages
            .range(..=inner.commit_index)
            .filter_map(|(_, row)| {
                if row.sender == user {
                    Some(row.recipient.clone())
                } else if row.recipient == user {
                    Some(row.sender.clone())
                } else {
                    None
                }
            })
            .collect();
        partners.sort();
        partners.dedup();
        partners
    }

    /// Committed, not-yet-delivered messages addressed to `user`, id-ascending.
    pub fn undelivered_for(&self, user: &str, commit_index: u64) -> Vec<MessageRecord> {
        let inner = self.lock();
        inner
            .messages
            .range(..=commit_index)
            .filter(|(id, row)| row.recipient == user && !inner.delivered.contains(*id))
            .map(|(id, row)| inner.to_record(*id, row))
            .collect()
    }

    /// Messages with ids in `(after, up_to]`, id-ascending. Used when the
    /// commit index advances on a follower.
    pub fn messages_between(&self, after: u64, up_to: u64) -> Vec<MessageRecord> {
        let inner = self.lock();
        inner
            .messages
            .range(after + 1..=up_to)
            .map(|(id, row)| inner.to_record(*id, row))
            .collect()
    }

    pub fn highest_message_id(&self) -> u64 {
        self.lock()
            .messages
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    /// Highest operation id this store has ever applied.
    pub fn highest_record_id(&self) -> u64 {
        self.lock().records.keys().next_back().copied().unwrap_or(0)
    }

    /// Largest n such that every operation 1..=n has been applied. A replica
    /// reports this to the leader so holes left by lost replication traffic
    /// get re-sent.
    pub fn contiguous_record_id(&self) -> u64 {
        self.lock().contiguous
    }

    /// Records with ids in `(after, up_to]`, in id order.
    pub fn records_between(&self, after: u64, up_to: u64) -> Vec<Record> {
        let inner = self.lock();
        inner
            .records
            .range(after + 1..=up_to)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// The full record stream, for a joining replica.
    pub fn snapshot_for_catchup(&self) -> Vec<Record> {
        self.lock().records.values().cloned().collect()
    }

    pub fn current_term(&self) -> u64 {
        self.lock().current_term
    }

    pub fn voted_for(&self) -> Option<String> {
        self.lock().voted_for.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.lock().commit_index
    }

    /// Persists term and vote together, before any vote reply is sent.
    pub fn set_term_and_vote(&self, term: u64, voted_for: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        write_durable(inner.dir.join(TERM_FILE), term.to_string().as_bytes())?;
        write_durable(
            inner.dir.join(VOTED_FOR_FILE),
            voted_for.unwrap_or("").as_bytes(),
        )?;
        inner.current_term = term;
        inner.voted_for = voted_for.map(String::from);
        Ok(())
    }

    pub fn set_commit_index(&self, commit_index: u64) -> Result<()> {
        let mut inner = self.lock();
        if commit_index <= inner.commit_index {
            return Ok(());
        }
        write_durable(
            inner.dir.join(COMMIT_INDEX_FILE),
            commit_index.to_string().as_bytes(),
        )?;
        inner.commit_index = commit_index;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

impl Inner {
    fn apply(&mut self, record: Record, durable: bool) -> Result<bool> {
        let id = record.id();
        if self.records.contains_key(&id) {
            return Ok(false);
        }

        if durable {
            let buf = serde_json::to_vec(&record)?;
            self.log.write_all(&buf)?;
            self.log.sync_data()?;
        }

        match &record {
            Record::CreateAccount {
                username,
                verifier,
                created_at,
                ..
            } => {
                // a duplicate name can only arrive through replay of an op
                // the leader validated against older state; first one wins
                self.accounts
                    .entry(username.clone())
                    .or_insert_with(|| AccountRecord {
                        username: username.clone(),
                        verifier: verifier.clone(),
                        created_at: *created_at,
                        op_id: id,
                    });
            }
            Record::DeleteAccount { username, .. } => {
                self.accounts.remove(username);
                let doomed: Vec<u64> = self
                    .messages
                    .iter()
                    .filter(|(_, row)| row.sender == *username || row.recipient == *username)
                    .map(|(id, _)| *id)
                    .collect();
                for id in doomed {
                    self.messages.remove(&id);
                    self.delivered.remove(&id);
                    self.read.remove(&id);
                }
            }
            Record::InsertMessage {
                id,
                sender,
                recipient,
                content,
                timestamp,
            } => {
                self.messages.insert(
                    *id,
                    MessageRow {
                        sender: sender.clone(),
                        recipient: recipient.clone(),
                        content: content.clone(),
                        timestamp: *timestamp,
                    },
                );
            }
            Record::DeleteMessages {
                ids, requester, ..
            } => {
                for id in self.owned_ids(ids, requester) {
                    self.messages.remove(&id);
                    self.delivered.remove(&id);
                    self.read.remove(&id);
                }
            }
            Record::MarkRead { ids, requester, .. } => {
                // only the recipient may mark a message read; foreign ids
                // are a no-op
                for id in ids {
                    if let Some(row) = self.messages.get(id) {
                        if row.recipient == *requester {
                            self.read.insert(*id);
                        }
                    }
                }
            }
            Record::MarkDelivered { ids, .. } => {
                for id in ids {
                    if self.messages.contains_key(id) {
                        self.delivered.insert(*id);
                    }
                }
            }
        }

        self.records.insert(id, record);
        while self.records.contains_key(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
        Ok(true)
    }

    fn owned_ids(&self, ids: &[u64], requester: &str) -> Vec<u64> {
        ids.iter()
            .copied()
            .filter(|id| {
                self.messages
                    .get(id)
                    .map(|row| row.sender == requester || row.recipient == requester)
                    .unwrap_or(false)
            })
            .collect()
    }

    fn to_record(&self, id: u64, row: &MessageRow) -> MessageRecord {
        MessageRecord {
            id,
            sender: row.sender.clone(),
            recipient: row.recipient.clone(),
            content: row.content.clone(),
            timestamp: row.timestamp,
            delivered: self.delivered.contains(&id),
            read: self.read.contains(&id),
        }
    }
}

/// Translate a shell glob into an anchored regex. Everything except `*` and
/// `?` matches literally.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let pattern = if pattern.is_empty() { "*" } else { pattern };
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| anyhow!("bad pattern: {}", e))
}

fn write_durable<P: AsRef<Path>>(path: P, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

fn read_u64_file(path: PathBuf) -> Result<Option<u64>> {
    match std::fs::read_to_string(&path) {
        Ok(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            let n = s
                .parse::<u64>()
                .with_context(|| format!("corrupt durable state: {}", path.display()))?;
            Ok(Some(n))
        }
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_string_file(path: PathBuf) -> Result<Option<String>> {
    match std::fs::read_to_string(&path) {
        Ok(s) => {
            let s = s.trim().to_string();
            Ok(if s.is_empty() { None } else { Some(s) })
        }
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
