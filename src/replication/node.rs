use crate::broker::Broker;
use crate::config::ClusterConfig;
use crate::replication::peer::{PeerEnvelope, PeerPayload};
use crate::transport::PeerTransport;
use crate::{ChatError, Result};
use futures::future::join_all;
use log::{debug, error, info};
use rand::Rng;
use replichat_store::chatstore::{ChatStore, Record};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// How many missing records a lagging peer is re-sent per heartbeat cycle.
const CATCH_UP_BATCH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct NodeState {
    role: Role,
    leader_hint: Option<String>,
    last_contact: Instant,
    election_timeout: Duration,

    /// Term of the last applied record. Volatile; a restarted node starts
    /// at 0 and looks maximally stale to voters, which only costs it
    /// electability.
    last_log_term: u64,

    /// Leader only: highest gap-free record id each peer has acked.
    match_index: HashMap<String, u64>,
}

/// The replication state machine for one server.
///
/// Role, election, heartbeats and the replicate fan-out all live here;
/// durable term/vote/commit state lives in the store, and everything the
/// cluster says to each other goes through the `PeerTransport` seam.
pub struct ReplicaNode {
    pub config: ClusterConfig,
    pub store: Arc<ChatStore>,
    pub broker: Arc<Broker>,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<NodeState>,

    // serializes the leader commit path so ids are assigned and committed
    // in one total order
    propose: Mutex<()>,
}

impl ReplicaNode {
    pub fn new(
        config: ClusterConfig,
        store: Arc<ChatStore>,
        broker: Arc<Broker>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let election_timeout = random_timeout(config.election_timeout_ms);
        Arc::new(ReplicaNode {
            config,
            store,
            broker,
            transport,
            state: Mutex::new(NodeState {
                role: Role::Follower,
                leader_hint: None,
                last_contact: Instant::now(),
                election_timeout,
                last_log_term: 0,
                match_index: HashMap::new(),
            }),
            propose: Mutex::new(()),
        })
    }

    /// Spawns the election watchdog and the heartbeat loop. A fresh node
    /// first pulls a snapshot from any reachable peer.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.catch_up_from_peers().await;
            node.run_election_timer().await;
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run_heartbeat_loop().await;
        });
    }

    async fn run_election_timer(&self) {
        loop {
            let timeout = { self.state.lock().await.election_timeout };
            sleep(timeout).await;

            let expired = {
                let st = self.state.lock().await;
                st.role != Role::Leader && st.last_contact.elapsed() >= st.election_timeout
            };
            if expired {
                self.start_election().await;
            }
        }
    }

    async fn run_heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            self.broadcast_heartbeat().await;
        }
    }

    pub async fn start_election(&self) {
        let (term, last_log_term, last_log_index) = {
            let mut st = self.state.lock().await;
            let term = self.store.current_term() + 1;
            if let Err(e) = self.store.set_term_and_vote(term, Some(&self.config.self_id())) {
                error!("cannot persist candidacy for term {}: {}", term, e);
                return;
            }
            st.role = Role::Candidate;
            st.leader_hint = None;
            self.arm(&mut st);
            (term, st.last_log_term, self.store.highest_record_id())
        };
        info!("starting election for term {}", term);

        let replies = self
            .broadcast(
                term,
                PeerPayload::VoteRequest {
                    last_log_term,
                    last_log_index,
                },
            )
            .await;

        let mut granted = 1;
        for (peer, reply) in replies {
            match reply {
                Ok(env) => {
                    if env.term > term {
                        self.step_down(env.term).await;
                        return;
                    }
                    if let PeerPayload::VoteResponse { vote_granted: true } = env.payload {
                        debug!("vote granted by {}", peer);
                        granted += 1;
                    }
                }
                Err(e) => debug!("no vote from {}: {}", peer, e),
            }
        }

        if granted >= self.config.majority() {
            self.become_leader(term).await;
        } else {
            let mut st = self.state.lock().await;
            if st.role == Role::Candidate {
                debug!("election for term {} failed: {} votes", term, granted);
                st.role = Role::Follower;
            }
        }
    }

    async fn become_leader(&self, term: u64) {
        {
            let mut st = self.state.lock().await;
            // a newer term may have swept through while votes were in flight
            if st.role != Role::Candidate || self.store.current_term() != term {
                return;
            }
            st.role = Role::Leader;
            st.leader_hint = Some(self.config.self_id());
            st.match_index = self
                .config
                .replicas
                .iter()
                .map(|p| (p.clone(), 0))
                .collect();
        }
        info!("became leader for term {}", term);
        self.broadcast_heartbeat().await;
    }

    /// Adopts `term` if it is newer and drops to follower.
    pub async fn step_down(&self, term: u64) {
        let mut st = self.state.lock().await;
        if term > self.store.current_term() {
            if let Err(e) = self.store.set_term_and_vote(term, None) {
                error!("cannot persist term {}: {}", term, e);
            }
        }
        if st.role != Role::Follower {
            info!("stepping down to follower at term {}", term);
        }
        st.role = Role::Follower;
        st.leader_hint = None;
        self.arm(&mut st);
    }

    /// Leader commit path: assign the next operation id, apply durably,
    /// fan out to peers and advance the commit index on strict majority.
    ///
    /// Serialized by the propose lock, so concurrent client writes get
    /// strictly increasing ids and commit in id order.
    pub async fn replicate<F>(&self, build: F) -> Result<Record>
    where
        F: FnOnce(u64) -> Record + Send,
    {
        let _guard = self.propose.lock().await;

        let term = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return Err(ChatError::NotLeader {
                    leader_hint: st.leader_hint.clone(),
                });
            }
            self.store.current_term()
        };

        let id = self.store.commit_index().max(self.store.highest_record_id()) + 1;
        let record = build(id);

        if let Err(e) = self.store.apply(record.clone()) {
            error!("durable apply of op {} failed, stepping down: {}", id, e);
            self.step_down(term).await;
            return Err(ChatError::Transient("durable write failed on leader".into()));
        }
        self.state.lock().await.last_log_term = term;

        debug!("replicating op {} at term {}", id, term);
        let replies = self
            .broadcast(
                term,
                PeerPayload::Replicate {
                    record: record.clone(),
                },
            )
            .await;

        let mut acks = 1;
        let mut progress = Vec::new();
        for (peer, reply) in replies {
            match reply {
                Ok(env) => {
                    if env.term > term {
                        self.step_down(env.term).await;
                        return Err(ChatError::Transient(format!(
                            "superseded by term {}",
                            env.term
                        )));
                    }
                    if let PeerPayload::ReplicationResponse {
                        success: true,
                        applied,
                    } = env.payload
                    {
                        acks += 1;
                        progress.push((peer, applied));
                    }
                }
                Err(e) => debug!("replicate op {} to {} failed: {}", id, peer, e),
            }
        }

        if acks < self.config.majority() {
            // peers that did apply keep the record; heartbeat reconciliation
            // will finish the job if a majority comes back
            return Err(ChatError::Transient(format!(
                "op {} reached {} of {} nodes",
                id,
                acks,
                self.config.cluster_size()
            )));
        }

        let prev = self.store.commit_index();
        self.store.set_commit_index(id).map_err(ChatError::Any)?;
        {
            let mut st = self.state.lock().await;
            for (peer, applied) in progress {
                let entry = st.match_index.entry(peer).or_insert(0);
                *entry = (*entry).max(applied);
            }
        }
        self.publish_committed(prev, id);
        Ok(record)
    }

    /// Leader beacon: suppresses elections, advances follower commit, and
    /// drives catch-up for lagging peers.
    pub async fn broadcast_heartbeat(&self) {
        let (term, commit) = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return;
            }
            (self.store.current_term(), self.store.commit_index())
        };
        let level = self.config.heartbeat_log_level;
        log::log!(level, "heartbeat: term {} commit {}", term, commit);

        let replies = self
            .broadcast(term, PeerPayload::Heartbeat { commit_index: commit })
            .await;
        for (peer, reply) in replies {
            match reply {
                Ok(env) => {
                    if env.term > term {
                        self.step_down(env.term).await;
                        return;
                    }
                    if let PeerPayload::ReplicationResponse { applied, .. } = env.payload {
                        self.update_peer_progress(&peer, applied, term, commit).await;
                    }
                }
                Err(e) => log::log!(level, "no heartbeat ack from {}: {}", peer, e),
            }
        }
    }

    async fn update_peer_progress(&self, peer: &str, applied: u64, term: u64, commit: u64) {
        {
            let mut st = self.state.lock().await;
            if st.role != Role::Leader {
                return;
            }
            let entry = st.match_index.entry(peer.to_string()).or_insert(0);
            *entry = (*entry).max(applied);
        }
        if applied >= commit {
            return;
        }

        debug!("peer {} is at {}, commit is {}; re-sending", peer, applied, commit);
        let records = self.store.records_between(applied, commit);
        for record in records.into_iter().take(CATCH_UP_BATCH) {
            let env = PeerEnvelope::new(
                term,
                &self.config.self_id(),
                PeerPayload::Replicate { record },
            );
            match self.transport.send(peer, env).await {
                Ok(resp) => {
                    if resp.term > term {
                        self.step_down(resp.term).await;
                        return;
                    }
                    if !matches!(
                        resp.payload,
                        PeerPayload::ReplicationResponse { success: true, .. }
                    ) {
                        break;
                    }
                }
                Err(e) => {
                    debug!("catch-up to {} interrupted: {}", peer, e);
                    break;
                }
            }
        }
    }

    /// Vote rule: newer-or-equal term, at most one vote per term, and the
    /// candidate's log must be at least as up to date as ours. The vote is
    /// persisted before the reply leaves.
    pub async fn handle_vote_request(
        &self,
        candidate: &str,
        term: u64,
        last_log_term: u64,
        last_log_index: u64,
    ) -> PeerEnvelope {
        let mut st = self.state.lock().await;
        let mut current = self.store.current_term();
        if term < current {
            return self.reply(current, PeerPayload::VoteResponse { vote_granted: false });
        }
        if term > current {
            if self.store.set_term_and_vote(term, None).is_err() {
                return self.reply(current, PeerPayload::VoteResponse { vote_granted: false });
            }
            st.role = Role::Follower;
            st.leader_hint = None;
            current = term;
        }

        let my_last_index = self.store.highest_record_id();
        let up_to_date = last_log_term > st.last_log_term
            || (last_log_term == st.last_log_term && last_log_index >= my_last_index);
        let prior = self.store.voted_for();
        let grant = up_to_date && (prior.is_none() || prior.as_deref() == Some(candidate));

        if grant {
            if self.store.set_term_and_vote(current, Some(candidate)).is_err() {
                return self.reply(current, PeerPayload::VoteResponse { vote_granted: false });
            }
            self.arm(&mut st);
            debug!("granted vote to {} for term {}", candidate, current);
        }
        self.reply(current, PeerPayload::VoteResponse { vote_granted: grant })
    }

    pub async fn handle_heartbeat(
        &self,
        leader: &str,
        term: u64,
        leader_commit: u64,
    ) -> PeerEnvelope {
        let mut st = self.state.lock().await;
        let current = self.store.current_term();
        if term < current {
            return self.reply(
                current,
                PeerPayload::ReplicationResponse {
                    success: false,
                    applied: self.store.contiguous_record_id(),
                },
            );
        }
        if term > current {
            let _ = self.store.set_term_and_vote(term, None);
        }
        if st.role != Role::Follower {
            info!("observed leader {} at term {}, stepping down", leader, term);
            st.role = Role::Follower;
        }
        st.leader_hint = Some(leader.to_string());
        self.arm(&mut st);
        drop(st);

        let applied = self.store.contiguous_record_id();
        let prev = self.store.commit_index();
        let new_commit = leader_commit.min(applied);
        if new_commit > prev {
            match self.store.set_commit_index(new_commit) {
                Ok(()) => self.publish_committed(prev, new_commit),
                Err(e) => error!("cannot persist commit index {}: {}", new_commit, e),
            }
        }

        self.reply(
            term,
            PeerPayload::ReplicationResponse {
                success: true,
                applied,
            },
        )
    }

    pub async fn handle_replicate(&self, leader: &str, term: u64, record: Record) -> PeerEnvelope {
        let mut st = self.state.lock().await;
        let current = self.store.current_term();
        if term < current {
            return self.reply(
                current,
                PeerPayload::ReplicationResponse {
                    success: false,
                    applied: self.store.contiguous_record_id(),
                },
            );
        }
        if term > current {
            let _ = self.store.set_term_and_vote(term, None);
        }
        st.role = Role::Follower;
        st.leader_hint = Some(leader.to_string());
        self.arm(&mut st);

        let id = record.id();
        let success = match self.store.apply(record) {
            Ok(fresh) => {
                if fresh {
                    debug!("applied op {} from {}", id, leader);
                }
                st.last_log_term = term;
                true
            }
            Err(e) => {
                error!("apply of op {} failed: {}", id, e);
                false
            }
        };

        self.reply(
            term,
            PeerPayload::ReplicationResponse {
                success,
                applied: self.store.contiguous_record_id(),
            },
        )
    }

    /// A replica pushed `ids` to a subscriber and wants the delivery flags
    /// replicated. Leader only.
    pub async fn handle_mark_delivered(&self, term: u64, ids: Vec<u64>) -> PeerEnvelope {
        let current = self.store.current_term();
        if term > current {
            self.step_down(term).await;
        }
        if !self.is_leader().await {
            return self.reply(
                self.store.current_term(),
                PeerPayload::ReplicationResponse {
                    success: false,
                    applied: 0,
                },
            );
        }
        let result = self.replicate(|id| Record::MarkDelivered { id, ids }).await;
        let current = self.store.current_term();
        match result {
            Ok(record) => self.reply(
                current,
                PeerPayload::ReplicationResponse {
                    success: true,
                    applied: record.id(),
                },
            ),
            Err(e) => {
                debug!("mark-delivered replication failed: {}", e);
                self.reply(
                    current,
                    PeerPayload::ReplicationResponse {
                        success: false,
                        applied: 0,
                    },
                )
            }
        }
    }

    pub async fn handle_snapshot_request(&self) -> PeerEnvelope {
        self.reply(
            self.store.current_term(),
            PeerPayload::SnapshotResponse {
                commit_index: self.store.commit_index(),
                records: self.store.snapshot_for_catchup(),
            },
        )
    }

    /// Pulls the full record stream from the first reachable peer. Only a
    /// node with a completely empty store bothers.
    pub async fn catch_up_from_peers(&self) {
        if !self.store.is_empty() || self.config.replicas.is_empty() {
            return;
        }
        for peer in &self.config.replicas {
            let env = PeerEnvelope::new(
                self.store.current_term(),
                &self.config.self_id(),
                PeerPayload::SnapshotRequest,
            );
            match self.transport.send(peer, env).await {
                Ok(resp) => {
                    if let PeerPayload::SnapshotResponse {
                        commit_index,
                        records,
                    } = resp.payload
                    {
                        info!("installing snapshot from {}: {} records", peer, records.len());
                        for record in records {
                            if let Err(e) = self.store.apply(record) {
                                error!("snapshot apply failed: {}", e);
                                return;
                            }
                        }
                        let _ = self
                            .store
                            .set_commit_index(commit_index.min(self.store.contiguous_record_id()));
                        self.state.lock().await.last_log_term = resp.term;
                        return;
                    }
                }
                Err(e) => debug!("snapshot from {} unavailable: {}", peer, e),
            }
        }
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == Role::Leader
    }

    pub async fn leader_hint(&self) -> Option<String> {
        self.state.lock().await.leader_hint.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.store.current_term()
    }

    /// Self plus the configured peers.
    pub fn cluster_nodes(&self) -> Vec<String> {
        let mut nodes = vec![self.config.self_id()];
        nodes.extend(self.config.replicas.iter().cloned());
        nodes
    }

    fn publish_committed(&self, after: u64, up_to: u64) {
        for message in self.store.messages_between(after, up_to) {
            self.broker.publish(&message);
        }
    }

    async fn broadcast(
        &self,
        term: u64,
        payload: PeerPayload,
    ) -> Vec<(String, Result<PeerEnvelope>)> {
        let env = PeerEnvelope::new(term, &self.config.self_id(), payload);
        let sends = self.config.replicas.iter().map(|peer| {
            let env = env.clone();
            let transport = Arc::clone(&self.transport);
            let peer = peer.clone();
            async move {
                let reply = transport.send(&peer, env).await;
                (peer, reply)
            }
        });
        join_all(sends).await
    }

    fn reply(&self, term: u64, payload: PeerPayload) -> PeerEnvelope {
        PeerEnvelope::new(term, &self.config.self_id(), payload)
    }

    fn arm(&self, st: &mut NodeState) {
        st.last_contact = Instant::now();
        st.election_timeout = random_timeout(self.config.election_timeout_ms);
    }
}

/// Generate a random election timeout between the configured bounds
fn random_timeout((min, max): (u64, u64)) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min, max + 1))
}
