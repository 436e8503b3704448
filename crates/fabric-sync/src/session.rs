// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The per-session sync state machine.
//!
//! `HELLO_SENT → HELLO_RECEIVED → HEADS_EXCHANGED → SYNCING → COMPLETE |
//! ERROR`, driven entirely by received packets plus a watchdog tick. The
//! machine owns no I/O: callers feed it packets and ship whatever it
//! returns, over any transport that can carry `max_packet_bytes` datagrams.
//!
//! Receive-side validation re-applies every delta through the kernel, so a
//! peer can never push state that skips the hash chain or the schemas. A
//! delta that forks from an earlier head is not an error — it opens a
//! conflict, which resolves deterministically (see [`crate::conflict`]) and
//! ships the resolution delta back to the peer.

use crate::chunk::{chunk_delta, needs_chunking, ChunkBuffer, DEFAULT_CHUNK_EXPIRY_MS};
use crate::conflict::{resolve, Branch, ConflictStatus, EntityConflict, ResolverRegistry};
use crate::diff::{build_wants, deltas_since, diff_heads, local_heads};
use crate::error::SyncError;
use crate::packet::{
    Capabilities, Head, Packet, PacketBody, RejectReason, WantEntry, DEFAULT_MAX_PACKET_BYTES,
};
use crate::priority::order_pending;
use crate::watermark::WatermarkStore;
use fabric_canonical::StateHash;
use fabric_kernel::{apply_delta, materialize_from_genesis, Delta};
use fabric_store::{EntityRecord, Store};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Default overall session deadline.
pub const DEFAULT_SESSION_DEADLINE_MS: u64 = 60_000;

/// Session tuning.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SessionConfig {
    /// Capabilities advertised in our HELLO.
    pub capabilities: Capabilities,
    /// Overall deadline; expiry transitions to ERROR (ACKed deltas stay
    /// durable).
    pub session_deadline_ms: u64,
    /// Chunk reassembly expiry window.
    pub chunk_expiry_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            capabilities: Capabilities::default(),
            session_deadline_ms: DEFAULT_SESSION_DEADLINE_MS,
            chunk_expiry_ms: DEFAULT_CHUNK_EXPIRY_MS,
        }
    }
}

/// Session lifecycle states.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    /// Responder created, no packet seen yet.
    Idle,
    /// Initiator sent HELLO, awaiting the peer's.
    HelloSent,
    /// Both HELLOs seen.
    HelloReceived,
    /// Heads exchanged; wants computed.
    HeadsExchanged,
    /// Deltas in flight.
    Syncing,
    /// Converged; nothing left to request or ship.
    Complete,
    /// Watchdog expiry or fatal refusal. ACKed deltas remain durable.
    Error,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::HelloSent => "HELLO_SENT",
            SessionState::HelloReceived => "HELLO_RECEIVED",
            SessionState::HeadsExchanged => "HEADS_EXCHANGED",
            SessionState::Syncing => "SYNCING",
            SessionState::Complete => "COMPLETE",
            SessionState::Error => "ERROR",
        }
    }
}

/// One sync conversation with one peer.
pub struct SyncSession {
    /// Peer node id.
    pub peer_id: String,
    /// Current state.
    pub state: SessionState,
    started_at_ms: u64,
    last_transition_ms: u64,
    initiated: bool,
    peer_capabilities: Option<Capabilities>,
    chunks: ChunkBuffer,
    /// Deltas we shipped, by id, with the head each one produces.
    sent_index: BTreeMap<String, Head>,
    /// Entities we asked for and have not yet received.
    outstanding_wants: BTreeSet<String>,
}

impl SyncSession {
    fn new(peer_id: &str, initiated: bool, now_ms: u64, chunk_expiry_ms: u64) -> Self {
        SyncSession {
            peer_id: peer_id.to_string(),
            state: if initiated {
                SessionState::HelloSent
            } else {
                SessionState::Idle
            },
            started_at_ms: now_ms,
            last_transition_ms: now_ms,
            initiated,
            peer_capabilities: None,
            chunks: ChunkBuffer::new(chunk_expiry_ms),
            sent_index: BTreeMap::new(),
            outstanding_wants: BTreeSet::new(),
        }
    }

    /// The peer's advertised capabilities, once its HELLO arrived.
    #[must_use]
    pub fn peer_capabilities(&self) -> Option<&Capabilities> {
        self.peer_capabilities.as_ref()
    }

    /// Datagram budget for packets to this peer.
    #[must_use]
    pub fn packet_budget(&self) -> usize {
        self.peer_capabilities
            .map_or(DEFAULT_MAX_PACKET_BYTES, |c| c.max_packet_bytes)
    }

    fn transition(&mut self, state: SessionState, now_ms: u64) {
        debug!(peer = %self.peer_id, from = self.state.name(), to = state.name(), "session transition");
        self.state = state;
        self.last_transition_ms = now_ms;
    }
}

/// What a delta batch did on the receive side.
#[derive(Default)]
pub struct ReceiveOutcome {
    /// Delta ids durably applied (or already held).
    pub acked: Vec<String>,
    /// Heads the peer evidently holds (it authored or relayed them).
    pub peer_heads: Vec<Head>,
    /// Refusals to send back.
    pub rejects: Vec<(RejectReason, Option<String>, String)>,
    /// Resolution deltas minted while consuming the batch; ship them back.
    pub resolutions: Vec<Delta>,
    /// Entities that must be re-requested from genesis.
    pub genesis_wants: Vec<String>,
}

/// A node's sync identity: one endpoint serves many sessions.
pub struct SyncEndpoint {
    node_id: String,
    config: SessionConfig,
    resolvers: ResolverRegistry,
}

impl SyncEndpoint {
    /// Creates an endpoint with default resolvers.
    #[must_use]
    pub fn new(node_id: impl Into<String>, config: SessionConfig) -> Self {
        SyncEndpoint {
            node_id: node_id.into(),
            config,
            resolvers: ResolverRegistry::new(),
        }
    }

    /// Creates an endpoint with a custom resolver registry.
    #[must_use]
    pub fn with_resolvers(
        node_id: impl Into<String>,
        config: SessionConfig,
        resolvers: ResolverRegistry,
    ) -> Self {
        SyncEndpoint {
            node_id: node_id.into(),
            config,
            resolvers,
        }
    }

    /// This endpoint's node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Opens a session as initiator; ship the returned HELLO.
    #[must_use]
    pub fn begin(&self, peer_id: &str, now_ms: u64) -> (SyncSession, Packet) {
        let session = SyncSession::new(peer_id, true, now_ms, self.config.chunk_expiry_ms);
        let hello = Packet::new(
            &self.node_id,
            PacketBody::Hello {
                capabilities: self.config.capabilities,
            },
        );
        (session, hello)
    }

    /// Opens a session as responder; feed it the initiator's packets.
    #[must_use]
    pub fn accept(&self, peer_id: &str, now_ms: u64) -> SyncSession {
        SyncSession::new(peer_id, false, now_ms, self.config.chunk_expiry_ms)
    }

    /// Watchdog: expires the session (and stale chunk buffers). Call
    /// periodically; expiry transitions to ERROR with partial progress
    /// preserved.
    pub fn tick(&self, session: &mut SyncSession, now_ms: u64) {
        session.chunks.expire(now_ms);
        let stalled = now_ms.saturating_sub(session.last_transition_ms);
        let lifetime = now_ms.saturating_sub(session.started_at_ms);
        if matches!(
            session.state,
            SessionState::Complete | SessionState::Error
        ) {
            return;
        }
        if lifetime > self.config.session_deadline_ms || stalled > self.config.session_deadline_ms {
            warn!(peer = %session.peer_id, "session deadline expired");
            session.transition(SessionState::Error, now_ms);
        }
    }

    /// Feeds one received packet through the state machine, returning the
    /// packets to ship back.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnexpectedPacket`] for packets the current state
    /// cannot accept and store/kernel errors for local failures. Peer-caused
    /// problems travel back as REJECT packets, not errors.
    pub fn handle_packet(
        &self,
        session: &mut SyncSession,
        store: &mut dyn Store,
        watermarks: &mut WatermarkStore,
        packet: &Packet,
        now_ms: u64,
    ) -> Result<Vec<Packet>, SyncError> {
        match &packet.body {
            PacketBody::Hello { capabilities } => {
                self.on_hello(session, store, watermarks, *capabilities, now_ms)
            }
            PacketBody::Heads { heads } => self.on_heads(session, store, heads, now_ms),
            PacketBody::Want { wants } => self.on_want(session, store, wants, now_ms),
            PacketBody::Deltas { deltas } => {
                self.on_deltas(session, store, watermarks, deltas, now_ms)
            }
            PacketBody::DeltasChunk {
                delta_id,
                chunk_index,
                chunk_total,
                chunk_payload,
            } => {
                let done = session.chunks.accept(
                    delta_id,
                    *chunk_index,
                    *chunk_total,
                    chunk_payload,
                    now_ms,
                )?;
                match done {
                    Some(delta) => {
                        self.on_deltas(session, store, watermarks, &[delta], now_ms)
                    }
                    None => Ok(Vec::new()),
                }
            }
            PacketBody::Ack { delta_ids } => {
                self.on_ack(session, watermarks, delta_ids, now_ms)
            }
            PacketBody::Reject {
                reason,
                entity_id,
                detail,
            } => self.on_reject(session, *reason, entity_id.as_deref(), detail.as_deref(), now_ms),
        }
    }

    fn on_hello(
        &self,
        session: &mut SyncSession,
        store: &mut dyn Store,
        watermarks: &mut WatermarkStore,
        capabilities: Capabilities,
        now_ms: u64,
    ) -> Result<Vec<Packet>, SyncError> {
        session.peer_capabilities = Some(capabilities);
        let mut out = Vec::new();
        match session.state {
            SessionState::HelloSent => {
                session.transition(SessionState::HelloReceived, now_ms);
            }
            SessionState::Idle => {
                // Responder: answer with our own HELLO before heads.
                out.push(Packet::new(
                    &self.node_id,
                    PacketBody::Hello {
                        capabilities: self.config.capabilities,
                    },
                ));
                session.transition(SessionState::HelloReceived, now_ms);
            }
            state => {
                return Err(SyncError::UnexpectedPacket {
                    got: "HELLO",
                    state: state.name(),
                })
            }
        }
        // Watermark-filtered heads: only tips the peer has not acked.
        let heads = local_heads(store)?;
        let filtered = watermarks.changed_heads(&session.peer_id, &heads);
        debug!(peer = %session.peer_id, total = heads.len(), sent = filtered.len(), "sending heads");
        out.push(Packet::new(
            &self.node_id,
            PacketBody::Heads { heads: filtered },
        ));
        Ok(out)
    }

    fn on_heads(
        &self,
        session: &mut SyncSession,
        store: &mut dyn Store,
        remote: &[Head],
        now_ms: u64,
    ) -> Result<Vec<Packet>, SyncError> {
        match session.state {
            SessionState::HelloReceived | SessionState::HeadsExchanged => {}
            state => {
                return Err(SyncError::UnexpectedPacket {
                    got: "HEADS",
                    state: state.name(),
                })
            }
        }
        session.transition(SessionState::HeadsExchanged, now_ms);
        let local = local_heads(store)?;
        let diff = diff_heads(&local, remote);
        let wants = build_wants(&diff, &local);
        if wants.is_empty() {
            // Nothing to request. The peer may still want from us, so only
            // the initiator (who has now seen both head sets) can conclude.
            if session.initiated {
                session.transition(SessionState::Complete, now_ms);
                return Ok(vec![Packet::new(
                    &self.node_id,
                    PacketBody::Ack {
                        delta_ids: Vec::new(),
                    },
                )]);
            }
            return Ok(Vec::new());
        }
        for want in &wants {
            session.outstanding_wants.insert(want.entity_id.clone());
        }
        session.transition(SessionState::Syncing, now_ms);
        Ok(vec![Packet::new(
            &self.node_id,
            PacketBody::Want { wants },
        )])
    }

    fn on_want(
        &self,
        session: &mut SyncSession,
        store: &mut dyn Store,
        wants: &[WantEntry],
        now_ms: u64,
    ) -> Result<Vec<Packet>, SyncError> {
        match session.state {
            // A completed requester can still serve the peer's wants.
            SessionState::HelloReceived
            | SessionState::HeadsExchanged
            | SessionState::Syncing
            | SessionState::Complete => {}
            state => {
                return Err(SyncError::UnexpectedPacket {
                    got: "WANT",
                    state: state.name(),
                })
            }
        }
        session.transition(SessionState::Syncing, now_ms);
        let mut pending = Vec::new();
        for want in wants {
            pending.extend(deltas_since(store, &want.entity_id, want.since_hash)?);
        }
        order_pending(&mut pending);
        for delta in &pending {
            session.sent_index.insert(
                delta.delta_id.clone(),
                Head {
                    entity_id: delta.entity_id.clone(),
                    version: delta.version,
                    state_hash: delta.new_hash,
                },
            );
        }
        self.package_deltas(session, pending)
    }

    /// Packs deltas into budget-sized DELTAS packets, chunking oversized
    /// ones.
    fn package_deltas(
        &self,
        session: &SyncSession,
        pending: Vec<Delta>,
    ) -> Result<Vec<Packet>, SyncError> {
        let budget = session.packet_budget();
        let mut out = Vec::new();
        let mut batch: Vec<Delta> = Vec::new();
        for delta in pending {
            if needs_chunking(&self.node_id, &delta, budget)? {
                if !batch.is_empty() {
                    out.push(Packet::new(
                        &self.node_id,
                        PacketBody::Deltas {
                            deltas: std::mem::take(&mut batch),
                        },
                    ));
                }
                out.extend(chunk_delta(&self.node_id, &delta, budget)?);
                continue;
            }
            batch.push(delta);
            let probe = Packet::new(
                &self.node_id,
                PacketBody::Deltas {
                    deltas: batch.clone(),
                },
            );
            if probe.canonical_size()? > budget && batch.len() > 1 {
                let overflow = batch.pop().map_or_else(Vec::new, |d| vec![d]);
                out.push(Packet::new(
                    &self.node_id,
                    PacketBody::Deltas {
                        deltas: std::mem::take(&mut batch),
                    },
                ));
                batch = overflow;
            }
        }
        if !batch.is_empty() {
            out.push(Packet::new(
                &self.node_id,
                PacketBody::Deltas { deltas: batch },
            ));
        }
        Ok(out)
    }

    fn on_deltas(
        &self,
        session: &mut SyncSession,
        store: &mut dyn Store,
        watermarks: &mut WatermarkStore,
        deltas: &[Delta],
        now_ms: u64,
    ) -> Result<Vec<Packet>, SyncError> {
        session.transition(SessionState::Syncing, now_ms);
        let outcome = self.receive_deltas(store, deltas)?;

        // The peer holds whatever it just sent us.
        watermarks.record_acked(&session.peer_id, &outcome.peer_heads, now_ms)?;

        for delta in deltas {
            session.outstanding_wants.remove(&delta.entity_id);
        }

        let mut out = Vec::new();
        if !outcome.acked.is_empty() || outcome.rejects.is_empty() {
            out.push(Packet::new(
                &self.node_id,
                PacketBody::Ack {
                    delta_ids: outcome.acked,
                },
            ));
        }
        for (reason, entity_id, detail) in outcome.rejects {
            out.push(Packet::new(
                &self.node_id,
                PacketBody::Reject {
                    reason,
                    entity_id,
                    detail: Some(detail),
                },
            ));
        }
        if !outcome.genesis_wants.is_empty() {
            let wants = outcome
                .genesis_wants
                .into_iter()
                .map(|entity_id| {
                    session.outstanding_wants.insert(entity_id.clone());
                    WantEntry {
                        entity_id,
                        since_hash: StateHash::ZERO,
                    }
                })
                .collect();
            out.push(Packet::new(&self.node_id, PacketBody::Want { wants }));
        }
        if !outcome.resolutions.is_empty() {
            out.extend(self.package_deltas(session, outcome.resolutions)?);
        }
        if session.outstanding_wants.is_empty() && session.sent_index.is_empty() {
            session.transition(SessionState::Complete, now_ms);
        }
        Ok(out)
    }

    fn on_ack(
        &self,
        session: &mut SyncSession,
        watermarks: &mut WatermarkStore,
        delta_ids: &[String],
        now_ms: u64,
    ) -> Result<Vec<Packet>, SyncError> {
        let mut acked_heads = Vec::new();
        for id in delta_ids {
            if let Some(head) = session.sent_index.remove(id) {
                acked_heads.push(head);
            }
        }
        if !acked_heads.is_empty() || delta_ids.is_empty() {
            watermarks.record_acked(&session.peer_id, &acked_heads, now_ms)?;
        }
        if session.sent_index.is_empty() && session.outstanding_wants.is_empty() {
            info!(peer = %session.peer_id, "sync complete");
            session.transition(SessionState::Complete, now_ms);
        }
        Ok(Vec::new())
    }

    fn on_reject(
        &self,
        session: &mut SyncSession,
        reason: RejectReason,
        entity_id: Option<&str>,
        detail: Option<&str>,
        now_ms: u64,
    ) -> Result<Vec<Packet>, SyncError> {
        warn!(peer = %session.peer_id, ?reason, detail, "peer rejected");
        match reason {
            RejectReason::HashChainBroken | RejectReason::EntityUnknown => {
                // Recover by re-requesting the entity from genesis.
                if let Some(entity_id) = entity_id {
                    session.outstanding_wants.insert(entity_id.to_string());
                    session.transition(SessionState::Syncing, now_ms);
                    return Ok(vec![Packet::new(
                        &self.node_id,
                        PacketBody::Want {
                            wants: vec![WantEntry {
                                entity_id: entity_id.to_string(),
                                since_hash: StateHash::ZERO,
                            }],
                        },
                    )]);
                }
                Ok(Vec::new())
            }
            RejectReason::SchemaInvalid => Ok(Vec::new()),
            RejectReason::RateLimited | RejectReason::Unauthorized => {
                session.transition(SessionState::Error, now_ms);
                Ok(Vec::new())
            }
        }
    }

    /// Validates and applies a batch of peer deltas.
    ///
    /// Per entity, in order: a delta extending the current head applies
    /// normally; a known delta re-ACKs idempotently; a delta forking from an
    /// earlier head opens a conflict that resolves deterministically; and a
    /// delta linking to nothing is rejected with `HASH_CHAIN_BROKEN`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] only for local store failures; peer-caused
    /// problems land in the outcome's rejects.
    pub fn receive_deltas(
        &self,
        store: &mut dyn Store,
        deltas: &[Delta],
    ) -> Result<ReceiveOutcome, SyncError> {
        let mut outcome = ReceiveOutcome::default();
        let mut groups: BTreeMap<&str, Vec<&Delta>> = BTreeMap::new();
        let mut order: Vec<&str> = Vec::new();
        for delta in deltas {
            if !groups.contains_key(delta.entity_id.as_str()) {
                order.push(&delta.entity_id);
            }
            groups.entry(&delta.entity_id).or_default().push(delta);
        }

        for entity_id in order {
            let Some(group) = groups.remove(entity_id) else { continue };
            self.receive_entity_group(store, entity_id, &group, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn receive_entity_group(
        &self,
        store: &mut dyn Store,
        entity_id: &str,
        group: &[&Delta],
        outcome: &mut ReceiveOutcome,
    ) -> Result<(), SyncError> {
        let known_ids: BTreeSet<String> = store
            .load_deltas_for_entity(entity_id)?
            .into_iter()
            .map(|d| d.delta_id)
            .collect();

        let mut idx = 0usize;
        while idx < group.len() {
            let delta = group[idx];
            if known_ids.contains(&delta.delta_id) {
                // Idempotent re-delivery.
                outcome.acked.push(delta.delta_id.clone());
                outcome.peer_heads.push(head_of(delta));
                idx += 1;
                continue;
            }
            let current = store.load_entity(entity_id)?;
            match current {
                None => {
                    if delta.is_genesis() {
                        match materialize_from_genesis(delta) {
                            Ok((entity, state)) => {
                                persist(store, delta, &entity, &state)?;
                                outcome.acked.push(delta.delta_id.clone());
                                outcome.peer_heads.push(head_of(delta));
                            }
                            Err(e) => {
                                outcome.rejects.push((
                                    SyncError::from(e.clone()).reject_reason(),
                                    Some(entity_id.to_string()),
                                    e.to_string(),
                                ));
                                return Ok(());
                            }
                        }
                    } else {
                        outcome.rejects.push((
                            RejectReason::EntityUnknown,
                            Some(entity_id.to_string()),
                            format!("no local entity for delta {}", delta.delta_id),
                        ));
                        outcome.genesis_wants.push(entity_id.to_string());
                        return Ok(());
                    }
                }
                Some(record) => {
                    if delta.prev_hash == record.entity.state_hash {
                        match apply_delta(&record.entity, &record.state, delta) {
                            Ok((entity, state)) => {
                                persist(store, delta, &entity, &state)?;
                                outcome.acked.push(delta.delta_id.clone());
                                outcome.peer_heads.push(head_of(delta));
                            }
                            Err(e) => {
                                outcome.rejects.push((
                                    SyncError::from(e.clone()).reject_reason(),
                                    Some(entity_id.to_string()),
                                    e.to_string(),
                                ));
                                return Ok(());
                            }
                        }
                    } else if let Some(base) =
                        record_at_hash(store, entity_id, delta.prev_hash)?
                    {
                        // Fork from an earlier head: the rest of the group is
                        // the remote branch.
                        let remote_branch: Vec<Delta> =
                            group[idx..].iter().map(|d| (*d).clone()).collect();
                        self.resolve_fork(store, entity_id, &base, remote_branch, outcome)?;
                        return Ok(());
                    } else {
                        outcome.rejects.push((
                            RejectReason::HashChainBroken,
                            Some(entity_id.to_string()),
                            format!(
                                "delta {} links to {} which is not a known head",
                                delta.delta_id, delta.prev_hash
                            ),
                        ));
                        // Recover by re-baselining from the peer's genesis.
                        outcome.genesis_wants.push(entity_id.to_string());
                        return Ok(());
                    }
                }
            }
            idx += 1;
        }
        Ok(())
    }

    fn resolve_fork(
        &self,
        store: &mut dyn Store,
        entity_id: &str,
        base: &EntityRecord,
        remote_branch: Vec<Delta>,
        outcome: &mut ReceiveOutcome,
    ) -> Result<(), SyncError> {
        // Local branch: our chain from the base to our tip.
        let local_branch = deltas_since(store, entity_id, base.entity.state_hash)?;
        let conflict = EntityConflict {
            entity_id: entity_id.to_string(),
            base_hash: base.entity.state_hash,
            branch_a: Branch::new(local_branch),
            branch_b: Branch::new(remote_branch.clone()),
            status: ConflictStatus::Detected,
        };
        info!(
            entity_id,
            base = %conflict.base_hash,
            "fork detected; resolving"
        );
        let resolution = resolve(&conflict, &self.resolvers, &base.entity, &base.state)?;

        // The remote branch joins our log either way (replay is
        // branch-aware); the resolution then extends the winner.
        let mut entity = base.entity.clone();
        let mut state = base.state.clone();
        let winner_deltas = if resolution.winner_is_a {
            &conflict.branch_a.deltas
        } else {
            &conflict.branch_b.deltas
        };
        for delta in winner_deltas {
            let (next_entity, next_state) = apply_delta(&entity, &state, delta)?;
            entity = next_entity;
            state = next_state;
        }
        if !resolution.winner_is_a {
            // Winner came from the peer: its branch is new to our log.
            store.append_deltas(&remote_branch)?;
        }
        let (entity, state) = apply_delta(&entity, &state, &resolution.resolution_delta)?;
        persist(store, &resolution.resolution_delta, &entity, &state)?;

        for delta in &remote_branch {
            outcome.acked.push(delta.delta_id.clone());
        }
        outcome.peer_heads.push(Head {
            entity_id: entity_id.to_string(),
            version: entity.version,
            state_hash: entity.state_hash,
        });
        outcome.resolutions.push(resolution.resolution_delta);
        Ok(())
    }
}

fn head_of(delta: &Delta) -> Head {
    Head {
        entity_id: delta.entity_id.clone(),
        version: delta.version,
        state_hash: delta.new_hash,
    }
}

fn persist(
    store: &mut dyn Store,
    delta: &Delta,
    entity: &fabric_kernel::Entity,
    state: &serde_json::Value,
) -> Result<(), SyncError> {
    store.append_delta(delta)?;
    store.save_entity(&EntityRecord {
        entity: entity.clone(),
        state: state.clone(),
    })?;
    Ok(())
}

/// Rebuilds the entity/state pair at a historical head hash, if that hash
/// ever existed on this entity's chain.
fn record_at_hash(
    store: &dyn Store,
    entity_id: &str,
    hash: StateHash,
) -> Result<Option<EntityRecord>, SyncError> {
    let log = store.load_deltas_for_entity(entity_id)?;
    if !log.iter().any(|d| d.new_hash == hash) {
        return Ok(None);
    }
    let mut current: Option<EntityRecord> = None;
    for delta in &log {
        let next = match &current {
            None => {
                let (entity, state) = materialize_from_genesis(delta)?;
                EntityRecord { entity, state }
            }
            Some(rec) => {
                if delta.prev_hash != rec.entity.state_hash {
                    // Branch in the log; skip deltas off the replayed line.
                    continue;
                }
                let (entity, state) = apply_delta(&rec.entity, &rec.state, delta)?;
                EntityRecord { entity, state }
            }
        };
        let found = next.entity.state_hash == hash;
        current = Some(next);
        if found {
            return Ok(current);
        }
    }
    Ok(None)
}
