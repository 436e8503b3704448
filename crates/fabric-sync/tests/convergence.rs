// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Two-node convergence: bootstrap, incremental catch-up, chunked delivery,
//! chain-break rejection, and deterministic fork resolution.

use fabric_kernel::{Delta, EntityType, FixedClock, Kernel, PatchOp, SequentialIds};
use fabric_store::{EntityRecord, MemoryStore, Store};
use fabric_sync::{
    Packet, PacketBody, RejectReason, SessionConfig, SessionState, SyncEndpoint, SyncSession,
    WatermarkStore,
};
use serde_json::json;
use std::sync::Arc;

const T0: u64 = 1_700_000_000_000;

struct Node {
    endpoint: SyncEndpoint,
    store: MemoryStore,
    watermarks: WatermarkStore,
    kernel: Kernel,
    _dir: tempfile::TempDir,
}

fn node(name: &str, id_seed: u64) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let ids = SequentialIds::default();
    for _ in 0..id_seed {
        fabric_kernel::IdSource::mint(&ids, "seed");
    }
    Node {
        endpoint: SyncEndpoint::new(name, SessionConfig::default()),
        store: MemoryStore::new(),
        watermarks: WatermarkStore::open(dir.path()).unwrap(),
        kernel: Kernel::new(Arc::new(FixedClock::at(T0)), Arc::new(ids)),
        _dir: dir,
    }
}

fn commit(node: &mut Node, committed: &fabric_kernel::Committed) {
    node.store.append_delta(&committed.delta).unwrap();
    node.store
        .save_entity(&EntityRecord {
            entity: committed.entity.clone(),
            state: committed.state.clone(),
        })
        .unwrap();
}

/// Pumps packets between two nodes until both queues drain.
fn pump(a: &mut Node, b: &mut Node) -> (SyncSession, SyncSession) {
    let (mut session_a, hello) = a.endpoint.begin("node-b", T0);
    let mut session_b = b.endpoint.accept("node-a", T0);
    let mut to_b = vec![hello];
    let mut to_a: Vec<Packet> = Vec::new();
    for _round in 0..32 {
        if to_a.is_empty() && to_b.is_empty() {
            break;
        }
        let mut next_to_a = Vec::new();
        for packet in to_b.drain(..) {
            next_to_a.extend(
                b.endpoint
                    .handle_packet(&mut session_b, &mut b.store, &mut b.watermarks, &packet, T0)
                    .unwrap(),
            );
        }
        for packet in to_a.drain(..) {
            to_b.extend(
                a.endpoint
                    .handle_packet(&mut session_a, &mut a.store, &mut a.watermarks, &packet, T0)
                    .unwrap(),
            );
        }
        to_a = next_to_a;
    }
    (session_a, session_b)
}

fn heads_match(a: &Node, b: &Node) {
    let heads_a = fabric_sync::local_heads(&a.store).unwrap();
    let heads_b = fabric_sync::local_heads(&b.store).unwrap();
    assert_eq!(heads_a.len(), heads_b.len());
    for head in &heads_a {
        let other = heads_b
            .iter()
            .find(|h| h.entity_id == head.entity_id)
            .unwrap();
        assert_eq!(head.state_hash, other.state_hash, "{}", head.entity_id);
        assert_eq!(head.version, other.version);
    }
    // States match too, not just hashes.
    for record in a.store.load_entities().unwrap() {
        let other = b
            .store
            .load_entity(&record.entity.entity_id)
            .unwrap()
            .unwrap();
        assert_eq!(record.state, other.state);
    }
}

#[test]
fn bootstrap_pulls_everything_from_genesis() {
    let mut a = node("node-a", 0);
    let mut b = node("node-b", 1000);

    let task = a
        .kernel
        .create_entity(EntityType::Task, &json!({"title": "t", "status": "OPEN"}), "user")
        .unwrap();
    commit(&mut a, &task);
    let note = a
        .kernel
        .create_entity(EntityType::Note, &json!({"content": "hello"}), "user")
        .unwrap();
    commit(&mut a, &note);

    let (session_a, _session_b) = pump(&mut a, &mut b);
    heads_match(&a, &b);
    assert_eq!(session_a.state, SessionState::Complete);
    assert_eq!(b.store.load_deltas().unwrap().len(), 2);
}

#[test]
fn incremental_catch_up_ships_only_the_tail() {
    let mut a = node("node-a", 0);
    let mut b = node("node-b", 1000);

    let task = a
        .kernel
        .create_entity(EntityType::Task, &json!({"title": "t", "status": "OPEN"}), "user")
        .unwrap();
    commit(&mut a, &task);
    pump(&mut a, &mut b);
    heads_match(&a, &b);

    // A advances twice; B should fetch exactly the two new deltas.
    let second = a
        .kernel
        .create_delta(
            &task.entity,
            &task.state,
            vec![PatchOp::replace("/status", json!("DOING"))],
            "user",
        )
        .unwrap();
    commit(&mut a, &second);
    let third = a
        .kernel
        .create_delta(
            &second.entity,
            &second.state,
            vec![PatchOp::replace("/status", json!("DONE"))],
            "user",
        )
        .unwrap();
    commit(&mut a, &third);

    pump(&mut a, &mut b);
    heads_match(&a, &b);
    assert_eq!(b.store.load_deltas().unwrap().len(), 3);
    let record = b.store.load_entity(&task.entity.entity_id).unwrap().unwrap();
    assert_eq!(record.state["status"], json!("DONE"));
}

#[test]
fn bidirectional_sync_merges_disjoint_entities() {
    let mut a = node("node-a", 0);
    let mut b = node("node-b", 1000);

    let task = a
        .kernel
        .create_entity(EntityType::Task, &json!({"title": "a's", "status": "OPEN"}), "user")
        .unwrap();
    commit(&mut a, &task);
    let note = b
        .kernel
        .create_entity(EntityType::Note, &json!({"content": "b's"}), "user")
        .unwrap();
    commit(&mut b, &note);

    pump(&mut a, &mut b);
    heads_match(&a, &b);
    assert_eq!(a.store.load_entities().unwrap().len(), 2);
}

#[test]
fn oversized_delta_travels_chunked_and_converges() {
    // A 4 KB patch value against a 220-byte packet budget.
    let mut a = node("node-a", 0);
    let mut b = node("node-b", 1000);

    let note = a
        .kernel
        .create_entity(EntityType::Note, &json!({"content": "small"}), "user")
        .unwrap();
    commit(&mut a, &note);
    pump(&mut a, &mut b);

    let big = a
        .kernel
        .create_delta(
            &note.entity,
            &note.state,
            vec![PatchOp::replace("/content", json!("x".repeat(4096)))],
            "user",
        )
        .unwrap();
    commit(&mut a, &big);

    // Count the chunk packets crossing the wire this round.
    let (mut session_a, hello) = a.endpoint.begin("node-b", T0);
    let mut session_b = b.endpoint.accept("node-a", T0);
    let mut to_b = vec![hello];
    let mut to_a: Vec<Packet> = Vec::new();
    let mut chunk_packets = 0usize;
    for _round in 0..32 {
        if to_a.is_empty() && to_b.is_empty() {
            break;
        }
        let mut next_to_a = Vec::new();
        for packet in to_b.drain(..) {
            if matches!(packet.body, PacketBody::DeltasChunk { .. }) {
                chunk_packets += 1;
            }
            assert!(packet.canonical_size().unwrap() <= 220, "oversized packet");
            next_to_a.extend(
                b.endpoint
                    .handle_packet(&mut session_b, &mut b.store, &mut b.watermarks, &packet, T0)
                    .unwrap(),
            );
        }
        for packet in to_a.drain(..) {
            assert!(packet.canonical_size().unwrap() <= 220, "oversized packet");
            to_b.extend(
                a.endpoint
                    .handle_packet(&mut session_a, &mut a.store, &mut a.watermarks, &packet, T0)
                    .unwrap(),
            );
        }
        to_a = next_to_a;
    }
    // ⌈4096 / 150⌉ is the floor on fragment count.
    assert!(chunk_packets >= 4096 / 150, "only {chunk_packets} chunks");
    heads_match(&a, &b);
    let record = b.store.load_entity(&note.entity.entity_id).unwrap().unwrap();
    assert_eq!(record.entity.state_hash, big.entity.state_hash);
}

#[test]
fn crafted_prev_hash_is_rejected_then_recovers_from_genesis() {
    // A delta whose prev_hash matches nothing yields REJECT
    // HASH_CHAIN_BROKEN; the follow-up genesis WANT repairs the peer.
    let mut a = node("node-a", 0);
    let mut b = node("node-b", 1000);

    let task = a
        .kernel
        .create_entity(EntityType::Task, &json!({"title": "t", "status": "OPEN"}), "user")
        .unwrap();
    commit(&mut a, &task);
    pump(&mut a, &mut b);

    let forged = Delta {
        delta_id: "delta-ffffffffffffffff".to_string(),
        entity_id: task.entity.entity_id.clone(),
        version: 2,
        author: "user".to_string(),
        ts: T0,
        patches: vec![PatchOp::replace("/status", json!("HACKED"))],
        prev_hash: fabric_canonical::hash_bytes(b"not a real head"),
        new_hash: fabric_canonical::hash_bytes(b"still not"),
        signature: None,
    };
    let outcome = b
        .endpoint
        .receive_deltas(&mut b.store, &[forged])
        .unwrap();
    assert!(outcome.acked.is_empty());
    assert_eq!(outcome.rejects.len(), 1);
    assert_eq!(outcome.rejects[0].0, RejectReason::HashChainBroken);
    assert_eq!(outcome.genesis_wants, vec![task.entity.entity_id.clone()]);

    // B's state is untouched and a fresh round still converges.
    let record = b.store.load_entity(&task.entity.entity_id).unwrap().unwrap();
    assert_eq!(record.state["status"], json!("OPEN"));
    pump(&mut a, &mut b);
    heads_match(&a, &b);
}

#[test]
fn unknown_entity_without_genesis_requests_genesis() {
    let mut a = node("node-a", 0);
    let mut b = node("node-b", 1000);

    let task = a
        .kernel
        .create_entity(EntityType::Task, &json!({"title": "t", "status": "OPEN"}), "user")
        .unwrap();
    commit(&mut a, &task);
    let second = a
        .kernel
        .create_delta(
            &task.entity,
            &task.state,
            vec![PatchOp::replace("/status", json!("DONE"))],
            "user",
        )
        .unwrap();
    commit(&mut a, &second);

    // Deliver only the non-genesis delta to an empty node.
    let outcome = b
        .endpoint
        .receive_deltas(&mut b.store, &[second.delta.clone()])
        .unwrap();
    assert_eq!(outcome.rejects[0].0, RejectReason::EntityUnknown);
    assert_eq!(outcome.genesis_wants, vec![task.entity.entity_id.clone()]);
}

#[test]
fn forked_histories_converge_to_identical_heads() {
    // Both nodes extend the same base independently, then sync. The fork
    // resolves deterministically and both heads end identical.
    let mut a = node("node-a", 0);
    let mut b = node("node-b", 1000);

    let note = a
        .kernel
        .create_entity(EntityType::Note, &json!({"content": "base"}), "user")
        .unwrap();
    commit(&mut a, &note);
    pump(&mut a, &mut b);
    heads_match(&a, &b);

    let ours = a
        .kernel
        .create_delta(
            &note.entity,
            &note.state,
            vec![PatchOp::replace("/content", json!("from a"))],
            "user",
        )
        .unwrap();
    commit(&mut a, &ours);
    let theirs = b
        .kernel
        .create_delta(
            &note.entity,
            &note.state,
            vec![
                PatchOp::replace("/content", json!("from b")),
                PatchOp::add("/extra", json!(true)),
            ],
            "user",
        )
        .unwrap();
    commit(&mut b, &theirs);

    pump(&mut a, &mut b);
    heads_match(&a, &b);

    // The surviving head is a resolution delta authored by the resolver.
    let record = a.store.load_entity(&note.entity.entity_id).unwrap().unwrap();
    let log = a
        .store
        .load_deltas_for_entity(&note.entity.entity_id)
        .unwrap();
    let head_delta = log
        .iter()
        .find(|d| d.new_hash == record.entity.state_hash)
        .unwrap();
    assert_eq!(head_delta.author, fabric_sync::RESOLUTION_AUTHOR);
}
