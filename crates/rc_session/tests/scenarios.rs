//! End-to-end scenarios run across `rc_crypto` + `rc_proto` + `rc_session`
//! with an in-memory fake transport, no real network or production wiring.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use rc_crypto::identity::IdentityKeyPair;
use rc_crypto::ratchet::RatchetHolder;
use rc_crypto::x3dh::{self, PrekeyBundle};
use rc_proto::MessageContent;
use rc_session::master_key::MasterKeyGuard;
use rc_session::transport::fake::FakeTransport;
use rc_session::{BackupClient, CoreConfig, Outbox, ReceivePipeline, SessionStore, Store, VaultClient};
use uuid::Uuid;

async fn open_store(seed: u8) -> (Store, PathBuf) {
    let db_path = PathBuf::from(format!("/tmp/rc-scenario-test-{}.db", Uuid::new_v4()));
    let master_key = MasterKeyGuard::new();
    master_key.unlock_with_key([seed; 32], 1800).await;
    let store = Store::open(&db_path, master_key).await.expect("open store");
    (store, db_path)
}

fn cleanup(db_path: &PathBuf) {
    let _ = std::fs::remove_file(db_path);
    let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
    let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
}

fn paired_holders() -> (RatchetHolder, RatchetHolder) {
    let alice_ik = IdentityKeyPair::generate().unwrap();
    let bob_ik = IdentityKeyPair::generate().unwrap();
    let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = x3dh::generate_signed_prekey(&bob_ik).unwrap();
    let bob_bundle = PrekeyBundle {
        account_digest: "BOB".into(),
        device_id: "bob-dev".into(),
        ik_pub: bob_ik.public_b64(),
        spk_pub: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
        spk_sig: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&bob_spk_sig),
        opk_pub: None,
        opk_id: None,
    };
    let x3dh_a = x3dh::initiate("ALICE", "alice-dev", &alice_ik, &bob_bundle, None).unwrap();
    let alice_ik_pub: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
    let x3dh_b = x3dh::respond(&bob_spk_secret, &bob_spk_pub, &bob_ik, None, &alice_ik_pub, &x3dh_a.header).unwrap();

    let conv_id = rc_crypto::kdf::derive_conversation_id(&x3dh_a.rk).unwrap();
    let alice_holder = RatchetHolder::init_initiator("h1".into(), conv_id.clone(), "alice-dev".into(), x3dh_a).unwrap();
    let bob_holder = RatchetHolder::init_responder("h1".into(), conv_id, "bob-dev".into(), x3dh_b).unwrap();
    (alice_holder, bob_holder)
}

/// Scenario 3 from the testable-properties list: a burst of ten messages
/// from Alice arrives at Bob in order; every plaintext round-trips and both
/// sides' transport-wide counters land on ten.
#[tokio::test]
async fn burst_of_ten_messages_round_trips_and_advances_counters() {
    let (alice_store, alice_db) = open_store(41).await;
    let (bob_store, bob_db) = open_store(42).await;
    let transport = Arc::new(FakeTransport::default());

    let (alice_holder, bob_holder) = paired_holders();
    let alice_sessions = Arc::new(SessionStore::new(alice_store.clone()));
    let bob_sessions = Arc::new(SessionStore::new(bob_store.clone()));
    alice_sessions.insert_new("ALICE", "BOB::bob-dev", alice_holder).await;
    bob_sessions.insert_new("BOB", "ALICE::alice-dev", bob_holder).await;

    let mut config = CoreConfig::default();
    config.catchup_debounce_secs = 0;

    let alice_vault = VaultClient::new(alice_store.clone(), transport.clone(), config.clone());
    let alice_backup = BackupClient::new(alice_store.clone(), transport.clone());
    let outbox = Outbox::new(alice_store.clone(), alice_sessions.clone(), alice_vault, alice_backup, transport.clone(), config.clone());

    let bob_vault = VaultClient::new(bob_store.clone(), transport.clone(), config.clone());
    let pipeline = ReceivePipeline::new(bob_store.clone(), bob_sessions.clone(), bob_vault, transport.clone(), config);

    for i in 0..10u32 {
        outbox.send("ALICE", "alice-dev", "BOB", "bob-dev", MessageContent::Text { body: format!("burst-{i}") }).await.unwrap();
        let envelope = transport.received.lock().unwrap()[i as usize].envelope.clone();
        let payload = pipeline.receive("BOB", "bob-dev", "ALICE", envelope).await.unwrap().expect("each burst message is new");
        match payload.content {
            MessageContent::Text { body } => assert_eq!(body, format!("burst-{i}")),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    let alice_holder = alice_sessions.dr_state("ALICE", "BOB::bob-dev").await.unwrap();
    let bob_holder = bob_sessions.dr_state("BOB", "ALICE::alice-dev").await.unwrap();
    assert_eq!(alice_holder.ns_total, 10);
    assert_eq!(bob_holder.nr_total, 10);

    cleanup(&alice_db);
    cleanup(&bob_db);
}

/// Scenario 5: after Bob's local ratchet state is wiped and restored to a
/// point before a message it already has a vault entry for, the receive
/// pipeline serves that message from the vault instead of failing, and
/// leaves the fresh holder's counters untouched.
#[tokio::test]
async fn vault_replay_serves_message_without_advancing_fresh_holder() {
    let (alice_store, alice_db) = open_store(43).await;
    let (bob_store, bob_db) = open_store(44).await;
    let transport = Arc::new(FakeTransport::default());

    let (alice_holder, bob_holder) = paired_holders();
    // Snapshot Bob's holder exactly as X3DH produced it, before any message
    // advances it — this stands in for a contact-secrets backup taken
    // before the message below ever arrived.
    let bob_pre_wipe_json = serde_json::to_vec(&bob_holder).unwrap();

    let alice_sessions = Arc::new(SessionStore::new(alice_store.clone()));
    let bob_sessions = Arc::new(SessionStore::new(bob_store.clone()));
    alice_sessions.insert_new("ALICE", "BOB::bob-dev", alice_holder).await;
    bob_sessions.insert_new("BOB", "ALICE::alice-dev", bob_holder).await;

    let mut config = CoreConfig::default();
    config.catchup_debounce_secs = 0;

    let alice_vault = VaultClient::new(alice_store.clone(), transport.clone(), config.clone());
    let alice_backup = BackupClient::new(alice_store.clone(), transport.clone());
    let outbox = Outbox::new(alice_store.clone(), alice_sessions.clone(), alice_vault, alice_backup, transport.clone(), config.clone());
    outbox.send("ALICE", "alice-dev", "BOB", "bob-dev", MessageContent::Text { body: "before the wipe".into() }).await.unwrap();
    let envelope = transport.received.lock().unwrap()[0].envelope.clone();

    let bob_vault = VaultClient::new(bob_store.clone(), transport.clone(), config.clone());
    let pipeline = ReceivePipeline::new(bob_store.clone(), bob_sessions.clone(), bob_vault, transport.clone(), config);
    let first = pipeline.receive("BOB", "bob-dev", "ALICE", envelope.clone()).await.unwrap().expect("delivered live");
    match first.content {
        MessageContent::Text { body } => assert_eq!(body, "before the wipe"),
        other => panic!("unexpected content: {other:?}"),
    }

    // Simulate "wipe and restore": rehydrate the pre-message snapshot taken
    // above, carrying the same conversation id but none of the progress the
    // live delivery made. The vault (server-side, unaffected by Bob's local
    // wipe) still has the wrapped key from that live delivery. A second
    // account digest sharing the same store/master-key keeps the dedup
    // cache independent of the first delivery, so the payload surfaces
    // instead of being folded away as already-seen.
    let fresh_bob_holder: RatchetHolder = serde_json::from_slice(&bob_pre_wipe_json).unwrap();
    let fresh_sessions = Arc::new(SessionStore::new(bob_store.clone()));
    fresh_sessions.insert_new("BOB2", "ALICE::alice-dev", fresh_bob_holder).await;
    let fresh_vault = VaultClient::new(bob_store.clone(), transport.clone(), CoreConfig::default());
    let fresh_pipeline = ReceivePipeline::new(bob_store.clone(), fresh_sessions.clone(), fresh_vault, transport.clone(), CoreConfig::default());

    // The restored holder's chain keys predate this message, so a live
    // decrypt would fail if this routed through `decrypt_step` anyway; the
    // counter comparison must route it to vault replay before that ever
    // happens. `localMax` lands at 0 either from the vault's own
    // bookkeeping (already at counter 0 from the live delivery above) or
    // from the restored holder's own `NrTotal` of 0 — both agree here, so
    // `expected(0) <= localMax(0)` holds regardless of which one wins.
    let replayed = fresh_pipeline.receive("BOB2", "bob-dev", "ALICE", envelope).await.unwrap();
    let payload = replayed.expect("vault replay serves the payload even with a fresh, unadvanced holder");
    match payload.content {
        MessageContent::Text { body } => assert_eq!(body, "before the wipe"),
        other => panic!("unexpected content: {other:?}"),
    }

    let holder_after = fresh_sessions.dr_state("BOB2", "ALICE::alice-dev").await.unwrap();
    assert_eq!(holder_after.nr_total, 0, "vault replay must not advance ratchet state");

    cleanup(&alice_db);
    cleanup(&bob_db);
}
