//! C7 — outbox.
//!
//! A send reserves its ratchet counter by calling `encrypt_step` directly on
//! the live holder clone returned from `SessionStore`; the clone is only
//! committed back once the transport has actually been asked to deliver the
//! envelope. A failure while building the envelope (serialisation, AEAD)
//! happens before that point and the clone is simply dropped — the canonical
//! holder in `SessionStore` never advanced, so the counter is free to reuse.
//! Once the transport call has been made the counter is burned regardless of
//! the response, successful or not: the relay may already have accepted it,
//! and reusing it on a later retry would only ever earn `CounterTooLow`.
//!
//! A `CounterTooLow` rejection is repaired, not retried as-is: the original
//! message id is abandoned, `/send-state` is probed for what the relay
//! actually expects, `NsTotal` is reset to `expected - 1`, and a fresh
//! message id is re-encrypted and sent in its place. `send` reports this as
//! `SendOutcome::Replaced` rather than quietly returning the new id under
//! the old one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;
use chrono::Utc;
use tracing::warn;

use rc_crypto::aead;
use rc_crypto::hash;
use rc_proto::api::{ApiErrorCode, SendRequest, SendStateRequest};
use rc_proto::{EnvelopeHeader, EnvelopeMeta, MessageContent, MessageEnvelope, PlaintextPayload, VaultDirection, VaultEntry};

use crate::backup::BackupClient;
use crate::config::CoreConfig;
use crate::db::{BlobTable, Store};
use crate::error::SessionError;
use crate::models::{OutboxJobRecord, OutboxQueueBlob};
use crate::session_store::SessionStore;
use crate::transport::Transport;
use crate::vault_client::VaultClient;

/// Repair attempts for a `CounterTooLow` rejection before giving up and
/// surfacing the error — each attempt probes `/send-state`, resets `NsTotal`
/// to what the relay expects, and re-sends under a fresh message id.
const MAX_COUNTER_REPAIR_ATTEMPTS: u32 = 8;

/// What happened to a `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered on the first attempt, no repair needed.
    Sent { message_id: String },
    /// The relay rejected the original message id with `CounterTooLow`;
    /// `original_message_id` was abandoned and `new_message_id` was sent
    /// in its place at `expected_counter`.
    Replaced { original_message_id: String, new_message_id: String, expected_counter: u64 },
}

pub struct Outbox {
    store: Store,
    session_store: Arc<SessionStore>,
    vault: VaultClient,
    backup: BackupClient,
    transport: Arc<dyn Transport>,
    config: CoreConfig,
    send_failures: Mutex<HashMap<String, u32>>,
    successful_sends: AtomicU64,
}

impl Outbox {
    pub fn new(store: Store, session_store: Arc<SessionStore>, vault: VaultClient, backup: BackupClient, transport: Arc<dyn Transport>, config: CoreConfig) -> Self {
        Self { store, session_store, vault, backup, transport, config, send_failures: Mutex::new(HashMap::new()), successful_sends: AtomicU64::new(0) }
    }

    pub async fn send(
        &self,
        self_account_digest: &str,
        self_device_id: &str,
        peer_account_digest: &str,
        peer_device_id: &str,
        content: MessageContent,
    ) -> Result<SendOutcome, SessionError> {
        let peer_key = format!("{peer_account_digest}::{peer_device_id}");
        let mut holder = self
            .session_store
            .dr_state(self_account_digest, &peer_key)
            .await
            .ok_or_else(|| SessionError::SessionMissing(peer_key.clone()))?;
        let conversation_id = holder.conversation_id.clone();
        let wire_msg_type = content.wire_msg_type();

        let original_message_id = Self::new_message_id(self_account_digest, peer_account_digest, &content)?;
        let mut message_id = original_message_id.clone();
        let mut plaintext = Self::build_plaintext(self_account_digest, self_device_id, &message_id, content.clone())?;
        let mut replaced = false;
        let mut repaired_expected_counter = 0u64;

        for attempt in 0..MAX_COUNTER_REPAIR_ATTEMPTS {
            let (envelope, vault_entry) = self
                .build_envelope(
                    &mut holder,
                    self_account_digest,
                    self_device_id,
                    peer_account_digest,
                    peer_device_id,
                    wire_msg_type,
                    &plaintext,
                    &message_id,
                )
                .await?;

            let backup = self.maybe_build_backup(self_account_digest).await?;
            let result = self.transport.send(SendRequest { envelope: envelope.clone(), vault_entry: vault_entry.clone(), backup }).await;

            match result {
                Ok(resp) if resp.ok => {
                    self.session_store.commit(self_account_digest, &peer_key, holder).await?;
                    self.record_success(&peer_key);
                    self.vault.put(self_account_digest, vault_entry).await?;
                    return Ok(if replaced {
                        SendOutcome::Replaced { original_message_id, new_message_id: message_id, expected_counter: repaired_expected_counter }
                    } else {
                        SendOutcome::Sent { message_id }
                    });
                }
                Ok(resp) if matches!(resp.error, Some(ApiErrorCode::CounterTooLow)) && attempt + 1 < MAX_COUNTER_REPAIR_ATTEMPTS => {
                    let expected = self.fetch_expected_counter(&conversation_id, self_device_id).await?;
                    warn!(
                        peer_key = %peer_key,
                        expected,
                        attempt,
                        abandoned_message_id = %message_id,
                        "counter too low, repairing with a new message id"
                    );
                    holder.ns_total = expected.saturating_sub(1);
                    replaced = true;
                    repaired_expected_counter = expected;
                    message_id = Self::new_message_id(self_account_digest, peer_account_digest, &content)?;
                    plaintext = Self::build_plaintext(self_account_digest, self_device_id, &message_id, content.clone())?;
                    continue;
                }
                Ok(resp) if matches!(resp.error, Some(ApiErrorCode::CounterTooLow)) => {
                    // Repair budget exhausted and the relay still rejects us.
                    self.session_store.commit(self_account_digest, &peer_key, holder).await?;
                    self.record_failure(&peer_key);
                    return Err(SessionError::CounterTooLow { peer_key, expected: resp.expected_counter.unwrap_or(0) });
                }
                Ok(resp) => {
                    self.session_store.commit(self_account_digest, &peer_key, holder).await?;
                    self.record_failure(&peer_key);
                    return Err(SessionError::VaultPrepFailed(message_id, format!("{:?}", resp.error)));
                }
                Err(e) => {
                    self.session_store.commit(self_account_digest, &peer_key, holder).await?;
                    self.record_failure(&peer_key);
                    self.enqueue_job(self_account_digest, &peer_key, &message_id, &envelope, &vault_entry).await?;
                    return Err(SessionError::TransportTimeout(format!("{message_id}: {e}")));
                }
            }
        }

        self.session_store.commit(self_account_digest, &peer_key, holder).await?;
        self.record_failure(&peer_key);
        Err(SessionError::VaultPrepFailed(message_id, "exhausted counter repair attempts".into()))
    }

    fn new_message_id(self_account_digest: &str, peer_account_digest: &str, content: &MessageContent) -> Result<String, SessionError> {
        let content_bytes = serde_json::to_vec(content)?;
        let ts_nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Ok(hash::message_id(self_account_digest, peer_account_digest, &content_bytes, ts_nanos))
    }

    fn build_plaintext(self_account_digest: &str, self_device_id: &str, message_id: &str, content: MessageContent) -> Result<Vec<u8>, SessionError> {
        let payload = PlaintextPayload {
            version: 1,
            message_id: message_id.to_string(),
            content,
            sent_at: Utc::now(),
            sender_account_digest: self_account_digest.to_string(),
            sender_device_id: self_device_id.to_string(),
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    /// §4.7/§6 `CounterTooLow` repair probe: what the relay expects next for
    /// this device, independent of whatever the rejected `send` call itself
    /// reported.
    async fn fetch_expected_counter(&self, conversation_id: &str, self_device_id: &str) -> Result<u64, SessionError> {
        let resp = self
            .transport
            .send_state(SendStateRequest { conversation_id: conversation_id.to_string(), sender_device_id: self_device_id.to_string() })
            .await?;
        Ok(resp.expected_counter)
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_envelope(
        &self,
        holder: &mut rc_crypto::ratchet::RatchetHolder,
        self_account_digest: &str,
        self_device_id: &str,
        peer_account_digest: &str,
        peer_device_id: &str,
        wire_msg_type: rc_proto::WireMsgType,
        plaintext: &[u8],
        message_id: &str,
    ) -> Result<(MessageEnvelope, VaultEntry), SessionError> {
        let (header, mk) = holder.encrypt_step().map_err(SessionError::Crypto)?;
        let transport_counter = holder.ns_total - 1;

        let envelope_header = EnvelopeHeader {
            ek_pub_b64: header.ek_pub_b64,
            n: header.n as u32,
            pn: header.pn as u32,
            device_id: header.device_id,
            meta: EnvelopeMeta {
                ts: Utc::now().timestamp(),
                sender_digest: self_account_digest.to_string(),
                sender_device_id: self_device_id.to_string(),
                target_digest: peer_account_digest.to_string(),
                target_device_id: peer_device_id.to_string(),
                msg_type: wire_msg_type,
                transport_counter,
            },
        };

        let nonce = aead::random_nonce();
        let aad = MessageEnvelope::canonical_aad(&envelope_header, &nonce)?;
        let ciphertext = aead::encrypt_with_nonce(&mk, &nonce, plaintext, &aad).map_err(SessionError::Crypto)?;

        let envelope = MessageEnvelope {
            header: envelope_header,
            ciphertext_b64: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&ciphertext),
            iv_b64: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(nonce),
        };

        let wrapped_mk = self
            .store
            .master_key
            .with_key(|key| {
                aead::wrap_key(key, &mk)
                    .map(|bytes| base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
                    .map_err(SessionError::Crypto)
            })
            .await?;
        let vault_entry = VaultEntry {
            conversation_id: holder.conversation_id.clone(),
            message_id: message_id.to_string(),
            sender_device_id: self_device_id.to_string(),
            target_device_id: peer_device_id.to_string(),
            direction: VaultDirection::Outgoing,
            header_counter: transport_counter,
            wrapped_mk,
            wrap_context: VaultEntry::wrap_context_for(&holder.conversation_id, message_id, VaultDirection::Outgoing),
            dr_state: None,
        };

        Ok((envelope, vault_entry))
    }

    async fn maybe_build_backup(&self, account_digest: &str) -> Result<Option<rc_proto::api::BackupPutRequest>, SessionError> {
        let n = self.successful_sends.load(Ordering::Relaxed);
        if n == 0 || n % self.config.backup_attach_every_n_sends as u64 != 0 {
            return Ok(None);
        }
        self.backup.build_attachment(account_digest).await
    }

    fn record_success(&self, peer_key: &str) {
        self.send_failures.lock().unwrap().remove(peer_key);
        self.successful_sends.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, peer_key: &str) {
        let mut failures = self.send_failures.lock().unwrap();
        let slot = failures.entry(peer_key.to_string()).or_insert(0);
        *slot += 1;
        let count = *slot;
        if count >= self.config.send_failure_trip_threshold {
            warn!(peer_key = %peer_key, count, "consecutive send failures exceeded trip threshold");
        }
    }

    async fn enqueue_job(&self, account_digest: &str, peer_key: &str, message_id: &str, envelope: &MessageEnvelope, vault_entry: &VaultEntry) -> Result<(), SessionError> {
        let mut queue = self.load_queue(account_digest).await?;
        queue.jobs.push(OutboxJobRecord {
            message_id: message_id.to_string(),
            peer_key: peer_key.to_string(),
            envelope_json: serde_json::to_string(envelope)?,
            vault_entry_json: serde_json::to_string(vault_entry)?,
            enqueued_at: Utc::now(),
            attempt: 0,
        });
        self.store.write_blob(BlobTable::OutboxQueue, account_digest, &serde_json::to_vec(&queue)?).await
    }

    /// Retry every queued job, dropping ones that resend cleanly. A job left
    /// behind after a failed resend keeps its place in line — jobs are
    /// replayed in enqueue order, so a stuck head-of-line job is retried
    /// again on the next call rather than skipped.
    pub async fn flush_pending(&self, account_digest: &str) -> Result<(), SessionError> {
        let mut queue = self.load_queue(account_digest).await?;
        let mut remaining = Vec::with_capacity(queue.jobs.len());

        for mut job in queue.jobs.drain(..) {
            let Ok(envelope) = serde_json::from_str::<MessageEnvelope>(&job.envelope_json) else { continue };
            let Ok(vault_entry) = serde_json::from_str::<VaultEntry>(&job.vault_entry_json) else { continue };

            match self.transport.send(SendRequest { envelope, vault_entry: vault_entry.clone(), backup: None }).await {
                Ok(resp) if resp.ok => {
                    self.vault.put(account_digest, vault_entry).await?;
                }
                _ => {
                    job.attempt += 1;
                    remaining.push(job);
                }
            }
        }

        queue.jobs = remaining;
        self.store.write_blob(BlobTable::OutboxQueue, account_digest, &serde_json::to_vec(&queue)?).await
    }

    async fn load_queue(&self, account_digest: &str) -> Result<OutboxQueueBlob, SessionError> {
        match self.store.read_blob(BlobTable::OutboxQueue, account_digest).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(OutboxQueueBlob::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_key::MasterKeyGuard;
    use crate::transport::fake::FakeTransport;
    use rc_crypto::identity::IdentityKeyPair;
    use rc_crypto::ratchet::RatchetHolder;
    use rc_crypto::x3dh::{self, PrekeyBundle};
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_test_store(seed: u8) -> (Store, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/rc-outbox-test-{}.db", Uuid::new_v4()));
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

    fn alice_initiator_holder() -> RatchetHolder {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let (_bob_spk_secret, bob_spk_pub, bob_spk_sig) = x3dh::generate_signed_prekey(&bob_ik).unwrap();
        let bundle = PrekeyBundle {
            account_digest: "BOB".into(),
            device_id: "bob-dev".into(),
            ik_pub: bob_ik.public_b64(),
            spk_pub: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
            spk_sig: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&bob_spk_sig),
            opk_pub: None,
            opk_id: None,
        };
        let x3dh = x3dh::initiate("ALICE", "alice-dev", &alice_ik, &bundle, None).unwrap();
        let conv_id = rc_crypto::kdf::derive_conversation_id(&x3dh.rk).unwrap();
        RatchetHolder::init_initiator("h1".into(), conv_id, "alice-dev".into(), x3dh).unwrap()
    }

    #[tokio::test]
    async fn send_commits_counter_and_submits_to_vault() {
        let (store, db_path) = open_test_store(21).await;
        let transport = Arc::new(FakeTransport::default());
        let session_store = Arc::new(SessionStore::new(store.clone()));
        session_store.insert_new("ALICE", "BOB::bob-dev", alice_initiator_holder()).await;

        let vault = VaultClient::new(store.clone(), transport.clone(), CoreConfig::default());
        let backup = BackupClient::new(store.clone(), transport.clone());
        let outbox = Outbox::new(store.clone(), session_store.clone(), vault, backup, transport.clone(), CoreConfig::default());

        let outcome = outbox
            .send("ALICE", "alice-dev", "BOB", "bob-dev", MessageContent::Text { body: "hi".into() })
            .await
            .unwrap();
        let message_id = match outcome {
            SendOutcome::Sent { message_id } => message_id,
            other => panic!("unexpected outcome: {other:?}"),
        };

        assert_eq!(transport.received.lock().unwrap().len(), 1);
        assert!(transport.vault.lock().unwrap().values().any(|e| e.message_id == message_id));

        let holder = session_store.dr_state("ALICE", "BOB::bob-dev").await.unwrap();
        assert_eq!(holder.ns_total, 1);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn send_with_no_session_is_rejected() {
        let (store, db_path) = open_test_store(22).await;
        let transport = Arc::new(FakeTransport::default());
        let session_store = Arc::new(SessionStore::new(store.clone()));
        let vault = VaultClient::new(store.clone(), transport.clone(), CoreConfig::default());
        let backup = BackupClient::new(store.clone(), transport.clone());
        let outbox = Outbox::new(store.clone(), session_store, vault, backup, transport, CoreConfig::default());

        let err = outbox.send("ALICE", "alice-dev", "BOB", "bob-dev", MessageContent::Text { body: "hi".into() }).await;
        assert!(matches!(err, Err(SessionError::SessionMissing(_))));
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn failed_send_is_queued_and_flushed() {
        let (store, db_path) = open_test_store(23).await;
        let transport = Arc::new(FakeTransport::default());
        let session_store = Arc::new(SessionStore::new(store.clone()));
        session_store.insert_new("ALICE", "BOB::bob-dev", alice_initiator_holder()).await;

        let vault = VaultClient::new(store.clone(), transport.clone(), CoreConfig::default());
        let backup = BackupClient::new(store.clone(), transport.clone());
        let outbox = Outbox::new(store.clone(), session_store, vault, backup, transport.clone(), CoreConfig::default());

        *transport.reject_next_send_with_counter_too_low.lock().unwrap() = None;
        // Force a transport-level error by swapping in a counter-too-low
        // rejection repeated past the repair budget is out of scope here;
        // instead directly exercise the persisted-queue path.
        outbox
            .enqueue_job(
                "ALICE",
                "BOB::bob-dev",
                "msg1",
                &sample_envelope(),
                &sample_vault_entry(),
            )
            .await
            .unwrap();

        outbox.flush_pending("ALICE").await.unwrap();
        assert_eq!(transport.received.lock().unwrap().len(), 1);
        cleanup(&db_path);
    }

    /// Scenario 4: a `CounterTooLow` rejection is repaired under a new
    /// message id rather than retried as-is.
    #[tokio::test]
    async fn counter_too_low_is_repaired_with_a_new_message_id() {
        let (store, db_path) = open_test_store(24).await;
        let transport = Arc::new(FakeTransport::default());
        let session_store = Arc::new(SessionStore::new(store.clone()));
        session_store.insert_new("ALICE", "BOB::bob-dev", alice_initiator_holder()).await;

        let vault = VaultClient::new(store.clone(), transport.clone(), CoreConfig::default());
        let backup = BackupClient::new(store.clone(), transport.clone());
        let outbox = Outbox::new(store.clone(), session_store.clone(), vault, backup, transport.clone(), CoreConfig::default());

        *transport.reject_next_send_with_counter_too_low.lock().unwrap() = Some(7);
        *transport.send_state_expected_counter.lock().unwrap() = Some(7);

        let outcome = outbox
            .send("ALICE", "alice-dev", "BOB", "bob-dev", MessageContent::Text { body: "hi".into() })
            .await
            .unwrap();

        let (original_message_id, new_message_id, expected_counter) = match outcome {
            SendOutcome::Replaced { original_message_id, new_message_id, expected_counter } => {
                (original_message_id, new_message_id, expected_counter)
            }
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_ne!(original_message_id, new_message_id);
        assert_eq!(expected_counter, 7);

        // Only the repaired message ever reaches the relay.
        let received = transport.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].vault_entry.message_id, new_message_id);

        let holder = session_store.dr_state("ALICE", "BOB::bob-dev").await.unwrap();
        assert_eq!(holder.ns_total, 7);

        cleanup(&db_path);
    }

    fn sample_envelope() -> MessageEnvelope {
        MessageEnvelope {
            header: EnvelopeHeader {
                ek_pub_b64: "AAAA".into(),
                n: 0,
                pn: 0,
                device_id: "alice-dev".into(),
                meta: EnvelopeMeta {
                    ts: 1000,
                    sender_digest: "ALICE".into(),
                    sender_device_id: "alice-dev".into(),
                    target_digest: "BOB".into(),
                    target_device_id: "bob-dev".into(),
                    msg_type: rc_proto::WireMsgType::Text,
                    transport_counter: 0,
                },
            },
            ciphertext_b64: "AAAA".into(),
            iv_b64: "AAAA".into(),
        }
    }

    fn sample_vault_entry() -> VaultEntry {
        VaultEntry {
            conversation_id: "conv1".into(),
            message_id: "msg1".into(),
            sender_device_id: "alice-dev".into(),
            target_device_id: "bob-dev".into(),
            direction: VaultDirection::Outgoing,
            header_counter: 0,
            wrapped_mk: "AAAA".into(),
            wrap_context: "ctx".into(),
            dr_state: None,
        }
    }
}
