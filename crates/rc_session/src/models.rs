//! Blob-content schemas: the plaintext JSON shape sealed inside each of the
//! four tables in `db.rs`. The persistence model is "one encrypted document
//! per account per concern", not a normalized message/session/contact schema.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rc_proto::ContactSecret;

/// `device_bundle` blob: this device's long-term identity + prekey material,
/// persisted so the prekey store survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBundleBlob {
    pub account_digest: String,
    pub device_id: String,
    /// Base64 Ed25519 identity secret key.
    pub identity_secret_b64: String,
    /// Base64 X25519 signed prekey secret.
    pub spk_secret_b64: String,
    pub spk_sig_b64: String,
    /// id -> base64 secret scalar, for unconsumed one-time prekeys.
    pub opks: HashMap<u64, String>,
    pub next_opk_id: u64,
    /// `inviteId -> opkId` for one-time prekeys already handed to a created
    /// invite but not yet consumed by `consume_and_respond` — excluded from
    /// the pool a new invite picks from, so the same OPK is never attached
    /// to two invites at once. The secret itself stays in `opks` until the
    /// invite is actually consumed.
    #[serde(default)]
    pub reserved_opks: HashMap<String, u64>,
}

/// `contact_secrets` blob: every peer's contact-secret record, keyed by
/// `"<digest>::<deviceId>"` peer key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactSecretsBlob {
    pub peers: HashMap<String, ContactSecret>,
    /// Bumped on every local write; carried through backup uploads as
    /// `snapshotVersion` so sends can assert a happens-before relationship.
    pub snapshot_version: u64,
}

/// `outbox_queue` blob: FIFO jobs per `(conversationId, senderDeviceId)`.
/// `envelope_json`/`vault_entry_json` are already sealed ciphertext before
/// this struct is serialized, matching the "entries are already ciphertext"
/// rule in the persisted-state layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxJobRecord {
    pub message_id: String,
    pub peer_key: String,
    pub envelope_json: String,
    pub vault_entry_json: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboxQueueBlob {
    pub jobs: Vec<OutboxJobRecord>,
}

/// `pending_vault_put_queue` blob: key-vault puts that failed and are
/// awaiting exponential-backoff retry, deduped by
/// `(conversationId, messageId, senderDeviceId)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingVaultPut {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_device_id: String,
    pub entry_json: String,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingVaultPutQueueBlob {
    pub pending: Vec<PendingVaultPut>,
}

impl PendingVaultPutQueueBlob {
    pub fn dedup_key(conversation_id: &str, message_id: &str, sender_device_id: &str) -> String {
        format!("{conversation_id}:{message_id}:{sender_device_id}")
    }

    pub fn upsert(&mut self, put: PendingVaultPut) {
        let key = Self::dedup_key(&put.conversation_id, &put.message_id, &put.sender_device_id);
        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|p| Self::dedup_key(&p.conversation_id, &p.message_id, &p.sender_device_id) == key)
        {
            *existing = put;
        } else {
            self.pending.push(put);
        }
    }
}

/// `invite_delivery_intents` blob: guest-side contact-init deliveries that
/// were persisted before the network call and may still need replaying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryIntentRecord {
    pub envelope_id: String,
    pub invite_id: String,
    pub conversation_id: String,
    pub sealed_envelope_json: String,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryIntentQueueBlob {
    pub intents: Vec<DeliveryIntentRecord>,
}

/// `processed_messages` blob: per-conversation dedup cache (bounded LRU of
/// recently-seen message ids) plus the `conversationClearAfter` tombstone
/// cutoff for conversations the user has wiped locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessedConversationState {
    /// Oldest-first; trimmed to the configured cache capacity on insert.
    pub recent_message_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessedMessagesBlob {
    pub conversations: HashMap<String, ProcessedConversationState>,
}
