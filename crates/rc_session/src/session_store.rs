//! C5 — in-memory `peerKey -> RatchetHolder` map with downgrade-resistant
//! persistence into the `contact_secrets` blob.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use rc_crypto::ratchet::{RatchetHolder, RatchetRole};
use rc_proto::{ContactSecret, ConversationRole};

use crate::db::{BlobTable, Store};
use crate::error::SessionError;
use crate::models::ContactSecretsBlob;

/// The peer-identity key form, `"<digest>::<deviceId>"`. Every caller
/// that reaches into `SessionStore` from outside this module (outbox,
/// receive pipeline, invite dropbox) identifies a session by local account
/// digest plus this composite peer identity — never by the peer digest
/// alone, since a digest with no device id is not a valid session key.
pub(crate) fn peer_key(account_digest: &str, device_id: &str) -> String {
    format!("{account_digest}::{device_id}")
}

/// Fields a valid `RatchetHolder` snapshot must carry. A snapshot missing
/// any of these is quarantined rather than partially hydrated.
const REQUIRED_SNAPSHOT_FIELDS: &[&str] =
    &["rk", "my_ratchet_priv", "my_ratchet_pub", "ns_total", "nr_total", "role", "self_device_id"];

pub struct SessionStore {
    store: Store,
    holders: Arc<RwLock<HashMap<String, RatchetHolder>>>,
}

impl SessionStore {
    pub fn new(store: Store) -> Self {
        Self { store, holders: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Canonical accessor: the holder returned here is the one all writers
    /// must mutate and re-commit through `commit`. Cloning it for a read is
    /// fine; mutating a clone and forgetting to `commit` just loses the
    /// write, it cannot corrupt the canonical state.
    pub async fn dr_state(&self, account_digest: &str, device_id: &str) -> Option<RatchetHolder> {
        let key = peer_key(account_digest, device_id);
        self.holders.read().await.get(&key).map(clone_holder)
    }

    /// Insert a freshly-born holder (X3DH success). Always accepted — there
    /// is no prior state to downgrade.
    pub async fn insert_new(&self, account_digest: &str, device_id: &str, holder: RatchetHolder) {
        let key = peer_key(account_digest, device_id);
        self.holders.write().await.insert(key, holder);
    }

    /// Commit a mutated holder back to the canonical map and persist a
    /// snapshot, applying the downgrade rules from the session store design
    /// against whatever is already on disk for this peer. Returns `false`
    /// (without error) if the write was skipped as a downgrade — both the
    /// in-memory map and the on-disk blob are then left untouched, so a
    /// rejected write never partially applies.
    pub async fn commit(&self, account_digest: &str, device_id: &str, holder: RatchetHolder) -> Result<bool, SessionError> {
        let key = peer_key(account_digest, device_id);
        if !self.persist_snapshot(account_digest, &key, &holder).await? {
            return Ok(false);
        }
        self.holders.write().await.insert(key, holder);
        Ok(true)
    }

    async fn persist_snapshot(&self, account_digest: &str, peer_key: &str, holder: &RatchetHolder) -> Result<bool, SessionError> {
        let mut blob = self.load_blob(account_digest).await?;

        let snapshot_json = serde_json::to_string(holder)?;
        if let Some(existing) = blob.peers.get(peer_key).and_then(|c| c.dr_state.as_deref()) {
            if let Ok(existing_holder) = decode_and_validate(existing) {
                if !accepts_incoming(&existing_holder, holder) {
                    warn!(peer_key, "rejecting downgrade snapshot write");
                    return Ok(false);
                }
            }
        }

        let entry = blob.peers.entry(peer_key.to_string()).or_insert_with(|| ContactSecret {
            role: match holder.role {
                RatchetRole::Initiator => ConversationRole::Initiator,
                RatchetRole::Responder => ConversationRole::Responder,
            },
            conversation_token: String::new(),
            conversation_id: holder.conversation_id.clone(),
            conversation_dr_init: None,
            dr_state: None,
            nickname: None,
            avatar: None,
            peer_device_id: device_id_suffix(peer_key),
            updated_at: holder.updated_at,
        });
        entry.dr_state = Some(snapshot_json);
        entry.updated_at = holder.updated_at;
        blob.snapshot_version += 1;

        self.store.write_blob(BlobTable::ContactSecrets, account_digest, &serde_json::to_vec(&blob)?).await?;
        Ok(true)
    }

    /// Hydrate every holder for `account_digest` from the persisted blob.
    /// Corrupt snapshots are quarantined and excluded; re-pairing is
    /// required for those peers.
    pub async fn hydrate(&self, account_digest: &str) -> Result<(), SessionError> {
        let blob = self.load_blob(account_digest).await?;
        let mut holders = self.holders.write().await;
        for (peer_key, secret) in blob.peers.iter() {
            let Some(raw) = secret.dr_state.as_deref() else { continue };
            match decode_and_validate(raw) {
                Ok(holder) => {
                    holders.insert(peer_key.clone(), holder);
                }
                Err(reason) => {
                    warn!(peer_key, reason, "quarantining corrupt session snapshot");
                    self.store.quarantine_snapshot(account_digest, peer_key, &reason, raw).await?;
                }
            }
        }
        Ok(())
    }

    async fn load_blob(&self, account_digest: &str) -> Result<ContactSecretsBlob, SessionError> {
        match self.store.read_blob(BlobTable::ContactSecrets, account_digest).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ContactSecretsBlob::default()),
        }
    }
}

fn device_id_suffix(peer_key: &str) -> String {
    peer_key.rsplit("::").next().unwrap_or_default().to_string()
}

/// `RatchetHolder` has no `Clone` derive (it zeroizes key material on drop
/// and deliberately discourages incidental copies); round-trip through JSON
/// to get an independent value for reads that must outlive the map guard.
fn clone_holder(holder: &RatchetHolder) -> RatchetHolder {
    let json = serde_json::to_vec(holder).expect("RatchetHolder always serializes");
    serde_json::from_slice(&json).expect("a just-serialized holder always round-trips")
}

/// Parse and structurally validate a snapshot before trusting it as a
/// `RatchetHolder`. Missing required fields or malformed base64 members are
/// treated identically: the snapshot is rejected with a reason string.
fn decode_and_validate(raw: &str) -> Result<RatchetHolder, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| format!("invalid json: {e}"))?;
    let obj = value.as_object().ok_or("snapshot is not a JSON object")?;
    for field in REQUIRED_SNAPSHOT_FIELDS {
        if !obj.contains_key(*field) {
            return Err(format!("missing required field {field}"));
        }
    }
    serde_json::from_value(value).map_err(|e| format!("deserialize failed: {e}"))
}

/// Downgrade rules (§4.5): decide whether `incoming` may overwrite `existing`.
fn accepts_incoming(existing: &RatchetHolder, incoming: &RatchetHolder) -> bool {
    if existing.ck_s_present() && existing.ns > 0 {
        let existing_total = existing.ns_total + existing.ns;
        let incoming_total = incoming.ns_total + incoming.ns;
        if !incoming.ck_s_present() || incoming_total < existing_total {
            return false;
        }
    }
    if existing.ck_r_present() && !incoming.ck_r_present() {
        return false;
    }
    if existing.role != incoming.role {
        return false;
    }
    if existing.self_device_id != incoming.self_device_id {
        return false;
    }
    incoming.updated_at >= existing.updated_at
}
