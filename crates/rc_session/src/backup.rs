//! C10 — contact-secrets backup.
//!
//! The whole `contact_secrets` blob is sealed under the master key and
//! shipped as one opaque document, same shape as every other at-rest blob;
//! the only addition here is a distinct AAD tag so a backup blob can never
//! be replayed into the local-only blob tables and vice versa, and a
//! `snapshot_version` so an upload can assert happens-before on download.

use rc_crypto::aead;
use rc_proto::api::BackupPutRequest;

use crate::db::{BlobTable, Store};
use crate::error::SessionError;
use crate::models::ContactSecretsBlob;
use crate::transport::Transport;
use std::sync::Arc;

const BACKUP_AAD: &[u8] = b"rc-backup-blob-v1";

pub struct BackupClient {
    store: Store,
    transport: Arc<dyn Transport>,
}

impl BackupClient {
    pub fn new(store: Store, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    /// Seal the current `contact_secrets` blob for `account_digest` under
    /// the backup AAD. Returns `None` if there is nothing to back up yet.
    pub async fn build_attachment(&self, account_digest: &str) -> Result<Option<BackupPutRequest>, SessionError> {
        let Some(plaintext) = self.store.read_blob(BlobTable::ContactSecrets, account_digest).await? else {
            return Ok(None);
        };
        let blob: ContactSecretsBlob = serde_json::from_slice(&plaintext)?;
        Ok(Some(self.seal(&plaintext, blob.snapshot_version).await?))
    }

    /// Explicit upload outside the outbox piggyback path.
    pub async fn upload(&self, account_digest: &str) -> Result<(), SessionError> {
        let Some(req) = self.build_attachment(account_digest).await? else { return Ok(()) };
        self.transport.backup_put(req).await?;
        Ok(())
    }

    async fn seal(&self, plaintext: &[u8], snapshot_version: u64) -> Result<BackupPutRequest, SessionError> {
        self.store
            .master_key
            .with_key(|key| {
                let (nonce_b64, blob_b64) = aead::encrypt_split(key, plaintext, BACKUP_AAD).map_err(SessionError::Crypto)?;
                Ok(BackupPutRequest { blob_b64, nonce_b64, snapshot_version })
            })
            .await
    }

    /// Download the remote backup (if any), merge every peer record by
    /// `updated_at` against the local blob, and persist the merged result.
    /// Never advances ratchet state itself — `dr_state` is carried opaquely
    /// and subject to the same downgrade rules the next time it is loaded
    /// through `SessionStore::hydrate`.
    pub async fn hydrate(&self, account_digest: &str) -> Result<(), SessionError> {
        let resp = self.transport.backup_get().await?;
        let Some(remote) = resp.blob else { return Ok(()) };

        let plaintext = self
            .store
            .master_key
            .with_key(|key| {
                aead::decrypt_split(key, &remote.nonce_b64, &remote.blob_b64, BACKUP_AAD)
                    .map(|pt| pt.to_vec())
                    .map_err(SessionError::Crypto)
            })
            .await?;
        let remote_blob: ContactSecretsBlob = serde_json::from_slice(&plaintext)?;

        let mut local_blob = match self.store.read_blob(BlobTable::ContactSecrets, account_digest).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => ContactSecretsBlob::default(),
        };

        for (peer_key, remote_secret) in remote_blob.peers {
            match local_blob.peers.remove(&peer_key) {
                Some(local_secret) => {
                    local_blob.peers.insert(peer_key, local_secret.merge_newer(remote_secret));
                }
                None => {
                    local_blob.peers.insert(peer_key, remote_secret);
                }
            }
        }
        local_blob.snapshot_version = local_blob.snapshot_version.max(remote_blob.snapshot_version) + 1;

        self.store.write_blob(BlobTable::ContactSecrets, account_digest, &serde_json::to_vec(&local_blob)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_key::MasterKeyGuard;
    use crate::transport::fake::FakeTransport;
    use chrono::Utc;
    use rc_proto::{ContactSecret, ConversationRole};
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_test_store() -> (Store, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/rc-backup-test-{}.db", Uuid::new_v4()));
        let master_key = MasterKeyGuard::new();
        master_key.unlock_with_key([5u8; 32], 1800).await;
        let store = Store::open(&db_path, master_key).await.expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: &PathBuf) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    fn secret(token: &str) -> ContactSecret {
        ContactSecret {
            role: ConversationRole::Initiator,
            conversation_token: token.into(),
            conversation_id: "conv1".into(),
            conversation_dr_init: None,
            dr_state: None,
            nickname: None,
            avatar: None,
            peer_device_id: "bob-dev".into(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn build_attachment_is_none_with_no_contacts() {
        let (store, db_path) = open_test_store().await;
        let transport = Arc::new(FakeTransport::default());
        let client = BackupClient::new(store, transport);
        assert!(client.build_attachment("ALICE").await.unwrap().is_none());
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn upload_then_hydrate_round_trips_into_fresh_account() {
        let (store, db_path) = open_test_store().await;
        let transport = Arc::new(FakeTransport::default());

        let mut blob = ContactSecretsBlob::default();
        blob.peers.insert("ALICE::BOB::bob-dev".into(), secret("a"));
        store.write_blob(BlobTable::ContactSecrets, "ALICE", &serde_json::to_vec(&blob).unwrap()).await.unwrap();

        let client = BackupClient::new(store.clone(), transport.clone());
        client.upload("ALICE").await.unwrap();
        assert!(transport.backup.lock().unwrap().is_some());

        // A second account restoring from the same backup should pick up
        // the peer record with no prior local state.
        client.hydrate("CAROL").await.unwrap();
        let restored: ContactSecretsBlob =
            serde_json::from_slice(&store.read_blob(BlobTable::ContactSecrets, "CAROL").await.unwrap().unwrap()).unwrap();
        assert_eq!(restored.peers.get("ALICE::BOB::bob-dev").unwrap().conversation_token, "a");
        cleanup(&db_path);
    }
}
