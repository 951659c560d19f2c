//! SQLite-backed blob store.
//!
//! Four single-row-per-account tables hold the at-rest state (`§6`); each
//! higher-level module (`session_store`, `outbox`, `vault_client`) reads and
//! rewrites its whole blob rather than doing fine-grained row updates — the
//! data is small (one account's worth of contacts/jobs) and this keeps the
//! encrypt/decrypt boundary in exactly one place.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use crate::{error::SessionError, master_key::MasterKeyGuard};

#[derive(Clone, Copy, Debug)]
pub enum BlobTable {
    DeviceBundle,
    ContactSecrets,
    OutboxQueue,
    PendingVaultPutQueue,
    InviteDeliveryIntents,
    ProcessedMessages,
}

impl BlobTable {
    fn table_name(self) -> &'static str {
        match self {
            BlobTable::DeviceBundle => "device_bundle",
            BlobTable::ContactSecrets => "contact_secrets",
            BlobTable::OutboxQueue => "outbox_queue",
            BlobTable::PendingVaultPutQueue => "pending_vault_put_queue",
            BlobTable::InviteDeliveryIntents => "invite_delivery_intents",
            BlobTable::ProcessedMessages => "processed_messages",
        }
    }
}

/// Central store handle. Cheap to clone (pool is `Arc` internally).
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    pub master_key: MasterKeyGuard,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path` and run all
    /// pending migrations.
    ///
    /// WAL journal mode and foreign-key enforcement are configured at
    /// connection time here — NOT inside a migration, because SQLite
    /// forbids changing `journal_mode` inside a transaction and sqlx wraps
    /// every migration in one (this produced SQLITE_ERROR code 1 on first
    /// open when tried the other way).
    pub async fn open(db_path: &Path, master_key: MasterKeyGuard) -> Result<Self, SessionError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| SessionError::Migration(e.to_string()))?;

        Ok(Self { pool, master_key })
    }

    // ── Blob encrypt/decrypt ─────────────────────────────────────────────────

    pub async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, SessionError> {
        self.master_key
            .with_key(|key| {
                let ct = rc_crypto::aead::encrypt(key, plaintext, b"rc-session-blob-v1").map_err(SessionError::Crypto)?;
                Ok(base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &ct))
            })
            .await
    }

    pub async fn decrypt_value(&self, b64: &str) -> Result<Vec<u8>, SessionError> {
        let ct = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, b64)
            .map_err(|e| SessionError::Crypto(rc_crypto::CryptoError::Base64Decode(e)))?;
        self.master_key
            .with_key(|key| {
                let pt = rc_crypto::aead::decrypt(key, &ct, b"rc-session-blob-v1").map_err(SessionError::Crypto)?;
                Ok(pt.to_vec())
            })
            .await
    }

    // ── Generic per-account blob access ──────────────────────────────────────

    /// Fetch and decrypt the blob for `account_digest`, or `None` if absent.
    pub async fn read_blob(&self, table: BlobTable, account_digest: &str) -> Result<Option<Vec<u8>>, SessionError> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT blob_enc FROM {} WHERE account_digest = ?",
            table.table_name()
        ))
        .bind(account_digest)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((blob_enc,)) => Ok(Some(self.decrypt_value(&blob_enc).await?)),
            None => Ok(None),
        }
    }

    /// Encrypt and upsert the blob for `account_digest`.
    pub async fn write_blob(&self, table: BlobTable, account_digest: &str, plaintext: &[u8]) -> Result<(), SessionError> {
        let blob_enc = self.encrypt_value(plaintext).await?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(&format!(
            "INSERT INTO {} (account_digest, blob_enc, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(account_digest) DO UPDATE SET blob_enc = excluded.blob_enc, updated_at = excluded.updated_at",
            table.table_name()
        ))
        .bind(account_digest)
        .bind(blob_enc)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Quarantine a corrupt contact-secrets snapshot for a given peer key.
    pub async fn quarantine_snapshot(&self, account_digest: &str, peer_key: &str, reason: &str, raw: &str) -> Result<(), SessionError> {
        sqlx::query(
            "INSERT INTO quarantined_snapshots (id, account_digest, peer_key, reason, raw_snapshot, quarantined_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_digest)
        .bind(peer_key)
        .bind(reason)
        .bind(raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_key::MasterKeyGuard;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_test_store() -> (Store, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/rc-session-test-{}.db", Uuid::new_v4()));
        let master_key = MasterKeyGuard::new();
        master_key.unlock_with_key([3u8; 32], 1800).await;
        let store = Store::open(&db_path, master_key).await.expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: &PathBuf) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn write_then_read_blob_round_trips() {
        let (store, db_path) = open_test_store().await;
        store.write_blob(BlobTable::ContactSecrets, "ALICE", b"{\"hello\":1}").await.unwrap();
        let got = store.read_blob(BlobTable::ContactSecrets, "ALICE").await.unwrap();
        assert_eq!(got.unwrap(), b"{\"hello\":1}");
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn write_blob_upserts_on_conflict() {
        let (store, db_path) = open_test_store().await;
        store.write_blob(BlobTable::OutboxQueue, "ALICE", b"v1").await.unwrap();
        store.write_blob(BlobTable::OutboxQueue, "ALICE", b"v2").await.unwrap();
        let got = store.read_blob(BlobTable::OutboxQueue, "ALICE").await.unwrap();
        assert_eq!(got.unwrap(), b"v2");
        cleanup(&db_path);
    }

    #[tokio::test]
    async fn missing_blob_reads_as_none() {
        let (store, db_path) = open_test_store().await;
        let got = store.read_blob(BlobTable::DeviceBundle, "NOBODY").await.unwrap();
        assert!(got.is_none());
        cleanup(&db_path);
    }
}
