//! rc_session — local encrypted state and the session-level protocols built
//! on top of it: device bundles, the Double Ratchet session store, the
//! outbox, the receive pipeline, the key-vault client, the invite dropbox,
//! and contact-secrets backup.
//!
//! # Encryption strategy
//! SQLite does not natively encrypt. Application-level encryption covers it
//! instead: each account's state is a handful of single-row blob tables
//! (`db::BlobTable`), and every blob is XChaCha20-Poly1305-sealed under the
//! process-wide master key (`master_key::MasterKeyGuard`) before it touches
//! disk. The master key itself is derived from the user's password via
//! Argon2id and held in memory only while the session is unlocked.
//!
//! # Migrations
//! SQLx migrations in `migrations/` run automatically on `db::Store::open`.

pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod invite_dropbox;
pub mod master_key;
pub mod models;
pub mod outbox;
pub mod receive_pipeline;
pub mod session_store;
pub mod transport;
pub mod vault_client;

pub use backup::BackupClient;
pub use config::CoreConfig;
pub use db::{BlobTable, Store};
pub use error::SessionError;
pub use invite_dropbox::InviteDropbox;
pub use master_key::{new_master_salt, MasterKeyGuard};
pub use outbox::{Outbox, SendOutcome};
pub use receive_pipeline::ReceivePipeline;
pub use session_store::SessionStore;
pub use transport::Transport;
pub use vault_client::VaultClient;
