//! Error kinds this core raises, and how each one propagates and surfaces
//! to callers.
//!
//! No error variant here recovers silently: every one of them aborts the
//! operation that raised it. Retry/repair (CounterTooLow, pending-vault-put
//! backoff) happens one layer up, in the outbox/vault-client loops, by
//! constructing fresh work — never by retrying the same call in place.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("master key is locked")]
    MasterKeyLocked,

    #[error("crypto error: {0}")]
    Crypto(#[from] rc_crypto::CryptoError),

    #[error("protocol error: {0}")]
    Proto(#[from] rc_proto::ProtoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// Self or peer digest/device id cannot be resolved.
    #[error("missing identity for peer key {0}")]
    MissingIdentity(String),

    /// No holder and no snapshot for this peer key.
    #[error("no session for peer key {0}")]
    SessionMissing(String),

    /// Snapshot fields malformed; the peer key has been quarantined.
    #[error("session state for peer key {0} is corrupt: {1}")]
    SessionCorrupt(String, String),

    /// `header.n < Nr` with no matching skipped key.
    #[error("counter replay or gap on peer key {0}")]
    CounterReplayOrGap(String),

    /// Server kept rejecting with `CounterTooLow` until the repair budget
    /// ran out — the message was never delivered under any id. A rejection
    /// that repairs successfully surfaces as `SendOutcome::Replaced`, not
    /// this variant.
    #[error("server still expects counter >= {expected} on peer key {peer_key} after repair attempts")]
    CounterTooLow { peer_key: String, expected: u64 },

    /// Skipped-key window exceeded; session must be reseeded.
    #[error("too many skipped messages on peer key {peer_key} (limit {limit})")]
    TooManySkipped { peer_key: String, limit: u32 },

    /// AEAD tag mismatch. Never retried.
    #[error("decrypt authentication failed for message {0}")]
    DecryptAuthFail(String),

    #[error("vault prep failed for message {0}: {1}")]
    VaultPrepFailed(String, String),

    #[error("vault put failed for message {0}: {1}")]
    VaultPutFailed(String, String),

    #[error("transport timed out sending message {0}")]
    TransportTimeout(String),

    #[error("invite {0} has expired")]
    InviteExpired(String),

    #[error("invite {0} was already consumed")]
    AlreadyConsumed(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl SessionError {
    /// Short, non-sensitive message fit for a UI toast. Never includes key
    /// material, plaintext, or full conversation ids.
    pub fn user_visible(&self) -> &'static str {
        match self {
            SessionError::MissingIdentity(_) => "needs re-login",
            SessionError::SessionMissing(_) => "please re-sync this contact",
            SessionError::SessionCorrupt(_, _) => "session state is corrupt, re-invite required",
            SessionError::CounterReplayOrGap(_) => "",
            SessionError::CounterTooLow { .. } => "send failed, please retry",
            SessionError::TooManySkipped { .. } => "connection out of sync, please refresh",
            SessionError::DecryptAuthFail(_) => "",
            SessionError::VaultPrepFailed(_, _) | SessionError::VaultPutFailed(_, _) => {
                "send failed, please retry"
            }
            SessionError::TransportTimeout(_) => "send failed, please retry",
            SessionError::InviteExpired(_) | SessionError::AlreadyConsumed(_) => {
                "please generate a new invite"
            }
            _ => "something went wrong",
        }
    }
}
