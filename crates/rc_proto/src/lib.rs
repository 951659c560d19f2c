//! rc_proto — wire types and serialisation for the secure messaging core.
//!
//! All on-wire types are plain serde JSON, versioned where the payload
//! itself carries a `v` field (invites) rather than via transport framing.
//!
//! # Modules
//! - `envelope`       — encrypted message envelope (what the relay sees)
//! - `message`        — plaintext payload carried inside the envelope
//! - `vault_entry`    — key-vault client payloads (C8)
//! - `invite`         — invite dropbox sealed-envelope payloads (C6)
//! - `contact_secret` — per-peer contact-secrets backup record (C10)
//! - `api`            — request/response DTOs for every external endpoint
//! - `error`          — wire-level error type

pub mod api;
pub mod contact_secret;
pub mod envelope;
pub mod error;
pub mod invite;
pub mod message;
pub mod vault_entry;

pub use contact_secret::{ContactSecret, ConversationRole};
pub use envelope::{EnvelopeHeader, EnvelopeMeta, MessageEnvelope, WireMsgType};
pub use error::ProtoError;
pub use invite::{ContactInit, ContactShare, Invite, InviteState, SealedEnvelope};
pub use message::{MessageContent, PlaintextPayload};
pub use vault_entry::{LatestState, VaultDirection, VaultEntry};
