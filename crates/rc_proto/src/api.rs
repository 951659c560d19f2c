//! Request/response DTOs for the transport-facing endpoints this core talks
//! to. The transport itself (HTTP plumbing, websocket framing) is out of
//! scope — these types are what `rc_session::transport::Transport` sends and
//! receives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::MessageEnvelope;
use crate::invite::{ContactShare, Invite, SealedEnvelope};
use crate::vault_entry::{LatestState, VaultEntry};

// ── Message relay ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SendRequest {
    pub envelope: MessageEnvelope,
    pub vault_entry: VaultEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupPutRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_counter: Option<u64>,
}

/// §4.7/§6 send-state probe: what the relay expects next for this sender
/// device, used to repair a `CounterTooLow` rejection.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendStateRequest {
    pub conversation_id: String,
    pub sender_device_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendStateResponse {
    pub expected_counter: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSecureMessagesRequest {
    pub conversation_id: String,
    pub sender_device_id: String,
    /// Oldest-first page cursor; absent on the first page of a catch-up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_counter: Option<u64>,
    pub limit: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSecureMessagesResponse {
    pub envelopes: Vec<MessageEnvelope>,
    pub has_more: bool,
}

// ── Key-vault client (C8) ────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultPutRequest {
    #[serde(flatten)]
    pub entry: VaultEntry,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultGetRequest {
    pub conversation_id: String,
    pub sender_device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_counter: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultGetResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<VaultEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorCode>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultCountRequest {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultCountResponse {
    pub count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultLatestStateRequest {
    pub conversation_id: String,
    pub sender_device_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultLatestStateResponse {
    pub state: LatestState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultDeleteRequest {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_device_id: String,
}

// ── Contact-secrets backup (C10) ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPutRequest {
    pub blob_b64: String,
    pub nonce_b64: String,
    pub snapshot_version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupGetResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BackupPutRequest>,
    pub updated_at: DateTime<Utc>,
}

// ── Invite dropbox (C6) ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesCreateRequest {
    pub owner_account_digest: String,
    pub owner_device_id: String,
    pub owner_bundle: rc_crypto::x3dh::PrekeyBundle,
    pub ttl_secs: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesCreateResponse {
    pub invite: Invite,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesDeliverRequest {
    pub envelope: SealedEnvelope,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesDeliverResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorCode>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesConsumeRequest {
    pub invite_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesConsumeResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<SealedEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorCode>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesConfirmRequest {
    pub invite_id: String,
    pub contact_share: ContactShare,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesStatusRequest {
    pub invite_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesStatusResponse {
    pub invite: Invite,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesLookupCodeRequest {
    pub pairing_code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvitesLookupCodeResponse {
    pub invite: Invite,
}

// ── Common ───────────────────────────────────────────────────────────────────

/// Error codes named explicitly on the wire; every other failure surfaces as
/// a transport-level error outside this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ApiErrorCode {
    NotFound,
    AlreadyConsumed,
    Expired,
    CounterTooLow,
    VaultPrepFailed,
    VaultPutFailed,
}
