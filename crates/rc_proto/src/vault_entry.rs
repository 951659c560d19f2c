//! Key-vault payloads (C8) — the wrapped per-message key plus enough routing
//! metadata for the server to index it by conversation/device/counter.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultDirection {
    Outgoing,
    Incoming,
}

/// `wrapped_mk` is the per-message key sealed with AEAD under the local
/// master key; `wrap_context` records the exact AAD bytes used so the
/// unwrap side can reject a key sealed under a mismatched context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEntry {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_device_id: String,
    pub target_device_id: String,
    pub direction: VaultDirection,
    pub header_counter: u64,
    pub wrapped_mk: String,
    pub wrap_context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dr_state: Option<String>,
}

impl VaultEntry {
    /// The canonical AAD string used when sealing `wrapped_mk`: binds the
    /// wrapped key to the exact conversation, message, and direction it was
    /// produced for, so it can never be replayed into a different context.
    pub fn wrap_context_for(conversation_id: &str, message_id: &str, direction: VaultDirection) -> String {
        format!("{conversation_id}:{message_id}:{direction:?}")
    }
}

/// `latestState` response — highest accepted counter per direction, used by
/// the receive pipeline to compute `localMax`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestState {
    pub conversation_id: String,
    pub sender_device_id: String,
    pub highest_outgoing_counter: Option<u64>,
    pub highest_incoming_counter: Option<u64>,
}
