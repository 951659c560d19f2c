//! Plaintext message payload — what the ratchet's `mk` actually encrypts.
//!
//! The envelope header the relay sees is wire-format (`envelope.rs`); this is
//! the payload underneath, decrypted client-side after `drDecrypt`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::WireMsgType;

/// Deserialised plaintext carried inside a [`crate::envelope::MessageEnvelope`]
/// ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaintextPayload {
    /// Protocol version (currently 1).
    pub version: u8,
    /// Deterministic message ID (BLAKE3 of content + metadata).
    pub message_id: String,
    pub content: MessageContent,
    pub sent_at: DateTime<Utc>,
    pub sender_account_digest: String,
    pub sender_device_id: String,
}

impl PlaintextPayload {
    pub fn wire_msg_type(&self) -> WireMsgType {
        self.content.wire_msg_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        filename: String,
        mime_type: String,
        size_bytes: u64,
        /// Blake3 hash of the unencrypted content.
        content_hash: String,
        /// Opaque reference to the encrypted blob on the media store.
        storage_ref: String,
        /// 32-byte XChaCha20-Poly1305 key, base64, itself wrapped under `mk`.
        attachment_key: String,
    },
    ContactShare {
        account_digest: String,
        display_name: String,
    },
    CallLog {
        call_id: String,
        duration_secs: u32,
        missed: bool,
    },
    /// Tombstone for a locally-initiated conversation wipe; carries no
    /// recoverable content by design.
    ConversationDeleted,
    /// Client-local control message (e.g. typing state); never persisted by
    /// the receive pipeline, but still ratchet-encrypted like anything else.
    System {
        kind: String,
    },
}

impl MessageContent {
    pub fn wire_msg_type(&self) -> WireMsgType {
        match self {
            MessageContent::Text { .. } => WireMsgType::Text,
            MessageContent::Media { .. } => WireMsgType::Media,
            MessageContent::ContactShare { .. } => WireMsgType::ContactShare,
            MessageContent::CallLog { .. } => WireMsgType::CallLog,
            MessageContent::ConversationDeleted => WireMsgType::ConversationDeleted,
            // System messages ride under the same wire tag as Text; the
            // receive pipeline distinguishes them by `kind`, not by `msgType`.
            MessageContent::System { .. } => WireMsgType::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_msg_type_maps_each_variant() {
        assert_eq!(MessageContent::Text { body: "hi".into() }.wire_msg_type(), WireMsgType::Text);
        assert_eq!(
            MessageContent::CallLog { call_id: "c1".into(), duration_secs: 5, missed: false }.wire_msg_type(),
            WireMsgType::CallLog
        );
        assert_eq!(MessageContent::ConversationDeleted.wire_msg_type(), WireMsgType::ConversationDeleted);
    }
}
