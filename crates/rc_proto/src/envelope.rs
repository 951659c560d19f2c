//! On-wire message envelope.
//!
//! The transport is a dumb relay: it only ever sees `header` (routing +
//! ratchet bookkeeping, not plaintext) and the two opaque ciphertext/iv
//! fields. `header.meta` carries the routing digests and timestamp the
//! relay needs; it never carries plaintext or key material.

use serde::{Deserialize, Serialize};

/// Tagged message type, carried on the wire as `meta.msgType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireMsgType {
    Text,
    Media,
    ContactShare,
    CallLog,
    ConversationDeleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    /// Unix seconds.
    pub ts: i64,
    pub sender_digest: String,
    pub sender_device_id: String,
    pub target_digest: String,
    pub target_device_id: String,
    #[serde(rename = "msgType")]
    pub msg_type: WireMsgType,
    /// The sender's transport-wide send counter (`NsTotal - 1`) for this
    /// message. Distinct from `header.n`, which is the per-chain ratchet
    /// counter and resets on every DH ratchet step — the receive pipeline's
    /// live/catch-up/stale dispatch needs a counter that never resets, and
    /// the same value is what `outbox` already records as the vault
    /// entry's `header_counter`.
    pub transport_counter: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub ek_pub_b64: String,
    pub n: u32,
    pub pn: u32,
    pub device_id: String,
    pub meta: EnvelopeMeta,
}

/// `{header, ciphertext_b64, iv_b64}` — the full wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub header: EnvelopeHeader,
    pub ciphertext_b64: String,
    pub iv_b64: String,
}

impl MessageEnvelope {
    /// AEAD associated data: canonical UTF-8 JSON of `header` with object
    /// keys in lexicographic order, followed by the raw iv bytes. Both
    /// sender and receiver must compute byte-identical AAD or the AEAD tag
    /// will not verify — this is not a hash, it's the literal bytes fed to
    /// the cipher, so header field order is load-bearing.
    pub fn canonical_aad(header: &EnvelopeHeader, iv: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
        // serde_json's `Map` is BTreeMap-backed unless the `preserve_order`
        // feature is enabled (it is not, here), so round-tripping through
        // `Value` gives us lexicographically sorted keys for free.
        let value = serde_json::to_value(header)?;
        let mut aad = serde_json::to_vec(&value)?;
        aad.extend_from_slice(iv);
        Ok(aad)
    }

    pub fn aad(&self) -> Result<Vec<u8>, serde_json::Error> {
        let iv = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &self.iv_b64)
            .unwrap_or_default();
        Self::canonical_aad(&self.header, &iv)
    }
}
