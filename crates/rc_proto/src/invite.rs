//! Invite dropbox payloads (C6) — sealed-envelope pairing between an owner
//! publishing a prekey bundle and a guest delivering `contact-init` while
//! the owner is offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rc_crypto::x3dh::{PrekeyBundle, X3DHHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteState {
    Pending,
    Delivered,
    Consumed,
    Expired,
}

/// Owner-created invite record. `pairing_code` is six ASCII digits, good for
/// 10 minutes; `invite_id` is the opaque identifier embedded in a QR payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub invite_id: String,
    pub pairing_code: String,
    pub owner_account_digest: String,
    pub owner_device_id: String,
    pub owner_bundle: PrekeyBundle,
    pub expires_at: DateTime<Utc>,
    pub state: InviteState,
}

/// Guest → owner: the plaintext the guest seals into a [`SealedEnvelope`]
/// and delivers to the dropbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactInit {
    pub v: u8,
    #[serde(rename = "type")]
    pub kind: String,
    pub guest_account_digest: String,
    pub guest_device_id: String,
    pub guest_bundle: PrekeyBundle,
    pub guest_profile: GuestProfile,
    /// The X3DH init header the guest computed against the owner's published
    /// bundle — carries the guest's ephemeral `ekPub` and the owner `opkId`
    /// consumed, neither of which belongs on `guest_bundle` (that's the
    /// guest's own long-term publishable bundle, unrelated to this handshake).
    pub x3dh_header: X3DHHeader,
}

impl ContactInit {
    pub fn new(
        guest_account_digest: String,
        guest_device_id: String,
        guest_bundle: PrekeyBundle,
        guest_profile: GuestProfile,
        x3dh_header: X3DHHeader,
    ) -> Self {
        Self {
            v: 1,
            kind: "contact-init".to_string(),
            guest_account_digest,
            guest_device_id,
            guest_bundle,
            guest_profile,
            x3dh_header,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestProfile {
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

/// Owner → guest, sent back over the newly-live DR session rather than
/// through the dropbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactShare {
    pub v: u8,
    #[serde(rename = "type")]
    pub kind: String,
    pub owner_account_digest: String,
    pub owner_device_id: String,
    pub owner_profile: GuestProfile,
}

/// A fixed-construction AEAD envelope: per-envelope ephemeral sender key,
/// the recipient's static public key, a domain-separated info tag. Replay
/// of the same `envelope_id` at consume time must be idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub envelope_id: String,
    pub invite_id: String,
    pub ephemeral_sender_pub_b64: String,
    pub ciphertext_b64: String,
    pub nonce_b64: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_init_carries_fixed_version_and_type_tag() {
        let bundle = PrekeyBundle {
            account_digest: "GUEST".into(),
            device_id: "guest-dev".into(),
            ik_pub: "ik".into(),
            spk_pub: "spk".into(),
            spk_sig: "sig".into(),
            opk_pub: None,
            opk_id: None,
        };
        let init = ContactInit::new(
            "GUEST".into(),
            "guest-dev".into(),
            bundle,
            GuestProfile { display_name: "Guest".into(), avatar_ref: None },
            X3DHHeader {
                session_id: "sess1".into(),
                sender_account_digest: "GUEST".into(),
                sender_device_id: "guest-dev".into(),
                ik_pub: "ik".into(),
                ek_pub: "ek".into(),
                opk_id: None,
            },
        );
        assert_eq!(init.v, 1);
        assert_eq!(init.kind, "contact-init");
    }
}
