//! C6 — invite dropbox. Lets a guest pair with an offline owner by sealing a
//! `ContactInit` and leaving it with the server until the owner next comes
//! online and consumes it.
//!
//! Two distinct AEAD layers are in play here and must not be confused: the
//! X3DH handshake embedded *inside* the sealed plaintext (which produces the
//! new session's `rk`), and the envelope seal itself (a one-off DH between a
//! fresh per-envelope ephemeral key and the recipient's identity key,
//! unrelated to the session being established).

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use rc_crypto::aead;
use rc_crypto::identity::IdentityKeyPair;
use rc_crypto::kdf;
use rc_crypto::ratchet::RatchetHolder;
use rc_crypto::x3dh::{self, ed25519_pub_to_x25519, ed25519_secret_to_x25519, PrekeyBundle};
use rc_proto::api::{
    ApiErrorCode, InvitesConfirmRequest, InvitesConsumeRequest, InvitesCreateRequest, InvitesDeliverRequest,
    InvitesLookupCodeRequest, InvitesStatusRequest,
};
use rc_proto::invite::GuestProfile;
use rc_proto::{ContactInit, ContactShare, Invite, SealedEnvelope};

use crate::db::{BlobTable, Store};
use crate::error::SessionError;
use crate::models::{DeliveryIntentQueueBlob, DeliveryIntentRecord, DeviceBundleBlob};
use crate::session_store::SessionStore;
use crate::transport::Transport;

const SEAL_INFO: &[u8] = b"rc-invite-seal-v1";

pub struct InviteDropbox {
    store: Store,
    session_store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
}

impl InviteDropbox {
    pub fn new(store: Store, session_store: Arc<SessionStore>, transport: Arc<dyn Transport>) -> Self {
        Self { store, session_store, transport }
    }

    // ── Owner side ───────────────────────────────────────────────────────

    /// Publish an invite carrying one freshly-reserved one-time prekey.
    pub async fn create_invite(&self, owner_account_digest: &str, owner_device_id: &str, ttl_secs: u32) -> Result<Invite, SessionError> {
        let mut device_bundle = self.load_device_bundle(owner_account_digest).await?;
        let opk_id = device_bundle
            .opks
            .keys()
            .find(|id| !device_bundle.reserved_opks.values().any(|reserved| reserved == *id))
            .copied()
            .ok_or_else(|| SessionError::NotFound("no available one-time prekeys".into()))?;
        let opk_secret_b64 = device_bundle.opks.get(&opk_id).cloned().expect("just located this id");
        let opk_secret = decode_static_secret(&opk_secret_b64)?;
        let opk_pub = X25519Public::from(&opk_secret);

        let bundle = PrekeyBundle {
            account_digest: owner_account_digest.to_string(),
            device_id: owner_device_id.to_string(),
            ik_pub: device_bundle_public_ik(&device_bundle)?,
            spk_pub: device_bundle.spk_secret_b64_to_pub()?,
            spk_sig: device_bundle.spk_sig_b64.clone(),
            opk_pub: Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(opk_pub.as_bytes())),
            opk_id: Some(opk_id.to_string()),
        };

        let resp = self
            .transport
            .invites_create(InvitesCreateRequest {
                owner_account_digest: owner_account_digest.to_string(),
                owner_device_id: owner_device_id.to_string(),
                owner_bundle: bundle,
                ttl_secs,
            })
            .await?;

        device_bundle.reserved_opks.insert(resp.invite.invite_id.clone(), opk_id);
        self.store.write_blob(BlobTable::DeviceBundle, owner_account_digest, &serde_json::to_vec(&device_bundle)?).await?;

        Ok(resp.invite)
    }

    pub async fn lookup_code(&self, pairing_code: &str) -> Result<Invite, SessionError> {
        let resp = self.transport.invites_lookup_code(InvitesLookupCodeRequest { pairing_code: pairing_code.to_string() }).await?;
        Ok(resp.invite)
    }

    pub async fn status(&self, invite_id: &str) -> Result<Invite, SessionError> {
        let resp = self.transport.invites_status(InvitesStatusRequest { invite_id: invite_id.to_string() }).await?;
        Ok(resp.invite)
    }

    /// Poll for and consume a pending delivery on an owner-created invite,
    /// completing the responder side of X3DH and committing a live ratchet
    /// session. Returns `None` if the guest has not delivered yet.
    pub async fn consume_and_respond(
        &self,
        owner_account_digest: &str,
        owner_device_id: &str,
        invite_id: &str,
        owner_profile: GuestProfile,
    ) -> Result<Option<(String, ContactShare)>, SessionError> {
        let resp = self.transport.invites_consume(InvitesConsumeRequest { invite_id: invite_id.to_string() }).await?;
        if !resp.ok {
            return Err(match resp.error {
                Some(ApiErrorCode::AlreadyConsumed) => SessionError::AlreadyConsumed(invite_id.to_string()),
                Some(ApiErrorCode::Expired) => SessionError::InviteExpired(invite_id.to_string()),
                _ => SessionError::NotFound(invite_id.to_string()),
            });
        }
        let Some(envelope) = resp.envelope else { return Ok(None) };

        let mut device_bundle = self.load_device_bundle(owner_account_digest).await?;
        let identity_secret = decode_identity_secret(&device_bundle.identity_secret_b64)?;
        let identity = IdentityKeyPair::from_bytes(&identity_secret)?;

        let plaintext = self.unseal(&device_bundle, invite_id, &envelope)?;
        let contact_init: ContactInit = serde_json::from_slice(&plaintext)?;

        let opk_id = device_bundle
            .reserved_opks
            .remove(invite_id)
            .ok_or_else(|| SessionError::NotFound(format!("no reserved prekey for invite {invite_id}")))?;
        let opk_secret_b64 = device_bundle.opks.remove(&opk_id).ok_or_else(|| SessionError::NotFound(format!("opk {opk_id} already consumed")))?;
        let opk_secret = decode_static_secret(&opk_secret_b64)?;

        let spk_secret = decode_static_secret(&device_bundle.spk_secret_b64)?;
        let spk_pub = X25519Public::from(&spk_secret);

        let sender_ik_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&contact_init.x3dh_header.ik_pub)
            .map_err(|e| SessionError::Crypto(rc_crypto::CryptoError::Base64Decode(e)))?;
        let sender_ik: [u8; 32] = sender_ik_bytes
            .try_into()
            .map_err(|_| SessionError::Crypto(rc_crypto::CryptoError::InvalidKey("sender ik not 32 bytes".into())))?;

        let x3dh_result = x3dh::respond(&spk_secret, &spk_pub, &identity, Some(&opk_secret), &sender_ik, &contact_init.x3dh_header)?;
        let conversation_id = kdf::derive_conversation_id(&x3dh_result.rk)?;

        let holder = RatchetHolder::init_responder(envelope.envelope_id.clone(), conversation_id.clone(), owner_device_id.to_string(), x3dh_result)?;
        let peer_key = format!("{}::{}", contact_init.guest_account_digest, contact_init.guest_device_id);
        self.session_store.commit(owner_account_digest, &peer_key, holder).await?;

        self.store.write_blob(BlobTable::DeviceBundle, owner_account_digest, &serde_json::to_vec(&device_bundle)?).await?;

        let contact_share = ContactShare {
            v: 1,
            kind: "contact-share".to_string(),
            owner_account_digest: owner_account_digest.to_string(),
            owner_device_id: owner_device_id.to_string(),
            owner_profile: owner_profile.clone(),
        };
        self.transport
            .invites_confirm(InvitesConfirmRequest { invite_id: invite_id.to_string(), contact_share: contact_share.clone() })
            .await?;

        Ok(Some((conversation_id, contact_share)))
    }

    // ── Guest side ───────────────────────────────────────────────────────

    /// Seal and deliver a `ContactInit`, persisting the delivery intent
    /// before the network call so a crash mid-delivery can be replayed by
    /// `replay_pending_intents` rather than silently dropped.
    pub async fn guest_deliver(
        &self,
        self_account_digest: &str,
        self_device_id: &str,
        owner_bundle: &PrekeyBundle,
        invite_id: &str,
        guest_profile: GuestProfile,
    ) -> Result<String, SessionError> {
        let device_bundle = self.load_device_bundle(self_account_digest).await?;
        let identity_secret = decode_identity_secret(&device_bundle.identity_secret_b64)?;
        let identity = IdentityKeyPair::from_bytes(&identity_secret)?;

        let x3dh_result = x3dh::initiate(self_account_digest, self_device_id, &identity, owner_bundle, None)?;
        let conversation_id = kdf::derive_conversation_id(&x3dh_result.rk)?;

        let guest_bundle = PrekeyBundle {
            account_digest: self_account_digest.to_string(),
            device_id: self_device_id.to_string(),
            ik_pub: device_bundle_public_ik(&device_bundle)?,
            spk_pub: device_bundle.spk_secret_b64_to_pub()?,
            spk_sig: device_bundle.spk_sig_b64.clone(),
            opk_pub: None,
            opk_id: None,
        };
        let contact_init = ContactInit::new(
            self_account_digest.to_string(),
            self_device_id.to_string(),
            guest_bundle,
            guest_profile,
            x3dh_result.header.clone(),
        );

        let envelope_id = uuid::Uuid::new_v4().to_string();
        let sealed = self.seal(owner_bundle, invite_id, &envelope_id, &contact_init)?;

        let mut queue = self.load_intents(self_account_digest).await?;
        queue.intents.push(DeliveryIntentRecord {
            envelope_id: envelope_id.clone(),
            invite_id: invite_id.to_string(),
            conversation_id: conversation_id.clone(),
            sealed_envelope_json: serde_json::to_string(&sealed)?,
            created_at: Utc::now(),
            delivered: false,
        });
        self.store.write_blob(BlobTable::InviteDeliveryIntents, self_account_digest, &serde_json::to_vec(&queue)?).await?;

        let delivered = matches!(self.transport.invites_deliver(InvitesDeliverRequest { envelope: sealed }).await, Ok(resp) if resp.ok);
        if delivered {
            self.mark_delivered(self_account_digest, &envelope_id).await?;
            let holder = RatchetHolder::init_initiator(envelope_id, conversation_id.clone(), self_device_id.to_string(), x3dh_result)?;
            let peer_key = format!("{}::{}", owner_bundle.account_digest, owner_bundle.device_id);
            self.session_store.commit(self_account_digest, &peer_key, holder).await?;
        }

        Ok(conversation_id)
    }

    /// Retry any deliveries left `delivered = false`, e.g. after a crash
    /// between persisting the intent and the network call succeeding.
    pub async fn replay_pending_intents(&self, self_account_digest: &str) -> Result<(), SessionError> {
        let mut queue = self.load_intents(self_account_digest).await?;
        for intent in queue.intents.iter_mut().filter(|i| !i.delivered) {
            let Ok(envelope) = serde_json::from_str::<SealedEnvelope>(&intent.sealed_envelope_json) else { continue };
            if matches!(self.transport.invites_deliver(InvitesDeliverRequest { envelope }).await, Ok(resp) if resp.ok) {
                intent.delivered = true;
            }
        }
        self.store.write_blob(BlobTable::InviteDeliveryIntents, self_account_digest, &serde_json::to_vec(&queue)?).await
    }

    // ── Sealing ──────────────────────────────────────────────────────────

    fn seal(&self, recipient_bundle: &PrekeyBundle, invite_id: &str, envelope_id: &str, contact_init: &ContactInit) -> Result<SealedEnvelope, SessionError> {
        let recipient_ik_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&recipient_bundle.ik_pub)
            .map_err(|e| SessionError::Crypto(rc_crypto::CryptoError::Base64Decode(e)))?;
        let recipient_ik: [u8; 32] = recipient_ik_bytes
            .try_into()
            .map_err(|_| SessionError::Crypto(rc_crypto::CryptoError::InvalidKey("recipient ik not 32 bytes".into())))?;
        let recipient_ik_x = ed25519_pub_to_x25519(&recipient_ik).map_err(SessionError::Crypto)?;

        let ephemeral_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_pub = X25519Public::from(&ephemeral_secret);
        let shared = ephemeral_secret.diffie_hellman(&recipient_ik_x);
        let sealing_key = derive_sealing_key(shared.as_bytes())?;

        let plaintext = serde_json::to_vec(contact_init)?;
        let aad = seal_aad(invite_id);
        let (nonce_b64, ciphertext_b64) = aead::encrypt_split(&sealing_key, &plaintext, &aad).map_err(SessionError::Crypto)?;

        Ok(SealedEnvelope {
            envelope_id: envelope_id.to_string(),
            invite_id: invite_id.to_string(),
            ephemeral_sender_pub_b64: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(ephemeral_pub.as_bytes()),
            ciphertext_b64,
            nonce_b64,
        })
    }

    fn unseal(&self, device_bundle: &DeviceBundleBlob, invite_id: &str, envelope: &SealedEnvelope) -> Result<Vec<u8>, SessionError> {
        let identity_secret = decode_identity_secret(&device_bundle.identity_secret_b64)?;
        let my_ik_x = ed25519_secret_to_x25519(&identity_secret);

        let sender_pub_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&envelope.ephemeral_sender_pub_b64)
            .map_err(|e| SessionError::Crypto(rc_crypto::CryptoError::Base64Decode(e)))?;
        let sender_pub_arr: [u8; 32] = sender_pub_bytes
            .try_into()
            .map_err(|_| SessionError::Crypto(rc_crypto::CryptoError::InvalidKey("ephemeral sender key not 32 bytes".into())))?;
        let sender_pub = X25519Public::from(sender_pub_arr);

        let shared = my_ik_x.diffie_hellman(&sender_pub);
        let sealing_key = derive_sealing_key(shared.as_bytes())?;
        let aad = seal_aad(invite_id);
        Ok(aead::decrypt_split(&sealing_key, &envelope.nonce_b64, &envelope.ciphertext_b64, &aad).map_err(SessionError::Crypto)?.to_vec())
    }

    // ── Persistence helpers ──────────────────────────────────────────────

    async fn load_device_bundle(&self, account_digest: &str) -> Result<DeviceBundleBlob, SessionError> {
        self.store
            .read_blob(BlobTable::DeviceBundle, account_digest)
            .await?
            .ok_or_else(|| SessionError::MissingIdentity(account_digest.to_string()))
            .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
    }

    async fn load_intents(&self, account_digest: &str) -> Result<DeliveryIntentQueueBlob, SessionError> {
        match self.store.read_blob(BlobTable::InviteDeliveryIntents, account_digest).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(DeliveryIntentQueueBlob::default()),
        }
    }

    async fn mark_delivered(&self, account_digest: &str, envelope_id: &str) -> Result<(), SessionError> {
        let mut queue = self.load_intents(account_digest).await?;
        if let Some(intent) = queue.intents.iter_mut().find(|i| i.envelope_id == envelope_id) {
            intent.delivered = true;
        }
        self.store.write_blob(BlobTable::InviteDeliveryIntents, account_digest, &serde_json::to_vec(&queue)?).await
    }
}

fn seal_aad(invite_id: &str) -> Vec<u8> {
    format!("rc-invite-envelope-v1:{invite_id}").into_bytes()
}

fn derive_sealing_key(shared_secret: &[u8]) -> Result<[u8; 32], SessionError> {
    let mut key = [0u8; 32];
    kdf::hkdf_expand(shared_secret, None, SEAL_INFO, &mut key).map_err(SessionError::Crypto)?;
    Ok(key)
}

fn decode_identity_secret(b64: &str) -> Result<[u8; 32], SessionError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(b64)
        .map_err(|e| SessionError::Crypto(rc_crypto::CryptoError::Base64Decode(e)))?;
    bytes
        .try_into()
        .map_err(|_| SessionError::Crypto(rc_crypto::CryptoError::InvalidKey("identity secret not 32 bytes".into())))
}

fn decode_static_secret(b64: &str) -> Result<StaticSecret, SessionError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(b64)
        .map_err(|e| SessionError::Crypto(rc_crypto::CryptoError::Base64Decode(e)))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SessionError::Crypto(rc_crypto::CryptoError::InvalidKey("secret scalar not 32 bytes".into())))?;
    Ok(StaticSecret::from(arr))
}

fn device_bundle_public_ik(device_bundle: &DeviceBundleBlob) -> Result<String, SessionError> {
    let secret = decode_identity_secret(&device_bundle.identity_secret_b64)?;
    let identity = IdentityKeyPair::from_bytes(&secret).map_err(SessionError::Crypto)?;
    Ok(identity.public_b64())
}

impl DeviceBundleBlob {
    fn spk_secret_b64_to_pub(&self) -> Result<String, SessionError> {
        let secret = decode_static_secret(&self.spk_secret_b64)?;
        let public = X25519Public::from(&secret);
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(public.as_bytes()))
    }
}
