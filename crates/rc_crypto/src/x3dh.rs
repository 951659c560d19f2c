//! X3DH asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   The initiator fetches the peer's published key bundle:
//!     IK  (identity, Ed25519 public — converted to X25519 for DH)
//!     SPK (signed prekey, X25519) + IK signature over SPK.pub
//!     OPK (optional one-time prekey, X25519)
//!
//!   The initiator generates one ephemeral X25519 keypair EK (or uses a
//!   pre-supplied one, e.g. when replaying a persisted delivery intent).
//!
//!   DH calculations, fixed order:
//!     DH1 = DH(IK_self,  SPK_peer)   — mutual authentication
//!     DH2 = DH(EK,       IK_peer)    — forward secrecy
//!     DH3 = DH(EK,       SPK_peer)   — replay protection
//!     DH4 = DH(EK,       OPK_peer)   — one-time forward secrecy [optional]
//!
//!   rk = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4], info=domain-tag)
//!
//! Non-negotiable:
//!   - The initiator MUST verify the peer's SPK signature before computing any DH.
//!   - The initiator sends `(ik_pub, ek_pub, opk_id?)` as the init header.
//!   - The responder reconstructs the same DH set and derives the same `rk`.
//!   - `rk` feeds into the ratchet engine as the initial root key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::IdentityKeyPair,
    kdf,
};

const X3DH_INFO: &[u8] = b"rc-x3dh-v1";

// ── Helpers ──────────────────────────────────────────────────────────────────

fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(CryptoError::Base64Decode)
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// Uses the clamped SHA-512 expansion ed25519-dalek uses internally.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public key
/// via the birational map from the Edwards curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    let montgomery = point.to_montgomery();
    Ok(X25519Public::from(montgomery.to_bytes()))
}

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// Published by each account/device, consumed by session initiators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub account_digest: String,
    pub device_id: String,
    /// Ed25519 identity public key (base64)
    pub ik_pub: String,
    /// X25519 signed prekey (base64)
    pub spk_pub: String,
    /// Ed25519 signature over raw SPK.pub bytes (base64)
    pub spk_sig: String,
    /// X25519 one-time prekey (consumed once; base64)
    pub opk_pub: Option<String>,
    /// Opaque OPK identifier so the prekey store can delete the used one
    pub opk_id: Option<String>,
}

/// Generate a signed prekey: an X25519 keypair with the public half signed
/// by the account's Ed25519 identity key.
pub fn generate_signed_prekey(
    identity: &IdentityKeyPair,
) -> Result<(StaticSecret, X25519Public, Vec<u8>), CryptoError> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let sig = identity.sign(public.as_bytes());
    Ok((secret, public, sig))
}

/// Generate a batch of one-time prekeys (X25519).
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(OsRng);
            let p = X25519Public::from(&s);
            (s, p)
        })
        .collect()
}

// ── Init message header ──────────────────────────────────────────────────────

/// Sent alongside the first ciphertext so the responder can derive `rk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3DHHeader {
    pub session_id: String,
    pub sender_account_digest: String,
    pub sender_device_id: String,
    /// Initiator's Ed25519 identity public key (base64)
    pub ik_pub: String,
    /// Initiator's ephemeral X25519 public key (base64)
    pub ek_pub: String,
    /// Which OPK was consumed (opaque id; `None` if the bundle had none)
    pub opk_id: Option<String>,
}

// ── Output ───────────────────────────────────────────────────────────────────

/// Result of the X3DH handshake: a shared root key, the matching ratchet
/// keypair, the peer's initial ratchet public key, and the init header.
pub struct X3DHResult {
    /// 32-byte shared key — feeds into the ratchet engine as the initial `rk`.
    pub rk: [u8; 32],
    /// The initiator's ephemeral keypair becomes `myRatchet`; the responder
    /// has no ratchet keypair of its own yet (`ratchet_priv`/`pub` are the
    /// peer's SPK, used only as `theirRatchetPub`).
    pub ratchet_priv: StaticSecret,
    pub ratchet_pub: X25519Public,
    pub their_ratchet_pub: X25519Public,
    pub header: X3DHHeader,
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Run X3DH as the session initiator.
///
/// `ek_pair`, when supplied, lets a caller replay a persisted delivery
/// intent (invite dropbox guest flow) with the exact ephemeral key it
/// already announced, rather than generating a fresh one on every retry.
pub fn initiate(
    my_account_digest: &str,
    my_device_id: &str,
    my_ik: &IdentityKeyPair,
    bundle: &PrekeyBundle,
    ek_pair: Option<(StaticSecret, X25519Public)>,
) -> Result<X3DHResult, CryptoError> {
    // ── 1. Verify SPK signature ──────────────────────────────────────────
    let ik_peer_ed_bytes = b64d(&bundle.ik_pub)?;
    let ik_peer_ed = to_32(&ik_peer_ed_bytes)?;
    let spk_peer_bytes = b64d(&bundle.spk_pub)?;
    let spk_peer_raw = to_32(&spk_peer_bytes)?;
    let spk_sig_bytes = b64d(&bundle.spk_sig)?;
    IdentityKeyPair::verify(&ik_peer_ed, &spk_peer_raw, &spk_sig_bytes)?;

    // ── 2. Convert identity keys to X25519 ───────────────────────────────
    let ik_self_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_peer_x = ed25519_pub_to_x25519(&ik_peer_ed)?;
    let spk_peer = X25519Public::from(spk_peer_raw);

    // ── 3. Ephemeral key ──────────────────────────────────────────────────
    let (ek, ek_pub) = ek_pair.unwrap_or_else(|| {
        let s = StaticSecret::random_from_rng(OsRng);
        let p = X25519Public::from(&s);
        (s, p)
    });

    // ── 4. DH calculations, fixed order ──────────────────────────────────
    let dh1 = ik_self_x.diffie_hellman(&spk_peer);
    let dh2 = ek.diffie_hellman(&ik_peer_x);
    let dh3 = ek.diffie_hellman(&spk_peer);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_id_out = None;
    if let Some(ref opk_b64) = bundle.opk_pub {
        let opk_raw = to_32(&b64d(opk_b64)?)?;
        let opk_peer = X25519Public::from(opk_raw);
        let dh4 = ek.diffie_hellman(&opk_peer);
        ikm.extend_from_slice(dh4.as_bytes());
        opk_id_out = bundle.opk_id.clone();
    }

    // ── 5. Derive rk ──────────────────────────────────────────────────────
    let mut rk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut rk)?;
    ikm.zeroize();

    let session_id = uuid::Uuid::new_v4().to_string();

    Ok(X3DHResult {
        rk,
        ratchet_priv: ek,
        ratchet_pub: ek_pub,
        their_ratchet_pub: spk_peer,
        header: X3DHHeader {
            session_id,
            sender_account_digest: my_account_digest.to_string(),
            sender_device_id: my_device_id.to_string(),
            ik_pub: URL_SAFE_NO_PAD.encode(&my_ik.public.0),
            ek_pub: URL_SAFE_NO_PAD.encode(ek_pub.as_bytes()),
            opk_id: opk_id_out,
        },
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Receive an X3DH init header and reconstruct `rk` as the responder.
///
/// `my_spk_secret` — this device's signed prekey X25519 secret.
/// `my_opk_secret` — the consumed OPK secret, if the init used one (the
///   caller is responsible for having already called `PrekeyStore::consume_opk`).
/// `sender_ik_ed_pub` — the initiator's Ed25519 identity public key.
pub fn respond(
    my_spk_secret: &StaticSecret,
    my_spk_pub: &X25519Public,
    my_ik: &IdentityKeyPair,
    my_opk_secret: Option<&StaticSecret>,
    sender_ik_ed_pub: &[u8; 32],
    header: &X3DHHeader,
) -> Result<X3DHResult, CryptoError> {
    let ek_peer_bytes = b64d(&header.ek_pub)?;
    let ek_peer = X25519Public::from(to_32(&ek_peer_bytes)?);

    let ik_peer_x = ed25519_pub_to_x25519(sender_ik_ed_pub)?;
    let ik_self_x = ed25519_secret_to_x25519(my_ik.secret_bytes());

    // Mirror the initiator's DH order exactly (DH is commutative):
    //   DH1 = IK_init × SPK_self   ==  SPK_self × IK_init
    //   DH2 = EK_init × IK_self    ==  IK_self × EK_init
    //   DH3 = EK_init × SPK_self   ==  SPK_self × EK_init
    let dh1 = my_spk_secret.diffie_hellman(&ik_peer_x);
    let dh2 = ik_self_x.diffie_hellman(&ek_peer);
    let dh3 = my_spk_secret.diffie_hellman(&ek_peer);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk_sec) = my_opk_secret {
        if header.opk_id.is_none() {
            return Err(CryptoError::PrekeyError(
                "responder was given an OPK secret but header carries no opk_id".into(),
            ));
        }
        let dh4 = opk_sec.diffie_hellman(&ek_peer);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut rk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut rk)?;
    ikm.zeroize();

    Ok(X3DHResult {
        rk,
        // The responder's current ratchet keypair is its own signed prekey
        // until the first DH ratchet replaces it on reply.
        ratchet_priv: my_spk_secret.clone(),
        ratchet_pub: *my_spk_pub,
        their_ratchet_pub: ek_peer,
        header: header.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(
        digest: &str,
        device_id: &str,
        ik: &IdentityKeyPair,
        spk_pub: &X25519Public,
        spk_sig: &[u8],
        opk_pub: Option<&X25519Public>,
        opk_id: Option<&str>,
    ) -> PrekeyBundle {
        PrekeyBundle {
            account_digest: digest.into(),
            device_id: device_id.into(),
            ik_pub: URL_SAFE_NO_PAD.encode(&ik.public.0),
            spk_pub: URL_SAFE_NO_PAD.encode(spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(spk_sig),
            opk_pub: opk_pub.map(|p| URL_SAFE_NO_PAD.encode(p.as_bytes())),
            opk_id: opk_id.map(String::from),
        }
    }

    #[test]
    fn x3dh_roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) =
            generate_signed_prekey(&bob_ik).unwrap();

        let bundle = bundle_for("BOBDIGEST", "bob-dev", &bob_ik, &bob_spk_pub, &bob_spk_sig, None, None);

        let alice_result = initiate("ALICEDIGEST", "alice-dev", &alice_ik, &bundle, None).unwrap();

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let bob_result = respond(
            &bob_spk_secret,
            &bob_spk_pub,
            &bob_ik,
            None,
            &alice_ik_ed,
            &alice_result.header,
        )
        .unwrap();

        assert_eq!(alice_result.rk, bob_result.rk, "both sides must derive the same rk");
        assert_eq!(alice_result.ratchet_pub, bob_result.their_ratchet_pub);
    }

    #[test]
    fn x3dh_roundtrip_with_opk() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let opks = generate_one_time_prekeys(1);
        let (ref bob_opk_secret, ref bob_opk_pub) = opks[0];

        let bundle = bundle_for(
            "BOBDIGEST", "bob-dev", &bob_ik, &bob_spk_pub, &bob_spk_sig,
            Some(bob_opk_pub), Some("opk-0"),
        );

        let alice_result = initiate("ALICEDIGEST", "alice-dev", &alice_ik, &bundle, None).unwrap();

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let bob_result = respond(
            &bob_spk_secret,
            &bob_spk_pub,
            &bob_ik,
            Some(bob_opk_secret),
            &alice_ik_ed,
            &alice_result.header,
        )
        .unwrap();

        assert_eq!(alice_result.rk, bob_result.rk);
        assert_eq!(alice_result.header.opk_id.as_deref(), Some("opk-0"));
    }

    #[test]
    fn initiate_accepts_presupplied_ephemeral_for_retry() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let (_bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let bundle = bundle_for("BOBDIGEST", "bob-dev", &bob_ik, &bob_spk_pub, &bob_spk_sig, None, None);

        let fixed_ek = StaticSecret::random_from_rng(OsRng);
        let fixed_ek_pub = X25519Public::from(&fixed_ek);

        let r1 = initiate("ALICEDIGEST", "alice-dev", &alice_ik, &bundle, Some((fixed_ek.clone(), fixed_ek_pub))).unwrap();
        let r2 = initiate("ALICEDIGEST", "alice-dev", &alice_ik, &bundle, Some((fixed_ek, fixed_ek_pub))).unwrap();
        assert_eq!(r1.rk, r2.rk, "replaying the same ephemeral must derive the same rk");
        assert_eq!(r1.header.ek_pub, r2.header.ek_pub);
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let evil_ik = IdentityKeyPair::generate().unwrap();

        let (_spk_secret, spk_pub, _good_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let evil_sig = evil_ik.sign(spk_pub.as_bytes());
        let bundle = bundle_for("BOBDIGEST", "bob-dev", &bob_ik, &spk_pub, &evil_sig, None, None);

        let err = initiate("ALICEDIGEST", "alice-dev", &alice_ik, &bundle, None);
        assert!(err.is_err(), "must reject an SPK signed by the wrong identity");
    }
}
