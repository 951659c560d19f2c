//! Double Ratchet engine with DH ratchet steps and strictly-monotone
//! transport counters.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   `rk`         — root key, updated on every DH ratchet step.
//!   `ckS` / `ckR`— sending / receiving chain keys, updated per message.
//!   `mk`         — message key, derived from a chain key, used once.
//!
//! Counter separation (non-negotiable): `Ns`/`Nr`/`PN` count messages within
//! the *current* chain and reset across a DH ratchet; `NsTotal`/`NrTotal`
//! count messages across the session's entire lifetime and are never reset
//! by a DH ratchet. The outbox depends on `NsTotal` for counter reservation
//! and replay-safety; a ratchet step that touched it would let two different
//! message bodies be sent under the same transport counter.
//!
//! Forward secrecy: old chain keys and message keys are overwritten/erased.
//! Post-compromise security: a DH ratchet step restores secrecy going forward.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, kdf, x3dh::X3DHResult};

/// Counters are fatal, not wrapping, once they approach the platform's safe
/// integer range (relevant because these values eventually cross a JSON
/// boundary even though this core itself stores them as `u64`).
const MAX_SAFE_COUNTER: u64 = (1u64 << 53) - 1;

/// Default bound on skipped-message-key retention per chain. Configurable
/// by the caller via `RatchetHolder::set_skip_window`.
const DEFAULT_SKIP_WINDOW: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetRole {
    Initiator,
    Responder,
}

/// Ratchet header included in every message, unencrypted, and authenticated
/// as AEAD associated data by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key (base64)
    pub ek_pub_b64: String,
    /// Message number in the current sending chain
    pub n: u64,
    /// Length of the previous sending chain
    pub pn: u64,
    pub device_id: String,
}

/// The per-peer mutable ratchet state. One holder per
/// `(self-device, peer-account, peer-device)` triple.
#[derive(Serialize, Deserialize)]
pub struct RatchetHolder {
    /// Opaque identifier for logging only; never a secret.
    pub id: String,
    pub conversation_id: String,
    pub self_device_id: String,
    pub role: RatchetRole,

    rk: [u8; 32],
    ck_s: Option<[u8; 32]>,
    ck_r: Option<[u8; 32]>,

    pub ns: u64,
    pub nr: u64,
    pub pn: u64,
    pub ns_total: u64,
    pub nr_total: u64,

    my_ratchet_priv: [u8; 32],
    my_ratchet_pub: X25519PubSerde,
    their_ratchet_pub: Option<X25519PubSerde>,

    pending_send_ratchet: bool,

    /// `chainId (base64 of the ratchet pubkey that was current) -> (Nr -> mk)`
    skipped_keys: HashMap<String, HashMap<u64, [u8; 32]>>,

    #[serde(skip, default = "default_skip_window")]
    skip_window: u32,

    pub updated_at: DateTime<Utc>,
    pub snapshot_source: String,
}

fn default_skip_window() -> u32 {
    DEFAULT_SKIP_WINDOW
}

/// Newtype so `X25519Public` can serialize as base64 without an external
/// serde wrapper module at every use site.
#[derive(Clone, Copy, PartialEq, Eq)]
struct X25519PubSerde(X25519Public);

impl Serialize for X25519PubSerde {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_NO_PAD.encode(self.0.as_bytes()))
    }
}

impl<'de> Deserialize<'de> for X25519PubSerde {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte key"))?;
        Ok(X25519PubSerde(X25519Public::from(arr)))
    }
}

impl Drop for RatchetHolder {
    fn drop(&mut self) {
        self.rk.zeroize();
        if let Some(ref mut ck) = self.ck_s {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.ck_r {
            ck.zeroize();
        }
        self.my_ratchet_priv.zeroize();
        for chain in self.skipped_keys.values_mut() {
            for mk in chain.values_mut() {
                mk.zeroize();
            }
        }
    }
}

// ── Construction ─────────────────────────────────────────────────────────────

impl RatchetHolder {
    /// Build a holder from a completed initiator-side X3DH result.
    /// `ckS = HKDF(rk, "chain/send")`, `ckR = ∅`.
    pub fn init_initiator(
        id: String,
        conversation_id: String,
        self_device_id: String,
        x3dh: X3DHResult,
    ) -> Result<Self, CryptoError> {
        let ck_s = kdf::initial_chain_key(&x3dh.rk, b"chain/send")?;
        Ok(Self {
            id,
            conversation_id,
            self_device_id,
            role: RatchetRole::Initiator,
            rk: x3dh.rk,
            ck_s: Some(ck_s),
            ck_r: None,
            ns: 0,
            nr: 0,
            pn: 0,
            ns_total: 0,
            nr_total: 0,
            my_ratchet_priv: x3dh.ratchet_priv.to_bytes(),
            my_ratchet_pub: X25519PubSerde(x3dh.ratchet_pub),
            their_ratchet_pub: Some(X25519PubSerde(x3dh.their_ratchet_pub)),
            pending_send_ratchet: false,
            skipped_keys: HashMap::new(),
            skip_window: DEFAULT_SKIP_WINDOW,
            updated_at: Utc::now(),
            snapshot_source: "x3dh-initiate".into(),
        })
    }

    /// Build a holder from a completed responder-side X3DH result.
    /// `ckR = HKDF(rk, "chain/recv")`, `ckS = ∅` — the responder cannot
    /// send until it receives (to learn the initiator's ratchet pubkey) or
    /// until `drEncrypt` forces a fresh ratchet step on its own.
    pub fn init_responder(
        id: String,
        conversation_id: String,
        self_device_id: String,
        x3dh: X3DHResult,
    ) -> Result<Self, CryptoError> {
        let ck_r = kdf::initial_chain_key(&x3dh.rk, b"chain/recv")?;
        Ok(Self {
            id,
            conversation_id,
            self_device_id,
            role: RatchetRole::Responder,
            rk: x3dh.rk,
            ck_s: None,
            ck_r: Some(ck_r),
            ns: 0,
            nr: 0,
            pn: 0,
            ns_total: 0,
            nr_total: 0,
            my_ratchet_priv: x3dh.ratchet_priv.to_bytes(),
            my_ratchet_pub: X25519PubSerde(x3dh.ratchet_pub),
            their_ratchet_pub: Some(X25519PubSerde(x3dh.their_ratchet_pub)),
            pending_send_ratchet: false,
            skipped_keys: HashMap::new(),
            skip_window: DEFAULT_SKIP_WINDOW,
            updated_at: Utc::now(),
            snapshot_source: "x3dh-respond".into(),
        })
    }

    pub fn set_skip_window(&mut self, window: u32) {
        self.skip_window = window;
    }

    pub fn ck_s_present(&self) -> bool {
        self.ck_s.is_some()
    }

    pub fn ck_r_present(&self) -> bool {
        self.ck_r.is_some()
    }

    pub fn rk(&self) -> &[u8; 32] {
        &self.rk
    }

    pub fn their_ratchet_pub(&self) -> Option<X25519Public> {
        self.their_ratchet_pub.map(|k| k.0)
    }

    pub fn my_ratchet_pub(&self) -> X25519Public {
        self.my_ratchet_pub.0
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// `drEncrypt`. Returns `(header, message_key)`; the caller AEAD-encrypts
    /// the plaintext under `message_key` with AAD = canonical header + iv.
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, [u8; 32]), CryptoError> {
        let their_pub = self
            .their_ratchet_pub
            .ok_or(CryptoError::SessionNotInitialised)?
            .0;

        if self.pending_send_ratchet || self.ck_s.is_none() {
            let new_priv = StaticSecret::random_from_rng(OsRng);
            let new_pub = X25519Public::from(&new_priv);
            let dh_out = new_priv.diffie_hellman(&their_pub);
            let (new_rk, new_ck_s) = kdf::kdf_rk(&self.rk, dh_out.as_bytes(), b"ratchet/send")?;

            self.rk = new_rk;
            self.ck_s = Some(new_ck_s);
            self.pn = self.ns;
            self.ns = 0;
            self.my_ratchet_priv = new_priv.to_bytes();
            self.my_ratchet_pub = X25519PubSerde(new_pub);
            self.pending_send_ratchet = false;
            // NsTotal/NrTotal are untouched by a DH ratchet.
        }

        let ck_s = self.ck_s.as_ref().expect("just ensured ckS is set");
        let (next_ck, mk) = kdf::kdf_ck(ck_s)?;
        self.ck_s = Some(next_ck);

        let header = RatchetHeader {
            ek_pub_b64: URL_SAFE_NO_PAD.encode(self.my_ratchet_pub.0.as_bytes()),
            n: self.ns,
            pn: self.pn,
            device_id: self.self_device_id.clone(),
        };

        self.ns = checked_incr(self.ns)?;
        self.ns_total = checked_incr(self.ns_total)?;
        self.updated_at = Utc::now();

        Ok((header, mk))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// `drDecrypt`. Looks up or derives the message key for an incoming
    /// header, DH-ratcheting the receive side if the sender announced a new
    /// ratchet public key. Returns `CounterReplayOrGap` if `header.n < Nr`
    /// and no skipped key is on record, and `TooManySkipped` if deriving the
    /// skip would exceed the configured window.
    pub fn decrypt_step(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        let peer_bytes = URL_SAFE_NO_PAD
            .decode(&header.ek_pub_b64)
            .map_err(CryptoError::Base64Decode)?;
        let peer_pub = X25519Public::from(
            <[u8; 32]>::try_from(peer_bytes.as_slice())
                .map_err(|_| CryptoError::InvalidKey("bad ratchet public key".into()))?,
        );

        let is_new_chain = match self.their_ratchet_pub {
            Some(current) => current.0.as_bytes() != peer_pub.as_bytes(),
            None => true,
        };

        if is_new_chain {
            // Save skipped keys on the *current* receive chain before moving on.
            if self.ck_r.is_some() {
                self.skip_to(header.pn)?;
            }

            let dh_in = StaticSecret::from(self.my_ratchet_priv).diffie_hellman(&peer_pub);
            let (new_rk, new_ck_r) = kdf::kdf_rk(&self.rk, dh_in.as_bytes(), b"ratchet/recv")?;

            self.rk = new_rk;
            self.ck_r = Some(new_ck_r);
            self.nr = 0;
            self.their_ratchet_pub = Some(X25519PubSerde(peer_pub));
            self.pending_send_ratchet = true;
        }

        if header.n < self.nr {
            let chain_id = self.chain_id_for(&peer_pub);
            let mk = self
                .skipped_keys
                .get_mut(&chain_id)
                .and_then(|chain| chain.remove(&header.n))
                .ok_or(CryptoError::CounterReplayOrGap)?;
            // A skipped-key delivery is still an accepted receive: the
            // transport-wide count of messages this side has consumed must
            // go up even though the per-chain `nr` doesn't move.
            self.nr_total = checked_incr(self.nr_total)?;
            self.updated_at = Utc::now();
            return Ok(mk);
        }

        self.skip_to(header.n)?;

        let ck_r = self.ck_r.as_ref().ok_or(CryptoError::SessionNotInitialised)?;
        let (next_ck, mk) = kdf::kdf_ck(ck_r)?;
        self.ck_r = Some(next_ck);
        self.nr = checked_incr(header.n)?;
        self.nr_total = checked_incr(self.nr_total)?;
        self.updated_at = Utc::now();

        Ok(mk)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn chain_id_for(&self, pub_key: &X25519Public) -> String {
        URL_SAFE_NO_PAD.encode(pub_key.as_bytes())
    }

    /// Derive and store message keys for `Nr..until` on the current receive
    /// chain, bounded by `skip_window`.
    fn skip_to(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.nr {
            return Ok(());
        }
        let skip_count = until - self.nr;
        if skip_count > self.skip_window as u64 {
            return Err(CryptoError::TooManySkipped { limit: self.skip_window });
        }

        let Some(their_pub) = self.their_ratchet_pub else {
            return Ok(());
        };
        let chain_id = self.chain_id_for(&their_pub.0);
        let chain = self.skipped_keys.entry(chain_id).or_default();

        let ck_r = self.ck_r.as_ref().ok_or(CryptoError::SessionNotInitialised)?;
        let mut ck = *ck_r;
        while self.nr < until {
            let (next_ck, mk) = kdf::kdf_ck(&ck)?;
            chain.insert(self.nr, mk);
            ck = next_ck;
            self.nr += 1;
        }
        self.ck_r = Some(ck);
        Ok(())
    }
}

fn checked_incr(n: u64) -> Result<u64, CryptoError> {
    if n >= MAX_SAFE_COUNTER {
        return Err(CryptoError::CounterOverflow);
    }
    Ok(n + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{identity::IdentityKeyPair, x3dh};

    fn handshake() -> (RatchetHolder, RatchetHolder) {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) =
            x3dh::generate_signed_prekey(&bob_ik).unwrap();

        let bundle = x3dh::PrekeyBundle {
            account_digest: "BOB".into(),
            device_id: "bob-dev".into(),
            ik_pub: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &bob_ik.public.0),
            spk_pub: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bob_spk_pub.as_bytes()),
            spk_sig: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &bob_spk_sig),
            opk_pub: None,
            opk_id: None,
        };

        let alice_x3dh = x3dh::initiate("ALICE", "alice-dev", &alice_ik, &bundle, None).unwrap();
        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let bob_x3dh = x3dh::respond(
            &bob_spk_secret, &bob_spk_pub, &bob_ik, None, &alice_ik_ed, &alice_x3dh.header,
        ).unwrap();

        let conv_id = crate::kdf::derive_conversation_id(&alice_x3dh.rk).unwrap();
        let alice = RatchetHolder::init_initiator("alice-holder".into(), conv_id.clone(), "alice-dev".into(), alice_x3dh).unwrap();
        let bob = RatchetHolder::init_responder("bob-holder".into(), conv_id, "bob-dev".into(), bob_x3dh).unwrap();
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = handshake();

        for i in 0..3 {
            let (header, mk_alice) = alice.encrypt_step().unwrap();
            let mk_bob = bob.decrypt_step(&header).unwrap();
            assert_eq!(mk_alice, mk_bob, "message {i}: keys must match");
        }

        for i in 0..2 {
            let (header, mk_bob) = bob.encrypt_step().unwrap();
            let mk_alice = alice.decrypt_step(&header).unwrap();
            assert_eq!(mk_bob, mk_alice, "bob message {i}: keys must match");
        }

        let (header, mk_a) = alice.encrypt_step().unwrap();
        let mk_b = bob.decrypt_step(&header).unwrap();
        assert_eq!(mk_a, mk_b);

        assert_eq!(alice.ns_total, 4);
        assert_eq!(bob.nr_total, 4);
        assert_eq!(bob.ns_total, 2);
        assert_eq!(alice.nr_total, 2);
    }

    #[test]
    fn out_of_order_messages() {
        let (mut alice, mut bob) = handshake();

        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, mk1) = alice.encrypt_step().unwrap();
        let (h2, mk2) = alice.encrypt_step().unwrap();

        let mk2_bob = bob.decrypt_step(&h2).unwrap();
        assert_eq!(mk2, mk2_bob);

        let mk0_bob = bob.decrypt_step(&h0).unwrap();
        assert_eq!(mk0, mk0_bob);

        let mk1_bob = bob.decrypt_step(&h1).unwrap();
        assert_eq!(mk1, mk1_bob);

        assert_eq!(bob.nr_total, 3);
    }

    #[test]
    fn ratchet_never_touches_transport_counters() {
        let (mut alice, mut bob) = handshake();
        alice.ns_total = 42;
        bob.nr_total = 17;

        let ck_s_before = alice.ck_s;
        let (header, _mk) = alice.encrypt_step().unwrap();
        assert_ne!(alice.ck_s, ck_s_before);
        assert_eq!(alice.ns_total, 43, "encrypt_step advances NsTotal by exactly one");

        let ck_r_before = bob.ck_r;
        bob.decrypt_step(&header).unwrap();
        assert_ne!(bob.ck_r, ck_r_before);
        assert_eq!(bob.nr_total, 18);
    }

    #[test]
    fn counter_monotonicity_sequence() {
        let (mut alice, mut bob) = handshake();
        let mut seq = vec![alice.ns_total];

        for _ in 0..3 {
            let (h, _mk) = alice.encrypt_step().unwrap();
            bob.decrypt_step(&h).unwrap();
            seq.push(alice.ns_total);
        }
        for _ in 0..2 {
            let (h, _mk) = bob.encrypt_step().unwrap();
            alice.decrypt_step(&h).unwrap();
            seq.push(alice.ns_total);
        }
        let (h, _mk) = alice.encrypt_step().unwrap();
        bob.decrypt_step(&h).unwrap();
        seq.push(alice.ns_total);

        assert_eq!(seq, vec![0, 1, 2, 3, 3, 3, 4]);
        assert_eq!(bob.nr_total, 4);
    }

    #[test]
    fn burst_of_ten() {
        let (mut alice, mut bob) = handshake();
        for i in 0..10 {
            let (header, mk) = alice.encrypt_step().unwrap();
            let mk_bob = bob.decrypt_step(&header).unwrap();
            assert_eq!(mk, mk_bob, "burst message {i}");
        }
        assert_eq!(alice.ns_total, 10);
        assert_eq!(bob.nr_total, 10);
    }

    #[test]
    fn replay_without_skipped_key_is_rejected() {
        let (mut alice, mut bob) = handshake();
        let (h0, _mk0) = alice.encrypt_step().unwrap();
        bob.decrypt_step(&h0).unwrap();
        let err = bob.decrypt_step(&h0);
        assert!(matches!(err, Err(CryptoError::CounterReplayOrGap)));
    }

    #[test]
    fn exceeding_skip_window_is_rejected() {
        let (mut alice, mut bob) = handshake();
        bob.set_skip_window(4);
        for _ in 0..10 {
            alice.encrypt_step().unwrap();
        }
        let (header, _mk) = alice.encrypt_step().unwrap();
        let err = bob.decrypt_step(&header);
        assert!(matches!(err, Err(CryptoError::TooManySkipped { .. })));
    }
}
