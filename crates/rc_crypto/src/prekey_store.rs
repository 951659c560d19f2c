//! Per-device prekey store (C2).
//!
//! Holds the device's long-term identity key, its current signed prekey,
//! and a pool of one-time prekeys. This module owns only the in-memory
//! representation and the key-generation logic; persisting the private
//! bundle to disk is the session layer's job (`rc_session` seals it as one
//! of the four at-rest blobs).

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{
    error::CryptoError,
    identity::IdentityKeyPair,
    x3dh::{self, PrekeyBundle},
};

struct Opk {
    secret: StaticSecret,
    public: X25519Public,
}

/// A device's X3DH key material: identity key, current signed prekey, and
/// the one-time prekey pool.
pub struct PrekeyStore {
    account_digest: String,
    device_id: String,
    identity: IdentityKeyPair,
    spk_secret: StaticSecret,
    spk_public: X25519Public,
    spk_sig: Vec<u8>,
    opks: BTreeMap<u64, Opk>,
    next_opk_id: u64,
}

impl PrekeyStore {
    /// Generate a brand-new identity key and signed prekey for a fresh device.
    pub fn generate(account_digest: &str, device_id: &str) -> Result<Self, CryptoError> {
        let identity = IdentityKeyPair::generate()?;
        let (spk_secret, spk_public, spk_sig) = x3dh::generate_signed_prekey(&identity)?;
        Ok(Self {
            account_digest: account_digest.to_string(),
            device_id: device_id.to_string(),
            identity,
            spk_secret,
            spk_public,
            spk_sig,
            opks: BTreeMap::new(),
            next_opk_id: 0,
        })
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Generate `count` fresh one-time prekeys, starting at `next_opk_id`,
    /// advance the counter, and return the public portion for publishing.
    pub fn publish(&mut self, count: usize) -> Vec<(u64, X25519Public)> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
            let public = X25519Public::from(&secret);
            let id = self.next_opk_id;
            self.next_opk_id += 1;
            self.opks.insert(id, Opk { secret, public });
            out.push((id, public));
        }
        out
    }

    /// Remove and return the private scalar for a one-time prekey. The
    /// server deletes the corresponding public entry after handing it out
    /// exactly once; a second `consume_opk` for the same id is a caller bug,
    /// not a retryable condition.
    pub fn consume_opk(&mut self, id: u64) -> Result<StaticSecret, CryptoError> {
        self.opks
            .remove(&id)
            .map(|opk| opk.secret)
            .ok_or_else(|| CryptoError::PrekeyError(format!("unknown one-time prekey id {id}")))
    }

    /// Republish enough one-time prekeys to bring the pool back above
    /// `threshold`, returning the newly published keys (empty if already
    /// at or above the threshold).
    pub fn refresh_if_below(&mut self, threshold: usize) -> Vec<(u64, X25519Public)> {
        if self.opks.len() >= threshold {
            return Vec::new();
        }
        self.publish(threshold - self.opks.len())
    }

    pub fn opk_count(&self) -> usize {
        self.opks.len()
    }

    /// Rotate the signed prekey, re-signing the new public half under the
    /// identity key.
    pub fn rotate_spk(&mut self) -> Result<(), CryptoError> {
        let (secret, public, sig) = x3dh::generate_signed_prekey(&self.identity)?;
        self.spk_secret = secret;
        self.spk_public = public;
        self.spk_sig = sig;
        Ok(())
    }

    pub fn spk_secret(&self) -> &StaticSecret {
        &self.spk_secret
    }

    pub fn spk_public(&self) -> &X25519Public {
        &self.spk_public
    }

    /// Build the public bundle handed to session initiators, optionally
    /// consuming one one-time prekey (the caller decides whether to include
    /// one; omitting it is valid per X3DH).
    pub fn bundle(&mut self, consume_an_opk: bool) -> PrekeyBundle {
        let (opk_pub, opk_id) = if consume_an_opk {
            self.opks
                .iter()
                .next()
                .map(|(id, opk)| (*id, opk.public))
                .map(|(id, public)| (Some(public), Some(id)))
                .unwrap_or((None, None))
        } else {
            (None, None)
        };

        PrekeyBundle {
            account_digest: self.account_digest.clone(),
            device_id: self.device_id.clone(),
            ik_pub: self.identity.public_b64(),
            spk_pub: URL_SAFE_NO_PAD.encode(self.spk_public.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&self.spk_sig),
            opk_pub: opk_pub.map(|p| URL_SAFE_NO_PAD.encode(p.as_bytes())),
            opk_id: opk_id.map(|id| id.to_string()),
        }
    }
}
