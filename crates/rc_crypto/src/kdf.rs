//! Key derivation functions.
//!
//! `master_key_from_password` — Argon2id, derives the 32-byte key that the
//!   persistence layer uses to seal every at-rest blob.
//!
//! `kdf_rk` / `kdf_ck` — the two KDF steps of the double ratchet (HKDF-SHA256
//!   root-key step and HMAC-SHA256 chain step respectively), shared by
//!   `ratchet.rs` so there is exactly one implementation of each.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

// ── Master key (Argon2id) ───────────────────────────────────────────────────

/// 32-byte key derived from the user's password. Zeroized on drop.
///
/// This core never derives this key itself in production — the
/// authentication layer is responsible for producing it and handing it in
/// as an opaque symmetric key — but the derivation lives here because it is
/// exercised by local tests and by any offline recovery tooling that needs
/// to re-derive it from a password + stored salt.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey(pub [u8; 32]);

/// Argon2id parameters tuned for interactive unlock on a single device.
fn argon2_params() -> argon2::Params {
    argon2::Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .expect("static argon2 params are always valid")
}

/// Derive a master key from a password and a 16-byte salt.
/// The salt is not secret and should be stored alongside the encrypted state.
pub fn master_key_from_password(password: &[u8], salt: &[u8; 16]) -> Result<MasterKey, CryptoError> {
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon2_params());
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(MasterKey(output))
}

/// Generate a fresh random 16-byte salt (call once on first run; persist it).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── HKDF-SHA256 ──────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
/// `salt` may be empty (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive the initial root key from an X3DH DH-output concatenation.
pub fn derive_root_key(dh_output: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    hkdf_expand(dh_output, None, info, &mut key)?;
    Ok(key)
}

/// Derive the first chain key directly from the X3DH root key, before any
/// DH ratchet has happened. `info` is `"chain/send"` for the initiator's
/// `ckS` or `"chain/recv"` for the responder's `ckR`.
pub fn initial_chain_key(rk: &[u8; 32], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut ck = [0u8; 32];
    hkdf_expand(rk, None, info, &mut ck)?;
    Ok(ck)
}

/// Deterministically derive a `conversationId` from a root key so both
/// participants in a session compute the same value without exchanging one.
/// A truncated HKDF expansion under a fixed domain tag, hex-encoded.
pub fn derive_conversation_id(rk: &[u8; 32]) -> Result<String, CryptoError> {
    let mut id_bytes = [0u8; 16];
    hkdf_expand(rk, None, b"rc-conversation-id-v1", &mut id_bytes)?;
    Ok(hex::encode(id_bytes))
}

/// `KDF_RK(rk, dhOut) -> (rk', chainKey)` — one root-key ratchet step in one
/// direction. The ratchet engine calls this once per DH ratchet with a
/// direction-specific `info` tag (`"ratchet/send"` or `"ratchet/recv"`), so
/// the send and receive chain keys are never derived from the same HKDF call.
pub fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8], info: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    hk.expand(&[info, b"/rk"].concat(), &mut new_root)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(&[info, b"/ck"].concat(), &mut chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_root, chain_key))
}

/// `KDF_CK(ck) -> (ck', mk)` — the symmetric chain step, HMAC-based per the
/// Double Ratchet spec (constant `0x01`/`0x02` inputs keyed by the chain key).
pub fn kdf_ck(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut mac_mk = HmacSha256::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x01]);
    let mk = mac_mk.finalize().into_bytes();

    let mut mac_ck = HmacSha256::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x02]);
    let next_ck = mac_ck.finalize().into_bytes();

    let mut mk_out = [0u8; 32];
    let mut ck_out = [0u8; 32];
    mk_out.copy_from_slice(&mk);
    ck_out.copy_from_slice(&next_ck);
    Ok((ck_out, mk_out))
}
