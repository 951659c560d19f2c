//! rc_crypto — cryptographic primitives for the secure messaging core.
//!
//! # Design principles
//! - No custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Single-path: no parameter negotiation, no alternative cipher suites.
//!
//! # Module layout
//! - `identity`  — long-term Ed25519 identity keys + per-device signing keys
//! - `x3dh`      — X3DH asynchronous key agreement (SPK verification, fixed DH order)
//! - `prekey_store` — per-device IK/SPK/OPK management
//! - `ratchet`   — double ratchet with DH ratchet steps, skipped keys, and the
//!                 chain-local vs. transport-wide counter split
//! - `aead`      — XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`       — HKDF / Argon2id key derivation
//! - `hash`      — BLAKE3 message-id and content-address utilities
//! - `error`     — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod prekey_store;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
