use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Ratchet holder not initialised")]
    SessionNotInitialised,

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("Counter replay or gap: header counter below current receive counter with no skipped key on record")]
    CounterReplayOrGap,

    #[error("Too many skipped message keys on this chain (limit {limit})")]
    TooManySkipped { limit: u32 },

    #[error("Counter would overflow the platform's safe integer range")]
    CounterOverflow,

    #[error("Prekey error: {0}")]
    PrekeyError(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
