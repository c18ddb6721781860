use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Certificate validation failed: {0}")]
    CertificateValidation(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

/// Double Ratchet send/receive failures, kept distinct from `CryptoError`
/// because callers (the task processor, §4.7) branch on these specifically
/// to decide whether a re-handshake is warranted.
#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("AEAD authentication failed or unrecognised ratchet header")]
    AuthenticationFailure,

    #[error("skipped-message-key window exceeded (requested {requested}, limit {limit})")]
    MaxSkippedHeadersExceeded { requested: u64, limit: u64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
