//! Authenticated Encryption with Associated Data
//!
//! AES-256-GCM, 96-bit nonce, 128-bit tag, per §4.1.
//!
//! Two entry points:
//! - `seal`/`open` take an explicit caller-supplied nonce. Used by the
//!   ratchet, where the nonce must be a deterministic function of the
//!   message index `N` (see `ratchet::nonce_for_index`) so that two
//!   independent reconstructions of a session derive identical wire bytes.
//! - `encrypt`/`decrypt` generate/consume a random nonce prepended to the
//!   ciphertext. Used for at-rest encryption (vault, store) where no
//!   counter is available and nonce reuse must be avoided by randomness
//!   instead.
//!
//! Wire format for `encrypt`/`decrypt`: `[ nonce (12 bytes) | ciphertext + tag ]`

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Seal `plaintext` under `key` with an explicit 96-bit `nonce`.
/// `aad` is authenticated but not encrypted.
pub fn seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Open ciphertext produced by `seal` with the same nonce and AAD.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt with a fresh random nonce, prepended to the output.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (`nonce || ciphertext+tag`) produced by `encrypt`.
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| CryptoError::AeadDecrypt)?;
    open(key, &nonce, ct, aad)
}

/// Encrypt a 32-byte key with another 32-byte wrapping key (key transport).
pub fn wrap_key(wrap_key: &[u8; 32], key_to_wrap: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    encrypt(wrap_key, key_to_wrap, b"dl-key-wrap")
}

/// Decrypt a wrapped key.
pub fn unwrap_key(wrap_key: &[u8; 32], wrapped: &[u8]) -> Result<[u8; 32], CryptoError> {
    let plaintext = decrypt(wrap_key, wrapped, b"dl-key-wrap")?;
    if plaintext.len() != 32 {
        return Err(CryptoError::InvalidKeyMaterial("Unwrapped key wrong length".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip_with_explicit_nonce() {
        let key = [7u8; 32];
        let nonce = [0u8; NONCE_LEN];
        let ct = seal(&key, &nonce, b"hello", b"aad").unwrap();
        let pt = open(&key, &nonce, &ct, b"aad").unwrap();
        assert_eq!(&pt[..], b"hello");
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let key = [7u8; 32];
        let nonce = [1u8; NONCE_LEN];
        let ct = seal(&key, &nonce, b"hello", b"aad-a").unwrap();
        assert!(open(&key, &nonce, &ct, b"aad-b").is_err());
    }

    #[test]
    fn encrypt_decrypt_roundtrip_random_nonce() {
        let key = [9u8; 32];
        let ct = encrypt(&key, b"vault secret", b"dl-store-v1").unwrap();
        let pt = decrypt(&key, &ct, b"dl-store-v1").unwrap();
        assert_eq!(&pt[..], b"vault secret");
    }

    #[test]
    fn wrap_unwrap_key_roundtrip() {
        let wrap = [3u8; 32];
        let inner = [5u8; 32];
        let wrapped = wrap_key(&wrap, &inner).unwrap();
        let unwrapped = unwrap_key(&wrap, &wrapped).unwrap();
        assert_eq!(unwrapped, inner);
    }
}
