//! PQXDH-style asynchronous key agreement.
//!
//! Combines classical X25519 triple-DH with an ML-KEM-1024 encapsulation,
//! mirroring the X3DH DH1/DH2/DH3 shape but folding in a post-quantum
//! shared secret so the derived root key survives a future quantum
//! adversary even if the classical DHs are later broken.
//!
//! Protocol (A initiates towards B):
//!   dh1 = X25519(A_identity_priv,  B_signed_prekey_pub)
//!   dh2 = X25519(A_ephemeral_priv, B_identity_pub)
//!   dh3 = X25519(A_ephemeral_priv, B_signed_prekey_pub)
//!   (kem_ct, kem_ss) = MLKEM1024.Encapsulate(B_mlkem_pub)
//!   root_key = HKDF-Extract(salt = "PQS-root", ikm = dh1 || dh2 || dh3 || kem_ss)
//!
//! A consumes exactly one of B's one-time curve keys and one of B's
//! one-time ML-KEM keys (falling back to B's long-lived final ML-KEM key
//! when the batch is exhausted). A ships its ephemeral X25519 public key,
//! the consumed key ids (or a `None` sentinel for the final-key fallback),
//! and `kem_ct` alongside the first ratchet message; B mirrors the
//! derivation to reach the same `root_key`.

use hkdf::Hkdf;
use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{
    Ciphertext as PqCiphertext, PublicKey as PqPublicKey, SecretKey as PqSecretKey,
    SharedSecret as PqSharedSecret,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

const ROOT_SALT: &[u8] = b"PQS-root";

/// Convert an Ed25519 signing secret to an X25519 static secret, for
/// devices that reuse their signing key as their long-term DH key.
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

/// Convert an Ed25519 verifying key to its birationally-mapped X25519 public key.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKeyMaterial("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKeyMaterial("Ed25519 public key decompression failed".into()))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Shipped alongside the first ratchet message so the responder can
/// reconstruct `root_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeBundle {
    /// Base64 ephemeral X25519 public key
    pub ephemeral_pub: String,
    /// Which one-time curve key id A consumed, if any
    pub consumed_curve_key_id: Option<Uuid>,
    /// Which ML-KEM key A consumed
    pub consumed_mlkem_key_id: Option<Uuid>,
    /// Base64 ML-KEM ciphertext
    pub kem_ciphertext: String,
}

pub struct HandshakeResult {
    pub root_key: [u8; 32],
    pub bundle: HandshakeBundle,
}

fn b64e(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    URL_SAFE_NO_PAD.encode(bytes)
}

fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)
}

fn extract_root_key(ikm: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(ROOT_SALT), ikm);
    let mut root = [0u8; 32];
    // HKDF-Extract produces a PRK the length of the hash output (32 bytes
    // for SHA-256); `expand` with an empty info string reproduces it here
    // since `hkdf` only exposes the combined extract-then-expand API.
    hk.expand(&[], &mut root).expect("32 <= SHA-256 output length");
    root
}

/// A initiates a handshake towards B.
///
/// `my_identity_priv` — A's long-term X25519 private key.
/// `b_identity_pub` / `b_signed_prekey_pub` — B's long-term and signed-prekey
/// public keys (already verified by the caller via `UserConfiguration`).
/// `b_mlkem_one_time` — one of B's one-time ML-KEM public keys, if any were
/// available; `None` triggers the final-key fallback.
pub fn initiate(
    my_identity_priv: &StaticSecret,
    b_identity_pub: &X25519Public,
    b_signed_prekey_pub: &X25519Public,
    b_one_time_curve: Option<(Uuid, &X25519Public)>,
    b_mlkem_one_time: Option<(Uuid, &mlkem1024::PublicKey)>,
    b_mlkem_final: &mlkem1024::PublicKey,
) -> Result<HandshakeResult, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);

    let dh1 = my_identity_priv.diffie_hellman(b_signed_prekey_pub);
    let dh2 = ephemeral.diffie_hellman(b_identity_pub);
    let dh3 = ephemeral.diffie_hellman(b_signed_prekey_pub);

    let (consumed_mlkem_key_id, kem_pub): (Option<Uuid>, &mlkem1024::PublicKey) =
        match b_mlkem_one_time {
            Some((id, pk)) => (Some(id), pk),
            None => (None, b_mlkem_final),
        };
    let (kem_ss, kem_ct) = mlkem1024::encapsulate(kem_pub);

    let mut ikm = Vec::with_capacity(32 * 3 + kem_ss.as_bytes().len());
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());
    ikm.extend_from_slice(kem_ss.as_bytes());

    let root_key = extract_root_key(&ikm);
    ikm.zeroize();

    Ok(HandshakeResult {
        root_key,
        bundle: HandshakeBundle {
            ephemeral_pub: b64e(ephemeral_pub.as_bytes()),
            consumed_curve_key_id: b_one_time_curve.map(|(id, _)| id),
            consumed_mlkem_key_id,
            kem_ciphertext: b64e(kem_ct.as_bytes()),
        },
    })
}

/// B receives a `HandshakeBundle` from A and reconstructs `root_key`.
///
/// `my_signed_prekey_priv` — B's signed-prekey private key (the DH
/// counterpart A used for dh1/dh3).
/// `my_mlkem_secret` — B's consumed one-time ML-KEM private key, or the
/// final fallback key, matching `bundle.consumed_mlkem_key_id`.
pub fn respond(
    my_identity_priv: &StaticSecret,
    my_signed_prekey_priv: &StaticSecret,
    a_identity_pub: &X25519Public,
    my_mlkem_secret: &mlkem1024::SecretKey,
    bundle: &HandshakeBundle,
) -> Result<[u8; 32], CryptoError> {
    let ephemeral_bytes = b64d(&bundle.ephemeral_pub)?;
    let ephemeral_arr: [u8; 32] = ephemeral_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyMaterial("ephemeral pub must be 32 bytes".into()))?;
    let a_ephemeral_pub = X25519Public::from(ephemeral_arr);

    // Mirror A's DH order (X25519 DH is commutative in the operands used):
    //   dh1 = A_identity  x  B_signed_prekey  ==  B_signed_prekey x A_identity
    //   dh2 = A_ephemeral x  B_identity        ==  B_identity x A_ephemeral
    //   dh3 = A_ephemeral x  B_signed_prekey   ==  B_signed_prekey x A_ephemeral
    let dh1 = my_signed_prekey_priv.diffie_hellman(a_identity_pub);
    let dh2 = my_identity_priv.diffie_hellman(&a_ephemeral_pub);
    let dh3 = my_signed_prekey_priv.diffie_hellman(&a_ephemeral_pub);

    let kem_ct_bytes = b64d(&bundle.kem_ciphertext)?;
    let kem_ct = mlkem1024::Ciphertext::from_bytes(&kem_ct_bytes)
        .map_err(|_| CryptoError::InvalidKeyMaterial("malformed ML-KEM ciphertext".into()))?;
    let kem_ss = mlkem1024::decapsulate(&kem_ct, my_mlkem_secret);

    let mut ikm = Vec::with_capacity(32 * 3 + kem_ss.as_bytes().len());
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());
    ikm.extend_from_slice(kem_ss.as_bytes());

    let root_key = extract_root_key(&ikm);
    ikm.zeroize();

    Ok(root_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pqxdh_roundtrip_with_one_time_keys() {
        let a_identity = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b_identity_priv = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b_identity_pub = X25519Public::from(&b_identity_priv);

        let b_spk_priv = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b_spk_pub = X25519Public::from(&b_spk_priv);

        let b_opk_priv = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b_opk_pub = X25519Public::from(&b_opk_priv);
        let opk_id = Uuid::new_v4();

        let (b_mlkem_pub, b_mlkem_priv) = mlkem1024::keypair();
        let mlkem_id = Uuid::new_v4();
        let (b_mlkem_final_pub, _unused) = mlkem1024::keypair();

        let a_identity_pub = X25519Public::from(&a_identity);

        let result = initiate(
            &a_identity,
            &b_identity_pub,
            &b_spk_pub,
            Some((opk_id, &b_opk_pub)),
            Some((mlkem_id, &b_mlkem_pub)),
            &b_mlkem_final_pub,
        )
        .unwrap();

        assert_eq!(result.bundle.consumed_curve_key_id, Some(opk_id));
        assert_eq!(result.bundle.consumed_mlkem_key_id, Some(mlkem_id));

        let b_root = respond(
            &b_identity_priv,
            &b_spk_priv,
            &a_identity_pub,
            &b_mlkem_priv,
            &result.bundle,
        )
        .unwrap();

        assert_eq!(result.root_key, b_root);
    }

    #[test]
    fn pqxdh_falls_back_to_final_mlkem_key_when_batch_exhausted() {
        let a_identity = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b_identity_priv = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b_identity_pub = X25519Public::from(&b_identity_priv);
        let b_spk_priv = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b_spk_pub = X25519Public::from(&b_spk_priv);
        let (b_mlkem_final_pub, b_mlkem_final_priv) = mlkem1024::keypair();

        let result = initiate(&a_identity, &b_identity_pub, &b_spk_pub, None, None, &b_mlkem_final_pub)
            .unwrap();

        assert_eq!(result.bundle.consumed_curve_key_id, None);
        assert_eq!(result.bundle.consumed_mlkem_key_id, None);

        let a_identity_pub = X25519Public::from(&a_identity);
        let b_root = respond(
            &b_identity_priv,
            &b_spk_priv,
            &a_identity_pub,
            &b_mlkem_final_priv,
            &result.bundle,
        )
        .unwrap();
        assert_eq!(result.root_key, b_root);
    }
}
