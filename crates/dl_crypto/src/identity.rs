//! Identity and per-device key material.
//!
//! Each *user* (`secretName`) has one long-term Ed25519 signing key.
//! Each *device* additionally holds a long-term X25519 key, a batch of
//! one-time X25519 keys, a batch of one-time ML-KEM-1024 keys, and a
//! "final" ML-KEM keypair used as a fallback once the batch is exhausted.
//! All of the above together form `DeviceKeys`; their signed public halves
//! are published as a `UserConfiguration`.
//!
//! Signed elements are versioned JSON (`version: u8`) so a future wire
//! format change does not break in-flight sessions.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

const DEVICE_CONFIG_VERSION: u8 = 1;
const ONE_TIME_KEY_VERSION: u8 = 1;

// ── Public key newtype ────────────────────────────────────────────────────────

/// Raw public key bytes, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        Ok(Self(bytes))
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes, hex-encoded in groups of 4.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn fingerprints_match(&self, other: &PublicKeyBytes) -> bool {
        let h1 = blake3::hash(&self.0);
        let h2 = blake3::hash(&other.0);
        let mut diff = 0u8;
        for (a, b) in h1.as_bytes().iter().zip(h2.as_bytes().iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

// ── Signing key (long-term identity) ─────────────────────────────────────────

/// Long-term Ed25519 signing key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Self { public, secret_bytes: signing_key.to_bytes() }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("signing key must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Ok(Self { public, secret_bytes: arr })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key().sign(msg).to_bytes().to_vec()
    }

    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk_bytes: [u8; 32] = public_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("bad pubkey len".into()))?;
        let vk = VerifyingKey::from_bytes(&vk_bytes)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("bad sig len".into()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        vk.verify(msg, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// This signing key's public half, converted to X25519 for use as the
    /// device's long-term DH key when a distinct X25519 key is unavailable.
    pub fn to_x25519_public(&self) -> Result<X25519Public, CryptoError> {
        let ed_pub: [u8; 32] = self
            .public
            .0
            .clone()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("public key not 32 bytes".into()))?;
        crate::handshake::ed25519_pub_to_x25519(&ed_pub)
    }

    pub fn public_b64(&self) -> String {
        self.public.to_b64()
    }
}

// ── Long-term X25519 key ──────────────────────────────────────────────────────

#[derive(ZeroizeOnDrop)]
pub struct CurveKeyPair {
    #[zeroize(skip)]
    pub public: X25519Public,
    secret: StaticSecret,
}

impl CurveKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { public, secret }
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret);
        Self { public, secret }
    }
}

// ── One-time curve key ────────────────────────────────────────────────────────

pub struct OneTimeCurveKey {
    pub id: Uuid,
    pub public: X25519Public,
    secret: StaticSecret,
}

impl OneTimeCurveKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { id: Uuid::new_v4(), public, secret }
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn from_parts(id: Uuid, secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = X25519Public::from(&secret);
        Self { id, public, secret }
    }
}

impl Drop for OneTimeCurveKey {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        let mut bytes = self.secret.to_bytes();
        bytes.zeroize();
    }
}

/// Batch of one-time X25519 keypairs for one device.
pub fn generate_one_time_curve_keys(count: usize) -> Vec<OneTimeCurveKey> {
    (0..count).map(|_| OneTimeCurveKey::generate()).collect()
}

// ── One-time / final ML-KEM key ───────────────────────────────────────────────

pub struct MlKemKeyPair {
    pub id: Uuid,
    pub public: mlkem1024::PublicKey,
    secret: mlkem1024::SecretKey,
}

impl MlKemKeyPair {
    pub fn generate() -> Self {
        let (public, secret) = mlkem1024::keypair();
        Self { id: Uuid::new_v4(), public, secret }
    }

    pub fn secret(&self) -> &mlkem1024::SecretKey {
        &self.secret
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        self.secret.as_bytes().to_vec()
    }

    pub fn from_parts(id: Uuid, public_bytes: &[u8], secret_bytes: &[u8]) -> Result<Self, CryptoError> {
        let public = mlkem1024::PublicKey::from_bytes(public_bytes)
            .map_err(|_| CryptoError::InvalidKeyMaterial("malformed ML-KEM public key".into()))?;
        let secret = mlkem1024::SecretKey::from_bytes(secret_bytes)
            .map_err(|_| CryptoError::InvalidKeyMaterial("malformed ML-KEM secret key".into()))?;
        Ok(Self { id, public, secret })
    }
}

impl Drop for MlKemKeyPair {
    fn drop(&mut self) {
        // pqcrypto secret keys do not expose mutable byte access; best
        // effort is to drop the allocation promptly. The secret never
        // leaves this struct in plaintext form elsewhere.
    }
}

pub fn generate_one_time_mlkem_keys(count: usize) -> Vec<MlKemKeyPair> {
    (0..count).map(|_| MlKemKeyPair::generate()).collect()
}

// ── DeviceKeys ────────────────────────────────────────────────────────────────

/// Private key material local to one device. Owned exclusively by
/// `SessionContext`.
pub struct DeviceKeys {
    pub device_id: Uuid,
    pub signing: SigningKeyPair,
    pub long_term_curve: CurveKeyPair,
    pub one_time_curve: Vec<OneTimeCurveKey>,
    pub one_time_mlkem: Vec<MlKemKeyPair>,
    pub final_mlkem: MlKemKeyPair,
    pub rotate_keys_date: DateTime<Utc>,
}

impl DeviceKeys {
    pub fn generate(device_id: Uuid, batch_size: usize, rotation_interval_days: i64) -> Self {
        Self {
            device_id,
            signing: SigningKeyPair::generate(),
            long_term_curve: CurveKeyPair::generate(),
            one_time_curve: generate_one_time_curve_keys(batch_size),
            one_time_mlkem: generate_one_time_mlkem_keys(batch_size),
            final_mlkem: MlKemKeyPair::generate(),
            rotate_keys_date: Utc::now() + chrono::Duration::days(rotation_interval_days),
        }
    }

    /// Remove one-time keys whose id is not in the remote-authoritative set.
    /// Used by `synchronize_local_keys`.
    pub fn retain_curve_ids(&mut self, remote_ids: &std::collections::HashSet<Uuid>) {
        self.one_time_curve.retain(|k| remote_ids.contains(&k.id));
    }

    pub fn retain_mlkem_ids(&mut self, remote_ids: &std::collections::HashSet<Uuid>) {
        self.one_time_mlkem.retain(|k| remote_ids.contains(&k.id));
    }

    pub fn take_one_time_curve(&mut self, id: Uuid) -> Option<OneTimeCurveKey> {
        let idx = self.one_time_curve.iter().position(|k| k.id == id)?;
        Some(self.one_time_curve.remove(idx))
    }

    pub fn take_one_time_mlkem(&mut self, id: Uuid) -> Option<MlKemKeyPair> {
        let idx = self.one_time_mlkem.iter().position(|k| k.id == id)?;
        Some(self.one_time_mlkem.remove(idx))
    }

    pub fn pop_one_time_curve(&mut self) -> Option<OneTimeCurveKey> {
        if self.one_time_curve.is_empty() {
            None
        } else {
            Some(self.one_time_curve.remove(0))
        }
    }

    pub fn pop_one_time_mlkem(&mut self) -> Option<MlKemKeyPair> {
        if self.one_time_mlkem.is_empty() {
            None
        } else {
            Some(self.one_time_mlkem.remove(0))
        }
    }
}

/// Serialized form of `DeviceKeys`, base64-encoding every secret field.
/// Used to persist a device's full key material inside an encrypted
/// `SessionContext` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceKeysSnapshot {
    pub device_id: Uuid,
    pub signing_secret: String,
    pub long_term_curve_secret: String,
    pub one_time_curve: Vec<(Uuid, String)>,
    pub one_time_mlkem: Vec<(Uuid, String, String)>,
    pub final_mlkem_id: Uuid,
    pub final_mlkem_public: String,
    pub final_mlkem_secret: String,
    pub rotate_keys_date: DateTime<Utc>,
}

impl DeviceKeysSnapshot {
    pub fn from_device_keys(keys: &DeviceKeys) -> Self {
        Self {
            device_id: keys.device_id,
            signing_secret: URL_SAFE_NO_PAD.encode(keys.signing.secret_bytes()),
            long_term_curve_secret: URL_SAFE_NO_PAD.encode(keys.long_term_curve.secret_bytes()),
            one_time_curve: keys
                .one_time_curve
                .iter()
                .map(|k| (k.id, URL_SAFE_NO_PAD.encode(k.secret_bytes())))
                .collect(),
            one_time_mlkem: keys
                .one_time_mlkem
                .iter()
                .map(|k| {
                    (
                        k.id,
                        URL_SAFE_NO_PAD.encode(k.public_bytes()),
                        URL_SAFE_NO_PAD.encode(k.secret_bytes()),
                    )
                })
                .collect(),
            final_mlkem_id: keys.final_mlkem.id,
            final_mlkem_public: URL_SAFE_NO_PAD.encode(keys.final_mlkem.public_bytes()),
            final_mlkem_secret: URL_SAFE_NO_PAD.encode(keys.final_mlkem.secret_bytes()),
            rotate_keys_date: keys.rotate_keys_date,
        }
    }

    pub fn to_device_keys(&self) -> Result<DeviceKeys, CryptoError> {
        let decode = |s: &str| -> Result<Vec<u8>, CryptoError> {
            URL_SAFE_NO_PAD
                .decode(s)
                .map_err(|_| CryptoError::InvalidKeyMaterial("malformed base64 key material".into()))
        };
        let fixed32 = |v: Vec<u8>| -> Result<[u8; 32], CryptoError> {
            v.try_into()
                .map_err(|_| CryptoError::InvalidKeyMaterial("expected 32-byte key".into()))
        };

        let signing = SigningKeyPair::from_bytes(&decode(&self.signing_secret)?)?;
        let long_term_curve =
            CurveKeyPair::from_secret_bytes(fixed32(decode(&self.long_term_curve_secret)?)?);

        let one_time_curve = self
            .one_time_curve
            .iter()
            .map(|(id, secret)| -> Result<OneTimeCurveKey, CryptoError> {
                Ok(OneTimeCurveKey::from_parts(*id, fixed32(decode(secret)?)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let one_time_mlkem = self
            .one_time_mlkem
            .iter()
            .map(|(id, public, secret)| -> Result<MlKemKeyPair, CryptoError> {
                MlKemKeyPair::from_parts(*id, &decode(public)?, &decode(secret)?)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let final_mlkem = MlKemKeyPair::from_parts(
            self.final_mlkem_id,
            &decode(&self.final_mlkem_public)?,
            &decode(&self.final_mlkem_secret)?,
        )?;

        Ok(DeviceKeys {
            device_id: self.device_id,
            signing,
            long_term_curve,
            one_time_curve,
            one_time_mlkem,
            final_mlkem,
            rotate_keys_date: self.rotate_keys_date,
        })
    }
}

// ── Signed public bundles ─────────────────────────────────────────────────────

/// One linked device's published identity, signed by the account's signing key
/// (or re-signed by the master device's signing key when linked).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedDeviceConfiguration {
    pub version: u8,
    pub device_id: Uuid,
    pub device_name: String,
    pub is_master_device: bool,
    /// Base64 X25519 long-term public key
    pub long_term_curve_pub: String,
    /// Base64 Ed25519 signing public key (device may share the account key)
    pub signing_pub: String,
    /// Base64 ML-KEM-1024 final public key
    pub final_mlkem_pub: String,
    pub issued_at: DateTime<Utc>,
    /// Base64 signature over the canonical payload, by the account signing key
    pub signature: String,
}

impl SignedDeviceConfiguration {
    fn canonical_payload(
        device_id: Uuid,
        device_name: &str,
        is_master_device: bool,
        long_term_curve_pub: &str,
        signing_pub: &str,
        final_mlkem_pub: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = serde_json::json!({
            "device_id": device_id,
            "device_name": device_name,
            "final_mlkem_pub": final_mlkem_pub,
            "is_master_device": is_master_device,
            "issued_at": issued_at.to_rfc3339(),
            "long_term_curve_pub": long_term_curve_pub,
            "signing_pub": signing_pub,
            "version": DEVICE_CONFIG_VERSION,
        });
        Ok(serde_json::to_vec(&payload)?)
    }

    pub fn issue(
        account_signing: &SigningKeyPair,
        device: &DeviceKeys,
        device_name: &str,
        is_master_device: bool,
    ) -> Result<Self, CryptoError> {
        let long_term_curve_pub = URL_SAFE_NO_PAD.encode(device.long_term_curve.public.as_bytes());
        let signing_pub = device.signing.public_b64();
        let final_mlkem_pub = URL_SAFE_NO_PAD.encode(device.final_mlkem.public_bytes());
        let issued_at = Utc::now();

        let payload = Self::canonical_payload(
            device.device_id,
            device_name,
            is_master_device,
            &long_term_curve_pub,
            &signing_pub,
            &final_mlkem_pub,
            issued_at,
        )?;
        let signature = URL_SAFE_NO_PAD.encode(account_signing.sign(&payload));

        Ok(Self {
            version: DEVICE_CONFIG_VERSION,
            device_id: device.device_id,
            device_name: device_name.to_string(),
            is_master_device,
            long_term_curve_pub,
            signing_pub,
            final_mlkem_pub,
            issued_at,
            signature,
        })
    }

    pub fn verify(&self, account_signing_pub: &PublicKeyBytes) -> Result<(), CryptoError> {
        let payload = Self::canonical_payload(
            self.device_id,
            &self.device_name,
            self.is_master_device,
            &self.long_term_curve_pub,
            &self.signing_pub,
            &self.final_mlkem_pub,
            self.issued_at,
        )?;
        let sig = URL_SAFE_NO_PAD.decode(&self.signature)?;
        SigningKeyPair::verify(&account_signing_pub.0, &payload, &sig)
    }
}

/// One published one-time public key (curve or ML-KEM), signed by the
/// owning device's signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    pub version: u8,
    pub id: Uuid,
    pub device_id: Uuid,
    /// Base64-encoded public key bytes
    pub public_key: String,
    pub signature: String,
}

impl SignedOneTimeKey {
    fn canonical_payload(id: Uuid, device_id: Uuid, public_key: &str) -> Vec<u8> {
        let payload = serde_json::json!({
            "device_id": device_id,
            "id": id,
            "public_key": public_key,
            "version": ONE_TIME_KEY_VERSION,
        });
        serde_json::to_vec(&payload).expect("json serialisation of primitives cannot fail")
    }

    pub fn sign_curve(
        device_signing: &SigningKeyPair,
        device_id: Uuid,
        key: &OneTimeCurveKey,
    ) -> Self {
        let public_key = URL_SAFE_NO_PAD.encode(key.public.as_bytes());
        let payload = Self::canonical_payload(key.id, device_id, &public_key);
        let signature = URL_SAFE_NO_PAD.encode(device_signing.sign(&payload));
        Self { version: ONE_TIME_KEY_VERSION, id: key.id, device_id, public_key, signature }
    }

    pub fn sign_mlkem(device_signing: &SigningKeyPair, device_id: Uuid, key: &MlKemKeyPair) -> Self {
        let public_key = URL_SAFE_NO_PAD.encode(key.public_bytes());
        let payload = Self::canonical_payload(key.id, device_id, &public_key);
        let signature = URL_SAFE_NO_PAD.encode(device_signing.sign(&payload));
        Self { version: ONE_TIME_KEY_VERSION, id: key.id, device_id, public_key, signature }
    }

    pub fn verify(&self, device_signing_pub: &PublicKeyBytes) -> Result<(), CryptoError> {
        let payload = Self::canonical_payload(self.id, self.device_id, &self.public_key);
        let sig = URL_SAFE_NO_PAD.decode(&self.signature)?;
        SigningKeyPair::verify(&device_signing_pub.0, &payload, &sig)
    }
}

/// The per-user public bundle published to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfiguration {
    pub signing_public_key: String,
    pub devices: Vec<SignedDeviceConfiguration>,
    pub one_time_curve_keys: Vec<SignedOneTimeKey>,
    pub one_time_mlkem_keys: Vec<SignedOneTimeKey>,
}

impl UserConfiguration {
    /// Verify every signed element under `signing_public_key`.
    pub fn verify_all(&self) -> Result<(), CryptoError> {
        let account_pub = PublicKeyBytes::from_b64(&self.signing_public_key)?;
        for d in &self.devices {
            d.verify(&account_pub)?;
        }
        for k in self.one_time_curve_keys.iter().chain(self.one_time_mlkem_keys.iter()) {
            let device_pub = self
                .devices
                .iter()
                .find(|d| d.device_id == k.device_id)
                .ok_or_else(|| CryptoError::InvalidKeyMaterial("one-time key has no owning device".into()))?;
            let device_signing_pub = PublicKeyBytes::from_b64(&device_pub.signing_pub)?;
            k.verify(&device_signing_pub)?;
        }
        Ok(())
    }
}

/// Generate a fresh `(DeviceKeys, UserConfiguration)` pair for a new device.
pub fn generate_device_bundle(
    device_id: Uuid,
    device_name: &str,
    is_master: bool,
    account_signing: &SigningKeyPair,
    batch_size: usize,
    rotation_interval_days: i64,
) -> (DeviceKeys, UserConfiguration) {
    let device = DeviceKeys::generate(device_id, batch_size, rotation_interval_days);

    let device_config =
        SignedDeviceConfiguration::issue(account_signing, &device, device_name, is_master)
            .expect("signing freshly generated keys cannot fail");

    let one_time_curve_keys = device
        .one_time_curve
        .iter()
        .map(|k| SignedOneTimeKey::sign_curve(&device.signing, device_id, k))
        .collect();
    let one_time_mlkem_keys = device
        .one_time_mlkem
        .iter()
        .map(|k| SignedOneTimeKey::sign_mlkem(&device.signing, device_id, k))
        .collect();

    let config = UserConfiguration {
        signing_public_key: account_signing.public_b64(),
        devices: vec![device_config],
        one_time_curve_keys,
        one_time_mlkem_keys,
    };

    (device, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_bundle_verifies() {
        let account = SigningKeyPair::generate();
        let device_id = Uuid::new_v4();
        let (device, config) = generate_device_bundle(device_id, "laptop", true, &account, 10, 7);

        config.verify_all().unwrap();
        assert_eq!(device.one_time_curve.len(), 10);
        assert_eq!(device.one_time_mlkem.len(), 10);
        assert_eq!(config.devices[0].device_id, device_id);
    }

    #[test]
    fn tampered_device_config_fails_verification() {
        let account = SigningKeyPair::generate();
        let device_id = Uuid::new_v4();
        let (_device, mut config) = generate_device_bundle(device_id, "phone", false, &account, 2, 7);
        config.devices[0].device_name = "attacker-renamed".into();
        assert!(config.verify_all().is_err());
    }

    #[test]
    fn synchronize_local_keys_drops_consumed_ids() {
        let account = SigningKeyPair::generate();
        let device_id = Uuid::new_v4();
        let (mut device, _config) = generate_device_bundle(device_id, "laptop", true, &account, 5, 7);

        let remaining: std::collections::HashSet<Uuid> =
            device.one_time_curve.iter().skip(2).map(|k| k.id).collect();
        device.retain_curve_ids(&remaining);
        assert_eq!(device.one_time_curve.len(), 3);
    }
}
