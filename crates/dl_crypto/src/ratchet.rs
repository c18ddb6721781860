//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then DELETED)
//!
//! AEAD: AES-256-GCM, nonce = 96-bit big-endian encoding of the message
//! index `N` within the current sending/receiving chain (never random —
//! two independent reconstructions of the same chain must produce
//! identical wire bytes). Associated data is the ratchet header
//! (`DH_pub || PN || N`) concatenated with a process-wide `associated_data`
//! constant fixed at session creation.
//!
//! Receive never mutates state on failure: a bad AEAD tag or an
//! unrecognised header leaves `skipped`, the chain keys and the DH
//! ratchet state exactly as they were.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::aead;
use crate::error::{CryptoError, RatchetError};

/// Default bound on the skipped-message-key map, per §6 Configuration
/// (`maxSkippedMessageKeys`). Callers may override via `with_max_skipped`.
pub const DEFAULT_MAX_SKIPPED_MESSAGE_KEYS: u64 = 1000;

/// Derive the 96-bit AES-GCM nonce for message index `N` within a chain:
/// four zero bytes followed by the big-endian encoding of `N`.
pub fn nonce_for_index(n: u64) -> [u8; aead::NONCE_LEN] {
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[4..].copy_from_slice(&n.to_be_bytes());
    nonce
}

// ── Ratchet header (included in every message, unencrypted) ──────────────────

/// Sent alongside every ciphertext so the recipient can advance their ratchet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key (base64)
    pub dh_pub: String,
    /// Message number in the current sending chain
    pub n: u64,
    /// Number of messages in the previous sending chain (for skip handling)
    pub pn: u64,
}

fn header_aad(dh_pub: &X25519Public, n: u64, pn: u64, associated_data: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + 8 + 8 + associated_data.len());
    aad.extend_from_slice(dh_pub.as_bytes());
    aad.extend_from_slice(&pn.to_be_bytes());
    aad.extend_from_slice(&n.to_be_bytes());
    aad.extend_from_slice(associated_data);
    aad
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet session state. Stored encrypted in the local vault.
#[derive(Serialize, Deserialize)]
pub struct RatchetSession {
    pub session_id: String,
    pub peer_user_id: String,

    root_key: [u8; 32],

    dh_send_secret: [u8; 32],
    #[serde(with = "pub_key_serde")]
    dh_send_pub: X25519Public,
    send_ck: [u8; 32],
    pub send_n: u64,

    #[serde(with = "option_pub_key_serde")]
    dh_recv_pub: Option<X25519Public>,
    recv_ck: [u8; 32],
    pub recv_n: u64,
    pub prev_send_n: u64,

    /// (base64 dh_pub, message_n) → message_key. Bounded by `max_skipped`;
    /// insertion order is preserved so overflow eviction is strict-FIFO.
    skipped_keys: HashMap<(String, u64), [u8; 32]>,
    skipped_order: Vec<(String, u64)>,

    max_skipped: u64,

    /// Process-wide constant folded into every AEAD's associated data.
    associated_data: Vec<u8>,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for mk in self.skipped_keys.values_mut() {
            mk.zeroize();
        }
    }
}

// ── Construction ─────────────────────────────────────────────────────────────

impl RatchetSession {
    /// Create a new session as the INITIATOR.
    ///
    /// The initiator has `root_key` from the handshake and the responder's
    /// signed-prekey public key, which becomes the first "received" DH
    /// ratchet key; it immediately performs a DH ratchet step.
    pub fn init_alice(
        session_id: String,
        peer_user_id: String,
        root_key: [u8; 32],
        peer_spk_pub: &X25519Public,
        associated_data: Vec<u8>,
        max_skipped: u64,
    ) -> Result<Self, CryptoError> {
        let dh_send_secret = StaticSecret::random_from_rng(OsRng);
        let dh_send_pub = X25519Public::from(&dh_send_secret);

        let dh_output = dh_send_secret.diffie_hellman(peer_spk_pub);
        let (new_rk, new_ck) = kdf_rk(&root_key, dh_output.as_bytes())?;

        Ok(Self {
            session_id,
            peer_user_id,
            root_key: new_rk,
            dh_send_secret: dh_send_secret.to_bytes(),
            dh_send_pub,
            send_ck: new_ck,
            send_n: 0,
            dh_recv_pub: Some(*peer_spk_pub),
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
            skipped_order: Vec::new(),
            max_skipped,
            associated_data,
        })
    }

    /// Create a new session as the RESPONDER.
    ///
    /// The responder has `root_key` from the handshake; its signed-prekey
    /// secret is the initial DH ratchet key. No DH ratchet has happened yet
    /// — that occurs on receipt of the initiator's first message.
    pub fn init_bob(
        session_id: String,
        peer_user_id: String,
        root_key: [u8; 32],
        my_spk_secret: &StaticSecret,
        my_spk_pub: &X25519Public,
        associated_data: Vec<u8>,
        max_skipped: u64,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            session_id,
            peer_user_id,
            root_key,
            dh_send_secret: my_spk_secret.to_bytes(),
            dh_send_pub: *my_spk_pub,
            send_ck: [0u8; 32],
            send_n: 0,
            dh_recv_pub: None,
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
            skipped_order: Vec::new(),
            max_skipped,
            associated_data,
        })
    }

    // ── Send ─────────────────────────────────────────────────────────────

    /// Advance the sending chain and AEAD-seal `plaintext`.
    pub fn encrypt_message(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>), RatchetError> {
        let (new_ck, mk) = kdf_ck(&self.send_ck)?;
        let header = RatchetHeader {
            dh_pub: URL_SAFE_NO_PAD.encode(self.dh_send_pub.as_bytes()),
            n: self.send_n,
            pn: self.prev_send_n,
        };

        let nonce = nonce_for_index(header.n);
        let aad = header_aad(&self.dh_send_pub, header.n, header.pn, &self.associated_data);
        let ciphertext = aead::seal(&mk, &nonce, plaintext, &aad).map_err(RatchetError::Crypto)?;

        self.send_ck = new_ck;
        self.send_n += 1;

        Ok((header, ciphertext))
    }

    // ── Receive ──────────────────────────────────────────────────────────

    /// Decrypt a received message, advancing the ratchet only on success.
    pub fn decrypt_message(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let peer_dh_bytes = URL_SAFE_NO_PAD
            .decode(&header.dh_pub)
            .map_err(|e| RatchetError::Crypto(CryptoError::Base64Decode(e)))?;
        let peer_dh = X25519Public::from(
            <[u8; 32]>::try_from(peer_dh_bytes.as_slice())
                .map_err(|_| RatchetError::Crypto(CryptoError::InvalidKeyMaterial("bad ratchet DH pub".into())))?,
        );

        // Skipped-key hit: try it without mutating the map until AEAD succeeds.
        let skip_key = (header.dh_pub.clone(), header.n);
        if let Some(mk) = self.skipped_keys.get(&skip_key).copied() {
            let nonce = nonce_for_index(header.n);
            let aad = header_aad(&peer_dh, header.n, header.pn, &self.associated_data);
            let plaintext = aead::open(&mk, &nonce, ciphertext, &aad)
                .map_err(|_| RatchetError::AuthenticationFailure)?;
            self.skipped_keys.remove(&skip_key);
            self.skipped_order.retain(|k| k != &skip_key);
            return Ok(plaintext.to_vec());
        }

        let need_dh_ratchet = match self.dh_recv_pub {
            Some(ref current) => current.as_bytes() != peer_dh.as_bytes(),
            None => true,
        };

        // Stage every mutation locally; only commit to `self` after the
        // AEAD open below succeeds.
        let mut staged_root_key = self.root_key;
        let mut staged_recv_ck = self.recv_ck;
        let mut staged_recv_n = self.recv_n;
        let mut staged_send_ck = self.send_ck;
        let mut staged_send_n = self.send_n;
        let mut staged_prev_send_n = self.prev_send_n;
        let mut staged_dh_send_secret = self.dh_send_secret;
        let mut staged_dh_send_pub = self.dh_send_pub;
        let mut staged_dh_recv_pub = self.dh_recv_pub;
        let mut new_skips: Vec<((String, u64), [u8; 32])> = Vec::new();

        if need_dh_ratchet {
            if self.dh_recv_pub.is_some() {
                stage_skip_keys(
                    &self.dh_recv_pub,
                    &mut staged_recv_ck,
                    &mut staged_recv_n,
                    header.pn,
                    self.max_skipped,
                    &mut new_skips,
                )?;
            }

            staged_dh_recv_pub = Some(peer_dh);

            let dh_recv_output = StaticSecret::from(staged_dh_send_secret).diffie_hellman(&peer_dh);
            let (new_rk, new_recv_ck) = kdf_rk(&staged_root_key, dh_recv_output.as_bytes())
                .map_err(RatchetError::Crypto)?;
            staged_root_key = new_rk;
            staged_recv_ck = new_recv_ck;
            staged_recv_n = 0;

            staged_prev_send_n = staged_send_n;
            staged_send_n = 0;
            let new_dh = StaticSecret::random_from_rng(OsRng);
            staged_dh_send_pub = X25519Public::from(&new_dh);
            let dh_send_output = new_dh.diffie_hellman(&peer_dh);
            let (new_rk2, new_send_ck) =
                kdf_rk(&staged_root_key, dh_send_output.as_bytes()).map_err(RatchetError::Crypto)?;
            staged_root_key = new_rk2;
            staged_send_ck = new_send_ck;
            staged_dh_send_secret = new_dh.to_bytes();
        }

        stage_skip_keys(
            &staged_dh_recv_pub,
            &mut staged_recv_ck,
            &mut staged_recv_n,
            header.n,
            self.max_skipped,
            &mut new_skips,
        )?;

        let (final_ck, mk) = kdf_ck(&staged_recv_ck).map_err(RatchetError::Crypto)?;
        let nonce = nonce_for_index(header.n);
        let aad = header_aad(&peer_dh, header.n, header.pn, &self.associated_data);
        let plaintext = aead::open(&mk, &nonce, ciphertext, &aad)
            .map_err(|_| RatchetError::AuthenticationFailure)?;

        // AEAD succeeded: commit every staged mutation.
        self.root_key = staged_root_key;
        self.recv_ck = final_ck;
        self.recv_n = staged_recv_n + 1;
        self.send_ck = staged_send_ck;
        self.send_n = staged_send_n;
        self.prev_send_n = staged_prev_send_n;
        self.dh_send_secret = staged_dh_send_secret;
        self.dh_send_pub = staged_dh_send_pub;
        self.dh_recv_pub = staged_dh_recv_pub;
        for (key, mk) in new_skips {
            self.skipped_keys.insert(key.clone(), mk);
            self.skipped_order.push(key);
        }
        self.evict_oldest_skipped_if_over_bound();

        Ok(plaintext.to_vec())
    }

    fn evict_oldest_skipped_if_over_bound(&mut self) {
        while self.skipped_keys.len() as u64 > self.max_skipped {
            if self.skipped_order.is_empty() {
                break;
            }
            let oldest = self.skipped_order.remove(0);
            if let Some(mut mk) = self.skipped_keys.remove(&oldest) {
                mk.zeroize();
            }
        }
    }

    pub fn our_ratchet_pub(&self) -> X25519Public {
        self.dh_send_pub
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped_keys.len()
    }
}

/// Derive and stash message keys for `recv_n..until` of the chain keyed by
/// `dh_recv_pub` into `out`, advancing the local `recv_ck`/`recv_n` copies.
/// Fails with `MaxSkippedHeadersExceeded` (no mutation of `out`) if the
/// single step would need more than `max_skipped` additional keys.
fn stage_skip_keys(
    dh_recv_pub: &Option<X25519Public>,
    recv_ck: &mut [u8; 32],
    recv_n: &mut u64,
    until: u64,
    max_skipped: u64,
    out: &mut Vec<((String, u64), [u8; 32])>,
) -> Result<(), RatchetError> {
    if until < *recv_n {
        return Ok(());
    }
    let skip_count = until - *recv_n;
    if skip_count > max_skipped {
        return Err(RatchetError::MaxSkippedHeadersExceeded { requested: skip_count, limit: max_skipped });
    }

    let dh_pub_b64 = dh_recv_pub.map(|k| URL_SAFE_NO_PAD.encode(k.as_bytes())).unwrap_or_default();

    let mut ck = *recv_ck;
    let mut n = *recv_n;
    let mut staged = Vec::with_capacity(skip_count as usize);
    while n < until {
        let (new_ck, mk) = kdf_ck(&ck).map_err(RatchetError::Crypto)?;
        ck = new_ck;
        staged.push(((dh_pub_b64.clone(), n), mk));
        n += 1;
    }

    *recv_ck = ck;
    *recv_n = n;
    out.extend(staged);
    Ok(())
}

// ── KDF helpers (per Signal spec) ────────────────────────────────────────────

fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(rk), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    hk.expand(b"dl-ratchet-rk", &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"dl-ratchet-ck", &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck =
        HmacSha256::new_from_slice(ck).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]);
    let new_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk =
        HmacSha256::new_from_slice(ck).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]);
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((new_ck, mk))
}

// ── Serde helpers for X25519Public ───────────────────────────────────────────

mod pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S>(key: &X25519Public, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<X25519Public, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(X25519Public::from(arr))
    }
}

mod option_pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S>(key: &Option<X25519Public>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match key {
            Some(k) => serializer.serialize_some(&URL_SAFE_NO_PAD.encode(k.as_bytes())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<X25519Public>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            None => Ok(None),
            Some(s) => {
                let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] =
                    bytes.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(X25519Public::from(arr)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_pair(max_skipped: u64) -> (RatchetSession, RatchetSession) {
        let root_key = [42u8; 32];
        let spk = StaticSecret::random_from_rng(OsRng);
        let spk_pub = X25519Public::from(&spk);

        let alice = RatchetSession::init_alice(
            "sess-1".into(),
            "bob".into(),
            root_key,
            &spk_pub,
            b"dl-associated-v1".to_vec(),
            max_skipped,
        )
        .unwrap();
        let bob = RatchetSession::init_bob(
            "sess-1".into(),
            "alice".into(),
            root_key,
            &spk,
            &spk_pub,
            b"dl-associated-v1".to_vec(),
            max_skipped,
        )
        .unwrap();
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = fresh_pair(DEFAULT_MAX_SKIPPED_MESSAGE_KEYS);

        for i in 0..3 {
            let (header, ct) = alice.encrypt_message(format!("alice-{i}").as_bytes()).unwrap();
            let pt = bob.decrypt_message(&header, &ct).unwrap();
            assert_eq!(pt, format!("alice-{i}").into_bytes());
        }

        for i in 0..2 {
            let (header, ct) = bob.encrypt_message(format!("bob-{i}").as_bytes()).unwrap();
            let pt = alice.decrypt_message(&header, &ct).unwrap();
            assert_eq!(pt, format!("bob-{i}").into_bytes());
        }

        let (header, ct) = alice.encrypt_message(b"alice-again").unwrap();
        let pt = bob.decrypt_message(&header, &ct).unwrap();
        assert_eq!(pt, b"alice-again");
    }

    #[test]
    fn out_of_order_messages() {
        let (mut alice, mut bob) = fresh_pair(DEFAULT_MAX_SKIPPED_MESSAGE_KEYS);

        let (h0, c0) = alice.encrypt_message(b"zero").unwrap();
        let (h1, c1) = alice.encrypt_message(b"one").unwrap();
        let (h2, c2) = alice.encrypt_message(b"two").unwrap();

        assert_eq!(bob.decrypt_message(&h2, &c2).unwrap(), b"two");
        assert_eq!(bob.skipped_len(), 2);
        assert_eq!(bob.decrypt_message(&h0, &c0).unwrap(), b"zero");
        assert_eq!(bob.decrypt_message(&h1, &c1).unwrap(), b"one");
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn tampered_ciphertext_fails_without_mutating_state() {
        let (mut alice, mut bob) = fresh_pair(DEFAULT_MAX_SKIPPED_MESSAGE_KEYS);
        let (header, mut ct) = alice.encrypt_message(b"hello").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;

        let recv_n_before = bob.recv_n;
        let err = bob.decrypt_message(&header, &ct);
        assert!(matches!(err, Err(RatchetError::AuthenticationFailure)));
        assert_eq!(bob.recv_n, recv_n_before);
    }

    #[test]
    fn single_step_skip_overflow_is_a_strict_error() {
        let (mut alice, mut bob) = fresh_pair(5);
        let mut last = None;
        for i in 0..10u32 {
            last = Some(alice.encrypt_message(format!("msg-{i}").as_bytes()).unwrap());
        }
        let (header, ct) = last.unwrap();
        let err = bob.decrypt_message(&header, &ct);
        assert!(matches!(err, Err(RatchetError::MaxSkippedHeadersExceeded { .. })));
        assert_eq!(bob.recv_n, 0, "failed step must not partially advance recv_n");
    }
}
