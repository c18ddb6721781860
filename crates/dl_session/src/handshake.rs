//! PQXDH handshake orchestration (§4.5): picks the concrete key material
//! out of `SessionUser`/`SessionIdentity`/`UserConfiguration` and drives
//! `dl_crypto::handshake` + `RatchetSession` construction.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dl_crypto::handshake::{self, ed25519_pub_to_x25519, ed25519_secret_to_x25519, HandshakeBundle};
use dl_crypto::identity::{PublicKeyBytes, SignedOneTimeKey, UserConfiguration};
use dl_crypto::ratchet::RatchetSession;
use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::PublicKey as _;
use uuid::Uuid;
use x25519_dalek::PublicKey as X25519Public;

use crate::error::SessionError;
use crate::session_context::SessionUser;

fn x25519_from_b64(s: &str) -> Result<X25519Public, SessionError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| SessionError::ConfigurationError("malformed X25519 public key".into()))?;
    x25519_from_bytes(&bytes)
}

fn x25519_from_bytes(bytes: &[u8]) -> Result<X25519Public, SessionError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SessionError::ConfigurationError("X25519 public key is not 32 bytes".into()))?;
    Ok(X25519Public::from(arr))
}

fn mlkem_pub_from_b64(s: &str) -> Result<mlkem1024::PublicKey, SessionError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| SessionError::ConfigurationError("malformed ML-KEM public key".into()))?;
    mlkem1024::PublicKey::from_bytes(&bytes)
        .map_err(|_| SessionError::ConfigurationError("malformed ML-KEM public key".into()))
}

/// Resolve which of the remote's published one-time keys to consume,
/// preferring the oldest-published entry so a device's batch drains in
/// order. Returns `None` when the batch is empty (handshake falls back to
/// the remote's final key).
fn pick_one_time<'a>(keys: &'a [SignedOneTimeKey], device_id: Uuid) -> Option<&'a SignedOneTimeKey> {
    keys.iter().find(|k| k.device_id == device_id)
}

/// This device initiates a session towards one remote device. Consumes
/// (by reference only — the remote owns the private halves) one of the
/// remote's published one-time keys if available.
///
/// Returns the freshly constructed `RatchetSession` (as the initiator)
/// plus the `HandshakeBundle` to ship alongside the first message.
pub fn initiate_towards(
    local: &SessionUser,
    remote_device_id: Uuid,
    remote_config: &UserConfiguration,
    remote_long_term_curve: &PublicKeyBytes,
    remote_signing: &PublicKeyBytes,
    remote_final_mlkem: &PublicKeyBytes,
    associated_data: Vec<u8>,
    max_skipped: u64,
) -> Result<(RatchetSession, HandshakeBundle), SessionError> {
    let my_identity_priv = ed25519_secret_to_x25519(local.account_signing.secret_bytes());
    let remote_signing_arr: [u8; 32] = remote_signing
        .0
        .as_slice()
        .try_into()
        .map_err(|_| SessionError::ConfigurationError("signing key is not 32 bytes".into()))?;
    let b_identity_pub = ed25519_pub_to_x25519(&remote_signing_arr)?;
    let b_signed_prekey_pub = x25519_from_bytes(&remote_long_term_curve.0)?;

    let curve_key = pick_one_time(&remote_config.one_time_curve_keys, remote_device_id);
    let b_one_time_curve = curve_key
        .map(|k| -> Result<(Uuid, X25519Public), SessionError> {
            Ok((k.id, x25519_from_b64(&k.public_key)?))
        })
        .transpose()?;

    let mlkem_key = pick_one_time(&remote_config.one_time_mlkem_keys, remote_device_id);
    let b_mlkem_one_time = mlkem_key
        .map(|k| -> Result<(Uuid, mlkem1024::PublicKey), SessionError> {
            Ok((k.id, mlkem_pub_from_b64(&k.public_key)?))
        })
        .transpose()?;

    let b_mlkem_final = mlkem_pub_from_b64(&remote_final_mlkem.to_b64())?;

    let result = handshake::initiate(
        &my_identity_priv,
        &b_identity_pub,
        &b_signed_prekey_pub,
        b_one_time_curve.as_ref().map(|(id, pk)| (*id, pk)),
        b_mlkem_one_time.as_ref().map(|(id, pk)| (*id, pk)),
        &b_mlkem_final,
    )?;

    let session_id = Uuid::new_v4().to_string();
    let ratchet = RatchetSession::init_alice(
        session_id,
        remote_device_id.to_string(),
        result.root_key,
        &b_signed_prekey_pub,
        associated_data,
        max_skipped,
    )?;

    Ok((ratchet, result.bundle))
}

/// This device responds to an incoming `HandshakeBundle` from `remote_device_id`.
/// Consumes (removes) the matching one-time private key(s) from
/// `local`'s own `DeviceKeys` — per §5, one-time private keys are deleted
/// the moment a handshake referencing them succeeds.
pub fn respond_to(
    local: &mut SessionUser,
    remote_device_id: Uuid,
    remote_signing: &PublicKeyBytes,
    bundle: &HandshakeBundle,
    associated_data: Vec<u8>,
    max_skipped: u64,
) -> Result<RatchetSession, SessionError> {
    let my_identity_priv = ed25519_secret_to_x25519(local.account_signing.secret_bytes());
    let remote_signing_arr: [u8; 32] = remote_signing
        .0
        .as_slice()
        .try_into()
        .map_err(|_| SessionError::ConfigurationError("signing key is not 32 bytes".into()))?;
    let a_identity_pub = ed25519_pub_to_x25519(&remote_signing_arr)?;

    let my_spk_pub = local.device_keys.long_term_curve.public;

    if let Some(id) = bundle.consumed_curve_key_id {
        local
            .device_keys
            .take_one_time_curve(id)
            .ok_or(SessionError::InvalidKeyId(id))?;
    }

    // Own the consumed one-time key (if any) for the lifetime of this call
    // so its secret can be borrowed without cloning key material.
    let consumed_one_time_mlkem = match bundle.consumed_mlkem_key_id {
        Some(id) => Some(
            local
                .device_keys
                .take_one_time_mlkem(id)
                .ok_or(SessionError::InvalidKeyId(id))?,
        ),
        None => None,
    };
    let my_mlkem_secret = match &consumed_one_time_mlkem {
        Some(consumed) => consumed.secret(),
        None => local.device_keys.final_mlkem.secret(),
    };

    let root_key = handshake::respond(
        &my_identity_priv,
        local.device_keys.long_term_curve.secret(),
        &a_identity_pub,
        my_mlkem_secret,
        bundle,
    )?;

    let session_id = Uuid::new_v4().to_string();
    RatchetSession::init_bob(
        session_id,
        remote_device_id.to_string(),
        root_key,
        local.device_keys.long_term_curve.secret(),
        &my_spk_pub,
        associated_data,
        max_skipped,
    )
    .map_err(SessionError::from)
}

/// Resolve a concurrent mutual-initiation race (§9 Open Question):
/// both sides initiated at once. Tie-break lexicographically on
/// `(secretName, deviceId)` — the lexicographically smaller pair's
/// initiation wins and the other side's in-flight handshake is discarded
/// in favor of responding to the winner's bundle.
pub fn resolve_concurrent_attempt(
    local_secret_name: &str,
    local_device_id: Uuid,
    remote_secret_name: &str,
    remote_device_id: Uuid,
) -> ConcurrentOutcome {
    let local_key = (local_secret_name, local_device_id);
    let remote_key = (remote_secret_name, remote_device_id);
    if local_key < remote_key {
        ConcurrentOutcome::KeepLocalInitiation
    } else {
        ConcurrentOutcome::DiscardLocalInitiation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentOutcome {
    /// This device's own initiation wins; discard the remote's concurrent bundle.
    KeepLocalInitiation,
    /// The remote's initiation wins; discard this device's in-flight attempt
    /// and respond to the remote's bundle instead.
    DiscardLocalInitiation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographically_smaller_pair_wins_concurrent_initiation() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let outcome = resolve_concurrent_attempt("alice", a, "bob", b);
        let expected = if ("alice", a) < ("bob", b) {
            ConcurrentOutcome::KeepLocalInitiation
        } else {
            ConcurrentOutcome::DiscardLocalInitiation
        };
        assert_eq!(outcome, expected);
    }

    #[test]
    fn tie_break_is_symmetric() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let from_alice = resolve_concurrent_attempt("alice", a, "bob", b);
        let from_bob = resolve_concurrent_attempt("bob", b, "alice", a);
        // Exactly one side should "keep" its local initiation.
        let alice_keeps = from_alice == ConcurrentOutcome::KeepLocalInitiation;
        let bob_keeps = from_bob == ConcurrentOutcome::KeepLocalInitiation;
        assert_ne!(alice_keeps, bob_keeps);
    }
}
