//! dl_crypto — post-quantum E2EE session engine cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity`   — signing/curve/ML-KEM device key material, signed bundles
//! - `handshake`  — PQXDH key agreement (classical triple-DH + ML-KEM)
//! - `ratchet`    — Double Ratchet with DH ratchet steps + skipped message keys
//! - `aead`       — AES-256-GCM seal/open helpers
//! - `kdf`        — HKDF / Argon2id key derivation
//! - `hash`       — BLAKE3 utilities (message IDs, chain links)
//! - `error`      — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod handshake;
pub mod identity;
pub mod kdf;
pub mod ratchet;

pub use error::CryptoError;
