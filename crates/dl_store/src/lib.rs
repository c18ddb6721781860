//! dl_store — the persistence contract (§6 Store), plus a reference SQLite
//! implementation good enough to run the session engine and its tests.
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. Application-level encryption is used:
//! - Sensitive columns (message bodies, ratchet state, key material) are
//!   stored as AES-256-GCM ciphertext, base64-encoded.
//! - The vault key is derived from the app password via Argon2id and held
//!   in memory only while the app is unlocked.
//! - Non-sensitive metadata (timestamps, IDs, sequence numbers) is stored
//!   in plaintext to allow efficient queries and ordering.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.

pub mod db;
pub mod error;
pub mod models;
pub mod vault;

pub use db::{SqliteStore, Store};
pub use error::StoreError;
pub use vault::Vault;
