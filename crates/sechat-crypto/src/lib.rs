//! Cryptographic building blocks for secret chats.
//!
//! This crate provides:
//! - Diffie-Hellman over a validated 2048-bit safe prime (`dh`)
//! - Shared auth keys with SHA-1 fingerprints (`auth_key`)
//! - Packet encryption with length-prefixed, padded plaintext (`packet`)
//! - HKDF-SHA256 packet key derivation (`kdf`)
//!
//! Secrets are held in `Zeroizing` wrappers and never printed by `Debug`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth_key;
pub mod dh;
pub mod error;
pub mod kdf;
pub mod packet;

pub use auth_key::AuthKey;
pub use dh::{DhConfig, DhExchange, PrimeCache};
pub use error::{Error, Result};
