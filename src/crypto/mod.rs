//! # Cryptography Utilities
//!
//! Primitives backing the session key agreement and the encrypted frame
//! envelope: Curve25519 key pairs, HKDF-SHA256, HMAC-SHA256 and AES-256-CBC.

pub mod cbc;
pub mod hkdf;
pub mod hmac;
pub mod key_pair;
