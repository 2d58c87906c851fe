use base64::Engine as _;
use base64::prelude::BASE64_STANDARD_NO_PAD;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// An X25519 key pair for the session key agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub private_key: [u8; 32],
}

impl KeyPair {
    /// Generates a new random X25519 key pair.
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_private_key(seed)
    }

    /// Creates a key pair from an existing 32-byte private key.
    pub fn from_private_key(private_key: [u8; 32]) -> Self {
        let private = StaticSecret::from(private_key);
        let public = PublicKey::from(&private);
        Self {
            public_key: *public.as_bytes(),
            private_key: private.to_bytes(),
        }
    }

    /// Computes the X25519 shared secret with a peer's public key.
    pub fn shared_secret(&self, peer_public: [u8; 32]) -> [u8; 32] {
        let private = StaticSecret::from(self.private_key);
        *private
            .diffie_hellman(&PublicKey::from(peer_public))
            .as_bytes()
    }
}

impl Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates the 22-character client identifier carried in the init frame.
/// Stable for the lifetime of a logical session; 16 random bytes, base64
/// without padding.
pub fn generate_client_id() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    BASE64_STANDARD_NO_PAD.encode(raw)
}
