use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::key_pair;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Credential blob is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Credential blob failed to deserialize: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Credential record is partially populated")]
    PartialCredentials,
}

/// Persisted session credentials.
///
/// The four server-issued fields are all-or-none: a record is either
/// "restorable" (token login possible) or "fresh" (QR pairing required).
/// `client_id` is always present and stays stable across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "clientToken", default)]
    pub client_token: Option<String>,
    #[serde(rename = "serverToken", default)]
    pub server_token: Option<String>,
    #[serde(rename = "encKey", default)]
    pub enc_key: Option<[u8; 32]>,
    #[serde(rename = "macKey", default)]
    pub mac_key: Option<[u8; 32]>,
}

impl AuthInfo {
    /// Fresh credentials with a newly allocated client id.
    pub fn new() -> Self {
        Self {
            client_id: key_pair::generate_client_id(),
            client_token: None,
            server_token: None,
            enc_key: None,
            mac_key: None,
        }
    }

    /// True when the record carries everything a token login needs.
    pub fn is_restorable(&self) -> bool {
        self.client_token.is_some()
            && self.server_token.is_some()
            && self.enc_key.is_some()
            && self.mac_key.is_some()
    }

    fn is_fresh(&self) -> bool {
        self.client_token.is_none()
            && self.server_token.is_none()
            && self.enc_key.is_none()
            && self.mac_key.is_none()
    }

    /// Rejects records where only some of the server-issued fields are set.
    pub fn check_invariant(&self) -> Result<(), StoreError> {
        if self.is_restorable() || self.is_fresh() {
            Ok(())
        } else {
            Err(StoreError::PartialCredentials)
        }
    }

    /// Drops the server-issued fields, leaving a fresh record with the same
    /// client id. Used on logout and on unpair.
    pub fn reset(&mut self) {
        self.client_token = None;
        self.server_token = None;
        self.enc_key = None;
        self.mac_key = None;
    }

    /// Loads a record previously produced by [`AuthInfo::to_base64`].
    pub fn from_base64(blob: &str) -> Result<Self, StoreError> {
        let raw = BASE64_STANDARD.decode(blob.trim())?;
        let info: AuthInfo = serde_json::from_slice(&raw)?;
        info.check_invariant()?;
        Ok(info)
    }

    /// Serializes the record to an opaque blob the host can persist.
    pub fn to_base64(&self) -> String {
        let raw = serde_json::to_vec(self).expect("AuthInfo always serializes");
        BASE64_STANDARD.encode(raw)
    }
}

impl Default for AuthInfo {
    fn default() -> Self {
        Self::new()
    }
}
