pub mod events;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server part of canonical individual ids.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Canonicalizes a wire id: the legacy `@c.us` suffix becomes
/// `@s.whatsapp.net`, anything else passes through unchanged.
pub fn canonical_jid(wid: &str) -> String {
    match wid.strip_suffix("@c.us") {
        Some(user) => format!("{user}@{USER_SERVER}"),
        None => wid.to_string(),
    }
}

/// The signed-in account, as reported by the validation frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMetaData {
    /// Canonical JID (`<digits>@s.whatsapp.net`).
    pub id: String,
    /// The account's push name.
    pub name: String,
    /// Phone/device details, passed through as the server sent them.
    pub phone: Value,
}

/// A conversation summary from the initial chat list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chat {
    pub jid: String,
    pub name: Option<String>,
    /// Unread message count; the server sends it as a decimal string.
    pub unread_count: i64,
    /// Unix timestamp of the last activity.
    pub last_activity: Option<i64>,
}

/// An address book entry from the initial contact list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contact {
    pub jid: String,
    pub name: Option<String>,
    /// The name the contact broadcasts about themselves.
    pub notify: Option<String>,
}

/// Payload the host renders as a QR code for the phone to scan.
#[derive(Debug, Clone, PartialEq)]
pub struct QrPayload {
    /// Server-issued pairing ref from the init reply.
    pub r#ref: String,
    /// Our ephemeral Curve25519 public key, standard base64.
    pub public_key_b64: String,
    pub client_id: String,
}

impl QrPayload {
    /// The comma-joined string the phone expects inside the QR code.
    pub fn as_qr_string(&self) -> String {
        format!("{},{},{}", self.r#ref, self.public_key_b64, self.client_id)
    }
}

/// Where the session currently is. Exactly one phase holds at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    Disconnected,
    Opening,
    AwaitingInit,
    AwaitingQrScan {
        r#ref: String,
        our_public: [u8; 32],
    },
    AwaitingLoginAck,
    AwaitingChallengeAck,
    AwaitingValidation,
    Live {
        since: DateTime<Utc>,
    },
    Reconnecting {
        attempt: u32,
    },
}

impl SessionPhase {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionPhase::Live { .. })
    }
}
