//! The session handshake: init, token login or QR pairing, the optional
//! server challenge, and validation of the 144-byte session secret.
//!
//! Handshake traffic is plaintext JSON arrays; only after validation do the
//! derived `enc_key`/`mac_key` start covering binary frames.

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use log::{debug, info};
use serde_json::{json, Value};
use thiserror::Error;

use crate::client::Client;
use crate::crypto::key_pair::KeyPair;
use crate::crypto::{cbc, hkdf, hmac};
use crate::request::WaitError;
use crate::socket::consts::{BROWSER_DESCRIPTION, CLIENT_VERSION, RESPONSE_DEADLINE};
use crate::types::events::Event;
use crate::types::{canonical_jid, QrPayload, SessionPhase, UserMetaData};

/// Wire layout of the validation secret: server public key (32), HMAC tag
/// (32), wrapped session keys (80).
const SECRET_LEN: usize = 144;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("server rejected the session with status {code}")]
    Status { code: i64, payload: Value },
    #[error("unpaired from phone")]
    Unpaired,
    #[error("request denied, try reconnecting")]
    Denied,
    #[error("malformed server payload: {0}")]
    Malformed(&'static str),
    #[error("session secret failed HMAC validation")]
    HmacMismatch,
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("handshake cancelled, connection is going away")]
    Cancelled,
    #[error("socket error during handshake: {0}")]
    Socket(#[from] crate::socket::SocketError),
    #[error(transparent)]
    Cbc(#[from] cbc::CbcError),
    #[error(transparent)]
    Hkdf(#[from] hkdf::HkdfError),
}

impl From<WaitError> for AuthError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout => AuthError::Timeout,
            WaitError::Cancelled => AuthError::Cancelled,
        }
    }
}

/// Maps a non-2xx status on the `s1`/challenge replies to its error. The
/// well-known codes carry their own variants; everything else surfaces
/// verbatim. The init reply does not special-case: any non-200 there is a
/// plain `Status`.
fn status_error(code: i64, payload: Value) -> AuthError {
    match code {
        401 => AuthError::Unpaired,
        429 => AuthError::Denied,
        _ => AuthError::Status { code, payload },
    }
}

/// Reads a `status` field, tolerating the server's stringly-typed numbers.
fn status_of(payload: &Value) -> Option<i64> {
    match payload.get("status")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A `[_, {"challenge": <b64>}]` shape means the server wants proof we still
/// hold `mac_key` before it hands the session over.
fn challenge_of(payload: &Value) -> Option<String> {
    payload
        .as_array()?
        .get(1)?
        .get("challenge")?
        .as_str()
        .map(str::to_string)
}

impl Client {
    /// Drives the handshake to a validated session and reports who we are.
    pub(crate) async fn authenticate(&self) -> Result<UserMetaData, AuthError> {
        self.set_phase(SessionPhase::AwaitingInit).await;
        let (client_id, restorable) = {
            let auth = self.auth.lock().await;
            (auth.client_id.clone(), auth.is_restorable())
        };

        let init_tag = self.generate_message_tag();
        let rx = self.register_tag_waiter(&init_tag).await;
        let init = json!([
            "admin",
            "init",
            CLIENT_VERSION,
            BROWSER_DESCRIPTION,
            client_id,
            true
        ]);
        self.send_json_frame(&init_tag, &init).await?;
        let reply = self
            .wait_response(&init_tag, rx, Some(RESPONSE_DEADLINE))
            .await?;
        match status_of(&reply) {
            Some(200) => {}
            Some(code) => {
                return Err(AuthError::Status {
                    code,
                    payload: reply,
                })
            }
            None => return Err(AuthError::Malformed("init reply carries no status")),
        }

        let s1_rx = self.register_tag_waiter("s1").await;
        let curve_keys = if restorable {
            self.send_login(&client_id).await?;
            None
        } else {
            Some(self.start_qr_pairing(&reply, &client_id).await?)
        };

        // A QR scan takes as long as the user takes; only the token login
        // keeps the short deadline.
        let s1_deadline = restorable.then_some(RESPONSE_DEADLINE);
        let mut conn = self.wait_response("s1", s1_rx, s1_deadline).await?;

        if let Some(code) = status_of(&conn) {
            if !(200..300).contains(&code) {
                return Err(status_error(code, conn));
            }
        }

        if let Some(challenge) = challenge_of(&conn) {
            self.set_phase(SessionPhase::AwaitingChallengeAck).await;
            let s2_rx = self.register_tag_waiter("s2").await;
            self.answer_challenge(&challenge, &client_id).await?;
            conn = self
                .wait_response("s2", s2_rx, Some(RESPONSE_DEADLINE))
                .await?;
        }

        self.set_phase(SessionPhase::AwaitingValidation).await;
        let info = conn
            .get(1)
            .cloned()
            .ok_or(AuthError::Malformed("validation frame has no payload"))?;
        let user = self.validate_connection(&info, curve_keys).await?;
        info!(target: "Client", "Authenticated as {}", user.id);
        Ok(user)
    }

    /// Restore path: present the stored tokens and displace any other web
    /// session tied to this client id.
    async fn send_login(&self, client_id: &str) -> Result<(), AuthError> {
        let (client_token, server_token) = {
            let auth = self.auth.lock().await;
            match (auth.client_token.clone(), auth.server_token.clone()) {
                (Some(ct), Some(st)) => (ct, st),
                _ => return Err(AuthError::Malformed("login without stored tokens")),
            }
        };
        debug!(target: "Client", "Restoring session via token login");
        let login = json!([
            "admin",
            "login",
            client_token,
            server_token,
            client_id,
            "takeover"
        ]);
        self.send_json_frame("s1", &login).await?;
        self.set_phase(SessionPhase::AwaitingLoginAck).await;
        Ok(())
    }

    /// Fresh path: generate ephemeral curve keys and surface the QR payload.
    async fn start_qr_pairing(&self, reply: &Value, client_id: &str) -> Result<KeyPair, AuthError> {
        let r#ref = reply
            .get("ref")
            .and_then(Value::as_str)
            .ok_or(AuthError::Malformed("init reply carries no ref"))?;
        let keys = KeyPair::new();
        let qr = QrPayload {
            r#ref: r#ref.to_string(),
            public_key_b64: BASE64_STANDARD.encode(keys.public_key),
            client_id: client_id.to_string(),
        };
        self.set_phase(SessionPhase::AwaitingQrScan {
            r#ref: qr.r#ref.clone(),
            our_public: keys.public_key,
        })
        .await;
        info!(target: "Client", "Waiting for the phone to scan the pairing code");
        self.dispatch_event(&Event::Qr(qr)).await;
        Ok(keys)
    }

    /// Signs the decoded challenge with `mac_key` and waits for the ack.
    async fn answer_challenge(&self, challenge_b64: &str, client_id: &str) -> Result<(), AuthError> {
        let (mac_key, server_token) = {
            let auth = self.auth.lock().await;
            match (auth.mac_key, auth.server_token.clone()) {
                (Some(k), Some(t)) => (k, t),
                _ => {
                    return Err(AuthError::Malformed(
                        "challenge received without restorable credentials",
                    ))
                }
            }
        };
        let frame = challenge_reply(challenge_b64, &mac_key, &server_token, client_id)?;

        let tag = self.generate_message_tag();
        let rx = self.register_tag_waiter(&tag).await;
        self.send_json_frame(&tag, &frame).await?;
        let reply = self.wait_response(&tag, rx, Some(RESPONSE_DEADLINE)).await?;
        match status_of(&reply) {
            Some(200) => Ok(()),
            Some(code) => Err(status_error(code, reply)),
            None => Err(AuthError::Malformed("challenge reply carries no status")),
        }
    }

    /// Accepts the validation payload, deriving fresh session keys when the
    /// server sent a secret.
    async fn validate_connection(
        &self,
        info: &Value,
        curve_keys: Option<KeyPair>,
    ) -> Result<UserMetaData, AuthError> {
        let user = user_meta_from(info)?;

        let Some(secret_b64) = info.get("secret").and_then(Value::as_str) else {
            // No rekey requested; the session continues on the stored keys.
            debug!(target: "Client", "Validation without secret, keeping existing keys");
            return Ok(user);
        };
        let secret = BASE64_STANDARD
            .decode(secret_b64)
            .map_err(|_| AuthError::Malformed("secret is not base64"))?;
        let keys = curve_keys.ok_or(AuthError::Malformed(
            "server sent a secret outside a fresh pairing",
        ))?;
        let (enc_key, mac_key) = derive_session_keys(&keys, &secret)?;

        let mut auth = self.auth.lock().await;
        auth.client_token = info
            .get("clientToken")
            .and_then(Value::as_str)
            .map(str::to_string);
        auth.server_token = info
            .get("serverToken")
            .and_then(Value::as_str)
            .map(str::to_string);
        auth.enc_key = Some(enc_key);
        auth.mac_key = Some(mac_key);
        if auth.client_token.is_none() || auth.server_token.is_none() {
            auth.reset();
            return Err(AuthError::Malformed("validation carries no session tokens"));
        }
        info!(target: "Client", "Session keys derived, credentials are now restorable");
        Ok(user)
    }
}

/// Builds the `["admin","challenge",...]` reply: the decoded challenge
/// signed with `mac_key`, re-encoded as base64.
fn challenge_reply(
    challenge_b64: &str,
    mac_key: &[u8; 32],
    server_token: &str,
    client_id: &str,
) -> Result<Value, AuthError> {
    let challenge = BASE64_STANDARD
        .decode(challenge_b64)
        .map_err(|_| AuthError::Malformed("challenge is not base64"))?;
    let signature = hmac::sign(&challenge, mac_key);
    Ok(json!([
        "admin",
        "challenge",
        BASE64_STANDARD.encode(signature),
        server_token,
        client_id
    ]))
}

/// Checks the connected flag and lifts the account identity out of the
/// validation payload.
fn user_meta_from(info: &Value) -> Result<UserMetaData, AuthError> {
    if info.get("connected").and_then(Value::as_bool) != Some(true) {
        return Err(AuthError::Malformed("validation reports connected != true"));
    }
    let wid = info
        .get("wid")
        .and_then(Value::as_str)
        .ok_or(AuthError::Malformed("validation carries no wid"))?;
    Ok(UserMetaData {
        id: canonical_jid(wid),
        name: info
            .get("pushname")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        phone: info.get("phone").cloned().unwrap_or(Value::Null),
    })
}

/// Unwraps `enc_key`/`mac_key` from the 144-byte validation secret.
///
/// `secret[0..32]` is the server's ephemeral public key; `secret[32..64]` an
/// HMAC over the rest under `expanded[32..64]`; `secret[64..144]` the
/// wrapped keys, decrypted with key `expanded[0..32]` and IV
/// `expanded[64..80]`.
pub fn derive_session_keys(
    keys: &KeyPair,
    secret: &[u8],
) -> Result<([u8; 32], [u8; 32]), AuthError> {
    if secret.len() != SECRET_LEN {
        return Err(AuthError::Malformed("secret is not 144 bytes"));
    }

    let mut peer_public = [0u8; 32];
    peer_public.copy_from_slice(&secret[..32]);
    let shared = keys.shared_secret(peer_public);
    let expanded = hkdf::expand(&shared, 80, &[])?;

    let mut signed = Vec::with_capacity(SECRET_LEN - 32);
    signed.extend_from_slice(&secret[..32]);
    signed.extend_from_slice(&secret[64..]);
    if !hmac::verify(&signed, &expanded[32..64], &secret[32..64]) {
        return Err(AuthError::HmacMismatch);
    }

    let key_material = cbc::decrypt(&expanded[..32], &expanded[64..80], &secret[64..])?;
    if key_material.len() < 64 {
        return Err(AuthError::Malformed("unwrapped key material is too short"));
    }

    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&key_material[..32]);
    mac_key.copy_from_slice(&key_material[32..64]);
    Ok((enc_key, mac_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_without_secret_keeps_identity() {
        let info = serde_json::json!({
            "connected": true,
            "wid": "15551234@c.us",
            "pushname": "A",
            "phone": {}
        });
        let user = user_meta_from(&info).unwrap();
        assert_eq!(user.id, "15551234@s.whatsapp.net");
        assert_eq!(user.name, "A");
        assert_eq!(user.phone, serde_json::json!({}));
    }

    #[test]
    fn unconnected_validation_is_malformed() {
        let info = serde_json::json!({"connected": false, "wid": "1@c.us"});
        assert!(matches!(
            user_meta_from(&info),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn challenge_reply_signs_the_decoded_bytes() {
        let mac_key = [0x11u8; 32];
        let challenge_b64 = BASE64_STANDARD.encode(b"abc");
        let reply = challenge_reply(&challenge_b64, &mac_key, "st", "cid").unwrap();

        assert_eq!(reply[0], "admin");
        assert_eq!(reply[1], "challenge");
        let expected = BASE64_STANDARD.encode(hmac::sign(b"abc", &mac_key));
        assert_eq!(reply[2], expected.as_str());
        assert_eq!(reply[3], "st");
        assert_eq!(reply[4], "cid");
    }

    #[test]
    fn garbage_challenge_is_malformed() {
        assert!(matches!(
            challenge_reply("not base64!!!", &[0u8; 32], "st", "cid"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn well_known_statuses_map_to_their_errors() {
        assert!(matches!(
            status_error(401, Value::Null),
            AuthError::Unpaired
        ));
        assert!(matches!(status_error(429, Value::Null), AuthError::Denied));
        assert!(matches!(
            status_error(503, Value::Null),
            AuthError::Status { code: 503, .. }
        ));
    }

    #[test]
    fn status_helpers_read_numbers_and_strings() {
        assert_eq!(status_of(&serde_json::json!({"status": 200})), Some(200));
        assert_eq!(status_of(&serde_json::json!({"status": "401"})), Some(401));
        assert_eq!(status_of(&serde_json::json!({"ref": "x"})), None);
    }

    #[test]
    fn challenge_shape_is_detected() {
        let payload = serde_json::json!(["Cmd", {"type": "challenge", "challenge": "YWJj"}]);
        assert_eq!(challenge_of(&payload).as_deref(), Some("YWJj"));
        assert_eq!(challenge_of(&serde_json::json!({"status": 200})), None);
    }
}
