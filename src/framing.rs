//! Session frame envelope.
//!
//! Every frame on the wire is `tag "," body`. Handshake traffic carries a
//! plaintext JSON body; once the session keys exist, binary bodies are
//! `hmac32 || aes-cbc ciphertext` keyed by the session secrets. JSON bodies
//! stay plaintext either way, detectable by their leading `[` or `{`.

use serde_json::Value;
use thiserror::Error;

use crate::crypto::{cbc, hmac};

pub const MAC_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame has no tag delimiter")]
    MissingTag,
    #[error("Frame tag is not valid UTF-8")]
    TagEncoding,
    #[error("HMAC mismatch on encrypted frame")]
    HmacMismatch,
    #[error("Frame body is malformed: {0}")]
    Malformed(&'static str),
    #[error("JSON body failed to parse: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Cbc(#[from] cbc::CbcError),
}

/// A frame body after the envelope comes off.
#[derive(Debug)]
pub enum FramePayload {
    /// Plaintext JSON body.
    Json(Value),
    /// Decrypted binary body, ready for the binary decoder.
    Binary(Vec<u8>),
}

/// Splits `tag "," body` at the first comma.
pub fn split_tag(frame: &[u8]) -> Result<(&str, &[u8]), CodecError> {
    let comma = frame
        .iter()
        .position(|&b| b == b',')
        .ok_or(CodecError::MissingTag)?;
    let tag = std::str::from_utf8(&frame[..comma]).map_err(|_| CodecError::TagEncoding)?;
    Ok((tag, &frame[comma + 1..]))
}

/// Decodes a plaintext frame. Pre-validation traffic is JSON only; an empty
/// body (bare server ack) decodes to `Null`.
pub fn decode_plain(frame: &[u8]) -> Result<(String, Value), CodecError> {
    let (tag, body) = split_tag(frame)?;
    if body.is_empty() {
        return Ok((tag.to_string(), Value::Null));
    }
    Ok((tag.to_string(), serde_json::from_slice(body)?))
}

/// The symmetric envelope around post-validation frames.
pub struct SessionCipher {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl SessionCipher {
    pub fn new(enc_key: [u8; 32], mac_key: [u8; 32]) -> Self {
        Self { enc_key, mac_key }
    }

    /// Builds `tag "," hmac32 ciphertext` for a binary payload. The
    /// ciphertext carries its IV in the leading 16 bytes.
    pub fn encrypt_frame(&self, tag: &str, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let ciphertext = cbc::encrypt_prefixed(&self.enc_key, payload)?;
        let mac = hmac::sign(&ciphertext, &self.mac_key);

        let mut frame = Vec::with_capacity(tag.len() + 1 + MAC_LEN + ciphertext.len());
        frame.extend_from_slice(tag.as_bytes());
        frame.push(b',');
        frame.extend_from_slice(&mac);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Opens an inbound frame. JSON bodies pass through unchanged; anything
    /// else must authenticate against `mac_key` before it is decrypted.
    pub fn decrypt_frame(&self, frame: &[u8]) -> Result<(String, FramePayload), CodecError> {
        let (tag, body) = split_tag(frame)?;
        if body.first().is_some_and(|&b| b == b'[' || b == b'{') {
            // A MAC can start with these bytes too; only a body that
            // actually parses is JSON.
            if let Ok(value) = serde_json::from_slice(body) {
                return Ok((tag.to_string(), FramePayload::Json(value)));
            }
        }
        if body.len() < MAC_LEN {
            return Err(CodecError::Malformed("body shorter than its MAC"));
        }

        let (mac, ciphertext) = body.split_at(MAC_LEN);
        if !hmac::verify(ciphertext, &self.mac_key, mac) {
            return Err(CodecError::HmacMismatch);
        }
        let plaintext = cbc::decrypt_prefixed(&self.enc_key, ciphertext)?;
        Ok((tag.to_string(), FramePayload::Binary(plaintext)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cipher() -> SessionCipher {
        SessionCipher::new([3u8; 32], [4u8; 32])
    }

    #[test]
    fn split_tag_at_first_comma() {
        let (tag, body) = split_tag(b"1700000000.--1,[\"a\",\"b,c\"]").unwrap();
        assert_eq!(tag, "1700000000.--1");
        assert_eq!(body, b"[\"a\",\"b,c\"]");
    }

    #[test]
    fn tagless_frames_are_rejected() {
        assert!(matches!(
            split_tag(b"no delimiter"),
            Err(CodecError::MissingTag)
        ));
    }

    #[test]
    fn plain_json_frame_decodes() {
        let (tag, value) = decode_plain(b"s1,[\"Conn\",{\"connected\":true}]").unwrap();
        assert_eq!(tag, "s1");
        assert_eq!(value[0], "Conn");
    }

    #[test]
    fn empty_body_decodes_to_null() {
        let (tag, value) = decode_plain(b"1700000000.--7,").unwrap();
        assert_eq!(tag, "1700000000.--7");
        assert!(value.is_null());
    }

    #[test]
    fn encrypted_round_trip() {
        let c = cipher();
        let payload = b"\x01binary node payload";
        let frame = c.encrypt_frame("1700000000.--2", payload).unwrap();
        let (tag, opened) = c.decrypt_frame(&frame).unwrap();
        assert_eq!(tag, "1700000000.--2");
        match opened {
            FramePayload::Binary(plaintext) => assert_eq!(plaintext, payload),
            FramePayload::Json(_) => panic!("binary payload decoded as JSON"),
        }
    }

    #[test]
    fn json_bodies_bypass_the_cipher() {
        let c = cipher();
        let frame = format!("s2,{}", json!(["Cmd", {"type": "challenge"}]));
        let (tag, opened) = c.decrypt_frame(frame.as_bytes()).unwrap();
        assert_eq!(tag, "s2");
        assert!(matches!(opened, FramePayload::Json(v) if v[0] == "Cmd"));
    }

    #[test]
    fn tampered_frames_fail_the_mac() {
        let c = cipher();
        let mut frame = c.encrypt_frame("t", b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x80;
        assert!(matches!(
            c.decrypt_frame(&frame),
            Err(CodecError::HmacMismatch)
        ));
    }

    #[test]
    fn wrong_mac_key_fails_the_mac() {
        let frame = cipher().encrypt_frame("t", b"payload").unwrap();
        let other = SessionCipher::new([3u8; 32], [5u8; 32]);
        assert!(matches!(
            other.decrypt_frame(&frame),
            Err(CodecError::HmacMismatch)
        ));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let c = cipher();
        assert!(matches!(
            c.decrypt_frame(b"t,\x00\x01\x02"),
            Err(CodecError::Malformed(_))
        ));
    }
}
