//! Core of a client for the WhatsApp Web session protocol.
//!
//! Given fresh or persisted credentials, [`Client`] opens a WebSocket to the
//! front-end, negotiates (or restores) the symmetric session keys, and then
//! pumps encrypted frames to waiting continuations and registered handlers
//! while keeping the session alive.
//!
//! The binary payload decoder, the QR renderer and credential storage are
//! the host's: inject a [`BinaryDecoder`], subscribe to events for the
//! pairing payload, and persist [`AuthInfo`] blobs between runs.

pub mod chats;
pub mod client;
pub mod crypto;
pub mod framing;
pub mod handshake;
pub mod keepalive;
pub mod request;
pub mod socket;
pub mod store;
pub mod types;

pub use client::{BinaryDecoder, Client, ClientError, SessionData};
pub use handshake::{derive_session_keys, AuthError};
pub use request::{Handler, HandlerPath, WaitError};
pub use store::AuthInfo;
pub use types::events::Event;
pub use types::{Chat, Contact, QrPayload, SessionPhase, UserMetaData};
