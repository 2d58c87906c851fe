use super::{QrPayload, UserMetaData};

/// Events surfaced to registered handlers.
#[derive(Debug, Clone)]
pub enum Event {
    /// The server issued a pairing ref; render this for the phone to scan.
    Qr(QrPayload),
    /// Authentication finished and the session is live.
    Connected(UserMetaData),
    /// The socket went away without a prior `disconnect()` call.
    Disconnected { reason: String },
    /// The supervisor is about to retry the connection.
    Reconnecting { attempt: u32 },
    /// A reconnect attempt brought the session back.
    Reconnected(UserMetaData),
    /// Credentials were invalidated and cleared.
    LoggedOut,
}

pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;
