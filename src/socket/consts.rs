use std::time::Duration;

/// WhatsApp Web front-end endpoint.
pub const URL: &str = "wss://web.whatsapp.com/ws";

/// The server rejects sessions without this Origin.
pub const ORIGIN: &str = "https://web.whatsapp.com";

/// Client version advertised in the init frame.
pub const CLIENT_VERSION: [u32; 3] = [2, 2140, 12];

/// `[os, browser, os version]` browser description for the init frame.
pub const BROWSER_DESCRIPTION: [&str; 3] = ["Windows", "Chrome", "10"];

/// Deadline for a single tagged handshake reply.
pub const RESPONSE_DEADLINE: Duration = Duration::from_secs(20);

/// Default budget for `connect` when the caller passes none.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Budget for each attempt inside the reconnect loop.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(25);
