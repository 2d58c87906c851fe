use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::client::Client;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);
const KEEP_ALIVE_STALE_AFTER: Duration = Duration::from_secs(25);
/// The literal probe the server answers with a `!<unix-ms>` heartbeat.
const KEEP_ALIVE_PROBE: &str = "?,,";

impl Client {
    /// True when the server has not answered a probe for longer than the
    /// staleness window.
    pub(crate) async fn is_heartbeat_stale(&self) -> bool {
        self.last_seen.lock().await.elapsed() > KEEP_ALIVE_STALE_AFTER
    }

    async fn send_probe(&self) -> bool {
        let socket_guard = self.socket.lock().await;
        let Some(socket) = socket_guard.as_ref() else {
            return false;
        };
        match socket.send_text(KEEP_ALIVE_PROBE.to_string()).await {
            Ok(()) => {
                trace!(target: "Client/Keepalive", "Probe sent");
                true
            }
            Err(e) => {
                warn!(target: "Client/Keepalive", "Failed to send probe: {e}");
                false
            }
        }
    }

    /// The keep-alive ticker. Spawned on entering `Live`; exits on shutdown,
    /// on disconnect, or after declaring the connection lost.
    pub(crate) async fn keepalive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = sleep(KEEP_ALIVE_INTERVAL) => {
                    if !self.is_connected() || !self.phase().await.is_live() {
                        debug!(target: "Client/Keepalive", "Not live anymore, exiting keepalive loop.");
                        return;
                    }
                    if self.is_heartbeat_stale().await {
                        warn!(target: "Client/Keepalive", "No heartbeat inside the staleness window, treating connection as lost.");
                        self.handle_lost_connection().await;
                        return;
                    }
                    if !self.send_probe().await {
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow_and_update() {
                        debug!(target: "Client/Keepalive", "Shutdown signaled, exiting keepalive loop.");
                        return;
                    }
                }
            }
        }
    }
}
