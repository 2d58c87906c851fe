use crate::socket::consts::{ORIGIN, URL};
use crate::socket::error::{Result, SocketError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio_websockets::{ClientBuilder, MaybeTlsStream, Message, WebSocketStream};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// Owns the WebSocket to the front-end. Inbound message payloads are
/// forwarded on a channel, one message per frame; the channel closing means
/// the socket is gone.
pub struct FrameSocket {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
    frames_tx: Sender<bytes::Bytes>,
    is_connected: Arc<Mutex<bool>>,
}

impl FrameSocket {
    pub fn new() -> (Self, Receiver<bytes::Bytes>) {
        let (tx, rx) = mpsc::channel(100);
        let socket = Self {
            ws_sink: Arc::new(Mutex::new(None)),
            frames_tx: tx,
            is_connected: Arc::new(Mutex::new(false)),
        };
        (socket, rx)
    }

    pub async fn is_connected(&self) -> bool {
        *self.is_connected.lock().await
    }

    pub async fn connect(&self) -> Result<()> {
        if self.is_connected().await {
            return Err(SocketError::SocketAlreadyOpen);
        }

        if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
            debug!("rustls crypto provider install: {e:?}");
        }

        info!("Dialing {URL}");
        let uri: http::Uri = URL.parse()?;
        let (client, _response) = ClientBuilder::from_uri(uri)
            .add_header(
                http::header::ORIGIN,
                http::HeaderValue::from_static(ORIGIN),
            )
            .connect()
            .await?;

        let (sink, stream) = client.split();
        *self.ws_sink.lock().await = Some(sink);
        *self.is_connected.lock().await = true;

        let frames_tx = self.frames_tx.clone();
        let is_connected = self.is_connected.clone();
        tokio::spawn(Self::read_pump(stream, frames_tx, is_connected));

        Ok(())
    }

    /// Sends a plaintext frame (`tag "," json`) as a text message.
    pub async fn send_text(&self, frame: String) -> Result<()> {
        debug!("--> Sending text frame: {} bytes", frame.len());
        self.send_message(Message::text(frame)).await
    }

    /// Sends an encrypted frame as a binary message.
    pub async fn send_binary(&self, frame: Vec<u8>) -> Result<()> {
        debug!("--> Sending binary frame: {} bytes", frame.len());
        self.send_message(Message::binary(bytes::Bytes::from(frame)))
            .await
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(SocketError::SocketClosed)?;
        sink.send(message).await?;
        Ok(())
    }

    async fn read_pump(
        mut stream: WsStream,
        frames_tx: mpsc::Sender<bytes::Bytes>,
        is_connected: Arc<Mutex<bool>>,
    ) {
        loop {
            match stream.next().await {
                Some(Ok(msg)) => {
                    if msg.is_binary() || msg.is_text() {
                        let data = msg.as_payload();
                        trace!("<-- Received frame: {} bytes", data.len());
                        if frames_tx
                            .send(bytes::Bytes::copy_from_slice(data))
                            .await
                            .is_err()
                        {
                            warn!("Frame receiver dropped, closing read pump");
                            break;
                        }
                    } else if msg.is_close() {
                        trace!("Received close frame");
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("Error reading from websocket: {e}");
                    break;
                }
                None => {
                    trace!("Websocket stream ended");
                    break;
                }
            }
        }

        *is_connected.lock().await = false;
    }

    /// Closes the connection. The read pump winds down once the close
    /// handshake completes, which in turn closes the frame channel.
    pub async fn close(&self) {
        let mut is_connected = self.is_connected.lock().await;
        if *is_connected {
            *is_connected = false;
            if let Some(mut sink) = self.ws_sink.lock().await.take() {
                if let Err(e) = sink.close().await {
                    debug!("Error closing websocket sink: {e}");
                }
            }
        }
    }
}
