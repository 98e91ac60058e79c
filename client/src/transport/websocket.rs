//! WebSocket transport for the realtime socket.

use crate::error::{ConnectionError, DisconnectReason, ReceiveError, SendError};
use crate::ClientError;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// An open WebSocket carrying text frames.
///
/// Read and write halves are locked independently so a pending read never
/// blocks a write.
pub struct WebSocketStream {
    write: Arc<Mutex<SplitSink<WsStream, Message>>>,
    read: Arc<Mutex<SplitStream<WsStream>>>,
    connected: Arc<AtomicBool>,
}

impl WebSocketStream {
    /// Open a WebSocket to `url`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        url::Url::parse(url)
            .map_err(|e| ClientError::Connection(ConnectionError::InvalidUrl(e.to_string())))?;

        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connection(ConnectionError::Transport(e.to_string())))?;

        let (write, read) = ws_stream.split();

        Ok(Self {
            write: Arc::new(Mutex::new(write)),
            read: Arc::new(Mutex::new(read)),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Read the next text frame, skipping control frames.
    pub async fn read_text(&self) -> Result<String, ClientError> {
        let mut read = self.read.lock().await;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
                Some(Ok(Message::Binary(data))) => {
                    // The JSON serializers never produce binary frames.
                    match String::from_utf8(data.to_vec()) {
                        Ok(text) => return Ok(text),
                        Err(e) => {
                            return Err(ClientError::Receive(ReceiveError::MalformedMessage(
                                e.to_string(),
                            )))
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(ClientError::Disconnected(DisconnectReason::ServerClosed));
                }
                Some(Ok(_)) => {
                    // Ping/Pong/Frame - skip, continue reading
                    continue;
                }
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(ClientError::Receive(ReceiveError::Stream(e.to_string())));
                }
            }
        }
    }

    pub async fn write_text(&self, text: String) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Send(SendError::ConnectionClosed));
        }
        let mut write = self.write.lock().await;
        write.send(Message::Text(text.into())).await.map_err(|e| {
            self.connected.store(false, Ordering::Relaxed);
            ClientError::Send(SendError::Stream(e.to_string()))
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Send a close frame with the given code and reason.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::Relaxed);
        let mut write = self.write.lock().await;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = write.send(Message::Close(Some(frame))).await;
        let _ = write.close().await;
        Ok(())
    }
}
