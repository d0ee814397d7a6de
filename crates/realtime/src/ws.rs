use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use secrecy::ExposeSecret;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::{
    protocol::{ClientMessage, ServerMessage},
    transport::{DisconnectReason, Handshake, RealtimeTransport, TransportError},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON-over-WebSocket realtime transport. Each text frame carries one
/// `{event, data}` message; the bearer token rides on the upgrade request.
#[derive(Default)]
pub struct WebSocketTransport {
    writer: Mutex<Option<SplitSink<Socket, Message>>>,
    reader: Mutex<Option<SplitStream<Socket>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self, handshake: &Handshake) -> Result<(), TransportError> {
        let endpoint = websocket_url(&handshake.endpoint);
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        if let Some(token) = &handshake.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|error| TransportError::Connect(error.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        let (writer, reader) = socket.split();
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        Ok(())
    }

    async fn next_message(&self) -> Result<Option<ServerMessage>, TransportError> {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(TransportError::Receive("websocket is not connected".to_owned()));
        };

        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => return Ok(Some(message)),
                        Err(error) => {
                            warn!(
                                event_name = "realtime.ws.unparseable_frame",
                                error = %error,
                                "skipping realtime frame that is not a known message"
                            );
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    guard.take();
                    return Err(TransportError::Disconnected(close_reason(frame)));
                }
                Some(Ok(_)) => continue,
                Some(Err(error)) => return Err(TransportError::Receive(error.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_string(&message)
            .map_err(|error| TransportError::Send(error.to_string()))?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Send("websocket is not connected".to_owned()));
        };
        writer
            .send(Message::text(payload))
            .await
            .map_err(|error| TransportError::Send(error.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.reader.lock().await.take();
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        if let Err(error) = writer.close().await {
            debug!(
                event_name = "realtime.ws.close_failed",
                error = %error,
                "websocket close handshake failed"
            );
        }
        Ok(())
    }
}

/// Normal and policy closes from the server are deliberate; anything else is
/// treated as a dropped link worth reconnecting.
fn close_reason(frame: Option<CloseFrame<'_>>) -> DisconnectReason {
    match frame {
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Policy) => {
            DisconnectReason::ServerInitiated
        }
        Some(frame) => DisconnectReason::Other(format!("websocket closed ({})", frame.code)),
        None => DisconnectReason::Other("websocket closed without a close frame".to_owned()),
    }
}

fn websocket_url(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_owned()
    }
}
