use std::sync::{Arc, Mutex};

use blueprint_core::ConnectionState;
use blueprint_realtime::{
    ClientMessage, Handshake, ReconnectPolicy, SharedSyncStore, TransportClient,
    WebSocketTransport,
};
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};

fn entity_event_frame() -> String {
    json!({
        "event": "entity.event",
        "data": {
            "id": "evt-1",
            "entityType": "role",
            "action": "created",
            "entityId": "role-1",
            "serviceId": "svc-1",
            "userId": "user-1",
            "timestamp": "2026-03-01T10:00:00Z",
            "payload": { "name": "Reviewer" }
        }
    })
    .to_string()
}

async fn next_json(socket: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let frame = socket.next().await.expect("frame").expect("valid frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

#[tokio::test]
async fn websocket_session_subscribes_applies_acks_and_honours_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local address");
    let authorization = Arc::new(Mutex::new(None::<String>));

    let server = {
        let authorization = authorization.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let capture = authorization.clone();
            let record_authorization =
                move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    *capture.lock().expect("lock") = request
                        .headers()
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_owned);
                    Ok(response)
                };
            let mut socket =
                accept_hdr_async(stream, record_authorization).await.expect("websocket upgrade");

            let subscribe = next_json(&mut socket).await;
            socket.send(Message::text(entity_event_frame())).await.expect("send event");
            let ack = next_json(&mut socket).await;
            socket
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "server disconnected".into(),
                })))
                .await
                .expect("send close");
            (subscribe, ack)
        })
    };

    let client = TransportClient::new(
        Arc::new(WebSocketTransport::new()),
        Handshake::new(format!("http://{address}/realtime"))
            .with_auth_token(SecretString::from("rt-token".to_owned())),
        SharedSyncStore::for_service("svc-1"),
        ReconnectPolicy { max_reconnect_attempts: 0, initial_delay_ms: 1, max_delay_ms: 1 },
    );

    let status = client.run().await;
    let (subscribe, ack) = server.await.expect("server task");

    let expected_subscribe = serde_json::to_value(ClientMessage::subscribe("svc-1")).expect("json");
    assert_eq!(subscribe, expected_subscribe);
    assert_eq!(ack["event"], json!("event.ack"));
    assert_eq!(ack["data"], json!({ "eventId": "evt-1", "received": true }));
    assert_eq!(authorization.lock().expect("lock").as_deref(), Some("Bearer rt-token"));

    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.error.as_deref(), Some("server disconnected"));
    let snapshot = client.store().snapshot();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.roles.len(), 1);
}
