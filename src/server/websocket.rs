//! WebSocket push feed
//!
//! `GET /ws?user=<id>` upgrades to a feed of [`PushEvent`]s. Broadcast events
//! reach every client; user-targeted events only reach clients connected
//! with that `user`. Connections without `user` see broadcasts only.
//!
//! Clients may send `{"type": "ping"}` and get a `pong` back. Delivery is
//! at-most-once: a client that falls behind skips what it missed.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::notify::{now_timestamp, ClientMessage, PushEvent, PushHub};
use crate::routes::util::{error_response, parse_id};
use crate::server::http::AppState;
use crate::store::UserId;

/// WebSocket type after upgrade
type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

#[derive(Debug, Default, Deserialize)]
struct FeedQuery {
    #[serde(default)]
    user: Option<String>,
}

/// Handle WebSocket upgrade for the push feed
pub async fn handle_push_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return error_response(StatusCode::BAD_REQUEST, "WebSocket upgrade required", None);
    }

    let query: FeedQuery = req
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default();
    let user = match query.user.as_deref().map(|raw| parse_id(raw, "user")) {
        Some(Ok(id)) => Some(id),
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, &e.to_string(), None),
        None => None,
    };

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok((resp, ws)) => (resp, ws),
        Err(e) => {
            error!("WebSocket upgrade failed: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "WebSocket upgrade failed",
                None,
            );
        }
    };

    let hub = Arc::clone(&state.push);
    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => {
                if let Err(e) = handle_push_connection(ws, hub, user).await {
                    warn!("Push WebSocket error: {}", e);
                }
            }
            Err(e) => {
                error!("WebSocket connection failed: {}", e);
            }
        }
    });

    let (parts, _body) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<HyperWebSocket, WsMessage>,
    event: &PushEvent,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = serde_json::to_string(event)?;
    sender.send(WsMessage::Text(json)).await?;
    Ok(())
}

/// Pump hub events to one client until it disconnects
async fn handle_push_connection(
    ws: HyperWebSocket,
    hub: Arc<PushHub>,
    user: Option<UserId>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut sender, mut receiver) = ws.split();

    // Subscribe before greeting so nothing sent after `connected` is missed
    let mut rx = hub.subscribe();
    let client_id = hub.register_client(user);
    info!(client = %client_id, user = ?user, "Push client connected");

    let result = async {
        send_event(
            &mut sender,
            &PushEvent::Connected {
                timestamp: now_timestamp(),
                client_id: client_id.to_string(),
            },
        )
        .await?;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(envelope) => {
                            if envelope.is_for(user) {
                                send_event(&mut sender, &envelope.event).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(client = %client_id, skipped, "Push client lagged");
                            continue;
                        }
                    }
                }

                msg = receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(ClientMessage::Ping) => {
                                    send_event(&mut sender, &PushEvent::Pong {
                                        timestamp: now_timestamp(),
                                    }).await?;
                                }
                                Err(_) => {
                                    send_event(&mut sender, &PushEvent::Error {
                                        message: "Unrecognized message".to_string(),
                                    }).await?;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(client = %client_id, "Push client read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    hub.unregister_client(&client_id);
    info!(client = %client_id, "Push client disconnected");
    result
}
