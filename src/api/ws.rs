// =============================================================================
// WebSocket Handler — metric envelope push feed
// =============================================================================
//
// Dashboards connect to `/ws?symbols=SYM1,SYM2` and receive one JSON
// `MetricsEnvelope` per assembler tick per subscribed symbol.  Without a
// `symbols` parameter the subscription covers every configured symbol.
//
// The handler:
//   - Registers the connection with the SubscriptionHub.
//   - Forwards queued envelopes; the hub's bounded queue applies the
//     drop-oldest backpressure policy.
//   - Responds to Ping frames with Pong frames.
//   - Unsubscribes (draining the queue synchronously) on any exit path.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::hub::CloseReason;

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    symbols: Option<String>,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let symbols: HashSet<String> = match query.symbols {
        Some(csv) => csv
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => state.pipelines.keys().cloned().collect(),
    };

    info!(symbols = ?symbols, "WebSocket subscriber connecting");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, symbols))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single subscriber connection lifecycle.
///
/// Runs two concurrent arms via `tokio::select!`:
///   1. **Push arm** — await the next envelope from the hub queue and forward
///      it as a text frame.
///   2. **Recv arm** — process incoming client messages (Ping/Pong, Close).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, symbols: HashSet<String>) {
    let subscription = state.hub.subscribe(symbols);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // ── Push arm: forward envelopes ─────────────────────────────
            envelope = subscription.recv() => {
                match envelope {
                    Some(envelope) => {
                        let json = match serde_json::to_string(&*envelope) {
                            Ok(json) => json,
                            Err(e) => {
                                // Serialisation errors are not network errors.
                                warn!(error = %e, "failed to serialise envelope");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    None => {
                        // The hub closed us. Tell the client why if it was
                        // cut off for falling behind.
                        if subscription.close_reason() == Some(CloseReason::Overflow) {
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: axum::extract::ws::close_code::POLICY,
                                    reason: "subscriber too slow".into(),
                                })))
                                .await;
                        }
                        break;
                    }
                }
            }

            // ── Recv arm: client messages ───────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(id = %subscription.id(), "WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message ignored");
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.unsubscribe(subscription.id());
    info!(id = %subscription.id(), "WebSocket subscriber closed");
}
