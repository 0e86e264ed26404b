use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notewire_sync::decode;

use crate::AppState;
use crate::error::ServerError;
use crate::session::{FrameOutcome, Session};

/// Query parameters for the websocket endpoint.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer token identifying the connecting user.
    pub token: Option<String>,
}

/// WebSocket upgrade handler. Authentication happens before the
/// upgrade so bad tokens cost an HTTP status, not a socket.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(token) = query.token else {
        warn!("websocket rejected: missing token");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let user = match state.auth.authenticate(&token) {
        Ok(user) => user,
        Err(ServerError::Auth) => {
            warn!("websocket rejected: invalid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(e) => {
            warn!("websocket rejected: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    info!(user_id = %user.user_id, "websocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, user: crate::db::UserIdentity) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let conn_id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let session = Session::new(conn_id, user, outbound_tx);

    // Writer task: everything outbound flows through the channel so
    // the registry and batcher never touch the socket directly. The
    // task ends when the last sender is dropped, which is also how a
    // duplicate-connection takeover closes the loser.
    let writer = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let strike_limit = state.config.protocol_strike_limit;
    let mut strikes: u32 = 0;

    while let Some(msg) = ws_rx.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue, // ping/pong
        };

        let frame = match decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(user_id = %session.user.user_id, "undecodable frame: {e}");
                session.send_error("", format!("bad frame: {e}"));
                strikes += 1;
                if strikes >= strike_limit {
                    warn!(user_id = %session.user.user_id, "closing connection after {strikes} protocol errors");
                    break;
                }
                continue;
            }
        };

        match session.handle_frame(&state, frame).await {
            Ok(FrameOutcome::Continue) => {}
            Ok(FrameOutcome::Strike) | Err(ServerError::AccessDenied { .. }) => {
                strikes += 1;
                if strikes >= strike_limit {
                    warn!(user_id = %session.user.user_id, "closing connection after {strikes} protocol errors");
                    break;
                }
            }
            Err(e) => {
                warn!(user_id = %session.user.user_id, "frame handling failed: {e}");
                session.send_error("", e.to_string());
            }
        }
    }

    session.disconnect(&state);
    drop(session); // closes the outbound channel
    let _ = writer.await;
    debug!(conn = %conn_id, "websocket closed");
}
