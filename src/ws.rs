//! Real-time socket.
//!
//! JSON text frames over WebSocket. The server forwards every hub event to
//! every session; the only thing a client says is `user:join`, which ties the
//! session to a user and marks that user online until the socket closes.

use crate::hub::{ClientEvent, ServerEvent};
use crate::state::{AppState, SharedState};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

// ── WS upgrade handler ────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ── Socket lifecycle ───────────────────────────────────────────

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let session = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    tracing::debug!(%session, "socket connected");

    // Subscribe before anything can be published on our behalf.
    let mut broadcast_rx = state.hub.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(frame) => {
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%session, skipped, "socket fell behind, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn({
        let state = state.clone();
        async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Text(text) => handle_frame(&state, session, &text),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    disconnect(&state, session);
    tracing::debug!(%session, "socket closed");
}

// ── Presence ───────────────────────────────────────────────────

fn handle_frame(state: &AppState, session: Uuid, text: &str) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::UserJoin(user_id)) => join(state, session, user_id),
        Err(e) => tracing::debug!(%session, error = %e, "ignoring client frame"),
    }
}

/// Bind `session` to `user_id` and mark the user online. Unknown users are
/// ignored.
pub fn join(state: &AppState, session: Uuid, user_id: Uuid) {
    let online = {
        let mut world = state.write();
        if world.user(user_id).is_err() {
            tracing::warn!(%session, %user_id, "join for unknown user");
            return;
        }
        if let Some(previous) = state.hub.join(session, user_id) {
            if previous != user_id && !state.hub.is_connected(previous) {
                // The previous user may have been deleted since.
                if let Err(e) = world.modify_user(previous, |u| u.is_online = false) {
                    tracing::warn!(%session, user_id = %previous, error = %e, "cannot mark user offline");
                }
            }
        }
        if let Err(e) = world.modify_user(user_id, |u| u.is_online = true) {
            tracing::warn!(%session, %user_id, error = %e, "cannot mark user online");
        }
        state.commit_side_effect(&mut world, "presence");
        world.online_users()
    };
    tracing::info!(%session, %user_id, "user joined");
    state.hub.publish(ServerEvent::UsersOnline(online));
}

/// Drop `session`. The user goes offline once their last session is gone.
pub fn disconnect(state: &AppState, session: Uuid) {
    let Some(user_id) = state.hub.leave(session) else {
        return;
    };
    let online = {
        let mut world = state.write();
        // The user may have been deleted while connected.
        if world.modify_user(user_id, |u| u.is_online = false).is_err() {
            return;
        }
        state.commit_side_effect(&mut world, "presence");
        world.online_users()
    };
    tracing::info!(%session, %user_id, "user left");
    state.hub.publish(ServerEvent::UsersOnline(online));
}
