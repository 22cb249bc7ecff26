//! WebSocket upgrade for the device command channel.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::Extensions;
use axum::response::Response;
use futures::StreamExt;

use super::AppState;
use crate::hub::session;

pub async fn upgrade(
    State(state): State<AppState>,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> Response {
    // Absent when the router is served without connect info.
    let remote_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    let hub = state.hub.clone();

    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| {
            let (sink, stream) = socket.split();
            session::run(hub, sink, stream, remote_addr)
        })
}
