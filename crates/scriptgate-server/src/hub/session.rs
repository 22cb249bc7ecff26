//! Per-connection session driver.
//!
//! `Connecting → Authenticated → Active → Closed`. The driver is generic
//! over the frame sink and stream so it runs the same over an axum
//! WebSocket or an in-process channel pair.
//!
//! After the handshake a writer task owns the sink: it drains the
//! session's outbound queue and sends a ping every heartbeat interval,
//! closing the connection when the device has been silent for longer than
//! the pong timeout. The reader runs on the calling task and ends when the
//! socket ends or the writer exits; either way the session is unregistered.

use std::fmt::Display;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use scriptgate_core::db::unix_timestamp;
use scriptgate_crypto::random_hex;

use super::protocol::{AuthRequest, ClientMessage, ServerMessage};
use super::registry::DeviceSession;
use super::{Hub, HubConfig};
use crate::storage::{DeviceConnection, ServerDatabase};

const SESSION_ID_BYTES: usize = 16;

enum Handshake {
    Auth(AuthRequest),
    Rejected(String),
    Closed,
}

/// Drive one connection from handshake to teardown.
pub async fn run<Tx, Rx>(hub: Hub, mut sink: Tx, mut stream: Rx, remote_addr: Option<String>)
where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Tx::Error: Display + Send,
    Rx: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    let config = *hub.config();

    let handshake = tokio::time::timeout(config.auth_timeout, read_auth(&mut stream))
        .await
        .unwrap_or_else(|_| Handshake::Rejected("authentication timeout".into()));
    let request = match handshake {
        Handshake::Auth(request) => request,
        Handshake::Rejected(reason) => {
            debug!(remote_addr = ?remote_addr, reason = %reason, "Handshake rejected");
            reject(&mut sink, &config, reason).await;
            return;
        }
        Handshake::Closed => return,
    };

    let (app, device) = match hub.authenticate(&request.app_key, &request.machine_id).await {
        Ok(found) => found,
        Err(e) => {
            warn!(
                machine_id = %request.machine_id,
                remote_addr = ?remote_addr,
                error = %e,
                "Authentication failed"
            );
            reject(&mut sink, &config, e.public_message()).await;
            return;
        }
    };

    let now = unix_timestamp();
    let session = Arc::new(DeviceSession::new(
        app.id,
        device.id,
        device.machine_id,
        random_hex(SESSION_ID_BYTES),
        remote_addr,
        now,
    ));

    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
    // Queued before registration so it is always the first frame out.
    if let Err(e) = outbound_tx.try_send(ServerMessage::AuthOk {
        session_id: session.session_id.clone(),
    }) {
        warn!(error = %e, "Could not queue auth_ok");
        return;
    }
    hub.registry.register(Arc::clone(&session), outbound_tx).await;

    if let Err(e) = hub
        .db
        .record_connection_opened(&DeviceConnection {
            session_id: session.session_id.clone(),
            app_id: session.app_id.clone(),
            device_id: session.device_id.clone(),
            machine_id: session.machine_id.clone(),
            remote_addr: session.remote_addr.clone(),
            connected_at: now,
            last_ping_at: now,
            disconnected_at: None,
            status: "connected".into(),
        })
        .await
    {
        warn!(session_id = %session.session_id, error = %e, "Failed to record connection");
    }

    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        Arc::clone(&session),
        hub.db.clone(),
        config,
    ));
    read_loop(&hub, &session, &mut stream, &mut writer).await;

    hub.registry.unregister(&session.session_id).await;
    writer.abort();
    if let Err(e) = hub
        .db
        .record_connection_closed(&session.session_id, session.last_ping_at())
        .await
    {
        warn!(session_id = %session.session_id, error = %e, "Failed to record disconnect");
    }
    info!(
        app_id = %session.app_id,
        machine_id = %session.machine_id,
        session_id = %session.session_id,
        "Session closed"
    );
}

async fn read_auth<Rx>(stream: &mut Rx) -> Handshake
where
    Rx: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return match ClientMessage::decode(text.as_str()) {
                    Ok(ClientMessage::Auth(request)) => Handshake::Auth(request),
                    Ok(_) => Handshake::Rejected("first message must be auth".into()),
                    Err(e) => Handshake::Rejected(e.to_string()),
                };
            }
            Ok(Message::Binary(_)) => {
                return Handshake::Rejected("first message must be auth".into());
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => return Handshake::Closed,
        }
    }
    Handshake::Closed
}

async fn reject<Tx>(sink: &mut Tx, config: &HubConfig, reason: String)
where
    Tx: Sink<Message> + Unpin,
{
    if let Ok(text) = ServerMessage::error(reason).encode() {
        let _ = tokio::time::timeout(config.write_timeout, sink.send(Message::Text(text.into())))
            .await;
    }
    let _ = tokio::time::timeout(config.write_timeout, sink.send(Message::Close(None))).await;
    let _ = sink.close().await;
}

async fn read_loop<Rx>(
    hub: &Hub,
    session: &DeviceSession,
    stream: &mut Rx,
    writer: &mut JoinHandle<()>,
) where
    Rx: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut *writer => {
                debug!(session_id = %session.session_id, "Writer stopped");
                return;
            }
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(session_id = %session.session_id, error = %e, "Socket read failed");
                return;
            }
            None => return,
        };

        session.touch(unix_timestamp());
        match message {
            Message::Text(text) => handle_text(hub, session, text.as_str()).await,
            Message::Binary(_) => {
                debug!(session_id = %session.session_id, "Ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return,
        }
    }
}

async fn handle_text(hub: &Hub, session: &DeviceSession, text: &str) {
    let message = match ClientMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(session_id = %session.session_id, error = %e, "Undecodable message");
            hub.registry
                .send_to_session(&session.session_id, ServerMessage::error(e.to_string()))
                .await;
            return;
        }
    };

    match message {
        ClientMessage::Ping { .. } => {
            hub.registry
                .send_to_session(
                    &session.session_id,
                    ServerMessage::Pong {
                        ts: unix_timestamp(),
                    },
                )
                .await;
        }
        ClientMessage::InstructionResult(report) => {
            match hub.apply_instruction_result(session, &report).await {
                Ok(status) => debug!(
                    instruction_id = %report.instruction_id,
                    status = %status,
                    "Instruction result applied"
                ),
                Err(e) => warn!(
                    session_id = %session.session_id,
                    instruction_id = %report.instruction_id,
                    error = %e,
                    "Instruction result rejected"
                ),
            }
        }
        ClientMessage::ScriptResult(report) => {
            match hub.apply_script_result(session, &report).await {
                Ok(delivery) => debug!(
                    delivery_id = %delivery.id,
                    status = %delivery.status,
                    "Script result applied"
                ),
                Err(e) => warn!(
                    session_id = %session.session_id,
                    script_id = %report.script_id,
                    error = %e,
                    "Script result rejected"
                ),
            }
        }
        ClientMessage::Status(status) => {
            debug!(session_id = %session.session_id, status = %status, "Device status");
        }
        ClientMessage::Auth(_) => {
            debug!(session_id = %session.session_id, "Ignoring repeated auth");
        }
    }
}

async fn write_loop<Tx>(
    mut sink: Tx,
    mut outbound: mpsc::Receiver<ServerMessage>,
    session: Arc<DeviceSession>,
    db: ServerDatabase,
    config: HubConfig,
) where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let pong_timeout = i64::try_from(config.pong_timeout.as_secs()).unwrap_or(i64::MAX);

    loop {
        let frame = tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => match message.encode() {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        warn!(session_id = %session.session_id, error = %e, "Failed to encode frame");
                        continue;
                    }
                },
                None => {
                    debug!(session_id = %session.session_id, "Outbound queue closed");
                    break;
                }
            },
            _ = heartbeat.tick() => {
                let last_ping_at = session.last_ping_at();
                if unix_timestamp() - last_ping_at > pong_timeout {
                    warn!(
                        session_id = %session.session_id,
                        machine_id = %session.machine_id,
                        "No sign of life within pong timeout, closing"
                    );
                    break;
                }
                if let Err(e) = db.touch_connection(&session.session_id, last_ping_at).await {
                    warn!(session_id = %session.session_id, error = %e, "Failed to persist last ping");
                }
                Message::Ping(Bytes::new())
            }
        };

        match tokio::time::timeout(config.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(session_id = %session.session_id, error = %e, "Socket write failed");
                return;
            }
            Err(_) => {
                warn!(session_id = %session.session_id, "Socket write timed out");
                return;
            }
        }
    }

    let _ = tokio::time::timeout(config.write_timeout, sink.send(Message::Close(None))).await;
    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use futures::channel::mpsc as fmpsc;
    use serde_json::{Value, json};

    use super::*;
    use crate::hub::test_support::{hub, hub_with};
    use crate::storage::{InstructionStatus, ServerDatabase};

    const WAIT: Duration = Duration::from_secs(5);

    struct Client {
        to_server: fmpsc::UnboundedSender<Result<Message, axum::Error>>,
        from_server: fmpsc::UnboundedReceiver<Message>,
        task: JoinHandle<()>,
    }

    impl Client {
        fn connect(hub: &Hub) -> Self {
            let (to_server, server_rx) = fmpsc::unbounded();
            let (server_tx, from_server) = fmpsc::unbounded();
            let task = tokio::spawn(run(hub.clone(), server_tx, server_rx, None));
            Self {
                to_server,
                from_server,
                task,
            }
        }

        fn send(&self, value: &Value) {
            self.to_server
                .unbounded_send(Ok(Message::Text(value.to_string().into())))
                .unwrap();
        }

        fn auth(&self, machine_id: &str) {
            self.send(&json!({
                "type": "auth",
                "payload": {"app_key": "key-app1", "machine_id": machine_id}
            }));
        }

        /// Next JSON frame, skipping pings. `None` once the server closes.
        async fn next_json(&mut self) -> Option<Value> {
            loop {
                let frame = tokio::time::timeout(WAIT, self.from_server.next())
                    .await
                    .expect("server went quiet")?;
                match frame {
                    Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                    Message::Close(_) => return None,
                    _ => {}
                }
            }
        }

        async fn session_id(&mut self) -> String {
            let frame = self.next_json().await.expect("auth_ok");
            assert_eq!(frame["type"], "auth_ok", "{frame}");
            frame["payload"]["session_id"].as_str().unwrap().to_string()
        }

        async fn finished(self) {
            tokio::time::timeout(WAIT, self.task)
                .await
                .expect("session did not end")
                .unwrap();
        }
    }

    async fn wait_for_status(db: &ServerDatabase, id: &str, want: InstructionStatus) {
        for _ in 0..200 {
            if db.get_instruction(id).await.unwrap().status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instruction {id} never reached {want}");
    }

    #[tokio::test]
    async fn handshake_then_ping_pong() {
        let (db, hub) = hub().await;
        let mut client = Client::connect(&hub);
        client.auth("M1");
        let session_id = client.session_id().await;
        assert_eq!(session_id.len(), SESSION_ID_BYTES * 2);

        let before = unix_timestamp();
        client.send(&json!({"type": "ping"}));
        let pong = client.next_json().await.unwrap();
        assert_eq!(pong["type"], "pong");
        assert!(pong["payload"]["ts"].as_i64().unwrap() >= before);

        let online = hub.list_online("app1").await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].session_id, session_id);
        assert_eq!(online[0].device_id, "d1");
        let row = db.get_connection(&session_id).await.unwrap();
        assert_eq!(row.status, "connected");
    }

    #[tokio::test]
    async fn unknown_app_key_gets_an_error_and_close() {
        let (_db, hub) = hub().await;
        let mut client = Client::connect(&hub);
        client.send(&json!({
            "type": "auth",
            "payload": {"app_key": "wrong", "machine_id": "M1"}
        }));

        let frame = client.next_json().await.unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["payload"]["message"], "Application not found");
        assert!(client.next_json().await.is_none());
        client.finished().await;
        assert_eq!(hub.registry().online_count().await, 0);
    }

    #[tokio::test]
    async fn unregistered_machine_is_rejected() {
        let (_db, hub) = hub().await;
        let mut client = Client::connect(&hub);
        client.auth("M9");
        let frame = client.next_json().await.unwrap();
        assert_eq!(frame["type"], "error");
        client.finished().await;
    }

    #[tokio::test]
    async fn first_message_must_be_auth() {
        let (_db, hub) = hub().await;
        let mut client = Client::connect(&hub);
        client.send(&json!({"type": "ping"}));
        let frame = client.next_json().await.unwrap();
        assert_eq!(frame["payload"]["message"], "first message must be auth");
        client.finished().await;
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let (_db, hub) = hub_with(HubConfig {
            auth_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        })
        .await;
        let mut client = Client::connect(&hub);

        let frame = client.next_json().await.unwrap();
        assert_eq!(frame["payload"]["message"], "authentication timeout");
        assert!(client.next_json().await.is_none());
        client.finished().await;
    }

    #[tokio::test]
    async fn reconnect_evicts_the_previous_session() {
        let (db, hub) = hub().await;
        let mut first = Client::connect(&hub);
        first.auth("M1");
        let first_id = first.session_id().await;

        let mut second = Client::connect(&hub);
        second.auth("M1");
        let second_id = second.session_id().await;
        assert_ne!(first_id, second_id);

        // The first connection is closed by the server.
        assert!(first.next_json().await.is_none());
        first.finished().await;

        let online = hub.list_online("app1").await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].session_id, second_id);
        assert_eq!(
            db.get_connection(&first_id).await.unwrap().status,
            "disconnected"
        );

        second.send(&json!({"type": "ping"}));
        assert_eq!(second.next_json().await.unwrap()["type"], "pong");
    }

    #[tokio::test]
    async fn disconnect_unregisters() {
        let (db, hub) = hub().await;
        let mut client = Client::connect(&hub);
        client.auth("M1");
        let session_id = client.session_id().await;

        client.to_server.close_channel();
        client.finished().await;

        assert!(!hub.registry().is_online("app1", "M1").await);
        let row = db.get_connection(&session_id).await.unwrap();
        assert_eq!(row.status, "disconnected");
        assert!(row.disconnected_at.is_some());
    }

    #[tokio::test]
    async fn instruction_roundtrip_over_the_socket() {
        let (db, hub) = hub().await;
        let mut client = Client::connect(&hub);
        client.auth("M1");
        client.session_id().await;

        let outcome = hub
            .send_instruction("app1", Some("M1"), "restart", &json!({"delay": 5}), 1)
            .await
            .unwrap();
        assert!(outcome.sent);

        let frame = client.next_json().await.unwrap();
        assert_eq!(frame["type"], "instruction");
        assert_eq!(frame["payload"]["id"], outcome.instruction_id.as_str());
        assert_eq!(frame["payload"]["type"], "restart");
        assert_eq!(frame["payload"]["payload"], json!({"delay": 5}));
        assert_eq!(frame["payload"]["expires"], outcome.expires_at);

        client.send(&json!({
            "type": "instruction_result",
            "payload": {
                "instruction_id": outcome.instruction_id,
                "status": "success",
                "result": "done"
            }
        }));
        wait_for_status(&db, &outcome.instruction_id, InstructionStatus::Executed).await;
        let stored = db.get_instruction(&outcome.instruction_id).await.unwrap();
        assert_eq!(stored.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn garbage_frame_gets_an_error_but_keeps_the_session() {
        let (_db, hub) = hub().await;
        let mut client = Client::connect(&hub);
        client.auth("M1");
        client.session_id().await;

        client
            .to_server
            .unbounded_send(Ok(Message::Text("{oops".to_string().into())))
            .unwrap();
        assert_eq!(client.next_json().await.unwrap()["type"], "error");

        client.send(&json!({"type": "ping"}));
        assert_eq!(client.next_json().await.unwrap()["type"], "pong");
    }

    #[tokio::test]
    async fn heartbeat_persists_last_ping() {
        let (db, hub) = hub_with(HubConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..HubConfig::default()
        })
        .await;
        let mut client = Client::connect(&hub);
        client.auth("M1");
        let session_id = client.session_id().await;

        let seen = unix_timestamp() + 1000;
        hub.registry().session(&session_id).await.unwrap().touch(seen);

        for _ in 0..200 {
            if db.get_connection(&session_id).await.unwrap().last_ping_at == seen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let row = db.get_connection(&session_id).await.unwrap();
        assert_eq!(row.last_ping_at, seen);
        assert_eq!(row.status, "connected");
    }

    #[tokio::test]
    async fn silent_session_is_closed_after_pong_timeout() {
        let (_db, hub) = hub_with(HubConfig {
            heartbeat_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_secs(1),
            ..HubConfig::default()
        })
        .await;
        let mut client = Client::connect(&hub);
        client.auth("M1");
        client.session_id().await;

        assert!(client.next_json().await.is_none());
        client.finished().await;
        assert!(!hub.registry().is_online("app1", "M1").await);
    }
}
