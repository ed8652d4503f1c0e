use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use scale_core::ClientId;
use tokio::sync::mpsc;

use crate::registry::Frame;
use crate::relay::RelayEvent;

/// Per-connection settings taken from the server config.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionSettings {
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
}

/// Handle a WebSocket connection: announce it to the relay, then pump
/// frames both ways until either side goes away.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    relay: mpsc::Sender<RelayEvent>,
    settings: ConnectionSettings,
) {
    let (tx, mut rx) = mpsc::channel::<Frame>(settings.max_send_queue.max(1));

    // Registration is queued ahead of every inbound frame from this client.
    let connected = RelayEvent::Connected {
        client_id: client_id.clone(),
        sender: tx,
    };
    if relay.send(connected).await.is_err() {
        tracing::debug!(client_id = %client_id, "relay stopped, refusing connection");
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward queued frames to the socket + periodic ping
    let writer_cid = client_id.clone();
    let heartbeat = settings.heartbeat_interval.max(Duration::from_secs(1));
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let msg = match frame {
                        Frame::Text(text) => WsMessage::Text(text),
                        Frame::Binary(bytes) => WsMessage::Binary(bytes),
                    };
                    if ws_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "Sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader task: forward data frames to the relay
    let reader_cid = client_id.clone();
    let reader_relay = relay.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            let frame = match msg {
                Ok(WsMessage::Text(text)) => Frame::Text(text),
                Ok(WsMessage::Binary(bytes)) => Frame::Binary(bytes),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue, // ping/pong handled by axum
                Err(e) => {
                    tracing::debug!(client_id = %reader_cid, error = %e, "WebSocket error");
                    break;
                }
            };
            let event = RelayEvent::Inbound {
                client_id: reader_cid.clone(),
                frame,
            };
            if reader_relay.send(event).await.is_err() {
                break;
            }
        }
    });

    // Whichever side finishes first takes the other down with it
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    let _ = relay.send(RelayEvent::Disconnected { client_id }).await;
}
