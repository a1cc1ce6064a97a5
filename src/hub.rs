//! Session hub (C7): accepts long-lived duplex WebSocket client sessions,
//! parses command frames, and broadcasts state/events. One accept-loop
//! task per hub, one reader/writer task pair per client -- the same
//! one-task-per-peer model the teacher's connection manager uses.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::fabric::{Fabric, BROADCAST_CHANNEL_CAPACITY};
use crate::frame::{ClientFrame, NetworkTopology, ServerFrame, Severity, SystemEventData};

/// Soft deadline for an outbound frame send (§5); exceeding it closes the
/// session.
const OUTBOUND_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Binds the listening socket. Split out from `serve` so a caller (`main`)
/// can distinguish a bind failure (exit code 1, per §6) from an error
/// arising later in the accept loop.
pub async fn bind(addr: std::net::SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(bind = %addr, "session hub listening");
    Ok(listener)
}

pub async fn serve(fabric: Arc<Fabric>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let fabric = fabric.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(fabric, stream).await {
                warn!(%peer_addr, error = %e, "client session ended with error");
            }
        });
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn handle_client(fabric: Arc<Fabric>, stream: TcpStream) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let client_id = uuid::Uuid::new_v4().to_string();
    info!(client_id = %client_id, "client connected");

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(BROADCAST_CHANNEL_CAPACITY);

    // Initial frame: current topology, per §4.7.
    let topology = fabric.current_topology().await;
    let _ = outbound_tx
        .send(ServerFrame::NetworkTopology { data: topology })
        .await;

    let mut events_rx = fabric.events.subscribe();
    let forward_tx = outbound_tx.clone();
    let broadcast_relay = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(frame) => {
                    if forward_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client lagged behind broadcast, frames dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to serialize outbound frame");
                    continue;
                }
            };
            match tokio::time::timeout(OUTBOUND_SEND_TIMEOUT, ws_sink.send(WsMessage::Text(text))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!("outbound send exceeded deadline, closing session");
                    break;
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(msg) = ws_stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "transport read error, closing");
                break;
            }
        };
        let WsMessage::Text(text) = msg else {
            continue;
        };
        if let Err(e) = dispatch(&fabric, &outbound_tx, &text).await {
            warn!(client_id = %client_id, error = %e, "frame dispatch failed");
        }
    }

    broadcast_relay.abort();
    writer.abort();
    info!(client_id = %client_id, "client disconnected");
    Ok(())
}

async fn dispatch(
    fabric: &Arc<Fabric>,
    outbound_tx: &mpsc::Sender<ServerFrame>,
    text: &str,
) -> Result<(), BoxError> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            let _ = outbound_tx
                .send(ServerFrame::SystemEvent {
                    data: SystemEventData {
                        event_type: "transport_error".to_string(),
                        description: format!("unrecognized frame: {e}"),
                        timestamp: chrono::Utc::now().timestamp(),
                        severity: Severity::Warning,
                    },
                })
                .await;
            return Ok(());
        }
    };

    match frame {
        ClientFrame::SendMessage {
            sender_id,
            content,
            message_type,
            recipients,
        } => {
            let recipient_id = recipients.first().cloned();
            let max_hops = fabric.config.max_hops;
            if let Err(e) = fabric
                .route_message(&sender_id, recipient_id, message_type, content, max_hops)
                .await
            {
                warn!(sender_id = %sender_id, error = %e, "send_message failed");
            }
        }
        ClientFrame::SimulateScenario { scenario } => {
            dispatch_scenario(fabric, scenario).await;
        }
        ClientFrame::GetNetworkStatus => {
            let topology = fabric.current_topology().await;
            let _ = outbound_tx
                .send(ServerFrame::NetworkTopology { data: topology })
                .await;
        }
        ClientFrame::ForceSync => {
            let _ = fabric.force_sync().await;
        }
    }
    Ok(())
}

async fn dispatch_scenario(fabric: &Arc<Fabric>, scenario: crate::frame::Scenario) {
    use crate::frame::Scenario::*;
    let result = match scenario {
        ServerFailure => fabric.scenario_server_failure().await,
        ServerRecovery => fabric.scenario_server_recovery().await,
        NodeDropout => fabric.scenario_node_dropout().await,
        NetworkPartition => fabric.scenario_network_partition().await,
        FullDemo => {
            let fabric = fabric.clone();
            tokio::spawn(async move {
                let _ = fabric.scenario_full_demo().await;
            });
            Ok(())
        }
    };
    if let Err(e) = result {
        debug!(?scenario, error = %e, "scenario was a no-op");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_dispatch_table_covers_spec_types() {
        // Compile-time check: every ClientFrame variant has a match arm in
        // `dispatch`; this test exists to anchor coverage for future
        // variants (a new ClientFrame variant will fail this match).
        fn _covers(f: ClientFrame) {
            match f {
                ClientFrame::SendMessage { .. } => {}
                ClientFrame::SimulateScenario { .. } => {}
                ClientFrame::GetNetworkStatus => {}
                ClientFrame::ForceSync => {}
            }
        }
    }
}
