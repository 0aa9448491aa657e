//! Protocol gateway bridge.
//!
//! Connects to the external protocol gateway over TCP and exchanges
//! newline-delimited JSON: inbound lines decode to [`Event`]s, outgoing
//! operations encode to [`Outgoing`] lines. The gateway owns the actual
//! federated session; if the link drops, this bridge reconnects with capped
//! exponential backoff and the pipeline carries on (no session-affinity
//! state lives on this side).

use super::{Event, Outgoing, Transport, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

const OUTGOING_CHANNEL_SIZE: usize = 256;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Handle implementing [`Transport`] over the gateway link.
#[derive(Clone)]
pub struct GatewayTransport {
    outgoing_tx: mpsc::Sender<Outgoing>,
}

impl GatewayTransport {
    async fn submit(&self, op: Outgoing) -> Result<(), TransportError> {
        crate::metrics::record_outgoing(op_label(&op));
        self.outgoing_tx
            .send(op)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

fn op_label(op: &Outgoing) -> &'static str {
    match op {
        Outgoing::Message { .. } => "message",
        Outgoing::AcceptSubscription { .. } => "accept_subscription",
        Outgoing::RequestSubscription { .. } => "request_subscription",
        Outgoing::Keepalive => "keepalive",
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn send_message(&self, to: &str, body: &str) -> Result<(), TransportError> {
        self.submit(Outgoing::Message {
            to: to.to_string(),
            body: body.to_string(),
        })
        .await
    }

    async fn accept_subscription(&self, to: &str) -> Result<(), TransportError> {
        self.submit(Outgoing::AcceptSubscription { to: to.to_string() })
            .await
    }

    async fn request_subscription(&self, to: &str) -> Result<(), TransportError> {
        self.submit(Outgoing::RequestSubscription { to: to.to_string() })
            .await
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        self.submit(Outgoing::Keepalive).await
    }
}

/// Connect to the gateway, spawning the link task.
///
/// Returns the outgoing handle and the inbound event stream. The link task
/// runs until the event receiver is dropped and every [`GatewayTransport`]
/// clone is gone.
pub fn connect(gateway_addr: SocketAddr) -> (GatewayTransport, mpsc::Receiver<Event>) {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::channel(OUTGOING_CHANNEL_SIZE);

    tokio::spawn(link_task(gateway_addr, outgoing_rx, event_tx));

    (GatewayTransport { outgoing_tx }, event_rx)
}

async fn link_task(
    gateway_addr: SocketAddr,
    mut outgoing_rx: mpsc::Receiver<Outgoing>,
    event_tx: mpsc::Sender<Event>,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        let stream = match TcpStream::connect(gateway_addr).await {
            Ok(stream) => {
                info!(gateway = %gateway_addr, "Connected to protocol gateway");
                backoff = BACKOFF_INITIAL;
                stream
            }
            Err(e) => {
                warn!(gateway = %gateway_addr, error = %e, backoff = ?backoff, "Gateway connect failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };

        if run_link(stream, &mut outgoing_rx, &event_tx).await {
            // Outgoing channel closed: the daemon is shutting down.
            return;
        }

        warn!(gateway = %gateway_addr, "Gateway link lost, reconnecting");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// Pump one live connection. Returns true when the daemon side hung up.
async fn run_link(
    stream: TcpStream,
    outgoing_rx: &mut mpsc::Receiver<Outgoing>,
    event_tx: &mpsc::Sender<Event>,
) -> bool {
    let mut framed = Framed::new(stream, LinesCodec::new());

    loop {
        tokio::select! {
            op = outgoing_rx.recv() => {
                let Some(op) = op else {
                    return true;
                };
                let line = match serde_json::to_string(&op) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode outgoing operation");
                        continue;
                    }
                };
                if let Err(e) = framed.send(line).await {
                    warn!(error = %e, "Gateway write failed");
                    return false;
                }
            }
            line = framed.next() => {
                let Some(line) = line else {
                    return false;
                };
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Gateway read failed");
                        return false;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => {
                        debug!(kind = event.kind(), "Gateway event received");
                        if event_tx.send(event).await.is_err() {
                            return true;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, line = %line, "Unparseable gateway line dropped");
                    }
                }
            }
        }
    }
}
