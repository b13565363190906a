//! Correlated request/reply exchange with the message broker.
//!
//! The [`Producer`] keeps a table of in-flight requests keyed by
//! correlation id. Replies arrive asynchronously as [`InboundFrame`]s and
//! are matched back to their waiting caller by [`dispatch_inbound`], which
//! also routes certificate broadcasts to the keyring.
//!
//! The actual link is behind [`BrokerTransport`]; [`WsTransport`] speaks
//! JSON frames over a WebSocket to the broker gateway and reconnects with
//! exponential backoff (up to 60 seconds).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::error::ReceptionError;
use crate::keyring::KeyringCache;
use crate::shutdown::Shutdown;

/// Routing suffix of certificate broadcasts (`evenement.<domain>.certificat`).
const CERTIFICATE_EVENT_SUFFIX: &str = ".certificat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub routing: String,
    pub correlation_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Reply { correlation_id: String, body: Value },
    Event { routing: String, body: Value },
}

#[derive(Debug, Clone)]
pub struct BrokerReply {
    pub correlation_id: String,
    pub body: Value,
}

impl BrokerReply {
    pub fn is_ok(&self) -> bool {
        self.body.get("ok").and_then(Value::as_bool) == Some(true)
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Resolves `true` once the link is up, `false` if it never will be.
    async fn wait_connected(&self) -> bool;

    async fn send(&self, request: OutboundRequest) -> Result<(), ReceptionError>;
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

pub struct Producer {
    transport: Arc<dyn BrokerTransport>,
    pending: Mutex<HashMap<String, oneshot::Sender<BrokerReply>>>,
    max_pending: usize,
}

/// Removes the correlation entry however the request ends, cancellation included.
struct PendingGuard<'a> {
    producer: &'a Producer,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.producer.pending.lock().remove(self.correlation_id);
    }
}

impl Producer {
    pub fn new(transport: Arc<dyn BrokerTransport>, max_pending: usize) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            max_pending,
        }
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ReceptionError> {
        match tokio::time::timeout(timeout, self.transport.wait_connected()).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(ReceptionError::ProducerUnavailable),
        }
    }

    /// Send `payload` and wait for the reply carrying `correlation_id`.
    pub async fn request(
        &self,
        routing: &str,
        correlation_id: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<BrokerReply, ReceptionError> {
        let reply_rx = self.register(correlation_id)?;
        let _guard = PendingGuard {
            producer: self,
            correlation_id,
        };

        self.transport
            .send(OutboundRequest {
                routing: routing.to_string(),
                correlation_id: correlation_id.to_string(),
                payload,
            })
            .await?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ReceptionError::Broker("reply channel closed".to_string())),
            Err(_) => {
                warn!(routing, correlation_id, "Broker reply timed out");
                Err(ReceptionError::SubmitTimeout)
            }
        }
    }

    /// Hand a reply to its waiting request. Returns `false` for unknown ids.
    pub fn complete(&self, reply: BrokerReply) -> bool {
        let waiter = self.pending.lock().remove(&reply.correlation_id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(correlation_id = %reply.correlation_id, "Reply for unknown correlation id");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, correlation_id: &str) -> Result<oneshot::Receiver<BrokerReply>, ReceptionError> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            return Err(ReceptionError::Broker(format!(
                "too many pending requests ({})",
                pending.len()
            )));
        }
        if pending.contains_key(correlation_id) {
            return Err(ReceptionError::Broker(format!(
                "duplicate correlation id {correlation_id}"
            )));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }
}

/// Route inbound frames until shutdown or until the transport goes away.
pub async fn dispatch_inbound(
    producer: Arc<Producer>,
    keyring: Arc<KeyringCache>,
    mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    mut shutdown: Shutdown,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.triggered() => break,
            frame = frames.recv() => frame,
        };

        match frame {
            Some(InboundFrame::Reply {
                correlation_id,
                body,
            }) => {
                producer.complete(BrokerReply {
                    correlation_id,
                    body,
                });
            }
            Some(InboundFrame::Event { routing, body })
                if routing.ends_with(CERTIFICATE_EVENT_SUFFIX) =>
            {
                match keyring.on_certificate_event(&body) {
                    Ok(fingerprint) => info!(%routing, %fingerprint, "Certificate event ingested"),
                    Err(e) => warn!(%routing, error = %e, "Rejected certificate event"),
                }
            }
            Some(InboundFrame::Event { routing, .. }) => {
                debug!(%routing, "Ignoring broker event");
            }
            None => break,
        }
    }

    info!("Inbound dispatch stopped");
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

pub struct WsTransport {
    outbound: mpsc::UnboundedSender<OutboundRequest>,
    connected: watch::Receiver<bool>,
}

impl WsTransport {
    /// Start the connection loop in the background.
    pub fn spawn(
        url: String,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);

        tokio::spawn(connection_loop(
            url,
            outbound_rx,
            inbound,
            connected_tx,
            shutdown,
        ));

        Arc::new(Self {
            outbound: outbound_tx,
            connected: connected_rx,
        })
    }
}

#[async_trait]
impl BrokerTransport for WsTransport {
    async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.clone();
        let up = connected.wait_for(|up| *up).await.is_ok();
        up
    }

    async fn send(&self, request: OutboundRequest) -> Result<(), ReceptionError> {
        if !*self.connected.borrow() {
            return Err(ReceptionError::ProducerUnavailable);
        }
        self.outbound
            .send(request)
            .map_err(|_| ReceptionError::ProducerUnavailable)
    }
}

async fn connection_loop(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<OutboundRequest>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    connected: watch::Sender<bool>,
    mut shutdown: Shutdown,
) {
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(60);

    while !shutdown.is_triggered() {
        info!(url = %url, "Connecting to broker");

        match run_connection(&url, &mut outbound, &inbound, &connected, &mut shutdown).await {
            Ok(()) => {
                info!(url = %url, "Broker link closed");
                backoff = Duration::from_secs(1);
            }
            Err(e) => warn!(url = %url, error = %e, "Broker link failed"),
        }
        connected.send_replace(false);

        if shutdown.is_triggered() {
            break;
        }
        debug!(backoff_secs = backoff.as_secs(), "Reconnecting to broker after backoff");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.triggered() => break,
        }
        backoff = (backoff * 2).min(max_backoff);
    }

    info!("Broker connection loop stopped");
}

async fn run_connection(
    url: &str,
    outbound: &mut mpsc::UnboundedReceiver<OutboundRequest>,
    inbound: &mpsc::UnboundedSender<InboundFrame>,
    connected: &watch::Sender<bool>,
    shutdown: &mut Shutdown,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    connected.send_replace(true);
    info!(url, "Broker link up");

    loop {
        tokio::select! {
            _ = shutdown.triggered() => {
                if let Err(e) = ws_sender.close().await {
                    warn!(url, error = %e, "Failed to close broker link cleanly");
                }
                return Ok(());
            }
            request = outbound.recv() => {
                let Some(request) = request else {
                    return Ok(());
                };
                match serde_json::to_string(&request) {
                    Ok(json) => ws_sender.send(WsMessage::Text(json.into())).await?,
                    Err(e) => warn!(error = %e, "Failed to encode broker request"),
                }
            }
            message = ws_receiver.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<InboundFrame>(&text) {
                        Ok(frame) => {
                            if inbound.send(frame).is_err() {
                                warn!("Inbound dispatcher gone, dropping broker frame");
                            }
                        }
                        Err(e) => warn!(error = %e, "Unparseable broker frame"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            }
        }
    }
}
