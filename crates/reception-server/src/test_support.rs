//! Fakes and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use x25519_dalek::{PublicKey, StaticSecret};

use reception_shared::constants::DOMAIN_MESSAGES;
use reception_shared::RecipientCertificate;

use crate::api::AppState;
use crate::broker::{
    dispatch_inbound, BrokerReply, BrokerTransport, InboundFrame, OutboundRequest, Producer,
};
use crate::error::ReceptionError;
use crate::intake::StreamCipherIntake;
use crate::keyring::{CertificateSource, KeyringCache};
use crate::promoter::BatchPromoter;
use crate::rate_limit::RateLimiter;
use crate::registrar::IntakeRegistrar;
use crate::shutdown::{self, ShutdownTrigger};
use crate::staging::StagingArea;
use crate::submitter::MessageSubmitter;

pub fn keypair(domain: &str) -> (StaticSecret, RecipientCertificate) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let certificate = RecipientCertificate::new(*public.as_bytes(), vec![domain.to_string()]);
    (secret, certificate)
}

type Responder = Box<dyn Fn(&OutboundRequest) -> Option<Value> + Send + Sync>;

/// In-memory broker link that records requests and answers them with a
/// scripted responder.
pub struct ScriptedBroker {
    connected: watch::Sender<bool>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    sent: Mutex<Vec<OutboundRequest>>,
    responder: Responder,
}

impl ScriptedBroker {
    pub fn replying<F>(responder: F) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundFrame>)
    where
        F: Fn(&OutboundRequest) -> Option<Value> + Send + Sync + 'static,
    {
        let (inbound, frames) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(true);
        let broker = Arc::new(Self {
            connected,
            inbound,
            sent: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        });
        (broker, frames)
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.send_replace(up);
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl BrokerTransport for ScriptedBroker {
    async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.subscribe();
        let up = connected.wait_for(|up| *up).await.is_ok();
        up
    }

    async fn send(&self, request: OutboundRequest) -> Result<(), ReceptionError> {
        if !*self.connected.borrow() {
            return Err(ReceptionError::ProducerUnavailable);
        }
        let reply = (self.responder)(&request);
        let correlation_id = request.correlation_id.clone();
        self.sent.lock().push(request);

        if let Some(body) = reply {
            let _ = self.inbound.send(InboundFrame::Reply {
                correlation_id,
                body,
            });
        }
        Ok(())
    }
}

/// Pump replies straight back into the producer, as the dispatcher would.
pub fn pump_replies(producer: Arc<Producer>, mut frames: mpsc::UnboundedReceiver<InboundFrame>) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let InboundFrame::Reply {
                correlation_id,
                body,
            } = frame
            {
                producer.complete(BrokerReply {
                    correlation_id,
                    body,
                });
            }
        }
    });
}

/// Certificate source serving a fixed certificate per domain.
#[derive(Default)]
pub struct StaticCertificates {
    by_domain: HashMap<String, RecipientCertificate>,
}

impl StaticCertificates {
    pub fn with(mut self, domain: &str, certificate: RecipientCertificate) -> Self {
        self.by_domain.insert(domain.to_string(), certificate);
        self
    }
}

#[async_trait]
impl CertificateSource for StaticCertificates {
    async fn fetch(&self, domain: &str) -> Result<RecipientCertificate, ReceptionError> {
        self.by_domain
            .get(domain)
            .cloned()
            .ok_or_else(|| ReceptionError::Broker(format!("no certificate for {domain}")))
    }
}

/// Registrar that remembers what it was given.
#[derive(Default)]
pub struct RecordingRegistrar {
    registered: Mutex<Vec<PathBuf>>,
    failing: Mutex<bool>,
}

impl RecordingRegistrar {
    pub fn registered(&self) -> Vec<PathBuf> {
        self.registered.lock().clone()
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl IntakeRegistrar for RecordingRegistrar {
    async fn register(&self, path: &Path) -> Result<(), ReceptionError> {
        if *self.failing.lock() {
            return Err(ReceptionError::Internal("registrar unavailable".into()));
        }
        self.registered.lock().push(path.to_path_buf());
        Ok(())
    }
}

/// Fully wired service over a temporary staging directory.
pub struct Harness {
    pub state: AppState,
    pub broker: Arc<ScriptedBroker>,
    pub keyring: Arc<KeyringCache>,
    pub registrar: Arc<RecordingRegistrar>,
    pub staging: StagingArea,
    pub system_secret: StaticSecret,
    pub recipient_secret: StaticSecret,
    pub recipient: RecipientCertificate,
    _trigger: ShutdownTrigger,
    _dir: TempDir,
}

impl Harness {
    /// A harness whose keyring already holds one messaging certificate.
    pub async fn new<F>(responder: F) -> Self
    where
        F: Fn(&OutboundRequest) -> Option<Value> + Send + Sync + 'static,
    {
        let harness = Self::empty(responder).await;
        harness.keyring.refresh().await.unwrap();
        harness
    }

    /// A harness whose keyring has not loaded anything yet.
    pub async fn empty<F>(responder: F) -> Self
    where
        F: Fn(&OutboundRequest) -> Option<Value> + Send + Sync + 'static,
    {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path().to_path_buf()).await.unwrap();
        let (trigger, shutdown) = shutdown::channel();

        let (broker, frames) = ScriptedBroker::replying(responder);
        let producer = Arc::new(Producer::new(broker.clone(), 50));

        let (recipient_secret, recipient) = keypair(DOMAIN_MESSAGES);
        let source = StaticCertificates::default().with(DOMAIN_MESSAGES, recipient.clone());
        let keyring = Arc::new(KeyringCache::new(
            Arc::new(source),
            Duration::from_secs(20 * 60),
            true,
        ));
        tokio::spawn(dispatch_inbound(
            producer.clone(),
            keyring.clone(),
            frames,
            shutdown,
        ));

        let system_secret = StaticSecret::random_from_rng(OsRng);
        let system_public = *PublicKey::from(&system_secret).as_bytes();

        let registrar = Arc::new(RecordingRegistrar::default());
        let intake = Arc::new(StreamCipherIntake::new(
            staging.clone(),
            keyring.clone(),
            system_public,
            5,
        ));
        let promoter = Arc::new(BatchPromoter::new(staging.clone(), registrar.clone()));
        let submitter = Arc::new(MessageSubmitter::new(
            producer,
            keyring.clone(),
            3,
            Duration::from_secs(5),
            Duration::from_secs(10),
        ));

        let state = AppState {
            intake,
            promoter,
            submitter,
            rate_limiter: RateLimiter::default(),
            max_body_size: 10 * 1024 * 1024,
        };

        Self {
            state,
            broker,
            keyring,
            registrar,
            staging,
            system_secret,
            recipient_secret,
            recipient,
            _trigger: trigger,
            _dir: dir,
        }
    }
}
