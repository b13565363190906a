//! Cache of recipient encryption certificates.
//!
//! Every upload key and every message envelope is wrapped for all entries
//! currently held here. Entries come from two places: periodic refreshes
//! that query the key custodian and messaging domains, and certificate
//! broadcasts relayed by the broker. Stale entries are pruned on a timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use reception_shared::constants::{DOMAIN_KEY_CUSTODIAN, DOMAIN_MESSAGES};
use reception_shared::RecipientCertificate;

use crate::broker::Producer;
use crate::error::ReceptionError;

const ACCEPTED_DOMAINS: [&str; 2] = [DOMAIN_KEY_CUSTODIAN, DOMAIN_MESSAGES];

#[derive(Debug, Clone)]
pub struct KeyringEntry {
    pub fingerprint: String,
    pub certificate: RecipientCertificate,
    pub added_at: DateTime<Utc>,
}

/// Where refreshes get certificates from.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn fetch(&self, domain: &str) -> Result<RecipientCertificate, ReceptionError>;
}

/// Asks a domain for its certificate over the broker
/// (`requete.<domain>.certificat`).
pub struct BrokerCertificateSource {
    producer: Arc<Producer>,
    timeout: Duration,
}

impl BrokerCertificateSource {
    pub fn new(producer: Arc<Producer>, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl CertificateSource for BrokerCertificateSource {
    async fn fetch(&self, domain: &str) -> Result<RecipientCertificate, ReceptionError> {
        self.producer.wait_ready(self.timeout).await?;

        let routing = format!("requete.{domain}.certificat");
        let correlation_id = Uuid::new_v4().to_string();
        let reply = self
            .producer
            .request(&routing, &correlation_id, json!({}), self.timeout)
            .await?;

        let certificate = reply.body.get("certificate").cloned().ok_or_else(|| {
            ReceptionError::Broker(format!("{domain} replied without a certificate"))
        })?;
        Ok(serde_json::from_value(certificate)?)
    }
}

pub struct KeyringCache {
    entries: RwLock<HashMap<String, KeyringEntry>>,
    source: Arc<dyn CertificateSource>,
    staleness: chrono::Duration,
    keep_last: bool,
    /// Serializes refresh and prune against each other.
    maintenance: tokio::sync::Mutex<()>,
}

impl KeyringCache {
    pub fn new(source: Arc<dyn CertificateSource>, staleness: Duration, keep_last: bool) -> Self {
        let staleness =
            chrono::Duration::from_std(staleness).unwrap_or_else(|_| chrono::Duration::minutes(20));

        Self {
            entries: RwLock::new(HashMap::new()),
            source,
            staleness,
            keep_last,
            maintenance: tokio::sync::Mutex::new(()),
        }
    }

    /// Fetch the key custodian and messaging certificates and merge them in.
    ///
    /// One failing domain is logged and skipped; the refresh only fails
    /// when neither certificate could be loaded. Returns how many were.
    pub async fn refresh(&self) -> Result<usize, ReceptionError> {
        let _maintenance = self.maintenance.lock().await;

        let (custodian, messages) = futures::join!(
            self.fetch_checked(DOMAIN_KEY_CUSTODIAN),
            self.fetch_checked(DOMAIN_MESSAGES)
        );

        let mut loaded = Vec::with_capacity(2);
        for (domain, result) in [(DOMAIN_KEY_CUSTODIAN, custodian), (DOMAIN_MESSAGES, messages)] {
            match result {
                Ok(certificate) => loaded.push(certificate),
                Err(e) => warn!(domain, error = %e, "Failed to load encryption certificate"),
            }
        }

        if loaded.is_empty() {
            return Err(ReceptionError::NoEncryptionCertificate);
        }

        let now = Utc::now();
        let count = loaded.len();
        let total = {
            let mut entries = self.entries.write();
            for certificate in loaded {
                let fingerprint = certificate.fingerprint();
                entries.insert(
                    fingerprint.clone(),
                    KeyringEntry {
                        fingerprint,
                        certificate,
                        added_at: now,
                    },
                );
            }
            entries.len()
        };

        info!(loaded = count, total, "Keyring refreshed");
        Ok(count)
    }

    async fn fetch_checked(&self, domain: &str) -> Result<RecipientCertificate, ReceptionError> {
        let certificate = self.source.fetch(domain).await?;
        if !certificate.declares(domain) {
            return Err(ReceptionError::InvalidCertificateDomain(
                certificate.domains,
            ));
        }
        Ok(certificate)
    }

    /// Ingest a certificate pushed by the broker. Returns its fingerprint.
    pub fn on_certificate_event(&self, payload: &Value) -> Result<String, ReceptionError> {
        let certificate: RecipientCertificate = serde_json::from_value(payload.clone())?;
        if !certificate.declares_any(&ACCEPTED_DOMAINS) {
            return Err(ReceptionError::InvalidCertificateDomain(
                certificate.domains,
            ));
        }

        let fingerprint = certificate.fingerprint();
        self.entries.write().insert(
            fingerprint.clone(),
            KeyringEntry {
                fingerprint: fingerprint.clone(),
                certificate,
                added_at: Utc::now(),
            },
        );
        Ok(fingerprint)
    }

    /// Drop entries older than the staleness window as of `now`.
    ///
    /// With `keep_last`, the newest entry survives a prune that would
    /// otherwise empty the cache. Returns the number removed.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let _maintenance = self.maintenance.lock().await;
        let mut entries = self.entries.write();

        let mut stale: Vec<String> = entries
            .values()
            .filter(|entry| now - entry.added_at > self.staleness)
            .map(|entry| entry.fingerprint.clone())
            .collect();

        if self.keep_last && !stale.is_empty() && stale.len() == entries.len() {
            let newest = entries
                .values()
                .max_by_key(|entry| entry.added_at)
                .map(|entry| entry.fingerprint.clone());
            if let Some(newest) = newest {
                warn!(fingerprint = %newest, "Keeping stale certificate as last recipient");
                stale.retain(|fingerprint| *fingerprint != newest);
            }
        }

        for fingerprint in &stale {
            entries.remove(fingerprint);
            debug!(%fingerprint, "Pruned stale certificate");
        }
        stale.len()
    }

    /// Point-in-time copy of the entries, sorted by fingerprint.
    pub fn current_recipients(&self) -> Vec<KeyringEntry> {
        let mut recipients: Vec<KeyringEntry> = self.entries.read().values().cloned().collect();
        recipients.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        recipients
    }

    pub fn certificates(&self) -> Vec<RecipientCertificate> {
        self.current_recipients()
            .into_iter()
            .map(|entry| entry.certificate)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_at(&self, certificate: RecipientCertificate, added_at: DateTime<Utc>) {
        let fingerprint = certificate.fingerprint();
        self.entries.write().insert(
            fingerprint.clone(),
            KeyringEntry {
                fingerprint,
                certificate,
                added_at,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{keypair, pump_replies, ScriptedBroker, StaticCertificates};

    fn cache(source: StaticCertificates, keep_last: bool) -> KeyringCache {
        KeyringCache::new(Arc::new(source), Duration::from_secs(20 * 60), keep_last)
    }

    /// Broker-backed source whose replies come from `responder`.
    fn broker_source<F>(responder: F) -> (BrokerCertificateSource, Arc<ScriptedBroker>)
    where
        F: Fn(&crate::broker::OutboundRequest) -> Option<Value> + Send + Sync + 'static,
    {
        let (broker, frames) = ScriptedBroker::replying(responder);
        let producer = Arc::new(Producer::new(broker.clone(), 50));
        pump_replies(producer.clone(), frames);
        (
            BrokerCertificateSource::new(producer, Duration::from_secs(5)),
            broker,
        )
    }

    #[tokio::test]
    async fn test_broker_source_decodes_certificate() {
        let (_, messages) = keypair(DOMAIN_MESSAGES);
        let served = messages.clone();
        let (source, broker) = broker_source(move |request| {
            (request.routing == "requete.Messages.certificat")
                .then(|| json!({ "ok": true, "certificate": served }))
        });

        let certificate = source.fetch(DOMAIN_MESSAGES).await.unwrap();
        assert_eq!(certificate, messages);
        assert_eq!(broker.sent()[0].routing, "requete.Messages.certificat");
    }

    #[tokio::test]
    async fn test_broker_source_reply_without_certificate() {
        let (source, _broker) = broker_source(|_| Some(json!({ "ok": true })));

        assert!(matches!(
            source.fetch(DOMAIN_MESSAGES).await,
            Err(ReceptionError::Broker(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_survives_one_domain_timing_out() {
        let (_, messages) = keypair(DOMAIN_MESSAGES);
        let served = messages.clone();
        // The custodian never answers.
        let (source, broker) = broker_source(move |request| {
            (request.routing == "requete.Messages.certificat")
                .then(|| json!({ "ok": true, "certificate": served }))
        });
        let keyring = KeyringCache::new(Arc::new(source), Duration::from_secs(20 * 60), true);

        assert_eq!(keyring.refresh().await.unwrap(), 1);
        let recipients = keyring.current_recipients();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].fingerprint, messages.fingerprint());

        let mut routings: Vec<String> = broker.sent().into_iter().map(|r| r.routing).collect();
        routings.sort();
        assert_eq!(
            routings,
            vec!["requete.MaitreDesCles.certificat", "requete.Messages.certificat"]
        );
    }

    #[tokio::test]
    async fn test_refresh_loads_both_domains() {
        let (_, custodian) = keypair(DOMAIN_KEY_CUSTODIAN);
        let (_, messages) = keypair(DOMAIN_MESSAGES);
        let keyring = cache(
            StaticCertificates::default()
                .with(DOMAIN_KEY_CUSTODIAN, custodian.clone())
                .with(DOMAIN_MESSAGES, messages.clone()),
            true,
        );

        assert_eq!(keyring.refresh().await.unwrap(), 2);
        let fingerprints: Vec<String> = keyring
            .current_recipients()
            .into_iter()
            .map(|e| e.fingerprint)
            .collect();
        assert!(fingerprints.contains(&custodian.fingerprint()));
        assert!(fingerprints.contains(&messages.fingerprint()));
    }

    #[tokio::test]
    async fn test_refresh_tolerates_one_failure() {
        let (_, messages) = keypair(DOMAIN_MESSAGES);
        let keyring = cache(
            StaticCertificates::default().with(DOMAIN_MESSAGES, messages),
            true,
        );

        assert_eq!(keyring.refresh().await.unwrap(), 1);
        assert_eq!(keyring.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_fails_when_nothing_loads() {
        let keyring = cache(StaticCertificates::default(), true);
        assert!(matches!(
            keyring.refresh().await,
            Err(ReceptionError::NoEncryptionCertificate)
        ));
        assert!(keyring.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_rejects_wrong_domain() {
        // Certificate served for Messages but declaring another domain.
        let (_, stray) = keypair("Autre");
        let keyring = cache(
            StaticCertificates::default().with(DOMAIN_MESSAGES, stray),
            true,
        );

        assert!(keyring.refresh().await.is_err());
        assert!(keyring.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_deduplicates_by_fingerprint() {
        let (_, messages) = keypair(DOMAIN_MESSAGES);
        let keyring = cache(
            StaticCertificates::default().with(DOMAIN_MESSAGES, messages),
            true,
        );

        keyring.refresh().await.unwrap();
        keyring.refresh().await.unwrap();
        assert_eq!(keyring.len(), 1);
    }

    #[test]
    fn test_certificate_event_domain_check() {
        let keyring = cache(StaticCertificates::default(), true);

        let (_, accepted) = keypair(DOMAIN_KEY_CUSTODIAN);
        let payload = serde_json::to_value(&accepted).unwrap();
        assert_eq!(
            keyring.on_certificate_event(&payload).unwrap(),
            accepted.fingerprint()
        );

        let (_, rejected) = keypair("Autre");
        let payload = serde_json::to_value(&rejected).unwrap();
        assert!(matches!(
            keyring.on_certificate_event(&payload),
            Err(ReceptionError::InvalidCertificateDomain(_))
        ));

        assert!(keyring.on_certificate_event(&json!({ "bogus": 1 })).is_err());
        assert_eq!(keyring.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_boundary_is_strict() {
        let keyring = cache(StaticCertificates::default(), false);
        let now = Utc::now();
        let (_, exact) = keypair(DOMAIN_MESSAGES);
        let (_, older) = keypair(DOMAIN_MESSAGES);
        keyring.insert_at(exact.clone(), now - chrono::Duration::minutes(20));
        keyring.insert_at(older, now - chrono::Duration::minutes(21));

        assert_eq!(keyring.prune(now).await, 1);
        let remaining = keyring.current_recipients();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fingerprint, exact.fingerprint());
    }

    #[tokio::test]
    async fn test_prune_can_empty_without_keep_last() {
        let keyring = cache(StaticCertificates::default(), false);
        let now = Utc::now();
        let (_, old) = keypair(DOMAIN_MESSAGES);
        keyring.insert_at(old, now - chrono::Duration::hours(1));

        assert_eq!(keyring.prune(now).await, 1);
        assert!(keyring.is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_with_keep_last() {
        let keyring = cache(StaticCertificates::default(), true);
        let now = Utc::now();
        let (_, oldest) = keypair(DOMAIN_MESSAGES);
        let (_, newest) = keypair(DOMAIN_KEY_CUSTODIAN);
        keyring.insert_at(oldest, now - chrono::Duration::hours(3));
        keyring.insert_at(newest.clone(), now - chrono::Duration::hours(1));

        assert_eq!(keyring.prune(now).await, 1);
        let remaining = keyring.current_recipients();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fingerprint, newest.fingerprint());
    }
}
