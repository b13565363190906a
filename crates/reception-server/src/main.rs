//! # reception-server
//!
//! Public intake for messages and attachments.
//!
//! This binary provides:
//! - **`POST /message`** accepting a JSON message or a multipart form with
//!   attached files
//! - **Streaming file encryption** into a staging area, with the file key
//!   wrapped for every known recipient certificate
//! - **Encrypted submission** of the message to the messaging domain over a
//!   correlated broker request/reply, promoting the attachments only when
//!   the message is accepted
//! - **Maintenance tasks** refreshing and pruning the certificate keyring
//!   and sweeping abandoned uploads
//! - **Per-IP rate limiting** to protect against abuse

mod api;
mod broker;
mod config;
mod error;
mod intake;
mod keyring;
mod message;
mod promoter;
mod rate_limit;
mod registrar;
mod scheduler;
mod shutdown;
mod staging;
mod submitter;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::broker::{dispatch_inbound, Producer, WsTransport};
use crate::config::ReceptionConfig;
use crate::intake::StreamCipherIntake;
use crate::keyring::{BrokerCertificateSource, KeyringCache};
use crate::promoter::BatchPromoter;
use crate::rate_limit::RateLimiter;
use crate::registrar::TransferQueue;
use crate::scheduler::{
    KeyringPrune, KeyringRefresh, MaintenanceScheduler, RateLimitPurge, StagingSweep,
};
use crate::staging::StagingArea;
use crate::submitter::MessageSubmitter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reception_server=debug")),
        )
        .init();

    info!("Starting reception server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ReceptionConfig::from_env();
    info!(?config, "Loaded configuration");

    let system_public_key = config
        .system_public_key
        .context("SYSTEM_PUBLIC_KEY must be set to a 64-char hex X25519 public key")?;
    let broker_url = config
        .broker_url
        .clone()
        .context("BROKER_URL must not be empty")?;

    let (trigger, shutdown) = shutdown::channel();

    // -----------------------------------------------------------------------
    // 3. Broker link and keyring
    // -----------------------------------------------------------------------
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let transport = WsTransport::spawn(broker_url, inbound_tx, shutdown.clone());
    let producer = Arc::new(Producer::new(transport, config.max_pending_replies));

    let certificate_source = Arc::new(BrokerCertificateSource::new(
        producer.clone(),
        config.certificate_timeout,
    ));
    let keyring = Arc::new(KeyringCache::new(
        certificate_source,
        config.keyring_staleness,
        config.keyring_keep_last,
    ));

    tokio::spawn(dispatch_inbound(
        producer.clone(),
        keyring.clone(),
        inbound_rx,
        shutdown.clone(),
    ));

    // -----------------------------------------------------------------------
    // 4. Staging, intake and submission
    // -----------------------------------------------------------------------
    let staging = StagingArea::new(config.staging_path.clone()).await?;

    let (transfer_queue, mut transfer_rx) = TransferQueue::new();
    tokio::spawn(async move {
        while let Some(path) = transfer_rx.recv().await {
            info!(path = %path.display(), "Artifact ready for transfer");
        }
    });

    let intake = Arc::new(StreamCipherIntake::new(
        staging.clone(),
        keyring.clone(),
        system_public_key,
        config.upload_concurrency,
    ));
    let promoter = Arc::new(BatchPromoter::new(staging.clone(), Arc::new(transfer_queue)));
    let submitter = Arc::new(MessageSubmitter::new(
        producer,
        keyring.clone(),
        config.submit_concurrency,
        config.producer_wait,
        config.submit_timeout,
    ));

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();

    let app_state = AppState {
        intake,
        promoter,
        submitter,
        rate_limiter: rate_limiter.clone(),
        max_body_size: config.max_body_size,
    };

    // -----------------------------------------------------------------------
    // 5. Maintenance
    // -----------------------------------------------------------------------
    let scheduler = MaintenanceScheduler::new()
        .register_with_retry(
            KeyringRefresh(keyring.clone()),
            config.keyring_refresh_interval,
            config.keyring_retry_interval,
        )
        .register(KeyringPrune(keyring), config.keyring_prune_interval)
        .register(
            StagingSweep {
                staging,
                max_age: config.staging_max_age,
            },
            Duration::from_secs(3600),
        )
        .register(
            RateLimitPurge {
                limiter: rate_limiter,
                max_idle: Duration::from_secs(600),
            },
            Duration::from_secs(300),
        );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    // -----------------------------------------------------------------------
    // 6. Signals
    // -----------------------------------------------------------------------
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        trigger.trigger();
    });

    // -----------------------------------------------------------------------
    // 7. Run the HTTP API server (returns once shutdown completes)
    // -----------------------------------------------------------------------
    if let Err(e) = api::serve(app_state, config.http_addr, shutdown).await {
        tracing::error!(error = %e, "HTTP server failed");
        return Err(e);
    }

    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Maintenance scheduler ended abnormally");
    }

    info!("Reception server stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
