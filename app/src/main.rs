//! Claimsync - headless claim sync runner
//!
//! Follows the configured user's claims (plus any claim ids given on the
//! command line) until Ctrl-C, logging feedback instead of showing it.

use anyhow::Result;
use claimsync_app::{AppConfig, HybridClaimOptions, SyncContext};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claimsync=info,claimsync_app=info,claimsync_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting claimsync");

    let config = AppConfig::load()?;
    let context = SyncContext::connect(&config).await?;

    let cancel = CancellationToken::new();
    let background = context.spawn_background(cancel.clone());

    let user_watch = match context.use_claim_sync().session() {
        Some(user) => Some(context.use_user_claims(user.as_str())?),
        None => {
            warn!("No user configured; set CLAIMSYNC_USER_ID to follow your claims");
            None
        }
    };

    let mut claim_watches = Vec::new();
    for claim_id in std::env::args().skip(1) {
        let options = HybridClaimOptions::default()
            .on_update(|update| {
                info!("Claim {} is now {}", update.claim_id, update.status);
            })
            .on_error(|error| warn!("Claim sync error: {}", error));
        claim_watches.push(context.use_hybrid_claim_sync(&claim_id, options)?);
    }

    let report = context.on_foreground().await;
    info!(
        "Initial sync: success={}, {} claims changed, {} errors",
        report.success,
        report.claims_synced,
        report.errors.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    drop(claim_watches);
    drop(user_watch);
    cancel.cancel();
    for task in background {
        let _ = task.await;
    }
    context.shutdown().await?;

    Ok(())
}
