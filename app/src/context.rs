//! Explicitly constructed sync services shared by every screen

use crate::config::AppConfig;
use crate::feedback_sink::LogFeedbackSink;
use anyhow::Result;
use claimsync_core::{FeedbackConfig, SyncConfig, SyncReport};
use claimsync_engine::{
    spawn_connection_banner, ClaimSyncService, FeedbackManager, FeedbackSink, HybridClaimSync,
    ReconnectionStrategy, SubscriptionManager, UpdatePipeline,
};
use claimsync_networking::{BackendApi, PhoenixTransport, RealtimeTransport, SupabaseClient};
use claimsync_persistence::{ClaimStore, StateCache};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// External collaborators the context is built from
pub struct SyncServices {
    pub api: Arc<dyn BackendApi>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub cache: Arc<StateCache>,
    pub sink: Arc<dyn FeedbackSink>,
}

/// Root of the service graph
///
/// Cloning is cheap and every clone shares the same services.
#[derive(Clone)]
pub struct SyncContext {
    pub(crate) api: Arc<dyn BackendApi>,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) hybrid: HybridClaimSync,
    pub(crate) claim_sync: ClaimSyncService,
    pub(crate) feedback: FeedbackManager,
    pub(crate) cache: Arc<StateCache>,
    pub(crate) pipeline: UpdatePipeline,
    pub(crate) sync_config: SyncConfig,
}

impl SyncContext {
    pub fn new(services: SyncServices, sync: &SyncConfig, feedback: FeedbackConfig) -> Self {
        let SyncServices {
            api,
            transport,
            cache,
            sink,
        } = services;

        let strategy = ReconnectionStrategy::new(sync.reconnection.clone());
        let subscriptions = SubscriptionManager::new(transport, strategy);
        let hybrid = HybridClaimSync::new(
            api.clone(),
            subscriptions.clone(),
            cache.clone(),
            sync.poll_interval(),
        );
        let claim_sync = ClaimSyncService::new(api.clone(), cache.clone());
        let feedback = FeedbackManager::new(sink, feedback);
        let pipeline = UpdatePipeline::new(cache.clone(), feedback.clone());

        Self {
            api,
            subscriptions,
            hybrid,
            claim_sync,
            feedback,
            cache,
            pipeline,
            sync_config: sync.clone(),
        }
    }

    /// Production wiring: REST client, websocket transport, SQLite snapshot
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let api = Arc::new(SupabaseClient::new(config.backend.clone())?);
        let transport = Arc::new(PhoenixTransport::new(config.backend.clone()));

        let snapshot = config.snapshot_path();
        let store = Arc::new(ClaimStore::connect(&snapshot).await?);
        let cache = Arc::new(StateCache::with_store(store));
        cache.initialize().await?;
        info!("Claim snapshot at {} ({} claims)", snapshot.display(), cache.len());

        let context = Self::new(
            SyncServices {
                api,
                transport,
                cache,
                sink: Arc::new(LogFeedbackSink),
            },
            &config.sync,
            config.feedback.clone(),
        );
        context.claim_sync.set_session(config.session_user()?);
        Ok(context)
    }

    pub fn api(&self) -> &Arc<dyn BackendApi> {
        &self.api
    }

    pub fn hybrid(&self) -> &HybridClaimSync {
        &self.hybrid
    }

    pub fn pipeline(&self) -> &UpdatePipeline {
        &self.pipeline
    }

    /// App came to the foreground (or the user pulled to refresh)
    ///
    /// Revives parked channels, lets hybrid claims reconsider their
    /// transport, then reconciles with the backend.
    pub async fn on_foreground(&self) -> SyncReport {
        let revived = self.subscriptions.reset_failed_channels();
        let reevaluated = self.hybrid.reevaluate();
        info!(
            "Foreground: {} channel(s) revived, {} claim(s) re-evaluated",
            revived, reevaluated
        );
        self.claim_sync.manual_sync().await
    }

    /// Connection banner and reachability monitor, stopped by `cancel`
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            spawn_connection_banner(
                self.feedback.clone(),
                self.subscriptions.watch_connection_state(),
                cancel.clone(),
            ),
            self.claim_sync
                .spawn_reachability_monitor(self.sync_config.poll_interval(), cancel),
        ]
    }

    /// Persist the cache snapshot
    pub async fn shutdown(&self) -> Result<()> {
        self.cache.flush().await?;
        info!("Flushed {} cached claims", self.cache.len());
        Ok(())
    }
}
