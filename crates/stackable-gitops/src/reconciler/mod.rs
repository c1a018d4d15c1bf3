//! The parse-apply-watch control loop and its collaborators.

use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;

pub mod conflict;
pub mod events;
pub mod finalizer;
pub mod handler;
pub mod namespace_events;
pub mod run;
pub mod source;
pub mod state;
pub mod status;
pub mod status_client;
pub mod updater;

pub use finalizer::Finalizer;
pub use handler::EventHandler;
pub use run::{RunResult, Trigger, run};
pub use state::{ReconcilerState, SharedState};
pub use status_client::{StatusClient, StatusWriter};
pub use updater::{Applier, Remediator, SyncErrorCache, Updater};

use crate::{
    declared::Scope,
    error::ErrorEntry,
    reconciler::{
        events::{PublishingGroup, RetryBackoff},
        namespace_events::NamespaceControllerState,
        source::{FileSource, SourceReader},
    },
};

/// The settings of one reconciler process.
#[derive(Clone, Debug)]
pub struct Options {
    /// The scope of resources this reconciler manages.
    pub scope: Scope,
    /// The name of the RSync object this reconciler reports to.
    pub sync_name: String,
    /// The name of the reconciler deployment.
    pub reconciler_name: String,
    /// How often to force a re-apply, even without a new commit.
    pub resync_period: Duration,
    /// How often to check the source for a new commit.
    pub polling_period: Duration,
    /// The initial delay between retries after an error.
    pub retry_period: Duration,
    /// How often to republish the sync status while syncing, so remediator
    /// errors surface.
    pub status_update_period: Duration,
    /// Whether this reconciler runs with the rendering container.
    pub rendering_enabled: bool,
    /// Whether the admission guard is installed; declared-field annotations
    /// are only written when it is.
    pub webhook_enabled: bool,
    /// Whether namespace events can require re-syncs (dynamic namespace
    /// selectors in use).
    pub namespace_events_enabled: bool,
    /// Where the source of truth lives.
    pub file_source: FileSource,
}

/// Everything a run needs: the configuration and the external collaborators.
pub struct PipelineContext {
    pub options: Options,
    pub source_reader: Arc<dyn SourceReader>,
    pub status_writer: Arc<dyn StatusWriter>,
    pub updater: Updater,
}

impl PipelineContext {
    /// The current sync errors: conflicts, fights, apply and watch errors.
    pub fn sync_error_entries(&self) -> Vec<ErrorEntry> {
        self.updater.errors.entries()
    }
}

/// How often the namespace-resync publisher checks for pending namespace
/// events.
const NAMESPACE_EVENT_PERIOD: Duration = Duration::from_secs(1);

/// How many retry steps the backoff grants before waiting for a new commit.
const RETRY_STEP_LIMIT: u32 = 12;

/// Runs the control loop until the shutdown future resolves, then drains the
/// remediator and finally runs the finalizer.
///
/// The ordering must not change: watching has to stop and in-flight work has
/// to drain before managed resources may be torn down.
pub async fn run_reconciler(
    ctx: Arc<PipelineContext>,
    ns_state: Arc<NamespaceControllerState>,
    finalizer: Finalizer,
    shutdown: impl Future<Output = ()>,
) {
    let state: SharedState = Arc::new(Mutex::new(ReconcilerState::default()));

    let publishers = PublishingGroup {
        sync_period: ctx.options.polling_period,
        resync_period: ctx.options.resync_period,
        status_update_period: ctx.options.status_update_period,
        namespace_event_period: ctx
            .options
            .namespace_events_enabled
            .then_some(NAMESPACE_EVENT_PERIOD),
        retry_backoff: RetryBackoff::new(ctx.options.retry_period, RETRY_STEP_LIMIT),
    };
    let mut handler = EventHandler {
        ctx: Arc::clone(&ctx),
        state,
        ns_state,
    };

    tracing::info!(reconciler = %ctx.options.reconciler_name, "starting parser");
    publishers.funnel(&mut handler, shutdown).await;
    tracing::info!("parser exited");

    ctx.updater.remediator.drain().await;
    tracing::info!("remediator exited");

    if let Err(error) = finalizer.run().await {
        tracing::error!(%error, "finalizer failed");
    }
    tracing::info!("all controllers exited");
}
