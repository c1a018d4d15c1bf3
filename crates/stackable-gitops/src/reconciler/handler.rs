//! Maps funnel events to triggered runs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::reconciler::{
    PipelineContext,
    events::{EventResult, EventType, Subscriber},
    namespace_events::NamespaceControllerState,
    run::{Trigger, run, set_sync_status},
    state::SharedState,
};

/// The funnel subscriber: decides per event whether (and with which trigger)
/// to invoke the run function, and how the event affects the cache.
pub struct EventHandler {
    pub ctx: Arc<PipelineContext>,
    pub state: SharedState,
    pub ns_state: Arc<NamespaceControllerState>,
}

#[async_trait]
impl Subscriber for EventHandler {
    async fn handle(&mut self, event: EventType) -> EventResult {
        let mut result = EventResult::default();

        let run_result = match event {
            EventType::SyncWithReimport => {
                // Re-apply even if no changes were detected. The reset is
                // partial: the cached source files are kept to avoid
                // re-reading them, and the retry flag is kept so the backoff
                // is not restarted.
                tracing::info!("it is time for a forced resync");
                self.state.lock().await.reset_partial_cache();
                Some(run(&self.ctx, Trigger::Resync, &self.state).await)
            }

            EventType::Sync => {
                // Re-import declared resources from the source.
                Some(run(&self.ctx, Trigger::Reimport, &self.state).await)
            }

            EventType::Status => {
                // Publish the sync status periodically to surface remediator
                // errors. Skipped until the remediator is running and its
                // watches are established, which implies a successful sync.
                if self.ctx.updater.remediator.remediating() {
                    tracing::debug!("updating sync status (periodic while not syncing)");
                    let mut st = self.state.lock().await;
                    let (spec, commit) = {
                        let sync = st.status.as_ref().and_then(|s| s.sync.as_ref());
                        (
                            sync.and_then(|s| s.spec.clone()),
                            sync.map(|s| s.commit.clone()).unwrap_or_default(),
                        )
                    };
                    let errors = self.ctx.sync_error_entries();
                    if let Err(error) =
                        set_sync_status(&self.ctx, &mut st, spec, false, commit, errors).await
                    {
                        tracing::warn!(%error, "failed to update sync status");
                    }
                }
                None
            }

            EventType::NamespaceResync => {
                if self.ns_state.schedule_sync() {
                    tracing::info!("a new sync was triggered by a namespace event");
                    self.state.lock().await.reset_partial_cache();
                    Some(run(&self.ctx, Trigger::NamespaceEvent, &self.state).await)
                } else {
                    None
                }
            }

            EventType::RetrySync => {
                // Retry if there was an error, a conflict, or a pending
                // watch update. Conflicts re-run validation and apply, so
                // they also reset the cache partially.
                let trigger = if self.ctx.updater.errors.has_conflicts() {
                    self.state.lock().await.reset_partial_cache();
                    Some(Trigger::ManagementConflict)
                } else if self.state.lock().await.cache.need_to_retry {
                    Some(Trigger::Retry)
                } else if self.ctx.updater.remediator.needs_update() {
                    Some(Trigger::WatchUpdate)
                } else {
                    None
                };

                match trigger {
                    Some(trigger) => {
                        result.trigger_retry_backoff = true;
                        tracing::info!(%trigger, "retrying sync");
                        Some(run(&self.ctx, trigger, &self.state).await)
                    }
                    None => None,
                }
            }
        };

        // A successful run or a detected source change restarts the retry
        // backoff, so a new commit is retried promptly.
        if let Some(run_result) = run_result {
            if run_result.success || run_result.source_changed {
                result.reset_retry_backoff = true;
                result.trigger_retry_backoff = false;
            }
        }
        result
    }
}
