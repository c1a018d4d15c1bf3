//! Persistence of the reconciler status on the RSync object.
//!
//! Every write goes through a get-mutate-replace cycle that skips no-op
//! updates (ignoring timestamps) and truncates error lists when the API
//! server rejects the object for its size: the retained fraction is halved
//! on every rejected attempt until the write fits.

use std::future::Future;

use async_trait::async_trait;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api,
    api::{Patch, PatchParams, PostParams},
};
use serde_json::json;

use crate::{
    crd::{
        ConditionStatus, ErrorSource, RenderingStageStatus, StageStatus, SyncConditionType,
        SyncPipeline, SyncPipelineStatus, set_syncing, status_equal_ignoring_timestamps,
        summarize_errors_for_commit, truncate_errors,
    },
    declared::Scope,
    error::{ErrorEntry, ManagementConflict, SyncError},
    metadata,
    reconciler::status::{ReconcilerStatus, RenderingStatus, SourceStatus, SyncStatus},
};

/// The denominator the error truncation starts out with (no truncation).
const DEFAULT_DENOMINATOR: usize = 1;

pub(crate) fn now() -> Time {
    Time(Timestamp::now())
}

/// Write access to the RSync status. The kube-backed implementation is
/// [`StatusClient`]; tests substitute a stub.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Reads the current status from the live RSync object. A missing object
    /// yields the empty status: the pipeline has simply not reported yet.
    async fn reconciler_status_from_cluster(&self) -> Result<ReconcilerStatus, SyncError>;

    async fn set_source_status(&self, new_status: &SourceStatus) -> Result<(), SyncError>;

    async fn set_rendering_status(
        &self,
        old_status: Option<&RenderingStatus>,
        new_status: &RenderingStatus,
    ) -> Result<(), SyncError>;

    async fn set_sync_status(&self, new_status: &SyncStatus) -> Result<(), SyncError>;

    /// Records on the RSync object whether its source requires rendering, so
    /// the reconciler can be recreated with the matching configuration.
    async fn set_requires_rendering(&self, requires_rendering: bool) -> Result<(), SyncError>;

    /// Prepends conflict records to the sync status of another root-scoped
    /// pipeline, so the conflict is visible on both sides.
    async fn prepend_remediator_conflicts(
        &self,
        root_sync_name: &str,
        conflicts: &[ManagementConflict],
    ) -> Result<(), SyncError>;
}

/// Runs a status write attempt, halving the retained error fraction every
/// time the API server rejects the object for its size.
///
/// The attempt receives the current denominator; the sequence is 1, 2, 4,
/// 8, ... until the write fits or no errors remain to drop.
pub(crate) async fn retry_with_truncation<F, Fut>(
    stage: &'static str,
    error_count: usize,
    mut attempt: F,
) -> Result<(), SyncError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<(), kube::Error>> + Send,
{
    let mut denominator = DEFAULT_DENOMINATOR;
    loop {
        match attempt(denominator).await {
            Ok(()) => return Ok(()),
            Err(error) if is_request_too_large(&error) && error_count / denominator > 0 => {
                tracing::info!(
                    stage,
                    total = error_count,
                    denominator,
                    %error,
                    "status too large, truncating errors and retrying"
                );
                denominator *= 2;
            }
            Err(error) => return Err(SyncError::status_update(stage, &error)),
        }
    }
}

/// The kube-backed [`StatusWriter`] for one pipeline.
pub struct StatusClient {
    client: kube::Client,
    scope: Scope,
    sync_name: String,
}

impl StatusClient {
    pub fn new(client: kube::Client, scope: Scope, sync_name: String) -> Self {
        Self {
            client,
            scope,
            sync_name,
        }
    }

    fn api(&self) -> Api<SyncPipeline> {
        Api::namespaced(self.client.clone(), self.scope.sync_namespace())
    }

    async fn replace_status(
        &self,
        api: &Api<SyncPipeline>,
        name: &str,
        rsync: &SyncPipeline,
    ) -> Result<(), kube::Error> {
        let params = PostParams {
            field_manager: Some(metadata::FIELD_MANAGER.to_owned()),
            ..PostParams::default()
        };
        api.replace_status(name, &params, rsync).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusWriter for StatusClient {
    async fn reconciler_status_from_cluster(&self) -> Result<ReconcilerStatus, SyncError> {
        let rsync = match self.api().get(&self.sync_name).await {
            Ok(rsync) => rsync,
            Err(error) if SyncError::is_not_found(&error) => {
                return Ok(ReconcilerStatus::default());
            }
            Err(source) => {
                return Err(SyncError::api_server(
                    format!("failed to get RSync object {}", self.sync_name),
                    &source,
                ));
            }
        };

        let requires_rendering = rsync
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(metadata::REQUIRES_RENDERING_KEY))
            .is_some_and(|value| value == "true");

        let status = rsync.status.clone().unwrap_or_default();
        Ok(reconciler_status_from_rsync_status(&status, requires_rendering))
    }

    async fn set_source_status(&self, new_status: &SourceStatus) -> Result<(), SyncError> {
        let api = self.api();
        let api = &api;
        retry_with_truncation("source", new_status.errors.len(), move |denominator| async move {
            let mut rsync = api.get(&self.sync_name).await?;
            let current = rsync.status.clone().unwrap_or_default();
            let mut status = current.clone();

            let (errors, summary) = truncate_errors(&new_status.errors, denominator);
            let error_sources = if errors.is_empty() {
                vec![]
            } else {
                vec![ErrorSource::Source]
            };
            status.source = Some(StageStatus {
                spec: new_status.spec.clone(),
                commit: none_if_empty(&new_status.commit),
                errors,
                error_summary: summary.clone(),
                last_update: new_status.last_update.clone(),
            });

            let continue_syncing = summary.total_count == 0;
            set_syncing(
                &mut status,
                continue_syncing,
                "Source",
                "Source",
                none_if_empty(&new_status.commit),
                error_sources,
                summary,
                new_status.last_update.clone().unwrap_or_else(now),
            );

            if current
                .source
                .as_ref()
                .is_some_and(|s| s.last_update.is_some())
                && status_equal_ignoring_timestamps(&current, &status)
            {
                tracing::trace!("skipping no-op source status update");
                return Ok(());
            }

            rsync.status = Some(status);
            self.replace_status(api, &self.sync_name, &rsync).await
        })
        .await
    }

    async fn set_rendering_status(
        &self,
        old_status: Option<&RenderingStatus>,
        new_status: &RenderingStatus,
    ) -> Result<(), SyncError> {
        if old_status.is_some_and(|old| old.equals(new_status)) {
            return Ok(());
        }

        let api = self.api();
        let api = &api;
        retry_with_truncation("rendering", new_status.errors.len(), move |denominator| async move {
            let mut rsync = api.get(&self.sync_name).await?;
            let current = rsync.status.clone().unwrap_or_default();
            let mut status = current.clone();

            let (errors, summary) = truncate_errors(&new_status.errors, denominator);
            let error_sources = if errors.is_empty() {
                vec![]
            } else {
                vec![ErrorSource::Rendering]
            };
            status.rendering = Some(RenderingStageStatus {
                spec: new_status.spec.clone(),
                commit: none_if_empty(&new_status.commit),
                message: new_status.message.clone(),
                errors,
                error_summary: summary.clone(),
                last_update: new_status.last_update.clone(),
            });

            let continue_syncing = summary.total_count == 0;
            set_syncing(
                &mut status,
                continue_syncing,
                "Rendering",
                &new_status.message,
                none_if_empty(&new_status.commit),
                error_sources,
                summary,
                new_status.last_update.clone().unwrap_or_else(now),
            );

            if current
                .rendering
                .as_ref()
                .is_some_and(|r| r.last_update.is_some())
                && status_equal_ignoring_timestamps(&current, &status)
            {
                tracing::trace!("skipping no-op rendering status update");
                return Ok(());
            }

            rsync.status = Some(status);
            self.replace_status(api, &self.sync_name, &rsync).await
        })
        .await
    }

    async fn set_sync_status(&self, new_status: &SyncStatus) -> Result<(), SyncError> {
        let api = self.api();
        let api = &api;
        retry_with_truncation("sync", new_status.errors.len(), move |denominator| async move {
            let mut rsync = api.get(&self.sync_name).await?;
            let current = rsync.status.clone().unwrap_or_default();
            let mut status = current.clone();

            let (errors, summary) = truncate_errors(&new_status.errors, denominator);
            status.sync = Some(StageStatus {
                spec: new_status.spec.clone(),
                commit: none_if_empty(&new_status.commit),
                errors,
                error_summary: summary,
                last_update: new_status.last_update.clone(),
            });

            // The Syncing condition only ever represents the latest commit.
            // Fetching and parsing share the source status, so the rendering
            // commit has to be checked as well, it may be updated first.
            let sync_commit = status.sync.as_ref().and_then(|s| s.commit.clone());
            let source_commit = status.source.as_ref().and_then(|s| s.commit.clone());
            let rendering_commit = status.rendering.as_ref().and_then(|r| r.commit.clone());
            if source_commit == sync_commit && rendering_commit == sync_commit {
                let (error_sources, summary) =
                    summarize_errors_for_commit(&status, sync_commit.as_deref());
                if new_status.syncing {
                    set_syncing(
                        &mut status,
                        true,
                        "Sync",
                        "Syncing",
                        sync_commit,
                        error_sources,
                        summary,
                        new_status.last_update.clone().unwrap_or_else(now),
                    );
                } else {
                    if summary.total_count == 0 {
                        status.last_synced_commit.clone_from(&sync_commit);
                    }
                    set_syncing(
                        &mut status,
                        false,
                        "Sync",
                        "Sync Completed",
                        sync_commit,
                        error_sources,
                        summary,
                        new_status.last_update.clone().unwrap_or_else(now),
                    );
                }
            }

            if current
                .sync
                .as_ref()
                .is_some_and(|s| s.last_update.is_some())
                && status_equal_ignoring_timestamps(&current, &status)
            {
                tracing::trace!("skipping no-op sync status update");
                return Ok(());
            }

            rsync.status = Some(status);
            self.replace_status(api, &self.sync_name, &rsync).await
        })
        .await
    }

    async fn set_requires_rendering(&self, requires_rendering: bool) -> Result<(), SyncError> {
        let api = self.api();
        let rsync = api.get(&self.sync_name).await.map_err(|source| {
            SyncError::api_server(
                format!("failed to get RSync object {}", self.sync_name),
                &source,
            )
        })?;

        let new_value = requires_rendering.to_string();
        let current = rsync
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(metadata::REQUIRES_RENDERING_KEY));
        if current == Some(&new_value) {
            // avoid unnecessary updates
            return Ok(());
        }

        let patch = json!({
            "metadata": {
                "annotations": {
                    metadata::REQUIRES_RENDERING_KEY: new_value,
                },
            },
        });
        let params = PatchParams {
            field_manager: Some(metadata::FIELD_MANAGER.to_owned()),
            ..PatchParams::default()
        };
        api.patch(&self.sync_name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|source| {
                SyncError::api_server(
                    format!(
                        "failed to set the {} annotation on RSync object {}",
                        metadata::REQUIRES_RENDERING_KEY,
                        self.sync_name
                    ),
                    &source,
                )
            })?;
        Ok(())
    }

    async fn prepend_remediator_conflicts(
        &self,
        root_sync_name: &str,
        conflicts: &[ManagementConflict],
    ) -> Result<(), SyncError> {
        let api: Api<SyncPipeline> =
            Api::namespaced(self.client.clone(), crate::declared::SYSTEM_NAMESPACE);
        let api = &api;
        // The combined error count is only known after reading the other
        // pipeline's status, so the conflict count has to bound the
        // truncation retries instead.
        retry_with_truncation("sync", conflicts.len(), move |denominator| async move {
            let mut rsync = api.get(root_sync_name).await?;
            let mut status = rsync.status.clone().unwrap_or_default();
            let mut sync = status.sync.clone().unwrap_or_default();

            // Only prepend conflicts the other pipeline does not know yet.
            let mut new_entries: Vec<ErrorEntry> = conflicts
                .iter()
                .map(ManagementConflict::to_entry)
                .filter(|entry| !sync.errors.contains(entry))
                .collect();
            if new_entries.is_empty() {
                return Ok(());
            }
            new_entries.extend(sync.errors.clone());

            let (errors, summary) = truncate_errors(&new_entries, denominator);
            sync.errors = errors;
            sync.error_summary = summary;
            sync.last_update = Some(now());
            status.sync = Some(sync);
            rsync.status = Some(status);

            self.replace_status(api, root_sync_name, &rsync).await
        })
        .await
    }
}

/// Whether the API server rejected a write because the object got too big.
pub fn is_request_too_large(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(response) => {
            response.code == 413
                || response.reason == "RequestEntityTooLarge"
                || response.message.contains("ResourceExhausted")
        }
        _ => false,
    }
}

fn none_if_empty(commit: &str) -> Option<String> {
    if commit.is_empty() {
        None
    } else {
        Some(commit.to_owned())
    }
}

/// Maps the persisted RSync status into the in-memory representation.
fn reconciler_status_from_rsync_status(
    status: &SyncPipelineStatus,
    requires_rendering: bool,
) -> ReconcilerStatus {
    let syncing_condition = status
        .conditions
        .iter()
        .find(|condition| condition.type_ == SyncConditionType::Syncing);
    let syncing = syncing_condition.is_some_and(|c| c.status == ConditionStatus::True);

    ReconcilerStatus {
        source: status.source.as_ref().map(|source| SourceStatus {
            spec: source.spec.clone(),
            commit: source.commit.clone().unwrap_or_default(),
            errors: source.errors.clone(),
            last_update: source.last_update.clone(),
        }),
        rendering: status.rendering.as_ref().map(|rendering| RenderingStatus {
            spec: rendering.spec.clone(),
            commit: rendering.commit.clone().unwrap_or_default(),
            message: rendering.message.clone(),
            errors: rendering.errors.clone(),
            last_update: rendering.last_update.clone(),
            requires_rendering,
        }),
        sync: status.sync.as_ref().map(|sync| SyncStatus {
            spec: sync.spec.clone(),
            syncing,
            commit: sync.commit.clone().unwrap_or_default(),
            errors: sync.errors.clone(),
            last_update: sync.last_update.clone(),
        }),
        syncing_condition_last_update: syncing_condition
            .and_then(|condition| condition.last_update_time.clone()),
    }
}
