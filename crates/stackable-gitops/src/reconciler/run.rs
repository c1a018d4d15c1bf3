//! The trigger-driven parse-apply-watch run.
//!
//! One invocation walks the full pipeline: prime the status cache, fetch the
//! source, gate on rendering, read and parse the configuration, hydrate and
//! apply the objects, and report the sync status. Redundant work is skipped
//! via the commit cache, and the state is only checkpointed when every step
//! including the final status write succeeded.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    crd::SourceSpec,
    declared::hydrate,
    error::{ErrorEntry, Errors, SyncError},
    reconciler::{
        PipelineContext, conflict,
        source::{self, RenderingProgress, SourceState},
        state::{ReconcilerState, SharedState},
        status::{ReconcilerStatus, RenderingStatus, SourceStatus, SyncStatus},
        status_client::now,
    },
};

/// Why a run was triggered. The string forms are stable and surfaced in
/// logs, they are part of the observable contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum Trigger {
    Resync,
    Reimport,
    Retry,
    ManagementConflict,
    WatchUpdate,
    NamespaceEvent,
}

/// Rendering is still in progress for the fetched commit.
pub const RENDERING_IN_PROGRESS: &str = "Rendering is still in progress";

/// The configs have been rendered successfully.
pub const RENDERING_SUCCEEDED: &str = "Rendering succeeded";

/// The configs failed to render.
pub const RENDERING_FAILED: &str = "Rendering failed";

/// The configs do not need rendering.
pub const RENDERING_SKIPPED: &str = "Rendering skipped";

/// The configs require rendering but the rendering container is not running.
pub const RENDERING_REQUIRED: &str = "Rendering required but is currently disabled";

/// The configs do not require rendering but the rendering container is
/// running.
pub const RENDERING_NOT_REQUIRED: &str = "Rendering not required but is currently enabled";

/// The outcome of one run, consumed by the event handler to decide whether
/// to reset the retry backoff.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunResult {
    pub source_changed: bool,
    pub success: bool,
}

fn status_mut(state: &mut ReconcilerState) -> &mut ReconcilerStatus {
    state.status.get_or_insert_with(Default::default)
}

/// Runs the parse-apply-watch sequence once.
pub async fn run(ctx: &Arc<PipelineContext>, trigger: Trigger, state: &SharedState) -> RunResult {
    let mut result = RunResult::default();
    tracing::debug!(%trigger, "sync run starting");

    let mut st = state.lock().await;

    // Prime the in-memory status from the live object on the first run.
    if st.status.is_none() {
        match ctx.status_writer.reconciler_status_from_cluster().await {
            Ok(status) => st.status = Some(status),
            Err(error) => {
                let errors = Errors::from(error);
                st.invalidate(&errors);
                return result;
            }
        }
    }

    // Fetch the source commit and directory, with bounded retries.
    let (fetched, fetch_errors) = match source::fetch_source_with_retry(
        ctx.source_reader.as_ref(),
        source::source_retry_backoff(),
    )
    .await
    {
        Ok(fetched) => (Some(fetched), Errors::new()),
        Err(error) => (None, Errors::from(error)),
    };
    let commit = fetched
        .as_ref()
        .map(|f| f.commit.clone())
        .unwrap_or_default();
    let spec = ctx.options.file_source.to_source_spec(&commit);

    // Only update the source status here if fetching failed or the commit
    // changed. Parse errors for the cached commit would be overwritten
    // otherwise.
    let commit_changed = status_mut(&mut st)
        .source
        .as_ref()
        .is_none_or(|s| s.commit != commit);
    if !fetch_errors.is_empty() || commit_changed {
        let new_source_status = SourceStatus {
            spec: Some(spec.clone()),
            commit: commit.clone(),
            errors: fetch_errors.entries(),
            last_update: Some(now()),
        };
        if status_mut(&mut st).need_to_set_source_status(&new_source_status) {
            tracing::debug!("updating source status (after fetch)");
            if let Err(error) = ctx.status_writer.set_source_status(&new_source_status).await {
                // The status could not be published; stop and retry later.
                let mut errors = fetch_errors;
                errors.push(error);
                st.invalidate(&errors);
                return result;
            }
            let status = status_mut(&mut st);
            status.source = Some(new_source_status.clone());
            status.syncing_condition_last_update = new_source_status.last_update.clone();
        }
        if !fetch_errors.is_empty() {
            st.invalidate(&fetch_errors);
            return result;
        }
    }
    let Some(fetched) = fetched else {
        return result;
    };

    let mut rendering_status = RenderingStatus {
        spec: Some(spec.clone()),
        commit: commit.clone(),
        requires_rendering: status_mut(&mut st)
            .rendering
            .as_ref()
            .is_some_and(|r| r.requires_rendering),
        ..Default::default()
    };
    let mut source_state = SourceState {
        spec: Some(spec.clone()),
        commit: commit.clone(),
        sync_dir: fetched.sync_dir.clone(),
        files: vec![],
    };

    let mut rendering_errors = Errors::new();
    match ctx.source_reader.rendering_progress(&commit).await {
        RenderingProgress::InProgress => {
            // Nothing to parse yet, report progress and wait for the next
            // trigger.
            rendering_status.message = RENDERING_IN_PROGRESS.to_owned();
            rendering_status.last_update = Some(now());
            tracing::debug!("updating rendering status (before read)");
            let old = status_mut(&mut st).rendering.clone();
            match ctx
                .status_writer
                .set_rendering_status(old.as_ref(), &rendering_status)
                .await
            {
                Ok(()) => {
                    st.reset_cache();
                    let status = status_mut(&mut st);
                    status.rendering = Some(rendering_status.clone());
                    status.syncing_condition_last_update = rendering_status.last_update.clone();
                }
                Err(error) => {
                    let errors = Errors::from(error);
                    st.invalidate(&errors);
                }
            }
            return result;
        }
        RenderingProgress::Skipped => {
            rendering_status.message = RENDERING_SKIPPED.to_owned();
            rendering_status.requires_rendering = false;
        }
        RenderingProgress::Succeeded { sync_dir } => {
            rendering_status.message = RENDERING_SUCCEEDED.to_owned();
            rendering_status.requires_rendering = true;
            source_state.sync_dir = sync_dir;
        }
        RenderingProgress::Failed { message } => {
            rendering_status.message = RENDERING_FAILED.to_owned();
            rendering_status.requires_rendering = true;
            rendering_errors.push(SyncError::Rendering { message });
        }
        RenderingProgress::Required => {
            rendering_status.message = RENDERING_REQUIRED.to_owned();
            rendering_status.requires_rendering = true;
            rendering_errors.push(SyncError::Rendering {
                message: "the source contains dry configs and the rendering container is not running"
                    .to_owned(),
            });
        }
        RenderingProgress::NotRequired => {
            rendering_status.message = RENDERING_NOT_REQUIRED.to_owned();
            rendering_status.requires_rendering = false;
            rendering_errors.push(SyncError::Rendering {
                message: "the source contains only wet configs and the rendering container is running"
                    .to_owned(),
            });
        }
    }

    if ctx.options.rendering_enabled != rendering_status.requires_rendering {
        // The reconciler is misconfigured for its source. Record it on the
        // RSync object so the reconciler manager recreates this reconciler
        // with the matching configuration.
        if let Err(error) = ctx
            .status_writer
            .set_requires_rendering(rendering_status.requires_rendering)
            .await
        {
            rendering_errors.push(SyncError::Rendering {
                message: format!("failed to record the rendering requirement: {error}"),
            });
        }
    }

    // Read the source files, unless the resolved directory is unchanged.
    let old_sync_dir = st.cache.source.as_ref().map(|s| s.sync_dir.clone());
    let mut read_errors = Errors::new();
    if rendering_errors.is_empty() && old_sync_dir.as_ref() != Some(&source_state.sync_dir) {
        tracing::info!(
            sync_dir = %source_state.sync_dir.display(),
            "new source changes detected, resetting the cache"
        );
        // Reset so every step of the parse-apply-watch sequence runs again.
        st.reset_cache();
        match ctx.source_reader.read_files(&source_state).await {
            Ok(files) => {
                source_state.files = files;
                st.cache.source = Some(source_state.clone());
            }
            Err(error) => read_errors.push(error),
        }
    }

    // Update the rendering status before the source status: parsing happens
    // after rendering and may attach its own errors to the source status.
    rendering_status.errors = rendering_errors.entries();
    rendering_status.last_update = Some(now());
    tracing::debug!("updating rendering status (after read)");
    let old = status_mut(&mut st).rendering.clone();
    match ctx
        .status_writer
        .set_rendering_status(old.as_ref(), &rendering_status)
        .await
    {
        Ok(()) => {
            let status = status_mut(&mut st);
            status.rendering = Some(rendering_status.clone());
            status.syncing_condition_last_update = rendering_status.last_update.clone();
        }
        Err(error) => rendering_errors.push(error),
    }
    if !rendering_errors.is_empty() {
        st.invalidate(&rendering_errors);
        return result;
    }

    if !read_errors.is_empty() {
        let new_source_status = SourceStatus {
            spec: Some(spec.clone()),
            commit: commit.clone(),
            errors: read_errors.entries(),
            last_update: Some(now()),
        };
        if status_mut(&mut st).need_to_set_source_status(&new_source_status) {
            tracing::debug!("updating source status (after read)");
            match ctx.status_writer.set_source_status(&new_source_status).await {
                Ok(()) => {
                    let status = status_mut(&mut st);
                    status.source = Some(new_source_status.clone());
                    status.syncing_condition_last_update = new_source_status.last_update.clone();
                }
                Err(error) => read_errors.push(error),
            }
        }
        st.invalidate(&read_errors);
        return result;
    }

    let new_sync_dir = st.cache.source.as_ref().map(|s| s.sync_dir.clone());
    if new_sync_dir != old_sync_dir {
        // A new commit was parsed successfully; stopped retries start again.
        result.source_changed = true;
    }

    // A plain reimport with no source changes skips the parse-apply-watch
    // sequence: a previously successful pass made it redundant, and after a
    // failed pass the retry trigger drives the next attempt.
    if trigger == Trigger::Reimport && new_sync_dir == old_sync_dir {
        return result;
    }

    drop(st);
    let errors = parse_and_update(ctx, state).await;

    let mut st = state.lock().await;
    if !errors.is_empty() {
        st.invalidate(&errors);
        return result;
    }

    // Only checkpoint the state after *everything* succeeded, including the
    // final status write.
    st.checkpoint();
    result.success = true;
    result
}

/// Parses and hydrates the cached source, hands the objects to the applier,
/// and reports the sync status, republishing it periodically while the
/// update runs.
async fn parse_and_update(ctx: &Arc<PipelineContext>, state: &SharedState) -> Errors {
    let mut st = state.lock().await;
    let Some(source_state) = st.cache.source.clone() else {
        return Errors::from(SyncError::Internal {
            message: "no cached source to parse".to_owned(),
        });
    };

    if !st.cache.parser_result_up_to_date() {
        tracing::debug!("parser starting");
        let (mut objects, mut errors) = ctx.source_reader.parse(&source_state).await;

        let manager = ctx.options.scope.manager(&ctx.options.sync_name);
        hydrate::annotate_management_metadata(&mut objects, &manager, &source_state.commit);
        if ctx.options.webhook_enabled {
            errors.extend(hydrate::hydrate_declared_fields(&mut objects));
        } else {
            tracing::debug!("removing the declared-fields annotation, the admission guard is disabled");
            hydrate::strip_declared_fields(&mut objects);
        }
        st.cache.set_parser_result(objects, errors);
        tracing::debug!("parser stopped");
    }

    let source_errors = st.cache.parser_errors.clone();
    let new_source_status = SourceStatus {
        spec: source_state.spec.clone(),
        commit: source_state.commit.clone(),
        errors: source_errors.entries(),
        last_update: Some(now()),
    };
    if status_mut(&mut st).need_to_set_source_status(&new_source_status) {
        tracing::debug!("updating source status (after parse)");
        if let Err(error) = ctx.status_writer.set_source_status(&new_source_status).await {
            // Terminate here: if the apply went ahead and succeeded, the
            // persisted sync commit would overtake the source commit.
            let mut errors = source_errors;
            errors.push(error);
            return errors;
        }
        let status = status_mut(&mut st);
        status.source = Some(new_source_status.clone());
        status.syncing_condition_last_update = new_source_status.last_update.clone();
    }

    if source_errors.has_blocking() {
        return source_errors;
    }

    // Republish the sync status periodically while the applier and the
    // remediator keep running.
    let (stop_tx, stop_rx) = watch::channel(false);
    let ticker = tokio::spawn(update_sync_status_periodically(
        Arc::clone(ctx),
        Arc::clone(state),
        stop_rx,
    ));
    drop(st);

    tracing::debug!("updater starting");
    let update_errors = ctx.updater.update(state).await;
    tracing::debug!("updater stopped");

    let _ = stop_tx.send(true);
    let _ = ticker.await;

    // Sync errors cover the updater and the remediator.
    let mut st = state.lock().await;
    tracing::debug!("updating sync status (after sync)");
    let mut errors = source_errors;
    errors.extend(update_errors);
    for conflict in ctx.updater.errors.conflicts() {
        errors.push(conflict.to_error());
    }
    if let Err(error) = set_sync_status(
        ctx,
        &mut st,
        source_state.spec.clone(),
        false,
        source_state.commit.clone(),
        ctx.sync_error_entries(),
    )
    .await
    {
        errors.push(error);
    }
    errors
}

/// Updates `status.sync` and the Syncing condition if needed, then reports
/// accumulated conflicts to the opposing managers.
pub(crate) async fn set_sync_status(
    ctx: &PipelineContext,
    st: &mut ReconcilerState,
    spec: Option<SourceSpec>,
    syncing: bool,
    commit: String,
    errors: Vec<ErrorEntry>,
) -> Result<(), SyncError> {
    let new_status = SyncStatus {
        spec,
        syncing,
        commit,
        errors,
        last_update: Some(now()),
    };
    if status_mut(st).need_to_set_sync_status(&new_status) {
        ctx.status_writer.set_sync_status(&new_status).await?;
        let status = status_mut(st);
        status.sync = Some(new_status.clone());
        status.syncing_condition_last_update = new_status.last_update.clone();
    }

    conflict::report_conflicts(ctx.status_writer.as_ref(), ctx.updater.errors.conflicts()).await
}

/// Republishes the sync status on a timer until stopped, so long-running
/// applies surface remediator errors without waiting for completion.
async fn update_sync_status_periodically(
    ctx: Arc<PipelineContext>,
    state: SharedState,
    mut stop_rx: watch::Receiver<bool>,
) {
    tracing::debug!("periodic sync status updates starting");
    let period = ctx.options.status_update_period;
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                tracing::debug!("periodic sync status updates stopped");
                return;
            }
            _ = timer.tick() => {
                let mut st = state.lock().await;
                tracing::debug!("updating sync status (periodic while syncing)");
                let spec = st
                    .status
                    .as_ref()
                    .and_then(|s| s.source.as_ref())
                    .and_then(|s| s.spec.clone());
                let commit = st
                    .cache
                    .source
                    .as_ref()
                    .map(|s| s.commit.clone())
                    .unwrap_or_default();
                if let Err(error) = set_sync_status(
                    &ctx,
                    &mut st,
                    spec,
                    true,
                    commit,
                    ctx.sync_error_entries(),
                )
                .await
                {
                    tracing::warn!(%error, "failed to update sync status");
                }
            }
        }
    }
}
