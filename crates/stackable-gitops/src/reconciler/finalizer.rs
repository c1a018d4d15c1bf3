//! Teardown of managed resources when the pipeline object is deleted.
//!
//! The finalizer only runs after the control loop and the remediator have
//! fully stopped: deleting resources while a watcher could still revert the
//! deletion would fight with ourselves.

use std::sync::Arc;

use kube::{
    Api,
    api::{Patch, PatchParams},
};
use serde_json::json;

use crate::{
    crd::SyncPipeline,
    declared::Scope,
    error::SyncError,
    metadata,
    reconciler::updater::Applier,
};

pub struct Finalizer {
    pub client: kube::Client,
    pub applier: Arc<dyn Applier>,
    pub scope: Scope,
    pub sync_name: String,
}

impl Finalizer {
    /// Destroys the managed resources if the pipeline object is marked for
    /// deletion and carries our finalizer, then releases the finalizer.
    pub async fn run(&self) -> Result<(), SyncError> {
        let api: Api<SyncPipeline> =
            Api::namespaced(self.client.clone(), self.scope.sync_namespace());
        let rsync = match api.get(&self.sync_name).await {
            Ok(rsync) => rsync,
            // An already deleted pipeline has nothing left to finalize.
            Err(source) if SyncError::is_not_found(&source) => return Ok(()),
            Err(source) => {
                return Err(SyncError::api_server(
                    format!("failed to get RSync object {}", self.sync_name),
                    &source,
                ));
            }
        };

        let deleting = rsync.metadata.deletion_timestamp.is_some();
        let has_finalizer = rsync
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| finalizers.iter().any(|f| f == metadata::SYNC_FINALIZER));
        if !deleting || !has_finalizer {
            return Ok(());
        }

        tracing::info!(sync_name = %self.sync_name, "destroying managed resources");
        let errors = self.applier.destroy().await;
        if !errors.is_empty() {
            return Err(SyncError::Internal {
                message: format!("failed to destroy managed resources: {errors}"),
            });
        }

        let remaining: Vec<String> = rsync
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != metadata::SYNC_FINALIZER)
            .collect();
        let patch = json!({ "metadata": { "finalizers": remaining } });
        let params = PatchParams {
            field_manager: Some(metadata::FIELD_MANAGER.to_owned()),
            ..PatchParams::default()
        };
        api.patch(&self.sync_name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|source| {
                SyncError::api_server(
                    format!("failed to release the finalizer on {}", self.sync_name),
                    &source,
                )
            })?;
        tracing::info!(sync_name = %self.sync_name, "finalizer released");
        Ok(())
    }
}
