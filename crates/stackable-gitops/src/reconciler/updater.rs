//! The update step of the control loop: publish the declared resources,
//! apply them, and bring the remediator watches in line.
//!
//! The applier and remediator are external components. They communicate back
//! only through [`SyncErrorCache`], which the control loop polls at
//! well-defined points; they never mutate control-loop state directly.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use kube::core::DynamicObject;

use crate::{
    declared::{GroupKind, Resources},
    error::{ErrorEntry, Errors, ManagementConflict, SyncError},
    reconciler::state::SharedState,
};

/// Applies declared objects to the cluster. Implemented by the external
/// applier/pruner.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Creates, updates and prunes objects so the cluster matches the given
    /// declared set. Returns the group-kinds that were applied.
    async fn apply(&self, objects: Vec<DynamicObject>) -> (BTreeSet<GroupKind>, Errors);

    /// Deletes all managed objects. Only invoked by the finalizer, after
    /// every watcher has stopped.
    async fn destroy(&self) -> Errors;
}

/// Watches managed resources and reverts drift on declared fields.
/// Implemented by the external remediator.
#[async_trait]
pub trait Remediator: Send + Sync {
    /// Whether the watched set diverged from the declared set and a watch
    /// refresh is needed.
    fn needs_update(&self) -> bool;

    /// Brings the watches in line with the given declared group-kinds.
    async fn update_watches(&self, group_kinds: BTreeSet<GroupKind>) -> Errors;

    /// Whether the remediator is running and its watches are established.
    fn remediating(&self) -> bool;

    /// Resolves once in-flight remediation work has drained after the
    /// shutdown signal fired.
    async fn drain(&self);
}

/// The error channel between the concurrently running remediator/applier and
/// the control loop.
///
/// Conflicts and fights are recorded by the remediator workers, apply and
/// watch errors by the update step. The control loop aggregates all of them
/// into the sync status.
#[derive(Debug, Default)]
pub struct SyncErrorCache {
    conflicts: Mutex<Vec<ManagementConflict>>,
    fights: Mutex<BTreeMap<String, f64>>,
    apply_errors: Mutex<Vec<ErrorEntry>>,
    watch_errors: Mutex<Vec<ErrorEntry>>,
}

impl SyncErrorCache {
    /// Records a management conflict, deduplicated by resource and manager.
    pub fn record_conflict(&self, conflict: ManagementConflict) {
        let mut conflicts = lock(&self.conflicts);
        if !conflicts.contains(&conflict) {
            tracing::warn!(
                resource = %conflict.resource,
                manager = %conflict.current_manager,
                "management conflict detected"
            );
            conflicts.push(conflict);
        }
    }

    /// Drops a previously recorded conflict, e.g. after the opposing manager
    /// stopped fighting.
    pub fn resolve_conflict(&self, conflict: &ManagementConflict) {
        lock(&self.conflicts).retain(|c| c != conflict);
    }

    pub fn has_conflicts(&self) -> bool {
        !lock(&self.conflicts).is_empty()
    }

    pub fn conflicts(&self) -> Vec<ManagementConflict> {
        lock(&self.conflicts).clone()
    }

    /// Records that a resource is updated at a high frequency, i.e. likely
    /// fought over.
    pub fn record_fight(&self, resource: String, updates_per_minute: f64) {
        lock(&self.fights).insert(resource, updates_per_minute);
    }

    pub fn clear_fights(&self) {
        lock(&self.fights).clear();
    }

    pub fn set_apply_errors(&self, errors: &Errors) {
        *lock(&self.apply_errors) = errors.entries();
    }

    pub fn set_watch_errors(&self, errors: &Errors) {
        *lock(&self.watch_errors) = errors.entries();
    }

    /// All sync errors in a stable order: conflicts, fights, apply errors,
    /// watch errors.
    pub fn entries(&self) -> Vec<ErrorEntry> {
        let mut entries: Vec<ErrorEntry> = lock(&self.conflicts)
            .iter()
            .map(ManagementConflict::to_entry)
            .collect();
        entries.extend(lock(&self.fights).iter().map(|(resource, rate)| {
            SyncError::Fight {
                resource: resource.clone(),
                updates_per_minute: *rate,
            }
            .to_entry()
        }));
        entries.extend(lock(&self.apply_errors).iter().cloned());
        entries.extend(lock(&self.watch_errors).iter().cloned());
        entries
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs the update steps for the cached commit, skipping steps that already
/// completed. The progress flags live in the cache so a retry after a
/// partial failure resumes where it left off.
pub struct Updater {
    pub resources: Arc<Resources>,
    pub applier: Arc<dyn Applier>,
    pub remediator: Arc<dyn Remediator>,
    pub errors: Arc<SyncErrorCache>,
}

impl Updater {
    pub async fn update(&self, state: &SharedState) -> Errors {
        let mut errors = Errors::new();

        // Publish the declared resources so the remediator reverts drift
        // against the new commit, not the previous one.
        let objects = {
            let mut state = state.lock().await;
            if !state.cache.declared_resources_updated {
                self.resources.update(&state.cache.objects);
                state.cache.declared_resources_updated = true;
            }
            state.cache.objects.clone()
        };

        let applied = { state.lock().await.cache.applied };
        let group_kinds = if applied {
            self.resources.declared_group_kinds()
        } else {
            tracing::debug!(objects = objects.len(), "applying declared objects");
            let (group_kinds, apply_errors) = self.applier.apply(objects).await;
            self.errors.set_apply_errors(&apply_errors);
            if !apply_errors.has_blocking() {
                state.lock().await.cache.applied = true;
            }
            errors.extend(apply_errors);
            group_kinds
        };

        let watches_updated = { state.lock().await.cache.watches_updated };
        if !watches_updated || self.remediator.needs_update() {
            let watch_errors = self.remediator.update_watches(group_kinds).await;
            self.errors.set_watch_errors(&watch_errors);
            if watch_errors.is_empty() {
                state.lock().await.cache.watches_updated = true;
            }
            errors.extend(watch_errors);
        }

        errors
    }
}
