//! Reporting management conflicts to the opposing manager's pipeline.
//!
//! Root-scoped appliers adopt every object they declare, so two root
//! pipelines declaring the same object fight each other if the admission
//! guard is disabled. Reporting the conflict on the other pipeline's status
//! makes the fight visible on both sides. Namespace-scoped appliers only
//! adopt unmanaged objects and will not fight, so nothing is reported for
//! them.

use std::collections::BTreeMap;

use crate::{
    declared::Scope,
    error::{ManagementConflict, SyncError},
    reconciler::status_client::StatusWriter,
};

pub(crate) async fn report_conflicts(
    status_writer: &dyn StatusWriter,
    conflicts: Vec<ManagementConflict>,
) -> Result<(), SyncError> {
    if conflicts.is_empty() {
        return Ok(());
    }

    let mut by_manager: BTreeMap<String, Vec<ManagementConflict>> = BTreeMap::new();
    for conflict in conflicts {
        by_manager
            .entry(conflict.current_manager.clone())
            .or_default()
            .push(conflict);
    }

    for (manager, conflicts) in by_manager {
        match Scope::parse_manager(&manager) {
            Some((Scope::Root, sync_name)) => {
                tracing::info!(%manager, "detected conflict with a root pipeline manager");
                status_writer
                    .prepend_remediator_conflicts(&sync_name, &conflicts)
                    .await?;
            }
            Some((Scope::Namespace(_), _)) => {
                tracing::info!(%manager, "detected conflict with a namespace pipeline manager");
            }
            None => {
                tracing::warn!(%manager, "cannot report conflict, unparsable manager");
            }
        }
    }
    Ok(())
}
