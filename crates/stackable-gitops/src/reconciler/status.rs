//! The in-memory status cache of one reconciler.
//!
//! The three stages (source, rendering, sync) are updated independently but
//! must never regress relative to each other: reporting a sync status for a
//! commit older than the currently reported source commit is forbidden. The
//! `need_to_set_*` functions decide before every write whether it is
//! necessary at all, which suppresses no-op API calls.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::{crd::SourceSpec, error::ErrorEntry};

/// The status of the source stage: which commit was fetched and parsed, and
/// with which errors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceStatus {
    /// The source specification this status corresponds to. Stored so a
    /// status for an outdated source configuration can be told apart from a
    /// current one.
    pub spec: Option<SourceSpec>,
    pub commit: String,
    pub errors: Vec<ErrorEntry>,
    pub last_update: Option<Time>,
}

impl SourceStatus {
    /// Equality excluding the update timestamp.
    pub fn equals(&self, other: &Self) -> bool {
        self.commit == other.commit && self.errors == other.errors && self.spec == other.spec
    }
}

/// The status of the rendering stage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderingStatus {
    pub spec: Option<SourceSpec>,
    pub commit: String,
    pub message: String,
    pub errors: Vec<ErrorEntry>,
    pub last_update: Option<Time>,
    /// Whether the source contains dry configs. Only used internally, not
    /// surfaced on the RSync status.
    pub requires_rendering: bool,
}

impl RenderingStatus {
    /// Equality excluding the update timestamp.
    pub fn equals(&self, other: &Self) -> bool {
        self.commit == other.commit
            && self.message == other.message
            && self.errors == other.errors
            && self.spec == other.spec
    }
}

/// The status of the sync (apply) stage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncStatus {
    pub spec: Option<SourceSpec>,
    pub syncing: bool,
    pub commit: String,
    pub errors: Vec<ErrorEntry>,
    pub last_update: Option<Time>,
}

impl SyncStatus {
    /// Equality excluding the update timestamp.
    pub fn equals(&self, other: &Self) -> bool {
        self.syncing == other.syncing
            && self.commit == other.commit
            && self.errors == other.errors
            && self.spec == other.spec
    }
}

/// The cached view of the RSync object's status.
#[derive(Clone, Debug, Default)]
pub struct ReconcilerStatus {
    pub source: Option<SourceStatus>,
    pub rendering: Option<RenderingStatus>,
    pub sync: Option<SyncStatus>,
    /// When the Syncing condition was updated most recently.
    pub syncing_condition_last_update: Option<Time>,
}

impl ReconcilerStatus {
    /// Whether the source status write should be performed.
    pub fn need_to_set_source_status(&self, new_status: &SourceStatus) -> bool {
        let Some(current) = &self.source else {
            return true;
        };
        // Update if not initialized
        let Some(current_update) = &current.last_update else {
            return true;
        };
        // Update if the source status was last written before the rendering
        // status, it would otherwise be reported as stale
        if let Some(rendering_update) = self.rendering.as_ref().and_then(|r| r.last_update.as_ref())
        {
            if current_update.0 < rendering_update.0 {
                return true;
            }
        }
        // Update if there is a diff
        !current.equals(new_status)
    }

    /// Whether the sync status write should be performed.
    pub fn need_to_set_sync_status(&self, new_status: &SyncStatus) -> bool {
        let Some(current) = &self.sync else {
            return true;
        };
        // Update if not initialized
        let Some(current_update) = &current.last_update else {
            return true;
        };
        // Update if the sync status was last written before the rendering
        // or source status
        if let Some(rendering_update) = self.rendering.as_ref().and_then(|r| r.last_update.as_ref())
        {
            if current_update.0 < rendering_update.0 {
                return true;
            }
        }
        if let Some(source_update) = self.source.as_ref().and_then(|s| s.last_update.as_ref()) {
            if current_update.0 < source_update.0 {
                return true;
            }
        }
        // Update if there is a diff
        !current.equals(new_status)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::chrono::{TimeZone, Utc};

    use super::*;

    fn time(minute: u32) -> Time {
        Time(Utc.with_ymd_and_hms(2025, 5, 1, 10, minute, 0).unwrap())
    }

    fn source_status(commit: &str, minute: u32) -> SourceStatus {
        SourceStatus {
            spec: None,
            commit: commit.to_owned(),
            errors: vec![],
            last_update: Some(time(minute)),
        }
    }

    #[test]
    fn first_write_is_always_needed() {
        let status = ReconcilerStatus::default();
        assert!(status.need_to_set_source_status(&source_status("abc", 0)));
        assert!(status.need_to_set_sync_status(&SyncStatus::default()));
    }

    #[test]
    fn unchanged_source_status_is_skipped() {
        let status = ReconcilerStatus {
            source: Some(source_status("abc", 1)),
            ..Default::default()
        };
        assert!(!status.need_to_set_source_status(&source_status("abc", 2)));
        assert!(status.need_to_set_source_status(&source_status("def", 2)));
    }

    #[test]
    fn source_status_goes_stale_when_rendering_overtakes_it() {
        let status = ReconcilerStatus {
            source: Some(source_status("abc", 1)),
            rendering: Some(RenderingStatus {
                commit: "abc".to_owned(),
                last_update: Some(time(3)),
                ..Default::default()
            }),
            ..Default::default()
        };
        // Same value, but the rendering stage has observed a newer write.
        assert!(status.need_to_set_source_status(&source_status("abc", 4)));
    }

    #[test]
    fn sync_status_goes_stale_when_source_overtakes_it() {
        let sync = SyncStatus {
            commit: "abc".to_owned(),
            last_update: Some(time(1)),
            ..Default::default()
        };
        let status = ReconcilerStatus {
            source: Some(source_status("abc", 5)),
            sync: Some(sync.clone()),
            ..Default::default()
        };
        let unchanged = SyncStatus {
            last_update: Some(time(6)),
            ..sync
        };
        assert!(status.need_to_set_sync_status(&unchanged));
    }

    #[test]
    fn error_changes_force_an_update() {
        let mut current = source_status("abc", 1);
        current.errors = vec![];
        let status = ReconcilerStatus {
            source: Some(current),
            ..Default::default()
        };

        let mut with_errors = source_status("abc", 2);
        with_errors.errors = vec![crate::error::ErrorEntry {
            code: crate::error::ErrorCode::Fetch,
            message: "remote hung up".to_owned(),
        }];
        assert!(status.need_to_set_source_status(&with_errors));
    }
}
