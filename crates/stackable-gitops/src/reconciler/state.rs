//! Process-local state of the parse-apply-watch loop.
//!
//! The state is owned by the control loop and its status ticker under one
//! lock; nothing else mutates it. Structural events (a new commit) reset the
//! cache fully, forced resyncs reset it partially so the cached source files
//! and the retry bookkeeping survive.

use std::sync::Arc;

use kube::core::DynamicObject;
use tokio::sync::Mutex;

use crate::{
    error::Errors,
    reconciler::{source::SourceState, status::ReconcilerStatus},
};

/// The reconciler state, shared between the control loop and the periodic
/// status ticker.
pub type SharedState = Arc<Mutex<ReconcilerState>>;

/// Everything the control loop remembers between runs.
#[derive(Debug, Default)]
pub struct ReconcilerState {
    /// The cached view of the RSync status, primed from the live object on
    /// the first run.
    pub status: Option<ReconcilerStatus>,

    /// The work cache for the current commit.
    pub cache: Cache,
}

impl ReconcilerState {
    /// Records that everything in the run succeeded, including the final
    /// status write. Until then the cache must not advance the last known
    /// good watermark.
    pub fn checkpoint(&mut self) {
        tracing::debug!("checkpointing the reconciler state");
        self.cache.need_to_retry = false;
    }

    /// Records a failed run so the retry publisher picks it up.
    pub fn invalidate(&mut self, errors: &Errors) {
        tracing::error!(%errors, "sync attempt failed, it will be retried");
        self.cache.need_to_retry = true;
    }

    /// Drops the whole cache. Used when a new commit is detected.
    pub fn reset_cache(&mut self) {
        self.cache = Cache::default();
    }

    /// Drops the cache except for the read source files and the retry flag,
    /// so a forced resync re-runs every step without re-reading the source
    /// or resetting the retry backoff.
    pub fn reset_partial_cache(&mut self) {
        let source = self.cache.source.take();
        let need_to_retry = self.cache.need_to_retry;
        self.cache = Cache {
            source,
            need_to_retry,
            ..Default::default()
        };
    }
}

/// The cached intermediate results for one commit.
#[derive(Debug, Default)]
pub struct Cache {
    /// The last successfully read source state.
    pub source: Option<SourceState>,

    /// Whether `objects` and `parser_errors` reflect `source`.
    has_parser_result: bool,

    /// The parsed and hydrated objects.
    pub objects: Vec<DynamicObject>,

    /// The errors of the last parse pass.
    pub parser_errors: Errors,

    /// Whether the declared-resources snapshot was updated for this commit.
    pub declared_resources_updated: bool,

    /// Whether the apply step completed for this commit.
    pub applied: bool,

    /// Whether the remediator watches were refreshed for this commit.
    pub watches_updated: bool,

    /// Whether the last run failed and should be retried.
    pub need_to_retry: bool,
}

impl Cache {
    /// Whether the parse step can be skipped entirely.
    ///
    /// A cached result with errors is never up to date: the errors must be
    /// re-checked on every pass until a parse succeeds.
    pub fn parser_result_up_to_date(&self) -> bool {
        self.has_parser_result && self.parser_errors.is_empty()
    }

    pub fn set_parser_result(&mut self, objects: Vec<DynamicObject>, errors: Errors) {
        self.objects = objects;
        self.parser_errors = errors;
        self.has_parser_result = true;
    }
}
