//! The interface to the source of truth.
//!
//! Fetching, rendering and parsing are performed by external components (the
//! git/OCI/Helm sync side-cars and the manifest parser). The control loop
//! only consumes their results through [`SourceReader`].

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use backoff::{ExponentialBackoff, backoff::Backoff};
use kube::core::DynamicObject;

use crate::{
    crd::{SourceSpec, SourceType},
    error::{Errors, SyncError},
};

/// Static configuration of the source of truth a reconciler syncs from.
#[derive(Clone, Debug)]
pub struct FileSource {
    pub source_type: SourceType,
    /// The git repository, OCI image or Helm repository being synced.
    pub source_repo: String,
    /// The git branch being synced. Empty for OCI and Helm sources.
    pub source_branch: String,
    /// The git revision or Helm chart version being synced.
    pub source_rev: String,
    /// The directory (or chart name, for Helm) within the source containing
    /// the configuration to sync.
    pub sync_dir: PathBuf,
}

impl FileSource {
    /// Builds the resolved [`SourceSpec`] for a fetched commit.
    pub fn to_source_spec(&self, commit: &str) -> SourceSpec {
        let dir = self.sync_dir.to_string_lossy().into_owned();
        match self.source_type {
            SourceType::Git => SourceSpec::Git {
                repo: self.source_repo.clone(),
                revision: self.source_rev.clone(),
                branch: self.source_branch.clone(),
                dir,
            },
            SourceType::Oci => SourceSpec::Oci {
                image: self.source_repo.clone(),
                dir,
            },
            SourceType::Helm => SourceSpec::Helm {
                repo: self.source_repo.clone(),
                chart: dir,
                version: chart_version_from_commit(&self.source_rev, commit),
            },
        }
    }
}

/// The configured revision of a Helm source may be a version range, in which
/// case the version that was actually pulled is only known from the resolved
/// commit, which has the form `chart:version`.
fn chart_version_from_commit(source_rev: &str, commit: &str) -> String {
    let parts: Vec<&str> = commit.split(':').collect();
    if parts.len() == 2 {
        parts[1].to_owned()
    } else {
        source_rev.to_owned()
    }
}

/// The source of truth as resolved for one commit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SourceState {
    pub spec: Option<SourceSpec>,
    pub commit: String,
    /// The directory the configuration is read from. Points into the
    /// rendered output if rendering is enabled.
    pub sync_dir: PathBuf,
    /// The configuration files below `sync_dir`.
    pub files: Vec<PathBuf>,
}

/// The currently checked-out commit, as reported by the sync side-car.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchedSource {
    pub commit: String,
    pub sync_dir: PathBuf,
}

/// How far the out-of-band rendering pipeline got for a commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RenderingProgress {
    /// The source contains only wet configs, nothing to render.
    Skipped,
    /// The rendered output for the commit is not ready yet.
    InProgress,
    /// The rendered output is ready under the given directory.
    Succeeded { sync_dir: PathBuf },
    /// Rendering failed, the commit cannot be synced.
    Failed { message: String },
    /// The source contains dry configs but the rendering container is not
    /// running. The reconciler needs to be recreated with rendering enabled.
    Required,
    /// The rendering container is running but the source contains only wet
    /// configs. The reconciler needs to be recreated with rendering disabled.
    NotRequired,
}

/// Read access to the source of truth.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Resolves the currently checked-out commit and sync directory.
    async fn fetch_source(&self) -> Result<FetchedSource, SyncError>;

    /// Reports the rendering progress for the given commit.
    async fn rendering_progress(&self, commit: &str) -> RenderingProgress;

    /// Lists the configuration files under the source's sync directory.
    async fn read_files(&self, source: &SourceState) -> Result<Vec<PathBuf>, SyncError>;

    /// Parses the source's files into declarative objects.
    async fn parse(&self, source: &SourceState) -> (Vec<DynamicObject>, Errors);
}

/// The backoff for resolving the source commit: retried within five minutes.
pub fn source_retry_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(5 * 60)),
        ..ExponentialBackoff::default()
    }
}

/// Fetches the source commit and directory, retrying fetch errors until the
/// backoff gives up.
pub(crate) async fn fetch_source_with_retry(
    reader: &dyn SourceReader,
    mut backoff: ExponentialBackoff,
) -> Result<FetchedSource, SyncError> {
    loop {
        match reader.fetch_source().await {
            Ok(fetched) => return Ok(fetched),
            Err(error) => match backoff.next_backoff() {
                Some(delay) => {
                    tracing::warn!(%error, delay = ?delay, "failed to fetch source, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            },
        }
    }
}
