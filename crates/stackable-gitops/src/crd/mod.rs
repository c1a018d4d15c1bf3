//! The RSync custom resource: one sync pipeline's desired source of truth
//! and its observed status.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ErrorEntry;

/// The kind of source of truth a pipeline syncs from.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SourceType {
    #[default]
    Git,
    Oci,
    Helm,
}

/// A sync pipeline. Root-scoped pipelines live in the
/// [`SYSTEM_NAMESPACE`](crate::declared::SYSTEM_NAMESPACE) and may manage the
/// entire cluster, namespace-scoped pipelines manage their own namespace.
#[derive(CustomResource, Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "gitops.stackable.tech",
    version = "v1alpha1",
    kind = "SyncPipeline",
    namespaced,
    status = "SyncPipelineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SyncPipelineSpec {
    /// Which kind of source of truth to sync from. Exactly one of the
    /// matching source blocks below must be filled in.
    pub source_type: SourceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSource>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    /// The repository URL to clone.
    pub repo: String,

    /// The git revision (tag, ref or commit) to check out; defaults to
    /// `HEAD`.
    #[serde(default = "GitSource::default_revision")]
    pub revision: String,

    /// The branch to sync from; defaults to `main`.
    #[serde(default = "GitSource::default_branch")]
    pub branch: String,

    /// The directory within the repository containing the configuration to
    /// sync; defaults to the repository root.
    #[serde(default)]
    pub dir: String,
}

impl GitSource {
    fn default_revision() -> String {
        "HEAD".to_owned()
    }

    fn default_branch() -> String {
        "main".to_owned()
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSource {
    /// The OCI image reference to pull the configuration from.
    pub image: String,

    /// The directory within the image containing the configuration to sync.
    #[serde(default)]
    pub dir: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmSource {
    /// The Helm repository URL.
    pub repo: String,

    /// The chart name.
    pub chart: String,

    /// The chart version or version range to sync.
    #[serde(default)]
    pub version: String,
}

/// The resolved source specification a stage status corresponds to.
///
/// The spec is stored alongside each stage status so a reader can tell
/// whether the status still reflects the currently configured source. It is
/// comparable by value; inequality means an update is necessary.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "sourceType")]
pub enum SourceSpec {
    #[serde(rename_all = "camelCase")]
    Git {
        repo: String,
        revision: String,
        branch: String,
        dir: String,
    },
    #[serde(rename_all = "camelCase")]
    Oci {
        image: String,
        dir: String,
    },
    #[serde(rename_all = "camelCase")]
    Helm {
        repo: String,
        chart: String,
        version: String,
    },
}

/// The observed status of a sync pipeline, one sub-status per stage.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPipelineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StageStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendering: Option<RenderingStageStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<StageStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SyncCondition>,

    /// The most recent commit that was fully synced without errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_commit: Option<String>,
}

/// The status of the source or sync stage of the pipeline.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<SourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,

    #[serde(default)]
    pub error_summary: ErrorSummary,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Time>,
}

/// The status of the rendering stage of the pipeline.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderingStageStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<SourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,

    #[serde(default)]
    pub error_summary: ErrorSummary,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Time>,
}

/// Summarizes the (possibly truncated) error list of a stage status.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    /// How many errors the stage produced in total.
    pub total_count: usize,

    /// Whether the persisted error list was truncated to keep the object
    /// below the API server's size limit.
    pub truncated: bool,

    /// How many errors remain in the persisted list after truncation.
    pub error_count_after_truncation: usize,
}

/// Truncates an error list so the containing object stays below the API
/// server's size limit.
///
/// The denominator starts at 1 (no truncation) and is doubled on every
/// rejected status write, so the retained fraction shrinks as 1, 1/2, 1/4,
/// until the write fits.
pub fn truncate_errors(errors: &[ErrorEntry], denominator: usize) -> (Vec<ErrorEntry>, ErrorSummary) {
    let kept = errors.len() / denominator;
    let summary = ErrorSummary {
        total_count: errors.len(),
        truncated: denominator != 1,
        error_count_after_truncation: kept,
    };
    (errors[..kept].to_vec(), summary)
}

/// Which stage status an error belongs to, referenced from the Syncing
/// condition.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorSource {
    Source,
    Rendering,
    Sync,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum SyncConditionType {
    /// The pipeline is busy fetching, parsing or applying a commit.
    Syncing,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCondition {
    #[serde(rename = "type")]
    pub type_: SyncConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_source_refs: Vec<ErrorSource>,

    #[serde(default)]
    pub error_summary: ErrorSummary,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// Updates (or inserts) the Syncing condition on the given status.
///
/// The transition timestamp only moves when the condition value actually
/// flips, the update timestamp moves on every call.
#[allow(clippy::too_many_arguments)]
pub fn set_syncing(
    status: &mut SyncPipelineStatus,
    syncing: bool,
    reason: &str,
    message: &str,
    commit: Option<String>,
    error_source_refs: Vec<ErrorSource>,
    error_summary: ErrorSummary,
    timestamp: Time,
) {
    let condition_status = if syncing {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };

    let existing = status
        .conditions
        .iter_mut()
        .find(|condition| condition.type_ == SyncConditionType::Syncing);
    match existing {
        Some(condition) => {
            if condition.status != condition_status {
                condition.status = condition_status;
                condition.last_transition_time = Some(timestamp.clone());
            }
            condition.reason = Some(reason.to_owned());
            condition.message = Some(message.to_owned());
            condition.commit = commit;
            condition.error_source_refs = error_source_refs;
            condition.error_summary = error_summary;
            condition.last_update_time = Some(timestamp);
        }
        None => status.conditions.push(SyncCondition {
            type_: SyncConditionType::Syncing,
            status: condition_status,
            reason: Some(reason.to_owned()),
            message: Some(message.to_owned()),
            commit,
            error_source_refs,
            error_summary,
            last_update_time: Some(timestamp.clone()),
            last_transition_time: Some(timestamp),
        }),
    }
}

/// Collects the error sources and the combined summary of all stage statuses
/// that refer to the given commit.
///
/// Used when closing out a sync so the Syncing condition only ever reports
/// errors belonging to the commit it names.
pub fn summarize_errors_for_commit(
    status: &SyncPipelineStatus,
    commit: Option<&str>,
) -> (Vec<ErrorSource>, ErrorSummary) {
    let mut sources = Vec::new();
    let mut summary = ErrorSummary::default();

    let mut add = |source: ErrorSource, stage_commit: Option<&str>, stage_summary: &ErrorSummary| {
        if stage_commit == commit && stage_summary.total_count > 0 {
            sources.push(source);
            summary.total_count += stage_summary.total_count;
            summary.truncated |= stage_summary.truncated;
            summary.error_count_after_truncation += stage_summary.error_count_after_truncation;
        }
    };

    if let Some(source) = &status.source {
        add(
            ErrorSource::Source,
            source.commit.as_deref(),
            &source.error_summary,
        );
    }
    if let Some(rendering) = &status.rendering {
        add(
            ErrorSource::Rendering,
            rendering.commit.as_deref(),
            &rendering.error_summary,
        );
    }
    if let Some(sync) = &status.sync {
        add(ErrorSource::Sync, sync.commit.as_deref(), &sync.error_summary);
    }

    (sources, summary)
}

/// Compares two statuses for semantic equality, ignoring every purely
/// temporal field. Used to skip no-op status writes.
pub fn status_equal_ignoring_timestamps(a: &SyncPipelineStatus, b: &SyncPipelineStatus) -> bool {
    strip_timestamps(a.clone()) == strip_timestamps(b.clone())
}

fn strip_timestamps(mut status: SyncPipelineStatus) -> SyncPipelineStatus {
    if let Some(source) = status.source.as_mut() {
        source.last_update = None;
    }
    if let Some(rendering) = status.rendering.as_mut() {
        rendering.last_update = None;
    }
    if let Some(sync) = status.sync.as_mut() {
        sync.last_update = None;
    }
    for condition in &mut status.conditions {
        condition.last_update_time = None;
        condition.last_transition_time = None;
    }
    status
}
