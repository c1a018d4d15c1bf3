//! The classified error model shared by every stage of the sync pipeline.
//!
//! Errors that surface on the RSync status subresource are reduced to
//! [`ErrorEntry`] values (code + message), which are plain data and therefore
//! comparable. The richer [`SyncError`] carries the underlying causes while a
//! run is still in flight.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Stable error codes surfaced in `status.<stage>.errors[].code`.
///
/// These values are part of the observable contract and must not change.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ErrorCode {
    /// The source of truth could not be fetched or was corrupt.
    Fetch,
    /// A manifest in the source of truth failed to parse or validate.
    Validation,
    /// The out-of-band rendering pipeline failed or is misconfigured.
    Rendering,
    /// An operation on a managed object failed and will be retried.
    ObjectOperation,
    /// A managed object exists but has not reached its desired state yet.
    ObjectPending,
    /// The pipeline status itself could not be persisted.
    StatusUpdate,
    /// The cluster API server returned an error.
    ApiServer,
    /// Another manager asserted ownership over a managed resource.
    ManagementConflict,
    /// A managed resource is being updated and reverted at a high frequency.
    Fight,
    Internal,
}

/// One classified error as persisted on the RSync status.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub code: ErrorCode,
    pub message: String,
}

/// Any error produced while syncing the source of truth to the cluster.
///
/// The variant decides the retry policy: [`SyncError::ObjectPending`] is not
/// an error for retry purposes (the next watch event resolves it), parse
/// errors wait for a new commit, everything else is retried with backoff.
///
/// Underlying causes are captured as rendered messages: error values are
/// cached across runs and compared by value, both of which API client errors
/// do not support.
#[derive(Clone, Debug, Snafu)]
pub enum SyncError {
    #[snafu(display("failed to fetch source: {message}"))]
    Fetch { message: String },

    #[snafu(display("failed to parse {object}: {message}"))]
    ObjectParse { object: String, message: String },

    #[snafu(display("rendering failed: {message}"))]
    Rendering { message: String },

    #[snafu(display("failed to {operation} {object}: {message}"))]
    ObjectOperation {
        object: String,
        operation: String,
        message: String,
    },

    #[snafu(display("{object} has not yet reached its desired state"))]
    ObjectPending { object: String },

    #[snafu(display("failed to update {stage} status: {message}"))]
    StatusUpdate {
        stage: &'static str,
        message: String,
    },

    #[snafu(display("{context}: {message}"))]
    ApiServer { context: String, message: String },

    #[snafu(display(
        "resource {resource} is managed by {current_manager} as well, declared fields may be overwritten"
    ))]
    ManagementConflict {
        resource: String,
        current_manager: String,
    },

    #[snafu(display(
        "resource {resource} is updated {updates_per_minute:.1} times per minute, it is likely fought over by another controller"
    ))]
    Fight {
        resource: String,
        updates_per_minute: f64,
    },

    #[snafu(display("{message}"))]
    Internal { message: String },
}

impl SyncError {
    /// Wraps an API server error with stage context.
    pub fn api_server(context: impl Into<String>, source: &kube::Error) -> Self {
        Self::ApiServer {
            context: context.into(),
            message: source.to_string(),
        }
    }

    /// Wraps a failed status write for the given stage.
    pub fn status_update(stage: &'static str, source: &kube::Error) -> Self {
        Self::StatusUpdate {
            stage,
            message: source.to_string(),
        }
    }

    /// Wraps a failed operation on a managed object.
    pub fn object_operation(
        object: impl Into<String>,
        operation: impl Into<String>,
        source: &kube::Error,
    ) -> Self {
        Self::ObjectOperation {
            object: object.into(),
            operation: operation.into(),
            message: source.to_string(),
        }
    }

    /// Whether an API error reports a missing object. Used by idempotent
    /// delete paths, where absence already is the desired state.
    pub fn is_not_found(source: &kube::Error) -> bool {
        matches!(source, kube::Error::Api(response) if response.code == 404)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Fetch { .. } => ErrorCode::Fetch,
            Self::ObjectParse { .. } => ErrorCode::Validation,
            Self::Rendering { .. } => ErrorCode::Rendering,
            Self::ObjectOperation { .. } => ErrorCode::ObjectOperation,
            Self::ObjectPending { .. } => ErrorCode::ObjectPending,
            Self::StatusUpdate { .. } => ErrorCode::StatusUpdate,
            Self::ApiServer { .. } => ErrorCode::ApiServer,
            Self::ManagementConflict { .. } => ErrorCode::ManagementConflict,
            Self::Fight { .. } => ErrorCode::Fight,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Whether this error must block the apply step.
    ///
    /// Objects that are merely waiting for their controllers to converge do
    /// not block, the next watch event will re-evaluate them.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::ObjectPending { .. })
    }

    pub fn to_entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// An ordered collection of [`SyncError`]s accumulated over one stage.
///
/// Mirrors the append-as-you-go error plumbing of the pipeline stages: one
/// malformed object must not abort work on the remaining objects.
#[derive(Clone, Debug, Default)]
pub struct Errors(Vec<SyncError>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: SyncError) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncError> {
        self.0.iter()
    }

    /// Whether any contained error blocks the apply step.
    pub fn has_blocking(&self) -> bool {
        self.0.iter().any(SyncError::is_blocking)
    }

    pub fn entries(&self) -> Vec<ErrorEntry> {
        self.0.iter().map(SyncError::to_entry).collect()
    }
}

impl From<SyncError> for Errors {
    fn from(error: SyncError) -> Self {
        Self(vec![error])
    }
}

impl IntoIterator for Errors {
    type Item = SyncError;
    type IntoIter = std::vec::IntoIter<SyncError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{error}")?;
            first = false;
        }
        Ok(())
    }
}

/// A management conflict as recorded by the remediator.
///
/// Kept as plain data so conflicts can be deduplicated and reported to the
/// opposing manager's own pipeline object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManagementConflict {
    /// The contested resource, e.g. `Deployment.apps/prod/my-app`.
    pub resource: String,
    /// The opposing manager, encoded as scope + sync name.
    pub current_manager: String,
}

impl ManagementConflict {
    pub fn to_error(&self) -> SyncError {
        SyncError::ManagementConflict {
            resource: self.resource.clone(),
            current_manager: self.current_manager.clone(),
        }
    }

    pub fn to_entry(&self) -> ErrorEntry {
        self.to_error().to_entry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_pending_does_not_block() {
        let mut errors = Errors::new();
        errors.push(SyncError::ObjectPending {
            object: "Deployment.apps/prod/my-app".to_owned(),
        });
        assert!(!errors.has_blocking());

        errors.push(SyncError::Fetch {
            message: "remote hung up".to_owned(),
        });
        assert!(errors.has_blocking());
    }

    #[test]
    fn entry_carries_stable_code() {
        let error = SyncError::ManagementConflict {
            resource: "Role.rbac.authorization.k8s.io/world/hello".to_owned(),
            current_manager: ":root/other-sync".to_owned(),
        };
        let entry = error.to_entry();
        assert_eq!(entry.code, ErrorCode::ManagementConflict);
        assert_eq!(entry.code.to_string(), "managementConflict");
    }
}
