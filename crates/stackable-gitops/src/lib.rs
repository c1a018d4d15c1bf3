//! A GitOps reconciliation engine: continuously pulls a declarative
//! configuration tree from a source of truth (git repository, OCI artifact
//! or Helm chart), applies it to the cluster, and defends the applied state
//! against drift.
//!
//! The two central pieces are the declared-field ownership model (a
//! path-set algebra over nested configuration documents, see
//! [`declared::fieldset`]) and the parse-apply-watch control loop (see
//! [`reconciler`]). The manifest parser, the applier/pruner and the
//! drift-remediating watcher are external collaborators behind traits.

pub mod crd;
pub mod declared;
pub mod error;
pub mod metadata;
pub mod reconciler;
pub mod utils;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;
