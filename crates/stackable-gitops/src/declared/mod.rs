//! The declared state of the cluster: which objects the pipeline manages,
//! which of their fields are asserted by the source of truth, and which sync
//! pipeline claims them.

use std::fmt;

pub mod fieldset;
pub mod hydrate;
pub mod resources;

pub use fieldset::PathSet;
pub use resources::{GroupKind, Resources};

/// The namespace in which root-scoped pipeline objects live.
pub const SYSTEM_NAMESPACE: &str = "gitops-system";

/// The scope string of root-scoped pipelines. Contains a character that is
/// invalid in namespace names, so it can never collide with one.
const ROOT_SCOPE: &str = ":root";

/// The set of resources a sync pipeline is allowed to manage.
///
/// At most one pipeline may hold a given scope + name combination on a
/// cluster; more than one results in undefined behavior.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Scope {
    /// The pipeline manages cluster-scoped resources and resources in any
    /// namespace.
    Root,
    /// The pipeline only manages resources in the given namespace.
    Namespace(String),
}

impl Scope {
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    /// The namespace in which this pipeline's RSync object lives.
    pub fn sync_namespace(&self) -> &str {
        match self {
            Self::Root => SYSTEM_NAMESPACE,
            Self::Namespace(namespace) => namespace,
        }
    }

    /// Encodes this scope together with a sync name into the manager string
    /// persisted in the manager annotation, e.g. `:root/my-sync` or
    /// `tenant-a/my-sync`.
    pub fn manager(&self, sync_name: &str) -> String {
        format!("{self}/{sync_name}")
    }

    /// Splits a manager string back into its scope and sync name.
    ///
    /// Returns `None` for strings that were not produced by
    /// [`Scope::manager`].
    pub fn parse_manager(manager: &str) -> Option<(Self, String)> {
        let (scope, name) = manager.split_once('/')?;
        if name.is_empty() || scope.is_empty() {
            return None;
        }
        let scope = if scope == ROOT_SCOPE {
            Self::Root
        } else {
            Self::Namespace(scope.to_owned())
        };
        Some((scope, name.to_owned()))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str(ROOT_SCOPE),
            Self::Namespace(namespace) => f.write_str(namespace),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::root(Scope::Root, "my-sync", ":root/my-sync")]
    #[case::namespaced(Scope::Namespace("tenant-a".to_owned()), "backend", "tenant-a/backend")]
    fn manager_round_trip(#[case] scope: Scope, #[case] name: &str, #[case] encoded: &str) {
        assert_eq!(scope.manager(name), encoded);
        assert_eq!(
            Scope::parse_manager(encoded),
            Some((scope, name.to_owned()))
        );
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_separator("my-sync")]
    #[case::empty_name("tenant-a/")]
    fn invalid_managers_are_rejected(#[case] manager: &str) {
        assert_eq!(Scope::parse_manager(manager), None);
    }
}
