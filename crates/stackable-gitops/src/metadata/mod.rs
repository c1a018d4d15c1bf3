//! Reserved annotation and label keys stamped on every managed object.
//!
//! The admission guard consults these to detect mutations that target the
//! pipeline's own bookkeeping metadata, so the key set here is closed: a key
//! is either reserved or it is not.

use const_format::concatcp;
use kube::core::DynamicObject;

/// The well-known Kubernetes app key prefix.
const K8S_APP_KEY_PREFIX: &str = "app.kubernetes.io/";

/// The GitOps-specific key prefix. Every annotation under this prefix is
/// owned by the sync pipeline and protected from outside edits.
pub const GITOPS_KEY_PREFIX: &str = "gitops.stackable.tech/";

/// The annotation holding the serialized set of declared field paths.
///
/// The value is the compact annotation serialization of a
/// [`PathSet`](crate::declared::fieldset::PathSet): comma-joined, no spaces.
pub const DECLARED_FIELDS_KEY: &str = concatcp!(GITOPS_KEY_PREFIX, "declared-fields");

/// The annotation marking whether an object is under active management.
pub const MANAGEMENT_KEY: &str = concatcp!(GITOPS_KEY_PREFIX, "management");

/// The value of [`MANAGEMENT_KEY`] for actively managed objects.
pub const MANAGEMENT_ENABLED: &str = "enabled";

/// The annotation naming the sync pipeline that manages an object. The value
/// encodes the pipeline scope and name, see [`crate::declared::Scope`].
pub const MANAGER_KEY: &str = concatcp!(GITOPS_KEY_PREFIX, "manager");

/// The annotation recording the source commit an object was last applied from.
pub const SYNC_TOKEN_KEY: &str = concatcp!(GITOPS_KEY_PREFIX, "sync-token");

/// The annotation on the RSync object signalling that its source contains dry
/// configs and therefore requires the rendering container to run.
pub const REQUIRES_RENDERING_KEY: &str = concatcp!(GITOPS_KEY_PREFIX, "requires-rendering");

/// The well-known Kubernetes managed-by label `app.kubernetes.io/managed-by`.
pub const MANAGED_BY_KEY: &str = concatcp!(K8S_APP_KEY_PREFIX, "managed-by");

/// The value of [`MANAGED_BY_KEY`] on objects managed by this pipeline.
pub const MANAGED_BY_VALUE: &str = "stackable-gitops";

/// The finalizer placed on RSync objects so managed resources can be torn
/// down before the pipeline object disappears.
pub const SYNC_FINALIZER: &str = concatcp!(GITOPS_KEY_PREFIX, "finalizer");

/// The field manager name used for all writes performed by the pipeline.
pub const FIELD_MANAGER: &str = "stackable-gitops";

/// Returns true if the given annotation key is reserved for pipeline
/// bookkeeping.
pub fn is_reserved_annotation_key(key: &str) -> bool {
    key.starts_with(GITOPS_KEY_PREFIX)
}

/// Returns true if the given label key is reserved for pipeline bookkeeping.
pub fn is_reserved_label_key(key: &str) -> bool {
    key == MANAGED_BY_KEY || key.starts_with(GITOPS_KEY_PREFIX)
}

/// Sets an annotation on a dynamic object, creating the annotation map if
/// necessary.
pub fn set_annotation(object: &mut DynamicObject, key: &str, value: &str) {
    object
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_owned(), value.to_owned());
}

/// Removes an annotation from a dynamic object, if present.
pub fn remove_annotation(object: &mut DynamicObject, key: &str) {
    if let Some(annotations) = object.metadata.annotations.as_mut() {
        annotations.remove(key);
    }
}

/// Returns the value of an annotation on a dynamic object, if present.
pub fn get_annotation<'a>(object: &'a DynamicObject, key: &str) -> Option<&'a str> {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// A human-readable identity for a managed object: kind, API group,
/// namespace and name. Used in error messages and log fields.
pub fn object_ref(object: &DynamicObject) -> String {
    let (kind, group) = match &object.types {
        Some(types) => {
            let group = types
                .api_version
                .split_once('/')
                .map_or("", |(group, _)| group);
            (types.kind.as_str(), group)
        }
        None => ("<unknown>", ""),
    };
    let namespace = object.metadata.namespace.as_deref().unwrap_or("");
    let name = object.metadata.name.as_deref().unwrap_or("");
    if group.is_empty() {
        format!("{kind}/{namespace}/{name}")
    } else {
        format!("{kind}.{group}/{namespace}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_form_a_closed_set() {
        assert!(is_reserved_annotation_key(DECLARED_FIELDS_KEY));
        assert!(is_reserved_annotation_key(MANAGER_KEY));
        assert!(is_reserved_annotation_key(MANAGEMENT_KEY));
        assert!(!is_reserved_annotation_key("example.com/owner"));

        assert!(is_reserved_label_key(MANAGED_BY_KEY));
        assert!(!is_reserved_label_key("app.kubernetes.io/name"));
    }

    #[test]
    fn object_ref_includes_group_when_present() {
        let object: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": { "name": "hello", "namespace": "world" },
        }))
        .expect("valid object");
        assert_eq!(
            object_ref(&object),
            "Role.rbac.authorization.k8s.io/world/hello"
        );
    }
}
