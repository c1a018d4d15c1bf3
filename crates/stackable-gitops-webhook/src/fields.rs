//! Computes which field paths a write to a managed object touches.
//!
//! Two comparators exist and deliberately disagree on one point: the
//! structural-patch comparator ([`field_diff`]) treats list identity as
//! positional, so reordering a list's elements without changing any of them
//! registers as a change to the list's path. The value comparator
//! ([`field_diff_equivalent`]) compares lists as unordered multisets, so a
//! pure reorder contributes nothing. Both behaviors exist in the wild and
//! each caller must pick the one matching its comparison semantics.

use std::collections::BTreeSet;

use json_patch::PatchOperation;
use kube::core::DynamicObject;
use serde::Serialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_gitops::{
    declared::fieldset::{PathSet, escape_field, strip_list_index, unescape_field},
    metadata,
};

const METADATA_ANNOTATIONS: &str = "/metadata/annotations/";
const METADATA_LABELS: &str = "/metadata/labels/";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize object into a JSON document"))]
    SerializeObject { source: serde_json::Error },

    #[snafu(display("declared-fields annotation is missing from {object}"))]
    MissingDeclaredFields { object: String },
}

/// Returns the set of field paths which differ between the old and new
/// version of an object, using the structural-patch comparator.
///
/// - Additions and replacements contribute their (index-stripped) path.
/// - Removing a scalar contributes its path; removing a map contributes one
///   path per removed key, so a vanished substructure counts as that many
///   independent field removals.
/// - Index- and append-position-specific paths are generalized to their
///   containing list's path, matching the granularity at which fields are
///   declared.
pub fn field_diff<T>(old_object: &T, new_object: &T) -> Result<PathSet, Error>
where
    T: Serialize,
{
    let old = serde_json::to_value(old_object).context(SerializeObjectSnafu)?;
    let new = serde_json::to_value(new_object).context(SerializeObjectSnafu)?;
    Ok(diff_documents(&old, &new))
}

fn diff_documents(old: &Value, new: &Value) -> PathSet {
    let patch = json_patch::diff(old, new);
    let mut paths = BTreeSet::new();
    for operation in patch.0 {
        match operation {
            // Added fields can never overlap with declared fields, but they
            // are still collected: the guard checks them against the
            // reserved pipeline metadata.
            PatchOperation::Add(op) => {
                paths.insert(strip_list_index(&op.path.to_string()));
            }
            PatchOperation::Replace(op) => {
                paths.insert(strip_list_index(&op.path.to_string()));
            }
            PatchOperation::Remove(op) => {
                let path = op.path.to_string();
                match old.pointer(&path) {
                    Some(Value::Object(map)) => {
                        for key in map.keys() {
                            paths.insert(strip_list_index(&format!(
                                "{path}/{}",
                                escape_field(key)
                            )));
                        }
                    }
                    _ => {
                        paths.insert(strip_list_index(&path));
                    }
                }
            }
            _ => {}
        }
    }
    PathSet::from_paths(paths)
}

/// Like [`field_diff`], but lists compare as unordered multisets: reordering
/// a list without adding, removing or modifying any element contributes
/// nothing.
pub fn field_diff_equivalent<T>(old_object: &T, new_object: &T) -> Result<PathSet, Error>
where
    T: Serialize,
{
    let old = serde_json::to_value(old_object).context(SerializeObjectSnafu)?;
    let new = serde_json::to_value(new_object).context(SerializeObjectSnafu)?;
    let mut paths = BTreeSet::new();
    diff_values(&old, &new, "", &mut paths);
    Ok(PathSet::from_paths(paths))
}

fn diff_values(old: &Value, new: &Value, path: &str, paths: &mut BTreeSet<String>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let child = format!("{path}/{}", escape_field(key));
                match new_map.get(key) {
                    Some(new_value) => diff_values(old_value, new_value, &child, paths),
                    None => removal_paths(old_value, &child, paths),
                }
            }
            for key in new_map.keys() {
                if !old_map.contains_key(key) {
                    paths.insert(strip_list_index(&format!("{path}/{}", escape_field(key))));
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            if !arrays_equal_unordered(old_items, new_items) {
                paths.insert(strip_list_index(path));
            }
        }
        _ => {
            if old != new {
                paths.insert(strip_list_index(path));
            }
        }
    }
}

fn removal_paths(old_value: &Value, path: &str, paths: &mut BTreeSet<String>) {
    match old_value {
        Value::Object(map) => {
            for key in map.keys() {
                paths.insert(strip_list_index(&format!("{path}/{}", escape_field(key))));
            }
        }
        _ => {
            paths.insert(strip_list_index(path));
        }
    }
}

fn arrays_equal_unordered(old_items: &[Value], new_items: &[Value]) -> bool {
    if old_items.len() != new_items.len() {
        return false;
    }
    let mut used = vec![false; new_items.len()];
    'outer: for item in old_items {
        for (i, other) in new_items.iter().enumerate() {
            if !used[i] && item == other {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

/// Returns the declared fields of the given object, parsed from its
/// declared-fields annotation.
///
/// An object without the annotation is never eligible for protection, its
/// absence is an error.
pub fn declared_fields(object: &DynamicObject) -> Result<PathSet, Error> {
    let declared = metadata::get_annotation(object, metadata::DECLARED_FIELDS_KEY).context(
        MissingDeclaredFieldsSnafu {
            object: metadata::object_ref(object),
        },
    )?;
    Ok(PathSet::from_annotation_string(declared))
}

/// Filters a path set down to the metadata paths whose unescaped leaf key is
/// reserved for pipeline bookkeeping.
///
/// Used to detect writes that tamper with the pipeline's own annotations or
/// labels, which are protected even when the source of truth does not
/// declare them.
pub fn reserved_metadata(set: &PathSet) -> PathSet {
    let mut paths = Vec::new();
    for path in set.iter() {
        if let Some(key) = path.strip_prefix(METADATA_ANNOTATIONS) {
            if metadata::is_reserved_annotation_key(&unescape_field(key)) {
                paths.push(path.to_owned());
            }
        }
        if let Some(key) = path.strip_prefix(METADATA_LABELS) {
            if metadata::is_reserved_label_key(&unescape_field(key)) {
                paths.push(path.to_owned());
            }
        }
    }
    PathSet::from_paths(paths)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::rbac::v1::{PolicyRule, Role};
    use kube::api::ObjectMeta;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(resources.iter().map(|r| (*r).to_owned()).collect()),
            verbs: verbs.iter().map(|v| (*v).to_owned()).collect(),
            ..Default::default()
        }
    }

    fn role(labels: Option<BTreeMap<String, String>>, rules: Vec<PolicyRule>) -> Role {
        Role {
            metadata: ObjectMeta {
                name: Some("hello".to_owned()),
                namespace: Some("world".to_owned()),
                labels,
                ..Default::default()
            },
            rules: Some(rules),
        }
    }

    fn base_role() -> Role {
        role(
            Some(labels(&[("foo", "bar"), ("this", "that")])),
            vec![rule(&["namespaces"], &["get", "list"])],
        )
    }

    #[test]
    fn no_changes_yields_the_empty_set() {
        let diff = field_diff(&base_role(), &base_role()).expect("diffable");
        assert!(diff.is_empty());
    }

    #[rstest]
    #[case::add_a_label(
        Some(labels(&[("foo", "bar"), ("this", "that"), ("here", "there")])),
        "/metadata/labels/here"
    )]
    #[case::change_a_label(
        Some(labels(&[("foo", "bar"), ("this", "is not that")])),
        "/metadata/labels/this"
    )]
    #[case::remove_a_label(Some(labels(&[("foo", "bar")])), "/metadata/labels/this")]
    #[case::remove_all_labels(
        Some(labels(&[])),
        "/metadata/labels/foo, /metadata/labels/this"
    )]
    #[case::set_labels_to_nil(None, "/metadata/labels/foo, /metadata/labels/this")]
    #[case::change_and_add(
        Some(labels(&[("foo", "bar"), ("this", "is not that"), ("here", "there")])),
        "/metadata/labels/here, /metadata/labels/this"
    )]
    #[case::change_and_remove(
        Some(labels(&[("this", "is not that")])),
        "/metadata/labels/foo, /metadata/labels/this"
    )]
    fn label_changes_structured(
        #[case] new_labels: Option<BTreeMap<String, String>>,
        #[case] want: &str,
    ) {
        let old = base_role();
        let new = role(new_labels, vec![rule(&["namespaces"], &["get", "list"])]);

        let diff = field_diff(&old, &new).expect("diffable");
        assert_eq!(diff.to_display_string(), want);

        // Both comparators agree on map-level changes.
        let diff = field_diff_equivalent(&old, &new).expect("diffable");
        assert_eq!(diff.to_display_string(), want);
    }

    #[rstest]
    #[case::add_a_rule(
        vec![rule(&["namespaces"], &["get", "list"]), rule(&["pods"], &["get"])],
        "/rules"
    )]
    #[case::change_a_rule(vec![rule(&["namespaces"], &["get", "list", "delete"])], "/rules")]
    #[case::remove_all_rules(vec![], "/rules")]
    fn rule_changes_structured(#[case] new_rules: Vec<PolicyRule>, #[case] want: &str) {
        let old = base_role();
        let new = role(Some(labels(&[("foo", "bar"), ("this", "that")])), new_rules);

        let diff = field_diff(&old, &new).expect("diffable");
        assert_eq!(diff.to_display_string(), want);

        let diff = field_diff_equivalent(&old, &new).expect("diffable");
        assert_eq!(diff.to_display_string(), want);
    }

    #[test]
    fn rule_reorder_splits_the_comparators() {
        let old = role(
            None,
            vec![
                rule(&["pods"], &["get", "list"]),
                rule(&["namespaces"], &["get", "list"]),
            ],
        );
        let new = role(
            None,
            vec![
                rule(&["namespaces"], &["get", "list"]),
                rule(&["pods"], &["get", "list"]),
            ],
        );

        // List identity is positional for the structural patch, so a pure
        // reorder still registers as a change to the list's path.
        let diff = field_diff(&old, &new).expect("diffable");
        assert_eq!(diff.to_display_string(), "/rules");

        // The value comparator treats the lists as unordered and sees no
        // change.
        let diff = field_diff_equivalent(&old, &new).expect("diffable");
        assert!(diff.is_empty());
    }

    /// Using [`serde_yaml`] to generate the test data
    fn unstructured(mutate: impl FnOnce(&mut Value)) -> DynamicObject {
        let mut object: Value = serde_yaml::from_str(
            "
apiVersion: rbac.authorization.k8s.io/v1
kind: Role
metadata:
  name: hello
  namespace: world
  labels:
    foo: bar
    this: that
rules:
  - apiGroups: ['']
    resources: [namespaces]
    verbs: [get, list]
",
        )
        .expect("valid yaml");
        mutate(&mut object);
        serde_json::from_value(object).expect("valid object")
    }

    #[test]
    fn label_changes_generic() {
        let old = unstructured(|_| {});
        let new = unstructured(|object| {
            object["metadata"]["labels"] = json!({ "foo": "bar" });
        });
        let diff = field_diff(&old, &new).expect("diffable");
        assert_eq!(diff.to_display_string(), "/metadata/labels/this");

        let new = unstructured(|object| {
            object["metadata"]
                .as_object_mut()
                .expect("metadata is a map")
                .remove("labels");
        });
        let diff = field_diff(&old, &new).expect("diffable");
        assert_eq!(
            diff.to_display_string(),
            "/metadata/labels/foo, /metadata/labels/this"
        );
    }

    #[test]
    fn rule_changes_generic() {
        let old = unstructured(|_| {});
        let new = unstructured(|object| {
            object["rules"] = json!([
                {
                    "apiGroups": [""],
                    "resources": ["namespaces"],
                    "verbs": ["get", "list", "delete"],
                },
            ]);
        });
        let diff = field_diff(&old, &new).expect("diffable");
        assert_eq!(diff.to_display_string(), "/rules");
    }

    #[test]
    fn declared_fields_parses_the_annotation() {
        let object = unstructured(|object| {
            object["metadata"]["annotations"] = json!({
                metadata::DECLARED_FIELDS_KEY: "/metadata/labels/this,/rules",
            });
        });
        let declared = declared_fields(&object).expect("annotation present");
        assert_eq!(declared.to_display_string(), "/metadata/labels/this, /rules");
    }

    #[test]
    fn missing_declared_fields_is_an_error() {
        let object = unstructured(|_| {});
        let error = declared_fields(&object).expect_err("annotation absent");
        assert!(error.to_string().contains("Role.rbac.authorization.k8s.io/world/hello"));
    }

    #[test]
    fn intersection_drives_the_admission_decision() {
        let old = unstructured(|object| {
            object["metadata"]["annotations"] = json!({
                metadata::DECLARED_FIELDS_KEY: "/metadata/labels/this,/rules",
            });
        });
        let new = unstructured(|object| {
            object["metadata"]["annotations"] = json!({
                metadata::DECLARED_FIELDS_KEY: "/metadata/labels/this,/rules",
            });
            object["metadata"]["labels"] = json!({ "foo": "changed", "this": "that" });
        });

        let diff = field_diff(&old, &new).expect("diffable");
        let declared = declared_fields(&old).expect("annotation present");
        // `/metadata/labels/foo` changed but is not declared.
        assert!(diff.intersection(&declared).is_empty());

        let new = unstructured(|object| {
            object["metadata"]["annotations"] = json!({
                metadata::DECLARED_FIELDS_KEY: "/metadata/labels/this,/rules",
            });
            object["metadata"]["labels"] = json!({ "foo": "bar", "this": "changed" });
        });
        let diff = field_diff(&old, &new).expect("diffable");
        assert_eq!(
            diff.intersection(&declared).to_display_string(),
            "/metadata/labels/this"
        );
    }

    #[test]
    fn reserved_metadata_filters_to_pipeline_keys() {
        let object = unstructured(|object| {
            object["metadata"]["annotations"] = json!({
                "hello": "goodbye",
                metadata::MANAGEMENT_KEY: "enabled",
                metadata::MANAGER_KEY: ":root/my-sync",
            });
            object["metadata"]["labels"] = json!({
                "here": "there",
                metadata::MANAGED_BY_KEY: metadata::MANAGED_BY_VALUE,
            });
        });

        let set = PathSet::from_object(&object, &[]).expect("serializable");
        let reserved = reserved_metadata(&set);
        assert_eq!(
            reserved.to_display_string(),
            "/metadata/annotations/gitops.stackable.tech~1management, \
             /metadata/annotations/gitops.stackable.tech~1manager, \
             /metadata/labels/app.kubernetes.io~1managed-by"
        );
    }

    #[test]
    fn reserved_metadata_ignores_user_keys() {
        let object = unstructured(|object| {
            object["metadata"]["annotations"] = json!({ "hello": "goodbye" });
        });
        let set = PathSet::from_object(&object, &[]).expect("serializable");
        assert!(reserved_metadata(&set).is_empty());
    }
}
