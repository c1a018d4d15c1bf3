//! Hydrates parsed objects with the declared-fields annotation.
//!
//! The annotation is what enables the admission guard to protect declared
//! fields from being changed by other controllers or users. Computing it
//! requires a schema-normalized view of the manifest, so implicit defaults
//! which the discovery schema does not fill in are backfilled first.

use kube::core::DynamicObject;
use serde_json::Value;

use crate::{
    declared::fieldset::{self, PathSet},
    error::{Errors, SyncError},
    metadata,
};

/// The fields in an object which identify it and therefore would never
/// mutate. They are stripped from every declared-field set.
const IDENTITY_FIELDS: &[&str] = &[
    "/apiVersion",
    "/kind",
    "/metadata/name",
    "/metadata/namespace",
    "/metadata/creationTimestamp",
];

/// Annotates each object with the set of fields its manifest declares.
///
/// Objects that fail to normalize are reported and skipped, the rest of the
/// batch is still hydrated.
pub fn hydrate_declared_fields(objects: &mut [DynamicObject]) -> Errors {
    let mut errors = Errors::new();
    for object in objects.iter_mut() {
        match encode_declared_fields(object) {
            Ok(fields) => {
                metadata::set_annotation(object, metadata::DECLARED_FIELDS_KEY, &fields);
            }
            Err(error) => errors.push(error),
        }
    }
    errors
}

/// Removes the declared-fields annotation from every object.
///
/// Used when the admission guard is disabled: without the guard the
/// annotation would only mislead readers into assuming the fields are
/// protected.
pub fn strip_declared_fields(objects: &mut [DynamicObject]) {
    for object in objects.iter_mut() {
        metadata::remove_annotation(object, metadata::DECLARED_FIELDS_KEY);
    }
}

/// Stamps the management bookkeeping metadata on every object: the managing
/// pipeline, the source commit it was applied from, the management marker and
/// the managed-by label.
pub fn annotate_management_metadata(objects: &mut [DynamicObject], manager: &str, commit: &str) {
    for object in objects.iter_mut() {
        metadata::set_annotation(object, metadata::MANAGER_KEY, manager);
        metadata::set_annotation(object, metadata::SYNC_TOKEN_KEY, commit);
        metadata::set_annotation(
            object,
            metadata::MANAGEMENT_KEY,
            metadata::MANAGEMENT_ENABLED,
        );
        object
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(
                metadata::MANAGED_BY_KEY.to_owned(),
                metadata::MANAGED_BY_VALUE.to_owned(),
            );
    }
}

/// Encodes the declared fields of the given object in the persisted
/// annotation format, stripping identity fields since changing them would
/// change the identity of the object.
fn encode_declared_fields(object: &mut DynamicObject) -> Result<String, SyncError> {
    set_default_protocol(object)?;
    let set = PathSet::from_object(object, IDENTITY_FIELDS).map_err(
        |fieldset::Error::SerializeObject { source }| SyncError::ObjectParse {
            object: metadata::object_ref(object),
            message: source.to_string(),
        },
    )?;
    Ok(set.to_annotation_string())
}

/// Fills in the `protocol` field of every port list nested in the object.
///
/// Required because the discovery schema used for field comparison does not
/// carry complete defaulting for the port protocol, which would make the
/// declared set diverge from what the API server stores.
fn set_default_protocol(object: &mut DynamicObject) -> Result<(), SyncError> {
    let Some(types) = object.types.clone() else {
        return Ok(());
    };
    let group = types
        .api_version
        .split_once('/')
        .map_or("", |(group, _)| group);
    let id = metadata::object_ref(object);

    let failures = match (group, types.kind.as_str()) {
        ("", "Pod") => default_protocol_in_pod_spec(&mut object.data, &["spec"]),
        ("apps", "Deployment" | "DaemonSet" | "ReplicaSet" | "StatefulSet")
        | ("batch", "Job")
        | ("", "ReplicationController") => {
            default_protocol_in_pod_spec(&mut object.data, &["spec", "template", "spec"])
        }
        ("batch", "CronJob") => default_protocol_in_pod_spec(
            &mut object.data,
            &["spec", "jobTemplate", "spec", "template", "spec"],
        ),
        ("", "Service") => {
            let ports = nested_value_mut(&mut object.data, &["spec", "ports"]);
            default_protocol_in_ports(ports, ".spec.ports")
        }
        _ => Vec::new(),
    };

    // These failures represent malformed objects, the manifest itself needs
    // to be corrected. In almost all cases they are caught by validation
    // before this point, but they still have to be handled here.
    if failures.is_empty() {
        Ok(())
    } else {
        Err(SyncError::ObjectParse {
            object: id,
            message: failures.join("\n"),
        })
    }
}

fn default_protocol_in_pod_spec(data: &mut Value, path: &[&str]) -> Vec<String> {
    let dotted = path.join(".");
    let Some(pod_spec) = nested_value_mut(data, path) else {
        return vec![format!(".{dotted} is required")];
    };
    let Value::Object(pod_spec) = pod_spec else {
        return vec![format!(".{dotted} must be a mapping")];
    };

    let mut failures = Vec::new();
    // Init containers may be declared empty or null, both are skipped.
    // A missing containers list is left to schema validation to reject.
    for field in ["initContainers", "containers"] {
        match pod_spec.get_mut(field) {
            None | Some(Value::Null) => {}
            Some(Value::Array(containers)) => {
                failures.extend(default_protocol_in_containers(containers, &dotted, field));
            }
            Some(_) => failures.push(format!(".{dotted}.{field} must be a list")),
        }
    }
    failures
}

fn default_protocol_in_containers(
    containers: &mut [Value],
    dotted: &str,
    field: &str,
) -> Vec<String> {
    let mut failures = Vec::new();
    for container in containers {
        match container {
            Value::Object(container) => {
                failures.extend(default_protocol_in_ports(
                    container.get_mut("ports"),
                    &format!(".{dotted}.{field}.ports"),
                ));
            }
            _ => failures.push(format!(".{dotted}.{field} entries must be mappings")),
        }
    }
    failures
}

fn default_protocol_in_ports(ports: Option<&mut Value>, context: &str) -> Vec<String> {
    match ports {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(ports)) => {
            let mut failures = Vec::new();
            for port in ports {
                match port {
                    Value::Object(port) => {
                        port.entry("protocol")
                            .or_insert_with(|| Value::String("TCP".to_owned()));
                    }
                    _ => failures.push(format!("{context} entries must be mappings")),
                }
            }
            failures
        }
        Some(_) => vec![format!("{context} must be a list")],
    }
}

fn nested_value_mut<'a>(data: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    let mut current = data;
    for segment in path {
        current = current.as_object_mut()?.get_mut(*segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).expect("valid object")
    }

    fn deployment() -> DynamicObject {
        object(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "my-app", "namespace": "prod" },
            "spec": {
                "replicas": 2,
                "template": {
                    "spec": {
                        "containers": [
                            { "name": "main", "ports": [{ "containerPort": 8080 }] },
                        ],
                    },
                },
            },
        }))
    }

    #[test]
    fn hydration_sets_the_declared_fields_annotation() {
        let mut objects = vec![deployment()];
        let errors = hydrate_declared_fields(&mut objects);
        assert!(errors.is_empty());

        let declared = metadata::get_annotation(&objects[0], metadata::DECLARED_FIELDS_KEY)
            .expect("annotation set");
        assert_eq!(
            declared,
            "/spec/replicas,/spec/template/spec/containers"
        );
    }

    #[test]
    fn hydration_backfills_the_port_protocol() {
        let mut objects = vec![deployment()];
        let errors = hydrate_declared_fields(&mut objects);
        assert!(errors.is_empty());

        let port = &objects[0].data["spec"]["template"]["spec"]["containers"][0]["ports"][0];
        assert_eq!(port["protocol"], json!("TCP"));
        assert_eq!(port["containerPort"], json!(8080));
    }

    #[test]
    fn hydration_preserves_an_explicit_protocol() {
        let mut objects = vec![object(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "my-svc", "namespace": "prod" },
            "spec": {
                "ports": [
                    { "port": 53, "protocol": "UDP" },
                    { "port": 80 },
                ],
            },
        }))];
        let errors = hydrate_declared_fields(&mut objects);
        assert!(errors.is_empty());

        let ports = &objects[0].data["spec"]["ports"];
        assert_eq!(ports[0]["protocol"], json!("UDP"));
        assert_eq!(ports[1]["protocol"], json!("TCP"));
    }

    #[test]
    fn one_malformed_object_does_not_block_the_batch() {
        let mut objects = vec![
            object(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "broken", "namespace": "prod" },
                // Pods must carry a spec, its absence is a parse error.
            })),
            deployment(),
        ];
        let errors = hydrate_declared_fields(&mut objects);
        assert_eq!(errors.len(), 1);

        assert!(metadata::get_annotation(&objects[0], metadata::DECLARED_FIELDS_KEY).is_none());
        assert!(metadata::get_annotation(&objects[1], metadata::DECLARED_FIELDS_KEY).is_some());
    }

    #[test]
    fn declared_set_is_the_field_set_minus_identity_fields() {
        let mut objects = vec![deployment()];
        hydrate_declared_fields(&mut objects);

        let declared = PathSet::from_annotation_string(
            metadata::get_annotation(&objects[0], metadata::DECLARED_FIELDS_KEY)
                .expect("annotation set"),
        );
        // The expected set is computed on the pre-hydration object, before
        // the annotation itself became part of the document.
        let expected = PathSet::from_object(&deployment(), IDENTITY_FIELDS).expect("serializable");
        assert_eq!(declared, expected);
    }

    #[test]
    fn management_metadata_is_stamped() {
        let mut objects = vec![deployment()];
        annotate_management_metadata(&mut objects, ":root/my-sync", "abc123");

        assert_eq!(
            metadata::get_annotation(&objects[0], metadata::MANAGER_KEY),
            Some(":root/my-sync")
        );
        assert_eq!(
            metadata::get_annotation(&objects[0], metadata::SYNC_TOKEN_KEY),
            Some("abc123")
        );
        let labels = objects[0].metadata.labels.as_ref().expect("labels set");
        assert_eq!(
            labels.get(metadata::MANAGED_BY_KEY).map(String::as_str),
            Some(metadata::MANAGED_BY_VALUE)
        );
    }
}
