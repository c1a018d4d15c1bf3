//! Sets of leaf field paths over nested configuration documents.
//!
//! A field path is a JSON Pointer (RFC 6901): `/` separates segments, literal
//! `~` and `/` inside a segment are escaped as `~0` and `~1`. A path always
//! denotes a leaf: maps are descended into, lists are never descended into.
//!
//! Two serializations exist and are not interchangeable: the persisted
//! annotation form joins paths with a bare comma, the display form used in
//! admission responses and logs joins them with comma + space.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;
use snafu::{ResultExt, Snafu};

/// Separator of the human-facing serialization, see
/// [`PathSet::to_display_string`].
pub const DISPLAY_SEPARATOR: &str = ", ";

/// Separator of the persisted annotation serialization, see
/// [`PathSet::to_annotation_string`].
const ANNOTATION_SEPARATOR: &str = ",";

const SLASH: &str = "/";
const TILDE: &str = "~";
const ESCAPED_SLASH: &str = "~1";
const ESCAPED_TILDE: &str = "~0";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize object into a JSON document"))]
    SerializeObject { source: serde_json::Error },
}

/// A sorted, deduplicated set of field paths.
///
/// Sorting is plain lexicographic byte-order comparison. Paths differing only
/// in a numeric suffix may therefore sort unintuitively (`/a/10` before
/// `/a/2`); output stability depends on this and it must be preserved.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PathSet(Vec<String>);

impl PathSet {
    /// Collects every leaf field path of the given document, except those in
    /// `ignore_list`.
    ///
    /// - An empty map contributes nothing: its fields are not yet declared
    ///   and adding new nested fields stays allowed.
    /// - An empty list contributes a path at its own location: it is
    ///   declared to be empty.
    /// - A `Null` document yields the empty set.
    pub fn from_value(document: &Value, ignore_list: &[&str]) -> Self {
        if document.is_null() {
            return Self::default();
        }
        let mut leaf_paths = BTreeSet::new();
        traverse(document, SLASH, &mut leaf_paths);
        for ignore in ignore_list {
            leaf_paths.remove(*ignore);
        }
        Self(leaf_paths.into_iter().collect())
    }

    /// Like [`PathSet::from_value`], for typed objects. The object is
    /// serialized into a generic document first.
    pub fn from_object<T>(object: &T, ignore_list: &[&str]) -> Result<Self, Error>
    where
        T: Serialize,
    {
        let document = serde_json::to_value(object).context(SerializeObjectSnafu)?;
        Ok(Self::from_value(&document, ignore_list))
    }

    /// Builds a set from arbitrary paths, sorting and deduplicating them.
    pub fn from_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let paths: BTreeSet<String> = paths.into_iter().collect();
        Self(paths.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.binary_search_by(|probe| probe.as_str().cmp(path)).is_ok()
    }

    /// Returns the paths which appear in both sets.
    pub fn intersection(&self, other: &Self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|path| other.contains(path))
                .cloned()
                .collect(),
        )
    }

    /// Serializes the set for human-facing output (admission responses,
    /// logs). Round-trips through [`PathSet::from_display_string`].
    pub fn to_display_string(&self) -> String {
        self.0.join(DISPLAY_SEPARATOR)
    }

    pub fn from_display_string(s: &str) -> Self {
        if s.is_empty() {
            return Self::default();
        }
        Self::from_paths(s.split(DISPLAY_SEPARATOR).map(str::to_owned))
    }

    /// Serializes the set for the persisted declared-fields annotation.
    /// Round-trips through [`PathSet::from_annotation_string`].
    pub fn to_annotation_string(&self) -> String {
        self.0.join(ANNOTATION_SEPARATOR)
    }

    pub fn from_annotation_string(s: &str) -> Self {
        if s.is_empty() {
            return Self::default();
        }
        Self::from_paths(s.split(ANNOTATION_SEPARATOR).map(str::to_owned))
    }
}

impl<'a> IntoIterator for &'a PathSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Escapes a path segment in compliance with the JSON Pointer syntax.
pub fn escape_field(segment: &str) -> String {
    // The tilde must be escaped first, the slash replacement introduces new
    // tildes.
    segment
        .replace(TILDE, ESCAPED_TILDE)
        .replace(SLASH, ESCAPED_SLASH)
}

/// Unescapes a JSON Pointer path segment.
pub fn unescape_field(segment: &str) -> String {
    // The inverse of escape_field, so the slash escape must be undone first.
    segment
        .replace(ESCAPED_SLASH, SLASH)
        .replace(ESCAPED_TILDE, TILDE)
}

/// Removes the list index from the given path.
///
/// - If the path contains a list segment (an integer or the `-` append
///   sentinel), the segment and everything after it are removed, generalizing
///   an element-level path to its containing list's path.
/// - Paths without a list segment are returned unchanged.
pub fn strip_list_index(path: &str) -> String {
    let mut prefix: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        if segment == "-" || segment.parse::<i64>().is_ok() {
            return prefix.join("/");
        }
        prefix.push(segment);
    }
    path.to_owned()
}

/// Computes the field path of one leaf node given its parent's path.
fn child_path(prefix: &str, key: &str) -> String {
    if prefix.len() == 1 {
        format!("{prefix}{}", escape_field(key))
    } else {
        format!("{prefix}/{}", escape_field(key))
    }
}

/// Walks the document, recording the path of every leaf node. Lists count as
/// leaves.
fn traverse(node: &Value, ancestor_path: &str, leaf_paths: &mut BTreeSet<String>) {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                traverse(value, &child_path(ancestor_path, key), leaf_paths);
            }
        }
        _ => {
            leaf_paths.insert(ancestor_path.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::slash_in_field(json!({"a/b": 1}), &[], "/a~1b")]
    #[case::tilde_in_field(json!({"a~b": 1}), &[], "/a~0b")]
    #[case::slash_in_ignores(json!({"a/b": 1, "a": {"b": 1}}), &["/a~1b"], "/a/b")]
    #[case::tilde_in_ignores(json!({"a~b": 1}), &["/a~0b"], "")]
    #[case::empty_map_is_not_declared(json!({"a": {}, "b": 1}), &[], "/b")]
    #[case::empty_list_is_declared(json!({"a": [], "b": 1}), &[], "/a, /b")]
    #[case::flat(json!({"a": 1, "b": 2, "c": 3}), &[], "/a, /b, /c")]
    #[case::lists_are_leaves(json!({"a": [1, 2, 3], "b": [4, 5, 6], "c": 3}), &[], "/a, /b, /c")]
    #[case::nested_maps(
        json!({"a": {"a1": 1, "a2": 1, "a3": 2}, "b": {"b1": 1, "b2": {"b3": 1}}}),
        &[],
        "/a/a1, /a/a2, /a/a3, /b/b1, /b/b2/b3"
    )]
    #[case::nested_list(json!({"a": [[1, 2, 3], 2]}), &[], "/a")]
    #[case::mixed(
        json!({"a": 1, "b": ["b1", {"b2": [1], "b3": 2}, [1, 2, 3]], "c": {"c1": 1, "c2": [1, 2], "c3": {"c4": 1}}, "d": [{"d1": 1}, {"d3": 1}]}),
        &[],
        "/a, /b, /c/c1, /c/c2, /c/c3/c4, /d"
    )]
    #[case::ignore_not_found(json!({"a": 1, "b": 2}), &["/x", "/y"], "/a, /b")]
    #[case::multiple_ignores(json!({"a": 1, "b": 2, "c": {"c1": 3}}), &["/b", "/c/c1"], "/a")]
    #[case::all_ignored(json!({"a": 1, "b": 2}), &["/a", "/b"], "")]
    #[case::null_document(json!(null), &[], "")]
    fn field_set_walk(#[case] document: Value, #[case] ignores: &[&str], #[case] want: &str) {
        let set = PathSet::from_value(&document, ignores);
        assert_eq!(set.to_display_string(), want);
    }

    #[rstest]
    #[case::plain("spec")]
    #[case::tilde("a~b")]
    #[case::slash("a/b")]
    #[case::both("a~/b~1c")]
    #[case::escape_sequences_literal("~0~1")]
    fn escape_round_trip(#[case] segment: &str) {
        assert_eq!(unescape_field(&escape_field(segment)), segment);
    }

    #[test]
    fn escaping_plain_segments_is_a_no_op() {
        assert_eq!(escape_field("containers0field"), "containers0field");
    }

    #[rstest]
    #[case::index_inside("/a/0/b", "/a")]
    #[case::append_sentinel("/a/-", "/a")]
    #[case::no_index("/a/b", "/a/b")]
    #[case::trailing_index("/rules/1", "/rules")]
    #[case::negative_index("/a/-1/b", "/a")]
    #[case::numeric_looking_key_with_letters("/a/0b/c", "/a/0b/c")]
    fn list_index_stripping(#[case] path: &str, #[case] want: &str) {
        assert_eq!(strip_list_index(path), want);
    }

    #[test]
    fn serializations_round_trip_as_sets() {
        let document = json!({"a": 1, "b": ["b1"], "c": {"c1": {}, "c2": 2}});
        let set = PathSet::from_value(&document, &[]);

        assert_eq!(PathSet::from_display_string(&set.to_display_string()), set);
        assert_eq!(
            PathSet::from_annotation_string(&set.to_annotation_string()),
            set
        );
        // The two forms differ and must not be mixed up.
        assert_eq!(set.to_annotation_string(), "/a,/b,/c/c2");
        assert_eq!(set.to_display_string(), "/a, /b, /c/c2");
    }

    #[test]
    fn empty_set_round_trips_through_the_empty_string() {
        let set = PathSet::default();
        assert_eq!(set.to_display_string(), "");
        assert_eq!(PathSet::from_display_string(""), set);
        assert_eq!(PathSet::from_annotation_string(""), set);
    }

    #[test]
    fn intersection_keeps_common_paths() {
        let a = PathSet::from_paths(["/a".to_owned(), "/b".to_owned(), "/c".to_owned()]);
        let b = PathSet::from_paths(["/b".to_owned(), "/c".to_owned(), "/d".to_owned()]);
        assert_eq!(a.intersection(&b).to_display_string(), "/b, /c");
        assert!(a.intersection(&PathSet::default()).is_empty());
    }

    #[test]
    fn sorting_is_byte_order() {
        let set = PathSet::from_paths(["/a/10".to_owned(), "/a/2".to_owned()]);
        assert_eq!(set.to_display_string(), "/a/10, /a/2");
    }
}
