//! The shared snapshot of currently declared resources.
//!
//! The control loop replaces the snapshot once per successful parse, the
//! remediator reads it concurrently to decide which fields to revert. The
//! snapshot is the only state shared between the two, everything else flows
//! through explicit error channels.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::RwLock,
};

use kube::core::DynamicObject;

use crate::metadata;

/// An API group and kind, without the version. The unit at which watches are
/// established.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn of(object: &DynamicObject) -> Self {
        match &object.types {
            Some(types) => Self {
                group: types
                    .api_version
                    .split_once('/')
                    .map_or("", |(group, _)| group)
                    .to_owned(),
                kind: types.kind.clone(),
            },
            None => Self {
                group: String::new(),
                kind: String::new(),
            },
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// The declared resources of one sync pipeline, keyed by object identity.
#[derive(Debug, Default)]
pub struct Resources {
    objects: RwLock<BTreeMap<String, DynamicObject>>,
}

impl Resources {
    /// Replaces the snapshot with the given objects and returns the set of
    /// group-kinds now declared.
    pub fn update(&self, objects: &[DynamicObject]) -> BTreeSet<GroupKind> {
        let mut map = BTreeMap::new();
        let mut group_kinds = BTreeSet::new();
        for object in objects {
            group_kinds.insert(GroupKind::of(object));
            map.insert(metadata::object_ref(object), object.clone());
        }
        let mut guard = self.objects.write().unwrap_or_else(|e| e.into_inner());
        *guard = map;
        group_kinds
    }

    /// Looks up a declared object by its identity, as produced by
    /// [`metadata::object_ref`].
    pub fn get(&self, id: &str) -> Option<DynamicObject> {
        let guard = self.objects.read().unwrap_or_else(|e| e.into_inner());
        guard.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        let guard = self.objects.read().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The group-kinds of all currently declared objects.
    pub fn declared_group_kinds(&self) -> BTreeSet<GroupKind> {
        let guard = self.objects.read().unwrap_or_else(|e| e.into_inner());
        guard.values().map(GroupKind::of).collect()
    }
}
