//! Shared Kubernetes helpers for object identity and owner references

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

/// Namespaced identity of an object, rendered as `namespace/name`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl NamespacedName {
    /// Create an identity from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of a namespaced resource (empty namespace when unset)
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Group/version/kind triple as written into owner references
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gvk {
    /// `group/version`, or just `version` for the core group
    pub api_version: &'static str,
    /// Resource kind
    pub kind: &'static str,
}

/// Owner reference target kind for core pods
pub const POD_GVK: Gvk = Gvk {
    api_version: "v1",
    kind: "Pod",
};

/// True if the object has a deletion timestamp
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// UID of the object, empty when unset
pub fn uid_of(meta: &ObjectMeta) -> &str {
    meta.uid.as_deref().unwrap_or_default()
}

/// Build a controller owner reference pointing at `owner`
pub fn controller_ref(gvk: Gvk, meta: &ObjectMeta) -> OwnerReference {
    OwnerReference {
        api_version: gvk.api_version.to_string(),
        kind: gvk.kind.to_string(),
        name: meta.name.clone().unwrap_or_default(),
        uid: uid_of(meta).to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// True if `ref_` names `meta` by apiVersion, kind and name (UID ignored)
pub fn matches_ref(ref_: &OwnerReference, meta: &ObjectMeta, gvk: Gvk) -> bool {
    ref_.api_version == gvk.api_version
        && ref_.kind == gvk.kind
        && Some(ref_.name.as_str()) == meta.name.as_deref()
}

/// The controller reference of `meta`, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true))
}
