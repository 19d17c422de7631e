//! Kubeclerk schema: the type registry and the conversion layer between
//! generic objects and typed `k8s-openapi` instances.

#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ApiResource;
use kubeclerk_core::{Error, GenericObject, InstanceId, KindId, Result};
use rustc_hash::FxHashMap;
use tracing::debug;

mod builtin;
pub mod convert;

pub use builtin::builtin_merge_keys;
pub use convert::{to_generic, to_typed, Collection, CollectionDescriptor, KindDescriptor, Object, ResourceKind};

/// A strongly-typed instance produced by a [`TypeDescriptor`].
pub trait TypedObject: Send + Sync + fmt::Debug {
    fn kind_id(&self) -> KindId;

    /// Object metadata; `None` for collection kinds.
    fn object_meta(&self) -> Option<&ObjectMeta>;

    /// Elements of a collection kind; `None` for singular kinds.
    fn items(&self) -> Option<Vec<&dyn TypedObject>>;

    fn to_generic(&self) -> Result<GenericObject>;

    fn as_any(&self) -> &dyn Any;

    fn instance_id(&self) -> Option<InstanceId> {
        let meta = self.object_meta()?;
        Some(InstanceId {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        })
    }
}

/// Registry-held shape definition for one kind.
pub trait TypeDescriptor: Send + Sync + fmt::Debug {
    fn kind_id(&self) -> &KindId;

    fn namespaced(&self) -> bool;

    /// API resource of the singular kind (collections report their item's).
    fn api_resource(&self) -> ApiResource;

    /// Singular kind held by a collection descriptor.
    fn item_kind(&self) -> Option<&KindId>;

    fn new_instance(&self) -> Box<dyn TypedObject>;

    fn to_typed(&self, obj: &GenericObject) -> Result<Box<dyn TypedObject>>;

    /// Strategic merge keys; `None` when the kind cannot take a strategic
    /// merge patch.
    fn merge_keys(&self) -> Option<&MergeKeys>;
}

/// Merge keys for list fields, addressed by dotted path through map keys
/// (list positions are not part of the path), e.g. `spec.containers.env`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeKeys {
    entries: Vec<(String, String)>,
}

impl MergeKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, key: impl Into<String>) -> Self {
        self.insert(path, key);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, key: impl Into<String>) {
        let path = path.into();
        let key = key.into();
        match self.entries.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = key,
            None => self.entries.push((path, key)),
        }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, k)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Table of known kinds, enumerated in registration order.
#[derive(Default)]
pub struct Registry {
    order: Vec<Arc<dyn TypeDescriptor>>,
    index: FxHashMap<KindId, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the common core/apps/batch/rbac/networking kinds.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        builtin::register_all(&mut reg);
        reg
    }

    /// Register `K` and its `KList` collection kind.
    pub fn register<K: ResourceKind>(&mut self) -> &mut Self {
        let merge_keys = builtin_merge_keys(K::GROUP, K::KIND);
        self.register_descriptor(Arc::new(KindDescriptor::<K>::new(merge_keys)));
        self.register_descriptor(Arc::new(CollectionDescriptor::<K>::new()));
        self
    }

    /// Register a descriptor; a descriptor for an already known kind replaces
    /// the previous one in place.
    pub fn register_descriptor(&mut self, desc: Arc<dyn TypeDescriptor>) -> &mut Self {
        let kind = desc.kind_id().clone();
        match self.index.get(&kind) {
            Some(&i) => self.order[i] = desc,
            None => {
                self.index.insert(kind.clone(), self.order.len());
                self.order.push(desc);
            }
        }
        debug!(kind = %kind, "registered kind");
        self
    }

    pub fn resolve(&self, kind: &KindId) -> Result<Arc<dyn TypeDescriptor>> {
        self.index
            .get(kind)
            .map(|&i| Arc::clone(&self.order[i]))
            .ok_or_else(|| Error::NotRegistered(kind.clone()))
    }

    pub fn contains(&self, kind: &KindId) -> bool {
        self.index.contains_key(kind)
    }

    pub fn new_instance(&self, kind: &KindId) -> Result<Box<dyn TypedObject>> {
        Ok(self.resolve(kind)?.new_instance())
    }

    /// Every registered kind (collections included) in registration order.
    pub fn all_kinds(&self) -> Vec<KindId> {
        self.order.iter().map(|d| d.kind_id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("kinds", &self.order.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service};

    #[test]
    fn register_adds_singular_and_collection_in_order() {
        let mut reg = Registry::new();
        reg.register::<Namespace>().register::<Service>();
        let kinds: Vec<String> = reg.all_kinds().iter().map(|k| k.kind.clone()).collect();
        assert_eq!(kinds, vec!["Namespace", "NamespaceList", "Service", "ServiceList"]);
        assert!(reg.resolve(&KindId::new("", "v1", "ServiceList")).unwrap().item_kind().is_some());
    }

    #[test]
    fn unknown_kinds_are_not_registered() {
        let reg = Registry::new();
        let err = reg.resolve(&KindId::new("", "v1", "NotFound")).unwrap_err();
        assert!(err.is_not_registered());
        assert!(reg.new_instance(&KindId::new("", "v1", "NotFound")).unwrap_err().is_not_registered());
    }

    #[test]
    fn re_registering_keeps_position() {
        let mut reg = Registry::new();
        reg.register::<ConfigMap>().register::<Service>().register::<ConfigMap>();
        assert_eq!(reg.len(), 4);
        assert_eq!(reg.all_kinds()[0].kind, "ConfigMap");
    }

    #[test]
    fn new_instance_is_empty_typed_object() {
        let mut reg = Registry::new();
        reg.register::<Service>();
        let inst = reg.new_instance(&KindId::new("", "v1", "Service")).unwrap();
        assert!(inst.as_any().downcast_ref::<Object<Service>>().is_some());
        let list = reg.new_instance(&KindId::new("", "v1", "ServiceList")).unwrap();
        assert_eq!(list.items().map(|i| i.len()), Some(0));
    }

    #[test]
    fn merge_keys_replace_by_path() {
        let mut keys = MergeKeys::new().with("spec.ports", "port");
        keys.insert("spec.ports", "name");
        assert_eq!(keys.get("spec.ports"), Some("name"));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.get("spec.other"), None);
    }
}
