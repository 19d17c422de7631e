//! Conversion between [`GenericObject`] and the typed `k8s-openapi` structs.
//!
//! Decoding is schema-enforcing: a generic object is deserialized into the
//! concrete struct, re-encoded, and any non-null input field that did not
//! survive the round trip is reported as unknown.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, ObjectMeta};
use kube::core::ApiResource;
use kubeclerk_core::{Error, GenericObject, KindId, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as Json};

use crate::{MergeKeys, TypeDescriptor, TypedObject};

/// Bounds a `k8s-openapi` struct must meet to be registered.
pub trait ResourceKind:
    k8s_openapi::Resource
    + k8s_openapi::Metadata<Ty = ObjectMeta>
    + Serialize
    + DeserializeOwned
    + Clone
    + Default
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> ResourceKind for K where
    K: k8s_openapi::Resource
        + k8s_openapi::Metadata<Ty = ObjectMeta>
        + Serialize
        + DeserializeOwned
        + Clone
        + Default
        + fmt::Debug
        + Send
        + Sync
        + 'static
{
}

fn kind_of<K: ResourceKind>() -> KindId {
    KindId::new(K::GROUP, K::VERSION, K::KIND)
}

fn api_resource_of<K: ResourceKind>() -> ApiResource {
    ApiResource {
        group: K::GROUP.to_string(),
        version: K::VERSION.to_string(),
        api_version: K::API_VERSION.to_string(),
        kind: K::KIND.to_string(),
        plural: K::URL_PATH_SEGMENT.to_string(),
    }
}

fn is_namespaced<K: ResourceKind>() -> bool {
    TypeId::of::<K::Scope>() == TypeId::of::<k8s_openapi::NamespaceResourceScope>()
}

/// Typed instance of a singular kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Object<K>(pub K);

impl<K: ResourceKind> TypedObject for Object<K> {
    fn kind_id(&self) -> KindId {
        kind_of::<K>()
    }

    fn object_meta(&self) -> Option<&ObjectMeta> {
        Some(self.0.metadata())
    }

    fn items(&self) -> Option<Vec<&dyn TypedObject>> {
        None
    }

    fn to_generic(&self) -> Result<GenericObject> {
        to_generic_value(&self.0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Typed instance of a collection kind (`KindList`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection<K> {
    pub metadata: ListMeta,
    pub items: Vec<Object<K>>,
}

impl<K: ResourceKind> TypedObject for Collection<K> {
    fn kind_id(&self) -> KindId {
        kind_of::<K>().list_kind()
    }

    fn object_meta(&self) -> Option<&ObjectMeta> {
        None
    }

    fn items(&self) -> Option<Vec<&dyn TypedObject>> {
        Some(self.items.iter().map(|i| i as &dyn TypedObject).collect())
    }

    fn to_generic(&self) -> Result<GenericObject> {
        let kind = self.kind_id();
        let mut items = Vec::with_capacity(self.items.len());
        for item in &self.items {
            items.push(item.to_generic()?.into_value());
        }
        let metadata = serde_json::to_value(&self.metadata).map_err(|e| encode_err(&kind, e))?;
        let mut map = Map::new();
        map.insert("apiVersion".into(), Json::String(kind.api_version()));
        map.insert("kind".into(), Json::String(kind.kind.clone()));
        map.insert("metadata".into(), metadata);
        map.insert("items".into(), Json::Array(items));
        Ok(GenericObject::from_map(map))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Descriptor of a singular `k8s-openapi` kind.
pub struct KindDescriptor<K> {
    kind: KindId,
    merge_keys: MergeKeys,
    _marker: PhantomData<fn() -> K>,
}

impl<K: ResourceKind> KindDescriptor<K> {
    pub fn new(merge_keys: MergeKeys) -> Self {
        Self { kind: kind_of::<K>(), merge_keys, _marker: PhantomData }
    }

    /// Strict decode into the concrete struct.
    pub fn decode(&self, obj: &GenericObject) -> Result<K> {
        decode_strict(&self.kind, obj)
    }
}

impl<K> fmt::Debug for KindDescriptor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindDescriptor").field("kind", &self.kind.to_string()).finish()
    }
}

impl<K: ResourceKind> TypeDescriptor for KindDescriptor<K> {
    fn kind_id(&self) -> &KindId {
        &self.kind
    }

    fn namespaced(&self) -> bool {
        is_namespaced::<K>()
    }

    fn api_resource(&self) -> ApiResource {
        api_resource_of::<K>()
    }

    fn item_kind(&self) -> Option<&KindId> {
        None
    }

    fn new_instance(&self) -> Box<dyn TypedObject> {
        Box::new(Object(K::default()))
    }

    fn to_typed(&self, obj: &GenericObject) -> Result<Box<dyn TypedObject>> {
        Ok(Box::new(Object(self.decode(obj)?)))
    }

    fn merge_keys(&self) -> Option<&MergeKeys> {
        Some(&self.merge_keys)
    }
}

/// Descriptor of the collection kind of `K`.
pub struct CollectionDescriptor<K> {
    kind: KindId,
    item: KindId,
    _marker: PhantomData<fn() -> K>,
}

impl<K: ResourceKind> CollectionDescriptor<K> {
    pub fn new() -> Self {
        let item = kind_of::<K>();
        Self { kind: item.list_kind(), item, _marker: PhantomData }
    }

    pub fn decode(&self, obj: &GenericObject) -> Result<Collection<K>> {
        check_discriminators(&self.kind, obj)?;
        let map = obj.as_map();
        let metadata: ListMeta = match map.get("metadata") {
            None | Some(Json::Null) => ListMeta::default(),
            Some(raw) => {
                let meta: ListMeta = serde_json::from_value(raw.clone()).map_err(|e| invalid(&self.kind, e))?;
                let encoded = serde_json::to_value(&meta).map_err(|e| encode_err(&self.kind, e))?;
                reject_unknown(&self.kind, raw, &encoded, "metadata")?;
                meta
            }
        };
        let raw_items = match map.get("items") {
            None | Some(Json::Null) => Vec::new(),
            Some(Json::Array(items)) => items.clone(),
            Some(_) => return Err(Error::Invalid(format!("{}: items must be an array", self.kind))),
        };
        let mut items = Vec::with_capacity(raw_items.len());
        for (i, raw) in raw_items.into_iter().enumerate() {
            let mut item = GenericObject::try_from(raw)
                .map_err(|e| Error::Invalid(format!("{}: items[{}]: {}", self.kind, i, e)))?;
            // list responses commonly omit per-item type information
            if item.kind().is_none() && item.api_version().is_none() {
                item.set_kind_id(&self.item);
            }
            let typed: K = decode_strict(&self.item, &item)
                .map_err(|e| Error::Invalid(format!("{}: items[{}]: {}", self.kind, i, e)))?;
            items.push(Object(typed));
        }
        Ok(Collection { metadata, items })
    }
}

impl<K: ResourceKind> Default for CollectionDescriptor<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for CollectionDescriptor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionDescriptor").field("kind", &self.kind.to_string()).finish()
    }
}

impl<K: ResourceKind> TypeDescriptor for CollectionDescriptor<K> {
    fn kind_id(&self) -> &KindId {
        &self.kind
    }

    fn namespaced(&self) -> bool {
        is_namespaced::<K>()
    }

    fn api_resource(&self) -> ApiResource {
        api_resource_of::<K>()
    }

    fn item_kind(&self) -> Option<&KindId> {
        Some(&self.item)
    }

    fn new_instance(&self) -> Box<dyn TypedObject> {
        Box::new(Collection::<K>::default())
    }

    fn to_typed(&self, obj: &GenericObject) -> Result<Box<dyn TypedObject>> {
        Ok(Box::new(self.decode(obj)?))
    }

    fn merge_keys(&self) -> Option<&MergeKeys> {
        None
    }
}

/// Convert a generic object into the typed instance described by `desc`.
pub fn to_typed(obj: &GenericObject, desc: &dyn TypeDescriptor) -> Result<Box<dyn TypedObject>> {
    desc.to_typed(obj)
}

/// Convert a typed instance back into its generic representation.
pub fn to_generic(obj: &dyn TypedObject) -> Result<GenericObject> {
    obj.to_generic()
}

fn to_generic_value<T: Serialize>(typed: &T) -> Result<GenericObject> {
    let value = serde_json::to_value(typed).map_err(|e| Error::Invalid(format!("encoding typed object: {}", e)))?;
    GenericObject::try_from(value)
}

fn check_discriminators(kind: &KindId, obj: &GenericObject) -> Result<()> {
    let api_version = obj
        .api_version()
        .ok_or_else(|| Error::Invalid(format!("{}: missing apiVersion", kind)))?;
    let k = obj.kind().ok_or_else(|| Error::Invalid(format!("{}: missing kind", kind)))?;
    if api_version != kind.api_version() || k != kind.kind {
        return Err(Error::Invalid(format!(
            "{}: object declares {}/{} instead",
            kind, api_version, k
        )));
    }
    Ok(())
}

fn decode_strict<K: ResourceKind>(kind: &KindId, obj: &GenericObject) -> Result<K> {
    check_discriminators(kind, obj)?;
    let input = obj.to_value();
    let typed: K = serde_json::from_value(input.clone()).map_err(|e| invalid(kind, e))?;
    let encoded = serde_json::to_value(&typed).map_err(|e| encode_err(kind, e))?;
    reject_unknown(kind, &input, &encoded, "")?;
    Ok(typed)
}

fn reject_unknown(kind: &KindId, input: &Json, encoded: &Json, root: &str) -> Result<()> {
    let mut unknown = Vec::new();
    collect_unknown(input, encoded, root, &mut unknown);
    if unknown.is_empty() {
        return Ok(());
    }
    Err(Error::Invalid(format!("{}: unknown field(s): {}", kind, unknown.join(", "))))
}

/// Record every non-null field of `input` that is missing from `encoded`.
fn collect_unknown(input: &Json, encoded: &Json, path: &str, out: &mut Vec<String>) {
    match (input, encoded) {
        (Json::Object(i), Json::Object(e)) => {
            for (k, v) in i {
                if v.is_null() {
                    continue;
                }
                let p = if path.is_empty() { k.clone() } else { format!("{}.{}", path, k) };
                match e.get(k) {
                    Some(ev) => collect_unknown(v, ev, &p, out),
                    None => out.push(p),
                }
            }
        }
        (Json::Array(i), Json::Array(e)) => {
            for (idx, (iv, ev)) in i.iter().zip(e.iter()).enumerate() {
                collect_unknown(iv, ev, &format!("{}[{}]", path, idx), out);
            }
        }
        _ => {}
    }
}

fn invalid(kind: &KindId, e: serde_json::Error) -> Error {
    Error::Invalid(format!("{}: {}", kind, e))
}

fn encode_err(kind: &KindId, e: serde_json::Error) -> Error {
    Error::Invalid(format!("{}: encoding: {}", kind, e))
}
