//! Generic (schema-less) object representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{Error, KindId, Result};

/// Back-reference from a child object to its owner. Drives cascading deletion
/// only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

const UNIQUE_META_FIELDS: [&str; 7] =
    ["name", "namespace", "uid", "resourceVersion", "creationTimestamp", "generation", "managedFields"];

/// A JSON object tree carrying well-known Kubernetes metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct GenericObject {
    object: Map<String, Json>,
}

impl GenericObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(object: Map<String, Json>) -> Self {
        Self { object }
    }

    pub fn as_map(&self) -> &Map<String, Json> {
        &self.object
    }

    pub fn into_map(self) -> Map<String, Json> {
        self.object
    }

    pub fn to_value(&self) -> Json {
        Json::Object(self.object.clone())
    }

    pub fn into_value(self) -> Json {
        Json::Object(self.object)
    }

    pub fn api_version(&self) -> Option<&str> {
        self.object.get("apiVersion").and_then(Json::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.object.get("kind").and_then(Json::as_str)
    }

    /// Kind identifier derived from `apiVersion`/`kind`, if both are set.
    pub fn kind_id(&self) -> Option<KindId> {
        Some(KindId::from_api_version(self.api_version()?, self.kind()?))
    }

    pub fn set_kind_id(&mut self, kind: &KindId) {
        self.object.insert("apiVersion".into(), Json::String(kind.api_version()));
        self.object.insert("kind".into(), Json::String(kind.kind.clone()));
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.object.get("metadata")?.get(key)?.as_str()
    }

    /// Run `f` on `metadata`, replacing a missing or non-object value first.
    fn with_meta(&mut self, f: impl FnOnce(&mut Map<String, Json>)) {
        match self.object.get_mut("metadata") {
            Some(Json::Object(meta)) => f(meta),
            _ => {
                let mut meta = Map::new();
                f(&mut meta);
                self.object.insert("metadata".into(), Json::Object(meta));
            }
        }
    }

    fn set_meta_str(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            if let Some(Json::Object(meta)) = self.object.get_mut("metadata") {
                meta.remove(key);
            }
            return;
        }
        self.with_meta(|meta| {
            meta.insert(key.into(), Json::String(value.to_string()));
        });
    }

    pub fn name(&self) -> Option<&str> { self.meta_str("name") }
    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace") }
    pub fn uid(&self) -> Option<&str> { self.meta_str("uid") }
    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }

    /// An empty value removes the field.
    pub fn set_name(&mut self, name: &str) { self.set_meta_str("name", name) }
    pub fn set_namespace(&mut self, namespace: &str) { self.set_meta_str("namespace", namespace) }
    pub fn set_uid(&mut self, uid: &str) { self.set_meta_str("uid", uid) }
    pub fn set_resource_version(&mut self, rv: &str) { self.set_meta_str("resourceVersion", rv) }

    pub fn creation_timestamp(&self) -> Option<&str> { self.meta_str("creationTimestamp") }
    pub fn set_creation_timestamp(&mut self, ts: &str) { self.set_meta_str("creationTimestamp", ts) }

    fn string_map(&self, key: &str) -> BTreeMap<String, String> {
        self.object
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(Json::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set_string_entry(&mut self, key: &str, k: &str, v: &str) {
        self.with_meta(|meta| match meta.get_mut(key) {
            Some(Json::Object(m)) => {
                m.insert(k.into(), Json::String(v.to_string()));
            }
            _ => {
                let mut m = Map::new();
                m.insert(k.into(), Json::String(v.to_string()));
                meta.insert(key.into(), Json::Object(m));
            }
        });
    }

    pub fn labels(&self) -> BTreeMap<String, String> { self.string_map("labels") }
    pub fn annotations(&self) -> BTreeMap<String, String> { self.string_map("annotations") }
    pub fn set_label(&mut self, key: &str, value: &str) { self.set_string_entry("labels", key, value) }
    pub fn set_annotation(&mut self, key: &str, value: &str) { self.set_string_entry("annotations", key, value) }

    /// Owner references; entries that are not well-formed are skipped.
    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.object
            .get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(Json::as_array)
            .map(|refs| refs.iter().filter_map(|r| serde_json::from_value(r.clone()).ok()).collect())
            .unwrap_or_default()
    }

    pub fn set_owner_references(&mut self, refs: &[OwnerReference]) -> Result<()> {
        let value = serde_json::to_value(refs).map_err(|e| Error::Invalid(format!("owner references: {}", e)))?;
        self.with_meta(|meta| {
            meta.insert("ownerReferences".into(), value);
        });
        Ok(())
    }

    /// Look up a field by dotted path with optional `[index]` segments,
    /// e.g. `spec.ports[0].port` or `metadata.labels.app`.
    pub fn field(&self, path: &str) -> Option<&Json> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let (key, idx) = split_index(first)?;
        let mut cur = self.object.get(key)?;
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
        for seg in segments {
            let (key, idx) = split_index(seg)?;
            cur = cur.as_object()?.get(key)?;
            if let Some(i) = idx {
                cur = cur.as_array()?.get(i)?;
            }
        }
        Some(cur)
    }

    /// Copy without the `metadata` field.
    pub fn without_metadata(&self) -> GenericObject {
        let mut object = self.object.clone();
        object.remove("metadata");
        Self { object }
    }

    /// Copy without the fields that identify one instance or are assigned by
    /// the store (name, namespace, uid, resourceVersion, creationTimestamp,
    /// generation, managedFields).
    pub fn without_unique_fields(&self) -> GenericObject {
        let mut out = self.clone();
        if let Some(Json::Object(meta)) = out.object.get_mut("metadata") {
            for key in UNIQUE_META_FIELDS {
                meta.remove(key);
            }
        }
        out
    }
}

impl TryFrom<Json> for GenericObject {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self> {
        match value {
            Json::Object(object) => Ok(Self { object }),
            other => Err(Error::Invalid(format!("expected a JSON object, got {}", json_type(&other)))),
        }
    }
}

impl From<GenericObject> for Json {
    fn from(obj: GenericObject) -> Self {
        obj.into_value()
    }
}

fn split_index(seg: &str) -> Option<(&str, Option<usize>)> {
    if seg.is_empty() {
        return None;
    }
    match seg.find('[') {
        Some(brk) => {
            let end = seg.get(brk + 1..)?.find(']')? + brk + 1;
            let idx: usize = seg[brk + 1..end].parse().ok()?;
            Some((&seg[..brk], Some(idx)))
        }
        None => Some((seg, None)),
    }
}

pub(crate) fn json_type(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Escape a map key for use as a JSON Pointer segment (`~` -> `~0`, `/` -> `~1`).
pub fn escape_json_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
