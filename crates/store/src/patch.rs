//! Patch payloads and the engines that apply them to a JSON document.

use std::fmt;
use std::str::FromStr;

use kubeclerk_core::{Error, Result};
use kubeclerk_schema::MergeKeys;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

const PATCH_DIRECTIVE: &str = "$patch";

/// Patch semantics understood by every store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    /// RFC 7386 JSON merge patch.
    Merge,
    /// RFC 6902 JSON patch (operation list).
    Json,
    /// Kubernetes strategic merge patch.
    Strategic,
}

impl PatchKind {
    pub fn content_type(self) -> &'static str {
        match self {
            PatchKind::Merge => "application/merge-patch+json",
            PatchKind::Json => "application/json-patch+json",
            PatchKind::Strategic => "application/strategic-merge-patch+json",
        }
    }
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatchKind::Merge => "merge",
            PatchKind::Json => "json",
            PatchKind::Strategic => "strategic",
        })
    }
}

impl FromStr for PatchKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(PatchKind::Merge),
            "json" => Ok(PatchKind::Json),
            "strategic" => Ok(PatchKind::Strategic),
            other => Err(Error::Invalid(format!("unknown patch type '{}' (expect merge, json or strategic)", other))),
        }
    }
}

/// A decoded patch document.
#[derive(Debug, Clone)]
pub enum ResourcePatch {
    Merge(Json),
    Json(json_patch::Patch),
    Strategic(Json),
}

impl ResourcePatch {
    /// Decode a raw payload for the given patch kind.
    pub fn parse(kind: PatchKind, payload: &[u8]) -> Result<Self> {
        match kind {
            PatchKind::Merge => Ok(ResourcePatch::Merge(parse_object(kind, payload)?)),
            PatchKind::Strategic => Ok(ResourcePatch::Strategic(parse_object(kind, payload)?)),
            PatchKind::Json => serde_json::from_slice::<json_patch::Patch>(payload)
                .map(ResourcePatch::Json)
                .map_err(|e| Error::Invalid(format!("malformed json patch: {}", e))),
        }
    }

    pub fn kind(&self) -> PatchKind {
        match self {
            ResourcePatch::Merge(_) => PatchKind::Merge,
            ResourcePatch::Json(_) => PatchKind::Json,
            ResourcePatch::Strategic(_) => PatchKind::Strategic,
        }
    }

    /// Apply to `doc` in place. On error `doc` is left untouched.
    pub fn apply(&self, doc: &mut Json, merge_keys: Option<&MergeKeys>) -> Result<()> {
        match self {
            ResourcePatch::Merge(p) => {
                json_patch::merge(doc, p);
                Ok(())
            }
            ResourcePatch::Json(p) => {
                json_patch::patch(doc, p).map_err(|e| Error::Invalid(format!("json patch failed: {}", e)))
            }
            ResourcePatch::Strategic(p) => {
                let keys = merge_keys.ok_or_else(|| {
                    Error::Invalid("strategic merge patch requires a typed target with merge keys".into())
                })?;
                let mut work = doc.clone();
                strategic_merge(&mut work, p, keys)?;
                *doc = work;
                Ok(())
            }
        }
    }

    /// Body as sent on the wire.
    pub fn to_value(&self) -> Result<Json> {
        match self {
            ResourcePatch::Merge(p) | ResourcePatch::Strategic(p) => Ok(p.clone()),
            ResourcePatch::Json(p) => serde_json::to_value(p).map_err(|e| Error::Invalid(e.to_string())),
        }
    }
}

fn parse_object(kind: PatchKind, payload: &[u8]) -> Result<Json> {
    let value: Json =
        serde_json::from_slice(payload).map_err(|e| Error::Invalid(format!("malformed {} patch: {}", kind, e)))?;
    if !value.is_object() {
        return Err(Error::Invalid(format!("{} patch must be a JSON object", kind)));
    }
    Ok(value)
}

/// Strategic merge of `patch` into `target`.
///
/// Maps merge recursively and a `null` value deletes the key. A list whose
/// path has a merge key merges element-wise by that key; an element carrying
/// `"$patch": "delete"` removes its match. Lists without a merge key are
/// replaced. `"$patch": "replace"` on a map replaces it wholesale.
pub fn strategic_merge(target: &mut Json, patch: &Json, keys: &MergeKeys) -> Result<()> {
    merge_value(target, patch, keys, "")
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_string() } else { format!("{}.{}", path, key) }
}

fn merge_value(slot: &mut Json, patch: &Json, keys: &MergeKeys, path: &str) -> Result<()> {
    match patch {
        Json::Object(pm) => merge_map(slot, pm, keys, path),
        Json::Array(items) => match keys.get(path) {
            Some(key) => {
                if !slot.is_array() {
                    *slot = Json::Array(Vec::new());
                }
                if let Json::Array(current) = slot {
                    merge_list(current, items, key, keys, path)?;
                }
                Ok(())
            }
            None => {
                *slot = patch.clone();
                Ok(())
            }
        },
        _ => {
            *slot = patch.clone();
            Ok(())
        }
    }
}

fn merge_map(slot: &mut Json, pm: &Map<String, Json>, keys: &MergeKeys, path: &str) -> Result<()> {
    match pm.get(PATCH_DIRECTIVE) {
        None => {}
        Some(Json::String(d)) if d == "replace" => {
            let mut fresh = Json::Object(Map::new());
            let rest: Map<String, Json> =
                pm.iter().filter(|(k, _)| k.as_str() != PATCH_DIRECTIVE).map(|(k, v)| (k.clone(), v.clone())).collect();
            merge_map(&mut fresh, &rest, keys, path)?;
            *slot = fresh;
            return Ok(());
        }
        Some(other) => {
            return Err(Error::Invalid(format!("unsupported $patch directive {} at '{}'", other, path)));
        }
    }
    if !slot.is_object() {
        *slot = Json::Object(Map::new());
    }
    let Json::Object(current) = slot else {
        return Ok(());
    };
    for (k, pv) in pm {
        if k.starts_with('$') {
            return Err(Error::Invalid(format!("unsupported directive '{}' at '{}'", k, path)));
        }
        if pv.is_null() {
            current.remove(k);
            continue;
        }
        let child = join(path, k);
        let entry = current.entry(k.clone()).or_insert(Json::Null);
        merge_value(entry, pv, keys, &child)?;
    }
    Ok(())
}

fn merge_list(current: &mut Vec<Json>, items: &[Json], key: &str, keys: &MergeKeys, path: &str) -> Result<()> {
    for item in items {
        let Some(fields) = item.as_object() else {
            return Err(Error::Invalid(format!("element of '{}' must be an object keyed by '{}'", path, key)));
        };
        let Some(id) = fields.get(key).filter(|v| !v.is_null()) else {
            return Err(Error::Invalid(format!("element of '{}' lacks merge key '{}'", path, key)));
        };
        let pos = current.iter().position(|e| e.get(key) == Some(id));
        match fields.get(PATCH_DIRECTIVE).and_then(Json::as_str) {
            Some("delete") => {
                if let Some(i) = pos {
                    current.remove(i);
                }
            }
            Some("replace") | None => match pos {
                Some(i) => merge_value(&mut current[i], item, keys, path)?,
                None => {
                    let mut fresh = Json::Object(Map::new());
                    merge_value(&mut fresh, item, keys, path)?;
                    current.push(fresh);
                }
            },
            Some(other) => {
                return Err(Error::Invalid(format!("unsupported $patch directive '{}' in '{}'", other, path)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys() -> MergeKeys {
        MergeKeys::new()
            .with("spec.containers", "name")
            .with("spec.containers.env", "name")
            .with("metadata.ownerReferences", "uid")
    }

    fn pod() -> Json {
        json!({
            "metadata": { "name": "p", "labels": { "a": "1", "b": "2" } },
            "spec": {
                "containers": [
                    { "name": "app", "image": "app:1", "env": [ { "name": "X", "value": "1" } ] },
                    { "name": "sidecar", "image": "side:1" }
                ],
                "finalizers": ["x", "y"]
            }
        })
    }

    #[test]
    fn parse_rejects_malformed_payloads() {
        assert!(ResourcePatch::parse(PatchKind::Merge, b"{not json").unwrap_err().is_invalid());
        assert!(ResourcePatch::parse(PatchKind::Merge, b"[1]").unwrap_err().is_invalid());
        assert!(ResourcePatch::parse(PatchKind::Json, br#"{"op":"add"}"#).unwrap_err().is_invalid());
        assert!(ResourcePatch::parse(PatchKind::Json, br#"[{"op":"frobnicate","path":"/a"}]"#).unwrap_err().is_invalid());
        let p = ResourcePatch::parse(PatchKind::Json, br#"[{"op":"remove","path":"/a"}]"#).unwrap();
        assert_eq!(p.kind(), PatchKind::Json);
        assert!("bogus".parse::<PatchKind>().unwrap_err().is_invalid());
        assert_eq!("Strategic".parse::<PatchKind>().unwrap(), PatchKind::Strategic);
    }

    #[test]
    fn merge_patch_sets_and_deletes() {
        let mut doc = pod();
        let p = ResourcePatch::parse(PatchKind::Merge, br#"{"metadata":{"labels":{"a":null,"c":"3"}}}"#).unwrap();
        p.apply(&mut doc, None).unwrap();
        assert_eq!(doc["metadata"]["labels"], json!({ "b": "2", "c": "3" }));
    }

    #[test]
    fn json_patch_is_all_or_nothing() {
        let mut doc = pod();
        let before = doc.clone();
        let p = ResourcePatch::parse(
            PatchKind::Json,
            br#"[{"op":"add","path":"/metadata/labels/c","value":"3"},{"op":"remove","path":"/metadata/missing"}]"#,
        )
        .unwrap();
        assert!(p.apply(&mut doc, None).unwrap_err().is_invalid());
        assert_eq!(doc, before);
    }

    #[test]
    fn strategic_merges_lists_by_key() {
        let mut doc = pod();
        let patch = json!({
            "spec": {
                "containers": [
                    { "name": "app", "image": "app:2", "env": [ { "name": "Y", "value": "2" } ] },
                    { "name": "new", "image": "new:1" }
                ],
                "finalizers": ["z"]
            }
        });
        ResourcePatch::Strategic(patch).apply(&mut doc, Some(&keys())).unwrap();
        let containers = doc["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 3);
        assert_eq!(containers[0]["image"], "app:2");
        assert_eq!(containers[0]["env"].as_array().unwrap().len(), 2);
        assert_eq!(containers[2]["name"], "new");
        assert_eq!(doc["spec"]["finalizers"], json!(["z"]));
    }

    #[test]
    fn strategic_delete_directive_removes_element() {
        let mut doc = pod();
        let patch = json!({ "spec": { "containers": [ { "name": "sidecar", "$patch": "delete" } ] } });
        strategic_merge(&mut doc, &patch, &keys()).unwrap();
        let names: Vec<_> = doc["spec"]["containers"].as_array().unwrap().iter().map(|c| c["name"].clone()).collect();
        assert_eq!(names, vec![json!("app")]);
    }

    #[test]
    fn strategic_requires_merge_keys_and_keyed_elements() {
        let mut doc = pod();
        let before = doc.clone();
        let p = ResourcePatch::Strategic(json!({ "spec": { "containers": [ { "image": "nokey" } ] } }));
        assert!(p.apply(&mut doc, None).unwrap_err().is_invalid());
        assert!(p.apply(&mut doc, Some(&keys())).unwrap_err().is_invalid());
        assert_eq!(doc, before);
    }

    #[test]
    fn strategic_replace_directive_on_map() {
        let mut doc = pod();
        let patch = json!({ "metadata": { "labels": { "$patch": "replace", "only": "x" } } });
        strategic_merge(&mut doc, &patch, &keys()).unwrap();
        assert_eq!(doc["metadata"]["labels"], json!({ "only": "x" }));
    }

    #[test]
    fn strategic_map_delete_is_rejected_and_scalar_lists_replace() {
        let mut doc = pod();
        let before = doc.clone();
        let p = ResourcePatch::Strategic(json!({ "metadata": { "labels": { "$patch": "delete" } } }));
        assert!(p.apply(&mut doc, Some(&keys())).unwrap_err().is_invalid());
        assert_eq!(doc, before);

        doc["metadata"]["finalizers"] = json!(["a", "b"]);
        let p = ResourcePatch::Strategic(json!({ "metadata": { "finalizers": ["c"] } }));
        p.apply(&mut doc, Some(&keys())).unwrap();
        assert_eq!(doc["metadata"]["finalizers"], json!(["c"]));
    }
}
