//! Kubeclerk resource facade.
//!
//! Create, read, list, update, patch and delete objects addressed by a kind
//! identifier and an instance identifier, converting through the registry's
//! typed descriptors before anything reaches the backing store. Deletion can
//! trigger a cascading sweep of owned children.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kubeclerk_core::{escape_json_pointer, Error, GenericObject, InstanceId, KindId, ListOptions, Result};
use kubeclerk_schema::{Registry, TypeDescriptor, TypedObject};
use kubeclerk_store::{ObjectStore, PatchKind, ResourcePatch};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::debug;
use uuid::Uuid;

pub mod gc;
pub mod options;

pub use gc::{is_sweepable, naive_gc, GarbageCollector, NaiveGc, SweepReport};
pub use options::{ContextBuilder, GcMode};

pub mod prelude {
    pub use super::{ContextBuilder, GarbageCollector, GcMode, NaiveGc, ResourceContext};
    pub use kubeclerk_core::prelude::*;
    pub use kubeclerk_store::{PatchKind, ResourcePatch};
}

/// Entry point for every resource operation. Holds the registry, the backing
/// store and the optional garbage collector run after deletes.
#[derive(Clone)]
pub struct ResourceContext {
    registry: Arc<Registry>,
    store: Arc<dyn ObjectStore>,
    gc: Option<Arc<dyn GarbageCollector>>,
}

fn record<T>(op: &'static str, kind: &KindId, started: Instant, res: &Result<T>) {
    counter!("kubeclerk_ops_total", 1u64, "op" => op);
    match res {
        Ok(_) => debug!(op, kind = %kind, took_ms = %started.elapsed().as_millis(), "api: ok"),
        Err(e) => {
            counter!("kubeclerk_op_errors_total", 1u64, "op" => op, "reason" => e.reason());
            debug!(op, kind = %kind, error = %e, "api: failed");
        }
    }
}

/// Stamp the addressing fields onto a caller-supplied object.
fn stamp(obj: &mut GenericObject, kind: &KindId, id: &InstanceId) {
    obj.set_kind_id(kind);
    obj.set_name(&id.name);
    obj.set_namespace(&id.namespace);
}

fn collect_items(list: &dyn TypedObject) -> Result<Vec<GenericObject>> {
    list.items()
        .unwrap_or_default()
        .into_iter()
        .map(|item| item.to_generic())
        .collect()
}

fn json_patch(ops: Json) -> Result<ResourcePatch> {
    let payload = serde_json::to_vec(&ops).map_err(|e| Error::Invalid(e.to_string()))?;
    ResourcePatch::parse(PatchKind::Json, &payload)
}

impl ResourceContext {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub(crate) fn from_parts(
        registry: Arc<Registry>,
        store: Arc<dyn ObjectStore>,
        gc: Option<Arc<dyn GarbageCollector>>,
    ) -> Self {
        Self { registry, store, gc }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn garbage_collector(&self) -> Option<&Arc<dyn GarbageCollector>> {
        self.gc.as_ref()
    }

    /// Descriptor of the collection kind for `kind`. `kind` may name either
    /// the singular kind or the collection itself.
    fn collection_descriptor(&self, kind: &KindId) -> Result<Arc<dyn TypeDescriptor>> {
        let list_kind = if kind.is_collection() && self.registry.contains(kind) { kind.clone() } else { kind.list_kind() };
        self.registry.resolve(&list_kind).map_err(|_| Error::NotRegistered(kind.clone()))
    }

    /// Persist a new object. The facade always assigns a fresh uid.
    pub async fn create(&self, kind: &KindId, id: &InstanceId, mut obj: GenericObject) -> Result<GenericObject> {
        let started = Instant::now();
        let res: Result<GenericObject> = async {
            stamp(&mut obj, kind, id);
            obj.set_uid(&Uuid::new_v4().to_string());
            let desc = self.registry.resolve(kind)?;
            let typed = desc.to_typed(&obj)?;
            self.store.create(desc.as_ref(), typed.as_ref()).await?.to_generic()
        }
        .await;
        record("create", kind, started, &res);
        res
    }

    pub async fn get(&self, kind: &KindId, id: &InstanceId) -> Result<GenericObject> {
        let started = Instant::now();
        let res: Result<GenericObject> = async {
            let desc = self.registry.resolve(kind)?;
            self.store.get(desc.as_ref(), id).await?.to_generic()
        }
        .await;
        record("get", kind, started, &res);
        res
    }

    /// Every object of `kind` matching `opts`, in store order.
    pub async fn list(&self, kind: &KindId, opts: &ListOptions) -> Result<Vec<GenericObject>> {
        let started = Instant::now();
        let res: Result<Vec<GenericObject>> = async {
            let desc = self.collection_descriptor(kind)?;
            let list = self.store.list(desc.as_ref(), opts).await?;
            collect_items(list.as_ref())
        }
        .await;
        record("list", kind, started, &res);
        res
    }

    pub async fn count(&self, kind: &KindId, opts: &ListOptions) -> Result<usize> {
        Ok(self.list(kind, opts).await?.len())
    }

    /// Replace the stored object. The uid is kept from the store.
    pub async fn update(&self, kind: &KindId, id: &InstanceId, mut obj: GenericObject) -> Result<GenericObject> {
        let started = Instant::now();
        let res: Result<GenericObject> = async {
            stamp(&mut obj, kind, id);
            let desc = self.registry.resolve(kind)?;
            let typed = desc.to_typed(&obj)?;
            self.store.update(desc.as_ref(), typed.as_ref()).await?.to_generic()
        }
        .await;
        record("update", kind, started, &res);
        res
    }

    pub async fn patch(&self, kind: &KindId, id: &InstanceId, patch: &ResourcePatch) -> Result<GenericObject> {
        let started = Instant::now();
        let res: Result<GenericObject> = async {
            let desc = self.registry.resolve(kind)?;
            let current = self.store.get(desc.as_ref(), id).await?;
            self.store.patch(desc.as_ref(), current.as_ref(), patch).await?.to_generic()
        }
        .await;
        record("patch", kind, started, &res);
        res
    }

    /// Decode `payload` as a `patch_kind` patch and apply it.
    pub async fn patch_raw(
        &self,
        kind: &KindId,
        id: &InstanceId,
        patch_kind: PatchKind,
        payload: &[u8],
    ) -> Result<GenericObject> {
        let patch = ResourcePatch::parse(patch_kind, payload)?;
        self.patch(kind, id, &patch).await
    }

    /// Remove an object and, when a collector is configured, sweep its
    /// children. A collector failure is returned even though the object is
    /// already gone.
    pub async fn delete(&self, kind: &KindId, id: &InstanceId) -> Result<GenericObject> {
        let removed = self.delete_without_gc(kind, id).await?;
        if let Some(gc) = &self.gc {
            gc.collect(self, &removed).await?;
        }
        Ok(removed)
    }

    pub async fn delete_without_gc(&self, kind: &KindId, id: &InstanceId) -> Result<GenericObject> {
        let started = Instant::now();
        let res: Result<GenericObject> = async {
            let desc = self.registry.resolve(kind)?;
            let current = self.store.get(desc.as_ref(), id).await?;
            let removed = current.to_generic()?;
            self.store.delete(current.as_ref()).await?;
            Ok(removed)
        }
        .await;
        record("delete", kind, started, &res);
        res
    }

    /// Value at a dotted field path of a stored object.
    pub async fn field(&self, kind: &KindId, id: &InstanceId, path: &str) -> Result<Option<Json>> {
        Ok(self.get(kind, id).await?.field(path).cloned())
    }

    pub async fn label(&self, kind: &KindId, id: &InstanceId, key: &str, value: &str) -> Result<GenericObject> {
        let patch = ResourcePatch::Merge(json!({ "metadata": { "labels": { key: value } } }));
        self.patch(kind, id, &patch).await
    }

    pub async fn annotate(&self, kind: &KindId, id: &InstanceId, key: &str, value: &str) -> Result<GenericObject> {
        let patch = ResourcePatch::Merge(json!({ "metadata": { "annotations": { key: value } } }));
        self.patch(kind, id, &patch).await
    }

    pub async fn remove_label(&self, kind: &KindId, id: &InstanceId, key: &str) -> Result<GenericObject> {
        self.meta_entry_op(kind, id, "remove", "labels", key, None).await
    }

    pub async fn remove_annotation(&self, kind: &KindId, id: &InstanceId, key: &str) -> Result<GenericObject> {
        self.meta_entry_op(kind, id, "remove", "annotations", key, None).await
    }

    /// Change an existing label; `Invalid` when the label is absent.
    pub async fn update_label(&self, kind: &KindId, id: &InstanceId, key: &str, value: &str) -> Result<GenericObject> {
        self.meta_entry_op(kind, id, "replace", "labels", key, Some(value)).await
    }

    /// Change an existing annotation; `Invalid` when the annotation is absent.
    pub async fn update_annotation(
        &self,
        kind: &KindId,
        id: &InstanceId,
        key: &str,
        value: &str,
    ) -> Result<GenericObject> {
        self.meta_entry_op(kind, id, "replace", "annotations", key, Some(value)).await
    }

    async fn meta_entry_op(
        &self,
        kind: &KindId,
        id: &InstanceId,
        op: &str,
        map: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<GenericObject> {
        let path = format!("/metadata/{}/{}", map, escape_json_pointer(key));
        let mut operation = json!({ "op": op, "path": path });
        if let (Some(v), Some(fields)) = (value, operation.as_object_mut()) {
            fields.insert("value".into(), Json::String(v.to_string()));
        }
        let patch = json_patch(Json::Array(vec![operation]))?;
        self.patch(kind, id, &patch).await
    }

    /// Whether two objects of `kind` match once metadata is ignored.
    pub async fn is_similar(&self, kind: &KindId, a: &InstanceId, b: &InstanceId) -> Result<bool> {
        let (a, b) = (self.get(kind, a).await?, self.get(kind, b).await?);
        Ok(a.without_metadata() == b.without_metadata())
    }

    /// Whether two objects of `kind` match once identity and store-assigned
    /// metadata are ignored.
    pub async fn is_equal(&self, kind: &KindId, a: &InstanceId, b: &InstanceId) -> Result<bool> {
        let (a, b) = (self.get(kind, a).await?, self.get(kind, b).await?);
        Ok(a.without_unique_fields() == b.without_unique_fields())
    }
}
