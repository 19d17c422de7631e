//! Kubeclerk kubehub: discovery and the live-cluster store.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, ErrorResponse},
    discovery::{Discovery, Scope},
    Client,
};
use kubeclerk_core::{Error, GenericObject, InstanceId, KindId, ListOptions, Result};
use kubeclerk_schema::{TypeDescriptor, TypedObject};
use kubeclerk_store::{ObjectStore, ResourcePatch};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

const DEFAULT_FIELD_MANAGER: &str = "kubeclerk";

fn field_manager_from_env() -> String {
    std::env::var("KUBECLERK_FIELD_MANAGER")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub kind: KindId,
    pub namespaced: bool,
}

/// Kinds served by the cluster, sorted by group, version and kind.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await.map_err(backend)?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                kind: KindId::new(ar.group.clone(), ar.version.clone(), ar.kind.clone()),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.kind.cmp(&b.kind));
    Ok(out)
}

fn backend(err: kube::Error) -> Error {
    Error::Backend(anyhow::Error::new(err))
}

/// Translate a kube client error into the kubeclerk error taxonomy.
pub fn map_kube_error(kind: &KindId, id: Option<&InstanceId>, err: kube::Error) -> Error {
    let mapped = match err {
        kube::Error::Api(ErrorResponse { code, reason, message, .. }) => match (code, id) {
            (404, Some(id)) => Error::NotFound { kind: kind.clone(), id: id.clone() },
            (409, Some(id)) if reason == "AlreadyExists" => Error::AlreadyExists { kind: kind.clone(), id: id.clone() },
            (409, _) => Error::Conflict(message),
            (400 | 422, _) => Error::Invalid(message),
            _ => Error::Backend(anyhow::anyhow!("{} {}: {} ({})", kind, code, message, reason)),
        },
        other => backend(other),
    };
    counter!("kubeclerk_kube_api_errors_total", 1u64, "reason" => mapped.reason());
    mapped
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Generic form of an object read from the cluster. List items arrive
/// without `apiVersion`/`kind`, so they are stamped from `kind`.
fn from_dynamic(kind: &KindId, obj: &DynamicObject) -> Result<GenericObject> {
    let mut raw = serde_json::to_value(obj).map_err(|e| Error::Backend(anyhow::Error::new(e)))?;
    strip_managed_fields(&mut raw);
    let mut generic = GenericObject::try_from(raw)?;
    generic.set_kind_id(kind);
    Ok(generic)
}

fn to_dynamic(obj: &dyn TypedObject) -> Result<DynamicObject> {
    let value = obj.to_generic()?.into_value();
    serde_json::from_value(value).map_err(|e| Error::Invalid(format!("{}: {}", obj.kind_id(), e)))
}

fn require_id(obj: &dyn TypedObject) -> Result<InstanceId> {
    obj.instance_id()
        .filter(|id| !id.name.is_empty())
        .ok_or_else(|| Error::Invalid(format!("{}: metadata.name is required", obj.kind_id())))
}

/// Store talking to a Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: field_manager_from_env() }
    }

    /// Connect using the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(backend)?;
        info!("connected to cluster");
        Ok(Self::new(client))
    }

    pub fn with_field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = manager.into();
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, desc: &dyn TypeDescriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = desc.api_resource();
        if !desc.namespaced() {
            return Api::all_with(self.client.clone(), &ar);
        }
        match namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::default_namespaced_with(self.client.clone(), &ar),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams { field_manager: Some(self.field_manager.clone()), ..PostParams::default() }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn create(&self, desc: &dyn TypeDescriptor, obj: &dyn TypedObject) -> Result<Box<dyn TypedObject>> {
        let kind = desc.kind_id();
        let id = require_id(obj)?;
        let api = self.api(desc, id.namespace());
        let created = api
            .create(&self.post_params(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_error(kind, Some(&id), e))?;
        debug!(kind = %kind, id = %id, "created on cluster");
        desc.to_typed(&from_dynamic(kind, &created)?)
    }

    async fn get(&self, desc: &dyn TypeDescriptor, id: &InstanceId) -> Result<Box<dyn TypedObject>> {
        let kind = desc.kind_id();
        let obj = self
            .api(desc, id.namespace())
            .get(&id.name)
            .await
            .map_err(|e| map_kube_error(kind, Some(id), e))?;
        desc.to_typed(&from_dynamic(kind, &obj)?)
    }

    async fn list(&self, desc: &dyn TypeDescriptor, opts: &ListOptions) -> Result<Box<dyn TypedObject>> {
        let kind = desc.kind_id();
        let item = desc
            .item_kind()
            .ok_or_else(|| Error::Invalid(format!("{} is not a collection kind", kind)))?;
        let api = match opts.namespace.as_deref() {
            Some(ns) if desc.namespaced() => self.api(desc, Some(ns)),
            _ => Api::all_with(self.client.clone(), &desc.api_resource()),
        };
        let mut lp = ListParams::default();
        if !opts.label_selector.is_empty() {
            lp = lp.labels(&opts.label_selector.to_string());
        }
        let list = api.list(&lp).await.map_err(|e| map_kube_error(kind, None, e))?;
        let mut items = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            items.push(from_dynamic(item, obj)?.into_value());
        }
        let metadata = serde_json::to_value(&list.metadata).map_err(|e| Error::Backend(anyhow::Error::new(e)))?;
        let generic = GenericObject::try_from(serde_json::json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind,
            "metadata": metadata,
            "items": items,
        }))?;
        debug!(kind = %kind, count = list.items.len(), "listed from cluster");
        desc.to_typed(&generic)
    }

    async fn update(&self, desc: &dyn TypeDescriptor, obj: &dyn TypedObject) -> Result<Box<dyn TypedObject>> {
        let kind = desc.kind_id();
        let id = require_id(obj)?;
        let replaced = self
            .api(desc, id.namespace())
            .replace(&id.name, &self.post_params(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_error(kind, Some(&id), e))?;
        debug!(kind = %kind, id = %id, "replaced on cluster");
        desc.to_typed(&from_dynamic(kind, &replaced)?)
    }

    async fn patch(
        &self,
        desc: &dyn TypeDescriptor,
        obj: &dyn TypedObject,
        patch: &ResourcePatch,
    ) -> Result<Box<dyn TypedObject>> {
        let kind = desc.kind_id();
        let id = require_id(obj)?;
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..PatchParams::default() };
        let body = match patch {
            ResourcePatch::Merge(v) => Patch::Merge(v.clone()),
            ResourcePatch::Json(p) => Patch::Json(p.clone()),
            ResourcePatch::Strategic(v) => Patch::Strategic(v.clone()),
        };
        let patched = self
            .api(desc, id.namespace())
            .patch(&id.name, &pp, &body)
            .await
            .map_err(|e| map_kube_error(kind, Some(&id), e))?;
        debug!(kind = %kind, id = %id, patch = %patch.kind(), "patched on cluster");
        desc.to_typed(&from_dynamic(kind, &patched)?)
    }

    async fn delete(&self, obj: &dyn TypedObject) -> Result<()> {
        let kind = obj.kind_id();
        let id = require_id(obj)?;
        let ar = kube::core::ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind));
        let api: Api<DynamicObject> = match id.namespace() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        api.delete(&id.name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(&kind, Some(&id), e))?;
        debug!(kind = %kind, id = %id, "deleted on cluster");
        Ok(())
    }
}
