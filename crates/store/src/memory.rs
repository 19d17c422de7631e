use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kubeclerk_core::{Error, GenericObject, InstanceId, KindId, ListOptions, Result};
use kubeclerk_schema::{TypeDescriptor, TypedObject};
use serde_json::{json, Value as Json};
use tracing::debug;
use uuid::Uuid;

use crate::{ObjectStore, ResourcePatch};

type Key = (KindId, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, GenericObject>,
    revision: u64,
}

impl State {
    /// Version the next committed write will carry.
    fn pending_revision(&self) -> String {
        (self.revision + 1).to_string()
    }

    fn commit(&mut self, key: Key, obj: GenericObject) {
        self.revision += 1;
        self.objects.insert(key, obj);
    }
}

/// Single-process store keeping objects as JSON. Each call holds the lock for
/// its whole duration.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects across all kinds.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| Error::Backend(anyhow::anyhow!("memory store lock poisoned")))
    }
}

fn key_of(kind: &KindId, id: &InstanceId) -> Key {
    (kind.clone(), id.namespace.clone(), id.name.clone())
}

fn identity(obj: &GenericObject) -> Result<InstanceId> {
    let name = obj.name().filter(|n| !n.is_empty()).ok_or_else(|| Error::Invalid("metadata.name is required".into()))?;
    Ok(InstanceId::namespaced(obj.namespace().unwrap_or(""), name))
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Validate through the descriptor and keep the normalized form.
fn admit(desc: &dyn TypeDescriptor, obj: &GenericObject) -> Result<(GenericObject, Box<dyn TypedObject>)> {
    let typed = desc.to_typed(obj)?;
    Ok((typed.to_generic()?, typed))
}

fn check_kind(desc: &dyn TypeDescriptor, obj: &dyn TypedObject) -> Result<KindId> {
    let kind = obj.kind_id();
    if &kind != desc.kind_id() {
        return Err(Error::Invalid(format!("object of kind {} passed with descriptor for {}", kind, desc.kind_id())));
    }
    Ok(kind)
}

fn stale(kind: &KindId, id: &InstanceId, given: &str) -> Error {
    Error::Conflict(format!(
        "{} \"{}\": the object has been modified; resourceVersion {} is stale",
        kind, id, given
    ))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create(&self, desc: &dyn TypeDescriptor, obj: &dyn TypedObject) -> Result<Box<dyn TypedObject>> {
        let kind = check_kind(desc, obj)?;
        let mut generic = obj.to_generic()?;
        let id = identity(&generic)?;
        let mut st = self.lock()?;
        let key = key_of(&kind, &id);
        if st.objects.contains_key(&key) {
            return Err(Error::AlreadyExists { kind, id });
        }
        if generic.uid().map_or(true, str::is_empty) {
            generic.set_uid(&Uuid::new_v4().to_string());
        }
        let rv = st.pending_revision();
        generic.set_resource_version(&rv);
        generic.set_creation_timestamp(&now());
        let (stored, typed) = admit(desc, &generic)?;
        st.commit(key, stored);
        debug!(kind = %kind, id = %id, rv = %rv, "created");
        Ok(typed)
    }

    async fn get(&self, desc: &dyn TypeDescriptor, id: &InstanceId) -> Result<Box<dyn TypedObject>> {
        let kind = desc.kind_id();
        let st = self.lock()?;
        let stored = st
            .objects
            .get(&key_of(kind, id))
            .ok_or_else(|| Error::NotFound { kind: kind.clone(), id: id.clone() })?;
        desc.to_typed(stored)
    }

    async fn list(&self, desc: &dyn TypeDescriptor, opts: &ListOptions) -> Result<Box<dyn TypedObject>> {
        let item = desc
            .item_kind()
            .ok_or_else(|| Error::Invalid(format!("{} is not a collection kind", desc.kind_id())))?;
        let st = self.lock()?;
        let items: Vec<Json> = st
            .objects
            .iter()
            .filter(|((k, _, _), obj)| k == item && opts.matches(obj))
            .map(|(_, obj)| obj.to_value())
            .collect();
        let list = GenericObject::try_from(json!({
            "apiVersion": desc.kind_id().api_version(),
            "kind": desc.kind_id().kind,
            "metadata": { "resourceVersion": st.revision.to_string() },
            "items": items,
        }))?;
        debug!(kind = %desc.kind_id(), count = items_len(&list), "listed");
        desc.to_typed(&list)
    }

    async fn update(&self, desc: &dyn TypeDescriptor, obj: &dyn TypedObject) -> Result<Box<dyn TypedObject>> {
        let kind = check_kind(desc, obj)?;
        let mut generic = obj.to_generic()?;
        let id = identity(&generic)?;
        let mut st = self.lock()?;
        let key = key_of(&kind, &id);
        let existing = st.objects.get(&key).ok_or_else(|| Error::NotFound { kind: kind.clone(), id: id.clone() })?;

        let given_uid = generic.uid().filter(|u| !u.is_empty()).map(str::to_string);
        let stored_uid = existing.uid().map(str::to_string);
        match (given_uid, stored_uid) {
            (Some(given), Some(stored)) if given != stored => {
                return Err(Error::Invalid(format!("{} \"{}\": metadata.uid is immutable", kind, id)));
            }
            (None, Some(stored)) => generic.set_uid(&stored),
            _ => {}
        }
        if let Some(given) = generic.resource_version().filter(|rv| !rv.is_empty()) {
            if Some(given) != existing.resource_version() {
                return Err(stale(&kind, &id, given));
            }
        }
        if let Some(ts) = existing.creation_timestamp().map(str::to_string) {
            generic.set_creation_timestamp(&ts);
        }

        let rv = st.pending_revision();
        generic.set_resource_version(&rv);
        let (stored, typed) = admit(desc, &generic)?;
        st.commit(key, stored);
        debug!(kind = %kind, id = %id, rv = %rv, "updated");
        Ok(typed)
    }

    async fn patch(
        &self,
        desc: &dyn TypeDescriptor,
        obj: &dyn TypedObject,
        patch: &ResourcePatch,
    ) -> Result<Box<dyn TypedObject>> {
        let kind = check_kind(desc, obj)?;
        let id = identity(&obj.to_generic()?)?;
        let mut st = self.lock()?;
        let key = key_of(&kind, &id);
        let existing = st.objects.get(&key).ok_or_else(|| Error::NotFound { kind: kind.clone(), id: id.clone() })?;

        let mut doc = existing.to_value();
        patch.apply(&mut doc, desc.merge_keys())?;
        let mut patched = GenericObject::try_from(doc)?;

        if patched.kind_id().as_ref() != Some(&kind) {
            return Err(Error::Invalid(format!("{} \"{}\": apiVersion and kind cannot be patched", kind, id)));
        }
        for (field, before, after) in [
            ("metadata.name", existing.name(), patched.name()),
            ("metadata.namespace", existing.namespace(), patched.namespace()),
            ("metadata.uid", existing.uid(), patched.uid()),
        ] {
            if before != after {
                return Err(Error::Invalid(format!("{} \"{}\": {} is immutable", kind, id, field)));
            }
        }
        if let Some(given) = patched.resource_version() {
            if Some(given) != existing.resource_version() {
                return Err(stale(&kind, &id, given));
            }
        }

        let rv = st.pending_revision();
        patched.set_resource_version(&rv);
        let (stored, typed) = admit(desc, &patched)?;
        st.commit(key, stored);
        debug!(kind = %kind, id = %id, rv = %rv, patch = %patch.kind(), "patched");
        Ok(typed)
    }

    async fn delete(&self, obj: &dyn TypedObject) -> Result<()> {
        let kind = obj.kind_id();
        let id = obj
            .instance_id()
            .filter(|id| !id.name.is_empty())
            .ok_or_else(|| Error::Invalid(format!("cannot delete {} without a name", kind)))?;
        let mut st = self.lock()?;
        match st.objects.remove(&key_of(&kind, &id)) {
            Some(_) => {
                debug!(kind = %kind, id = %id, "deleted");
                Ok(())
            }
            None => Err(Error::NotFound { kind, id }),
        }
    }
}

fn items_len(list: &GenericObject) -> usize {
    list.as_map().get("items").and_then(Json::as_array).map_or(0, Vec::len)
}
