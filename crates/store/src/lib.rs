//! Kubeclerk store: the backing-store capability every facade talks to, the
//! patch engines, and an in-process implementation.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kubeclerk_core::{InstanceId, ListOptions, Result};
use kubeclerk_schema::{TypeDescriptor, TypedObject};

mod memory;
pub mod patch;

pub use memory::MemoryStore;
pub use patch::{strategic_merge, PatchKind, ResourcePatch};

/// Persistence behind the resource facade. Writes hand back the object as
/// persisted, with server-assigned fields filled in.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create(&self, desc: &dyn TypeDescriptor, obj: &dyn TypedObject) -> Result<Box<dyn TypedObject>>;

    async fn get(&self, desc: &dyn TypeDescriptor, id: &InstanceId) -> Result<Box<dyn TypedObject>>;

    /// `desc` describes the collection kind; the result is an instance of it.
    async fn list(&self, desc: &dyn TypeDescriptor, opts: &ListOptions) -> Result<Box<dyn TypedObject>>;

    async fn update(&self, desc: &dyn TypeDescriptor, obj: &dyn TypedObject) -> Result<Box<dyn TypedObject>>;

    /// Patch the stored object identified by `obj`.
    async fn patch(
        &self,
        desc: &dyn TypeDescriptor,
        obj: &dyn TypedObject,
        patch: &ResourcePatch,
    ) -> Result<Box<dyn TypedObject>>;

    async fn delete(&self, obj: &dyn TypedObject) -> Result<()>;
}
