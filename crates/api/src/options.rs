//! Context construction and environment-driven settings.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use kubeclerk_core::{Error, Result};
use kubeclerk_schema::Registry;
use kubeclerk_store::{MemoryStore, ObjectStore};
use tracing::debug;

use crate::{GarbageCollector, NaiveGc, ResourceContext};

/// Collector installed by default alongside the in-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcMode {
    #[default]
    Naive,
    Off,
}

impl GcMode {
    /// Read `KUBECLERK_GC`; unset or unparsable values fall back to `naive`.
    pub fn from_env() -> Self {
        std::env::var("KUBECLERK_GC").ok().and_then(|s| s.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for GcMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "naive" | "on" => Ok(GcMode::Naive),
            "off" | "none" => Ok(GcMode::Off),
            other => Err(Error::Invalid(format!("unknown gc mode '{}' (expect naive or off)", other))),
        }
    }
}

impl fmt::Display for GcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcMode::Naive => "naive",
            GcMode::Off => "off",
        })
    }
}

#[derive(Default)]
enum GcChoice {
    #[default]
    Unset,
    Set(Arc<dyn GarbageCollector>),
    Disabled,
}

/// Builder for [`ResourceContext`].
#[derive(Default)]
pub struct ContextBuilder {
    registry: Option<Arc<Registry>>,
    store: Option<Arc<dyn ObjectStore>>,
    gc: GcChoice,
    gc_mode: Option<GcMode>,
    memory: bool,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry used for kind resolution; the built-in one when unset.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self.memory = false;
        self
    }

    /// Use a fresh [`MemoryStore`] with `registry`. Unless a collector is set
    /// or disabled explicitly, the naive collector is installed as well.
    pub fn with_memory_store(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self.store = Some(Arc::new(MemoryStore::new()));
        self.memory = true;
        self
    }

    pub fn with_garbage_collector(mut self, gc: Arc<dyn GarbageCollector>) -> Self {
        self.gc = GcChoice::Set(gc);
        self
    }

    pub fn without_garbage_collector(mut self) -> Self {
        self.gc = GcChoice::Disabled;
        self
    }

    /// Override `KUBECLERK_GC` for the in-memory default.
    pub fn with_gc_mode(mut self, mode: GcMode) -> Self {
        self.gc_mode = Some(mode);
        self
    }

    pub fn build(self) -> Result<ResourceContext> {
        let store = self.store.ok_or_else(|| Error::Invalid("store must be configured".into()))?;
        let registry = self.registry.unwrap_or_else(|| Arc::new(Registry::builtin()));
        let gc: Option<Arc<dyn GarbageCollector>> = match self.gc {
            GcChoice::Set(gc) => Some(gc),
            GcChoice::Disabled => None,
            GcChoice::Unset if self.memory => match self.gc_mode.unwrap_or_else(GcMode::from_env) {
                GcMode::Naive => Some(Arc::new(NaiveGc)),
                GcMode::Off => None,
            },
            GcChoice::Unset => None,
        };
        debug!(kinds = registry.len(), memory = self.memory, gc = gc.is_some(), "context built");
        Ok(ResourceContext::from_parts(registry, store, gc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_a_store() {
        let err = ContextBuilder::new().build().err().map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("invalid: store must be configured"));
    }

    #[test]
    fn memory_store_gets_naive_gc_unless_told_otherwise() {
        let reg = Arc::new(Registry::builtin());
        let ctx = ContextBuilder::new().with_memory_store(reg.clone()).with_gc_mode(GcMode::Naive).build().unwrap();
        assert!(ctx.garbage_collector().is_some());

        let ctx = ContextBuilder::new().with_memory_store(reg.clone()).with_gc_mode(GcMode::Off).build().unwrap();
        assert!(ctx.garbage_collector().is_none());

        let ctx = ContextBuilder::new().with_memory_store(reg.clone()).without_garbage_collector().build().unwrap();
        assert!(ctx.garbage_collector().is_none());

        let ctx = ContextBuilder::new().with_store(Arc::new(MemoryStore::new())).build().unwrap();
        assert!(ctx.garbage_collector().is_none());
        assert_eq!(ctx.registry().len(), reg.len());
    }

    #[test]
    fn gc_mode_parses() {
        assert_eq!("Naive".parse::<GcMode>().unwrap(), GcMode::Naive);
        assert_eq!("off".parse::<GcMode>().unwrap(), GcMode::Off);
        assert!("sometimes".parse::<GcMode>().unwrap_err().is_invalid());
    }
}
