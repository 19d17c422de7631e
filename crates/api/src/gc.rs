//! Cascading deletion of objects owned by a removed parent.

use std::time::Instant;

use async_trait::async_trait;
use kubeclerk_core::{Error, GenericObject, KindId, ListOptions, Result, LIST_SUFFIX};
use kubeclerk_schema::TypedObject;
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ResourceContext;

/// Hook run by [`ResourceContext::delete`] with the object just removed.
#[async_trait]
pub trait GarbageCollector: Send + Sync {
    async fn collect(&self, ctx: &ResourceContext, owner: &GenericObject) -> Result<SweepReport>;
}

/// Single-pass sweep over every registered collection kind. See [`naive_gc`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveGc;

#[async_trait]
impl GarbageCollector for NaiveGc {
    async fn collect(&self, ctx: &ResourceContext, owner: &GenericObject) -> Result<SweepReport> {
        naive_gc(ctx, owner).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Collection kinds listed, in visiting order.
    pub kinds_visited: Vec<KindId>,
    /// Children removed.
    pub deleted: usize,
}

/// Whether the sweep lists `kind`: a real per-namespace collection, not the
/// bare `List` meta kind nor a core `API...List` discovery kind.
pub fn is_sweepable(kind: &KindId) -> bool {
    kind.kind.ends_with(LIST_SUFFIX)
        && kind.kind != LIST_SUFFIX
        && !(kind.group.is_empty() && kind.kind.starts_with("API"))
}

fn owned_by(item: &dyn TypedObject, owner_uid: &str) -> bool {
    item.object_meta()
        .and_then(|m| m.owner_references.as_ref())
        .map_or(false, |refs| refs.iter().any(|r| r.uid == owner_uid))
}

/// Delete every object whose owner references carry `owner`'s uid.
///
/// Collection kinds are visited in registry order, cluster-wide. Children are
/// removed through the store directly, so grandchildren are left alone. The
/// first store error aborts the sweep; kinds not yet visited stay unswept.
pub async fn naive_gc(ctx: &ResourceContext, owner: &GenericObject) -> Result<SweepReport> {
    let uid = owner
        .uid()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::Invalid("owner object has no metadata.uid".into()))?;
    let started = Instant::now();
    counter!("kubeclerk_gc_sweeps_total", 1u64);

    let mut report = SweepReport::default();
    let res = sweep(ctx, uid, &mut report).await;
    histogram!("kubeclerk_gc_sweep_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("kubeclerk_gc_deleted_total", report.deleted as u64);
    match res {
        Ok(()) => {
            info!(
                owner = %uid,
                kinds = report.kinds_visited.len(),
                deleted = report.deleted,
                took_ms = %started.elapsed().as_millis(),
                "gc: sweep done"
            );
            Ok(report)
        }
        Err(e) => {
            counter!("kubeclerk_gc_aborted_total", 1u64);
            warn!(owner = %uid, kinds = report.kinds_visited.len(), deleted = report.deleted, error = %e, "gc: sweep aborted");
            Err(e)
        }
    }
}

async fn sweep(ctx: &ResourceContext, uid: &str, report: &mut SweepReport) -> Result<()> {
    let registry = ctx.registry();
    let store = ctx.store();
    for kind in registry.all_kinds().into_iter().filter(is_sweepable) {
        let desc = registry.resolve(&kind)?;
        report.kinds_visited.push(kind.clone());
        let list = store.list(desc.as_ref(), &ListOptions::all()).await?;
        for item in list.items().unwrap_or_default() {
            if !owned_by(item, uid) {
                continue;
            }
            store.delete(item).await?;
            report.deleted += 1;
            debug!(kind = %kind, id = ?item.instance_id(), "gc: deleted child");
        }
    }
    Ok(())
}
