use std::collections::HashSet;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Service};
use kubeclerk_api::prelude::*;
use kubeclerk_schema::Registry;
use serde_json::{json, Value as Json};

fn registry() -> Arc<Registry> {
    let mut reg = Registry::new();
    reg.register::<Namespace>()
        .register::<Service>()
        .register::<Endpoints>()
        .register::<ConfigMap>()
        .register::<Deployment>();
    Arc::new(reg)
}

fn context() -> ResourceContext {
    ContextBuilder::new().with_memory_store(registry()).without_garbage_collector().build().unwrap()
}

fn obj(value: Json) -> GenericObject {
    GenericObject::try_from(value).unwrap()
}

fn kind(key: &str) -> KindId {
    key.parse().unwrap()
}

fn id(key: &str) -> InstanceId {
    key.parse().unwrap()
}

fn config_map(data: Json) -> GenericObject {
    obj(json!({ "data": data }))
}

#[tokio::test]
async fn create_then_get_returns_stamped_object() {
    let ctx = context();
    let created = ctx
        .create(&kind("v1/ConfigMap"), &id("default/app"), config_map(json!({ "a": "1" })))
        .await
        .unwrap();
    assert_eq!(created.kind(), Some("ConfigMap"));
    assert_eq!(created.api_version(), Some("v1"));
    assert_eq!(created.name(), Some("app"));
    assert_eq!(created.namespace(), Some("default"));
    assert!(created.uid().is_some());

    let fetched = ctx.get(&kind("v1/ConfigMap"), &id("default/app")).await.unwrap();
    assert_eq!(fetched, created);
    assert_eq!(fetched.field("data.a"), Some(&json!("1")));
}

#[tokio::test]
async fn unknown_kinds_are_not_registered() {
    let ctx = context();
    let widget = kind("example.com/v1/Widget");
    let err = ctx.create(&widget, &id("default/w"), GenericObject::new()).await.unwrap_err();
    assert!(err.is_not_registered());
    assert!(ctx.get(&widget, &id("default/w")).await.unwrap_err().is_not_registered());
    assert!(ctx.list(&widget, &ListOptions::all()).await.unwrap_err().is_not_registered());
}

#[tokio::test]
async fn missing_objects_are_not_found_and_update_never_creates() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    assert!(ctx.get(&cm, &id("default/nope")).await.unwrap_err().is_not_found());
    let err = ctx.update(&cm, &id("default/nope"), config_map(json!({}))).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(ctx.get(&cm, &id("default/nope")).await.unwrap_err().is_not_found());
    assert!(ctx.delete(&cm, &id("default/nope")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn every_create_gets_a_distinct_uid() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    let mut uids = HashSet::new();
    for i in 0..25 {
        let mut input = config_map(json!({}));
        input.set_uid("caller-chosen");
        let created = ctx.create(&cm, &id(&format!("default/cm-{}", i)), input).await.unwrap();
        let uid = created.uid().unwrap().to_string();
        assert_ne!(uid, "caller-chosen");
        uids.insert(uid);
    }
    assert_eq!(uids.len(), 25);
}

#[tokio::test]
async fn second_create_fails_and_keeps_the_first() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    let first = ctx.create(&cm, &id("default/app"), config_map(json!({ "v": "first" }))).await.unwrap();
    let err = ctx.create(&cm, &id("default/app"), config_map(json!({ "v": "second" }))).await.unwrap_err();
    assert!(err.is_already_exists());
    let stored = ctx.get(&cm, &id("default/app")).await.unwrap();
    assert_eq!(stored, first);
}

#[tokio::test]
async fn shape_violations_are_invalid_and_not_stored() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    let err = ctx.create(&cm, &id("default/bad"), obj(json!({ "spec": { "x": 1 } }))).await.unwrap_err();
    assert!(err.is_invalid());
    let err = ctx.create(&cm, &id("default/bad"), obj(json!({ "data": "not-a-map" }))).await.unwrap_err();
    assert!(err.is_invalid());
    assert!(ctx.get(&cm, &id("default/bad")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn update_keeps_uid_and_rejects_stale_versions() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    let created = ctx.create(&cm, &id("default/app"), config_map(json!({ "v": "1" }))).await.unwrap();

    let updated = ctx.update(&cm, &id("default/app"), config_map(json!({ "v": "2" }))).await.unwrap();
    assert_eq!(updated.uid(), created.uid());
    assert_eq!(updated.field("data.v"), Some(&json!("2")));

    let mut stale = config_map(json!({ "v": "3" }));
    stale.set_resource_version(created.resource_version().unwrap());
    let err = ctx.update(&cm, &id("default/app"), stale).await.unwrap_err();
    assert!(err.is_conflict());
    let stored = ctx.get(&cm, &id("default/app")).await.unwrap();
    assert_eq!(stored.field("data.v"), Some(&json!("2")));
}

#[tokio::test]
async fn list_filters_by_namespace() {
    let ctx = context();
    for name in ["default", "kube-system", "prod"] {
        ctx.create(&kind("v1/Namespace"), &InstanceId::cluster(name), GenericObject::new()).await.unwrap();
    }
    for name in ["a", "b"] {
        ctx.create(&kind("v1/Service"), &InstanceId::namespaced("default", name), GenericObject::new())
            .await
            .unwrap();
    }
    ctx.create(&kind("v1/Service"), &id("prod/c"), GenericObject::new()).await.unwrap();

    let services = ctx.list(&kind("v1/Service"), &ListOptions::in_namespace("default")).await.unwrap();
    let mut names: Vec<_> = services.iter().map(|s| s.name().unwrap().to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    assert!(services.iter().all(|s| s.kind() == Some("Service")));

    assert_eq!(ctx.count(&kind("v1/Namespace"), &ListOptions::all()).await.unwrap(), 3);
    assert_eq!(ctx.count(&kind("v1/ServiceList"), &ListOptions::all()).await.unwrap(), 3);
}

#[tokio::test]
async fn list_honours_label_selectors() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    for (name, tier) in [("a", "front"), ("b", "back"), ("c", "front")] {
        let mut input = config_map(json!({}));
        input.set_label("tier", tier);
        ctx.create(&cm, &InstanceId::namespaced("default", name), input).await.unwrap();
    }
    let opts = ListOptions::all().with_labels("tier=front".parse().unwrap());
    assert_eq!(ctx.count(&cm, &opts).await.unwrap(), 2);
}

#[tokio::test]
async fn op_list_patch_is_atomic() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    let before = ctx.create(&cm, &id("default/app"), config_map(json!({ "a": "1" }))).await.unwrap();
    let payload = br#"[
        {"op": "replace", "path": "/data/a", "value": "2"},
        {"op": "remove", "path": "/data/missing"}
    ]"#;
    let err = ctx.patch_raw(&cm, &id("default/app"), PatchKind::Json, payload).await.unwrap_err();
    assert!(err.is_invalid());
    let after = ctx.get(&cm, &id("default/app")).await.unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn merge_patch_overwrites_and_null_deletes() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    ctx.create(&cm, &id("default/app"), config_map(json!({ "a": "1", "b": "2" }))).await.unwrap();
    let patched = ctx
        .patch_raw(&cm, &id("default/app"), PatchKind::Merge, br#"{"data":{"a":"9","b":null,"c":"3"}}"#)
        .await
        .unwrap();
    assert_eq!(patched.field("data"), Some(&json!({ "a": "9", "c": "3" })));
    let malformed = ctx.patch_raw(&cm, &id("default/app"), PatchKind::Merge, b"{").await.unwrap_err();
    assert!(malformed.is_invalid());
    let missing = ctx.patch_raw(&cm, &id("default/gone"), PatchKind::Merge, b"{}").await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn strategic_patch_merges_containers_by_name() {
    let ctx = context();
    let deploy = kind("apps/v1/Deployment");
    let spec = json!({
        "spec": {
            "selector": { "matchLabels": { "app": "web" } },
            "template": {
                "metadata": { "labels": { "app": "web" } },
                "spec": {
                    "containers": [
                        { "name": "web", "image": "web:1" },
                        { "name": "proxy", "image": "proxy:1" }
                    ]
                }
            }
        }
    });
    ctx.create(&deploy, &id("default/web"), obj(spec)).await.unwrap();

    let payload = br#"{"spec":{"template":{"spec":{"containers":[
        {"name":"web","image":"web:2"},
        {"name":"proxy","$patch":"delete"},
        {"name":"metrics","image":"metrics:1"}
    ]}}}}"#;
    let patched = ctx.patch_raw(&deploy, &id("default/web"), PatchKind::Strategic, payload).await.unwrap();
    assert_eq!(
        patched.field("spec.template.spec.containers"),
        Some(&json!([
            { "name": "web", "image": "web:2" },
            { "name": "metrics", "image": "metrics:1" }
        ]))
    );
}

#[tokio::test]
async fn label_and_annotation_helpers() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    let app = id("default/app");
    ctx.create(&cm, &app, config_map(json!({}))).await.unwrap();

    ctx.label(&cm, &app, "app.kubernetes.io/name", "web").await.unwrap();
    ctx.annotate(&cm, &app, "note", "hello").await.unwrap();
    let labelled = ctx.update_label(&cm, &app, "app.kubernetes.io/name", "api").await.unwrap();
    assert_eq!(labelled.labels().get("app.kubernetes.io/name").map(String::as_str), Some("api"));
    assert_eq!(ctx.field(&cm, &app, "metadata.annotations.note").await.unwrap(), Some(json!("hello")));

    let err = ctx.update_label(&cm, &app, "absent", "x").await.unwrap_err();
    assert!(err.is_invalid());
    let err = ctx.update_annotation(&cm, &app, "absent", "x").await.unwrap_err();
    assert!(err.is_invalid());

    let cleared = ctx.remove_label(&cm, &app, "app.kubernetes.io/name").await.unwrap();
    assert!(cleared.labels().is_empty());
    let cleared = ctx.remove_annotation(&cm, &app, "note").await.unwrap();
    assert!(cleared.annotations().is_empty());
    assert!(ctx.remove_label(&cm, &app, "absent").await.unwrap_err().is_invalid());
}

#[tokio::test]
async fn similarity_and_equality_ignore_identity() {
    let ctx = context();
    let cm = kind("v1/ConfigMap");
    let mut a = config_map(json!({ "k": "v" }));
    a.set_label("team", "x");
    let mut b = config_map(json!({ "k": "v" }));
    b.set_label("team", "y");
    ctx.create(&cm, &id("default/a"), a.clone()).await.unwrap();
    ctx.create(&cm, &id("default/b"), b).await.unwrap();
    ctx.create(&cm, &id("other/a"), a).await.unwrap();

    assert!(ctx.is_similar(&cm, &id("default/a"), &id("default/b")).await.unwrap());
    assert!(!ctx.is_equal(&cm, &id("default/a"), &id("default/b")).await.unwrap());
    assert!(ctx.is_equal(&cm, &id("default/a"), &id("other/a")).await.unwrap());
}
