//! Built-in kinds and their strategic merge keys.

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::batch::v1 as batchv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as networkingv1;
use k8s_openapi::api::rbac::v1 as rbacv1;

use crate::{MergeKeys, Registry};

/// Pod template fields that merge by key, relative to a pod spec at `prefix`.
fn pod_spec_keys(keys: &mut MergeKeys, prefix: &str) {
    for containers in ["containers", "initContainers", "ephemeralContainers"] {
        let base = format!("{}.{}", prefix, containers);
        keys.insert(base.clone(), "name");
        keys.insert(format!("{}.ports", base), "containerPort");
        keys.insert(format!("{}.env", base), "name");
        keys.insert(format!("{}.volumeMounts", base), "mountPath");
        keys.insert(format!("{}.volumeDevices", base), "devicePath");
    }
    keys.insert(format!("{}.volumes", prefix), "name");
    keys.insert(format!("{}.imagePullSecrets", prefix), "name");
    keys.insert(format!("{}.hostAliases", prefix), "ip");
    keys.insert(format!("{}.tolerations", prefix), "key");
}

/// Strategic merge keys known for `group`/`kind`. Every kind merges owner
/// references by uid.
pub fn builtin_merge_keys(group: &str, kind: &str) -> MergeKeys {
    let mut keys = MergeKeys::new().with("metadata.ownerReferences", "uid");
    match (group, kind) {
        ("", "Pod") => pod_spec_keys(&mut keys, "spec"),
        ("", "Service") => keys.insert("spec.ports", "port"),
        ("", "ServiceAccount") => {
            keys.insert("secrets", "name");
            keys.insert("imagePullSecrets", "name");
        }
        ("", "ReplicationController") | ("apps", "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet") | ("batch", "Job") => {
            pod_spec_keys(&mut keys, "spec.template.spec")
        }
        ("batch", "CronJob") => pod_spec_keys(&mut keys, "spec.jobTemplate.spec.template.spec"),
        _ => {}
    }
    keys
}

pub(crate) fn register_all(reg: &mut Registry) {
    reg.register::<corev1::Namespace>()
        .register::<corev1::Service>()
        .register::<corev1::Endpoints>()
        .register::<corev1::ConfigMap>()
        .register::<corev1::Secret>()
        .register::<corev1::ServiceAccount>()
        .register::<corev1::Pod>()
        .register::<corev1::PersistentVolumeClaim>()
        .register::<corev1::ReplicationController>()
        .register::<appsv1::Deployment>()
        .register::<appsv1::ReplicaSet>()
        .register::<appsv1::StatefulSet>()
        .register::<appsv1::DaemonSet>()
        .register::<batchv1::Job>()
        .register::<batchv1::CronJob>()
        .register::<rbacv1::Role>()
        .register::<rbacv1::RoleBinding>()
        .register::<networkingv1::Ingress>();
}
