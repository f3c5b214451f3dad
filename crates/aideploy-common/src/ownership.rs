//! Ownership and identity metadata shared by every generated object
//!
//! Generated objects carry a controller owner reference back to the custom
//! resource that produced them, so the cluster garbage collector removes them
//! with their owner, and a default label/annotation naming that owner.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::GroupVersionKind;
use kube::Resource;

/// Label and annotation key naming the owning AIDeployment
pub const DEPLOYMENT_OWNER_KEY: &str = "mlcontroller.premlabs.io/ai-deployment";

/// Label and annotation key naming the owning AIModelMap
pub const MODEL_MAP_OWNER_KEY: &str = "mlcontroller.premlabs.io/aimodelmap";

/// Group/version/kind of a statically typed resource
pub fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Controller owner references pointing at `owner`
///
/// Only the owner's metadata is consulted. An owner without a UID (not yet
/// persisted) yields no reference.
pub fn owner_references(gvk: &GroupVersionKind, owner: &ObjectMeta) -> Option<Vec<OwnerReference>> {
    let uid = owner.uid.clone()?;
    let api_version = if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    };

    Some(vec![OwnerReference {
        api_version,
        kind: gvk.kind.clone(),
        name: owner.name.clone().unwrap_or_default(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    }])
}

/// `{key: name}` map used as both the default label and default annotation
pub fn identity_map(key: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), name.to_string())])
}

/// Default labels for objects generated from an AIDeployment
pub fn deployment_labels(name: &str) -> BTreeMap<String, String> {
    identity_map(DEPLOYMENT_OWNER_KEY, name)
}

/// Default annotations for objects generated from an AIDeployment
pub fn deployment_annotations(name: &str) -> BTreeMap<String, String> {
    identity_map(DEPLOYMENT_OWNER_KEY, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AIDeployment, AIModelMap};

    fn owner_meta(uid: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some("llama".to_string()),
            namespace: Some("ml".to_string()),
            uid: uid.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn owner_reference_uses_group_version_kind() {
        let refs = owner_references(&gvk_of::<AIDeployment>(), &owner_meta(Some("uid-1")))
            .expect("owner with uid");

        assert_eq!(refs.len(), 1);
        let r = &refs[0];
        assert_eq!(r.api_version, "premlabs.io/v1alpha1");
        assert_eq!(r.kind, "AIDeployment");
        assert_eq!(r.name, "llama");
        assert_eq!(r.uid, "uid-1");
        assert_eq!(r.controller, Some(true));
        assert_eq!(r.block_owner_deletion, Some(true));
    }

    #[test]
    fn owner_reference_kind_follows_type() {
        let refs = owner_references(&gvk_of::<AIModelMap>(), &owner_meta(Some("uid-2")))
            .expect("owner with uid");
        assert_eq!(refs[0].kind, "AIModelMap");
    }

    #[test]
    fn core_group_has_bare_version() {
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let refs = owner_references(&gvk, &owner_meta(Some("uid-3"))).expect("owner with uid");
        assert_eq!(refs[0].api_version, "v1");
    }

    #[test]
    fn owner_without_uid_has_no_reference() {
        assert!(owner_references(&gvk_of::<AIDeployment>(), &owner_meta(None)).is_none());
    }

    #[test]
    fn default_labels_name_the_owner() {
        let labels = deployment_labels("llama");
        assert_eq!(labels.get(DEPLOYMENT_OWNER_KEY).map(String::as_str), Some("llama"));
        assert_eq!(deployment_annotations("llama"), labels);
    }
}
