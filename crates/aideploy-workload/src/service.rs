//! Service exposing an engine Deployment inside the cluster

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use aideploy_common::merge::{merge_maps, merge_optional};
use aideploy_common::ownership::{deployment_annotations, gvk_of, owner_references};

use crate::crd::AIDeployment;

/// Desired Service for `deployment`, named like the AIDeployment
///
/// Selects the Deployment's pod template labels and forwards `port` to the
/// same container port.
pub fn desired_service(owner: &AIDeployment, deployment: &Deployment, port: i32) -> Service {
    let name = owner.name_any();
    let overlay = &owner.spec.service;

    let selector = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone());

    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: owner.namespace(),
            owner_references: owner_references(&gvk_of::<AIDeployment>(), &owner.metadata),
            labels: merge_optional([Some(&overlay.labels)]),
            annotations: Some(merge_maps([
                Some(&deployment_annotations(&name)),
                Some(&overlay.annotations),
            ])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector,
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}
