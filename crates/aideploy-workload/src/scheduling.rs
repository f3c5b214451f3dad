//! Scheduling augmentation
//!
//! Applied to every engine's Deployment after it is built: replica spreading,
//! node selection, resource requests and GPU injection. Engines never touch
//! accelerators themselves.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PodTemplateSpec, TopologySpreadConstraint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use aideploy_common::merge::merge_optional;
use aideploy_common::quantity::{device_quantity, parse_device_count, NVIDIA_GPU_RESOURCE};

use crate::crd::{AIDeployment, AcceleratorInterface, DeploymentOverlay};
use crate::engine::{engine_container_mut, ENGINE_CONTAINER_NAME};
use crate::{Error, Result};

/// Pod label marking replicas that spread across nodes
pub const SPREAD_TOPOLOGY_LABEL: &str = "mlcontroller.premlabs.io/spread-topology";
/// Value of [`SPREAD_TOPOLOGY_LABEL`]
pub const SPREAD_TOPOLOGY_VALUE: &str = "ai-model";
/// Topology domain replicas are spread over
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
/// Runtime class for pods using NVIDIA GPUs
pub const NVIDIA_RUNTIME_CLASS: &str = "nvidia";

/// Add spread, node selection, resources and GPUs to an engine Deployment
///
/// Fails on an invalid accelerator request or when the Deployment has no
/// engine container. On error the Deployment may be partially modified and
/// must be discarded.
pub fn add_scheduling_properties(deployment: &mut Deployment, owner: &AIDeployment) -> Result<()> {
    let overlay = &owner.spec.deployment;
    let key = owner.key();

    let Some(spec) = deployment.spec.as_mut() else {
        return Err(Error::internal("scheduling", "deployment has no spec"));
    };
    add_topology_spread(&mut spec.template);

    if let Some(pod) = spec.template.spec.as_mut() {
        pod.node_selector = merge_optional([pod.node_selector.as_ref(), Some(&overlay.node_selector)]);
    }

    let gpus = needed_gpus(overlay).map_err(|msg| Error::configuration_for(&key, msg))?;

    let container = engine_container_mut(deployment).ok_or_else(|| {
        Error::configuration_for(
            &key,
            format!("no container named {ENGINE_CONTAINER_NAME} found in deployment"),
        )
    })?;

    let mut resources = container.resources.take().unwrap_or_default();
    resources.requests = merge_optional([
        resources.requests.as_ref(),
        overlay.resources.requests.as_ref(),
    ]);
    resources.limits = merge_optional([
        resources.limits.as_ref(),
        overlay.resources.limits.as_ref(),
    ]);

    if gpus > 0 {
        let quantity = overlay
            .resources
            .requests
            .as_ref()
            .and_then(|r| r.get(NVIDIA_GPU_RESOURCE))
            .cloned()
            .unwrap_or_else(|| device_quantity(gpus));
        resources
            .requests
            .get_or_insert_with(Default::default)
            .insert(NVIDIA_GPU_RESOURCE.to_string(), quantity.clone());
        resources
            .limits
            .get_or_insert_with(Default::default)
            .insert(NVIDIA_GPU_RESOURCE.to_string(), quantity);
    }

    let empty = resources.requests.is_none() && resources.limits.is_none() && resources.claims.is_none();
    container.resources = (!empty).then_some(resources);

    if gpus > 0 {
        if let Some(pod) = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        {
            pod.runtime_class_name
                .get_or_insert_with(|| NVIDIA_RUNTIME_CLASS.to_string());
        }
    }

    Ok(())
}

/// Number of GPUs the engine container needs
///
/// Without an accelerator no GPU may be requested. With one, only CUDA is
/// supported; an explicit request is honored, otherwise one GPU is used.
pub fn needed_gpus(overlay: &DeploymentOverlay) -> std::result::Result<u32, String> {
    let requested = overlay
        .resources
        .requests
        .as_ref()
        .and_then(|r| r.get(NVIDIA_GPU_RESOURCE));

    let Some(accelerator) = overlay.accelerator.as_ref() else {
        return match requested {
            Some(_) => {
                Err("deployment requests Nvidia GPU but no accelerator is specified".to_string())
            }
            None => Ok(0),
        };
    };

    if accelerator.interface != AcceleratorInterface::Cuda {
        return Err(format!(
            "unsupported accelerator interface: {}",
            accelerator.interface
        ));
    }

    match requested {
        Some(quantity) => parse_device_count(quantity),
        None => Ok(1),
    }
}

/// Label the template for spreading and add the matching constraint
///
/// A template already carrying the spread label is left untouched, so
/// repeated application adds exactly one constraint.
pub fn add_topology_spread(template: &mut PodTemplateSpec) {
    let meta = template.metadata.get_or_insert_with(ObjectMeta::default);
    let labels = meta.labels.get_or_insert_with(Default::default);
    if labels.contains_key(SPREAD_TOPOLOGY_LABEL) {
        return;
    }
    labels.insert(
        SPREAD_TOPOLOGY_LABEL.to_string(),
        SPREAD_TOPOLOGY_VALUE.to_string(),
    );

    let pod = template.spec.get_or_insert_with(Default::default);
    pod.topology_spread_constraints
        .get_or_insert_with(Vec::new)
        .push(TopologySpreadConstraint {
            max_skew: 1,
            topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
            when_unsatisfiable: "ScheduleAnyway".to_string(),
            label_selector: Some(LabelSelector {
                match_labels: Some(
                    [(
                        SPREAD_TOPOLOGY_LABEL.to_string(),
                        SPREAD_TOPOLOGY_VALUE.to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        });
}
