//! Inference engine adapters
//!
//! Each adapter knows how one inference-server family wants to be run: image,
//! arguments, volumes, health checks and the port it listens on. Adapters are
//! looked up by identifier in an [`EngineRegistry`]; adding an engine means
//! registering one more constructor.
//!
//! Adapters never set GPU resources. Scheduling concerns are added afterwards
//! by [`crate::scheduling`], independent of the engine.

mod batching;
mod distributed;
mod generic;
mod local;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use aideploy_common::merge::{merge_maps, merge_optional};
use aideploy_common::ownership::{deployment_labels, gvk_of, owner_references};

use crate::crd::{
    AIDeployment, EngineSelection, ENGINE_DEEPSPEED_MII, ENGINE_GENERIC, ENGINE_LOCALAI,
    ENGINE_VLLM,
};
use crate::resolver::ResolvedModel;
use crate::{Error, Result};

pub use batching::BatchingServerEngine;
pub use distributed::DistributedInferenceEngine;
pub use generic::GenericEngine;
pub use local::LocalInferenceEngine;

/// Name of the container the operator treats as the inference server
pub const ENGINE_CONTAINER_NAME: &str = "engine";

/// Engine option overriding the image repository
pub const IMAGE_REPOSITORY_OPTION: &str = "imageRepository";

/// Engine option overriding the image tag
pub const IMAGE_TAG_OPTION: &str = "imageTag";

/// Image tag used when none is configured
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// A pluggable inference-server backend
pub trait InferenceEngine: Send + Sync {
    /// Engine identifier
    fn name(&self) -> &'static str;

    /// Port the server listens on
    fn port(&self) -> i32;

    /// Desired Deployment, owned by the resource described by `owner`
    fn build_deployment(&self, owner: &ObjectMeta) -> Result<Deployment>;
}

/// Constructor stored in the registry
pub type EngineConstructor =
    fn(&AIDeployment, Vec<ResolvedModel>) -> Result<Box<dyn InferenceEngine>>;

/// Engine identifier to constructor table
#[derive(Clone)]
pub struct EngineRegistry {
    constructors: BTreeMap<&'static str, EngineConstructor>,
}

impl EngineRegistry {
    /// Registry without any engine
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every built-in engine
    pub fn with_builtin_engines() -> Self {
        let mut registry = Self::empty();
        registry
            .register(ENGINE_LOCALAI, LocalInferenceEngine::boxed)
            .register(ENGINE_VLLM, BatchingServerEngine::boxed)
            .register(ENGINE_DEEPSPEED_MII, DistributedInferenceEngine::boxed)
            .register(ENGINE_GENERIC, GenericEngine::boxed);
        registry
    }

    /// Add or replace an engine
    pub fn register(&mut self, name: &'static str, constructor: EngineConstructor) -> &mut Self {
        self.constructors.insert(name, constructor);
        self
    }

    /// Registered engine identifiers, sorted
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    /// Build the engine selected by `deployment`
    pub fn build(
        &self,
        deployment: &AIDeployment,
        models: Vec<ResolvedModel>,
    ) -> Result<Box<dyn InferenceEngine>> {
        let name = deployment.spec.engine.name.as_str();
        let constructor = self.constructors.get(name).ok_or_else(|| {
            Error::configuration_for(deployment.key(), format!("unknown engine {name}"))
        })?;
        constructor(deployment, models)
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_builtin_engines()
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

// =============================================================================
// Shared adapter scaffolding
// =============================================================================

/// `<repository>:<tag>` honoring the image options
pub(crate) fn engine_image(engine: &EngineSelection, default_repository: &str) -> String {
    let repository = engine
        .option(IMAGE_REPOSITORY_OPTION)
        .unwrap_or(default_repository);
    let tag = engine.option(IMAGE_TAG_OPTION).unwrap_or(DEFAULT_IMAGE_TAG);
    format!("{repository}:{tag}")
}

/// Copy of the user's pod template, or an empty one
pub(crate) fn base_template(deployment: &AIDeployment) -> PodTemplateSpec {
    deployment.spec.deployment.template.clone().unwrap_or_default()
}

/// Mutable pod spec of a template, created when absent
pub(crate) fn pod_spec_mut(template: &mut PodTemplateSpec) -> &mut PodSpec {
    template.spec.get_or_insert_with(PodSpec::default)
}

/// Wrap a finished pod template into the Deployment every engine produces
///
/// Sets identity and ownership, replicas, the selector on the default labels,
/// merged template labels/annotations, and disables service account token
/// mounting.
pub(crate) fn assemble_deployment(
    deployment: &AIDeployment,
    owner: &ObjectMeta,
    mut template: PodTemplateSpec,
) -> Deployment {
    let name = deployment.name_any();
    let overlay = &deployment.spec.deployment;
    let default_labels = deployment_labels(&name);

    pod_spec_mut(&mut template).automount_service_account_token = Some(false);

    let labels = merge_maps([
        Some(&default_labels),
        template.metadata.as_ref().and_then(|m| m.labels.as_ref()),
        Some(&overlay.labels),
    ]);
    let annotations = merge_optional([
        template.metadata.as_ref().and_then(|m| m.annotations.as_ref()),
        Some(&overlay.annotations),
    ]);
    let meta = template.metadata.get_or_insert_with(ObjectMeta::default);
    meta.labels = Some(labels);
    meta.annotations = annotations;

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: deployment.namespace(),
            owner_references: owner_references(&gvk_of::<AIDeployment>(), owner),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: overlay.replicas,
            selector: LabelSelector {
                match_labels: Some(default_labels),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        status: None,
    }
}

/// The engine container of a Deployment
pub fn engine_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == ENGINE_CONTAINER_NAME)
}

/// The engine container of a Deployment, mutably
pub fn engine_container_mut(deployment: &mut Deployment) -> Option<&mut Container> {
    deployment
        .spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .iter_mut()
        .find(|c| c.name == ENGINE_CONTAINER_NAME)
}

/// Append user arguments to the engine container
///
/// Returns false when the Deployment has no engine container.
pub fn append_engine_args(deployment: &mut Deployment, args: &[String]) -> bool {
    match engine_container_mut(deployment) {
        Some(container) => {
            if !args.is_empty() {
                container
                    .args
                    .get_or_insert_with(Vec::new)
                    .extend(args.iter().cloned());
            }
            true
        }
        None => false,
    }
}

/// Exactly one resolved model, or a configuration error
pub(crate) fn single_model(
    deployment: &AIDeployment,
    mut models: Vec<ResolvedModel>,
) -> Result<ResolvedModel> {
    match models.len() {
        0 => Err(Error::configuration_for(
            deployment.key(),
            "models not specified",
        )),
        1 => Ok(models.remove(0)),
        n => Err(Error::configuration_for(
            deployment.key(),
            format!("only one model can be specified, got {n}"),
        )),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crd::{AIDeploymentSpec, AIModelSpec};

    pub fn owner() -> ObjectMeta {
        ObjectMeta {
            name: Some("llama".to_string()),
            namespace: Some("ml".to_string()),
            uid: Some("uid-llama".to_string()),
            ..Default::default()
        }
    }

    pub fn deployment(engine: &str) -> AIDeployment {
        AIDeployment {
            metadata: owner(),
            spec: AIDeploymentSpec {
                engine: EngineSelection {
                    name: engine.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn inline_model(uri: &str) -> ResolvedModel {
        ResolvedModel::inline(
            "llama",
            AIModelSpec {
                uri: Some(uri.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn pod_spec(deployment: &Deployment) -> &PodSpec {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .expect("pod spec")
    }

    pub fn container_of(deployment: &Deployment) -> &Container {
        engine_container(deployment).expect("engine container")
    }
}
