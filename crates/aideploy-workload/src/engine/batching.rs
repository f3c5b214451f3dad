//! Batching-server adapter
//!
//! Single-model, high-throughput server. Model tuning reaches the server as
//! command-line flags, so every user-controlled flag value is restricted to
//! letters and digits.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use aideploy_common::naming::is_alphanumeric;

use super::{
    assemble_deployment, base_template, engine_image, pod_spec_mut, single_model,
    InferenceEngine, ENGINE_CONTAINER_NAME,
};
use crate::crd::{AIDeployment, ENGINE_VLLM};
use crate::probe::{http_get_probe, timed, EngineProbes};
use crate::resolver::ResolvedModel;
use crate::{Error, Result};

const IMAGE_REPOSITORY: &str = "vllm/vllm-openai";
const PORT: i32 = 8000;
const MODELS_VOLUME: &str = "models";
const MODELS_PATH: &str = "/root/.cache/huggingface";

/// Engine option and flag carrying the weight data type
pub const DTYPE_OPTION: &str = "dtype";
/// Engine option and flag carrying the quantization scheme
pub const QUANTIZATION_OPTION: &str = "quantization";

/// Single-model batching server
pub struct BatchingServerEngine {
    deployment: AIDeployment,
    model: ResolvedModel,
}

impl BatchingServerEngine {
    /// Adapter for `deployment`; exactly one model is accepted
    pub fn new(deployment: &AIDeployment, models: Vec<ResolvedModel>) -> Result<Self> {
        Ok(Self {
            model: single_model(deployment, models)?,
            deployment: deployment.clone(),
        })
    }

    /// Registry constructor
    pub fn boxed(
        deployment: &AIDeployment,
        models: Vec<ResolvedModel>,
    ) -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(Self::new(deployment, models)?))
    }

    /// Server flags: `--model` then the optional tuning flags
    fn args(&self) -> Result<Vec<String>> {
        let mut args = vec![
            "--model".to_string(),
            self.model.spec.uri_or_empty().to_string(),
        ];

        let tuning = [
            (DTYPE_OPTION, self.model.spec.data_type.as_deref()),
            (QUANTIZATION_OPTION, self.model.spec.quantization.as_deref()),
        ];
        for (flag, from_model) in tuning {
            let value = self
                .deployment
                .spec
                .engine
                .option(flag)
                .or(from_model.filter(|v| !v.is_empty()));
            let Some(value) = value else {
                continue;
            };
            if !is_alphanumeric(value) {
                return Err(Error::configuration_for(
                    self.deployment.key(),
                    format!("{flag} value {value:?} must be alphanumeric"),
                ));
            }
            args.push(format!("--{flag}"));
            args.push(value.to_string());
        }

        Ok(args)
    }

    fn probes(&self) -> EngineProbes {
        let health = http_get_probe("/health", PORT);
        EngineProbes {
            startup: Some(timed(health.clone(), Some(3), Some(1), None, Some(120))),
            readiness: Some(timed(health.clone(), None, None, None, Some(3))),
            liveness: Some(timed(health, None, Some(30), Some(15), Some(10))),
        }
        .with_overrides(&self.deployment.spec.deployment)
    }
}

impl InferenceEngine for BatchingServerEngine {
    fn name(&self) -> &'static str {
        ENGINE_VLLM
    }

    fn port(&self) -> i32 {
        PORT
    }

    fn build_deployment(&self, owner: &ObjectMeta) -> Result<Deployment> {
        let env = &self.deployment.spec.env;
        let mut container = Container {
            name: ENGINE_CONTAINER_NAME.to_string(),
            image: Some(engine_image(&self.deployment.spec.engine, IMAGE_REPOSITORY)),
            image_pull_policy: Some("Always".to_string()),
            env: (!env.is_empty()).then(|| env.clone()),
            args: Some(self.args()?),
            volume_mounts: Some(vec![VolumeMount {
                name: MODELS_VOLUME.to_string(),
                mount_path: MODELS_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        self.probes().install(&mut container);

        let mut template = base_template(&self.deployment);
        let pod = pod_spec_mut(&mut template);
        pod.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: MODELS_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        pod.containers.push(container);

        Ok(assemble_deployment(&self.deployment, owner, template))
    }
}
