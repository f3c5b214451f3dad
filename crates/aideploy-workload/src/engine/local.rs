//! Local-inference server adapter
//!
//! Serves any number of models from an in-memory model directory. Models are
//! fetched by init containers, passed by name on the command line, or copied
//! in from the catalog ConfigMap when they ship an engine config file.

use std::collections::HashSet;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMapProjection, Container, EmptyDirVolumeSource, EnvVar, KeyToPath, ProjectedVolumeSource,
    Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::{
    assemble_deployment, base_template, engine_image, pod_spec_mut, InferenceEngine,
    ENGINE_CONTAINER_NAME,
};
use crate::crd::{config_map_key, AIDeployment, ENGINE_LOCALAI};
use crate::probe::{http_get_probe, timed, EngineProbes};
use crate::resolver::ResolvedModel;
use crate::{Error, Result};

const IMAGE_REPOSITORY: &str = "quay.io/go-skynet/local-ai";
const PORT: i32 = 8080;
const MODELS_VOLUME: &str = "models";
const MODELS_PATH: &str = "/models";
const CACHE_VOLUME: &str = "cache";
const CONFIGS_VOLUME: &str = "configs";

/// Multi-model local-inference server
pub struct LocalInferenceEngine {
    deployment: AIDeployment,
    models: Vec<ResolvedModel>,
}

impl LocalInferenceEngine {
    /// Adapter for `deployment` serving `models`
    pub fn new(deployment: &AIDeployment, models: Vec<ResolvedModel>) -> Self {
        Self {
            deployment: deployment.clone(),
            models,
        }
    }

    /// Registry constructor
    pub fn boxed(
        deployment: &AIDeployment,
        models: Vec<ResolvedModel>,
    ) -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(Self::new(deployment, models)))
    }

    fn probes(&self) -> EngineProbes {
        let health = http_get_probe("/healthz", PORT);
        EngineProbes {
            startup: Some(timed(
                http_get_probe("/readyz", PORT),
                Some(1),
                Some(10),
                None,
                Some(120),
            )),
            readiness: Some(timed(health.clone(), None, None, None, Some(3))),
            liveness: Some(timed(health, None, Some(30), Some(15), Some(10))),
        }
        .with_overrides(&self.deployment.spec.deployment)
    }
}

fn models_mount() -> VolumeMount {
    VolumeMount {
        name: MODELS_VOLUME.to_string(),
        mount_path: MODELS_PATH.to_string(),
        ..Default::default()
    }
}

fn is_remote(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

fn download_container(model: &ResolvedModel, image: &str) -> Container {
    Container {
        name: format!("init-models-{}", model.name),
        image: Some(image.to_string()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![
            "curl -L -v -o /models/$MODEL_NAME $MODEL_PATH".to_string()
        ]),
        env: Some(vec![
            EnvVar {
                name: "MODEL_NAME".to_string(),
                value: Some(model.name.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "MODEL_PATH".to_string(),
                value: Some(model.spec.uri_or_empty().to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![models_mount()]),
        ..Default::default()
    }
}

impl InferenceEngine for LocalInferenceEngine {
    fn name(&self) -> &'static str {
        ENGINE_LOCALAI
    }

    fn port(&self) -> i32 {
        PORT
    }

    fn build_deployment(&self, owner: &ObjectMeta) -> Result<Deployment> {
        let name = self.deployment.name_any();
        let image = engine_image(&self.deployment.spec.engine, IMAGE_REPOSITORY);

        let mut env = self.deployment.spec.env.clone();
        env.push(EnvVar {
            name: "MODELS_PATH".to_string(),
            value: Some(MODELS_PATH.to_string()),
            ..Default::default()
        });

        let mut args = Vec::new();
        let mut init_containers = Vec::new();
        let mut config_sources = Vec::new();

        let mut seen = HashSet::new();
        if let Some(dup) = self.models.iter().find(|m| !seen.insert(m.name.as_str())) {
            return Err(Error::configuration_for(
                self.deployment.key(),
                format!("model name {} is used more than once", dup.name),
            ));
        }

        for model in &self.models {
            if model.spec.engine_config_file.is_some() {
                let Some(source) = model.source.as_ref() else {
                    return Err(Error::configuration_for(
                        self.deployment.key(),
                        format!(
                            "inline model {} has an engine config file but no catalog variant",
                            model.name
                        ),
                    ));
                };
                config_sources.push(VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: source.catalog.clone(),
                        items: Some(vec![KeyToPath {
                            key: config_map_key(ENGINE_LOCALAI, &source.variant),
                            path: format!("engine/{}.yaml", model.name),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                continue;
            }

            let uri = model.spec.uri_or_empty();
            if is_remote(uri) {
                init_containers.push(download_container(model, &image));
            } else if !uri.is_empty() {
                args.push(uri.to_string());
            }
        }

        let mut container = Container {
            name: ENGINE_CONTAINER_NAME.to_string(),
            image: Some(image.clone()),
            image_pull_policy: Some("Always".to_string()),
            env: Some(env),
            args: (!args.is_empty()).then_some(args),
            volume_mounts: Some(vec![models_mount()]),
            ..Default::default()
        };
        self.probes().install(&mut container);

        let mut template = base_template(&self.deployment);
        let pod = pod_spec_mut(&mut template);

        let volumes = pod.volumes.get_or_insert_with(Vec::new);
        volumes.push(Volume {
            name: MODELS_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        volumes.push(Volume {
            name: CACHE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });

        if !config_sources.is_empty() {
            volumes.push(Volume {
                name: CONFIGS_VOLUME.to_string(),
                projected: Some(ProjectedVolumeSource {
                    sources: Some(config_sources),
                    ..Default::default()
                }),
                ..Default::default()
            });
            init_containers.push(Container {
                name: format!("init-{CONFIGS_VOLUME}-{name}"),
                image: Some(image),
                image_pull_policy: Some("Always".to_string()),
                command: Some(vec!["sh".to_string(), "-c".to_string()]),
                args: Some(vec![format!(
                    "ls /{CONFIGS_VOLUME}/engine && cp -v /{CONFIGS_VOLUME}/engine/* {MODELS_PATH}"
                )]),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: CONFIGS_VOLUME.to_string(),
                        mount_path: format!("/{CONFIGS_VOLUME}"),
                        ..Default::default()
                    },
                    models_mount(),
                ]),
                ..Default::default()
            });
        }

        if !init_containers.is_empty() {
            pod.init_containers
                .get_or_insert_with(Vec::new)
                .extend(init_containers);
        }
        pod.containers.push(container);

        Ok(assemble_deployment(&self.deployment, owner, template))
    }
}
