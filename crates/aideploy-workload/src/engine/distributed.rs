//! Distributed-inference server adapter
//!
//! A single model served by an HTTP front end over an internal gRPC backend.
//! Startup is gated on the backend port, health on the front end.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, LocalObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{
    assemble_deployment, base_template, engine_image, pod_spec_mut, single_model,
    InferenceEngine, ENGINE_CONTAINER_NAME,
};
use crate::crd::{AIDeployment, ENGINE_DEEPSPEED_MII};
use crate::probe::{http_get_probe, tcp_socket_probe, timed, EngineProbes};
use crate::resolver::ResolvedModel;
use crate::Result;

const IMAGE_REPOSITORY: &str = "premai/deepspeed-mii";
const PORT: i32 = 8080;
const BACKEND_PORT: i32 = 50051;

/// Pull secret used when the template names none
pub const DEFAULT_PULL_SECRET: &str = "regcred";

/// Single-model distributed-inference server
pub struct DistributedInferenceEngine {
    deployment: AIDeployment,
    model: ResolvedModel,
}

impl DistributedInferenceEngine {
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

    fn probes(&self) -> EngineProbes {
        let http = http_get_probe("/healthz", PORT);
        EngineProbes {
            startup: Some(timed(
                tcp_socket_probe(BACKEND_PORT),
                Some(30),
                Some(5),
                None,
                Some(120),
            )),
            readiness: Some(timed(http.clone(), None, None, None, Some(3))),
            liveness: Some(timed(http, None, Some(30), Some(15), Some(10))),
        }
        .with_overrides(&self.deployment.spec.deployment)
    }
}

impl InferenceEngine for DistributedInferenceEngine {
    fn name(&self) -> &'static str {
        ENGINE_DEEPSPEED_MII
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
            args: Some(vec![
                "--uri".to_string(),
                self.model.spec.uri_or_empty().to_string(),
            ]),
            ..Default::default()
        };
        self.probes().install(&mut container);

        let mut template = base_template(&self.deployment);
        let pod = pod_spec_mut(&mut template);
        pod.image_pull_secrets.get_or_insert_with(|| {
            vec![LocalObjectReference {
                name: DEFAULT_PULL_SECRET.to_string(),
            }]
        });
        pod.containers.push(container);

        Ok(assemble_deployment(&self.deployment, owner, template))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn build(dep: &AIDeployment) -> Deployment {
        DistributedInferenceEngine::new(dep, vec![inline_model("mistralai/Mistral-7B-v0.1")])
            .and_then(|e| e.build_deployment(&owner()))
            .expect("builds")
    }

    #[test]
    fn model_is_passed_by_uri_flag() {
        let out = build(&deployment("deepspeed-mii"));
        let container = container_of(&out);
        assert_eq!(
            container.args,
            Some(vec![
                "--uri".to_string(),
                "mistralai/Mistral-7B-v0.1".to_string()
            ])
        );
        assert_eq!(container.image.as_deref(), Some("premai/deepspeed-mii:latest"));
    }

    #[test]
    fn startup_waits_on_backend_port() {
        let out = build(&deployment("deepspeed-mii"));
        let container = container_of(&out);

        let startup = container.startup_probe.as_ref().expect("startup");
        assert_eq!(
            startup.tcp_socket.as_ref().map(|t| t.port.clone()),
            Some(IntOrString::Int(50051))
        );
        assert_eq!(startup.initial_delay_seconds, Some(30));
        let readiness = container.readiness_probe.as_ref().expect("readiness");
        assert_eq!(
            readiness.http_get.as_ref().and_then(|h| h.path.as_deref()),
            Some("/healthz")
        );
    }

    #[test]
    fn default_pull_secret_only_when_template_has_none() {
        let out = build(&deployment("deepspeed-mii"));
        let secrets = pod_spec(&out).image_pull_secrets.clone().expect("secrets");
        assert_eq!(secrets[0].name, "regcred");

        let mut dep = deployment("deepspeed-mii");
        dep.spec.deployment.template = Some(PodTemplateSpec {
            spec: Some(PodSpec {
                image_pull_secrets: Some(vec![LocalObjectReference {
                    name: "private".to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        let out = build(&dep);
        let secrets = pod_spec(&out).image_pull_secrets.clone().expect("secrets");
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].name, "private");
    }

    #[test]
    fn requires_exactly_one_model() {
        let err = DistributedInferenceEngine::new(&deployment("deepspeed-mii"), vec![])
            .err()
            .expect("no model");
        assert!(err.is_configuration());
    }
}
