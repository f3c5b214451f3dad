//! User-supplied container adapter
//!
//! The pod template is the user's. The first container is adopted as the
//! engine container; env and ports come from the AIDeployment only, so they
//! may not also be declared on that container.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ContainerPort;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{assemble_deployment, pod_spec_mut, InferenceEngine, ENGINE_CONTAINER_NAME};
use crate::crd::{AIDeployment, ENGINE_GENERIC};
use crate::probe::EngineProbes;
use crate::resolver::ResolvedModel;
use crate::{Error, Result};

/// Port used when no endpoint declares one
pub const DEFAULT_PORT: i32 = 8000;

/// Engine running an arbitrary user container
pub struct GenericEngine {
    deployment: AIDeployment,
}

impl GenericEngine {
    /// Adapter for `deployment`; models cannot be declared
    pub fn new(deployment: &AIDeployment, models: Vec<ResolvedModel>) -> Result<Self> {
        if !models.is_empty() {
            return Err(Error::configuration_for(
                deployment.key(),
                "the generic engine does not take models, bake them into the container",
            ));
        }
        Ok(Self {
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
}

impl InferenceEngine for GenericEngine {
    fn name(&self) -> &'static str {
        ENGINE_GENERIC
    }

    fn port(&self) -> i32 {
        self.deployment
            .spec
            .endpoint
            .first()
            .and_then(|e| e.port)
            .unwrap_or(DEFAULT_PORT)
    }

    fn build_deployment(&self, owner: &ObjectMeta) -> Result<Deployment> {
        let key = self.deployment.key();
        let mut template = self.deployment.spec.deployment.template.clone().ok_or_else(|| {
            Error::configuration_for(&key, "the generic engine requires a pod template")
        })?;

        let port = self.port();
        let pod = pod_spec_mut(&mut template);
        let container = pod.containers.first_mut().ok_or_else(|| {
            Error::configuration_for(&key, "the generic engine pod template has no containers")
        })?;

        if container.env.as_ref().is_some_and(|e| !e.is_empty()) {
            return Err(Error::configuration_for(
                &key,
                "set env on the AIDeployment, not on the container",
            ));
        }
        if container.ports.as_ref().is_some_and(|p| !p.is_empty()) {
            return Err(Error::configuration_for(
                &key,
                "set ports with the AIDeployment endpoint, not on the container",
            ));
        }

        container.name = ENGINE_CONTAINER_NAME.to_string();
        let env = &self.deployment.spec.env;
        container.env = (!env.is_empty()).then(|| env.clone());
        container.ports = Some(vec![ContainerPort {
            container_port: port,
            ..Default::default()
        }]);

        EngineProbes::from_container(container)
            .with_overrides(&self.deployment.spec.deployment)
            .install(container);

        Ok(assemble_deployment(&self.deployment, owner, template))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::crd::{Endpoint, ProbeOverride};
    use crate::probe::http_get_probe;
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(format!("registry.example.com/{name}:1.0")),
            ..Default::default()
        }
    }

    fn generic(containers: Vec<Container>, port: Option<i32>) -> AIDeployment {
        let mut dep = deployment("generic");
        dep.spec.endpoint = vec![Endpoint {
            domain: "custom.example.com".to_string(),
            port,
        }];
        dep.spec.env = vec![EnvVar {
            name: "MODE".to_string(),
            value: Some("serve".to_string()),
            ..Default::default()
        }];
        dep.spec.deployment.template = Some(PodTemplateSpec {
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            ..Default::default()
        });
        dep
    }

    fn build(dep: &AIDeployment) -> Result<Deployment> {
        GenericEngine::new(dep, vec![])?.build_deployment(&owner())
    }

    #[test]
    fn first_container_is_adopted() {
        let dep = generic(vec![container("server"), container("proxy")], Some(9000));

        let out = build(&dep).expect("builds");

        let pod = pod_spec(&out);
        assert_eq!(pod.containers[0].name, "engine");
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("registry.example.com/server:1.0")
        );
        assert_eq!(pod.containers[1].name, "proxy");
        let engine = container_of(&out);
        assert_eq!(engine.ports.as_ref().map(|p| p[0].container_port), Some(9000));
        assert_eq!(engine.env.as_ref().map(|e| e[0].name.as_str()), Some("MODE"));
    }

    #[test]
    fn port_defaults_without_endpoint_port() {
        let dep = generic(vec![container("server")], None);
        let engine = GenericEngine::new(&dep, vec![]).expect("engine");
        assert_eq!(engine.port(), DEFAULT_PORT);

        let mut bare = deployment("generic");
        bare.spec.endpoint.clear();
        assert_eq!(GenericEngine::new(&bare, vec![]).expect("engine").port(), 8000);
    }

    #[test]
    fn missing_template_is_rejected() {
        let err = build(&deployment("generic")).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("requires a pod template"), "{err}");
    }

    #[test]
    fn container_env_is_rejected() {
        let mut server = container("server");
        server.env = Some(vec![EnvVar {
            name: "X".to_string(),
            ..Default::default()
        }]);
        let err = build(&generic(vec![server], Some(9000))).unwrap_err();
        assert!(err.to_string().contains("env"), "{err}");
    }

    #[test]
    fn container_ports_are_rejected() {
        let mut server = container("server");
        server.ports = Some(vec![ContainerPort {
            container_port: 80,
            ..Default::default()
        }]);
        let err = build(&generic(vec![server], Some(9000))).unwrap_err();
        assert!(err.to_string().contains("ports"), "{err}");
    }

    #[test]
    fn models_are_rejected() {
        let dep = generic(vec![container("server")], Some(9000));
        assert!(GenericEngine::new(&dep, vec![inline_model("m")]).is_err());
    }

    #[test]
    fn overrides_only_touch_declared_probes() {
        let mut server = container("server");
        server.readiness_probe = Some(http_get_probe("/ready", 9000));
        let mut dep = generic(vec![server], Some(9000));
        dep.spec.deployment.readiness_probe = Some(ProbeOverride {
            period_seconds: Some(4),
            ..Default::default()
        });
        dep.spec.deployment.liveness_probe = Some(ProbeOverride {
            period_seconds: Some(4),
            ..Default::default()
        });

        let out = build(&dep).expect("builds");

        let engine = container_of(&out);
        assert_eq!(
            engine.readiness_probe.as_ref().and_then(|p| p.period_seconds),
            Some(4)
        );
        assert!(engine.liveness_probe.is_none());
    }
}
