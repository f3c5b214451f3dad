//! Ingress routing external hosts to an engine Service
//!
//! Rate limiting and authentication are delegated to Traefik middlewares
//! referenced by annotation.

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use aideploy_common::merge::{merge_maps, merge_optional};
use aideploy_common::ownership::{deployment_annotations, gvk_of, owner_references};

use crate::crd::AIDeployment;

/// Annotation listing the Traefik middlewares of a router
pub const MIDDLEWARES_ANNOTATION: &str = "traefik.ingress.kubernetes.io/router.middlewares";
/// Provider suffix for middlewares defined as Traefik CRDs
pub const MIDDLEWARE_PROVIDER: &str = "@kubernetescrd";
/// Default authentication middleware
pub const DEFAULT_AUTH_MIDDLEWARE: &str = "api-gateway-auth-service";
/// Default rate-limit middleware
pub const DEFAULT_RATE_LIMIT_MIDDLEWARE: &str = "api-gateway-rate-limiter";

/// Middleware names attached to generated ingresses
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressConfig {
    /// Middleware enforcing authentication
    pub auth_middleware: String,
    /// Middleware enforcing rate limits
    pub rate_limit_middleware: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            auth_middleware: DEFAULT_AUTH_MIDDLEWARE.to_string(),
            rate_limit_middleware: DEFAULT_RATE_LIMIT_MIDDLEWARE.to_string(),
        }
    }
}

impl IngressConfig {
    /// Comma-joined middleware list, rate limit first; `None` when neither
    /// feature is enabled
    pub fn middlewares(&self, rate_limit: bool, authentication: bool) -> Option<String> {
        let mut names = Vec::with_capacity(2);
        if rate_limit {
            names.push(format!("{}{MIDDLEWARE_PROVIDER}", self.rate_limit_middleware));
        }
        if authentication {
            names.push(format!("{}{MIDDLEWARE_PROVIDER}", self.auth_middleware));
        }
        (!names.is_empty()).then(|| names.join(", "))
    }
}

/// Desired Ingress for `owner`, `None` when it declares no endpoint
///
/// One rule per endpoint domain routes `/` to the Service of the same name on
/// `port`. TLS uses the `<service>-tls` secret and is enabled only when the
/// spec asks for it explicitly.
pub fn desired_ingress(owner: &AIDeployment, port: i32, config: &IngressConfig) -> Option<Ingress> {
    if owner.spec.endpoint.is_empty() {
        return None;
    }

    let name = owner.name_any();
    let overlay = &owner.spec.ingress;
    let hosts: Vec<String> = owner
        .spec
        .endpoint
        .iter()
        .map(|e| e.domain.clone())
        .collect();

    let rules = hosts
        .iter()
        .map(|host| IngressRule {
            host: Some(host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: name.clone(),
                            port: Some(ServiceBackendPort {
                                number: Some(port),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        })
        .collect();

    let tls = (overlay.tls == Some(true)).then(|| {
        vec![IngressTLS {
            hosts: Some(hosts),
            secret_name: Some(format!("{name}-tls")),
        }]
    });

    let mut annotations = merge_maps([
        Some(&deployment_annotations(&name)),
        Some(&overlay.annotations),
    ]);
    if let Some(middlewares) = config.middlewares(owner.spec.rate_limit, owner.spec.authentication)
    {
        annotations.insert(MIDDLEWARES_ANNOTATION.to_string(), middlewares);
    }

    Some(Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: owner.namespace(),
            owner_references: owner_references(&gvk_of::<AIDeployment>(), &owner.metadata),
            labels: merge_optional([Some(&overlay.labels)]),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(rules),
            tls,
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AIDeploymentSpec, Endpoint};

    fn owner(domains: &[&str]) -> AIDeployment {
        AIDeployment {
            metadata: ObjectMeta {
                name: Some("llama".to_string()),
                namespace: Some("ml".to_string()),
                uid: Some("uid-llama".to_string()),
                ..Default::default()
            },
            spec: AIDeploymentSpec {
                endpoint: domains
                    .iter()
                    .map(|d| Endpoint {
                        domain: d.to_string(),
                        port: None,
                    })
                    .collect(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn annotation(ingress: &Ingress, key: &str) -> Option<String> {
        ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key).cloned())
    }

    #[test]
    fn no_endpoint_means_no_ingress() {
        assert!(desired_ingress(&owner(&[]), 8000, &IngressConfig::default()).is_none());
    }

    #[test]
    fn one_rule_per_domain() {
        let ingress = desired_ingress(
            &owner(&["a.example.com", "b.example.com"]),
            8000,
            &IngressConfig::default(),
        )
        .expect("ingress");

        let rules = ingress
            .spec
            .as_ref()
            .and_then(|s| s.rules.as_ref())
            .expect("rules");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].host.as_deref(), Some("b.example.com"));
        let path = &rules[0].http.as_ref().expect("http").paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(path.path_type, "Prefix");
        let backend = path.backend.service.as_ref().expect("service backend");
        assert_eq!(backend.name, "llama");
        assert_eq!(backend.port.as_ref().and_then(|p| p.number), Some(8000));
        assert_eq!(annotation(&ingress, MIDDLEWARES_ANNOTATION), None);
    }

    #[test]
    fn tls_only_when_explicitly_enabled() {
        let mut dep = owner(&["a.example.com"]);
        let config = IngressConfig::default();

        let plain = desired_ingress(&dep, 8000, &config).expect("ingress");
        assert!(plain.spec.as_ref().and_then(|s| s.tls.as_ref()).is_none());

        dep.spec.ingress.tls = Some(false);
        let disabled = desired_ingress(&dep, 8000, &config).expect("ingress");
        assert!(disabled.spec.as_ref().and_then(|s| s.tls.as_ref()).is_none());

        dep.spec.ingress.tls = Some(true);
        let secured = desired_ingress(&dep, 8000, &config).expect("ingress");
        let tls = secured
            .spec
            .as_ref()
            .and_then(|s| s.tls.as_ref())
            .expect("tls");
        assert_eq!(tls[0].secret_name.as_deref(), Some("llama-tls"));
        assert_eq!(tls[0].hosts, Some(vec!["a.example.com".to_string()]));
    }

    #[test]
    fn middlewares_are_joined_rate_limit_first() {
        let mut dep = owner(&["a.example.com"]);
        dep.spec.rate_limit = true;
        dep.spec.authentication = true;

        let ingress = desired_ingress(&dep, 8000, &IngressConfig::default()).expect("ingress");

        assert_eq!(
            annotation(&ingress, MIDDLEWARES_ANNOTATION).as_deref(),
            Some("api-gateway-rate-limiter@kubernetescrd, api-gateway-auth-service@kubernetescrd")
        );
    }

    #[test]
    fn configured_middleware_names_are_used() {
        let config = IngressConfig {
            auth_middleware: "sso".to_string(),
            rate_limit_middleware: "throttle".to_string(),
        };
        assert_eq!(
            config.middlewares(false, true).as_deref(),
            Some("sso@kubernetescrd")
        );
        assert_eq!(
            config.middlewares(true, false).as_deref(),
            Some("throttle@kubernetescrd")
        );
        assert_eq!(config.middlewares(false, false), None);
    }

    #[test]
    fn user_annotations_are_kept_next_to_defaults() {
        let mut dep = owner(&["a.example.com"]);
        dep.spec.ingress.annotations = [("cert".to_string(), "letsencrypt".to_string())].into();

        let ingress = desired_ingress(&dep, 8000, &IngressConfig::default()).expect("ingress");

        assert_eq!(annotation(&ingress, "cert").as_deref(), Some("letsencrypt"));
        assert_eq!(
            annotation(&ingress, aideploy_common::ownership::DEPLOYMENT_OWNER_KEY).as_deref(),
            Some("llama")
        );
    }
}
