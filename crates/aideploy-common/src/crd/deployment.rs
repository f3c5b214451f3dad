//! AIDeployment CRD types
//!
//! An `AIDeployment` describes one served model: which inference engine runs
//! it, which models it loads, how it is exposed, and scheduling hints for the
//! pods. The controller turns it into a Deployment, a Service and an optional
//! Ingress.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{EnvVar, PodTemplateSpec, ResourceRequirements};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::model_map::AIModelSpec;

/// Specification for an AIDeployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "premlabs.io",
    version = "v1alpha1",
    kind = "AIDeployment",
    plural = "aideployments",
    shortname = "aid",
    namespaced,
    status = "AIDeploymentStatus",
    printcolumn = r#"{"name":"Engine","type":"string","jsonPath":".spec.engine.name"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AIDeploymentSpec {
    /// External endpoints; the first one also fixes the generic engine's port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoint: Vec<Endpoint>,

    /// Inference engine selection
    pub engine: EngineSelection,

    /// Attach the rate-limit middleware to the ingress
    #[serde(default, rename = "ratelimit")]
    pub rate_limit: bool,

    /// Attach the authentication middleware to the ingress
    #[serde(default, rename = "auth")]
    pub authentication: bool,

    /// Environment for the engine container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Extra arguments appended to the engine container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Service metadata overlay
    #[serde(default)]
    pub service: MetadataOverlay,

    /// Pod-level settings
    #[serde(default)]
    pub deployment: DeploymentOverlay,

    /// Ingress metadata overlay and TLS switch
    #[serde(default)]
    pub ingress: IngressOverlay,

    /// Models served by the engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelReference>,
}

/// An externally reachable host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Host name routed to the service
    pub domain: String,

    /// Port the workload listens on (generic engine only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Engine identifier plus free-form engine options
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSelection {
    /// Engine identifier (`localai`, `vllm`, `deepspeed-mii`, `generic`)
    pub name: String,

    /// Engine options such as `imageRepository` or `dtype`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl EngineSelection {
    /// Non-empty option value
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Labels and annotations applied to a generated object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataOverlay {
    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Ingress metadata overlay
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressOverlay {
    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Terminate TLS at the ingress with a `<service>-tls` secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<bool>,
}

/// Pod-level settings of the generated Deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOverlay {
    /// Extra pod template labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra pod template annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Accelerator contract; required before any GPU is scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator: Option<Accelerator>,

    /// Requests and limits for the engine container
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Node selector merged over the template's
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Base pod template; mandatory for the generic engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,

    /// Startup probe override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<ProbeOverride>,

    /// Readiness probe override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ProbeOverride>,

    /// Liveness probe override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ProbeOverride>,
}

/// Numeric probe settings a user may override
///
/// The probe handler always comes from the engine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOverride {
    /// Seconds after container start before the first probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,

    /// Seconds after which a probe attempt times out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    /// Seconds between probe attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,

    /// Consecutive successes to be considered healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i32>,

    /// Consecutive failures to be considered unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,

    /// Grace period for pod termination after a probe failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

/// Accelerator programming interface
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AcceleratorInterface {
    /// NVIDIA CUDA
    #[serde(rename = "CUDA")]
    Cuda,
    /// AMD ROCm
    #[serde(rename = "ROCm")]
    Rocm,
    /// OpenCL
    #[serde(rename = "OpenCL")]
    OpenCl,
}

impl fmt::Display for AcceleratorInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => f.write_str("CUDA"),
            Self::Rocm => f.write_str("ROCm"),
            Self::OpenCl => f.write_str("OpenCL"),
        }
    }
}

/// Minimum accelerator interface version
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceVersion {
    /// Major version
    pub major: i32,
    /// Minor version
    #[serde(default)]
    pub minor: i32,
}

/// Accelerator requirement of the workload
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Accelerator {
    /// Required programming interface
    pub interface: AcceleratorInterface,

    /// Minimum interface version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<InterfaceVersion>,
}

/// One model served by the deployment
///
/// Either an inline model specification, a pointer into an `AIModelMap`, or
/// both (inline fields then override the catalog variant).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelReference {
    /// Catalog variant to start from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_map_ref: Option<ModelMapReference>,

    /// Inline model specification
    #[serde(flatten)]
    pub spec: AIModelSpec,

    /// Model-specific options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// Pointer to a named variant in an `AIModelMap`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelMapReference {
    /// Catalog namespace; defaults to the deployment's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Catalog name
    #[serde(default)]
    pub name: String,

    /// Variant name within the engine's list
    #[serde(default)]
    pub variant: String,
}

/// Convergence state reported on the resource
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentPhase {
    /// At least one replica is available
    Ready,
    /// Objects are applied but no replica is available yet
    NotReady,
    /// The spec cannot be materialized
    Failed,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("Ready"),
            Self::NotReady => f.write_str("NotReady"),
            Self::Failed => f.write_str("Failed"),
        }
    }
}

/// Status of an AIDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AIDeploymentStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentPhase>,

    /// Error message when the phase is Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

impl AIDeploymentStatus {
    /// Status with the given phase and no message
    pub fn with_phase(phase: DeploymentPhase) -> Self {
        Self {
            status: Some(phase),
            err_msg: None,
        }
    }

    /// Failed status carrying a message
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(DeploymentPhase::Failed),
            err_msg: Some(message.into()),
        }
    }
}

impl AIDeployment {
    /// `namespace/name` identifier used in log lines and error messages
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_SPEC: &str = r#"
endpoint:
  - domain: llama.example.com
    port: 9000
engine:
  name: vllm
  options:
    dtype: float16
ratelimit: true
auth: true
args: ["--max-model-len", "4096"]
deployment:
  accelerator:
    interface: CUDA
    minVersion:
      major: 12
  resources:
    requests:
      memory: 16Gi
  nodeSelector:
    gpu: a100
  replicas: 2
  readinessProbe:
    failureThreshold: 9
ingress:
  tls: true
models:
  - modelMapRef:
      name: llama
      variant: 8b
    dataType: bfloat16
"#;

    #[test]
    fn full_spec_parses() {
        let spec: AIDeploymentSpec = serde_yaml::from_str(FULL_SPEC).expect("valid spec");

        assert_eq!(spec.endpoint[0].domain, "llama.example.com");
        assert_eq!(spec.endpoint[0].port, Some(9000));
        assert_eq!(spec.engine.name, "vllm");
        assert_eq!(spec.engine.option("dtype"), Some("float16"));
        assert!(spec.rate_limit);
        assert!(spec.authentication);
        assert_eq!(spec.args, vec!["--max-model-len", "4096"]);

        let accel = spec.deployment.accelerator.as_ref().expect("accelerator");
        assert_eq!(accel.interface, AcceleratorInterface::Cuda);
        assert_eq!(accel.min_version.as_ref().map(|v| v.major), Some(12));
        assert_eq!(spec.deployment.replicas, Some(2));
        assert_eq!(
            spec.deployment
                .readiness_probe
                .as_ref()
                .and_then(|p| p.failure_threshold),
            Some(9)
        );
        assert_eq!(spec.ingress.tls, Some(true));

        let model = &spec.models[0];
        let map_ref = model.model_map_ref.as_ref().expect("catalog ref");
        assert_eq!(map_ref.name, "llama");
        assert_eq!(map_ref.variant, "8b");
        assert_eq!(map_ref.namespace, None);
        assert_eq!(model.spec.data_type.as_deref(), Some("bfloat16"));
    }

    #[test]
    fn minimal_spec_defaults_everything_else() {
        let spec: AIDeploymentSpec =
            serde_yaml::from_str("engine:\n  name: localai\n").expect("valid spec");
        assert!(spec.endpoint.is_empty());
        assert!(!spec.rate_limit);
        assert!(spec.deployment.template.is_none());
        assert!(spec.models.is_empty());
    }

    #[test]
    fn unknown_accelerator_interface_is_rejected_at_decode() {
        let yaml = "engine:\n  name: vllm\ndeployment:\n  accelerator:\n    interface: Metal\n";
        assert!(serde_yaml::from_str::<AIDeploymentSpec>(yaml).is_err());
    }

    #[test]
    fn empty_engine_option_counts_as_unset() {
        let engine = EngineSelection {
            name: "localai".to_string(),
            options: BTreeMap::from([("imageTag".to_string(), String::new())]),
        };
        assert_eq!(engine.option("imageTag"), None);
    }

    #[test]
    fn status_serializes_with_wire_names() {
        let status = AIDeploymentStatus::failed("unknown engine bogus");
        let json = serde_json::to_value(&status).expect("serializable");
        assert_eq!(json["status"], "Failed");
        assert_eq!(json["errMsg"], "unknown engine bogus");

        let ready = serde_json::to_value(AIDeploymentStatus::with_phase(DeploymentPhase::Ready))
            .expect("serializable");
        assert_eq!(ready, serde_json::json!({"status": "Ready"}));
    }

    #[test]
    fn phase_display_matches_wire_value() {
        assert_eq!(DeploymentPhase::NotReady.to_string(), "NotReady");
        assert_eq!(AcceleratorInterface::Rocm.to_string(), "ROCm");
    }
}
