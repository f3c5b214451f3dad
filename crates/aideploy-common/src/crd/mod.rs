//! Custom Resource Definitions for the AI deployment operator

mod deployment;
mod model_map;
mod node_labeler;

pub use deployment::{
    AIDeployment, AIDeploymentSpec, AIDeploymentStatus, Accelerator, AcceleratorInterface,
    DeploymentOverlay, DeploymentPhase, Endpoint, EngineSelection, IngressOverlay,
    InterfaceVersion, MetadataOverlay, ModelMapReference, ModelReference, ProbeOverride,
};
pub use model_map::{
    config_map_key, AIModelMap, AIModelMapSpec, AIModelSpec, ModelVariant, ENGINE_CONFIG_FIELD,
    ENGINE_DEEPSPEED_MII, ENGINE_GENERIC, ENGINE_LOCALAI, ENGINE_VLLM,
};
pub use node_labeler::{AutoNodeLabeler, AutoNodeLabelerSpec, MatchOperator, NodeMatchExpression};

use kube::CustomResourceExt;

/// Every CRD served by the operator, in installation order
pub fn all_crds(
) -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![AIDeployment::crd(), AIModelMap::crd(), AutoNodeLabeler::crd()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crds_carry_expected_names() {
        let names: Vec<String> = all_crds()
            .into_iter()
            .filter_map(|crd| crd.metadata.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "aideployments.premlabs.io",
                "aimodelmaps.premlabs.io",
                "autonodelabelers.premlabs.io",
            ]
        );
    }

    #[test]
    fn node_labeler_is_cluster_scoped() {
        assert_eq!(AutoNodeLabeler::crd().spec.scope, "Cluster");
        assert_eq!(AIDeployment::crd().spec.scope, "Namespaced");
    }
}
