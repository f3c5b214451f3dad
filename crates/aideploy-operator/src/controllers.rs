//! Controller wiring
//!
//! Builds the three controllers on one client and drives them until a
//! termination signal is received.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use aideploy_common::crd::{AIDeployment, AIModelMap, AutoNodeLabeler};
use aideploy_deployment::DeploymentContext;
use aideploy_model_map::ModelMapContext;
use aideploy_node_labeler::NodeLabelerContext;
use aideploy_workload::IngressConfig;

/// Server-side watch timeout, below the default client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Run every controller until shutdown
pub async fn run(client: Client, ingress: IngressConfig) {
    let deployment_ctx = Arc::new(DeploymentContext::from_client(client.clone(), ingress));
    let model_map_ctx = Arc::new(ModelMapContext::from_client(client.clone()));
    let labeler_ctx = Arc::new(NodeLabelerContext::from_client(client.clone()));

    tracing::info!("  - AIDeployment controller");
    tracing::info!("  - AIModelMap controller");
    tracing::info!("  - AutoNodeLabeler controllers (rules and nodes)");

    let deployment_controller = Controller::new(
        Api::<AIDeployment>::all(client.clone()),
        watcher_config(),
    )
    .owns(Api::<Deployment>::all(client.clone()), watcher_config())
    .owns(Api::<Service>::all(client.clone()), watcher_config())
    .owns(Api::<Ingress>::all(client.clone()), watcher_config())
    .shutdown_on_signal()
    .run(
        aideploy_deployment::reconcile,
        aideploy_deployment::error_policy,
        deployment_ctx,
    )
    .for_each(|result| async move {
        match result {
            Ok(action) => {
                tracing::debug!(?action, "AIDeployment reconciliation completed");
            }
            Err(e) => {
                tracing::error!(error = ?e, "AIDeployment reconciliation error");
            }
        }
    });

    let model_map_controller = Controller::new(
        Api::<AIModelMap>::all(client.clone()),
        watcher_config(),
    )
    .owns(Api::<ConfigMap>::all(client.clone()), watcher_config())
    .shutdown_on_signal()
    .run(
        aideploy_model_map::reconcile,
        aideploy_model_map::error_policy,
        model_map_ctx,
    )
    .for_each(|result| async move {
        match result {
            Ok(action) => {
                tracing::debug!(?action, "AIModelMap reconciliation completed");
            }
            Err(e) => {
                tracing::error!(error = ?e, "AIModelMap reconciliation error");
            }
        }
    });

    let rule_controller = Controller::new(
        Api::<AutoNodeLabeler>::all(client.clone()),
        watcher_config(),
    )
    .shutdown_on_signal()
    .run(
        aideploy_node_labeler::reconcile_rule,
        aideploy_node_labeler::error_policy,
        labeler_ctx.clone(),
    )
    .for_each(|result| async move {
        match result {
            Ok(action) => {
                tracing::debug!(?action, "AutoNodeLabeler reconciliation completed");
            }
            Err(e) => {
                tracing::error!(error = ?e, "AutoNodeLabeler reconciliation error");
            }
        }
    });

    let node_controller = Controller::new(Api::<Node>::all(client), watcher_config())
        .shutdown_on_signal()
        .run(
            aideploy_node_labeler::reconcile_node,
            aideploy_node_labeler::error_policy,
            labeler_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Node labelling completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Node labelling error");
                }
            }
        });

    futures::join!(
        deployment_controller,
        model_map_controller,
        rule_controller,
        node_controller
    );
}
