//! AutoNodeLabeler controller implementation
//!
//! Two event sources drive the same operation: a rule change applies that
//! rule to every node, a node change applies every rule to that node.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use aideploy_common::FIELD_MANAGER;

use crate::crd::AutoNodeLabeler;
use crate::Error;

/// Backoff for retryable failures
pub const ERROR_REQUEUE_SECS: u64 = 30;

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations needed to label nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeLabelerKubeClient: Send + Sync {
    /// List every node of the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// List every AutoNodeLabeler rule
    async fn list_rules(&self) -> Result<Vec<AutoNodeLabeler>, Error>;

    /// Merge `labels` into the labels of node `name`
    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct NodeLabelerKubeClientImpl {
    client: Client,
}

impl NodeLabelerKubeClientImpl {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeLabelerKubeClient for NodeLabelerKubeClientImpl {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_rules(&self) -> Result<Vec<AutoNodeLabeler>, Error> {
        let api: Api<AutoNodeLabeler> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(
            name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for node labelling
pub struct NodeLabelerContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn NodeLabelerKubeClient>,
}

impl NodeLabelerContext {
    /// Create a context with the given client
    pub fn new(kube: Arc<dyn NodeLabelerKubeClient>) -> Self {
        Self { kube }
    }

    /// Create a context on top of a Kubernetes client
    pub fn from_client(client: Client) -> Self {
        Self::new(Arc::new(NodeLabelerKubeClientImpl::new(client)))
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn NodeLabelerKubeClient>) -> Self {
        Self::new(kube)
    }
}

// =============================================================================
// Matching
// =============================================================================

/// Labels `rule` would add to `node`
///
/// `None` when the node does not match the rule or already carries every
/// rule label with the rule's value.
pub fn labels_to_apply(rule: &AutoNodeLabeler, node: &Node) -> Option<BTreeMap<String, String>> {
    let current = node.labels();
    if !rule.spec.match_expression.matches(current) {
        return None;
    }

    let up_to_date = rule
        .spec
        .labels
        .iter()
        .all(|(k, v)| current.get(k) == Some(v));
    if up_to_date || rule.spec.labels.is_empty() {
        return None;
    }

    Some(rule.spec.labels.clone())
}

/// Label one node with one rule; failures are logged and swallowed
async fn label_node(ctx: &NodeLabelerContext, rule: &AutoNodeLabeler, node: &Node) -> bool {
    let Some(labels) = labels_to_apply(rule, node) else {
        return false;
    };

    let node_name = node.name_any();
    match ctx.kube.patch_node_labels(&node_name, &labels).await {
        Ok(()) => {
            info!(node = %node_name, rule = %rule.name_any(), "labelled node");
            true
        }
        Err(e) => {
            warn!(error = %e, node = %node_name, rule = %rule.name_any(), "failed to label node");
            false
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Apply one rule to every node
#[instrument(skip(rule, ctx), fields(rule = %rule.name_any()))]
pub async fn reconcile_rule(
    rule: Arc<AutoNodeLabeler>,
    ctx: Arc<NodeLabelerContext>,
) -> Result<Action, Error> {
    let nodes = ctx.kube.list_nodes().await?;

    let mut labelled = 0usize;
    for node in &nodes {
        if label_node(&ctx, &rule, node).await {
            labelled += 1;
        }
    }

    debug!(nodes = nodes.len(), labelled, "rule applied");
    Ok(Action::await_change())
}

/// Apply every rule to one node
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile_node(node: Arc<Node>, ctx: Arc<NodeLabelerContext>) -> Result<Action, Error> {
    let rules = ctx.kube.list_rules().await?;

    let mut current = (*node).clone();
    for rule in &rules {
        if label_node(&ctx, rule, &current).await {
            // later rules must see labels written by earlier ones
            current
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(rule.spec.labels.clone());
        }
    }

    debug!(rules = rules.len(), "node checked against rules");
    Ok(Action::await_change())
}

/// Error policy shared by the rule and node controllers
pub fn error_policy<K: ResourceExt>(
    obj: Arc<K>,
    error: &Error,
    _ctx: Arc<NodeLabelerContext>,
) -> Action {
    error!(
        ?error,
        object = %obj.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECS))
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AutoNodeLabelerSpec, MatchOperator, NodeMatchExpression};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;

    const GPU_KEY: &str = "nvidia.com/gpu.product";

    fn sample_node(name: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sample_rule(name: &str, operator: MatchOperator, values: &[&str], label: &str) -> AutoNodeLabeler {
        AutoNodeLabeler {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: AutoNodeLabelerSpec {
                match_expression: NodeMatchExpression {
                    key: GPU_KEY.to_string(),
                    operator,
                    values: values.iter().map(|v| v.to_string()).collect(),
                },
                labels: BTreeMap::from([("premlabs.io/gpu-class".to_string(), label.to_string())]),
            },
        }
    }

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    fn context(mock: MockNodeLabelerKubeClient) -> Arc<NodeLabelerContext> {
        Arc::new(NodeLabelerContext::for_testing(Arc::new(mock)))
    }

    #[test]
    fn matching_node_gets_rule_labels() {
        let rule = sample_rule("large", MatchOperator::In, &["A100", "H100"], "large");
        let node = sample_node("gpu-1", &[(GPU_KEY, "A100")]);

        let labels = labels_to_apply(&rule, &node).expect("labels");
        assert_eq!(labels["premlabs.io/gpu-class"], "large");
    }

    #[test]
    fn non_matching_node_is_left_alone() {
        let rule = sample_rule("large", MatchOperator::In, &["A100"], "large");
        assert!(labels_to_apply(&rule, &sample_node("gpu-1", &[(GPU_KEY, "T4")])).is_none());
        assert!(labels_to_apply(&rule, &sample_node("cpu-1", &[])).is_none());
    }

    #[test]
    fn labelled_node_is_skipped() {
        let rule = sample_rule("any-gpu", MatchOperator::Exists, &[], "gpu");
        let node = sample_node(
            "gpu-1",
            &[(GPU_KEY, "T4"), ("premlabs.io/gpu-class", "gpu")],
        );
        assert!(labels_to_apply(&rule, &node).is_none());
    }

    #[test]
    fn stale_label_value_is_overwritten() {
        let rule = sample_rule("any-gpu", MatchOperator::Exists, &[], "gpu");
        let node = sample_node(
            "gpu-1",
            &[(GPU_KEY, "T4"), ("premlabs.io/gpu-class", "old")],
        );
        assert_eq!(
            labels_to_apply(&rule, &node).expect("labels")["premlabs.io/gpu-class"],
            "gpu"
        );
    }

    /// Story: a new rule labels every matching node and skips the rest
    #[tokio::test]
    async fn story_rule_labels_matching_nodes() {
        let patched = Arc::new(Mutex::new(Vec::new()));

        let mut mock = MockNodeLabelerKubeClient::new();
        mock.expect_list_nodes().returning(|| {
            Ok(vec![
                sample_node("gpu-1", &[(GPU_KEY, "A100")]),
                sample_node("gpu-2", &[(GPU_KEY, "T4")]),
                sample_node("cpu-1", &[]),
            ])
        });
        let sink = patched.clone();
        mock.expect_patch_node_labels().returning(move |name, _| {
            sink.lock().unwrap().push(name.to_string());
            Ok(())
        });

        let rule = sample_rule("any-gpu", MatchOperator::Exists, &[], "gpu");
        let action = reconcile_rule(Arc::new(rule), context(mock))
            .await
            .expect("reconcile should succeed");

        assert_eq!(action, Action::await_change());
        assert_eq!(*patched.lock().unwrap(), vec!["gpu-1", "gpu-2"]);
    }

    /// Story: a failing node does not stop the others from being labelled
    #[tokio::test]
    async fn story_node_failure_does_not_abort_pass() {
        let mut mock = MockNodeLabelerKubeClient::new();
        mock.expect_list_nodes().returning(|| {
            Ok(vec![
                sample_node("gpu-1", &[(GPU_KEY, "A100")]),
                sample_node("gpu-2", &[(GPU_KEY, "A100")]),
            ])
        });
        mock.expect_patch_node_labels()
            .withf(|name, _| name == "gpu-1")
            .returning(|_, _| Err(api_error(500)));
        mock.expect_patch_node_labels()
            .withf(|name, _| name == "gpu-2")
            .times(1)
            .returning(|_, _| Ok(()));

        let rule = sample_rule("any-gpu", MatchOperator::Exists, &[], "gpu");
        reconcile_rule(Arc::new(rule), context(mock))
            .await
            .expect("per-node failures are logged");
    }

    /// Story: a joining node receives the labels of every matching rule
    #[tokio::test]
    async fn story_new_node_gets_all_matching_rules() {
        let mut mock = MockNodeLabelerKubeClient::new();
        mock.expect_list_rules().returning(|| {
            let mut zone = sample_rule("zone", MatchOperator::Exists, &[], "unused");
            zone.spec.labels = BTreeMap::from([("premlabs.io/pool".to_string(), "gpu".to_string())]);
            Ok(vec![
                sample_rule("large", MatchOperator::In, &["H100"], "large"),
                sample_rule("small", MatchOperator::In, &["T4"], "small"),
                zone,
            ])
        });
        mock.expect_patch_node_labels()
            .withf(|_, labels| labels.get("premlabs.io/gpu-class").map(String::as_str) == Some("large"))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_patch_node_labels()
            .withf(|_, labels| labels.contains_key("premlabs.io/pool"))
            .times(1)
            .returning(|_, _| Ok(()));

        let node = sample_node("gpu-9", &[(GPU_KEY, "H100")]);
        let action = reconcile_node(Arc::new(node), context(mock))
            .await
            .expect("reconcile should succeed");

        assert_eq!(action, Action::await_change());
    }

    /// Story: listing failures surface to the error policy
    #[tokio::test]
    async fn story_list_failure_is_retried() {
        let mut mock = MockNodeLabelerKubeClient::new();
        mock.expect_list_nodes().returning(|| Err(api_error(503)));

        let rule = Arc::new(sample_rule("any-gpu", MatchOperator::Exists, &[], "gpu"));
        let ctx = context(mock);
        let err = reconcile_rule(rule.clone(), ctx.clone())
            .await
            .expect_err("list errors propagate");

        assert_eq!(
            error_policy(rule, &err, ctx),
            Action::requeue(Duration::from_secs(30))
        );
    }
}
