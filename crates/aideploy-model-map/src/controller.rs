//! AIModelMap controller implementation
//!
//! Mirrors the engine config text of every catalog variant into a ConfigMap
//! owned by the catalog. The ConfigMap is garbage-collected with the catalog;
//! a catalog that stops carrying config files has its ConfigMap removed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use aideploy_common::crd::config_map_key;
use aideploy_common::ownership::{gvk_of, identity_map, owner_references, MODEL_MAP_OWNER_KEY};
use aideploy_common::{CONFLICT_REQUEUE_SECS, FIELD_MANAGER};

use crate::crd::AIModelMap;
use crate::Error;

/// Backoff for retryable failures
pub const ERROR_REQUEUE_SECS: u64 = 30;

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations needed to publish a catalog ConfigMap
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ModelMapKubeClient: Send + Sync {
    /// Get a ConfigMap, `None` when it does not exist
    async fn get_config_map(&self, name: &str, namespace: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// Replace a ConfigMap; fails with a conflict on a stale resourceVersion
    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error>;

    /// Delete a ConfigMap; succeeds when it is already gone
    async fn delete_config_map(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ModelMapKubeClientImpl {
    client: Client,
}

impl ModelMapKubeClientImpl {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ModelMapKubeClient for ModelMapKubeClientImpl {
    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&post_params(), config_map).await?;
        Ok(())
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&config_map.name_any(), &post_params(), config_map)
            .await?;
        Ok(())
    }

    async fn delete_config_map(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for AIModelMap reconciliation
pub struct ModelMapContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn ModelMapKubeClient>,
}

impl ModelMapContext {
    /// Create a context with the given client
    pub fn new(kube: Arc<dyn ModelMapKubeClient>) -> Self {
        Self { kube }
    }

    /// Create a context on top of a Kubernetes client
    pub fn from_client(client: Client) -> Self {
        Self::new(Arc::new(ModelMapKubeClientImpl::new(client)))
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ModelMapKubeClient>) -> Self {
        Self::new(kube)
    }
}

// =============================================================================
// Desired state
// =============================================================================

/// ConfigMap publishing the engine config files of `map`
///
/// `None` when no variant carries an engine config file.
pub fn desired_config_map(map: &AIModelMap) -> Option<ConfigMap> {
    let data: BTreeMap<String, String> = map
        .spec
        .config_sections()
        .into_iter()
        .flat_map(|(engine, variants)| {
            variants.iter().filter_map(move |variant| {
                variant
                    .spec
                    .engine_config_file
                    .as_ref()
                    .filter(|text| !text.is_empty())
                    .map(|text| (config_map_key(engine, &variant.name), text.clone()))
            })
        })
        .collect();

    if data.is_empty() {
        return None;
    }

    let name = map.name_any();
    Some(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: map.namespace(),
            owner_references: owner_references(&gvk_of::<AIModelMap>(), &map.metadata),
            labels: Some(identity_map(MODEL_MAP_OWNER_KEY, &name)),
            annotations: Some(identity_map(MODEL_MAP_OWNER_KEY, &name)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile an AIModelMap
#[instrument(skip(map, ctx), fields(model_map = %map.name_any()))]
pub async fn reconcile(map: Arc<AIModelMap>, ctx: Arc<ModelMapContext>) -> Result<Action, Error> {
    let Some(namespace) = map.namespace() else {
        return Err(Error::configuration_for(
            map.name_any(),
            "AIModelMap has no namespace",
        ));
    };

    let Some(mut desired) = desired_config_map(&map) else {
        debug!("no engine config files in catalog");
        remove_published(&map, &ctx, &namespace).await?;
        return Ok(Action::await_change());
    };

    let name = desired.name_any();
    match ctx.kube.get_config_map(&name, &namespace).await? {
        None => {
            info!(config_map = %name, "creating catalog ConfigMap");
            ctx.kube.create_config_map(&namespace, &desired).await?;
        }
        Some(existing) => {
            desired.metadata.resource_version = existing.metadata.resource_version;
            debug!(config_map = %name, "updating catalog ConfigMap");
            match ctx.kube.replace_config_map(&namespace, &desired).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    info!(config_map = %name, "ConfigMap changed during update, requeueing");
                    return Ok(Action::requeue(Duration::from_secs(CONFLICT_REQUEUE_SECS)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(Action::await_change())
}

/// Delete the ConfigMap an earlier pass published for `map`
///
/// A ConfigMap of the same name that this catalog did not publish is left alone.
async fn remove_published(
    map: &AIModelMap,
    ctx: &ModelMapContext,
    namespace: &str,
) -> Result<(), Error> {
    let name = map.name_any();
    let Some(existing) = ctx.kube.get_config_map(&name, namespace).await? else {
        return Ok(());
    };

    let published = existing
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MODEL_MAP_OWNER_KEY))
        .is_some_and(|owner| *owner == name);
    if !published {
        debug!(config_map = %name, "ConfigMap not published by this catalog, leaving it");
        return Ok(());
    }

    info!(config_map = %name, "deleting catalog ConfigMap without config files");
    ctx.kube.delete_config_map(&name, namespace).await
}

/// Error policy for the AIModelMap controller
pub fn error_policy(map: Arc<AIModelMap>, error: &Error, _ctx: Arc<ModelMapContext>) -> Action {
    error!(
        ?error,
        model_map = %map.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECS))
    } else {
        Action::await_change()
    }
}
