//! AIDeployment controller implementation
//!
//! Each pass re-reads the resource, renders the desired engine Deployment,
//! writes it, reports readiness and then exposes the workload through a
//! Service and, when endpoints are declared, an Ingress. Every step is
//! idempotent; the live cluster plus the resource status is the only state.
//!
//! Spec problems end as a `Failed` status and wait for an edit. API failures
//! are handed back to the runtime and never written into the status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use aideploy_common::{CONFLICT_REQUEUE_SECS, FIELD_MANAGER};
use aideploy_workload::engine::append_engine_args;
use aideploy_workload::{
    add_scheduling_properties, desired_ingress, desired_service, resolve_models, EngineRegistry,
    IngressConfig, ModelCatalogSource,
};

use crate::crd::{AIDeployment, AIDeploymentStatus, AIModelMap, DeploymentPhase};
use crate::Error;

/// Delay before looking again at a Deployment without available replicas
pub const NOT_READY_REQUEUE_SECS: u64 = 3;

/// Backoff for retryable failures
pub const ERROR_REQUEUE_SECS: u64 = 30;

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations needed to reconcile an AIDeployment
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentKubeClient: Send + Sync {
    /// Get an AIDeployment, `None` when it no longer exists
    async fn get_ai_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<AIDeployment>, Error>;

    /// Merge-patch the status, guarded by `resource_version` when given
    async fn patch_ai_deployment_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &AIDeploymentStatus,
    ) -> Result<(), Error>;

    /// Get an AIModelMap, `None` when it does not exist
    async fn get_model_map(&self, name: &str, namespace: &str)
        -> Result<Option<AIModelMap>, Error>;

    /// Get a Deployment, `None` when it does not exist
    async fn get_deployment(&self, name: &str, namespace: &str)
        -> Result<Option<Deployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    /// Replace a Deployment; fails with a conflict on a stale resourceVersion
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    /// Get a Service, `None` when it does not exist
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    /// Replace a Service
    async fn replace_service(&self, namespace: &str, service: &Service)
        -> Result<Service, Error>;

    /// Get an Ingress, `None` when it does not exist
    async fn get_ingress(&self, name: &str, namespace: &str) -> Result<Option<Ingress>, Error>;

    /// Create an Ingress
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, Error>;

    /// Replace an Ingress
    async fn replace_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, Error>;
}

/// Real Kubernetes client implementation
pub struct DeploymentKubeClientImpl {
    client: Client,
}

impl DeploymentKubeClientImpl {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

async fn get_optional<K>(api: Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Merge patch body replacing the whole status
///
/// Unset fields are sent as `null`: a merge patch leaves absent keys alone,
/// so an `errMsg` from an earlier failure would otherwise survive.
fn status_patch(resource_version: Option<&str>, status: &AIDeploymentStatus) -> serde_json::Value {
    let mut patch = serde_json::json!({
        "status": {
            "status": status.status,
            "errMsg": status.err_msg,
        }
    });
    if let Some(rv) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    patch
}

#[async_trait]
impl DeploymentKubeClient for DeploymentKubeClientImpl {
    async fn get_ai_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<AIDeployment>, Error> {
        get_optional(self.api(namespace), name).await
    }

    async fn patch_ai_deployment_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &AIDeploymentStatus,
    ) -> Result<(), Error> {
        let api: Api<AIDeployment> = self.api(namespace);
        let patch = status_patch(resource_version.as_deref(), status);

        api.patch_status(
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

    async fn get_model_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<AIModelMap>, Error> {
        get_optional(self.api(namespace), name).await
    }

    async fn get_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        get_optional(self.api(namespace), name).await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = self.api(namespace);
        Ok(api.create(&post_params(), deployment).await?)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = self.api(namespace);
        Ok(api
            .replace(&deployment.name_any(), &post_params(), deployment)
            .await?)
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        get_optional(self.api(namespace), name).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = self.api(namespace);
        Ok(api.create(&post_params(), service).await?)
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, Error> {
        let api: Api<Service> = self.api(namespace);
        Ok(api.replace(&service.name_any(), &post_params(), service).await?)
    }

    async fn get_ingress(&self, name: &str, namespace: &str) -> Result<Option<Ingress>, Error> {
        get_optional(self.api(namespace), name).await
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, Error> {
        let api: Api<Ingress> = self.api(namespace);
        Ok(api.create(&post_params(), ingress).await?)
    }

    async fn replace_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, Error> {
        let api: Api<Ingress> = self.api(namespace);
        Ok(api.replace(&ingress.name_any(), &post_params(), ingress).await?)
    }
}

/// Catalog lookups served by the controller's client
struct KubeCatalog<'a>(&'a dyn DeploymentKubeClient);

#[async_trait]
impl ModelCatalogSource for KubeCatalog<'_> {
    async fn get_model_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<AIModelMap>, Error> {
        self.0.get_model_map(name, namespace).await
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for AIDeployment reconciliation
pub struct DeploymentContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn DeploymentKubeClient>,
    /// Engine adapters by identifier
    pub engines: EngineRegistry,
    /// Middleware names for generated ingresses
    pub ingress: IngressConfig,
}

impl DeploymentContext {
    /// Create a context from its parts
    pub fn new(
        kube: Arc<dyn DeploymentKubeClient>,
        engines: EngineRegistry,
        ingress: IngressConfig,
    ) -> Self {
        Self {
            kube,
            engines,
            ingress,
        }
    }

    /// Create a context with the built-in engines on top of a Kubernetes client
    pub fn from_client(client: Client, ingress: IngressConfig) -> Self {
        Self::new(
            Arc::new(DeploymentKubeClientImpl::new(client)),
            EngineRegistry::with_builtin_engines(),
            ingress,
        )
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn DeploymentKubeClient>) -> Self {
        Self::new(kube, EngineRegistry::default(), IngressConfig::default())
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Engine Deployment ready to be written, with the port it serves on
struct RenderedWorkload {
    deployment: Deployment,
    port: i32,
}

/// Reconcile an AIDeployment
///
/// Requeues quickly while the Deployment has no available replica and after
/// losing an update race; otherwise waits for the next change.
#[instrument(skip(ai, ctx), fields(aideployment = %ai.key()))]
pub async fn reconcile(ai: Arc<AIDeployment>, ctx: Arc<DeploymentContext>) -> Result<Action, Error> {
    let name = ai.name_any();
    let Some(namespace) = ai.namespace() else {
        return Err(Error::configuration_for(name, "AIDeployment has no namespace"));
    };
    info!("reconciling AI deployment");

    // the watch cache may lag behind a status write of the previous pass
    let Some(current) = ctx.kube.get_ai_deployment(&name, &namespace).await? else {
        debug!("AI deployment no longer exists");
        return Ok(Action::await_change());
    };

    let rendered = match render(&current, &ctx).await {
        Ok(rendered) => rendered,
        Err(e) if e.is_configuration() => {
            let message = e.status_message();
            warn!(error = %message, "AI deployment cannot be materialized");
            update_status(&current, &ctx, AIDeploymentStatus::failed(message)).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    let Some(applied) = apply_deployment(&ctx, &namespace, rendered.deployment).await? else {
        info!("deployment changed during update, requeueing");
        return Ok(Action::requeue(Duration::from_secs(CONFLICT_REQUEUE_SECS)));
    };

    let phase = if available_replicas(&applied) > 0 {
        DeploymentPhase::Ready
    } else {
        DeploymentPhase::NotReady
    };
    update_status(&current, &ctx, AIDeploymentStatus::with_phase(phase)).await?;

    let service = desired_service(&current, &applied, rendered.port);
    apply_service(&ctx, &namespace, service).await?;

    match desired_ingress(&current, rendered.port, &ctx.ingress) {
        Some(ingress) => apply_ingress(&ctx, &namespace, ingress).await?,
        None => debug!("no endpoint declared, skipping ingress"),
    }

    debug!(%phase, "reconcile completed");
    Ok(match phase {
        DeploymentPhase::Ready => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(NOT_READY_REQUEUE_SECS)),
    })
}

/// Error policy for the AIDeployment controller
///
/// Conflicts retry after a short fixed delay and every other API failure
/// after a backoff. Configuration errors wait for a spec change.
pub fn error_policy(ai: Arc<AIDeployment>, error: &Error, _ctx: Arc<DeploymentContext>) -> Action {
    error!(
        ?error,
        aideployment = %ai.key(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_conflict() {
        Action::requeue(Duration::from_secs(CONFLICT_REQUEUE_SECS))
    } else if error.is_retryable() {
        Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECS))
    } else {
        Action::await_change()
    }
}

/// Resolve models, build the engine Deployment and add scheduling properties
async fn render(ai: &AIDeployment, ctx: &DeploymentContext) -> Result<RenderedWorkload, Error> {
    let models = resolve_models(ai, &KubeCatalog(ctx.kube.as_ref())).await?;
    let engine = ctx.engines.build(ai, models)?;

    let mut deployment = engine.build_deployment(&ai.metadata)?;
    append_engine_args(&mut deployment, &ai.spec.args);
    add_scheduling_properties(&mut deployment, ai)?;

    debug!(engine = engine.name(), port = engine.port(), "rendered engine deployment");
    Ok(RenderedWorkload {
        deployment,
        port: engine.port(),
    })
}

/// Create or replace the Deployment; `None` when the replace lost a race
async fn apply_deployment(
    ctx: &DeploymentContext,
    namespace: &str,
    mut desired: Deployment,
) -> Result<Option<Deployment>, Error> {
    let name = desired.name_any();
    match ctx.kube.get_deployment(&name, namespace).await? {
        None => {
            info!(deployment = %name, "creating deployment");
            Ok(Some(ctx.kube.create_deployment(namespace, &desired).await?))
        }
        Some(existing) => {
            desired.metadata.resource_version = existing.metadata.resource_version;
            debug!(deployment = %name, "updating deployment");
            match ctx.kube.replace_deployment(namespace, &desired).await {
                Ok(applied) => Ok(Some(applied)),
                Err(e) if e.is_conflict() => Ok(None),
                Err(e) => Err(e),
            }
        }
    }
}

async fn apply_service(
    ctx: &DeploymentContext,
    namespace: &str,
    mut desired: Service,
) -> Result<(), Error> {
    let name = desired.name_any();
    match ctx.kube.get_service(&name, namespace).await? {
        None => {
            debug!(service = %name, "creating service");
            ctx.kube.create_service(namespace, &desired).await?;
        }
        Some(existing) => {
            desired.metadata.resource_version = existing.metadata.resource_version;
            // cluster IPs are immutable once allocated
            if let (Some(spec), Some(current)) = (desired.spec.as_mut(), existing.spec) {
                spec.cluster_ip = current.cluster_ip;
                spec.cluster_ips = current.cluster_ips;
            }
            debug!(service = %name, "updating service");
            ctx.kube.replace_service(namespace, &desired).await?;
        }
    }
    Ok(())
}

async fn apply_ingress(
    ctx: &DeploymentContext,
    namespace: &str,
    mut desired: Ingress,
) -> Result<(), Error> {
    let name = desired.name_any();
    match ctx.kube.get_ingress(&name, namespace).await? {
        None => {
            debug!(ingress = %name, "creating ingress");
            ctx.kube.create_ingress(namespace, &desired).await?;
        }
        Some(existing) => {
            desired.metadata.resource_version = existing.metadata.resource_version;
            debug!(ingress = %name, "updating ingress");
            ctx.kube.replace_ingress(namespace, &desired).await?;
        }
    }
    Ok(())
}

fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0)
}

/// Patch the status unless it already matches
///
/// Skipping identical writes keeps the controller from re-triggering itself.
async fn update_status(
    ai: &AIDeployment,
    ctx: &DeploymentContext,
    status: AIDeploymentStatus,
) -> Result<(), Error> {
    if ai.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }

    ctx.kube
        .patch_ai_deployment_status(
            &ai.name_any(),
            &ai.namespace().unwrap_or_default(),
            ai.resource_version(),
            &status,
        )
        .await
}

// =============================================================================
// Tests
// =============================================================================
