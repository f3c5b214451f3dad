//! Model resolution
//!
//! Turns the model references of an `AIDeployment` into concrete model
//! specifications. Inline references are taken verbatim; catalog references
//! are looked up in an `AIModelMap` and layered under the inline fields.

use std::collections::HashSet;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use aideploy_common::naming::slug;

use crate::crd::{AIDeployment, AIModelMap, AIModelSpec, ModelReference, ENGINE_GENERIC};
use crate::{Error, Result};

/// Catalog variant a resolved model came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogSource {
    /// AIModelMap name (also the name of its ConfigMap)
    pub catalog: String,
    /// Variant name within the engine's list
    pub variant: String,
}

/// A model ready to be handed to an engine
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedModel {
    /// Stable slug used to name init containers and projected files
    pub name: String,
    /// Catalog origin, `None` for inline models
    pub source: Option<CatalogSource>,
    /// Final model specification
    pub spec: AIModelSpec,
}

impl ResolvedModel {
    /// Model declared inline on the deployment
    pub fn inline(deployment_name: &str, spec: AIModelSpec) -> Self {
        Self {
            name: slug(&format!("{deployment_name}-model")),
            source: None,
            spec,
        }
    }

    /// Model taken from a catalog variant
    pub fn from_catalog(catalog: &str, variant: &str, spec: AIModelSpec) -> Self {
        Self {
            name: slug(&format!("{catalog}-{variant}")),
            source: Some(CatalogSource {
                catalog: catalog.to_string(),
                variant: variant.to_string(),
            }),
            spec,
        }
    }

    /// Variant name when the model came from a catalog
    pub fn variant(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.variant.as_str())
    }
}

/// Read access to model catalogs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ModelCatalogSource: Send + Sync {
    /// Fetch an AIModelMap, `None` when it does not exist
    async fn get_model_map(&self, name: &str, namespace: &str) -> Result<Option<AIModelMap>>;
}

/// Resolve every model reference of `deployment`, in order
///
/// Fails on the first invalid reference without returning partial results.
/// Model names are unique within the result: a repeated name gets a `-2`,
/// `-3`, ... suffix in declaration order.
pub async fn resolve_models(
    deployment: &AIDeployment,
    catalogs: &dyn ModelCatalogSource,
) -> Result<Vec<ResolvedModel>> {
    let mut resolved = Vec::with_capacity(deployment.spec.models.len());
    let mut taken = HashSet::new();
    for reference in &deployment.spec.models {
        let mut model = resolve_one(deployment, reference, catalogs).await?;
        model.name = unique_name(&model.name, &taken);
        taken.insert(model.name.clone());
        resolved.push(model);
    }
    Ok(resolved)
}

fn unique_name(base: &str, taken: &HashSet<String>) -> String {
    let mut candidate = base.to_string();
    let mut ordinal = 1;
    while taken.contains(&candidate) {
        ordinal += 1;
        candidate = format!("{base}-{ordinal}");
    }
    candidate
}

async fn resolve_one(
    deployment: &AIDeployment,
    reference: &ModelReference,
    catalogs: &dyn ModelCatalogSource,
) -> Result<ResolvedModel> {
    let key = deployment.key();

    let Some(map_ref) = reference.model_map_ref.as_ref() else {
        return Ok(ResolvedModel::inline(
            &deployment.name_any(),
            reference.spec.clone(),
        ));
    };

    if map_ref.name.is_empty() {
        return Err(Error::configuration_for(
            &key,
            "modelMapRef has no name",
        ));
    }
    if map_ref.variant.is_empty() {
        return Err(Error::configuration_for(
            &key,
            format!("modelMapRef {} has no variant", map_ref.name),
        ));
    }

    let namespace = map_ref
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| deployment.namespace())
        .unwrap_or_default();

    let engine = deployment.spec.engine.name.as_str();
    if engine == ENGINE_GENERIC {
        return Err(Error::configuration_for(
            &key,
            "can't specify a catalog model with the generic engine",
        ));
    }

    let catalog = catalogs
        .get_model_map(&map_ref.name, &namespace)
        .await?
        .ok_or_else(|| {
            Error::configuration_for(
                &key,
                format!("model map {}/{} not found", namespace, map_ref.name),
            )
        })?;

    let variants = catalog.spec.variants_for(engine).ok_or_else(|| {
        Error::configuration_for(&key, format!("unknown engine {engine}"))
    })?;

    let variant = variants
        .iter()
        .find(|v| v.name == map_ref.variant)
        .ok_or_else(|| {
            Error::configuration_for(
                &key,
                format!(
                    "model map {}/{} has no variant {} for engine {}",
                    namespace, map_ref.name, map_ref.variant, engine
                ),
            )
        })?;

    debug!(
        deployment = %key,
        catalog = %map_ref.name,
        variant = %variant.name,
        "resolved catalog model"
    );

    Ok(ResolvedModel::from_catalog(
        &map_ref.name,
        &map_ref.variant,
        reference.spec.merged_over(&variant.spec),
    ))
}
