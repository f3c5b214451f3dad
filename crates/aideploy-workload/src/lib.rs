//! Workload synthesis for AI deployments
//!
//! Everything needed to go from an `AIDeployment` to the objects that run it:
//!
//! - [`resolver`]: model references to concrete model specifications
//! - [`engine`]: pluggable inference-engine adapters producing a Deployment
//! - [`probe`]: user probe overrides layered onto engine defaults
//! - [`scheduling`]: topology spread, node selection and GPU injection
//! - [`service`] / [`ingress`]: how the workload is exposed
//!
//! Apart from the catalog lookup in the resolver, every function here is pure:
//! the same inputs always yield the same objects.

#![deny(missing_docs)]

pub mod engine;
pub mod ingress;
pub mod probe;
pub mod resolver;
pub mod scheduling;
pub mod service;

pub(crate) use aideploy_common::{crd, Error, Result};

pub use engine::{EngineRegistry, InferenceEngine, ENGINE_CONTAINER_NAME};
pub use ingress::{desired_ingress, IngressConfig};
pub use resolver::{resolve_models, CatalogSource, ModelCatalogSource, ResolvedModel};
pub use scheduling::add_scheduling_properties;
pub use service::desired_service;
