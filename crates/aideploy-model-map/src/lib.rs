//! AIModelMap controller
//!
//! Engine config files embedded in catalog variants are published in a
//! ConfigMap named after the catalog, where engine pods can mount them.

pub mod controller;

pub(crate) use aideploy_common::{crd, Error};

pub use controller::{
    desired_config_map, error_policy, reconcile, ModelMapContext, ModelMapKubeClient,
    ModelMapKubeClientImpl,
};
