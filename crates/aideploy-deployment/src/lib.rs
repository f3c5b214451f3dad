//! AIDeployment controller
//!
//! Turns each `AIDeployment` into a Deployment running the selected inference
//! engine, a Service in front of it and, when endpoints are declared, an
//! Ingress. Convergence is reported in the resource status.

pub mod controller;

pub(crate) use aideploy_common::{crd, Error};

pub use controller::{
    error_policy, reconcile, DeploymentContext, DeploymentKubeClient, DeploymentKubeClientImpl,
};
