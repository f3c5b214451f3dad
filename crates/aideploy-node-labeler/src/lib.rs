//! AutoNodeLabeler controller
//!
//! Keeps rule labels on every node matching the rule's expression. Nodes are
//! only ever labelled; removing a rule leaves its labels in place.

pub mod controller;

pub(crate) use aideploy_common::{crd, Error};

pub use controller::{
    error_policy, labels_to_apply, reconcile_node, reconcile_rule, NodeLabelerContext,
    NodeLabelerKubeClient, NodeLabelerKubeClientImpl,
};
