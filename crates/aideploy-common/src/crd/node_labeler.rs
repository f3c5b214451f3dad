//! AutoNodeLabeler CRD types

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Rule adding labels to every node matching an expression
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "premlabs.io",
    version = "v1alpha1",
    kind = "AutoNodeLabeler",
    plural = "autonodelabelers",
    shortname = "anl",
    printcolumn = r#"{"name":"Key","type":"string","jsonPath":".spec.matchExpression.key"}"#,
    printcolumn = r#"{"name":"Operator","type":"string","jsonPath":".spec.matchExpression.operator"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AutoNodeLabelerSpec {
    /// Which nodes the rule applies to
    pub match_expression: NodeMatchExpression,

    /// Labels added to matching nodes
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Node label requirement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMatchExpression {
    /// Node label key
    pub key: String,

    /// How the key is matched
    pub operator: MatchOperator,

    /// Accepted values for `In`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Supported label selector operators
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MatchOperator {
    /// The key is present with any value
    #[default]
    Exists,
    /// The key is present with one of the listed values
    In,
}

impl NodeMatchExpression {
    /// Whether a node with these labels matches
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match (self.operator, labels.get(&self.key)) {
            (MatchOperator::Exists, Some(_)) => true,
            (MatchOperator::In, Some(value)) => self.values.iter().any(|v| v == value),
            (_, None) => false,
        }
    }
}
