//! AIModelMap CRD types
//!
//! A model map is a shared catalog: for each engine it lists named model
//! variants so deployments can reference `catalog/variant` instead of
//! repeating model URIs and tuning parameters.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Engine identifier of the local-inference server
pub const ENGINE_LOCALAI: &str = "localai";
/// Engine identifier of the batching server
pub const ENGINE_VLLM: &str = "vllm";
/// Engine identifier of the distributed-inference server
pub const ENGINE_DEEPSPEED_MII: &str = "deepspeed-mii";
/// Engine identifier of the user-supplied container engine
pub const ENGINE_GENERIC: &str = "generic";

/// Field name suffix of engine config entries in the catalog ConfigMap
pub const ENGINE_CONFIG_FIELD: &str = "engineConfigFile";

/// Model specification shared by inline models and catalog variants
///
/// Unset fields are `None` so that an inline spec can be layered over a
/// catalog variant field by field.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AIModelSpec {
    /// Model location: a name understood by the engine or an HTTP(S) URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Quantization scheme (e.g. `awq`, `gptq`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,

    /// Weight data type (e.g. `float16`, `bfloat16`, `int8`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    /// Serialization format (e.g. `gguf`, `safetensor`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Engine-specific configuration file contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_config_file: Option<String>,
}

impl AIModelSpec {
    /// Layer `self` over `fallback`: every field set here wins, every unset
    /// field takes the fallback's value. Values are never combined.
    pub fn merged_over(&self, fallback: &AIModelSpec) -> AIModelSpec {
        fn pick(primary: &Option<String>, secondary: &Option<String>) -> Option<String> {
            match primary {
                Some(v) if !v.is_empty() => Some(v.clone()),
                _ => secondary.clone(),
            }
        }

        AIModelSpec {
            uri: pick(&self.uri, &fallback.uri),
            quantization: pick(&self.quantization, &fallback.quantization),
            data_type: pick(&self.data_type, &fallback.data_type),
            format: pick(&self.format, &fallback.format),
            engine_config_file: pick(&self.engine_config_file, &fallback.engine_config_file),
        }
    }

    /// The model URI, or an empty string when unset
    pub fn uri_or_empty(&self) -> &str {
        self.uri.as_deref().unwrap_or_default()
    }
}

/// A named entry in a model map
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelVariant {
    /// Variant name referenced by deployments
    pub name: String,

    /// Model specification of this variant
    #[serde(flatten)]
    pub spec: AIModelSpec,
}

/// Specification for an AIModelMap
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "premlabs.io",
    version = "v1alpha1",
    kind = "AIModelMap",
    plural = "aimodelmaps",
    shortname = "aimm",
    namespaced
)]
pub struct AIModelMapSpec {
    /// Variants for the local-inference engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub localai: Vec<ModelVariant>,

    /// Variants for the batching-server engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vllm: Vec<ModelVariant>,

    /// Variants for the distributed-inference engine
    #[serde(default, rename = "deepspeed-mii", skip_serializing_if = "Vec::is_empty")]
    pub deepspeed_mii: Vec<ModelVariant>,

    /// Variants for TensorRT based engines
    #[serde(default, rename = "tensor_rt", skip_serializing_if = "Vec::is_empty")]
    pub tensor_rt: Vec<ModelVariant>,
}

impl AIModelMapSpec {
    /// Variant list for an engine, `None` when the engine has no catalog section
    pub fn variants_for(&self, engine: &str) -> Option<&[ModelVariant]> {
        match engine {
            ENGINE_LOCALAI => Some(self.localai.as_slice()),
            ENGINE_VLLM => Some(self.vllm.as_slice()),
            ENGINE_DEEPSPEED_MII => Some(self.deepspeed_mii.as_slice()),
            _ => None,
        }
    }

    /// Engine sections whose engine-config text is published to the ConfigMap
    pub fn config_sections(&self) -> [(&'static str, &[ModelVariant]); 3] {
        [
            (ENGINE_LOCALAI, self.localai.as_slice()),
            (ENGINE_VLLM, self.vllm.as_slice()),
            (ENGINE_DEEPSPEED_MII, self.deepspeed_mii.as_slice()),
        ]
    }
}

/// ConfigMap key holding the engine config text of one variant
pub fn config_map_key(engine: &str, variant: &str) -> String {
    format!("{}-{}-{}", engine, variant, ENGINE_CONFIG_FIELD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(uri: Option<&str>, data_type: Option<&str>, quant: Option<&str>) -> AIModelSpec {
        AIModelSpec {
            uri: uri.map(str::to_string),
            data_type: data_type.map(str::to_string),
            quantization: quant.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn primary_fields_win() {
        let primary = spec(Some("inline/uri"), Some("float16"), None);
        let secondary = spec(Some("catalog/uri"), Some("bfloat16"), Some("awq"));

        let merged = primary.merged_over(&secondary);

        assert_eq!(merged.uri.as_deref(), Some("inline/uri"));
        assert_eq!(merged.data_type.as_deref(), Some("float16"));
        assert_eq!(merged.quantization.as_deref(), Some("awq"));
    }

    #[test]
    fn empty_primary_takes_every_secondary_field() {
        let secondary = spec(Some("catalog/uri"), Some("bfloat16"), Some("gptq"));
        let merged = AIModelSpec::default().merged_over(&secondary);
        assert_eq!(merged, secondary);
    }

    #[test]
    fn empty_string_counts_as_unset() {
        let primary = spec(Some(""), None, None);
        let secondary = spec(Some("catalog/uri"), None, None);
        assert_eq!(
            primary.merged_over(&secondary).uri.as_deref(),
            Some("catalog/uri")
        );
    }

    #[test]
    fn merge_never_concatenates() {
        let primary = spec(Some("a"), None, None);
        let secondary = spec(Some("b"), None, None);
        assert_eq!(primary.merged_over(&secondary).uri.as_deref(), Some("a"));
    }

    #[test]
    fn variants_are_selected_by_engine() {
        let map: AIModelMapSpec = serde_yaml::from_str(
            r#"
localai:
  - name: phi
    uri: phi-2
deepspeed-mii:
  - name: mistral
    uri: mistralai/Mistral-7B-v0.1
    engineConfigFile: "backend: mii"
"#,
        )
        .expect("valid model map");

        assert_eq!(map.variants_for(ENGINE_LOCALAI).map(<[_]>::len), Some(1));
        assert_eq!(map.variants_for(ENGINE_VLLM).map(<[_]>::len), Some(0));
        let mii = map.variants_for(ENGINE_DEEPSPEED_MII).expect("section");
        assert_eq!(mii[0].spec.engine_config_file.as_deref(), Some("backend: mii"));
        assert!(map.variants_for(ENGINE_GENERIC).is_none());
        assert!(map.variants_for("triton").is_none());
    }

    #[test]
    fn config_map_key_format() {
        assert_eq!(
            config_map_key(ENGINE_LOCALAI, "tiny"),
            "localai-tiny-engineConfigFile"
        );
    }
}
