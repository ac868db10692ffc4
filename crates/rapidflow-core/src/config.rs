//! The in-memory pipeline configuration tree.
//!
//! A `PipelineConfig` is what the configuration ingestor hands the engine;
//! all three textual dialects produce this same record. Field names double
//! as the serialized keys, so the JSON dialect maps onto these structs
//! directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, versioned build specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    pub language: Option<String>,
    pub version: Option<String>,
    pub branch: Option<String>,
    pub repo_name: Option<String>,
    pub repo_url: Option<String>,
    pub folder: Option<String>,
    pub expose_ports: bool,
    pub temporary: bool,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepConfig>,
    pub runnables: Vec<RunnableConfig>,
}

/// One script unit of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Only `bash` is executable; unknown types are ignored with status
    /// "success".
    #[serde(rename = "type")]
    pub step_type: String,
    pub content: String,
    /// Files materialized into the container workspace before the script.
    pub files: BTreeMap<String, String>,
}

/// A post-build packaging declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnableConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub runnable_type: String,
    pub enabled: bool,
    pub container_name: Option<String>,
    pub image_name: Option<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: Option<String>,
    pub ports: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub outputs: Vec<OutputConfig>,
}

impl Default for RunnableConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            runnable_type: String::new(),
            enabled: true,
            container_name: None,
            image_name: None,
            entrypoint: Vec::new(),
            working_dir: None,
            ports: Vec::new(),
            environment: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }
}

impl RunnableConfig {
    /// The closed set of runnable types the engine knows how to produce.
    pub const KNOWN_TYPES: [&'static str; 4] =
        ["docker_container", "docker_image", "artifacts", "serverless"];

    pub fn is_known_type(&self) -> bool {
        Self::KNOWN_TYPES.contains(&self.runnable_type.as_str())
    }
}

/// One publication target for a runnable's artifact. The `config` bag is
/// opaque to the engine; each output provider deserializes its own slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(rename = "type")]
    pub output_type: String,
    pub config: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runnable_enabled_defaults_to_true() {
        let r: RunnableConfig =
            serde_json::from_str(r#"{"name": "app", "type": "artifacts"}"#).unwrap();
        assert!(r.enabled);
        assert_eq!(r.runnable_type, "artifacts");
    }

    #[test]
    fn pipeline_config_minimal() {
        let cfg: PipelineConfig = serde_json::from_str(r#"{"name": "demo"}"#).unwrap();
        assert_eq!(cfg.name, "demo");
        assert!(!cfg.expose_ports);
        assert!(!cfg.temporary);
        assert!(cfg.steps.is_empty());
    }

    #[test]
    fn step_type_key_is_type() {
        let step: StepConfig =
            serde_json::from_str(r#"{"type": "bash", "content": "echo hi"}"#).unwrap();
        assert_eq!(step.step_type, "bash");
    }

    #[test]
    fn known_runnable_types() {
        for t in RunnableConfig::KNOWN_TYPES {
            let r = RunnableConfig {
                runnable_type: t.to_string(),
                ..Default::default()
            };
            assert!(r.is_known_type());
        }
        let bogus = RunnableConfig {
            runnable_type: "helm_chart".to_string(),
            ..Default::default()
        };
        assert!(!bogus.is_known_type());
    }
}
