//! The KDL (block-structured) pipeline dialect.
//!
//! ```kdl
//! pipeline "demo" {
//!     language "golang"
//!     expose_ports #true
//!     env {
//!         PORT "3000"
//!     }
//!     step "bash" {
//!         content "echo hello"
//!         file "greet.txt" "hi"
//!     }
//!     runnable "app" type="docker_container" {
//!         entrypoint "/workspace/server"
//!         output "local" {
//!             path "/tmp/info.json"
//!         }
//!     }
//! }
//! ```

use kdl::{KdlDocument, KdlNode, KdlValue};
use std::collections::BTreeMap;

use rapidflow_core::{OutputConfig, PipelineConfig, RunnableConfig, StepConfig};

use crate::{ConfigError, ConfigResult};

pub(crate) fn parse(input: &str) -> ConfigResult<PipelineConfig> {
    let doc: KdlDocument = input
        .parse()
        .map_err(|e: kdl::KdlError| ConfigError::Kdl(e.to_string()))?;

    let pipeline = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "pipeline")
        .ok_or_else(|| ConfigError::MissingField("pipeline".to_string()))?;

    let mut config = PipelineConfig {
        name: first_string_arg(pipeline)
            .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?,
        ..Default::default()
    };

    let Some(children) = pipeline.children() else {
        return Ok(config);
    };

    for node in children.nodes() {
        match node.name().value() {
            "language" => config.language = first_string_arg(node),
            "version" => config.version = first_string_arg(node),
            "branch" => config.branch = first_string_arg(node),
            "repo_name" => config.repo_name = first_string_arg(node),
            "repo_url" => config.repo_url = first_string_arg(node),
            "folder" => config.folder = first_string_arg(node),
            "expose_ports" => config.expose_ports = first_bool_arg(node).unwrap_or(false),
            "temporary" => config.temporary = first_bool_arg(node).unwrap_or(false),
            "env" => config.env = string_map(node)?,
            "step" => config.steps.push(parse_step(node)?),
            "runnable" => config.runnables.push(parse_runnable(node)?),
            other => {
                return Err(ConfigError::InvalidValue {
                    field: other.to_string(),
                    message: "unknown pipeline key".to_string(),
                });
            }
        }
    }

    Ok(config)
}

fn parse_step(node: &KdlNode) -> ConfigResult<StepConfig> {
    let mut step = StepConfig {
        step_type: first_string_arg(node)
            .ok_or_else(|| ConfigError::MissingField("step type".to_string()))?,
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "content" => {
                    step.content = first_string_arg(child).unwrap_or_default();
                }
                "file" => {
                    let mut args = string_args(child).into_iter();
                    let name = args.next().ok_or_else(|| ConfigError::InvalidValue {
                        field: "file".to_string(),
                        message: "expected a file name and content".to_string(),
                    })?;
                    step.files.insert(name, args.next().unwrap_or_default());
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: other.to_string(),
                        message: "unknown step key".to_string(),
                    });
                }
            }
        }
    }

    Ok(step)
}

fn parse_runnable(node: &KdlNode) -> ConfigResult<RunnableConfig> {
    let mut runnable = RunnableConfig {
        name: first_string_arg(node)
            .ok_or_else(|| ConfigError::MissingField("runnable name".to_string()))?,
        runnable_type: string_prop(node, "type").ok_or_else(|| ConfigError::InvalidValue {
            field: "runnable".to_string(),
            message: "missing type= property".to_string(),
        })?,
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "enabled" => runnable.enabled = first_bool_arg(child).unwrap_or(true),
                "container_name" => runnable.container_name = first_string_arg(child),
                "image_name" => runnable.image_name = first_string_arg(child),
                "working_dir" => runnable.working_dir = first_string_arg(child),
                "entrypoint" => runnable.entrypoint = string_args(child),
                "ports" => runnable.ports = string_args(child),
                "environment" => runnable.environment = string_map(child)?,
                "output" => {
                    runnable.outputs.push(OutputConfig {
                        output_type: first_string_arg(child).ok_or_else(|| {
                            ConfigError::MissingField("output type".to_string())
                        })?,
                        config: children_to_json(child),
                    });
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: other.to_string(),
                        message: "unknown runnable key".to_string(),
                    });
                }
            }
        }
    }

    Ok(runnable)
}

/// Flatten a node's children into `{key: value}` pairs of strings.
fn string_map(node: &KdlNode) -> ConfigResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let value = first_string_arg(child).ok_or_else(|| ConfigError::InvalidValue {
                field: child.name().value().to_string(),
                message: "expected a string value".to_string(),
            })?;
            map.insert(child.name().value().to_string(), value);
        }
    }
    Ok(map)
}

/// Convert a node's children (and properties) into the opaque JSON bag a
/// provider consumes. Single argument → scalar, several → array, nested
/// children → nested object.
fn children_to_json(node: &KdlNode) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for entry in node.entries() {
        if let Some(name) = entry.name() {
            object.insert(name.value().to_string(), value_to_json(entry.value()));
        }
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let values: Vec<serde_json::Value> = child
                .entries()
                .iter()
                .filter(|e| e.name().is_none())
                .map(|e| value_to_json(e.value()))
                .collect();
            let value = if child.children().is_some() {
                children_to_json(child)
            } else {
                match values.len() {
                    0 => serde_json::Value::Null,
                    1 => values.into_iter().next().unwrap_or(serde_json::Value::Null),
                    _ => serde_json::Value::Array(values),
                }
            };
            object.insert(child.name().value().to_string(), value);
        }
    }
    serde_json::Value::Object(object)
}

fn value_to_json(value: &KdlValue) -> serde_json::Value {
    if let Some(s) = value.as_string() {
        serde_json::Value::String(s.to_string())
    } else if let Some(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else if let Some(i) = value.as_integer() {
        serde_json::Value::from(i as i64)
    } else if let Some(f) = value.as_float() {
        serde_json::Value::from(f)
    } else {
        serde_json::Value::Null
    }
}

fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(str::to_string)
}

fn first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(str::to_string)
        .collect()
}

fn string_prop(node: &KdlNode, key: &str) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_some_and(|n| n.value() == key))
        .and_then(|e| e.value().as_string())
        .map(str::to_string)
}
