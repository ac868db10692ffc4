//! Pipeline configuration parsing for RapidFlow.
//!
//! Three textual dialects are accepted interchangeably (JSON, YAML and KDL)
//! and all produce the same [`PipelineConfig`] record. The dialect is
//! auto-detected from the first non-whitespace character and the line
//! structure; inputs that match more than one dialect are rejected rather
//! than resolved silently.

pub mod dialect;
pub mod error;
mod kdl_pipeline;

pub use dialect::Dialect;
pub use error::{ConfigError, ConfigResult};

use rapidflow_core::PipelineConfig;

/// Parse a pipeline configuration, auto-detecting the dialect.
pub fn parse_pipeline(input: &str) -> ConfigResult<PipelineConfig> {
    let config = match dialect::detect(input)? {
        Dialect::Json => serde_json::from_str(input)?,
        Dialect::Yaml => serde_yaml::from_str(input)?,
        Dialect::Kdl => kdl_pipeline::parse(input)?,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &PipelineConfig) -> ConfigResult<()> {
    if config.name.is_empty() {
        return Err(ConfigError::MissingField("name".to_string()));
    }
    Ok(())
}
