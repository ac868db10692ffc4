//! Configuration dialect auto-detection.
//!
//! Detection looks only at the first non-whitespace character and at the
//! line structure: a leading `{` or `[` means JSON; an unquoted `:` or a
//! leading `- ` on any non-comment line means YAML; a line opening or
//! closing a `{ … }` block means KDL. An input exhibiting both YAML and
//! block markers is rejected as ambiguous.

use crate::{ConfigError, ConfigResult};

/// A recognized configuration dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Json,
    Yaml,
    Kdl,
}

/// Detect the dialect of a configuration document.
pub fn detect(input: &str) -> ConfigResult<Dialect> {
    let trimmed = input.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(Dialect::Json);
    }

    let mut yaml_like = false;
    let mut block_like = false;
    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if line.starts_with("- ") || has_unquoted_colon(line) {
            yaml_like = true;
        }
        if line.ends_with('{') || line == "}" {
            block_like = true;
        }
    }

    match (yaml_like, block_like) {
        (true, true) => Err(ConfigError::AmbiguousDialect(
            "document mixes YAML mappings and block structure".to_string(),
        )),
        (true, false) => Ok(Dialect::Yaml),
        (false, true) => Ok(Dialect::Kdl),
        (false, false) => Err(ConfigError::UnknownDialect),
    }
}

/// True if the line contains a `:` outside of quoted strings. Keeps URL
/// values inside KDL string arguments from reading as YAML mappings.
fn has_unquoted_colon(line: &str) -> bool {
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in line.chars() {
        match ch {
            '\\' if in_quotes && !escaped => escaped = true,
            '"' if !escaped => in_quotes = !in_quotes,
            ':' if !in_quotes => return true,
            _ => escaped = false,
        }
    }
    false
}
