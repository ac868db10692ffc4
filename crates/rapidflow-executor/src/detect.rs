//! Language auto-detection over a source tree.
//!
//! Manifest files win over bare source files; earlier rules win over later
//! ones. Missing or unreadable manifests fall through to the next rule
//! instead of failing the detector.

use regex::Regex;
use std::path::Path;

/// What the detector concluded about a source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub language: String,
    pub version: String,
}

impl Detection {
    fn new(language: &str, version: &str) -> Self {
        Self {
            language: language.to_string(),
            version: version.to_string(),
        }
    }
}

const LATEST: &str = "latest";

/// Inspect a directory and return `(language, version)`.
pub fn detect_language(dir: &Path) -> Detection {
    // 1. go.mod, with the declared toolchain version when present
    if let Ok(content) = std::fs::read_to_string(dir.join("go.mod")) {
        let version = go_mod_version(&content).unwrap_or_else(|| LATEST.to_string());
        return Detection::new("golang", &version);
    }

    // 2. bare .go sources
    if has_file_with_extension(dir, "go") {
        return Detection::new("golang", LATEST);
    }

    // 3. package.json, honoring engines.node
    if let Ok(content) = std::fs::read_to_string(dir.join("package.json")) {
        let version = serde_json::from_str::<serde_json::Value>(&content)
            .ok()
            .and_then(|manifest| {
                manifest
                    .get("engines")
                    .and_then(|e| e.get("node"))
                    .and_then(|v| v.as_str())
                    .map(strip_version_constraint)
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| LATEST.to_string());
        return Detection::new("node", &version);
    }

    // 4. bare .js sources
    if has_file_with_extension(dir, "js") {
        return Detection::new("node", LATEST);
    }

    // 5. python manifests or sources
    if dir.join("requirements.txt").exists()
        || dir.join("setup.py").exists()
        || dir.join("pyproject.toml").exists()
        || has_file_with_extension(dir, "py")
    {
        return Detection::new("python", LATEST);
    }

    // 6. scala
    if dir.join("build.sbt").exists() {
        return Detection::new("scala", LATEST);
    }

    // 7. java
    if dir.join("pom.xml").exists() || dir.join("build.gradle").exists() {
        return Detection::new("java", LATEST);
    }

    // 8. fallback
    Detection::new("golang", LATEST)
}

/// Derive the canonical base image for a detected language.
pub fn base_image(language: &str, version: &str) -> String {
    let version = if version.is_empty() || version == LATEST {
        LATEST
    } else {
        version
    };
    match language {
        "golang" => format!("golang:{version}"),
        "node" | "javascript" => format!("node:{version}"),
        "python" => format!("python:{version}"),
        "scala" => format!("hseeberger/scala-sbt:{version}"),
        _ => "ubuntu:latest".to_string(),
    }
}

fn go_mod_version(content: &str) -> Option<String> {
    let re = Regex::new(r"go\s+(\d+\.\d+(?:\.\d+)?)").ok()?;
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Keep only digits and dots from an engines-style constraint such as
/// `>=18.0.0`.
fn strip_version_constraint(constraint: &str) -> String {
    constraint
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect()
}

fn has_file_with_extension(dir: &Path, ext: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|entry| entry.path().is_file() && entry.path().extension().is_some_and(|e| e == ext))
}
