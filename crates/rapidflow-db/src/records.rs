//! Row types for the RapidFlow store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pipeline record: an immutable named specification.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PipelineRecord {
    pub id: i64,
    pub name: String,
    /// The raw textual specification as authored.
    pub config: String,
    pub created_at: DateTime<Utc>,
}

/// A job record: one execution of a pipeline, with the denormalized slice
/// of its configuration the executor needs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub pipeline_id: i64,
    pub status: String,
    pub branch: Option<String>,
    pub repo_name: Option<String>,
    pub repo_url: Option<String>,
    pub language: Option<String>,
    pub version: Option<String>,
    pub folder: Option<String>,
    pub expose_ports: bool,
    pub temporary: bool,
    pub temp_dir: Option<String>,
    pub cancelled: bool,
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A step record: one ordered script unit of a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepRecord {
    pub id: i64,
    pub job_id: i64,
    pub order_num: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub step_type: String,
    pub content: String,
    pub status: String,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A file materialized into the workspace before its step runs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub step_id: i64,
    pub name: String,
    pub content: String,
}

/// One environment variable of a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EnvRecord {
    pub id: i64,
    pub job_id: i64,
    pub key: String,
    pub value: String,
}

/// A runnable record: a post-build packaging declaration of a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunnableRecord {
    pub id: i64,
    pub job_id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub runnable_type: String,
    /// JSON of the RunnableConfig.
    pub config: String,
    pub status: String,
    pub output: Option<String>,
    /// Opaque artifact handle: a filesystem path, an image name, or the
    /// sentinel `container:{id}:{name}`.
    pub artifact_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A deployment record: one publication of a runnable's artifact.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeploymentRecord {
    pub id: i64,
    pub runnable_id: i64,
    pub output_type: String,
    /// JSON of the provider-specific configuration bag.
    pub config: String,
    pub status: String,
    pub url: Option<String>,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
}
