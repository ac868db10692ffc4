//! Job submission: validate a pipeline configuration and materialize the
//! job graph (job, steps, files, environment, runnables, deployments).

use rapidflow_core::{Error, PipelineConfig, PortMapping, Result, RunnableConfig};
use rapidflow_db::{JobRecord, Store};
use tracing::info;

/// SSH-backed output types and the fields they cannot run without.
const SSH_OUTPUT_TYPES: [&str; 2] = ["vps", "nginx"];
const SSH_REQUIRED_FIELDS: [&str; 3] = ["host", "user", "key_path"];

/// Validate a configuration before any row is written. Malformed configs
/// never reach the executor.
pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.name.is_empty() {
        return Err(Error::InvalidInput("pipeline name is required".to_string()));
    }

    for runnable in config.runnables.iter().filter(|r| r.enabled) {
        if runnable.name.is_empty() {
            return Err(Error::InvalidInput("runnable name is required".to_string()));
        }
        if !runnable.is_known_type() {
            return Err(Error::InvalidInput(format!(
                "unknown runnable type: {}",
                runnable.runnable_type
            )));
        }
        for port in &runnable.ports {
            PortMapping::parse(port)?;
        }
        for output in &runnable.outputs {
            if SSH_OUTPUT_TYPES.contains(&output.output_type.as_str()) {
                for field in SSH_REQUIRED_FIELDS {
                    if output.config.get(field).and_then(|v| v.as_str()).is_none() {
                        return Err(Error::InvalidInput(format!(
                            "{} output for runnable {} is missing required field {field}",
                            output.output_type, runnable.name
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Insert a pending job and its step/file/env/runnable/deployment rows.
/// Disabled runnables are never persisted.
pub async fn submit_job(
    store: &Store,
    pipeline_id: i64,
    config: &PipelineConfig,
) -> Result<JobRecord> {
    validate_config(config)?;

    let job = store.insert_job(pipeline_id, config).await?;

    for (index, step) in config.steps.iter().enumerate() {
        let record = store
            .insert_step(job.id, (index + 1) as i64, &step.step_type, &step.content)
            .await?;
        for (name, content) in &step.files {
            store.insert_file(record.id, name, content).await?;
        }
    }

    for (key, value) in &config.env {
        store.insert_env(job.id, key, value).await?;
    }

    for runnable in config.runnables.iter().filter(|r| r.enabled) {
        let config_json = serde_json::to_string(runnable)
            .map_err(|e| Error::Internal(format!("failed to serialize runnable config: {e}")))?;
        let record = store
            .insert_runnable(job.id, &runnable.name, &runnable.runnable_type, &config_json)
            .await?;
        for output in &runnable.outputs {
            let output_json = serde_json::to_string(&output.config).map_err(|e| {
                Error::Internal(format!("failed to serialize output config: {e}"))
            })?;
            store
                .insert_deployment(record.id, &output.output_type, &output_json)
                .await?;
        }
    }

    info!(
        job_id = job.id,
        pipeline_id,
        steps = config.steps.len(),
        "job submitted"
    );
    Ok(job)
}

/// Convenience used by the tests and the runnable phase.
pub(crate) fn runnable_from_json(config_json: &str) -> Result<RunnableConfig> {
    serde_json::from_str(config_json)
        .map_err(|e| Error::Internal(format!("malformed runnable config: {e}")))
}
