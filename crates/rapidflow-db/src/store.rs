//! The store: thin persistence surface over SQLite.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use rapidflow_core::{DeploymentStatus, JobStatus, PipelineConfig, RunnableStatus, StepStatus};

use crate::records::*;
use crate::{DbError, DbResult};

/// Handle to the persistent store. Cheap to clone; all methods operate on
/// single rows.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- pipelines ----

    pub async fn insert_pipeline(&self, name: &str, config: &str) -> DbResult<PipelineRecord> {
        let record = sqlx::query_as::<_, PipelineRecord>(
            "INSERT INTO pipelines (name, config, created_at) VALUES (?1, ?2, ?3) RETURNING *",
        )
        .bind(name)
        .bind(config)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn pipeline(&self, id: i64) -> DbResult<PipelineRecord> {
        sqlx::query_as::<_, PipelineRecord>("SELECT * FROM pipelines WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("pipeline {id}")))
    }

    pub async fn list_pipelines(&self) -> DbResult<Vec<PipelineRecord>> {
        let records =
            sqlx::query_as::<_, PipelineRecord>("SELECT * FROM pipelines ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    // ---- jobs ----

    /// Insert a pending job carrying the denormalized configuration slice
    /// the executor reads.
    pub async fn insert_job(&self, pipeline_id: i64, cfg: &PipelineConfig) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (pipeline_id, status, branch, repo_name, repo_url, language,
                              version, folder, expose_ports, temporary, cancelled, created_at)
            VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)
            RETURNING *
            "#,
        )
        .bind(pipeline_id)
        .bind(cfg.branch.clone())
        .bind(cfg.repo_name.clone())
        .bind(cfg.repo_url.clone())
        .bind(cfg.language.clone())
        .bind(cfg.version.clone())
        .bind(cfg.folder.clone())
        .bind(cfg.expose_ports)
        .bind(cfg.temporary)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn job(&self, id: i64) -> DbResult<JobRecord> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    pub async fn jobs_for_pipeline(&self, pipeline_id: i64) -> DbResult<Vec<JobRecord>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE pipeline_id = ?1 ORDER BY id ASC",
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Read the oldest pending job, if any. A single dispatcher owns the
    /// claim discipline; this is a plain deterministic read.
    pub async fn claim_next_pending(&self) -> DbResult<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Jobs whose cancellation flag was raised while they are running.
    pub async fn running_cancelled_jobs(&self) -> DbResult<Vec<i64>> {
        let ids: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM jobs WHERE status = 'running' AND cancelled = 1")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    pub async fn set_job_status(
        &self,
        id: i64,
        status: JobStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE jobs SET status = ?1, finished_at = COALESCE(?2, finished_at) WHERE id = ?3")
            .bind(status.as_str())
            .bind(finished_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a job to `running` and stamp its start time.
    pub async fn set_job_running(&self, id: i64) -> DbResult<()> {
        sqlx::query("UPDATE jobs SET status = 'running', started_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Raise the cancellation request flag without changing status.
    pub async fn mark_cancelled(&self, id: i64) -> DbResult<()> {
        sqlx::query("UPDATE jobs SET cancelled = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_container(&self, id: i64, container_id: &str) -> DbResult<()> {
        sqlx::query("UPDATE jobs SET container_id = ?1 WHERE id = ?2")
            .bind(container_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_temp_dir(&self, id: i64, temp_dir: &str) -> DbResult<()> {
        sqlx::query("UPDATE jobs SET temp_dir = ?1 WHERE id = ?2")
            .bind(temp_dir)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Back-fill detected language/version before the base image is chosen.
    pub async fn set_job_language(&self, id: i64, language: &str, version: &str) -> DbResult<()> {
        sqlx::query("UPDATE jobs SET language = ?1, version = ?2 WHERE id = ?3")
            .bind(language)
            .bind(version)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- steps ----

    pub async fn insert_step(
        &self,
        job_id: i64,
        order_num: i64,
        step_type: &str,
        content: &str,
    ) -> DbResult<StepRecord> {
        let record = sqlx::query_as::<_, StepRecord>(
            r#"
            INSERT INTO steps (job_id, order_num, type, content, status, created_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(order_num)
        .bind(step_type)
        .bind(content)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn steps_for_job(&self, job_id: i64) -> DbResult<Vec<StepRecord>> {
        let records = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM steps WHERE job_id = ?1 ORDER BY order_num ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn set_step_status(
        &self,
        id: i64,
        status: StepStatus,
        output: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE steps SET status = ?1, output = COALESCE(?2, output) WHERE id = ?3")
            .bind(status.as_str())
            .bind(output)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark every non-terminal step of a job `cancelled`.
    pub async fn cancel_open_steps(&self, job_id: i64) -> DbResult<()> {
        sqlx::query(
            "UPDATE steps SET status = 'cancelled' WHERE job_id = ?1 AND status IN ('pending', 'running')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- files ----

    pub async fn insert_file(&self, step_id: i64, name: &str, content: &str) -> DbResult<()> {
        sqlx::query("INSERT INTO files (step_id, name, content) VALUES (?1, ?2, ?3)")
            .bind(step_id)
            .bind(name)
            .bind(content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn files_for_step(&self, step_id: i64) -> DbResult<Vec<FileRecord>> {
        let records =
            sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE step_id = ?1 ORDER BY id ASC")
                .bind(step_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    // ---- environments ----

    pub async fn insert_env(&self, job_id: i64, key: &str, value: &str) -> DbResult<()> {
        sqlx::query("INSERT INTO environments (job_id, key, value) VALUES (?1, ?2, ?3)")
            .bind(job_id)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn envs_for_job(&self, job_id: i64) -> DbResult<Vec<EnvRecord>> {
        let records = sqlx::query_as::<_, EnvRecord>(
            "SELECT * FROM environments WHERE job_id = ?1 ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    // ---- runnables ----

    pub async fn insert_runnable(
        &self,
        job_id: i64,
        name: &str,
        runnable_type: &str,
        config_json: &str,
    ) -> DbResult<RunnableRecord> {
        let record = sqlx::query_as::<_, RunnableRecord>(
            r#"
            INSERT INTO runnables (job_id, name, type, config, status, created_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(name)
        .bind(runnable_type)
        .bind(config_json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn runnables_for_job(&self, job_id: i64) -> DbResult<Vec<RunnableRecord>> {
        let records = sqlx::query_as::<_, RunnableRecord>(
            "SELECT * FROM runnables WHERE job_id = ?1 ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn set_runnable_status(
        &self,
        id: i64,
        status: RunnableStatus,
        artifact_url: Option<&str>,
        output: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE runnables
            SET status = ?1,
                artifact_url = COALESCE(?2, artifact_url),
                output = COALESCE(?3, output)
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(artifact_url)
        .bind(output)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- deployments ----

    pub async fn insert_deployment(
        &self,
        runnable_id: i64,
        output_type: &str,
        config_json: &str,
    ) -> DbResult<DeploymentRecord> {
        let record = sqlx::query_as::<_, DeploymentRecord>(
            r#"
            INSERT INTO deployments (runnable_id, output_type, config, status, created_at)
            VALUES (?1, ?2, ?3, 'pending', ?4)
            RETURNING *
            "#,
        )
        .bind(runnable_id)
        .bind(output_type)
        .bind(config_json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn deployments_for_runnable(
        &self,
        runnable_id: i64,
    ) -> DbResult<Vec<DeploymentRecord>> {
        let records = sqlx::query_as::<_, DeploymentRecord>(
            "SELECT * FROM deployments WHERE runnable_id = ?1 ORDER BY id ASC",
        )
        .bind(runnable_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn set_deployment_status(
        &self,
        id: i64,
        status: DeploymentStatus,
        url: Option<&str>,
        output: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE deployments
            SET status = ?1, url = COALESCE(?2, url), output = COALESCE(?3, output)
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(url)
        .bind(output)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
