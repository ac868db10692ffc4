//! The per-job state machine.
//!
//! One `run` call drives a job from `pending` to a terminal status:
//! provision → acquire sources → run steps → produce runnables → deploy →
//! cleanup. Cancellation is polled between stages and while draining exec
//! output; on any failure other than cancellation the job settles to
//! `failed` and cleanup still runs.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rapidflow_core::{
    DeploymentStatus, Error, JobStatus, PortMapping, Result, RunnableConfig, RunnableStatus,
    StepStatus,
};
use rapidflow_db::{JobRecord, RunnableRecord, Store};
use rapidflow_deployer::{DeployRequest, ProviderRegistry};
use rapidflow_executor::{
    ContainerRuntime, ContainerSpec, ExecOutcome, base_image, detect_language,
};

use crate::cancel::CancellationRegistry;
use crate::git;
use crate::submit::runnable_from_json;

const FALLBACK_IMAGE: &str = "ubuntu:latest";
const WORKSPACE: &str = "/workspace";
const FILE_WRITE_FAILURE: &str = "Failed to create file";

/// Executes one job at a time; shared between dispatcher tasks via `Arc`.
pub struct JobRunner {
    store: Store,
    runtime: Arc<dyn ContainerRuntime>,
    providers: Arc<ProviderRegistry>,
    cancellations: Arc<CancellationRegistry>,
    scripts_dir: PathBuf,
    temp_root: PathBuf,
}

/// Per-run scratch state the cleanup path needs on every exit.
#[derive(Default)]
struct JobContext {
    container_id: Option<String>,
    temp_dir: Option<PathBuf>,
    fallback: bool,
    env: Vec<String>,
    ports: Vec<PortMapping>,
}

impl JobRunner {
    pub fn new(
        store: Store,
        runtime: Arc<dyn ContainerRuntime>,
        providers: Arc<ProviderRegistry>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            store,
            runtime,
            providers,
            cancellations,
            scripts_dir: PathBuf::from("scripts"),
            temp_root: std::env::temp_dir(),
        }
    }

    /// Where installer scripts for the fallback image live.
    pub fn with_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_dir = dir.into();
        self
    }

    /// Where clone and artifact staging directories are created.
    pub fn with_temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_root = dir.into();
        self
    }

    /// Run a job to a terminal status. Returns an error for failures the
    /// dispatcher may want to log; cancellation is a clean return.
    pub async fn run(&self, job_id: i64) -> Result<()> {
        let job = self.store.job(job_id).await?;

        if JobStatus::from_str(&job.status)?.is_terminal() {
            debug!(job_id, status = %job.status, "job already terminal");
            return Ok(());
        }

        // Cancellation requested before the job ever ran.
        if job.cancelled {
            self.settle(job_id, JobStatus::Cancelled).await;
            return Ok(());
        }

        self.store.set_job_running(job_id).await?;
        let token = self.cancellations.register(job_id);

        let mut ctx = JobContext::default();
        let result = self.execute(&job, &mut ctx, &token).await;
        self.cancellations.remove(job_id);

        match &result {
            Ok(()) => {
                info!(job_id, "job finished");
            }
            Err(Error::Cancelled) => {
                info!(job_id, "job cancelled");
                self.settle(job_id, JobStatus::Cancelled).await;
            }
            Err(e) => {
                warn!(job_id, error = %e, "job failed");
                self.settle(job_id, JobStatus::Failed).await;
            }
        }

        self.cleanup(&job, &ctx).await;

        match result {
            Err(Error::Cancelled) => Ok(()),
            other => other,
        }
    }

    /// Best-effort terminal settle. Terminal statuses are sticky: a job that
    /// already settled is never rewritten.
    async fn settle(&self, job_id: i64, status: JobStatus) {
        let already_terminal = match self.store.job(job_id).await {
            Ok(job) => JobStatus::from_str(&job.status)
                .map(|s| s.is_terminal())
                .unwrap_or(false),
            Err(e) => {
                warn!(job_id, error = %e, "failed to read job during settle");
                false
            }
        };
        if already_terminal {
            return;
        }
        if let Err(e) = self
            .store
            .set_job_status(job_id, status, Some(Utc::now()))
            .await
        {
            warn!(job_id, error = %e, "failed to persist terminal status");
        }
        if status == JobStatus::Cancelled
            && let Err(e) = self.store.cancel_open_steps(job_id).await
        {
            warn!(job_id, error = %e, "failed to cancel open steps");
        }
    }

    async fn execute(
        &self,
        job: &JobRecord,
        ctx: &mut JobContext,
        token: &CancellationToken,
    ) -> Result<()> {
        let job_id = job.id;

        // ---- source acquisition ----
        check_cancelled(token)?;
        let project_path = self.acquire_sources(job, ctx, token).await?;

        // ---- language inference ----
        check_cancelled(token)?;
        let (language, version) = self.infer_language(job, &project_path).await?;

        // ---- environment composition ----
        let env_records = self.store.envs_for_job(job_id).await?;
        let mut env: Vec<String> = env_records
            .iter()
            .map(|e| format!("{}={}", e.key, e.value))
            .collect();
        if let Some(branch) = &job.branch {
            env.push(format!("BRANCH={branch}"));
        }
        let mut ports = Vec::new();
        if job.expose_ports {
            for record in env_records.iter().filter(|e| e.key == "PORT") {
                ports.push(PortMapping::parse(&record.value)?);
            }
        }
        ctx.env = env;
        ctx.ports = ports;

        // ---- image pull with fallback ----
        check_cancelled(token)?;
        let mut image = base_image(&language, &version);
        if let Err(e) = with_cancel(token, self.runtime.pull_image(&image)).await {
            if matches!(e, Error::Cancelled) {
                return Err(e);
            }
            warn!(job_id, %image, error = %e, "image pull failed, falling back");
            ctx.fallback = true;
            image = FALLBACK_IMAGE.to_string();
            with_cancel(token, self.runtime.pull_image(&image)).await?;
        }

        // ---- container creation ----
        check_cancelled(token)?;
        let binds = if project_path.exists() {
            let absolute = std::path::absolute(&project_path)?;
            vec![format!("{}:{WORKSPACE}", absolute.display())]
        } else {
            Vec::new()
        };
        let spec = ContainerSpec {
            image: image.clone(),
            env: ctx.env.clone(),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: true,
            binds,
            ports: ctx.ports.clone(),
            ..Default::default()
        };
        let container_id = with_cancel(token, self.runtime.create_container(spec)).await?;
        // Recorded before start so stop-pipeline can always reclaim it.
        self.store.set_job_container(job_id, &container_id).await?;
        ctx.container_id = Some(container_id.clone());
        with_cancel(token, self.runtime.start_container(&container_id)).await?;
        info!(job_id, container = %container_id, %image, "build container started");

        // ---- installer script on fallback ----
        if ctx.fallback {
            self.run_installer_script(job_id, &container_id, &language, &version, token)
                .await?;
        }

        // ---- in-container clone (legacy path) ----
        if let Some(repo_name) = &job.repo_name {
            self.clone_inside_container(job, &container_id, repo_name, token)
                .await?;
        }

        // ---- step loop ----
        self.run_steps(job, &container_id, token).await?;

        // ---- success settle ----
        check_cancelled(token)?;
        self.store
            .set_job_status(job_id, JobStatus::Success, Some(Utc::now()))
            .await?;
        info!(job_id, "all steps succeeded");

        // ---- runnables + deployments ----
        self.run_runnables(job, ctx, token).await?;

        Ok(())
    }

    async fn acquire_sources(
        &self,
        job: &JobRecord,
        ctx: &mut JobContext,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        if let Some(repo_url) = &job.repo_url {
            let temp_dir = self.temp_root.join(format!("rapidflow-repo-{}", job.id));
            tokio::fs::create_dir_all(&temp_dir).await?;
            self.store
                .set_job_temp_dir(job.id, &temp_dir.to_string_lossy())
                .await?;
            ctx.temp_dir = Some(temp_dir.clone());

            let branch = job.branch.as_deref().unwrap_or("main");
            with_cancel(token, git::clone_repository(repo_url, branch, &temp_dir)).await?;

            Ok(match &job.folder {
                Some(folder) => temp_dir.join(folder),
                None => temp_dir,
            })
        } else if let Some(folder) = &job.folder {
            Ok(PathBuf::from(folder))
        } else {
            Err(Error::Acquisition(
                "either repo_url or folder must be specified".to_string(),
            ))
        }
    }

    /// Back-fill missing language/version on the job row before the base
    /// image is chosen.
    async fn infer_language(
        &self,
        job: &JobRecord,
        project_path: &Path,
    ) -> Result<(String, String)> {
        if let (Some(language), Some(version)) = (&job.language, &job.version) {
            return Ok((language.clone(), version.clone()));
        }

        let detection = detect_language(project_path);
        let language = job.language.clone().unwrap_or(detection.language);
        let version = job.version.clone().unwrap_or(detection.version);
        info!(job_id = job.id, %language, %version, "language detected");
        self.store
            .set_job_language(job.id, &language, &version)
            .await?;
        Ok((language, version))
    }

    async fn run_installer_script(
        &self,
        job_id: i64,
        container_id: &str,
        language: &str,
        version: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let script_path = self.scripts_dir.join(format!("{language}-{version}.sh"));
        let script = match tokio::fs::read_to_string(&script_path).await {
            Ok(script) => script,
            Err(_) => {
                warn!(job_id, path = %script_path.display(), "no installer script for fallback image");
                return Ok(());
            }
        };

        info!(job_id, path = %script_path.display(), "running installer script");
        let outcome = self
            .exec_collect(container_id, shell(script), None, token)
            .await?;
        if !outcome.success() {
            return Err(Error::ExecutionFailed(format!(
                "installer script exited with code {}",
                outcome.exit_code
            )));
        }
        Ok(())
    }

    async fn clone_inside_container(
        &self,
        job: &JobRecord,
        container_id: &str,
        repo_name: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let clone = self
            .exec_collect(
                container_id,
                vec![
                    "git".to_string(),
                    "clone".to_string(),
                    repo_name.to_string(),
                    WORKSPACE.to_string(),
                ],
                None,
                token,
            )
            .await?;
        if !clone.success() {
            return Err(Error::Acquisition(format!(
                "in-container clone of {repo_name} failed: {}",
                clone.output.trim()
            )));
        }

        if let Some(branch) = &job.branch {
            let checkout = self
                .exec_collect(
                    container_id,
                    shell(format!("cd {WORKSPACE} && git checkout {branch}")),
                    None,
                    token,
                )
                .await?;
            if !checkout.success() {
                return Err(Error::Acquisition(format!(
                    "checkout of {branch} failed: {}",
                    checkout.output.trim()
                )));
            }
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        job: &JobRecord,
        container_id: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let steps = self.store.steps_for_job(job.id).await?;

        for step in steps {
            check_cancelled(token)?;
            self.store
                .set_step_status(step.id, StepStatus::Running, None)
                .await?;

            // Materialize the step's files into the workspace. A failed
            // write faults the step but not the job; the loop moves on to
            // the next step.
            let mut file_failed = false;
            for file in self.store.files_for_step(step.id).await? {
                let write = self
                    .exec_collect(
                        container_id,
                        shell(format!("echo '{}' > {}", file.content, file.name)),
                        Some(WORKSPACE),
                        token,
                    )
                    .await;
                match write {
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Ok(outcome) if outcome.success() => {}
                    _ => {
                        warn!(job_id = job.id, step = step.order_num, file = %file.name, "file materialization failed");
                        self.store
                            .set_step_status(step.id, StepStatus::Failed, Some(FILE_WRITE_FAILURE))
                            .await?;
                        file_failed = true;
                        break;
                    }
                }
            }
            if file_failed {
                continue;
            }

            if step.step_type != "bash" {
                // Unknown step types are ignored.
                debug!(job_id = job.id, step = step.order_num, step_type = %step.step_type, "skipping non-bash step");
                self.store
                    .set_step_status(step.id, StepStatus::Success, None)
                    .await?;
                continue;
            }

            let mut session = with_cancel(
                token,
                self.runtime
                    .exec(container_id, shell(step.content.clone()), Some(WORKSPACE)),
            )
            .await?;

            let mut captured = String::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    line = session.next_line() => match line {
                        Some(line) => {
                            info!(job_id = job.id, step = step.order_num, "{line}");
                            captured.push_str(&line);
                            captured.push('\n');
                        }
                        None => break,
                    }
                }
            }
            let exit_code = session.finish().await?;

            if exit_code == 0 {
                self.store
                    .set_step_status(step.id, StepStatus::Success, Some(&captured))
                    .await?;
            } else {
                self.store
                    .set_step_status(step.id, StepStatus::Failed, Some(&captured))
                    .await?;
                return Err(Error::ExecutionFailed(format!(
                    "step {} exited with code {exit_code}",
                    step.order_num
                )));
            }
        }

        Ok(())
    }

    async fn run_runnables(
        &self,
        job: &JobRecord,
        ctx: &mut JobContext,
        token: &CancellationToken,
    ) -> Result<()> {
        let runnables = self.store.runnables_for_job(job.id).await?;

        for runnable in runnables.iter().filter(|r| r.status == "pending") {
            // The job is already terminal; cancellation here stops further
            // work without touching its status.
            if token.is_cancelled() {
                break;
            }

            self.store
                .set_runnable_status(runnable.id, RunnableStatus::Running, None, None)
                .await?;

            let produced = match runnable_from_json(&runnable.config) {
                Ok(config) => self.produce(job, ctx, &config, token).await,
                Err(e) => Err(e),
            };

            match produced {
                Ok(artifact) => {
                    info!(job_id = job.id, runnable = %runnable.name, %artifact, "runnable produced");
                    self.store
                        .set_runnable_status(
                            runnable.id,
                            RunnableStatus::Success,
                            Some(&artifact),
                            None,
                        )
                        .await?;
                    self.run_deployments(runnable, &artifact, token).await?;
                }
                Err(e) => {
                    // A failed producer never fails the job; its deployments
                    // are skipped.
                    warn!(job_id = job.id, runnable = %runnable.name, error = %e, "runnable failed");
                    self.store
                        .set_runnable_status(
                            runnable.id,
                            RunnableStatus::Failed,
                            None,
                            Some(&e.to_string()),
                        )
                        .await?;
                    if matches!(e, Error::Cancelled) {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn produce(
        &self,
        job: &JobRecord,
        ctx: &mut JobContext,
        config: &RunnableConfig,
        token: &CancellationToken,
    ) -> Result<String> {
        let staging = self.staging_dir(job.id, ctx).await?;

        match config.runnable_type.as_str() {
            "docker_container" => self.produce_container(job, ctx, config, token).await,
            "docker_image" => {
                let container_id = require_container(ctx)?;
                let image_name = image_name_for(job, config);
                with_cancel(token, self.runtime.commit(&container_id, &image_name)).await?;
                let tar_path = staging.join(format!("{}-image.tar", config.name));
                with_cancel(token, self.runtime.save_image(&image_name, &tar_path)).await?;
                Ok(tar_path.to_string_lossy().into_owned())
            }
            "artifacts" | "serverless" => {
                let container_id = require_container(ctx)?;
                with_cancel(token, self.runtime.copy_from(&container_id, WORKSPACE, &staging))
                    .await?;
                let zip_path = staging.join(format!("{}-artifacts.zip", config.name));
                rapidflow_executor::archive::zip_dir(&staging.join("workspace"), &zip_path)?;
                Ok(zip_path.to_string_lossy().into_owned())
            }
            other => Err(Error::InvalidInput(format!(
                "unknown runnable type: {other}"
            ))),
        }
    }

    /// Commit the build container to an image and launch a fresh container
    /// from it, returning the `container:{id}:{name}` sentinel.
    async fn produce_container(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
        config: &RunnableConfig,
        token: &CancellationToken,
    ) -> Result<String> {
        let container_id = require_container(ctx)?;

        // Bake the workspace into the image so it no longer depends on the
        // host bind mount.
        let stage = self
            .exec_collect(
                &container_id,
                shell(format!("mkdir -p /app && cp -r {WORKSPACE}/* /app/")),
                None,
                token,
            )
            .await?;
        if !stage.success() {
            return Err(Error::ExecutionFailed(format!(
                "failed to stage /app: {}",
                stage.output.trim()
            )));
        }

        let entrypoint: Vec<String> = config
            .entrypoint
            .iter()
            .map(|part| {
                if part.starts_with(&format!("{WORKSPACE}/")) {
                    part.replacen(WORKSPACE, "/app", 1)
                } else {
                    part.clone()
                }
            })
            .collect();

        if let Some(binary) = entrypoint.first() {
            let verify = self
                .exec_collect(
                    &container_id,
                    shell(format!("test -f '{binary}' && chmod +x '{binary}'")),
                    None,
                    token,
                )
                .await?;
            if !verify.success() {
                return Err(Error::ExecutionFailed(format!(
                    "entrypoint not found in image: {binary}"
                )));
            }
        }

        let image_name = image_name_for(job, config);
        with_cancel(token, self.runtime.commit(&container_id, &image_name)).await?;

        // Default ports when the config declares none but the job exposes.
        let mut port_specs = config.ports.clone();
        if port_specs.is_empty() && job.expose_ports {
            port_specs.push(port_from_env(&ctx.env));
        }
        let mut ports = Vec::with_capacity(port_specs.len());
        for spec in &port_specs {
            ports.push(PortMapping::parse(spec)?);
        }

        let container_name = config
            .container_name
            .clone()
            .unwrap_or_else(|| format!("rapidflow-run-{}-{}", job.id, config.name));
        with_cancel(token, self.runtime.remove_by_name(&container_name)).await?;

        let mut env = ctx.env.clone();
        env.extend(
            config
                .environment
                .iter()
                .map(|(key, value)| format!("{key}={value}")),
        );

        let spec = ContainerSpec {
            image: image_name,
            env,
            entrypoint: (!entrypoint.is_empty()).then_some(entrypoint),
            working_dir: Some("/app".to_string()),
            ports,
            name: Some(container_name.clone()),
            ..Default::default()
        };
        let new_container = with_cancel(token, self.runtime.create_container(spec)).await?;
        with_cancel(token, self.runtime.start_container(&new_container)).await?;

        Ok(format!("container:{new_container}:{container_name}"))
    }

    async fn run_deployments(
        &self,
        runnable: &RunnableRecord,
        artifact: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let deployments = self.store.deployments_for_runnable(runnable.id).await?;

        for deployment in deployments.iter().filter(|d| d.status == "pending") {
            if token.is_cancelled() {
                break;
            }

            self.store
                .set_deployment_status(deployment.id, DeploymentStatus::Running, None, None)
                .await?;

            let Some(provider) = self.providers.lookup(&deployment.output_type) else {
                self.store
                    .set_deployment_status(
                        deployment.id,
                        DeploymentStatus::Failed,
                        None,
                        Some(&format!(
                            "no provider registered for type {}",
                            deployment.output_type
                        )),
                    )
                    .await?;
                continue;
            };

            let config: serde_json::Value =
                serde_json::from_str(&deployment.config).unwrap_or(serde_json::Value::Null);
            let request = DeployRequest {
                runnable_name: &runnable.name,
                config: &config,
                artifact_path: artifact,
            };

            let result = tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                result = provider.deploy(request) => result,
            };

            match result {
                Ok(outcome) => {
                    info!(deployment = deployment.id, output_type = %deployment.output_type, "deployment succeeded");
                    self.store
                        .set_deployment_status(
                            deployment.id,
                            DeploymentStatus::Success,
                            outcome.url.as_deref(),
                            outcome.message.as_deref(),
                        )
                        .await?;
                }
                Err(e) => {
                    // A deployment failure never aborts its peers.
                    warn!(deployment = deployment.id, output_type = %deployment.output_type, error = %e, "deployment failed");
                    self.store
                        .set_deployment_status(
                            deployment.id,
                            DeploymentStatus::Failed,
                            None,
                            Some(&e.to_string()),
                        )
                        .await?;
                    if matches!(e, Error::Cancelled) {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// The job's artifact staging directory: the clone dir when one exists,
    /// otherwise a lazily created `rapidflow-artifacts-{id}` recorded on the
    /// job row so stop-pipeline reclaims it.
    async fn staging_dir(&self, job_id: i64, ctx: &mut JobContext) -> Result<PathBuf> {
        if let Some(dir) = &ctx.temp_dir {
            return Ok(dir.clone());
        }
        let dir = self.temp_root.join(format!("rapidflow-artifacts-{job_id}"));
        tokio::fs::create_dir_all(&dir).await?;
        self.store
            .set_job_temp_dir(job_id, &dir.to_string_lossy())
            .await?;
        ctx.temp_dir = Some(dir.clone());
        Ok(dir)
    }

    async fn exec_collect(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        working_dir: Option<&str>,
        token: &CancellationToken,
    ) -> Result<ExecOutcome> {
        let session = with_cancel(token, self.runtime.exec(container_id, cmd, working_dir)).await?;
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            outcome = session.collect() => outcome,
        }
    }

    /// Release resources on every exit path. Temporary jobs keep their
    /// container and temp dir alive for the stop-pipeline sweep.
    async fn cleanup(&self, job: &JobRecord, ctx: &JobContext) {
        if job.temporary {
            debug!(job_id = job.id, "temporary job, leaving container for stop-pipeline");
            return;
        }
        if let Some(container_id) = &ctx.container_id
            && let Err(e) = self.runtime.remove(container_id).await
        {
            warn!(job_id = job.id, container = %container_id, error = %e, "failed to remove container");
        }
        if let Some(temp_dir) = &ctx.temp_dir
            && let Err(e) = tokio::fs::remove_dir_all(temp_dir).await
        {
            debug!(job_id = job.id, error = %e, "failed to remove temp dir");
        }
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

async fn with_cancel<T>(
    token: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

fn shell(script: String) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script]
}

fn require_container(ctx: &JobContext) -> Result<String> {
    ctx.container_id
        .clone()
        .ok_or_else(|| Error::Internal("no build container for runnable phase".to_string()))
}

fn image_name_for(job: &JobRecord, config: &RunnableConfig) -> String {
    config
        .image_name
        .clone()
        .unwrap_or_else(|| format!("rapidflow-job-{}-{}", job.id, config.name))
}

/// The `PORT` environment value, defaulting to 3000.
fn port_from_env(env: &[String]) -> String {
    env.iter()
        .find_map(|entry| entry.strip_prefix("PORT="))
        .unwrap_or("3000")
        .to_string()
}
