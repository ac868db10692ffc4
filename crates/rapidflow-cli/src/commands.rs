//! CLI command implementations.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use rapidflow_db::Store;
use rapidflow_deployer::ProviderRegistry;
use rapidflow_executor::{ContainerRuntime, DockerRuntime, docker};
use rapidflow_scheduler::{CancellationRegistry, Dispatcher, JobRunner, stop_pipeline, submit_job};

fn docker_runtime() -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    let runtime = DockerRuntime::new().context("failed to connect to the Docker daemon")?;
    Ok(Arc::new(runtime))
}

/// `rapidflow serve`: the long-running engine.
pub async fn serve(store: Store, scripts_dir: &str) -> anyhow::Result<()> {
    let docker = DockerRuntime::new().context("failed to connect to the Docker daemon")?;
    if !docker::ping(&docker).await {
        warn!("docker daemon not responding; jobs will fail until it is back");
    }
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let providers = Arc::new(ProviderRegistry::with_defaults());
    let cancellations = Arc::new(CancellationRegistry::new());
    let runner = Arc::new(
        JobRunner::new(store.clone(), runtime, providers, cancellations.clone())
            .with_scripts_dir(scripts_dir),
    );

    info!("engine ready");
    let dispatcher = Dispatcher::new(store, runner, cancellations);
    dispatcher.run().await;
    Ok(())
}

/// `rapidflow run <file>`: synchronous single-pipeline execution: same
/// insertions, same executor, no dispatcher.
pub async fn run_file(store: Store, scripts_dir: &str, path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {path}"))?;
    let config = rapidflow_config::parse_pipeline(&content)
        .with_context(|| format!("failed to parse pipeline config: {path}"))?;

    let pipeline = store.insert_pipeline(&config.name, &content).await?;
    let job = submit_job(&store, pipeline.id, &config).await?;
    println!("pipeline {} created, running job {}", pipeline.id, job.id);

    let runtime = docker_runtime()?;
    let providers = Arc::new(ProviderRegistry::with_defaults());
    let cancellations = Arc::new(CancellationRegistry::new());
    let runner = JobRunner::new(store.clone(), runtime, providers, cancellations)
        .with_scripts_dir(scripts_dir);

    let outcome = runner.run(job.id).await;

    let job = store.job(job.id).await?;
    println!("job {} finished: {}", job.id, job.status);
    for step in store.steps_for_job(job.id).await? {
        println!("  step {} [{}]: {}", step.order_num, step.step_type, step.status);
    }
    for runnable in store.runnables_for_job(job.id).await? {
        println!("  runnable {} [{}]: {}", runnable.name, runnable.runnable_type, runnable.status);
        for deployment in store.deployments_for_runnable(runnable.id).await? {
            println!("    deployment {}: {}", deployment.output_type, deployment.status);
        }
    }

    outcome?;
    Ok(())
}

/// `rapidflow stop --id <pipeline>`: the authoritative reclaimer.
pub async fn stop(store: Store, pipeline_id: i64) -> anyhow::Result<()> {
    let runtime = docker_runtime()?;
    let cancellations = CancellationRegistry::new();
    stop_pipeline(&store, &runtime, &cancellations, pipeline_id).await?;
    println!("pipeline {pipeline_id} stopped");
    Ok(())
}

/// `rapidflow pipelines list`
pub async fn list_pipelines(store: Store) -> anyhow::Result<()> {
    let pipelines = store.list_pipelines().await?;
    if pipelines.is_empty() {
        println!("no pipelines");
        return Ok(());
    }
    for pipeline in pipelines {
        let jobs = store.jobs_for_pipeline(pipeline.id).await?;
        println!(
            "{}\t{}\t{} job(s)\tcreated {}",
            pipeline.id,
            pipeline.name,
            jobs.len(),
            pipeline.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
