//! End-to-end engine scenarios against a scripted container runtime.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use rapidflow_core::{Error, OutputConfig, PipelineConfig, Result, RunnableConfig, StepConfig};
use rapidflow_db::{JobRecord, Store, open_in_memory};
use rapidflow_deployer::ProviderRegistry;
use rapidflow_executor::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ExecSession, ExecSessionSink,
};
use rapidflow_scheduler::{
    CancellationRegistry, Dispatcher, JobRunner, cancel_job, stop_pipeline, submit_job,
};

// ---- scripted runtime ----

#[derive(Default)]
struct MockState {
    fail_pulls: HashSet<String>,
    fail_exec_containing: Option<String>,
    pulled: Vec<String>,
    created: Vec<ContainerSpec>,
    containers: HashMap<String, String>,
    removed: Vec<String>,
    execs: Vec<String>,
    commits: Vec<(String, String)>,
    counter: u32,
}

#[derive(Default)]
struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail_pull(&self, image: &str) {
        self.state.lock().unwrap().fail_pulls.insert(image.to_string());
    }

    fn fail_exec_containing(&self, pattern: &str) {
        self.state.lock().unwrap().fail_exec_containing = Some(pattern.to_string());
    }

    fn pulled(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }

    fn created(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    fn execs(&self) -> Vec<String> {
        self.state.lock().unwrap().execs.clone()
    }

    fn commits(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().commits.clone()
    }

    fn live_container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .cloned()
            .filter(|n| !n.is_empty())
            .collect()
    }

    fn live_container_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_pulls.contains(reference) {
            return Err(Error::Image(format!("pull refused for {reference}")));
        }
        state.pulled.push(reference.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let id = format!("ctr-{}", state.counter);
        state
            .containers
            .insert(id.clone(), spec.name.clone().unwrap_or_default());
        state.created.push(spec);
        Ok(id)
    }

    async fn start_container(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        _id: &str,
        cmd: Vec<String>,
        _working_dir: Option<&str>,
    ) -> Result<ExecSession> {
        let script = cmd.last().cloned().unwrap_or_default();
        let fail_pattern = {
            let mut state = self.state.lock().unwrap();
            state.execs.push(script.clone());
            state.fail_exec_containing.clone()
        };

        let (sink, session) = ExecSession::channel(64);
        tokio::spawn(async move {
            let ExecSessionSink { lines, exit } = sink;

            if let Some(pattern) = fail_pattern
                && script.contains(&pattern)
            {
                drop(lines);
                let _ = exit.send(Ok(1));
                return;
            }

            if script.contains("sleep") {
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(lines);
                let _ = exit.send(Ok(0));
            } else if let Some(rest) = script.strip_prefix("echo ") {
                let _ = lines.send(rest.trim_matches('\'').to_string()).await;
                drop(lines);
                let _ = exit.send(Ok(0));
            } else if let Some(code) = script.strip_prefix("exit ") {
                drop(lines);
                let _ = exit.send(Ok(code.trim().parse().unwrap_or(1)));
            } else {
                drop(lines);
                let _ = exit.send(Ok(0));
            }
        });

        Ok(session)
    }

    async fn commit(&self, id: &str, reference: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.commits.push((id.to_string(), reference.to_string()));
        Ok(format!("sha256:{reference}"))
    }

    async fn copy_from(&self, _id: &str, _src_path: &str, dst: &Path) -> Result<()> {
        std::fs::create_dir_all(dst.join("workspace"))?;
        std::fs::write(dst.join("workspace/app.txt"), "artifact")?;
        Ok(())
    }

    async fn save_image(&self, _reference: &str, dst: &Path) -> Result<()> {
        std::fs::write(dst, "image-tar")?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removed.push(id.to_string());
        state.containers.remove(id);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .map(|(id, name)| ContainerInfo {
                id: id.clone(),
                names: if name.is_empty() {
                    Vec::new()
                } else {
                    vec![format!("/{name}")]
                },
            })
            .collect())
    }
}

// ---- harness ----

struct Harness {
    store: Store,
    runtime: Arc<MockRuntime>,
    cancellations: Arc<CancellationRegistry>,
    runner: Arc<JobRunner>,
    pipeline_id: i64,
    temp_root: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let store = open_in_memory().await.unwrap();
        let runtime = MockRuntime::new();
        let cancellations = Arc::new(CancellationRegistry::new());
        let providers = Arc::new(ProviderRegistry::with_defaults());
        let temp_root = TempDir::new().unwrap();
        let runner = Arc::new(
            JobRunner::new(
                store.clone(),
                runtime.clone() as Arc<dyn ContainerRuntime>,
                providers,
                cancellations.clone(),
            )
            .with_temp_root(temp_root.path()),
        );
        let pipeline = store.insert_pipeline("demo", "{}").await.unwrap();
        Self {
            store,
            runtime,
            cancellations,
            runner,
            pipeline_id: pipeline.id,
            temp_root,
        }
    }

    async fn submit(&self, config: &PipelineConfig) -> JobRecord {
        submit_job(&self.store, self.pipeline_id, config).await.unwrap()
    }
}

fn bash(content: &str) -> StepConfig {
    StepConfig {
        step_type: "bash".to_string(),
        content: content.to_string(),
        ..Default::default()
    }
}

fn base_config(project: &TempDir) -> PipelineConfig {
    PipelineConfig {
        name: "A".to_string(),
        language: Some("golang".to_string()),
        version: Some("1.21".to_string()),
        folder: Some(project.path().to_string_lossy().into_owned()),
        ..Default::default()
    }
}

// ---- scenario A: happy path ----

#[tokio::test]
async fn happy_path_two_steps() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.env.insert("FOO".to_string(), "bar".to_string());
    config.steps = vec![bash("echo hello"), bash("echo world")];

    let job = harness.submit(&config).await;
    harness.runner.run(job.id).await.unwrap();

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "success");
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());

    let steps = harness.store.steps_for_job(job.id).await.unwrap();
    assert_eq!(steps[0].status, "success");
    assert!(steps[0].output.as_deref().unwrap().contains("hello"));
    assert_eq!(steps[1].status, "success");
    assert!(steps[1].output.as_deref().unwrap().contains("world"));

    // container created with the workspace mounted and the env applied,
    // then removed on exit
    let created = harness.runtime.created();
    assert_eq!(created.len(), 1);
    assert!(created[0].binds[0].ends_with(":/workspace"));
    assert!(created[0].env.contains(&"FOO=bar".to_string()));
    assert_eq!(job.container_id.as_deref(), Some("ctr-1"));
    assert_eq!(harness.runtime.removed(), vec!["ctr-1".to_string()]);
}

// ---- scenario B: mid-pipeline failure ----

#[tokio::test]
async fn failing_step_halts_the_job() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.steps = vec![bash("exit 7"), bash("echo world")];

    let job = harness.submit(&config).await;
    let err = harness.runner.run(job.id).await.unwrap_err();
    assert!(err.to_string().contains("exited with code 7"));

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "failed");

    let steps = harness.store.steps_for_job(job.id).await.unwrap();
    assert_eq!(steps[0].status, "failed");
    assert_eq!(steps[1].status, "pending");

    assert_eq!(harness.runtime.removed(), vec!["ctr-1".to_string()]);
}

// ---- scenario C: external cancellation during step 2 ----

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_during_long_step() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.steps = vec![bash("true"), bash("sleep 30")];

    let job = harness.submit(&config).await;
    let runner = harness.runner.clone();
    let job_id = job.id;
    let handle = tokio::spawn(async move { runner.run(job_id).await });

    // wait for step 2 to enter the exec drain
    let mut observed = false;
    for _ in 0..250 {
        let steps = harness.store.steps_for_job(job_id).await.unwrap();
        if steps.len() == 2 && steps[1].status == "running" {
            observed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(observed, "step 2 never entered running");

    let fired = cancel_job(&harness.store, &harness.cancellations, job_id)
        .await
        .unwrap();
    assert!(fired);

    handle.await.unwrap().unwrap();

    let job = harness.store.job(job_id).await.unwrap();
    assert_eq!(job.status, "cancelled");
    assert!(job.finished_at.is_some());

    let steps = harness.store.steps_for_job(job_id).await.unwrap();
    assert_eq!(steps[0].status, "success");
    assert_eq!(steps[1].status, "cancelled");

    assert_eq!(harness.runtime.removed(), vec!["ctr-1".to_string()]);
}

// ---- scenario D: runnable with one failing deployment ----

#[tokio::test]
async fn deployment_failure_is_isolated() {
    let project = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let destination = out.path().join("app-artifacts.zip");
    let mut config = base_config(&project);
    config.steps = vec![bash("echo build")];
    config.runnables = vec![RunnableConfig {
        name: "app".to_string(),
        runnable_type: "artifacts".to_string(),
        outputs: vec![
            OutputConfig {
                output_type: "local".to_string(),
                config: serde_json::json!({"path": destination.to_string_lossy()}),
            },
            OutputConfig {
                output_type: "webhook".to_string(),
                config: serde_json::json!({"url": "http://127.0.0.1:1/unreachable"}),
            },
        ],
        ..Default::default()
    }];

    let job = harness.submit(&config).await;
    harness.runner.run(job.id).await.unwrap();

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "success");

    let runnables = harness.store.runnables_for_job(job.id).await.unwrap();
    assert_eq!(runnables[0].status, "success");
    let artifact = runnables[0].artifact_url.clone().unwrap();
    assert!(artifact.ends_with("app-artifacts.zip"));

    let deployments = harness
        .store
        .deployments_for_runnable(runnables[0].id)
        .await
        .unwrap();
    assert_eq!(deployments.len(), 2);
    assert_eq!(deployments[0].status, "success");
    assert!(destination.exists());
    assert_eq!(deployments[1].status, "failed");
    assert!(deployments[1].output.is_some());
}

// ---- scenario E: fallback image + language detection ----

#[tokio::test]
async fn fallback_image_runs_installer_script() {
    let project = TempDir::new().unwrap();
    std::fs::write(project.path().join("go.mod"), "module demo\n\ngo 1.22\n").unwrap();

    let scripts = TempDir::new().unwrap();
    let installer = "apt-get update && apt-get install -y golang-1.22";
    std::fs::write(scripts.path().join("golang-1.22.sh"), installer).unwrap();

    let harness = Harness::new().await;
    harness.runtime.fail_pull("golang:1.22");

    let runner = {
        let providers = Arc::new(ProviderRegistry::with_defaults());
        Arc::new(
            JobRunner::new(
                harness.store.clone(),
                harness.runtime.clone() as Arc<dyn ContainerRuntime>,
                providers,
                harness.cancellations.clone(),
            )
            .with_scripts_dir(scripts.path())
            .with_temp_root(harness.temp_root.path()),
        )
    };

    let mut config = base_config(&project);
    config.language = None;
    config.version = None;
    config.steps = vec![bash("echo built")];

    let job = harness.submit(&config).await;
    runner.run(job.id).await.unwrap();

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "success");
    assert_eq!(job.language.as_deref(), Some("golang"));
    assert_eq!(job.version.as_deref(), Some("1.22"));

    // fell back to the generic image and reconstituted the toolchain
    assert_eq!(harness.runtime.pulled(), vec!["ubuntu:latest".to_string()]);
    assert!(harness.runtime.execs().iter().any(|e| e.as_str() == installer));
    let created = harness.runtime.created();
    assert_eq!(created[0].image, "ubuntu:latest");
}

// ---- scenario F: temporary job lifecycle + stop-pipeline ----

#[tokio::test]
async fn temporary_job_survives_until_stop_pipeline() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.temporary = true;
    config.steps = vec![bash("echo served")];
    config.runnables = vec![RunnableConfig {
        name: "web".to_string(),
        runnable_type: "docker_container".to_string(),
        image_name: Some("my-img".to_string()),
        container_name: Some("my-run".to_string()),
        ..Default::default()
    }];

    let job = harness.submit(&config).await;
    harness.runner.run(job.id).await.unwrap();

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "success");
    let temp_dir = job.temp_dir.clone().expect("temp dir recorded");
    let finished_at = job.finished_at.expect("finished stamp recorded");

    // runnable container is up, build container still alive, nothing removed
    let runnables = harness.store.runnables_for_job(job.id).await.unwrap();
    assert_eq!(runnables[0].status, "success");
    let artifact = runnables[0].artifact_url.clone().unwrap();
    assert!(artifact.starts_with("container:"));
    assert!(artifact.ends_with(":my-run"));
    assert!(harness.runtime.commits().iter().any(|(_, r)| r == "my-img"));
    assert!(harness
        .runtime
        .live_container_names()
        .contains(&"my-run".to_string()));
    assert!(harness.runtime.removed().is_empty());
    assert_eq!(harness.runtime.live_container_ids().len(), 2);

    // the sweep reclaims everything
    let runtime: Arc<dyn ContainerRuntime> = harness.runtime.clone();
    stop_pipeline(
        &harness.store,
        &runtime,
        &harness.cancellations,
        harness.pipeline_id,
    )
    .await
    .unwrap();

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "stopped");
    assert!(job.cancelled);
    // already-settled jobs keep their original finished stamp
    assert_eq!(job.finished_at, Some(finished_at));
    assert!(harness.runtime.live_container_ids().is_empty());
    assert!(!std::path::Path::new(&temp_dir).exists());
}

// ---- stop-pipeline while a job is still running ----

#[tokio::test(flavor = "multi_thread")]
async fn stop_pipeline_cancels_a_running_job() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.steps = vec![bash("true"), bash("sleep 30")];

    let job = harness.submit(&config).await;
    let runner = harness.runner.clone();
    let job_id = job.id;
    let handle = tokio::spawn(async move { runner.run(job_id).await });

    let mut observed = false;
    for _ in 0..250 {
        let steps = harness.store.steps_for_job(job_id).await.unwrap();
        if steps.len() == 2 && steps[1].status == "running" {
            observed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(observed, "step 2 never entered running");

    let runtime: Arc<dyn ContainerRuntime> = harness.runtime.clone();
    stop_pipeline(
        &harness.store,
        &runtime,
        &harness.cancellations,
        harness.pipeline_id,
    )
    .await
    .unwrap();

    // the executor observes the raised flag and unwinds cleanly
    handle.await.unwrap().unwrap();

    let job = harness.store.job(job_id).await.unwrap();
    assert_eq!(job.status, "stopped");
    assert!(job.cancelled);
    assert!(job.finished_at.is_some());

    let steps = harness.store.steps_for_job(job_id).await.unwrap();
    assert_eq!(steps[0].status, "success");
    assert_eq!(steps[1].status, "cancelled");
}

// ---- cancellation before the job ever ran ----

#[tokio::test]
async fn preflight_cancellation_settles_without_a_container() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.steps = vec![bash("echo never")];

    let job = harness.submit(&config).await;
    harness.store.mark_cancelled(job.id).await.unwrap();
    harness.runner.run(job.id).await.unwrap();

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "cancelled");
    let steps = harness.store.steps_for_job(job.id).await.unwrap();
    assert_eq!(steps[0].status, "cancelled");
    assert!(harness.runtime.created().is_empty());
}

// ---- the file-materialization soft failure ----

#[tokio::test]
async fn failed_file_write_faults_the_step_but_not_the_job() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;
    harness.runtime.fail_exec_containing("broken.txt");

    let mut files = std::collections::BTreeMap::new();
    files.insert("broken.txt".to_string(), "payload".to_string());
    let mut config = base_config(&project);
    config.steps = vec![
        StepConfig {
            step_type: "bash".to_string(),
            content: "echo with-file".to_string(),
            files,
        },
        bash("echo still-runs"),
    ];

    let job = harness.submit(&config).await;
    harness.runner.run(job.id).await.unwrap();

    let steps = harness.store.steps_for_job(job.id).await.unwrap();
    assert_eq!(steps[0].status, "failed");
    assert_eq!(steps[0].output.as_deref(), Some("Failed to create file"));
    // the loop moved on to the next step instead of halting the job
    assert_eq!(steps[1].status, "success");
    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "success");
}

// ---- unknown step types are ignored ----

#[tokio::test]
async fn unknown_step_type_counts_as_success() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.steps = vec![
        StepConfig {
            step_type: "ansible".to_string(),
            content: "playbook.yml".to_string(),
            ..Default::default()
        },
        bash("echo real"),
    ];

    let job = harness.submit(&config).await;
    harness.runner.run(job.id).await.unwrap();

    let steps = harness.store.steps_for_job(job.id).await.unwrap();
    assert_eq!(steps[0].status, "success");
    assert_eq!(steps[1].status, "success");
}

// ---- missing sources is a terminal acquisition failure ----

#[tokio::test]
async fn missing_sources_fail_before_any_container() {
    let harness = Harness::new().await;

    let config = PipelineConfig {
        name: "no-src".to_string(),
        language: Some("golang".to_string()),
        version: Some("latest".to_string()),
        steps: vec![bash("echo unreachable")],
        ..Default::default()
    };

    let job = harness.submit(&config).await;
    let err = harness.runner.run(job.id).await.unwrap_err();
    assert!(err.to_string().contains("either repo_url or folder"));

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "failed");
    assert!(harness.runtime.created().is_empty());
}

// ---- dispatcher claims and runs pending jobs ----

#[tokio::test]
async fn dispatcher_drives_a_pending_job_to_completion() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.steps = vec![bash("echo dispatched")];
    let job = harness.submit(&config).await;

    let dispatcher = Dispatcher::new(
        harness.store.clone(),
        harness.runner.clone(),
        harness.cancellations.clone(),
    );
    dispatcher.tick().await;

    let mut finished = false;
    for _ in 0..250 {
        let job = harness.store.job(job.id).await.unwrap();
        if job.status == "success" {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(finished, "dispatcher never completed the job");

    let steps = harness.store.steps_for_job(job.id).await.unwrap();
    assert!(steps[0].output.as_deref().unwrap().contains("dispatched"));
}

// ---- missing provider fails only the deployment ----

#[tokio::test]
async fn unknown_output_type_fails_only_that_deployment() {
    let project = TempDir::new().unwrap();
    let harness = Harness::new().await;

    let mut config = base_config(&project);
    config.steps = vec![bash("echo build")];
    config.runnables = vec![RunnableConfig {
        name: "app".to_string(),
        runnable_type: "artifacts".to_string(),
        outputs: vec![OutputConfig {
            output_type: "carrier_pigeon".to_string(),
            config: serde_json::json!({}),
        }],
        ..Default::default()
    }];

    let job = harness.submit(&config).await;
    harness.runner.run(job.id).await.unwrap();

    let runnables = harness.store.runnables_for_job(job.id).await.unwrap();
    assert_eq!(runnables[0].status, "success");

    let deployments = harness
        .store
        .deployments_for_runnable(runnables[0].id)
        .await
        .unwrap();
    assert_eq!(deployments[0].status, "failed");
    assert!(deployments[0]
        .output
        .as_deref()
        .unwrap()
        .contains("no provider registered"));

    let job = harness.store.job(job.id).await.unwrap();
    assert_eq!(job.status, "success");
}
