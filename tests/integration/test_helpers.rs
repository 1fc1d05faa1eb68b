//! Shared fixtures: a fully wired runner over an in-memory store, a
//! scripted planner, a programmable health probe, and a recording
//! completion notifier.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filewright::breaker::BreakerRegistry;
use filewright::config::{
    BreakerConfig, GenerationConfig, GlobalConfig, HealingConfig, TransportConfig, WorkerConfig,
};
use filewright::lock::LockManager;
use filewright::models::session::SessionKey;
use filewright::models::task::{Task, TaskFlags};
use filewright::notify::CompletionNotifier;
use filewright::planner::{ChatMessage, Complexity, Plan, Planner, ScriptedPlanner};
use filewright::probe::{HealthProbe, HealthReport};
use filewright::store::{db, SessionStore};
use filewright::transport::LocalFsTransport;
use filewright::worker::runner::SubmitReceipt;
use filewright::worker::Runner;
use filewright::Result;
use sqlx::SqlitePool;

/// Probe answering with a fixed verdict.
pub struct StubProbe {
    healthy: bool,
}

impl StubProbe {
    pub fn new(healthy: bool) -> Self {
        Self { healthy }
    }
}

impl HealthProbe for StubProbe {
    fn check<'a>(
        &'a self,
        _url: &'a str,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = HealthReport> + Send + 'a>> {
        Box::pin(async move {
            if self.healthy {
                HealthReport {
                    healthy: true,
                    status_code: Some(200),
                    latency_ms: 3,
                    error: None,
                }
            } else {
                HealthReport {
                    healthy: false,
                    status_code: Some(503),
                    latency_ms: 3,
                    error: Some("upstream broken".into()),
                }
            }
        })
    }
}

/// One recorded completion notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub webhook_url: String,
    pub task_id: String,
    pub status: String,
    pub result: serde_json::Value,
}

/// Notifier that records instead of delivering.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }
}

impl CompletionNotifier for RecordingNotifier {
    fn notify<'a>(
        &'a self,
        webhook_url: &'a str,
        task_id: &'a str,
        status: &'a str,
        result: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.events.lock().unwrap().push(Notification {
                webhook_url: webhook_url.to_owned(),
                task_id: task_id.to_owned(),
                status: status.to_owned(),
                result,
            });
        })
    }
}

/// Planner that stalls long enough to trip the execution timeout.
pub struct SlowPlanner {
    delay: Duration,
}

impl SlowPlanner {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Planner for SlowPlanner {
    fn generate<'a>(
        &'a self,
        _messages: &'a [ChatMessage],
        _complexity: Complexity,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(r#"{"summary": "late", "files": ["late.txt"]}"#.into())
        })
    }
}

pub struct Harness {
    pub runner: Arc<Runner>,
    pub store: SessionStore,
    pub locks: Arc<LockManager>,
    pub transport: Arc<LocalFsTransport>,
    pub notifier: Arc<RecordingNotifier>,
    pub pool: SqlitePool,
    pub config: Arc<GlobalConfig>,
    pub data_dir: tempfile::TempDir,
}

pub fn test_config(data_dir: &std::path::Path, remote_root: &std::path::Path) -> GlobalConfig {
    GlobalConfig {
        data_dir: data_dir.to_path_buf(),
        http_port: 0,
        retention_days: 30,
        worker: WorkerConfig {
            poll_interval_seconds: 1,
            task_timeout_seconds: 600,
            awaiting_staleness_minutes: 15,
            lock_timeout_seconds: 2,
            lock_stale_seconds: 300,
        },
        breaker: BreakerConfig::default(),
        healing: HealingConfig {
            health_url: "https://shop.example.test/health".into(),
            grace_seconds: 0,
            probe_timeout_seconds: 1,
        },
        generation: GenerationConfig {
            planner_url: None,
            planner_attempts: 2,
            max_generation_retries: 2,
            retry_initial_delay_ms: 5,
            retry_backoff_multiplier: 2.0,
        },
        transport: TransportConfig {
            remote_root: remote_root.to_path_buf(),
        },
    }
}

/// Build a harness around an arbitrary planner and probe verdict.
pub async fn harness_with(
    planner: Arc<dyn Planner>,
    probe_healthy: bool,
    tweak: impl FnOnce(&mut GlobalConfig),
) -> Harness {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let remote_root = data_dir.path().join("remote");
    std::fs::create_dir_all(&remote_root).expect("remote root");

    let mut config = test_config(data_dir.path(), &remote_root);
    tweak(&mut config);
    let config = Arc::new(config);

    let pool = db::connect_memory().await.expect("db");
    let store = SessionStore::new(pool.clone());
    let locks = Arc::new(LockManager::new(
        config.locks_dir(),
        Duration::from_secs(config.worker.lock_stale_seconds),
    ));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let transport = Arc::new(LocalFsTransport::new(
        config.transport.remote_root.clone(),
        config.backups_dir(),
    ));
    let notifier = Arc::new(RecordingNotifier::default());

    let runner = Arc::new(Runner::new(
        Arc::clone(&config),
        store.clone(),
        Arc::clone(&locks),
        breakers,
        planner,
        Arc::clone(&transport) as Arc<dyn filewright::transport::FileTransport>,
        Arc::new(StubProbe::new(probe_healthy)),
        Arc::clone(&notifier) as Arc<dyn CompletionNotifier>,
    ));

    Harness {
        runner,
        store,
        locks,
        transport,
        notifier,
        pool,
        config,
        data_dir,
    }
}

/// Harness with a scripted planner.
pub async fn harness(
    plan: Plan,
    contents: BTreeMap<String, String>,
    probe_healthy: bool,
    tweak: impl FnOnce(&mut GlobalConfig),
) -> Harness {
    harness_with(Arc::new(ScriptedPlanner::new(plan, contents)), probe_healthy, tweak).await
}

/// A one-file plan plus matching generated content.
pub fn one_file_fixture(path: &str, new_content: &str) -> (Plan, BTreeMap<String, String>) {
    let plan = Plan {
        summary: format!("rewrite {path}"),
        files: vec![path.to_owned()],
        questions: vec![],
    };
    let mut contents = BTreeMap::new();
    contents.insert(path.to_owned(), new_content.to_owned());
    (plan, contents)
}

pub fn session_key(chat_id: &str) -> SessionKey {
    SessionKey::new(chat_id, "http")
}

pub async fn submit(
    harness: &Harness,
    key: &SessionKey,
    instruction: &str,
    flags: TaskFlags,
) -> SubmitReceipt {
    harness
        .runner
        .submit(key, instruction, flags)
        .await
        .expect("submit")
}

/// Poll the store until the task satisfies `pred` or the timeout expires.
pub async fn wait_until(
    store: &SessionStore,
    task_id: &str,
    timeout: Duration,
    pred: impl Fn(&Task) -> bool,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(task) = store.find_by_task_id(task_id).await.expect("task lookup") {
            if pred(&task) {
                return task;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for task {task_id}; last status {:?} awaiting {:?}",
                    task.status, task.awaiting_type
                );
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for task {task_id}: not found");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Repeatedly scan and poll until the task satisfies `pred`.
///
/// The loop's spawned executions finish asynchronously; several scans may
/// be needed before the handle is observed as finished and the next step
/// is taken.
pub async fn scan_until(
    worker: &filewright::worker::WorkerLoop,
    store: &SessionStore,
    task_id: &str,
    timeout: Duration,
    pred: impl Fn(&Task) -> bool,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        worker.scan().await.expect("scan");
        if let Some(task) = store.find_by_task_id(task_id).await.expect("task lookup") {
            if pred(&task) {
                return task;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out scanning for task {task_id}; last status {:?} awaiting {:?}",
                    task.status, task.awaiting_type
                );
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("timed out scanning for task {task_id}: not found");
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

/// Seed a file in the managed tree.
pub fn seed_remote_file(harness: &Harness, path: &str, content: &str) {
    let full = harness.config.transport.remote_root.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).expect("seed dirs");
    }
    std::fs::write(full, content).expect("seed file");
}

/// Read a file from the managed tree.
pub fn read_remote_file(harness: &Harness, path: &str) -> String {
    std::fs::read_to_string(harness.config.transport.remote_root.join(path)).expect("read remote")
}
