use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    app_state::AppError,
    config::{self, CONFIG},
    db::Db,
    events::{Event, EventBus},
    health::{dedup::DedupEngine, HealthEngine},
    standalone::StandaloneSource,
    utils::now_secs,
    wanted::{scanner::WantedScanner, searcher::WantedSearcher},
};

/// Anything the scheduler can run. Scanner, searcher and the maintenance
/// engines implement this so the scheduler never depends on them directly.
#[async_trait]
pub trait Triggerable: Send + Sync {
    fn task_name(&self) -> &'static str;
    async fn run_task(&self, cancellation: CancellationToken) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: &'static str,
    pub running: bool,
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    pub last_error: Option<String>,
    pub interval_seconds: u64,
}

#[derive(Debug, Default)]
struct TaskState {
    running: bool,
    last_run: Option<i64>,
    next_run: Option<i64>,
    last_error: Option<String>,
}

struct ScheduledTask {
    runner: &'static dyn Triggerable,
    interval: Box<dyn Fn() -> u64 + Send + Sync>,
    state: TaskState,
}

/// Periodic trigger coordinator. One tick loop owns `next_run` bookkeeping;
/// a running task is never re-entered, manual triggers run immediately
/// unless the task is already running.
pub struct Scheduler {
    tasks: Mutex<Vec<ScheduledTask>>,
    cancellation: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish()
    }
}

impl Scheduler {
    pub fn new(cancellation: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            cancellation,
            tracker,
        }
    }

    pub fn register(
        &self,
        runner: &'static dyn Triggerable,
        interval: Box<dyn Fn() -> u64 + Send + Sync>,
    ) {
        let first_interval = interval();
        self.tasks.lock().unwrap().push(ScheduledTask {
            runner,
            interval,
            state: TaskState {
                next_run: Some(now_secs() + first_interval as i64),
                ..Default::default()
            },
        });
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|task| TaskStatus {
                name: task.runner.task_name(),
                running: task.state.running,
                last_run: task.state.last_run,
                next_run: task.state.next_run,
                last_error: task.state.last_error.clone(),
                interval_seconds: (task.interval)(),
            })
            .collect()
    }

    /// Manual trigger. Errors when the task is unknown or already running.
    pub fn trigger(&'static self, name: &str) -> Result<(), AppError> {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(index) = tasks
            .iter()
            .position(|t| t.runner.task_name() == name)
        else {
            return Err(AppError::not_found(format!("unknown task: {name}")));
        };
        let task = &mut tasks[index];
        if task.state.running {
            return Err(AppError::bad_request(format!("task {name} is already running")));
        }
        task.state.running = true;
        drop(tasks);
        self.spawn_task(index);
        Ok(())
    }

    /// Tick loop. Claims due tasks and spawns them on the tracker.
    pub async fn run(&'static self) {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.cancellation.cancelled() => break,
            }
            let now = now_secs();
            let due: Vec<usize> = {
                let mut tasks = self.tasks.lock().unwrap();
                let mut due = Vec::new();
                for (index, task) in tasks.iter_mut().enumerate() {
                    let is_due = task.state.next_run.map(|n| n <= now).unwrap_or(false);
                    if is_due && !task.state.running {
                        task.state.running = true;
                        due.push(index);
                    }
                }
                due
            };
            for index in due {
                self.spawn_task(index);
            }
        }
        tracing::trace!("Scheduler stopped");
    }

    fn spawn_task(&'static self, index: usize) {
        let cancellation = self.cancellation.clone();
        self.tracker.spawn(async move {
            let (runner, name) = {
                let tasks = self.tasks.lock().unwrap();
                let task = &tasks[index];
                (task.runner, task.runner.task_name())
            };
            tracing::debug!(task = name, "Task starting");
            let result = runner.run_task(cancellation).await;
            let mut tasks = self.tasks.lock().unwrap();
            let task = &mut tasks[index];
            task.state.running = false;
            task.state.last_run = Some(now_secs());
            task.state.next_run = Some(now_secs() + (task.interval)() as i64);
            match result {
                Ok(summary) => {
                    task.state.last_error = None;
                    tracing::info!(task = name, "Task finished: {summary}");
                }
                Err(e) => {
                    task.state.last_error = Some(e.to_string());
                    tracing::error!(task = name, "Task failed: {e}");
                }
            }
        });
    }
}

// Triggerable wiring for the long-lived components.

#[async_trait]
impl Triggerable for WantedScanner {
    fn task_name(&self) -> &'static str {
        "wanted_scan"
    }

    async fn run_task(&self, cancellation: CancellationToken) -> anyhow::Result<String> {
        let stats = self.scan(cancellation).await?;
        Ok(format!(
            "{} files, {} created, {} updated, {} removed",
            stats.files, stats.created, stats.updated, stats.removed
        ))
    }
}

#[async_trait]
impl Triggerable for WantedSearcher {
    fn task_name(&self) -> &'static str {
        "wanted_search"
    }

    async fn run_task(&self, cancellation: CancellationToken) -> anyhow::Result<String> {
        let stats = self.search_batch(cancellation).await?;
        Ok(format!(
            "{} items, {} succeeded, {} failed, {} skipped",
            stats.total, stats.succeeded, stats.failed, stats.skipped
        ))
    }
}

#[async_trait]
impl Triggerable for HealthEngine {
    fn task_name(&self) -> &'static str {
        "health_batch"
    }

    async fn run_task(&self, _cancellation: CancellationToken) -> anyhow::Result<String> {
        let checked = self
            .run_scheduled()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(format!("{checked} files checked"))
    }
}

#[async_trait]
impl Triggerable for DedupEngine {
    fn task_name(&self) -> &'static str {
        "dedup_scan"
    }

    async fn run_task(&self, _cancellation: CancellationToken) -> anyhow::Result<String> {
        let stats = self.scan().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(format!(
            "{} files hashed, {} duplicate groups",
            stats.files_hashed, stats.duplicate_groups
        ))
    }
}

/// Standalone full rescans ride the scanner schedule indirectly; this task
/// gives them their own knob.
pub struct StandaloneScanTask {
    pub standalone: &'static StandaloneSource,
    pub scanner: &'static WantedScanner,
}

#[async_trait]
impl Triggerable for StandaloneScanTask {
    fn task_name(&self) -> &'static str {
        "standalone_scan"
    }

    async fn run_task(&self, cancellation: CancellationToken) -> anyhow::Result<String> {
        let stats = self.standalone.scan(self.scanner, cancellation).await?;
        Ok(format!(
            "{} files, {} created, {} removed",
            stats.files, stats.created, stats.removed
        ))
    }
}

/// Scheduled cleanup rules: orphaned subtitles, expired metadata cache,
/// stale hook logs. Each run is audited.
pub struct CleanupTask {
    pub db: &'static Db,
    pub dedup: &'static DedupEngine,
    pub events: EventBus,
}

#[async_trait]
impl Triggerable for CleanupTask {
    fn task_name(&self) -> &'static str {
        "cleanup_rules"
    }

    async fn run_task(&self, _cancellation: CancellationToken) -> anyhow::Result<String> {
        let rules = self.db.list_cleanup_rules().await?;
        let mut summary = Vec::new();
        for rule in rules.into_iter().filter(|r| r.enabled) {
            let removed: i64 = match rule.rule_type.as_str() {
                "orphaned_subtitles" => {
                    let orphans = self.dedup.orphans().await.map_err(|e| anyhow::anyhow!("{e}"))?;
                    let mut removed = 0;
                    for path in orphans {
                        match crate::health::backup_file(&path).await {
                            Ok(_) => {
                                if tokio::fs::remove_file(&path).await.is_ok() {
                                    let _ = self.db.hash_remove(&path.to_string_lossy()).await;
                                    removed += 1;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(path = %path.display(), "Backup before orphan delete failed: {}", e.message)
                            }
                        }
                    }
                    removed
                }
                "expired_metadata_cache" => {
                    self.db.metadata_cache_evict_expired().await? as i64
                }
                "hook_logs" => self.db.clear_hook_logs().await? as i64,
                unknown => {
                    tracing::warn!(rule = %rule.name, "Unknown cleanup rule type: {unknown}");
                    continue;
                }
            };
            self.db
                .cleanup_record(&rule.rule_type, &rule.name, removed)
                .await?;
            self.events.publish(Event::CleanupRun {
                action: rule.rule_type.clone(),
                files_removed: removed,
            });
            summary.push(format!("{}: {removed}", rule.name));
        }
        Ok(if summary.is_empty() {
            "no enabled rules".to_string()
        } else {
            summary.join(", ")
        })
    }
}

/// Scheduled configuration+database backup.
pub struct BackupTask {
    pub events: EventBus,
}

#[async_trait]
impl Triggerable for BackupTask {
    fn task_name(&self) -> &'static str {
        "backup"
    }

    async fn run_task(&self, _cancellation: CancellationToken) -> anyhow::Result<String> {
        let path = crate::backup::create_backup().await?;
        self.events.publish(Event::BackupComplete {
            path: path.to_string_lossy().to_string(),
        });
        Ok(format!("backup written to {}", path.display()))
    }
}

/// Interval lookups resolve through the config store on every cycle so
/// changes apply without a restart.
pub fn interval_fn<T: config::ConfigValue + Into<u64>>() -> Box<dyn Fn() -> u64 + Send + Sync> {
    Box::new(|| CONFIG.get_value::<T>().into())
}

macro_rules! impl_into_u64 {
    ($($ty:ty),*) => {
        $(impl From<$ty> for u64 {
            fn from(value: $ty) -> u64 {
                value.0
            }
        })*
    };
}

impl_into_u64!(
    config::ScanIntervalSeconds,
    config::SearchIntervalSeconds,
    config::HealthIntervalSeconds,
    config::DedupIntervalSeconds,
    config::CleanupIntervalSeconds,
    config::BackupIntervalSeconds
);
