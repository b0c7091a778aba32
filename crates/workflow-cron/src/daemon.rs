//! Tick loop and public operations of the cron scheduler daemon (spec.md
//! §4.6), grounded in `meridian-workflow::scheduler::CronScheduler`'s
//! `Arc<RwLock<HashMap<_, _>>>` + background-task shape, adapted to the
//! durable-storage and at-most-one-concurrent-run semantics spec.md
//! requires.

use crate::cron_expr;
use crate::error::{CronError, CronResult};
use crate::schedule::{Schedule, ScheduleFilter, ScheduleId};
use crate::storage::ScheduleStorage;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use workflow_engine::{run_workflow, OverallStatus, Workflow, WorkflowRunOptions};

/// Events emitted by the daemon (spec.md §4.6).
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    ScheduledRunTriggered {
        schedule_id: ScheduleId,
        workflow_path: String,
        is_manual: bool,
    },
    ScheduledRunCompleted {
        schedule_id: ScheduleId,
        status: Option<OverallStatus>,
        duration_ms: i64,
        error_message: Option<String>,
    },
}

pub type EventSink = mpsc::UnboundedSender<SchedulerEvent>;

/// One loaded schedule plus its execution-exclusion mutex (spec.md §5:
/// "one mutex per schedule id for execution exclusion").
struct LoadedSchedule {
    schedule: Schedule,
    run_lock: Arc<Mutex<()>>,
}

/// The cron scheduler daemon. Owns the durable schedule store, the
/// in-memory loaded set, and the single background tick loop.
pub struct CronDaemon {
    storage: Arc<dyn ScheduleStorage>,
    loaded: Arc<RwLock<HashMap<ScheduleId, LoadedSchedule>>>,
    wake: Arc<Notify>,
    stop: Arc<Notify>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
    events: Option<EventSink>,
}

impl CronDaemon {
    pub async fn new(storage: Arc<dyn ScheduleStorage>, events: Option<EventSink>) -> CronResult<Self> {
        let persisted = storage.load_all().await?;
        let mut loaded = HashMap::with_capacity(persisted.len());
        for (id, schedule) in persisted {
            loaded.insert(
                id,
                LoadedSchedule {
                    schedule,
                    run_lock: Arc::new(Mutex::new(())),
                },
            );
        }
        Ok(Self {
            storage,
            loaded: Arc::new(RwLock::new(loaded)),
            wake: Arc::new(Notify::new()),
            stop: Arc::new(Notify::new()),
            task_handle: Mutex::new(None),
            events,
        })
    }

    /// `AddSchedule` (spec.md §4.6). The cron expression is validated and
    /// the first `next_run_at` computed before the record is persisted.
    pub async fn add_schedule(&self, mut schedule: Schedule) -> CronResult<ScheduleId> {
        if !cron_expr::is_valid(&schedule.cron_expr) {
            return Err(CronError::InvalidCronExpression(
                schedule.cron_expr.clone(),
                "does not parse as a 5-field cron expression".to_string(),
            ));
        }
        schedule.next_run_at = cron_expr::next_occurrence(&schedule.cron_expr, Utc::now())?;
        let id = schedule.id;

        self.storage.save(&schedule).await?;
        self.loaded.write().await.insert(
            id,
            LoadedSchedule {
                schedule,
                run_lock: Arc::new(Mutex::new(())),
            },
        );
        self.wake.notify_one();
        Ok(id)
    }

    pub async fn remove_schedule(&self, id: ScheduleId) -> CronResult<()> {
        self.storage.delete(id).await?;
        self.loaded.write().await.remove(&id);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn enable_schedule(&self, id: ScheduleId) -> CronResult<()> {
        self.set_enabled(id, true).await
    }

    pub async fn disable_schedule(&self, id: ScheduleId) -> CronResult<()> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: ScheduleId, enabled: bool) -> CronResult<()> {
        let mut guard = self.loaded.write().await;
        let entry = guard.get_mut(&id).ok_or(CronError::ScheduleNotFound(id))?;
        entry.schedule.enabled = enabled;
        entry.schedule.next_run_at = if enabled {
            cron_expr::next_occurrence(&entry.schedule.cron_expr, Utc::now())?
        } else {
            None
        };
        self.storage.save(&entry.schedule).await?;
        drop(guard);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> Vec<Schedule> {
        self.loaded
            .read()
            .await
            .values()
            .map(|e| e.schedule.clone())
            .filter(|s| filter.matches(s))
            .collect()
    }

    pub async fn get_schedule(&self, id: ScheduleId) -> Option<Schedule> {
        self.loaded.read().await.get(&id).map(|e| e.schedule.clone())
    }

    /// `TriggerSchedule(id) -> runId` (spec.md §4.6): bypasses the cron
    /// timer but still honours the per-schedule mutex, and is recorded as
    /// manual.
    pub async fn trigger_schedule(&self, id: ScheduleId) -> CronResult<String> {
        let (schedule, run_lock) = {
            let guard = self.loaded.read().await;
            let entry = guard.get(&id).ok_or(CronError::ScheduleNotFound(id))?;
            (entry.schedule.clone(), entry.run_lock.clone())
        };
        let run_id = run_schedule(
            &self.storage,
            &self.loaded,
            id,
            schedule,
            run_lock,
            true,
            self.events.clone(),
        )
        .await;
        Ok(run_id)
    }

    /// `StartAsync` (spec.md §4.6): spawns the single background tick loop.
    pub async fn start(self: &Arc<Self>) {
        let mut handle_guard = self.task_handle.lock().await;
        if handle_guard.is_some() {
            tracing::warn!("cron daemon already running");
            return;
        }
        let daemon = self.clone();
        *handle_guard = Some(tokio::spawn(async move {
            daemon.tick_loop().await;
        }));
    }

    /// `StopAsync` (spec.md §4.6): signals the loop, waits for in-flight
    /// runs for a grace period, then cancels.
    pub async fn stop(&self, grace_period: Duration) {
        self.stop.notify_one();
        let handle = self.task_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(grace_period, handle).await;
        }
    }

    async fn tick_loop(self: Arc<Self>) {
        tracing::info!("cron scheduler daemon started");
        loop {
            let sleep_for = self.next_sleep_duration().await;

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => { continue; }
                _ = self.stop.notified() => {
                    tracing::info!("cron scheduler daemon stopping");
                    return;
                }
            }

            self.fire_due_schedules().await;
        }
    }

    async fn next_sleep_duration(&self) -> Duration {
        let now = Utc::now();
        let guard = self.loaded.read().await;
        let next = guard
            .values()
            .filter(|e| e.schedule.enabled)
            .filter_map(|e| e.schedule.next_run_at)
            .min();
        match next {
            Some(next) if next > now => (next - now)
                .to_std()
                .unwrap_or(Duration::from_secs(1)),
            Some(_) => Duration::from_millis(0),
            None => Duration::from_secs(3600),
        }
    }

    async fn fire_due_schedules(&self) {
        let now = Utc::now();
        // Advance `next_run_at` before spawning the run, not after it completes:
        // a schedule still holding its `run_lock` must drop out of the due set
        // on the very next tick instead of being re-selected every iteration
        // for as long as the run takes (spec.md §4.6 `NextOccurrence`).
        let due: Vec<(ScheduleId, Schedule, Arc<Mutex<()>>)> = {
            let mut guard = self.loaded.write().await;
            guard
                .iter_mut()
                .filter(|(_, e)| e.schedule.enabled)
                .filter(|(_, e)| e.schedule.next_run_at.is_some_and(|t| t <= now))
                .map(|(id, e)| {
                    e.schedule.next_run_at = cron_expr::next_occurrence(&e.schedule.cron_expr, now)
                        .ok()
                        .flatten();
                    (*id, e.schedule.clone(), e.run_lock.clone())
                })
                .collect()
        };

        for (id, schedule, run_lock) in due {
            let storage = self.storage.clone();
            if let Err(e) = storage.save(&schedule).await {
                tracing::error!(schedule_id = %id, error = %e, "failed to persist advanced next_run_at");
            }
            let loaded = self.loaded.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                run_schedule(&storage, &loaded, id, schedule, run_lock, false, events).await;
            });
        }
    }
}

/// Runs one schedule firing (manual or cron-driven). Overlap prevention is
/// the per-schedule `TryLock` (spec.md §4.6): a schedule already running
/// is skipped for this tick rather than queued.
async fn run_schedule(
    storage: &Arc<dyn ScheduleStorage>,
    loaded: &Arc<RwLock<HashMap<ScheduleId, LoadedSchedule>>>,
    id: ScheduleId,
    schedule: Schedule,
    run_lock: Arc<Mutex<()>>,
    is_manual: bool,
    events: Option<EventSink>,
) -> String {
    let run_id = uuid::Uuid::new_v4().to_string();

    let guard = match run_lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            tracing::warn!(schedule_id = %id, "schedule already running, skipping this tick");
            return run_id;
        }
    };

    emit(&events, SchedulerEvent::ScheduledRunTriggered {
        schedule_id: id,
        workflow_path: schedule.workflow_path.clone(),
        is_manual,
    });

    let run_start = Utc::now();
    let (status, error_message) = execute(&schedule).await;
    let duration_ms = (Utc::now() - run_start).num_milliseconds();

    emit(&events, SchedulerEvent::ScheduledRunCompleted {
        schedule_id: id,
        status,
        duration_ms,
        error_message: error_message.clone(),
    });

    if let Err(e) = error_message {
        tracing::error!(schedule_id = %id, error = %e, "scheduled run failed");
    }

    let next_run_at = cron_expr::next_occurrence(&schedule.cron_expr, run_start)
        .ok()
        .flatten();

    let mut write_guard = loaded.write().await;
    if let Some(entry) = write_guard.get_mut(&id) {
        entry.schedule.last_run_at = Some(run_start);
        entry.schedule.next_run_at = next_run_at;
        let persisted = entry.schedule.clone();
        drop(write_guard);
        if let Err(e) = storage.save(&persisted).await {
            tracing::error!(schedule_id = %id, error = %e, "failed to persist schedule after run");
        }
    }

    drop(guard);
    run_id
}

async fn execute(schedule: &Schedule) -> (Option<OverallStatus>, Result<(), String>) {
    let workflow = match load_workflow(&schedule.workflow_path).await {
        Ok(wf) => wf,
        Err(e) => return (None, Err(e)),
    };

    let options = WorkflowRunOptions {
        parameters: schedule.input_parameters.clone(),
        ..Default::default()
    };

    match run_workflow(
        workflow,
        std::env::vars().collect(),
        options,
        tokio_util::sync::CancellationToken::new(),
        None,
    )
    .await
    {
        Ok(ctx) => {
            let status = ctx.overall_status();
            let error_message = if status == OverallStatus::Failed {
                Err("one or more tasks failed".to_string())
            } else {
                Ok(())
            };
            (Some(status), error_message)
        }
        Err(e) => (None, Err(e.to_string())),
    }
}

async fn load_workflow(path: &str) -> Result<Workflow, String> {
    let contents = tokio::fs::read_to_string(Path::new(path))
        .await
        .map_err(|e| format!("failed to read workflow file {path}: {e}"))?;
    serde_yaml::from_str(&contents).map_err(|e| format!("failed to parse workflow file {path}: {e}"))
}

fn emit(events: &Option<EventSink>, event: SchedulerEvent) {
    if let Some(sink) = events {
        let _ = sink.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonFileScheduleStorage;
    use std::io::Write;

    async fn storage(dir: &tempfile::TempDir) -> Arc<dyn ScheduleStorage> {
        Arc::new(JsonFileScheduleStorage::new(dir.path().join("schedules.json")))
    }

    fn write_workflow(dir: &tempfile::TempDir, name: &str, yaml: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn add_and_list_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = CronDaemon::new(storage(&dir).await, None).await.unwrap();
        let schedule = Schedule::new("nightly", "0 0 * * *", "workflow.yaml");
        let id = daemon.add_schedule(schedule).await.unwrap();

        let all = daemon.list_schedules(&ScheduleFilter::default()).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert!(all[0].next_run_at.is_some());
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = CronDaemon::new(storage(&dir).await, None).await.unwrap();
        let schedule = Schedule::new("bad", "not a cron expr", "workflow.yaml");
        assert!(daemon.add_schedule(schedule).await.is_err());
    }

    #[tokio::test]
    async fn manual_trigger_runs_the_workflow_and_updates_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let workflow_path = write_workflow(
            &dir,
            "wf.yaml",
            "name: test\ntasks:\n  - id: a\n    run: \"echo hi\"\n",
        );
        let daemon = CronDaemon::new(storage(&dir).await, None).await.unwrap();
        let schedule = Schedule::new("manual", "0 0 * * *", &workflow_path);
        let id = daemon.add_schedule(schedule).await.unwrap();

        daemon.trigger_schedule(id).await.unwrap();
        let updated = daemon.get_schedule(id).await.unwrap();
        assert!(updated.last_run_at.is_some());
    }

    #[tokio::test]
    async fn disable_then_enable_round_trips_next_run_at() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = CronDaemon::new(storage(&dir).await, None).await.unwrap();
        let schedule = Schedule::new("toggle", "0 0 * * *", "workflow.yaml");
        let id = daemon.add_schedule(schedule).await.unwrap();

        daemon.disable_schedule(id).await.unwrap();
        assert!(daemon.get_schedule(id).await.unwrap().next_run_at.is_none());

        daemon.enable_schedule(id).await.unwrap();
        assert!(daemon.get_schedule(id).await.unwrap().next_run_at.is_some());
    }
}
