//! Bounded-concurrency execution of a task graph.

use crate::errors::{MigrationError, Result};
use crate::graph::{Task, TaskAction, TaskGraph};
use crate::models::{TaskKey, TaskOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Timing and outcome of every task a run finished, in completion order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<TaskRecord>,
}

impl RunReport {
    pub fn record(&self, task: &TaskKey) -> Option<&TaskRecord> {
        let name = task.to_string();
        self.tasks.iter().find(|record| record.task == name)
    }

    /// Rows written by transfers, exports and CSV loads.
    pub fn rows_transferred(&self) -> usize {
        self.tasks
            .iter()
            .filter_map(|record| match &record.outcome {
                Some(TaskOutcome::Transferred(stats)) => Some(stats.rows_written),
                Some(TaskOutcome::Exported { stats, .. })
                | Some(TaskOutcome::Loaded { stats, .. }) => Some(stats.rows_written),
                _ => None,
            })
            .sum()
    }

    pub fn elapsed_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Bookkeeping of one run. Only the scheduler loop touches it.
struct RunState {
    remaining: HashMap<TaskKey, usize>,
    dependents: HashMap<TaskKey, Vec<TaskKey>>,
    ready: VecDeque<TaskKey>,
    running: usize,
    done: usize,
    total: usize,
    failure: Option<MigrationError>,
}

impl RunState {
    fn new(tasks: &[Task]) -> Self {
        let mut remaining = HashMap::with_capacity(tasks.len());
        let mut dependents: HashMap<TaskKey, Vec<TaskKey>> = HashMap::new();
        let mut ready = VecDeque::new();

        for task in tasks {
            remaining.insert(task.key.clone(), task.dependencies.len());
            for dependency in &task.dependencies {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(task.key.clone());
            }
            if task.dependencies.is_empty() {
                ready.push_back(task.key.clone());
            }
        }

        Self {
            remaining,
            dependents,
            ready,
            running: 0,
            done: 0,
            total: tasks.len(),
            failure: None,
        }
    }

    /// Next task to dispatch, unless a failure has stopped dispatching.
    fn next_ready(&mut self, concurrency: usize) -> Option<TaskKey> {
        if self.failure.is_some() || self.running >= concurrency {
            return None;
        }
        self.ready.pop_front()
    }

    fn start(&mut self) {
        self.running += 1;
    }

    fn complete(&mut self, key: &TaskKey) {
        self.running -= 1;
        self.done += 1;
        for dependent in self.dependents.remove(key).unwrap_or_default() {
            if let Some(count) = self.remaining.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    self.ready.push_back(dependent);
                }
            }
        }
    }

    fn fail(&mut self, key: TaskKey, err: MigrationError) {
        let err = match err {
            MigrationError::TaskPanicked(_) => err,
            err => MigrationError::Task {
                task: key.to_string(),
                source: Box::new(err),
            },
        };
        self.abandon(err);
    }

    /// Stops dispatch after a running task ended without a result.
    fn abandon(&mut self, err: MigrationError) {
        self.running -= 1;
        if self.failure.is_none() {
            self.failure = Some(err);
        } else {
            log::warn!("Additional failure while draining: {err}");
        }
    }

    fn is_finished(&self) -> bool {
        self.running == 0 && (self.failure.is_some() || self.ready.is_empty())
    }
}

type Finished = (TaskKey, DateTime<Utc>, DateTime<Utc>, Result<TaskOutcome>);

pub struct Scheduler {
    concurrency: usize,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Runs every task once its dependencies are done, at most
    /// `concurrency` at a time.
    ///
    /// The first failure stops further dispatch; tasks already running are
    /// awaited and the first error is returned.
    pub async fn run(&self, graph: TaskGraph) -> Result<RunReport> {
        graph.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let tasks = graph.into_tasks();
        let mut state = RunState::new(&tasks);
        let mut actions: HashMap<TaskKey, Arc<dyn TaskAction>> = tasks
            .into_iter()
            .map(|task| (task.key, task.action))
            .collect();
        let mut records = Vec::with_capacity(state.total);
        let mut running: JoinSet<Finished> = JoinSet::new();

        log::info!(
            "Run {run_id}: {} task(s), {} in parallel",
            state.total,
            self.concurrency
        );

        loop {
            while let Some(key) = state.next_ready(self.concurrency) {
                let Some(action) = actions.remove(&key) else {
                    continue;
                };
                state.start();
                log::debug!("Task {key} dispatched");
                running.spawn(execute(key, action));
            }

            if state.is_finished() {
                break;
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (key, task_started, task_finished, result) = match joined {
                Ok(finished) => finished,
                Err(err) => {
                    log::error!("Scheduler worker failed: {err}");
                    state.abandon(MigrationError::Other(anyhow::anyhow!(
                        "scheduler worker failed: {err}"
                    )));
                    continue;
                }
            };

            match result {
                Ok(outcome) => {
                    log::info!(
                        "Task {key} completed ({:.3}s)",
                        (task_finished - task_started).num_milliseconds() as f64 / 1000.0
                    );
                    state.complete(&key);
                    records.push(TaskRecord {
                        task: key.to_string(),
                        started_at: task_started,
                        finished_at: task_finished,
                        outcome: Some(outcome),
                        error: None,
                    });
                }
                Err(err) => {
                    log::warn!("Task {key} failed: {err}");
                    records.push(TaskRecord {
                        task: key.to_string(),
                        started_at: task_started,
                        finished_at: task_finished,
                        outcome: None,
                        error: Some(err.to_string()),
                    });
                    state.fail(key, err);
                }
            }
        }

        if let Some(err) = state.failure.take() {
            log::warn!(
                "Run {run_id} stopped after {} of {} task(s)",
                state.done,
                state.total
            );
            return Err(err);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            tasks: records,
        };
        log::info!(
            "Run {run_id} completed: {} task(s) in {:.3}s",
            state.done,
            report.elapsed_secs()
        );
        Ok(report)
    }
}

/// Runs one action on its own tokio task so a panic is caught and
/// attributed to `key`.
async fn execute(key: TaskKey, action: Arc<dyn TaskAction>) -> Finished {
    let started_at = Utc::now();
    let result = match tokio::spawn(async move { action.run().await }).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(MigrationError::TaskPanicked(key.to_string())),
        Err(err) => Err(MigrationError::Other(anyhow::anyhow!(
            "task '{key}' was cancelled: {err}"
        ))),
    };
    (key, started_at, Utc::now(), result)
}
