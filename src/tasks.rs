//! Bounded worker pool for long-running community detection.
//!
//! Tasks flow Pending -> Running -> Complete | Failed. Status reads return a
//! copy so callers never observe a task mid-update. Cancel only applies to
//! Pending tasks; a running Leiden pass is atomic from the manager's view.
//!
//! The queue is bounded: submitting into a full queue fails with
//! `Unavailable` rather than blocking the caller, and submitting after
//! shutdown fails with `ShuttingDown`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::community::LeidenConfig;
use crate::error::{GibramError, Result};
use crate::types::{now_nanos, Community};

pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Poll interval for `await_result`.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// Task record. `status` and the result fields mutate under the manager's
/// lock; the public API only ever hands out clones.
#[derive(Debug, Clone)]
pub struct CommunityTask {
    pub id: String,
    pub session_id: String,
    pub config: LeidenConfig,
    pub hierarchical: bool,
    pub status: TaskStatus,
    /// Unix nanos; 0 until the task starts/ends.
    pub start_time: i64,
    pub end_time: i64,
    pub result: Option<Vec<Community>>,
    /// 0.0 to 1.0.
    pub progress: f64,
    pub error: Option<String>,
}

/// Copy-out counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskManagerStats {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub workers: usize,
}

/// Runs one detection request against a session; supplied by the engine.
pub type CommunityExecutor =
    Arc<dyn Fn(&str, &LeidenConfig, bool) -> Result<Vec<Community>> + Send + Sync>;

pub struct CommunityTaskManager {
    tasks: Arc<RwLock<HashMap<String, CommunityTask>>>,
    sender: Mutex<Option<mpsc::Sender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl CommunityTaskManager {
    /// Spawn `workers` worker tasks; must run inside a tokio runtime.
    pub fn new(executor: CommunityExecutor, workers: usize, queue_depth: usize) -> Self {
        let worker_count = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let queue_depth = if queue_depth == 0 {
            DEFAULT_QUEUE_DEPTH
        } else {
            queue_depth
        };

        let tasks: Arc<RwLock<HashMap<String, CommunityTask>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::channel::<String>(queue_depth);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let tasks = Arc::clone(&tasks);
            let rx = Arc::clone(&rx);
            let executor = Arc::clone(&executor);
            handles.push(tokio::spawn(async move {
                loop {
                    let task_id = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(task_id) = task_id else {
                        debug!(worker_id, "task worker exiting");
                        return;
                    };
                    process_task(&tasks, &executor, &task_id, worker_id);
                }
            }));
        }

        Self {
            tasks,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            worker_count,
        }
    }

    /// Queue a detection run; returns the task id immediately.
    pub fn submit(
        &self,
        session_id: &str,
        config: LeidenConfig,
        hierarchical: bool,
    ) -> Result<String> {
        let task_id = format!("comm_{}_{}", session_id, Uuid::new_v4().simple());
        let task = CommunityTask {
            id: task_id.clone(),
            session_id: session_id.to_string(),
            config,
            hierarchical,
            status: TaskStatus::Pending,
            start_time: 0,
            end_time: 0,
            result: None,
            progress: 0.0,
            error: None,
        };

        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(GibramError::ShuttingDown("task manager stopped"));
        };

        self.tasks.write().insert(task_id.clone(), task);
        match tx.try_send(task_id.clone()) {
            Ok(()) => Ok(task_id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.tasks.write().remove(&task_id);
                Err(GibramError::Unavailable("community task queue is full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.tasks.write().remove(&task_id);
                Err(GibramError::ShuttingDown("task manager stopped"))
            }
        }
    }

    /// Copy-out of a task's current state.
    pub fn status(&self, task_id: &str) -> Result<CommunityTask> {
        self.tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| GibramError::TaskNotFound(task_id.to_string()))
    }

    /// Poll until Complete, Failed, or the timeout elapses.
    pub async fn await_result(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Vec<Community>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.status(task_id)?;
            match task.status {
                TaskStatus::Complete => return Ok(task.result.unwrap_or_default()),
                TaskStatus::Failed => {
                    return Err(GibramError::Internal(format!(
                        "task {task_id} failed: {}",
                        task.error.unwrap_or_else(|| "unknown error".into())
                    )));
                }
                TaskStatus::Pending | TaskStatus::Running => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(GibramError::Timeout(format!(
                            "task {task_id} did not finish within {timeout:?}"
                        )));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Cancel a task that has not started. Running tasks are not
    /// interrupted.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| GibramError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(GibramError::InvalidInput(
                "only pending tasks can be cancelled".into(),
            ));
        }
        task.status = TaskStatus::Failed;
        task.end_time = now_nanos();
        task.error = Some("task cancelled".into());
        Ok(())
    }

    /// Drop Complete/Failed tasks older than `max_age`. Returns how many
    /// were removed.
    pub fn cleanup_old_tasks(&self, max_age: Duration) -> usize {
        let cutoff = now_nanos() - max_age.as_nanos() as i64;
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, t| {
            !matches!(t.status, TaskStatus::Complete | TaskStatus::Failed) || t.end_time >= cutoff
        });
        before - tasks.len()
    }

    /// All tasks belonging to one session, copy-out.
    pub fn tasks_for_session(&self, session_id: &str) -> Vec<CommunityTask> {
        let mut out: Vec<CommunityTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn stats(&self) -> TaskManagerStats {
        let tasks = self.tasks.read();
        let mut stats = TaskManagerStats {
            total_tasks: tasks.len(),
            workers: self.worker_count,
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending_tasks += 1,
                TaskStatus::Running => stats.running_tasks += 1,
                TaskStatus::Complete => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
            }
        }
        stats
    }

    /// Stop accepting work and let idle workers exit. Queued Pending tasks
    /// already in the channel still run.
    pub fn shutdown(&self) -> Vec<JoinHandle<()>> {
        *self.sender.lock() = None;
        std::mem::take(&mut *self.workers.lock())
    }
}

fn process_task(
    tasks: &Arc<RwLock<HashMap<String, CommunityTask>>>,
    executor: &CommunityExecutor,
    task_id: &str,
    worker_id: usize,
) {
    let (session_id, config, hierarchical) = {
        let mut tasks = tasks.write();
        let Some(task) = tasks.get_mut(task_id) else {
            return; // removed by cleanup before a worker got to it
        };
        if task.status != TaskStatus::Pending {
            return; // cancelled while queued
        }
        task.status = TaskStatus::Running;
        task.start_time = now_nanos();
        (task.session_id.clone(), task.config.clone(), task.hierarchical)
    };

    debug!(worker_id, task = task_id, session = %session_id, "community task started");
    let outcome = executor(&session_id, &config, hierarchical);

    let mut tasks = tasks.write();
    let Some(task) = tasks.get_mut(task_id) else {
        warn!(task = task_id, "task vanished while running");
        return;
    };
    task.end_time = now_nanos();
    match outcome {
        Ok(communities) => {
            task.status = TaskStatus::Complete;
            task.progress = 1.0;
            task.result = Some(communities);
        }
        Err(e) => {
            error!(task = task_id, error = %e, "community task failed");
            task.status = TaskStatus::Failed;
            task.error = Some(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(
        result: impl Fn(&str) -> Result<Vec<Community>> + Send + Sync + 'static,
    ) -> CommunityTaskManager {
        let executor: CommunityExecutor = Arc::new(move |session, _config, _hier| result(session));
        CommunityTaskManager::new(executor, 2, 8)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_and_await_round_trip() {
        let manager = manager_with(|_| Ok(vec![Community::new(1, "comm-1", 0, vec![1], vec![])]));
        let task_id = manager.submit("s1", LeidenConfig::default(), false).unwrap();

        let result = manager
            .await_result(&task_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);

        let task = manager.status(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.end_time >= task.start_time);
        assert_eq!(task.progress, 1.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_executor_marks_task_failed() {
        let manager = manager_with(|_| Err(GibramError::SessionNotFound("s1".into())));
        let task_id = manager.submit("s1", LeidenConfig::default(), true).unwrap();

        let err = manager
            .await_result(&task_id, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed"));
        assert_eq!(manager.status(&task_id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_task_is_not_found() {
        let manager = manager_with(|_| Ok(vec![]));
        assert!(matches!(
            manager.status("nope").unwrap_err(),
            GibramError::TaskNotFound(_)
        ));
        assert!(matches!(
            manager.cancel("nope").unwrap_err(),
            GibramError::TaskNotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_after_shutdown_fails() {
        let manager = manager_with(|_| Ok(vec![]));
        for handle in manager.shutdown() {
            let _ = handle.await;
        }
        assert!(matches!(
            manager.submit("s1", LeidenConfig::default(), false),
            Err(GibramError::ShuttingDown(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_removes_only_finished_tasks() {
        let manager = manager_with(|_| Ok(vec![]));
        let task_id = manager.submit("s1", LeidenConfig::default(), false).unwrap();
        manager
            .await_result(&task_id, Duration::from_secs(5))
            .await
            .unwrap();

        // Age 0: everything finished is old enough to purge.
        let removed = manager.cleanup_old_tasks(Duration::from_secs(0));
        assert_eq!(removed, 1);
        assert!(manager.status(&task_id).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stats_and_session_listing() {
        let manager = manager_with(|_| Ok(vec![]));
        let t1 = manager.submit("s1", LeidenConfig::default(), false).unwrap();
        let _t2 = manager.submit("s2", LeidenConfig::default(), false).unwrap();

        manager.await_result(&t1, Duration::from_secs(5)).await.unwrap();

        let for_s1 = manager.tasks_for_session("s1");
        assert_eq!(for_s1.len(), 1);
        assert_eq!(for_s1[0].session_id, "s1");

        let stats = manager.stats();
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.workers, 2);
    }
}
