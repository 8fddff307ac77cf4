//! Task recovery: pause/resume, checkpoints, rollback, and graceful shutdown.
//!
//! Pausing prevents new subtask assignments and records the in-progress
//! subtasks as affected; it does not forcefully stop running agents.
//! Checkpoints snapshot the full task (round-trip faithful, timestamps and
//! nested subtasks included) plus any matching agent-state files, keeping at
//! most [`RecoveryManager::MAX_CHECKPOINTS_PER_TASK`] per task.  Completed
//! subtask iteration histories are archived to disk so the active task
//! representation stays lean.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::fleetgate::error::GatewayError;
use crate::fleetgate::tasks::{Task, TaskStatus, TaskStore};

/// Reasons for pausing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UserRequest,
    ErrorThreshold,
    RateLimit,
    ManualReview,
    DependencyBlocked,
    SystemMaintenance,
}

impl PauseReason {
    /// Parse a reason name, defaulting to `UserRequest`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "error_threshold" => PauseReason::ErrorThreshold,
            "rate_limit" => PauseReason::RateLimit,
            "manual_review" => PauseReason::ManualReview,
            "dependency_blocked" => PauseReason::DependencyBlocked,
            "system_maintenance" => PauseReason::SystemMaintenance,
            _ => PauseReason::UserRequest,
        }
    }
}

/// A saved task state checkpoint for rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id (16 hex chars).
    pub checkpoint_id: String,
    /// Task the snapshot belongs to.
    pub task_id: String,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
    /// Who requested it.
    pub created_by: String,
    /// Why it was taken.
    pub reason: String,
    /// Full task serialisation.
    pub task_snapshot: Task,
    /// Matching agent-state files, keyed by agent id.
    #[serde(default)]
    pub agent_states: HashMap<String, serde_json::Value>,
}

/// State recorded for a paused task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseState {
    /// The paused task.
    pub task_id: String,
    /// When the pause took effect.
    pub paused_at: DateTime<Utc>,
    /// Who initiated the pause.
    pub paused_by: String,
    /// Why the task is paused.
    pub reason: PauseReason,
    /// Human-readable message.
    pub message: String,
    /// Subtask ids that were in progress at pause time.
    #[serde(default)]
    pub affected_subtasks: Vec<String>,
}

/// Manages task recovery, pause/resume, and checkpoints.
pub struct RecoveryManager {
    store: Arc<TaskStore>,
    checkpoint_dir: PathBuf,
    agent_state_dir: PathBuf,
    paused: Mutex<HashMap<String, PauseState>>,
    retry_counts: Mutex<HashMap<String, u32>>,
}

impl RecoveryManager {
    /// Checkpoints retained per task; the oldest beyond this is deleted.
    pub const MAX_CHECKPOINTS_PER_TASK: usize = 5;
    /// Retry budget tracked independently of the iteration budget.
    pub const MAX_RETRY_ATTEMPTS: u32 = 3;

    /// Create a manager writing under `checkpoint_dir`, loading any persisted
    /// pause states.
    pub fn new(store: Arc<TaskStore>, checkpoint_dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let checkpoint_dir = checkpoint_dir.into();
        fs::create_dir_all(&checkpoint_dir)?;
        let agent_state_dir = checkpoint_dir
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let paused = Self::load_pause_states(&checkpoint_dir);
        Ok(RecoveryManager {
            store,
            checkpoint_dir,
            agent_state_dir,
            paused: Mutex::new(paused),
            retry_counts: Mutex::new(HashMap::new()),
        })
    }

    // =========================================================================
    // PAUSE / RESUME
    // =========================================================================

    /// Pause a task.  Refuses terminal tasks and double pauses.
    pub async fn pause_task(
        &self,
        task_id: &str,
        reason: PauseReason,
        message: &str,
        paused_by: &str,
    ) -> Result<String, GatewayError> {
        {
            let paused = self.paused.lock().await;
            if paused.contains_key(task_id) {
                return Err(GatewayError::Validation(format!(
                    "Task {} is already paused",
                    task_id
                )));
            }
        }

        let affected = self
            .store
            .with_task(task_id, |task| {
                if task.status.is_terminal() {
                    return Err(GatewayError::Validation(format!(
                        "Cannot pause task in {} state",
                        task.status.as_str()
                    )));
                }
                let affected: Vec<String> = task
                    .subtasks
                    .iter()
                    .filter(|s| s.status == TaskStatus::InProgress)
                    .map(|s| s.subtask_id.clone())
                    .collect();
                task.metadata
                    .insert("paused".to_string(), serde_json::json!(true));
                task.metadata.insert(
                    "paused_at".to_string(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
                task.metadata.insert(
                    "pause_reason".to_string(),
                    serde_json::json!(serde_json::to_value(reason)
                        .ok()
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default()),
                );
                Ok(affected)
            })
            .await??;

        let state = PauseState {
            task_id: task_id.to_string(),
            paused_at: Utc::now(),
            paused_by: paused_by.to_string(),
            reason,
            message: message.to_string(),
            affected_subtasks: affected.clone(),
        };

        {
            let mut paused = self.paused.lock().await;
            paused.insert(task_id.to_string(), state);
            self.save_pause_states(&paused)?;
        }

        Ok(format!(
            "Task {} paused. {} subtasks affected.",
            task_id,
            affected.len()
        ))
    }

    /// Resume a paused task, clearing the pause metadata.
    pub async fn resume_task(&self, task_id: &str, resumed_by: &str) -> Result<String, GatewayError> {
        let state = {
            let mut paused = self.paused.lock().await;
            let state = paused.remove(task_id).ok_or_else(|| {
                GatewayError::Validation(format!("Task {} is not paused", task_id))
            })?;
            self.save_pause_states(&paused)?;
            state
        };

        self.store
            .with_task(task_id, |task| {
                task.metadata.remove("paused");
                task.metadata.remove("paused_at");
                task.metadata.remove("pause_reason");
                task.metadata.insert(
                    "resumed_at".to_string(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
                task.metadata
                    .insert("resumed_by".to_string(), serde_json::json!(resumed_by));
            })
            .await?;

        Ok(format!(
            "Task {} resumed. {} subtasks can continue.",
            task_id,
            state.affected_subtasks.len()
        ))
    }

    /// Whether a task is currently paused.
    pub async fn is_task_paused(&self, task_id: &str) -> bool {
        self.paused.lock().await.contains_key(task_id)
    }

    /// Pause state for a task, if paused.
    pub async fn pause_state(&self, task_id: &str) -> Option<PauseState> {
        self.paused.lock().await.get(task_id).cloned()
    }

    /// All paused tasks.
    pub async fn list_paused_tasks(&self) -> Vec<PauseState> {
        self.paused.lock().await.values().cloned().collect()
    }

    /// Pause every active task.  Returns the number paused.
    pub async fn pause_all(&self, reason: PauseReason, message: &str) -> usize {
        let mut count = 0;
        for task in self.store.active_tasks().await {
            if self
                .pause_task(&task.task_id, reason, message, "system")
                .await
                .is_ok()
            {
                count += 1;
            }
        }
        count
    }

    /// Resume every paused task.  Returns the number resumed.
    pub async fn resume_all(&self) -> usize {
        let task_ids: Vec<String> = self.paused.lock().await.keys().cloned().collect();
        let mut count = 0;
        for task_id in task_ids {
            if self.resume_task(&task_id, "system").await.is_ok() {
                count += 1;
            }
        }
        count
    }

    // =========================================================================
    // CHECKPOINTS / ROLLBACK
    // =========================================================================

    /// Create a checkpoint for a task, evicting the oldest beyond the cap.
    pub async fn create_checkpoint(
        &self,
        task_id: &str,
        reason: &str,
        created_by: &str,
        include_agent_states: bool,
    ) -> Result<String, GatewayError> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| GatewayError::Validation(format!("Task {} not found", task_id)))?;

        let mut agent_states = HashMap::new();
        if include_agent_states {
            collect_agent_states(&self.agent_state_dir, task_id, &mut agent_states);
        }

        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            task_id: task_id.to_string(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            reason: reason.to_string(),
            task_snapshot: task,
            agent_states,
        };

        let path = self.checkpoint_path(task_id, &checkpoint.checkpoint_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(&checkpoint)?)?;

        self.cleanup_old_checkpoints(task_id);

        Ok(checkpoint.checkpoint_id)
    }

    /// List all checkpoints for a task, newest first.
    pub fn list_checkpoints(&self, task_id: &str) -> Vec<Checkpoint> {
        let task_dir = self.checkpoint_dir.join(task_id);
        let entries = match fs::read_dir(&task_dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut checkpoints: Vec<Checkpoint> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path().extension().map(|x| x == "json").unwrap_or(false)
                    && e.path().is_file()
            })
            .filter_map(|e| {
                fs::read_to_string(e.path())
                    .ok()
                    .and_then(|raw| serde_json::from_str::<Checkpoint>(&raw).ok())
            })
            .collect();

        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        checkpoints
    }

    /// Restore a task from a checkpoint, persisting the snapshot as current
    /// state and optionally restoring agent-state files.
    pub async fn restore_checkpoint(
        &self,
        task_id: &str,
        checkpoint_id: &str,
        restore_agent_states: bool,
    ) -> Result<String, GatewayError> {
        let path = self.checkpoint_path(task_id, checkpoint_id);
        if !path.exists() {
            return Err(GatewayError::Validation(format!(
                "Checkpoint {} not found",
                checkpoint_id
            )));
        }

        let checkpoint: Checkpoint = serde_json::from_str(&fs::read_to_string(&path)?)?;
        self.store.save(checkpoint.task_snapshot).await;

        let mut restored_agents = 0;
        if restore_agent_states {
            for (agent_id, state) in &checkpoint.agent_states {
                let state_path = self.agent_state_dir.join("agent_state.json");
                if let Some(parent) = state_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&state_path, serde_json::to_string_pretty(state)?)?;
                restored_agents += 1;
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("Restored agent state for {}", agent_id);
                }
            }
        }

        Ok(format!(
            "Restored from checkpoint {}. {} agent states restored.",
            checkpoint_id, restored_agents
        ))
    }

    /// Delete one checkpoint.  Returns whether it existed.
    pub fn delete_checkpoint(&self, task_id: &str, checkpoint_id: &str) -> bool {
        let path = self.checkpoint_path(task_id, checkpoint_id);
        if path.exists() {
            fs::remove_file(path).is_ok()
        } else {
            false
        }
    }

    /// Reset a non-completed subtask to pending so it can be re-claimed.
    ///
    /// Records a rollback entry in the task metadata.
    pub async fn rollback_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
        reason: &str,
    ) -> Result<String, GatewayError> {
        let subtask_id = subtask_id.to_string();
        let reason = reason.to_string();
        self.store
            .with_task(task_id, move |task| {
                let subtask = task
                    .subtask_mut(&subtask_id)
                    .ok_or_else(|| {
                        GatewayError::Validation(format!("Subtask {} not found", subtask_id))
                    })?;
                if subtask.status == TaskStatus::Completed {
                    return Err(GatewayError::Validation(
                        "Cannot rollback completed subtask".to_string(),
                    ));
                }

                let old_status = subtask.status;
                subtask.status = TaskStatus::Pending;
                subtask.assigned_to = None;
                subtask.started_at = None;
                subtask.result = None;

                let entry = serde_json::json!({
                    "subtask_id": subtask_id,
                    "from_status": old_status.as_str(),
                    "reason": reason,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                match task.metadata.get_mut("rollbacks") {
                    Some(serde_json::Value::Array(log)) => log.push(entry),
                    _ => {
                        task.metadata
                            .insert("rollbacks".to_string(), serde_json::json!([entry]));
                    }
                }

                Ok(format!(
                    "Subtask {} rolled back from {} to pending",
                    subtask_id,
                    old_status.as_str()
                ))
            })
            .await?
    }

    // =========================================================================
    // RETRY ACCOUNTING
    // =========================================================================

    /// Whether a subtask is still under the retry budget.
    pub async fn should_retry(&self, subtask_id: &str) -> bool {
        self.retry_counts
            .lock()
            .await
            .get(subtask_id)
            .copied()
            .unwrap_or(0)
            < Self::MAX_RETRY_ATTEMPTS
    }

    /// Record a retry attempt, returning the new count.
    pub async fn record_retry(&self, subtask_id: &str) -> u32 {
        let mut counts = self.retry_counts.lock().await;
        let count = counts.entry(subtask_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Clear the retry count (after a success).
    pub async fn reset_retry_count(&self, subtask_id: &str) {
        self.retry_counts.lock().await.remove(subtask_id);
    }

    /// Current retry count.
    pub async fn retry_count(&self, subtask_id: &str) -> u32 {
        self.retry_counts
            .lock()
            .await
            .get(subtask_id)
            .copied()
            .unwrap_or(0)
    }

    // =========================================================================
    // ITERATION ARCHIVE
    // =========================================================================

    /// Archive a terminated subtask's iteration history to disk and clear the
    /// in-memory list so the active task representation stays lean.
    pub async fn archive_iteration_history(
        &self,
        task_id: &str,
        subtask_id: &str,
    ) -> Result<String, GatewayError> {
        let archive_dir = self.checkpoint_dir.join(task_id).join("iterations");
        let subtask_id = subtask_id.to_string();

        let archive = self
            .store
            .with_task(task_id, move |task| {
                let subtask = task
                    .subtask_mut(&subtask_id)
                    .ok_or_else(|| {
                        GatewayError::Validation(format!("Subtask {} not found", subtask_id))
                    })?;
                if subtask.iteration_history.is_empty() {
                    return Err(GatewayError::Validation(
                        "No iteration history to archive".to_string(),
                    ));
                }

                let history = std::mem::take(&mut subtask.iteration_history);
                let archive = serde_json::json!({
                    "subtask_id": subtask.subtask_id,
                    "title": subtask.title,
                    "final_status": subtask.status.as_str(),
                    "total_iterations": subtask.current_iteration,
                    "max_iterations": subtask.max_iterations,
                    "complexity_score": subtask.complexity_score,
                    "context_tokens_total": subtask.context_tokens_total,
                    "last_promise": subtask.last_promise.map(|p| p.as_str()),
                    "archived_at": Utc::now().to_rfc3339(),
                    "iteration_history": history,
                });
                Ok((subtask.subtask_id.clone(), history_len(&archive), archive))
            })
            .await??;

        let (subtask_id, count, data) = archive;
        fs::create_dir_all(&archive_dir)?;
        let path = archive_dir.join(format!("{}.json", subtask_id));
        fs::write(&path, serde_json::to_string_pretty(&data)?)?;

        Ok(format!("Archived {} iterations to {:?}", count, path))
    }

    /// Read one archived iteration history.
    pub fn iteration_archive(&self, task_id: &str, subtask_id: &str) -> Option<serde_json::Value> {
        let path = self
            .checkpoint_dir
            .join(task_id)
            .join("iterations")
            .join(format!("{}.json", subtask_id));
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    /// Summaries (without full histories) of every archive for a task.
    pub fn list_iteration_archives(&self, task_id: &str) -> Vec<serde_json::Value> {
        let archive_dir = self.checkpoint_dir.join(task_id).join("iterations");
        let entries = match fs::read_dir(&archive_dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                fs::read_to_string(e.path())
                    .ok()
                    .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            })
            .map(|data| {
                serde_json::json!({
                    "subtask_id": data["subtask_id"],
                    "title": data["title"],
                    "final_status": data["final_status"],
                    "total_iterations": data["total_iterations"],
                    "max_iterations": data["max_iterations"],
                    "archived_at": data["archived_at"],
                })
            })
            .collect()
    }

    /// Aggregate archived iteration patterns into a postmortem report.
    pub async fn iteration_postmortem(&self, task_id: &str) -> serde_json::Value {
        let task = self.store.get(task_id).await;
        let archives = self.list_iteration_archives(task_id);

        let mut all_errors: HashMap<String, usize> = HashMap::new();
        let mut successful_approaches: Vec<String> = Vec::new();

        let archive_dir = self.checkpoint_dir.join(task_id).join("iterations");
        if let Ok(entries) = fs::read_dir(&archive_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let data: serde_json::Value = match fs::read_to_string(entry.path())
                    .ok()
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                {
                    Some(d) => d,
                    None => continue,
                };
                for rec in data["iteration_history"].as_array().cloned().unwrap_or_default() {
                    if let Some(error) = rec.get("error").and_then(|e| e.as_str()) {
                        *all_errors.entry(error.to_string()).or_insert(0) += 1;
                    }
                    let approach = rec
                        .get("approach_tried")
                        .and_then(|a| a.as_str())
                        .unwrap_or("");
                    if !approach.is_empty()
                        && rec.get("promise").and_then(|p| p.as_str()) == Some("DONE")
                        && !successful_approaches.iter().any(|a| a == approach)
                    {
                        successful_approaches.push(approach.to_string());
                    }
                }
            }
        }

        let mut common_errors: Vec<(String, usize)> = all_errors.into_iter().collect();
        common_errors.sort_by(|a, b| b.1.cmp(&a.1));
        let common_errors: Vec<serde_json::Value> = common_errors
            .into_iter()
            .take(5)
            .map(|(error, count)| serde_json::json!({"error": error, "count": count}))
            .collect();

        let (title, total_subtasks, used, budget) = match &task {
            Some(t) => (
                t.title.clone(),
                t.subtasks.len(),
                t.total_iterations_used,
                t.total_iteration_budget,
            ),
            None => ("Unknown".to_string(), 0, 0, 0),
        };
        let efficiency_pct = if budget > 0 {
            (used as f64 / budget as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        serde_json::json!({
            "task_id": task_id,
            "task_title": title,
            "total_subtasks": total_subtasks,
            "archived_subtasks": archives.len(),
            "total_iterations_used": used,
            "total_iteration_budget": budget,
            "efficiency_pct": efficiency_pct,
            "subtask_summaries": archives,
            "common_errors": common_errors,
            "successful_approaches": successful_approaches.into_iter().take(10).collect::<Vec<_>>(),
        })
    }

    // =========================================================================
    // SHUTDOWN / STARTUP
    // =========================================================================

    /// Pause all active tasks, checkpoint each, and persist pause states.
    pub async fn prepare_shutdown(&self) -> serde_json::Value {
        let paused_count = self
            .pause_all(PauseReason::SystemMaintenance, "Graceful shutdown")
            .await;

        let mut checkpoints_created = 0;
        let mut errors: Vec<String> = Vec::new();
        for task in self.store.active_tasks().await {
            match self
                .create_checkpoint(&task.task_id, "Shutdown checkpoint", "system", true)
                .await
            {
                Ok(_) => checkpoints_created += 1,
                Err(_) => errors.push(format!("Failed to checkpoint {}", task.task_id)),
            }
        }

        {
            let paused = self.paused.lock().await;
            let _ = self.save_pause_states(&paused);
        }

        serde_json::json!({
            "paused_tasks": paused_count,
            "checkpoints_created": checkpoints_created,
            "errors": errors,
        })
    }

    /// Load pause states and auto-resume tasks paused for maintenance.
    pub async fn recover_from_shutdown(&self) -> serde_json::Value {
        let found = self.paused.lock().await.len();

        let maintenance: Vec<String> = self
            .paused
            .lock()
            .await
            .iter()
            .filter(|(_, ps)| ps.reason == PauseReason::SystemMaintenance)
            .map(|(id, _)| id.clone())
            .collect();

        let mut auto_resumed = 0;
        for task_id in maintenance {
            if self.resume_task(&task_id, "system_recovery").await.is_ok() {
                auto_resumed += 1;
            }
        }

        serde_json::json!({
            "paused_tasks_found": found,
            "auto_resumed": auto_resumed,
        })
    }

    /// Manager statistics for admin endpoints.
    pub async fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "paused_tasks": self.paused.lock().await.len(),
            "retry_tracking": self.retry_counts.lock().await.len(),
            "checkpoint_dir": self.checkpoint_dir.to_string_lossy(),
            "max_checkpoints_per_task": Self::MAX_CHECKPOINTS_PER_TASK,
            "max_retry_attempts": Self::MAX_RETRY_ATTEMPTS,
        })
    }

    // =========================================================================
    // INTERNAL HELPERS
    // =========================================================================

    fn checkpoint_path(&self, task_id: &str, checkpoint_id: &str) -> PathBuf {
        self.checkpoint_dir
            .join(task_id)
            .join(format!("{}.json", checkpoint_id))
    }

    fn cleanup_old_checkpoints(&self, task_id: &str) -> usize {
        let checkpoints = self.list_checkpoints(task_id);
        let mut removed = 0;
        if checkpoints.len() > Self::MAX_CHECKPOINTS_PER_TASK {
            for checkpoint in &checkpoints[Self::MAX_CHECKPOINTS_PER_TASK..] {
                if self.delete_checkpoint(task_id, &checkpoint.checkpoint_id) {
                    removed += 1;
                }
            }
        }
        removed
    }

    fn save_pause_states(&self, paused: &HashMap<String, PauseState>) -> Result<(), GatewayError> {
        let path = self.checkpoint_dir.join("pause_states.json");
        fs::write(&path, serde_json::to_string_pretty(paused)?)?;
        Ok(())
    }

    fn load_pause_states(checkpoint_dir: &Path) -> HashMap<String, PauseState> {
        let path = checkpoint_dir.join("pause_states.json");
        fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }
}

fn history_len(archive: &serde_json::Value) -> usize {
    archive["iteration_history"]
        .as_array()
        .map(|a| a.len())
        .unwrap_or(0)
}

/// Recursively collect `agent_state.json` files referencing `task_id`.
fn collect_agent_states(
    dir: &Path,
    task_id: &str,
    out: &mut HashMap<String, serde_json::Value>,
) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_agent_states(&path, task_id, out);
        } else if path.file_name().map(|n| n == "agent_state.json").unwrap_or(false) {
            if let Some(state) = fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            {
                if state.get("current_task_id").and_then(|v| v.as_str()) == Some(task_id) {
                    let agent_id = state
                        .get("agent_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    out.insert(agent_id, state);
                }
            }
        }
    }
}
