//! Task and subtask model with derived status and dependency unblocking.
//!
//! Tasks own their subtasks by value; the dependency DAG between subtasks
//! uses id references only, and cycles are rejected at creation.  The
//! in-memory [`TaskStore`] is ephemeral runtime state — `ai/todo.md` remains
//! the canonical task list.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::fleetgate::error::GatewayError;
use crate::fleetgate::promise::PromiseType;

/// Lifecycle states shared by tasks and subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    BreakingDown,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::BreakingDown => "breaking_down",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// One recorded iteration attempt on a subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number.
    pub iteration_num: u32,
    /// When the attempt started, when known.
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt was reported.
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds since the previous iteration's report.
    pub duration_sec: Option<f64>,
    /// Worker that ran the attempt.
    pub agent_id: String,
    /// Context tokens consumed this iteration.
    pub context_tokens_used: u64,
    /// Completion promise, when one was emitted.
    pub promise: Option<PromiseType>,
    /// Promise detail string.
    pub promise_detail: String,
    /// Error message, when the attempt failed.
    pub error: Option<String>,
    /// What approach was attempted (for dedup across retries).
    pub approach_tried: String,
    /// The leader hint active during this attempt.
    pub leader_hint: String,
}

/// A unit of work a single worker iterates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique subtask id.
    pub subtask_id: String,
    /// Parent task id.
    pub task_id: String,
    /// Short title.
    pub title: String,
    /// Full description handed to the worker.
    pub description: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Worker currently holding the subtask.
    pub assigned_to: Option<String>,
    /// Optional prompt-file reference.
    pub prompt_ref: Option<String>,
    /// Optional plan-file reference.
    pub plan_file: Option<String>,
    /// Subtask ids that must complete before this one can start.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Iteration budget (≥ 1).
    pub max_iterations: u32,
    /// Iterations consumed so far.
    pub current_iteration: u32,
    /// Graduated escalation level, 0..=3, monotonically non-decreasing.
    pub escalation_level: u8,
    /// Context tokens consumed across all iterations.
    pub context_tokens_total: u64,
    /// Context token budget for the subtask.
    pub context_budget_tokens: u64,
    /// Most recent promise.
    pub last_promise: Option<PromiseType>,
    /// Most recent promise detail.
    pub last_promise_detail: String,
    /// Hint injected by the leader at escalation level 1.
    pub leader_hint: String,
    /// In-memory iteration history (archived to disk on completion).
    #[serde(default)]
    pub iteration_history: Vec<IterationRecord>,
    /// Final result content.
    pub result: Option<String>,
    /// Complexity estimate used when budgeting iterations.
    pub complexity_score: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the subtask was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the subtask reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Subtask {
    /// Create a pending subtask under `task_id`.
    pub fn new(task_id: impl Into<String>, title: impl Into<String>) -> Self {
        Subtask {
            subtask_id: format!("st_{}", &Uuid::new_v4().simple().to_string()[..12]),
            task_id: task_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            assigned_to: None,
            prompt_ref: None,
            plan_file: None,
            blocked_by: Vec::new(),
            max_iterations: 5,
            current_iteration: 0,
            escalation_level: 0,
            context_tokens_total: 0,
            context_budget_tokens: 100_000,
            last_promise: None,
            last_promise_detail: String::new(),
            leader_hint: String::new(),
            iteration_history: Vec::new(),
            result: None,
            complexity_score: 1.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Iterations left in the budget.
    pub fn iterations_remaining(&self) -> i64 {
        self.max_iterations as i64 - self.current_iteration as i64
    }

    /// Whether context usage has crossed the 80% alert threshold.
    pub fn should_alert_context(&self) -> bool {
        if self.context_budget_tokens == 0 {
            return false;
        }
        (self.context_tokens_total as f64 / self.context_budget_tokens as f64) >= 0.80
    }

    /// Context usage as a percentage of the budget.
    pub fn context_usage_pct(&self) -> f64 {
        if self.context_budget_tokens == 0 {
            return 0.0;
        }
        self.context_tokens_total as f64 / self.context_budget_tokens as f64 * 100.0
    }
}

/// A top-level task composed of subtasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id (e.g. `"T42"`).
    pub task_id: String,
    /// Short title.
    pub title: String,
    /// Full description.
    pub description: String,
    /// Lifecycle state, derived from the subtasks once work begins.
    pub status: TaskStatus,
    /// Scheduling priority (higher first).
    pub priority: i32,
    /// Owned subtasks.
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When work began.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Iterations consumed across all subtasks.
    pub total_iterations_used: u32,
    /// Sum of the subtask iteration budgets.
    pub total_iteration_budget: u32,
    /// Arbitrary metadata (pause flags, rollback log, …).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    /// Create a pending task.
    pub fn new(task_id: impl Into<String>, title: impl Into<String>) -> Self {
        Task {
            task_id: task_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 0,
            subtasks: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_iterations_used: 0,
            total_iteration_budget: 0,
            metadata: HashMap::new(),
        }
    }

    /// Append a subtask, rejecting dependency cycles.
    pub fn add_subtask(&mut self, subtask: Subtask) -> Result<(), GatewayError> {
        self.subtasks.push(subtask);
        if let Err(e) = self.check_dependency_cycles() {
            self.subtasks.pop();
            return Err(e);
        }
        self.total_iteration_budget = self.subtasks.iter().map(|s| s.max_iterations).sum();
        Ok(())
    }

    /// Borrow a subtask by id.
    pub fn subtask(&self, subtask_id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.subtask_id == subtask_id)
    }

    /// Mutably borrow a subtask by id.
    pub fn subtask_mut(&mut self, subtask_id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.subtask_id == subtask_id)
    }

    /// Verify the blocked-by graph is acyclic.
    pub fn check_dependency_cycles(&self) -> Result<(), GatewayError> {
        let edges: HashMap<&str, &Vec<String>> = self
            .subtasks
            .iter()
            .map(|s| (s.subtask_id.as_str(), &s.blocked_by))
            .collect();

        // Iterative DFS with colour marking per start node.
        let mut done: HashSet<&str> = HashSet::new();
        for &start in edges.keys() {
            if done.contains(start) {
                continue;
            }
            let mut on_path: HashSet<&str> = HashSet::new();
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            on_path.insert(start);
            while let Some((node, idx)) = stack.pop() {
                let deps = match edges.get(node) {
                    Some(d) => d,
                    None => continue,
                };
                if idx < deps.len() {
                    stack.push((node, idx + 1));
                    let next = deps[idx].as_str();
                    if on_path.contains(next) {
                        return Err(GatewayError::Validation(format!(
                            "dependency cycle through subtask {}",
                            next
                        )));
                    }
                    if !done.contains(next) && edges.contains_key(next) {
                        on_path.insert(next);
                        stack.push((next, 0));
                    }
                } else {
                    on_path.remove(node);
                    done.insert(node);
                }
            }
        }
        Ok(())
    }

    /// Derived status as a pure, idempotent function of the subtasks.
    pub fn derived_status(&self) -> TaskStatus {
        if self.subtasks.is_empty() {
            return self.status;
        }

        let any_in_flight = self.subtasks.iter().any(|s| {
            matches!(s.status, TaskStatus::Assigned | TaskStatus::InProgress)
        });
        if any_in_flight {
            return TaskStatus::InProgress;
        }

        let all_terminal = self.subtasks.iter().all(|s| s.status.is_terminal());
        if all_terminal {
            if self.subtasks.iter().any(|s| s.status == TaskStatus::Failed) {
                return TaskStatus::Failed;
            }
            if self.subtasks.iter().all(|s| s.status == TaskStatus::Cancelled) {
                return TaskStatus::Cancelled;
            }
            return TaskStatus::Completed;
        }

        // Nothing in flight, some pending: in progress once any work landed.
        if self.subtasks.iter().any(|s| s.status.is_terminal()) {
            TaskStatus::InProgress
        } else {
            TaskStatus::Pending
        }
    }

    /// Recompute this task's status from its subtasks.
    ///
    /// An explicit `Cancelled` sticks; otherwise the derived status applies
    /// and terminal transitions stamp `completed_at`.
    pub fn update_status_from_subtasks(&mut self) {
        if self.status == TaskStatus::Cancelled {
            return;
        }
        let derived = self.derived_status();
        if derived != self.status {
            self.status = derived;
            if derived.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
            }
        }
    }

    /// Remove `completed_id` from every subtask's blocked-by set and return
    /// the ids of subtasks whose set became empty as a result.
    pub fn unblock_dependents(&mut self, completed_id: &str) -> Vec<String> {
        let mut newly_ready = Vec::new();
        for subtask in self.subtasks.iter_mut() {
            if subtask.blocked_by.iter().any(|id| id == completed_id) {
                subtask.blocked_by.retain(|id| id != completed_id);
                if subtask.blocked_by.is_empty() {
                    newly_ready.push(subtask.subtask_id.clone());
                }
            }
        }
        newly_ready
    }
}

/// Ephemeral in-process task map.
///
/// All mutation goes through [`TaskStore::with_task`], which holds the store
/// lock for the duration of the closure — the per-task critical section the
/// concurrency contract requires.
pub struct TaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        TaskStore {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace a task.
    pub async fn save(&self, task: Task) {
        self.tasks.lock().await.insert(task.task_id.clone(), task);
    }

    /// Snapshot a task by id.
    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Remove a task, returning it.
    pub async fn remove(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.remove(task_id)
    }

    /// Run `f` against the stored task under the store lock.
    pub async fn with_task<F, R>(&self, task_id: &str, f: F) -> Result<R, GatewayError>
    where
        F: FnOnce(&mut Task) -> R,
    {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(task_id) {
            Some(task) => Ok(f(task)),
            None => Err(GatewayError::Validation(format!(
                "Task {} not found",
                task_id
            ))),
        }
    }

    /// Snapshot all non-terminal tasks.
    pub async fn active_tasks(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Snapshot every task.
    pub async fn all_tasks(&self) -> Vec<Task> {
        self.tasks.lock().await.values().cloned().collect()
    }

    /// Pending, unassigned, unblocked subtasks across active tasks, highest
    /// priority first.
    pub async fn available_subtasks(&self, limit: usize) -> Vec<(String, Subtask)> {
        let tasks = self.tasks.lock().await;
        let mut candidates: Vec<(i32, String, Subtask)> = Vec::new();
        for task in tasks.values() {
            if task.status.is_terminal() {
                continue;
            }
            for subtask in &task.subtasks {
                if subtask.status == TaskStatus::Pending
                    && subtask.assigned_to.is_none()
                    && subtask.blocked_by.is_empty()
                {
                    candidates.push((task.priority, task.task_id.clone(), subtask.clone()));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates
            .into_iter()
            .take(limit)
            .map(|(_, task_id, subtask)| (task_id, subtask))
            .collect()
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        TaskStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask_with_id(task_id: &str, id: &str) -> Subtask {
        let mut st = Subtask::new(task_id, id);
        st.subtask_id = id.to_string();
        st
    }

    #[test]
    fn test_cycle_rejected_at_creation() {
        let mut task = Task::new("T1", "cyclic");
        let mut a = subtask_with_id("T1", "a");
        a.blocked_by = vec!["b".to_string()];
        let mut b = subtask_with_id("T1", "b");
        b.blocked_by = vec!["a".to_string()];

        task.add_subtask(a).unwrap();
        let err = task.add_subtask(b).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        // The offending subtask was not kept.
        assert_eq!(task.subtasks.len(), 1);
    }

    #[test]
    fn test_derived_status_precedence() {
        let mut task = Task::new("T1", "t");
        task.add_subtask(subtask_with_id("T1", "a")).unwrap();
        task.add_subtask(subtask_with_id("T1", "b")).unwrap();
        assert_eq!(task.derived_status(), TaskStatus::Pending);

        task.subtask_mut("a").unwrap().status = TaskStatus::InProgress;
        assert_eq!(task.derived_status(), TaskStatus::InProgress);

        // Failed dominates completed only once nothing is in flight.
        task.subtask_mut("a").unwrap().status = TaskStatus::Failed;
        task.subtask_mut("b").unwrap().status = TaskStatus::InProgress;
        assert_eq!(task.derived_status(), TaskStatus::InProgress);

        task.subtask_mut("b").unwrap().status = TaskStatus::Completed;
        assert_eq!(task.derived_status(), TaskStatus::Failed);

        task.subtask_mut("a").unwrap().status = TaskStatus::Completed;
        assert_eq!(task.derived_status(), TaskStatus::Completed);
    }

    #[test]
    fn test_derived_status_is_idempotent() {
        let mut task = Task::new("T1", "t");
        task.add_subtask(subtask_with_id("T1", "a")).unwrap();
        task.subtask_mut("a").unwrap().status = TaskStatus::Completed;
        task.update_status_from_subtasks();
        let first = task.status;
        task.update_status_from_subtasks();
        assert_eq!(task.status, first);
    }

    #[test]
    fn test_unblock_dependents_returns_newly_ready_set() {
        let mut task = Task::new("T1", "t");
        task.add_subtask(subtask_with_id("T1", "a")).unwrap();
        let mut b = subtask_with_id("T1", "b");
        b.blocked_by = vec!["a".to_string()];
        let mut c = subtask_with_id("T1", "c");
        c.blocked_by = vec!["a".to_string(), "b".to_string()];
        task.add_subtask(b).unwrap();
        task.add_subtask(c).unwrap();

        // Completing `a` readies `b` but not `c` (still blocked on `b`).
        let ready = task.unblock_dependents("a");
        assert_eq!(ready, vec!["b".to_string()]);

        let ready = task.unblock_dependents("b");
        assert_eq!(ready, vec!["c".to_string()]);
    }

    #[test]
    fn test_context_alert_threshold() {
        let mut st = Subtask::new("T1", "s");
        st.context_budget_tokens = 1000;
        st.context_tokens_total = 799;
        assert!(!st.should_alert_context());
        st.context_tokens_total = 800;
        assert!(st.should_alert_context());
    }

    #[tokio::test]
    async fn test_available_subtasks_excludes_blocked_and_assigned() {
        let store = TaskStore::new();
        let mut task = Task::new("T1", "t");
        task.add_subtask(subtask_with_id("T1", "free")).unwrap();
        let mut blocked = subtask_with_id("T1", "blocked");
        blocked.blocked_by = vec!["free".to_string()];
        task.add_subtask(blocked).unwrap();
        let mut taken = subtask_with_id("T1", "taken");
        taken.assigned_to = Some("w1".to_string());
        task.add_subtask(taken).unwrap();
        store.save(task).await;

        let available = store.available_subtasks(10).await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].1.subtask_id, "free");
    }
}
