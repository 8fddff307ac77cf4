//! Iteration engine — worker reports, graduated escalation, evidence hooks.
//!
//! Workers claim subtasks, execute an attempt, and report back with a
//! completion promise.  Each report appends an iteration record and drives
//! the graduated escalation ladder:
//!
//! - escalation 0: plain retry
//! - escalation 1: leader injects a hint
//! - escalation 2: reassign to a different worker
//! - escalation 3: escalate to a human
//!
//! `STUCK` reports bump the level; an exhausted iteration budget fails the
//! subtask.  Evidence packs are auto-captured at each escalation hook, and a
//! completed subtask's iteration history is archived to disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::fleetgate::error::GatewayError;
use crate::fleetgate::evidence::{EvidenceContext, EvidenceEventType, EvidenceGenerator};
use crate::fleetgate::promise::PromiseType;
use crate::fleetgate::recovery::RecoveryManager;
use crate::fleetgate::tasks::{IterationRecord, Subtask, TaskStatus, TaskStore};

/// Inbound worker report for one subtask iteration.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Parent task id.
    pub task_id: String,
    /// Subtask being reported on.
    pub subtask_id: String,
    /// Reporting worker; must hold the subtask.
    pub agent_id: String,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Result content.
    pub result: String,
    /// Explicit error message, when the attempt failed.
    pub error: Option<String>,
    /// Context tokens consumed this iteration.
    pub context_tokens_used: u64,
    /// Completion promise.
    pub promise: Option<PromiseType>,
    /// Promise detail string.
    pub promise_detail: String,
    /// What approach was attempted.
    pub approach_tried: String,
}

impl WorkerReport {
    /// A minimal report skeleton; fill the rest with struct update syntax.
    pub fn new(
        task_id: impl Into<String>,
        subtask_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        WorkerReport {
            task_id: task_id.into(),
            subtask_id: subtask_id.into(),
            agent_id: agent_id.into(),
            success: false,
            result: String::new(),
            error: None,
            context_tokens_used: 0,
            promise: None,
            promise_detail: String::new(),
            approach_tried: String::new(),
        }
    }
}

/// What the engine decided the subtask should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// The subtask is complete.
    Complete,
    /// Retry with a fresh context.
    Retry,
    /// Retry with a leader hint injected.
    HintInjected,
    /// Reassign to a different worker.
    Reassigning,
    /// Hand off to a human.
    EscalateHuman,
}

impl NextAction {
    /// Snake-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            NextAction::Complete => "complete",
            NextAction::Retry => "retry",
            NextAction::HintInjected => "hint_injected",
            NextAction::Reassigning => "reassigning",
            NextAction::EscalateHuman => "escalate_human",
        }
    }
}

/// Feedback returned to the reporting worker.
#[derive(Debug, Clone)]
pub struct IterationFeedback {
    /// 1-based iteration number just recorded.
    pub iteration_num: u32,
    /// Iterations left in the budget.
    pub iterations_remaining: i64,
    /// Whether context usage crossed the 80% alert threshold.
    pub context_alert: bool,
    /// Decided next action.
    pub next_action: NextAction,
    /// Subtasks newly unblocked by a completion.
    pub unblocked_subtasks: Vec<String>,
}

// Internal result of the locked report step; evidence hooks fire after the
// store lock is released.
struct ReportOutcome {
    message: String,
    feedback: IterationFeedback,
    hooks: Vec<EvidenceContext>,
    completed: bool,
    released: bool,
}

/// Receives worker reports and drives subtask state.
pub struct IterationEngine {
    store: Arc<TaskStore>,
    evidence: Arc<EvidenceGenerator>,
    recovery: Arc<RecoveryManager>,
}

impl IterationEngine {
    /// Wire the engine over the shared store, evidence generator, and
    /// recovery manager.
    pub fn new(
        store: Arc<TaskStore>,
        evidence: Arc<EvidenceGenerator>,
        recovery: Arc<RecoveryManager>,
    ) -> Self {
        IterationEngine {
            store,
            evidence,
            recovery,
        }
    }

    /// Shared task store.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Claim a pending, unassigned subtask for `agent_id`.
    pub async fn claim_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
        agent_id: &str,
    ) -> Result<Subtask, GatewayError> {
        let subtask_id = subtask_id.to_string();
        let agent_id = agent_id.to_string();
        self.store
            .with_task(task_id, move |task| {
                let subtask = task.subtask_mut(&subtask_id).ok_or_else(|| {
                    GatewayError::Validation(format!("Subtask {} not found", subtask_id))
                })?;
                if let Some(holder) = &subtask.assigned_to {
                    return Err(GatewayError::Validation(format!(
                        "Subtask already assigned to {}",
                        holder
                    )));
                }
                // In-progress-but-unassigned subtasks were released for a
                // fresh-context retry and may be re-claimed.
                if !matches!(subtask.status, TaskStatus::Pending | TaskStatus::InProgress) {
                    return Err(GatewayError::Validation(format!(
                        "Subtask already {}",
                        subtask.status.as_str()
                    )));
                }
                if !subtask.blocked_by.is_empty() {
                    return Err(GatewayError::Validation(format!(
                        "Subtask blocked by {:?}",
                        subtask.blocked_by
                    )));
                }

                subtask.assigned_to = Some(agent_id.clone());
                subtask.status = TaskStatus::Assigned;
                subtask.started_at = Some(Utc::now());
                let snapshot = subtask.clone();

                if task.status == TaskStatus::Assigned || task.status == TaskStatus::Pending {
                    task.status = TaskStatus::InProgress;
                }
                if task.started_at.is_none() {
                    task.started_at = Some(Utc::now());
                }
                Ok(snapshot)
            })
            .await?
    }

    /// Mark a claimed subtask as actively being worked on and return its
    /// execution context.
    pub async fn start_work(
        &self,
        task_id: &str,
        subtask_id: &str,
        agent_id: &str,
    ) -> Result<serde_json::Value, GatewayError> {
        let subtask_id = subtask_id.to_string();
        let agent_id = agent_id.to_string();
        self.store
            .with_task(task_id, move |task| {
                let subtask = task.subtask_mut(&subtask_id).ok_or_else(|| {
                    GatewayError::Validation(format!("Subtask {} not found", subtask_id))
                })?;
                if subtask.assigned_to.as_deref() != Some(agent_id.as_str()) {
                    return Err(GatewayError::Validation(format!(
                        "Subtask not assigned to {}",
                        agent_id
                    )));
                }
                if subtask.status != TaskStatus::Assigned {
                    return Err(GatewayError::Validation(format!(
                        "Subtask in unexpected state: {}",
                        subtask.status.as_str()
                    )));
                }
                subtask.status = TaskStatus::InProgress;
                Ok(serde_json::json!({
                    "description": subtask.description,
                    "prompt_ref": subtask.prompt_ref,
                    "plan_file": subtask.plan_file,
                    "leader_hint": subtask.leader_hint,
                    "metadata": subtask.metadata,
                }))
            })
            .await?
    }

    /// Release a claimed subtask back to pending.
    pub async fn release_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> Result<String, GatewayError> {
        let subtask_id = subtask_id.to_string();
        let agent_id = agent_id.to_string();
        let reason = reason.to_string();
        self.store
            .with_task(task_id, move |task| {
                let subtask = task.subtask_mut(&subtask_id).ok_or_else(|| {
                    GatewayError::Validation(format!("Subtask {} not found", subtask_id))
                })?;
                if subtask.assigned_to.as_deref() != Some(agent_id.as_str()) {
                    return Err(GatewayError::Validation(format!(
                        "Subtask not assigned to {}",
                        agent_id
                    )));
                }
                subtask.status = TaskStatus::Pending;
                subtask.assigned_to = None;
                subtask.started_at = None;
                Ok(format!(
                    "Subtask released: {}",
                    if reason.is_empty() { "no reason" } else { &reason }
                ))
            })
            .await?
    }

    /// Handle a worker report: record the iteration, decide the next action,
    /// fire evidence hooks, and propagate status upward.
    pub async fn report(
        &self,
        report: WorkerReport,
    ) -> Result<(String, IterationFeedback), GatewayError> {
        let task_id = report.task_id.clone();
        let subtask_id = report.subtask_id.clone();
        let outcome = {
            let report = report.clone();
            self.store
                .with_task(&task_id, move |task| Self::apply_report(task, &report))
                .await??
        };

        // Evidence hooks fire outside the store lock; failures at this fringe
        // are logged and swallowed.
        for ctx in &outcome.hooks {
            if let Err(e) = self.evidence.save_evidence(ctx) {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("Failed to write evidence pack: {}", e);
                }
            }
        }

        if outcome.completed {
            self.recovery.reset_retry_count(&subtask_id).await;
            if let Err(e) = self
                .recovery
                .archive_iteration_history(&task_id, &subtask_id)
                .await
            {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("Failed to archive iterations for {}: {}", subtask_id, e);
                }
            }
        } else if outcome.feedback.next_action == NextAction::Reassigning && outcome.released {
            self.recovery.record_retry(&subtask_id).await;
        }

        Ok((outcome.message, outcome.feedback))
    }

    // The locked portion of report handling.
    fn apply_report(
        task: &mut crate::fleetgate::tasks::Task,
        report: &WorkerReport,
    ) -> Result<ReportOutcome, GatewayError> {
        let task_id = task.task_id.clone();
        let subtask = task
            .subtask_mut(&report.subtask_id)
            .ok_or_else(|| {
                GatewayError::Validation(format!("Subtask {} not found", report.subtask_id))
            })?;
        if subtask.assigned_to.as_deref() != Some(report.agent_id.as_str()) {
            return Err(GatewayError::Validation(format!(
                "Subtask not assigned to {}",
                report.agent_id
            )));
        }
        if subtask.status == TaskStatus::Assigned {
            subtask.status = TaskStatus::InProgress;
        }

        // Record the iteration.
        subtask.current_iteration += 1;
        let now = Utc::now();
        let duration_sec = subtask
            .iteration_history
            .last()
            .and_then(|prev| prev.ended_at)
            .map(|prev| (now - prev).num_milliseconds() as f64 / 1000.0);
        subtask.iteration_history.push(IterationRecord {
            iteration_num: subtask.current_iteration,
            started_at: subtask.started_at,
            ended_at: Some(now),
            duration_sec,
            agent_id: report.agent_id.clone(),
            context_tokens_used: report.context_tokens_used,
            promise: report.promise,
            promise_detail: report.promise_detail.clone(),
            error: report.error.clone(),
            approach_tried: report.approach_tried.clone(),
            leader_hint: subtask.leader_hint.clone(),
        });
        subtask.context_tokens_total += report.context_tokens_used;
        subtask.last_promise = report.promise;
        subtask.last_promise_detail = report.promise_detail.clone();
        task.total_iterations_used += 1;

        let subtask = task
            .subtask_mut(&report.subtask_id)
            .expect("subtask present");
        let context_alert = subtask.should_alert_context();
        let iterations_remaining = subtask.iterations_remaining();

        let mut hooks: Vec<EvidenceContext> = Vec::new();

        // Hook 3: context pressure.
        if context_alert {
            let mut ctx = EvidenceContext::new(
                task_id.clone(),
                subtask.subtask_id.clone(),
                EvidenceEventType::ContextPressure,
            );
            ctx.iteration = subtask.current_iteration;
            ctx.escalation_level = subtask.escalation_level;
            ctx.worker_id = subtask.assigned_to.clone();
            ctx.extra.insert(
                "context_tokens_total".to_string(),
                serde_json::json!(subtask.context_tokens_total),
            );
            ctx.extra.insert(
                "context_budget_tokens".to_string(),
                serde_json::json!(subtask.context_budget_tokens),
            );
            ctx.extra.insert(
                "context_usage_pct".to_string(),
                serde_json::json!(subtask.context_usage_pct()),
            );
            hooks.push(ctx);
        }

        let done = report.success && report.promise == Some(PromiseType::DONE);

        // STUCK bumps the escalation level (capped at 3).  Hook 4 fires only
        // while budget remains; exhaustion below takes precedence.
        if !done && report.promise == Some(PromiseType::STUCK) {
            let old_level = subtask.escalation_level;
            subtask.escalation_level = (subtask.escalation_level + 1).min(3);
            if subtask.escalation_level > old_level && iterations_remaining > 0 {
                let mut ctx = EvidenceContext::new(
                    task_id.clone(),
                    subtask.subtask_id.clone(),
                    EvidenceEventType::EscalationBump,
                );
                ctx.promise = Some("STUCK".to_string());
                ctx.promise_detail = Some(if report.promise_detail.is_empty() {
                    "Worker stuck pattern detected".to_string()
                } else {
                    report.promise_detail.clone()
                });
                ctx.iteration = subtask.current_iteration;
                ctx.escalation_level = subtask.escalation_level;
                ctx.worker_id = subtask.assigned_to.clone();
                ctx.extra.insert(
                    "escalation_from_level".to_string(),
                    serde_json::json!(old_level),
                );
                ctx.extra.insert(
                    "escalation_to_level".to_string(),
                    serde_json::json!(subtask.escalation_level),
                );
                hooks.push(ctx);
            }
        }

        let next_action = if done {
            NextAction::Complete
        } else if iterations_remaining <= 0 {
            NextAction::EscalateHuman
        } else {
            match subtask.escalation_level {
                0 => NextAction::Retry,
                1 => NextAction::HintInjected,
                2 => NextAction::Reassigning,
                _ => NextAction::EscalateHuman,
            }
        };

        let mut feedback = IterationFeedback {
            iteration_num: subtask.current_iteration,
            iterations_remaining,
            context_alert,
            next_action,
            unblocked_subtasks: Vec::new(),
        };
        let mut completed = false;
        let mut released = false;

        if done {
            subtask.completed_at = Some(now);
            subtask.status = TaskStatus::Completed;
            subtask.result = Some(report.result.clone());
            subtask.leader_hint.clear();
            completed = true;

            let completed_id = subtask.subtask_id.clone();
            feedback.unblocked_subtasks = task.unblock_dependents(&completed_id);
        } else if !report.success
            || matches!(
                report.promise,
                Some(PromiseType::STUCK) | Some(PromiseType::BLOCKED)
            )
        {
            if iterations_remaining <= 0 {
                // Hook 5: budget exhaustion.
                subtask.status = TaskStatus::Failed;
                subtask.completed_at = Some(now);
                subtask.result = Some(
                    report
                        .error
                        .clone()
                        .filter(|e| !e.is_empty())
                        .or_else(|| {
                            Some(report.result.clone()).filter(|r| !r.is_empty())
                        })
                        .unwrap_or_else(|| {
                            format!("Exhausted {} iterations", subtask.max_iterations)
                        }),
                );

                let mut ctx = EvidenceContext::new(
                    task_id.clone(),
                    subtask.subtask_id.clone(),
                    EvidenceEventType::BudgetExhaustion,
                );
                ctx.promise = report.promise.map(|p| p.as_str().to_string());
                ctx.promise_detail = Some(
                    report
                        .error
                        .clone()
                        .unwrap_or_else(|| "Budget exhausted".to_string()),
                );
                ctx.iteration = subtask.current_iteration;
                ctx.escalation_level = subtask.escalation_level;
                ctx.worker_id = subtask.assigned_to.clone();
                ctx.extra.insert(
                    "max_iterations".to_string(),
                    serde_json::json!(subtask.max_iterations),
                );
                ctx.extra
                    .insert("final_status".to_string(), serde_json::json!("FAILED"));
                hooks.push(ctx);
            } else {
                // Stay in progress; release so the subtask can be re-claimed
                // with a fresh context, possibly by a different worker.
                subtask.status = TaskStatus::InProgress;
                subtask.assigned_to = None;
                released = true;
            }
        } else {
            subtask.status = TaskStatus::InProgress;
            if report.promise == Some(PromiseType::PROGRESS) {
                subtask.result = Some(format!("Progress: {}%", report.promise_detail));
            }
        }

        // Hook 1: promise detection for non-DONE promises, batched away when
        // another pack already covers this report.
        if hooks.is_empty() {
            if let Some(promise) = report.promise {
                if promise != PromiseType::DONE {
                    let mut ctx = EvidenceContext::new(
                        task_id.clone(),
                        report.subtask_id.clone(),
                        EvidenceEventType::PromiseDetection,
                    );
                    ctx.promise = Some(promise.as_str().to_string());
                    ctx.promise_detail = Some(report.promise_detail.clone());
                    ctx.iteration = feedback.iteration_num;
                    ctx.escalation_level = task
                        .subtask(&report.subtask_id)
                        .map(|s| s.escalation_level)
                        .unwrap_or(0);
                    ctx.worker_id = Some(report.agent_id.clone());
                    hooks.push(ctx);
                }
            }
        }

        task.update_status_from_subtasks();

        let status_suffix = if completed {
            " - COMPLETED".to_string()
        } else if task
            .subtask(&report.subtask_id)
            .map(|s| s.status == TaskStatus::Failed)
            .unwrap_or(false)
        {
            " - FAILED (budget exhausted)".to_string()
        } else {
            format!(" - {}", next_action.as_str())
        };
        let max_iterations = task
            .subtask(&report.subtask_id)
            .map(|s| s.max_iterations)
            .unwrap_or(0);
        let message = format!(
            "Iteration {}/{}{}",
            feedback.iteration_num, max_iterations, status_suffix
        );

        Ok(ReportOutcome {
            message,
            feedback,
            hooks,
            completed,
            released,
        })
    }

    /// Inject a leader hint used on the subtask's next attempt.
    pub async fn inject_hint(
        &self,
        task_id: &str,
        subtask_id: &str,
        hint: &str,
    ) -> Result<(), GatewayError> {
        let subtask_id = subtask_id.to_string();
        let hint = hint.to_string();
        self.store
            .with_task(task_id, move |task| {
                match task.subtask_mut(&subtask_id) {
                    Some(subtask) => {
                        subtask.leader_hint = hint;
                        Ok(())
                    }
                    None => Err(GatewayError::Validation(format!(
                        "Subtask {} not found",
                        subtask_id
                    ))),
                }
            })
            .await?
    }
}

/// Detects workers that have been silent past the threshold (hook 2).
pub struct SilentWorkerMonitor {
    store: Arc<TaskStore>,
    evidence: Arc<EvidenceGenerator>,
    /// Silence beyond this fires the hook.
    pub silence_threshold: Duration,
    /// Scan period.
    pub check_interval: Duration,
}

impl SilentWorkerMonitor {
    /// Monitor with the standard 5-minute threshold scanned every 30 s.
    pub fn new(store: Arc<TaskStore>, evidence: Arc<EvidenceGenerator>) -> Self {
        SilentWorkerMonitor {
            store,
            evidence,
            silence_threshold: Duration::from_secs(300),
            check_interval: Duration::from_secs(30),
        }
    }

    /// One scan: returns `(task_id, subtask_id, silence_seconds)` for every
    /// in-progress, assigned subtask whose last activity is older than the
    /// threshold.
    pub async fn detect_silent_workers(&self) -> Vec<(String, String, i64)> {
        let now = Utc::now();
        let mut silent = Vec::new();

        for task in self.store.active_tasks().await {
            for subtask in &task.subtasks {
                if subtask.status != TaskStatus::InProgress || subtask.assigned_to.is_none() {
                    continue;
                }
                let last_activity = subtask
                    .iteration_history
                    .last()
                    .and_then(|rec| rec.ended_at)
                    .or(subtask.started_at)
                    .unwrap_or(subtask.created_at);
                let silence = (now - last_activity).num_seconds();
                if silence > self.silence_threshold.as_secs() as i64 {
                    silent.push((task.task_id.clone(), subtask.subtask_id.clone(), silence));
                }
            }
        }

        silent
    }

    /// Write a `silent_worker` evidence pack (escalation level 1) for each
    /// detected subtask.
    pub async fn process_silent_workers(&self, silent: &[(String, String, i64)]) {
        for (task_id, subtask_id, silence_sec) in silent {
            let worker = self
                .store
                .get(task_id)
                .await
                .and_then(|t| t.subtask(subtask_id).and_then(|s| s.assigned_to.clone()));

            let mut ctx =
                EvidenceContext::new(task_id.clone(), subtask_id.clone(), EvidenceEventType::SilentWorker);
            ctx.escalation_level = 1;
            ctx.worker_id = worker;
            ctx.extra.insert(
                "silence_duration_sec".to_string(),
                serde_json::json!(silence_sec),
            );

            if let Err(e) = self.evidence.save_evidence(&ctx) {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("Failed to record silent worker {}: {}", subtask_id, e);
                }
            } else if log::log_enabled!(log::Level::Info) {
                log::info!(
                    "Silent worker detected: {}/{} ({}s silent)",
                    task_id,
                    subtask_id,
                    silence_sec
                );
            }
        }
    }

    /// Run the periodic scan until the task is aborted.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            ticker.tick().await;
            let silent = self.detect_silent_workers().await;
            if !silent.is_empty() {
                self.process_silent_workers(&silent).await;
            }
        }
    }
}
