//! Evidence pack generation for escalation events.
//!
//! Every escalation hook produces exactly one JSON artifact on disk plus one
//! line appended to a global JSONL index:
//!
//! ```text
//! <evidence-root>/<task-id>/escalation_<escalation-id>/evidence.json
//! <evidence-root>/index.jsonl
//! ```
//!
//! Classification and reference strings are computed eagerly when a
//! promise-detail string is available, so leader hints and dashboards can
//! embed compact references without re-reading packs.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::fleetgate::classify::{classify_error, create_reference, Classification};
use crate::fleetgate::error::GatewayError;

/// Closed set of escalation event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceEventType {
    /// Hook 1: a worker reported a non-DONE promise.
    PromiseDetection,
    /// Hook 2: a worker went silent past the threshold.
    SilentWorker,
    /// Hook 3: context usage crossed 80% of the budget.
    ContextPressure,
    /// Hook 4: a STUCK report bumped the escalation level.
    EscalationBump,
    /// Hook 5: the iteration budget is exhausted.
    BudgetExhaustion,
}

impl EvidenceEventType {
    /// Snake-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceEventType::PromiseDetection => "promise_detection",
            EvidenceEventType::SilentWorker => "silent_worker",
            EvidenceEventType::ContextPressure => "context_pressure",
            EvidenceEventType::EscalationBump => "escalation_bump",
            EvidenceEventType::BudgetExhaustion => "budget_exhaustion",
        }
    }
}

/// Everything a hook site knows about the escalation being recorded.
#[derive(Debug, Clone)]
pub struct EvidenceContext {
    /// Parent task id (e.g. `"T042"`).
    pub task_id: String,
    /// Subtask the event concerns.
    pub subtask_id: String,
    /// Which hook fired.
    pub event_type: EvidenceEventType,
    /// Promise in effect, when one exists.
    pub promise: Option<String>,
    /// Promise detail / error text.
    pub promise_detail: Option<String>,
    /// Iteration number at capture time.
    pub iteration: u32,
    /// Escalation level at capture time.
    pub escalation_level: u8,
    /// Screenshot path, when one was captured.
    pub screenshot_path: Option<String>,
    /// Terminal snapshot, when available.
    pub pty_snapshot: Option<String>,
    /// Worker holding the subtask.
    pub worker_id: Option<String>,
    /// Session the worker belongs to.
    pub session_id: Option<String>,
    /// Additional event-specific fields merged into the evidence block.
    pub extra: HashMap<String, serde_json::Value>,
}

impl EvidenceContext {
    /// Minimal context for `task_id`/`subtask_id` and an event type.
    pub fn new(
        task_id: impl Into<String>,
        subtask_id: impl Into<String>,
        event_type: EvidenceEventType,
    ) -> Self {
        EvidenceContext {
            task_id: task_id.into(),
            subtask_id: subtask_id.into(),
            event_type,
            promise: None,
            promise_detail: None,
            iteration: 0,
            escalation_level: 1,
            screenshot_path: None,
            pty_snapshot: None,
            worker_id: None,
            session_id: None,
            extra: HashMap::new(),
        }
    }
}

/// Generates and stores evidence packs for escalation events.
pub struct EvidenceGenerator {
    root: PathBuf,
    // index.jsonl appends are serialised within this process.
    index_lock: Mutex<()>,
}

impl EvidenceGenerator {
    /// Create a generator rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(EvidenceGenerator {
            root,
            index_lock: Mutex::new(()),
        })
    }

    /// Evidence root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a unique-enough escalation id: `hex(epoch-ms)` truncated to
    /// twelve characters.
    pub fn generate_escalation_id(&self) -> String {
        let epoch_ms = Utc::now().timestamp_millis().max(0) as u128;
        let hex = format!("{:x}", epoch_ms);
        hex.chars().take(12).collect()
    }

    /// Write one evidence pack and append its index line.
    ///
    /// Returns the pack as written.  Classification and reference are
    /// computed when `promise_detail` is present.
    pub fn save_evidence(&self, ctx: &EvidenceContext) -> Result<serde_json::Value, GatewayError> {
        let escalation_id = self.generate_escalation_id();
        self.save_evidence_with_id(ctx, &escalation_id)
    }

    /// Like [`save_evidence`](EvidenceGenerator::save_evidence) with an
    /// explicit escalation id (used by tests and replays).
    pub fn save_evidence_with_id(
        &self,
        ctx: &EvidenceContext,
        escalation_id: &str,
    ) -> Result<serde_json::Value, GatewayError> {
        let evidence_dir = self
            .root
            .join(&ctx.task_id)
            .join(format!("escalation_{}", escalation_id));
        fs::create_dir_all(&evidence_dir)?;

        let classification: Option<Classification> = ctx
            .promise_detail
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(classify_error);

        let reference = classification.as_ref().map(|c| {
            create_reference(
                &ctx.task_id,
                escalation_id,
                c,
                ctx.promise.as_deref().unwrap_or("UNKNOWN"),
                ctx.promise_detail.as_deref().unwrap_or(""),
            )
        });

        let mut evidence_block = serde_json::json!({
            "promise": ctx.promise,
            "promise_detail": ctx.promise_detail,
            "iteration": ctx.iteration,
            "screenshot_path": ctx.screenshot_path,
            "pty_snapshot": ctx.pty_snapshot,
        });
        for (key, value) in &ctx.extra {
            evidence_block[key.as_str()] = value.clone();
        }

        let classification_json = classification.as_ref().map(|c| c.to_json());

        let pack = serde_json::json!({
            "version": 1,
            "task_id": ctx.task_id,
            "subtask_id": ctx.subtask_id,
            "escalation_id": escalation_id,
            "triggered_at": Utc::now().to_rfc3339(),
            "escalation_level": ctx.escalation_level,
            "event_type": ctx.event_type.as_str(),
            "evidence": evidence_block,
            "metadata": {
                "worker_id": ctx.worker_id,
                "session_id": ctx.session_id,
                "classification": classification_json,
                "reference": reference,
            },
        });

        let pack_path = evidence_dir.join("evidence.json");
        fs::write(&pack_path, serde_json::to_string_pretty(&pack)?)?;

        self.append_index(escalation_id, &pack)?;

        if log::log_enabled!(log::Level::Info) {
            log::info!(
                "Evidence pack {} written for {}/{} ({})",
                escalation_id,
                ctx.task_id,
                ctx.subtask_id,
                ctx.event_type.as_str()
            );
        }

        Ok(pack)
    }

    fn append_index(
        &self,
        escalation_id: &str,
        pack: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let entry = serde_json::json!({
            "ref_id": format!("{}_esc{}", pack["task_id"].as_str().unwrap_or(""), escalation_id),
            "task_id": pack["task_id"],
            "escalation_id": escalation_id,
            "timestamp": pack["triggered_at"],
            "event_type": pack["event_type"],
            "promise": pack["evidence"]["promise"],
            "screenshot": pack["evidence"]["screenshot_path"],
            "classification": pack["metadata"]["classification"],
        });

        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("index.jsonl"))?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        Ok(())
    }

    /// Read every index line, skipping unparseable ones.
    pub fn read_index(&self) -> Vec<serde_json::Value> {
        let path = self.root.join("index.jsonl");
        match fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_index_line_written_together() {
        let dir = tempfile::tempdir().unwrap();
        let generator = EvidenceGenerator::new(dir.path()).unwrap();

        let mut ctx = EvidenceContext::new("T042", "st_1", EvidenceEventType::EscalationBump);
        ctx.promise = Some("STUCK".to_string());
        ctx.promise_detail = Some("ImportError: missing module in trace".to_string());
        ctx.iteration = 2;

        let pack = generator.save_evidence_with_id(&ctx, "00ab12cd34ef").unwrap();
        assert_eq!(pack["version"], 1);
        assert_eq!(pack["event_type"], "escalation_bump");
        assert_eq!(pack["metadata"]["classification"]["type"], "code_issue");

        let pack_path = dir
            .path()
            .join("T042")
            .join("escalation_00ab12cd34ef")
            .join("evidence.json");
        assert!(pack_path.exists());

        let index = generator.read_index();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0]["ref_id"], "T042_esc00ab12cd34ef");
        assert_eq!(index[0]["event_type"], "escalation_bump");
    }

    #[test]
    fn test_index_is_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let generator = EvidenceGenerator::new(dir.path()).unwrap();

        for i in 0..3 {
            let ctx = EvidenceContext::new("T1", format!("st_{}", i), EvidenceEventType::SilentWorker);
            generator
                .save_evidence_with_id(&ctx, &format!("e{:011}", i))
                .unwrap();
        }

        let raw = std::fs::read_to_string(dir.path().join("index.jsonl")).unwrap();
        assert_eq!(raw.trim().lines().count(), 3);
        for line in raw.trim().lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[test]
    fn test_escalation_id_shape() {
        let dir = tempfile::tempdir().unwrap();
        let generator = EvidenceGenerator::new(dir.path()).unwrap();
        let id = generator.generate_escalation_id();
        assert!(id.len() <= 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
