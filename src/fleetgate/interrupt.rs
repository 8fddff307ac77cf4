//! Human-in-the-loop interrupt protocol.
//!
//! The local `ask_user_question` tool constructs an [`InterruptRequest`],
//! emits it as an event so the UI can render the question, then blocks on the
//! registered [`InterruptHandler`] until an answer arrives.  No hidden
//! continuation state: the answer is correlated back by interrupt id in the
//! [`ResumePayload`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why the agent is interrupting the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// The agent needs a question answered to continue.
    Clarification,
    /// The agent wants explicit approval for an action.
    HumanApproval,
    /// The agent is presenting a plan for review.
    PlanReview,
    /// The agent needs a file or artifact uploaded.
    UploadRequired,
    /// The agent hit an error it cannot recover from alone.
    ErrorRecovery,
}

impl InterruptReason {
    /// Parse a reason name, defaulting to `Clarification`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "human_approval" => InterruptReason::HumanApproval,
            "plan_review" => InterruptReason::PlanReview,
            "upload_required" => InterruptReason::UploadRequired,
            "error_recovery" => InterruptReason::ErrorRecovery,
            _ => InterruptReason::Clarification,
        }
    }
}

/// How the user is expected to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    /// Free-form text.
    Text,
    /// Pick one of the supplied options.
    Choice,
    /// Yes/no confirmation.
    Confirm,
}

impl InputType {
    /// Parse an input-type name, defaulting to `Text`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "choice" => InputType::Choice,
            "confirm" => InputType::Confirm,
            _ => InputType::Text,
        }
    }
}

/// One multiple-choice option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptOption {
    /// Display label.
    pub label: String,
    /// Optional longer description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A pending question for the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptRequest {
    /// Correlation id for the eventual [`ResumePayload`].
    pub id: String,
    /// Why the agent is asking.
    pub reason: InterruptReason,
    /// The question text.
    pub question: String,
    /// Multiple-choice options, when `input_type` is `Choice`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<InterruptOption>,
    /// Expected answer shape.
    pub input_type: InputType,
}

impl InterruptRequest {
    /// Build a request with a fresh correlation id.
    pub fn create(
        question: impl Into<String>,
        options: Vec<InterruptOption>,
        input_type: InputType,
        reason: InterruptReason,
    ) -> Self {
        InterruptRequest {
            id: format!("int_{}", &Uuid::new_v4().simple().to_string()[..12]),
            reason,
            question: question.into(),
            options,
            input_type,
        }
    }
}

/// Answer supplied by the external callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePayload {
    /// Id of the interrupt being answered.
    pub interrupt_id: String,
    /// The user's answer.
    pub answer: String,
}

/// Callback that resolves interrupts by collecting user input.
///
/// Implementations typically bridge to a terminal prompt or a UI dialog and
/// resolve once the user answers.
#[async_trait]
pub trait InterruptHandler: Send + Sync {
    /// Block until the user answers `request`.
    async fn handle(
        &self,
        request: &InterruptRequest,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_and_input_type_parse() {
        assert_eq!(InterruptReason::parse("plan_review"), InterruptReason::PlanReview);
        assert_eq!(InterruptReason::parse("whatever"), InterruptReason::Clarification);
        assert_eq!(InputType::parse("confirm"), InputType::Confirm);
        assert_eq!(InputType::parse(""), InputType::Text);
    }

    #[test]
    fn test_fresh_ids() {
        let a = InterruptRequest::create("q?", vec![], InputType::Text, InterruptReason::Clarification);
        let b = InterruptRequest::create("q?", vec![], InputType::Text, InterruptReason::Clarification);
        assert_ne!(a.id, b.id);
    }
}
