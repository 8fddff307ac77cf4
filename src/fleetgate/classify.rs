//! Heuristic error classification and compact evidence references.
//!
//! Worker errors are classified as `code_issue`, `ui_issue`, or `unknown` by
//! counting keyword matches from two disjoint lexicons.  The classification
//! routes different nudge strategies and feeds the compact reference strings
//! embedded in leader hints, e.g.
//! `[T042_esc001: code_issue in grid.rs:42 (ImportError…)]`.

/// Keywords that indicate code issues.
const CODE_KEYWORDS: [&str; 22] = [
    "import",
    "syntax",
    "typeerror",
    "referenceerror",
    "nameerror",
    "indentation",
    "eofmarker",
    "unexpected",
    "defined",
    "missing",
    "circular",
    "module",
    "package",
    "trace",
    "exception",
    "stack",
    "attribute",
    "key error",
    "value error",
    "assertion",
    "compile",
    "runtime",
];

/// Keywords that indicate UI issues.
const UI_KEYWORDS: [&str; 25] = [
    "visible",
    "layout",
    "position",
    "click",
    "element",
    "dom",
    "render",
    "component",
    "viewport",
    "display",
    "alignment",
    "button",
    "field",
    "input",
    "modal",
    "page",
    "css",
    "style",
    "background",
    "border",
    "font",
    "color",
    "size",
    "width",
    "height",
];

/// Error class decided by the keyword heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Syntax/import/type problems in code.
    CodeIssue,
    /// Layout/visibility problems in a UI.
    UiIssue,
    /// Insufficient evidence either way.
    Unknown,
}

impl ErrorKind {
    /// Snake-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CodeIssue => "code_issue",
            ErrorKind::UiIssue => "ui_issue",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Outcome of classifying an error string.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Decided class.
    pub kind: ErrorKind,
    /// Confidence 0.0..=0.95.
    pub confidence: f64,
    /// Matched keywords (top 5).
    pub keywords: Vec<String>,
    /// Why this classification was chosen.
    pub reasoning: Vec<String>,
    /// Suggested nudge strategy for the leader.
    pub recommendation: String,
}

impl Classification {
    fn unknown() -> Self {
        Classification {
            kind: ErrorKind::Unknown,
            confidence: 0.0,
            keywords: Vec::new(),
            reasoning: Vec::new(),
            recommendation: String::new(),
        }
    }

    /// Serialise for evidence metadata.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind.as_str(),
            "confidence": self.confidence,
            "keywords": self.keywords,
            "reasoning": self.reasoning,
            "recommendation": self.recommendation,
        })
    }
}

const ASK_WORKER: &str =
    "Ask worker: 'Is this a code issue (syntax/import) or UI issue (layout/visibility)?'";

/// Classify a worker error string.
///
/// Decision rule: ≥ 2 matches in one lexicon decides that class with
/// confidence `min(0.95, 0.6 + hits × 0.1)`; exactly 1 match with none from
/// the other lexicon decides at 0.65; otherwise `unknown`.
pub fn classify_error(error_text: &str) -> Classification {
    if error_text.is_empty() {
        return Classification::unknown();
    }

    let error_lower = error_text.to_lowercase();

    let matched_code: Vec<String> = CODE_KEYWORDS
        .iter()
        .filter(|kw| error_lower.contains(*kw))
        .map(|kw| kw.to_string())
        .collect();
    let matched_ui: Vec<String> = UI_KEYWORDS
        .iter()
        .filter(|kw| error_lower.contains(*kw))
        .map(|kw| kw.to_string())
        .collect();

    let code_hits = matched_code.len();
    let ui_hits = matched_ui.len();

    if code_hits >= 2 {
        Classification {
            kind: ErrorKind::CodeIssue,
            confidence: (0.6 + code_hits as f64 * 0.1).min(0.95),
            keywords: matched_code.into_iter().take(5).collect(),
            reasoning: vec![format!("Detected {} code error keywords", code_hits)],
            recommendation:
                "Send hint pointing to file:line + suggest checking imports/syntax/types"
                    .to_string(),
        }
    } else if ui_hits >= 2 {
        Classification {
            kind: ErrorKind::UiIssue,
            confidence: (0.6 + ui_hits as f64 * 0.1).min(0.95),
            keywords: matched_ui.into_iter().take(5).collect(),
            reasoning: vec![format!("Detected {} UI error keywords", ui_hits)],
            recommendation:
                "Send hint with screenshot reference + coordinate clues (e.g., 'Button not visible at x,y')"
                    .to_string(),
        }
    } else if code_hits == 1 && ui_hits == 0 {
        Classification {
            kind: ErrorKind::CodeIssue,
            confidence: 0.65,
            keywords: matched_code,
            reasoning: vec!["Detected 1 code keyword (low confidence)".to_string()],
            recommendation: ASK_WORKER.to_string(),
        }
    } else if ui_hits == 1 && code_hits == 0 {
        Classification {
            kind: ErrorKind::UiIssue,
            confidence: 0.65,
            keywords: matched_ui,
            reasoning: vec!["Detected 1 UI keyword (low confidence)".to_string()],
            recommendation: ASK_WORKER.to_string(),
        }
    } else {
        let mut keywords = matched_code;
        keywords.extend(matched_ui);
        Classification {
            kind: ErrorKind::Unknown,
            confidence: 0.0,
            keywords,
            reasoning: vec!["Insufficient evidence for classification".to_string()],
            recommendation: ASK_WORKER.to_string(),
        }
    }
}

/// Build the compact bracketed reference string for an escalation.
///
/// Examples:
/// - `[T042_esc001: code_issue in grid.rs:42 (ImportError visible)]`
/// - `[T042_esc001: ui_issue - Button not visible at (320, 180)]`
/// - `[T042_esc001: unknown - See ai/evidence/T042/escalation_001/]`
pub fn create_reference(
    task_id: &str,
    escalation_id: &str,
    classification: &Classification,
    promise: &str,
    detail: &str,
) -> String {
    let ref_id = format!("{}_esc{}", task_id, escalation_id);

    let mut reference = match classification.kind {
        ErrorKind::CodeIssue => {
            // Try to extract filename:line from the detail.
            let mut filename = "unknown".to_string();
            let mut line_number = String::new();
            if detail.contains(':') {
                let parts: Vec<&str> = detail.split(':').collect();
                if parts[0].contains('.') {
                    filename = parts[0]
                        .rsplit('/')
                        .next()
                        .unwrap_or(parts[0])
                        .to_string();
                }
                if parts.len() > 1 && parts[1].chars().all(|c| c.is_ascii_digit())
                    && !parts[1].is_empty()
                {
                    line_number = format!(":{}", parts[1]);
                }
            }
            let snippet: String = if detail.is_empty() {
                promise.to_string()
            } else {
                detail.chars().take(45).collect()
            };
            format!(
                "[{}: code_issue in {}{} ({})]",
                ref_id, filename, line_number, snippet
            )
        }
        ErrorKind::UiIssue => {
            let snippet: String = if detail.is_empty() {
                promise.to_string()
            } else {
                detail.chars().take(60).collect()
            };
            format!("[{}: ui_issue - {}]", ref_id, snippet)
        }
        ErrorKind::Unknown => format!(
            "[{}: unknown - See ai/evidence/{}/escalation_{}/]",
            ref_id, task_id, escalation_id
        ),
    };

    if classification.confidence > 0.0 && classification.confidence < 0.7 {
        reference.push_str(&format!(
            " (confidence: {:.0}%)",
            classification.confidence * 100.0
        ));
    }

    reference
}

/// Ultra-short reference for dashboards, e.g. `T042_esc001: code_issue`.
pub fn create_short_reference(task_id: &str, escalation_id: &str, kind: ErrorKind) -> String {
    format!("{}_esc{}: {}", task_id, escalation_id, kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_issue_detection() {
        let c = classify_error("ImportError: module not found, check the stack trace");
        assert_eq!(c.kind, ErrorKind::CodeIssue);
        assert!(c.confidence >= 0.8);
        assert!(!c.keywords.is_empty());
    }

    #[test]
    fn test_ui_issue_detection() {
        let c = classify_error("Button not visible, layout broken in viewport");
        assert_eq!(c.kind, ErrorKind::UiIssue);
        assert!(c.confidence >= 0.8);
    }

    #[test]
    fn test_single_hit_low_confidence() {
        let c = classify_error("something about layout maybe");
        assert_eq!(c.kind, ErrorKind::UiIssue);
        assert!((c.confidence - 0.65).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_when_ambiguous() {
        let c = classify_error("it just does not work");
        assert_eq!(c.kind, ErrorKind::Unknown);
        assert_eq!(c.confidence, 0.0);

        let c = classify_error("");
        assert_eq!(c.kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_confidence_is_capped() {
        let text = CODE_KEYWORDS.join(" ");
        let c = classify_error(&text);
        assert_eq!(c.kind, ErrorKind::CodeIssue);
        assert!((c.confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(c.keywords.len(), 5);
    }

    #[test]
    fn test_code_reference_extracts_file_and_line() {
        let c = classify_error("grid.rs:42: ImportError in module, syntax broken");
        let reference = create_reference("T042", "001", &c, "STUCK", "grid.rs:42: ImportError");
        assert!(reference.starts_with("[T042_esc001: code_issue in grid.rs:42"));
    }

    #[test]
    fn test_unknown_reference_points_to_evidence_dir() {
        let c = classify_error("??");
        let reference = create_reference("T042", "001", &c, "STUCK", "??");
        assert_eq!(
            reference,
            "[T042_esc001: unknown - See ai/evidence/T042/escalation_001/]"
        );
    }

    #[test]
    fn test_short_reference() {
        assert_eq!(
            create_short_reference("T042", "001", ErrorKind::CodeIssue),
            "T042_esc001: code_issue"
        );
    }
}
