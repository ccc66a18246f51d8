//! Model output validation.
//!
//! Raw model text arrives with transport artifacts (usually a markdown code
//! fence) around the JSON payload. Parsing strips the fence, decodes the
//! contract type, and runs semantic validation. A malformed response is the
//! single most common external failure mode, so it maps to a typed error that
//! retains the offending text for diagnosis and never crashes the pipeline.

use thiserror::Error;

use super::report::AnalysisReport;

#[derive(Debug, Error)]
#[error("malformed model response: {reason}")]
pub struct ReportParseError {
    pub reason: String,
    /// The model output exactly as received, kept for logs.
    pub raw: String,
}

impl ReportParseError {
    fn new(reason: impl Into<String>, raw: &str) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

/// Parse raw model text into a validated `AnalysisReport`.
pub fn parse_report(raw: &str) -> Result<AnalysisReport, ReportParseError> {
    let cleaned = strip_code_fence(raw.trim());

    let report: AnalysisReport = serde_json::from_str(cleaned)
        .map_err(|e| ReportParseError::new(format!("invalid JSON: {e}"), raw))?;

    report
        .validate()
        .map_err(|e| ReportParseError::new(e.to_string(), raw))?;

    Ok(report)
}

fn strip_code_fence(text: &str) -> &str {
    let mut cleaned = text;
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.trim_end().strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::report::RiskLevel;

    const PAYLOAD: &str = r#"{
        "platform": "TikTok",
        "risk_level": "Medium",
        "summary_rationale": "One borderline scene.",
        "issues": [
            {
                "category": "Violence",
                "timestamp": "00:42",
                "snippet": "Two people shoving each other",
                "rationale": "Physical altercations are restricted",
                "policy_citations": ["Safety / Violent Content"]
            },
            {
                "category": "Regulated Goods",
                "timestamp": "Entire Video",
                "snippet": "Background shelf displays liquor bottles",
                "rationale": "Alcohol display requires age gating",
                "policy_citations": []
            }
        ]
    }"#;

    #[test]
    fn fenced_payload_parses_to_the_same_report_as_unfenced() {
        let bare = parse_report(PAYLOAD).expect("bare payload parses");
        let fenced = parse_report(&format!("```json\n{PAYLOAD}\n```")).expect("fenced parses");
        let untagged = parse_report(&format!("```\n{PAYLOAD}\n```")).expect("untagged parses");

        assert_eq!(bare, fenced);
        assert_eq!(bare, untagged);
        assert_eq!(bare.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn issue_order_is_preserved() {
        let report = parse_report(PAYLOAD).unwrap();
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.issues[0].category, "Violence");
        assert_eq!(report.issues[1].category, "Regulated Goods");
    }

    #[test]
    fn truncated_json_is_rejected_with_raw_text_retained() {
        let truncated = &PAYLOAD[..PAYLOAD.len() / 2];
        let error = parse_report(truncated).expect_err("truncated payload must fail");
        assert!(error.reason.contains("invalid JSON"));
        assert_eq!(error.raw, truncated, "original text must be retrievable");
    }

    #[test]
    fn non_json_text_is_rejected() {
        let error = parse_report("I could not analyze this video, sorry.")
            .expect_err("prose must fail");
        assert!(error.raw.contains("sorry"));
    }

    #[test]
    fn unknown_risk_level_is_rejected() {
        let error = parse_report(
            r#"{ "platform": "TikTok", "risk_level": "Severe", "issues": [] }"#,
        )
        .expect_err("unknown risk level must fail");
        assert!(error.reason.contains("invalid JSON"));
    }

    #[test]
    fn semantic_validation_failures_are_reported() {
        let error = parse_report(
            r#"{
                "platform": "TikTok",
                "risk_level": "Low",
                "issues": [
                    { "category": "", "snippet": "x", "rationale": "y" }
                ]
            }"#,
        )
        .expect_err("empty category must fail");
        assert!(error.reason.contains("category"));
    }

    #[test]
    fn fence_stripping_handles_surrounding_whitespace() {
        let report = parse_report(&format!("\n\n  ```json\n{PAYLOAD}\n```  \n"))
            .expect("whitespace-wrapped fence parses");
        assert_eq!(report.platform, "TikTok");
    }
}
