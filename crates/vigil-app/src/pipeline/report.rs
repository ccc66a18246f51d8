//! Structured analysis report contract.
//!
//! These data types model the contract we expect from the inference stage.
//! They stay pure, provide JSON schema generation for prompting, and expose
//! validation so downstream code can refuse malformed payloads before the
//! result cache or the HTTP response ever sees them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Ordinal classification of policy-violation severity for one piece of
/// content.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One detected policy issue. The sequence order is the model's retrieval
/// order and is preserved end to end; nothing re-sorts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Issue {
    pub category: String,
    /// `MM:SS` position within the video, or `"Entire Video"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub snippet: String,
    pub rationale: String,
    #[serde(default)]
    pub policy_citations: Vec<String>,
}

/// Canonical risk report for one `(platform, content)` pair. Immutable once
/// cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisReport {
    pub platform: String,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_rationale: Option<String>,
    pub issues: Vec<Issue>,
}

impl AnalysisReport {
    /// Generate a JSON schema describing this payload, embedded into the
    /// inference prompt so the model answers in-contract.
    pub fn schema() -> JsonValue {
        let schema = schemars::schema_for!(AnalysisReport);
        serde_json::to_value(&schema).expect("schema is serializable")
    }

    /// Validate semantic constraints beyond plain JSON typing.
    pub fn validate(&self) -> Result<(), ReportValidationError> {
        let mut issues = Vec::new();

        if self.platform.trim().is_empty() {
            issues.push("platform must not be empty".to_string());
        }

        for (idx, issue) in self.issues.iter().enumerate() {
            if issue.category.trim().is_empty() {
                issues.push(format!("issues[{idx}].category must not be empty"));
            }
            if issue.snippet.trim().is_empty() {
                issues.push(format!("issues[{idx}].snippet must not be empty"));
            }
            if issue.rationale.trim().is_empty() {
                issues.push(format!("issues[{idx}].rationale must not be empty"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ReportValidationError { issues })
        }
    }
}

/// Validation failures aggregated into a single error.
#[derive(Debug, Error)]
#[error("analysis report validation failed: {issues:?}")]
pub struct ReportValidationError {
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_valid_report() -> AnalysisReport {
        AnalysisReport {
            platform: "TikTok".to_string(),
            risk_level: RiskLevel::High,
            summary_rationale: Some(
                "Weapons are visible and the audio references drug sales.".to_string(),
            ),
            issues: vec![Issue {
                category: "Dangerous Goods".to_string(),
                timestamp: Some("01:23".to_string()),
                snippet: "A handgun is shown on the table".to_string(),
                rationale: "Firearms may not be depicted in user content".to_string(),
                policy_citations: vec!["Community Guidelines / Weapons".to_string()],
            }],
        }
    }

    #[test]
    fn validates_happy_path() {
        assert!(make_valid_report().validate().is_ok());
    }

    #[test]
    fn detects_empty_required_fields() {
        let mut report = make_valid_report();
        report.platform.clear();
        report.issues[0].snippet = "   ".to_string();

        let error = report.validate().expect_err("validation must fail");
        assert!(error.issues.iter().any(|i| i.contains("platform")), "{:?}", error.issues);
        assert!(
            error.issues.iter().any(|i| i.contains("issues[0].snippet")),
            "{:?}",
            error.issues
        );
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn absent_summary_is_omitted_from_the_wire_form() {
        let report = AnalysisReport {
            platform: "TikTok".to_string(),
            risk_level: RiskLevel::Low,
            summary_rationale: None,
            issues: Vec::new(),
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            json!({ "platform": "TikTok", "risk_level": "Low", "issues": [] })
        );
    }

    #[test]
    fn schema_generation_succeeds() {
        let schema = AnalysisReport::schema();
        assert!(schema.is_object());
    }
}
