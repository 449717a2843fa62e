//! Core data models used throughout the pipeline.
//!
//! Stage records ([`Rule`], [`CaseRecord`], [`ReasoningRecord`]) are what each
//! stage writes to disk and the next stage reads back. The wire types
//! ([`BatchRequest`], [`ResultLine`]) are the line formats exchanged with the
//! batch completion service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Stage {
    /// Guideline documents → atomic rules.
    Extract,
    /// Rules → synthetic patient cases.
    Cases,
    /// Cases → expert reasoning traces.
    Reasoning,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Cases => "cases",
            Stage::Reasoning => "reasoning",
        }
    }

    /// Whether a recovered payload has the top-level shape this stage merges:
    /// a rule list (or one rule) for extraction, one object otherwise.
    pub fn accepts_payload(&self, payload: &serde_json::Value) -> bool {
        match self {
            Stage::Extract => payload.is_array() || payload.is_object(),
            Stage::Cases | Stage::Reasoning => payload.is_object(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A heading-aligned slice of one source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Relative path of the originating document.
    pub document: String,
    pub index: usize,
    pub text: String,
}

/// One atomic condition → action decision unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub condition: String,
    pub action: String,
    #[serde(default)]
    pub contraindication: Option<String>,
    #[serde(default)]
    pub evidence: String,
}

/// A synthetic patient case grounded in one [`Rule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: u64,
    pub file_name: String,
    pub scenario_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_demographics: Option<String>,
    pub case_input: String,
    pub reference_rule: Rule,
}

/// A [`CaseRecord`] plus the model's reasoning about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRecord {
    #[serde(flatten)]
    pub case: CaseRecord,
    pub thought: Option<String>,
    pub medical_order: Option<String>,
    pub patient_dialogue: Option<String>,
}

/// Case-synthesis categories A–F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScenarioType {
    /// A: operating procedures and measurement.
    Procedure,
    /// B: lifestyle and risk intervention.
    Lifestyle,
    /// C: referral and follow-up.
    Referral,
    /// D: comorbidity management.
    Comorbidity,
    /// E: general diagnosis and treatment.
    General,
    /// F: administrative, reporting, and ethics.
    Administrative,
}

impl ScenarioType {
    pub const ALL: [ScenarioType; 6] = [
        ScenarioType::Procedure,
        ScenarioType::Lifestyle,
        ScenarioType::Referral,
        ScenarioType::Comorbidity,
        ScenarioType::General,
        ScenarioType::Administrative,
    ];

    pub fn letter(&self) -> char {
        match self {
            ScenarioType::Procedure => 'A',
            ScenarioType::Lifestyle => 'B',
            ScenarioType::Referral => 'C',
            ScenarioType::Comorbidity => 'D',
            ScenarioType::General => 'E',
            ScenarioType::Administrative => 'F',
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScenarioType::Procedure => "Operating procedures and measurement",
            ScenarioType::Lifestyle => "Lifestyle and risk intervention",
            ScenarioType::Referral => "Referral and follow-up",
            ScenarioType::Comorbidity => "Comorbidity management",
            ScenarioType::General => "General diagnosis and treatment",
            ScenarioType::Administrative => "Administrative and ethics",
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(ScenarioType::Procedure),
            'B' => Some(ScenarioType::Lifestyle),
            'C' => Some(ScenarioType::Referral),
            'D' => Some(ScenarioType::Comorbidity),
            'E' => Some(ScenarioType::General),
            'F' => Some(ScenarioType::Administrative),
            _ => None,
        }
    }

    /// Recognise a model-written label such as `场景A`, `场景 C`, `E`,
    /// `Scenario D` or `场景E:常规诊断与治疗`.
    ///
    /// Returns `None` for labels that are not recognised; callers fall back
    /// to [`ScenarioType::General`] via [`ScenarioType::canonicalize`].
    pub fn from_label(label: &str) -> Option<Self> {
        let trimmed = label.trim();
        let rest = ["场景", "Scenario", "scenario", "SCENARIO"]
            .iter()
            .find_map(|prefix| trimmed.strip_prefix(prefix))
            .unwrap_or(trimmed)
            .trim_start();

        let mut chars = rest.chars();
        let letter = chars.next()?;
        match chars.next() {
            None | Some(':' | '：' | '(' | '（' | ' ' | '-' | '/') => Self::from_letter(letter),
            _ => None,
        }
    }

    /// Map an optional label to a category. Missing and unknown labels both
    /// become `General`; the flag reports whether the label was unknown.
    pub fn canonicalize(label: Option<&str>) -> (Self, bool) {
        match label.map(str::trim).filter(|l| !l.is_empty()) {
            None => (ScenarioType::General, false),
            Some(l) => match Self::from_label(l) {
                Some(t) => (t, false),
                None => (ScenarioType::General, true),
            },
        }
    }
}

// ============ Wire formats ============

/// A role-tagged chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Body of a chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// One line of a batch manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatRequest,
}

/// One line of a batch result file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultLine {
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub response: Option<ResultResponse>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub body: Option<CompletionBody>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionBody {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: CompletionMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl ResultLine {
    /// A successful result carrying `content`, as written by the in-process runner.
    pub fn success(custom_id: &str, content: String) -> Self {
        Self {
            custom_id: Some(custom_id.to_string()),
            response: Some(ResultResponse {
                status_code: Some(200),
                body: Some(CompletionBody {
                    choices: vec![CompletionChoice {
                        message: CompletionMessage {
                            role: Some("assistant".to_string()),
                            content: Some(content),
                        },
                    }],
                }),
            }),
            error: None,
        }
    }

    /// The upstream error, if the service reported one.
    ///
    /// A non-null `error` field or a non-2xx `status_code` both count.
    pub fn upstream_error(&self) -> Option<String> {
        if let Some(err) = self.error.as_ref().filter(|e| !e.is_null()) {
            return Some(match err {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        match self.response.as_ref().and_then(|r| r.status_code) {
            Some(code) if !(200..300).contains(&code) => Some(format!("HTTP status {}", code)),
            _ => None,
        }
    }

    /// `response.body.choices[0].message.content`, if present.
    pub fn content(&self) -> Option<&str> {
        self.response
            .as_ref()?
            .body
            .as_ref()?
            .choices
            .first()?
            .message
            .content
            .as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_payload_shapes() {
        let list = serde_json::json!([{"condition": "c", "action": "a"}]);
        let object = serde_json::json!({"input": "x"});
        assert!(Stage::Extract.accepts_payload(&list));
        assert!(Stage::Extract.accepts_payload(&object));
        assert!(!Stage::Cases.accepts_payload(&list));
        assert!(Stage::Reasoning.accepts_payload(&object));
        assert!(!Stage::Extract.accepts_payload(&serde_json::json!("sorry")));
    }

    #[test]
    fn test_scenario_labels() {
        let cases = [
            ("场景A", ScenarioType::Procedure),
            ("A", ScenarioType::Procedure),
            ("场景B", ScenarioType::Lifestyle),
            ("场景 C", ScenarioType::Referral),
            ("D", ScenarioType::Comorbidity),
            ("场景E:常规诊断与治疗", ScenarioType::General),
            ("场景F", ScenarioType::Administrative),
            ("Scenario D", ScenarioType::Comorbidity),
            ("e", ScenarioType::General),
            ("场景B（生活方式）", ScenarioType::Lifestyle),
        ];
        for (label, expected) in cases {
            assert_eq!(ScenarioType::from_label(label), Some(expected), "{}", label);
        }
    }

    #[test]
    fn test_unknown_labels_default_to_general() {
        for label in ["Bogus", "场景G", "常规诊断与治疗", "AB"] {
            assert_eq!(ScenarioType::from_label(label), None, "{}", label);
            assert_eq!(
                ScenarioType::canonicalize(Some(label)),
                (ScenarioType::General, true)
            );
        }
    }

    #[test]
    fn test_missing_label_is_silent_general() {
        assert_eq!(
            ScenarioType::canonicalize(None),
            (ScenarioType::General, false)
        );
        assert_eq!(
            ScenarioType::canonicalize(Some("  ")),
            (ScenarioType::General, false)
        );
    }

    #[test]
    fn test_result_line_content() {
        let line: ResultLine = serde_json::from_str(
            r#"{"custom_id":"a.md|0","response":{"status_code":200,"body":{"choices":[{"message":{"content":"hi"}}]}},"error":null}"#,
        )
        .unwrap();
        assert_eq!(line.content(), Some("hi"));
        assert_eq!(line.upstream_error(), None);
    }

    #[test]
    fn test_result_line_errors() {
        let line: ResultLine =
            serde_json::from_str(r#"{"custom_id":"a.md|0","error":{"code":"timeout"}}"#).unwrap();
        assert_eq!(line.upstream_error().unwrap(), r#"{"code":"timeout"}"#);

        let line: ResultLine = serde_json::from_str(
            r#"{"custom_id":"a.md|0","response":{"status_code":500,"body":null}}"#,
        )
        .unwrap();
        assert_eq!(line.upstream_error().unwrap(), "HTTP status 500");
    }

    #[test]
    fn test_reasoning_record_flattens_case() {
        let record = ReasoningRecord {
            case: CaseRecord {
                id: 7,
                file_name: "guide.json".into(),
                scenario_type: "场景E".into(),
                patient_demographics: None,
                case_input: "fever".into(),
                reference_rule: Rule {
                    condition: "c".into(),
                    action: "a".into(),
                    contraindication: None,
                    evidence: "e".into(),
                },
            },
            thought: Some("t".into()),
            medical_order: None,
            patient_dialogue: Some("p".into()),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["case_input"], "fever");
        assert_eq!(value["thought"], "t");
        let back: ReasoningRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
