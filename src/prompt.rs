//! Prompt rendering for the three stages.
//!
//! Each renderer returns the ordered message list for one request. Templates
//! are plain `format!` strings; literal JSON braces in them are doubled.

use crate::models::{CaseRecord, ChatMessage, Rule, ScenarioType};

const EXTRACT_SYSTEM: &str = r#"# Role
You are a clinical data structuring specialist. Turn guideline text into machine-readable decision logic.

# Task
Extract every diagnosis and treatment decision from the fragment below.

# Rules
1. Atomic logic: one JSON object per branch. If the text prescribes different actions for different grades, symptoms or thresholds, emit one object for each.
2. `condition` carries every trigger: population, comorbidities, history, and numeric thresholds (e.g. "CAT > 20", "EOS >= 300"). Never leave "if ..." logic inside `action`.
3. `action` is the instruction only: drug, dose, timing, course, test or procedure. Number steps only when they must run in sequence.
4. `evidence` is a verbatim excerpt of the source. Never abbreviate it with "..." or "etc.".
5. Cover general, antiviral, severe-case and traditional-medicine regimens alike.

# Output
A JSON list and nothing else:
```json
[
  {
    "condition": "the concrete premise",
    "action": "the prescribed response",
    "contraindication": "explicit contraindication, or null",
    "evidence": "verbatim source excerpt"
  }
]
```"#;

const CASES_SYSTEM: &str = "You are a rigorous medical data generation assistant.";

const REASONING_SYSTEM: &str = "You are a rigorous clinical expert.";

/// Messages asking the model to extract rules from one chunk.
///
/// `part` is 1-based; a "part i/N" note is added only for multi-chunk documents.
pub fn extraction_messages(title: &str, chunk: &str, part: usize, total: usize) -> Vec<ChatMessage> {
    let context_note = if total > 1 {
        format!(
            "\n(Note: the document is long; this is part {}/{}. Extract every decision in this part without worrying whether the surrounding context is complete.)",
            part, total
        )
    } else {
        String::new()
    };

    let user = format!(
        "[Document context]\nThe full title of this document is \"{title}\". Resolve references such as \"this group\" or \"such patients\" against it.\n\n[Fragment]\n{chunk}\n{context_note}\n"
    );

    vec![ChatMessage::system(EXTRACT_SYSTEM), ChatMessage::user(user)]
}

/// Messages asking the model to turn one rule into a patient case.
pub fn case_messages(topic: &str, rule: &Rule) -> Vec<ChatMessage> {
    let routing = ScenarioType::ALL
        .iter()
        .map(|s| format!("- Scenario {}: {}", s.letter(), s.label()))
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!(
        r#"You build realistic clinical scenarios for the guideline "{topic}".
Turn the guideline rule below into one concrete, detailed clinical moment.

Input:
* Trigger (condition): {condition}
* Guide (action): {action}

Step 1: route the rule to the closest scenario type:
{routing}

Step 2: write the case `input`.
1. Implicit input: show the situation, do not have the patient ask for the answer.
2. Realistic noise: add one irrelevant detail (occupation, weather, a minor complaint).
3. Strict compliance: every value must fall inside the condition's range.
4. No leaking: the input must not contain the action's advice.

Output (JSON):
{{
    "scenario_type": "Scenario A/B/C/D/E/F",
    "patient_demographics": "short summary, e.g. 65-year-old man, community follow-up",
    "input": "the full case description"
}}
"#,
        condition = rule.condition,
        action = rule.action,
    );

    vec![ChatMessage::system(CASES_SYSTEM), ChatMessage::user(user)]
}

/// Messages asking the model to reason about one case.
///
/// Returns the messages plus whether the case's scenario label was unknown
/// (it is then treated as general diagnosis).
pub fn reasoning_messages(case: &CaseRecord) -> (Vec<ChatMessage>, bool) {
    let (scenario, unknown) = ScenarioType::canonicalize(Some(&case.scenario_type));
    let rule = serde_json::to_string_pretty(&case.reference_rule).unwrap_or_default();

    let user = format!(
        r#"You are a senior clinician. Using the patient case, scenario type and reference guideline, reason through the case as you would in practice and give professional advice.

Input:
* Context (scenario type): {context}
* Patient case:
{case_input}
* Guideline rule:
{rule}

Adapt your reasoning to the scenario: check physical preconditions for procedures, surface hidden habits for lifestyle cases, compare status against targets for referrals, scan interactions and contraindications for comorbidities, build a differential for general diagnosis, and check compliance for administrative cases.

Output (JSON):
{{
  "thought": "scenario definition, clinical decoding, rule alignment and safety check, decision",
  "medical_order": "the written order for colleagues, in clinical register",
  "patient_dialogue": "what the doctor says to the patient, plain and reassuring"
}}
"#,
        context = scenario.label(),
        case_input = case.case_input,
    );

    (
        vec![ChatMessage::system(REASONING_SYSTEM), ChatMessage::user(user)],
        unknown,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> Rule {
        Rule {
            condition: "SBP >= 180 mmHg".into(),
            action: "start two-drug therapy".into(),
            contraindication: None,
            evidence: "verbatim".into(),
        }
    }

    #[test]
    fn test_extraction_single_part_has_no_note() {
        let msgs = extraction_messages("Hypertension 2024", "body", 1, 1);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert!(msgs[1].content.contains("\"Hypertension 2024\""));
        assert!(!msgs[1].content.contains("part 1/1"));
    }

    #[test]
    fn test_extraction_multi_part_note() {
        let msgs = extraction_messages("T", "body", 2, 3);
        assert!(msgs[1].content.contains("part 2/3"));
    }

    #[test]
    fn test_case_prompt_interpolates_rule() {
        let msgs = case_messages("Hypertension", &rule());
        let user = &msgs[1].content;
        assert!(user.contains("SBP >= 180 mmHg"));
        assert!(user.contains("start two-drug therapy"));
        assert!(user.contains("Scenario F: Administrative and ethics"));
        assert!(user.contains("\"scenario_type\""));
    }

    #[test]
    fn test_reasoning_prompt_flags_unknown_label() {
        let mut case = CaseRecord {
            id: 0,
            file_name: "g.json".into(),
            scenario_type: "场景D".into(),
            patient_demographics: None,
            case_input: "70-year-old with CKD".into(),
            reference_rule: rule(),
        };
        let (msgs, unknown) = reasoning_messages(&case);
        assert!(!unknown);
        assert!(msgs[1].content.contains("Comorbidity management"));
        assert!(msgs[1].content.contains("70-year-old with CKD"));

        case.scenario_type = "Unknown".into();
        let (msgs, unknown) = reasoning_messages(&case);
        assert!(unknown);
        assert!(msgs[1].content.contains("General diagnosis and treatment"));
    }
}
