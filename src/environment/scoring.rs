//! Turns a participant's final summary into an answer and grades it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::environment::{tasks::Task, Evaluation, Trace};

static RE_JSON_ARRAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(?:[^\[\]]*|\[[^\[\]]*\])*\]").unwrap());
static RE_FINISH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)FINISH\s*\((.*?)\)").unwrap());
static RE_ANSWER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?i)(?:answer|result|mrn|value)(?:\s+is)?:?\s*["']?([A-Z0-9][A-Z0-9\-]+)"#,
        r"(?i)\b(S[0-9]{7})\b",
        r"\b([0-9]+(?:\.[0-9]+)?)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

const NUMERIC_TOLERANCE: f64 = 1e-6;

/// Pulls an answer list out of free text, trying progressively looser forms.
pub fn extract_answer(text: &str) -> Option<Vec<Value>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for candidate in RE_JSON_ARRAY.find_iter(text) {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(candidate.as_str()) {
            return Some(items);
        }
    }

    if let Some(inner) = RE_FINISH.captures(text).and_then(|caps| caps.get(1)) {
        if let Ok(parsed) = serde_json::from_str::<Value>(inner.as_str().trim()) {
            return Some(into_list(parsed));
        }
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(text) {
        return Some(into_list(parsed));
    }

    RE_ANSWER_PATTERNS.iter().find_map(|pattern| {
        pattern.captures(text).and_then(|caps| caps.get(1)).map(|found| {
            let answer = found
                .as_str()
                .trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
            vec![Value::String(answer.to_string())]
        })
    })
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

pub fn answers_match(expected: &[Value], actual: &[Value]) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(want, got)| values_match(want, got))
}

fn values_match(want: &Value, got: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(want), as_number(got)) {
        return (a - b).abs() <= NUMERIC_TOLERANCE;
    }
    match (want, got) {
        (Value::Array(a), Value::Array(b)) => answers_match(a, b),
        _ => normalize(want) == normalize(got),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn normalize(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

/// Grades one episode against its task.
pub fn evaluate(task: &Task, trace: &Trace) -> Evaluation {
    let Some(summary) = trace.final_summary() else {
        return failed(None, "no_final_answer", "Ran out of steps without a final answer");
    };

    let Some(answer) = extract_answer(summary) else {
        return failed(None, "failed_to_extract_answer", summary);
    };
    let extracted = Some(Value::Array(answer.clone()));

    let Some(expected) = &task.expected_answer else {
        return failed(extracted, "no_reference_answer", summary);
    };

    if let Some(missing) = task
        .required_capabilities
        .iter()
        .find(|capability| !trace.invoked_successfully(capability))
    {
        return failed(
            extracted,
            &format!("required_capability_not_used: {missing}"),
            summary,
        );
    }

    let correct = answers_match(expected, &answer);
    Evaluation {
        correct,
        extracted_answer: extracted,
        error: None,
        score: if correct { 1.0 } else { 0.0 },
        summary: summary.to_string(),
    }
}

fn failed(extracted_answer: Option<Value>, error: &str, summary: &str) -> Evaluation {
    Evaluation {
        correct: false,
        extracted_answer,
        error: Some(error.to_string()),
        score: 0.0,
        summary: summary.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::environment::Invocation;

    #[test]
    fn extracts_embedded_json_array() {
        let answer = extract_answer(r#"The patient's MRN is ["S6534835"] based on the search."#);
        assert_eq!(answer, Some(vec![json!("S6534835")]));
    }

    #[test]
    fn extracts_finish_form() {
        assert_eq!(extract_answer("FINISH(42)"), Some(vec![json!(42)]));
        assert_eq!(extract_answer("finish(\"done\")"), Some(vec![json!("done")]));
    }

    #[test]
    fn extracts_plain_json_scalar() {
        assert_eq!(extract_answer("  2.5 "), Some(vec![json!(2.5)]));
    }

    #[test]
    fn extracts_labelled_tokens() {
        assert_eq!(
            extract_answer("The answer is S1023381."),
            Some(vec![json!("S1023381")])
        );
        assert_eq!(
            extract_answer("Patient identifier s2874099 confirmed"),
            Some(vec![json!("s2874099")])
        );
        assert_eq!(extract_answer("She is 60 years old"), Some(vec![json!("60")]));
        assert_eq!(extract_answer("no idea"), None);
    }

    #[test]
    fn compares_numbers_and_strings_leniently() {
        assert!(answers_match(&[json!(60)], &[json!("60.0")]));
        assert!(answers_match(&[json!("S6534835")], &[json!(" s6534835 ")]));
        assert!(!answers_match(&[json!(1), json!(2)], &[json!(1)]));
        assert!(!answers_match(&[json!(1.5)], &[json!(1.6)]));
    }

    #[test]
    fn grades_correct_answer() {
        let task = Task::new("task1", "find MRN").with_expected_answer(vec![json!("S6534835")]);
        let mut trace = Trace::new();
        trace.record_finish("[\"S6534835\"]");

        let evaluation = evaluate(&task, &trace);
        assert!(evaluation.correct);
        assert_eq!(evaluation.score, 1.0);
        assert_eq!(evaluation.error, None);
    }

    #[test]
    fn requires_named_capabilities() {
        let task = Task::new("task5", "order magnesium")
            .with_expected_answer(vec![json!("ordered")])
            .requiring("post_fhir_resource");
        let mut trace = Trace::new();
        trace.record_finish("[\"ordered\"]");

        let evaluation = evaluate(&task, &trace);
        assert!(!evaluation.correct);
        assert_eq!(
            evaluation.error.as_deref(),
            Some("required_capability_not_used: post_fhir_resource")
        );

        let mut trace = Trace::new();
        trace.record_invocation(
            Invocation::new("post_fhir_resource", json!({})),
            &Ok("created".to_string()),
        );
        trace.record_finish("[\"ordered\"]");
        assert!(evaluate(&task, &trace).correct);
    }

    #[test]
    fn forced_termination_has_no_answer() {
        let task = Task::new("task1", "find MRN").with_expected_answer(vec![json!("S1")]);
        let evaluation = evaluate(&task, &Trace::new());
        assert!(!evaluation.correct);
        assert_eq!(evaluation.error.as_deref(), Some("no_final_answer"));
        assert_eq!(evaluation.extracted_answer, None);
    }
}
