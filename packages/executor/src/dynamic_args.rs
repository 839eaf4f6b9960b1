// ABOUTME: Extraction of on-chain call arguments from the output of a dynamic job
// ABOUTME: Tries a JSON array, then `Response:` markers, then significant numbers, then a condition flag

use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, warn};

static RESPONSE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"Response:\s*([\d.]+)").expect("response pattern is a valid regex")
});

static NUMBER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"[\d.]+").expect("number pattern is a valid regex"));

/// Numbers at or below this are treated as noise (counters, timestamps fragments)
const SIGNIFICANT_NUMBER: f64 = 100.0;

const CONDITION_SATISFIED: &str = "Condition satisfied: true";

pub fn parse_dynamic_args(output: &str) -> Vec<Value> {
    if let Some(args) = parse_json_array(output) {
        debug!("Parsed dynamic arguments as JSON: {:?}", args);
        return args;
    }

    let responses: Vec<Value> = RESPONSE_RE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| number_or_string(m.as_str()))
        .collect();
    if !responses.is_empty() {
        debug!("Found {} response values", responses.len());
        return responses;
    }

    let significant: Vec<Value> = NUMBER_RE
        .find_iter(output)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .filter(|value| *value > SIGNIFICANT_NUMBER)
        .filter_map(|value| serde_json::Number::from_f64(value).map(Value::Number))
        .collect();
    if !significant.is_empty() {
        return significant;
    }

    if output.contains(CONDITION_SATISFIED) {
        return vec![Value::Bool(true)];
    }

    warn!("Failed to extract any arguments from output: {}", output);
    vec![Value::String("0".to_string())]
}

fn parse_json_array(output: &str) -> Option<Vec<Value>> {
    let whole = std::iter::once(output.trim());
    whole.chain(output.lines().map(str::trim)).find_map(|candidate| {
        if !candidate.starts_with('[') {
            return None;
        }
        match serde_json::from_str::<Vec<Value>>(candidate) {
            Ok(args) if !args.is_empty() => Some(args),
            _ => None,
        }
    })
}

fn number_or_string(raw: &str) -> Value {
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}
