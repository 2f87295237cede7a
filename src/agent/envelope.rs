use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{FlotillaError, Result};

/// The JSON envelope printed by `claude --print --output-format json`.
///
/// The canonical schema carries `total_cost_usd` and `usage`; older CLI
/// builds reported `cost_usd` and top-level token counts. Both are
/// accepted, with the canonical fields taking precedence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentEnvelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub session_id: Option<String>,

    // Legacy planner-era fields.
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl AgentEnvelope {
    /// Best-effort parse; a non-JSON stdout yields an empty envelope whose
    /// `result` is the raw text.
    pub fn parse(stdout: &str) -> Self {
        match serde_json::from_str::<Self>(stdout) {
            Ok(envelope) => envelope,
            Err(_) => Self {
                result: stdout.to_string(),
                ..Self::default()
            },
        }
    }

    pub fn cost_usd(&self) -> f64 {
        self.total_cost_usd.or(self.cost_usd).unwrap_or(0.0)
    }

    pub fn tokens_used(&self) -> u64 {
        if let Some(usage) = &self.usage {
            return usage.input_tokens + usage.output_tokens;
        }
        self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
    }
}

/// Structured output contract for the planner role.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannerOutput {
    pub tasks: Vec<PlannerTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannerTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohesion_group: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub file_locks: Vec<String>,
}

/// Structured output contract for the validator role.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ValidatorOutput {
    pub status: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<String>>,
}

pub fn parse_planner_output(stdout: &str) -> Result<PlannerOutput> {
    let extracted = extract_result_json(stdout);
    let output: PlannerOutput = serde_json::from_str(&extracted)
        .map_err(|e| FlotillaError::Envelope(format!("planner output: {}", e)))?;
    if output.tasks.is_empty() {
        return Err(FlotillaError::EmptyPlan);
    }
    Ok(output)
}

pub fn parse_validator_output(stdout: &str) -> Result<ValidatorOutput> {
    let extracted = extract_result_json(stdout);
    let output: ValidatorOutput = serde_json::from_str(&extracted)
        .map_err(|e| FlotillaError::Envelope(format!("validator output: {}", e)))?;
    if output.status != "pass" && output.status != "fail" {
        return Err(FlotillaError::Envelope(format!(
            "invalid validator status {:?} (must be \"pass\" or \"fail\")",
            output.status
        )));
    }
    Ok(output)
}

/// Extract the innermost JSON document from agent stdout.
///
/// The `result` field of the envelope may be (a) a JSON document, (b) a
/// JSON document in a fenced code block, or (c) prose containing either an
/// embedded fenced block or a raw object. Tried in order: direct parse,
/// fence strip, embedded fence search, first balanced `{...}` scan. The
/// heuristic is deterministic.
pub fn extract_result_json(stdout: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<AgentEnvelope>(stdout) {
        if !envelope.result.is_empty() {
            return extract_inner_json(&envelope.result);
        }
    }
    extract_inner_json(stdout)
}

fn extract_inner_json(text: &str) -> String {
    let stripped = strip_code_fence(text);
    if is_valid_json(&stripped) {
        return stripped;
    }

    if let Some(found) = extract_embedded_fence(text) {
        return found;
    }

    if let Some(found) = extract_first_object(text) {
        return found;
    }

    stripped
}

fn is_valid_json(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text).is_ok()
}

/// Strip a leading/trailing triple-backtick fence (e.g. ```json ... ```).
fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let body = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    };
    let body = match body.rfind("```") {
        Some(idx) => &body[..idx],
        None => body,
    };
    body.trim().to_string()
}

/// Find a ```json ... ``` block embedded in surrounding prose.
fn extract_embedded_fence(text: &str) -> Option<String> {
    for marker in ["```json\n", "```json\r\n", "```\n", "```\r\n"] {
        let Some(start) = text.find(marker) else {
            continue;
        };
        let inner = &text[start + marker.len()..];
        let Some(end) = inner.find("```") else {
            continue;
        };
        let candidate = inner[..end].trim();
        if is_valid_json(candidate) {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Scan for the first balanced `{...}` that parses as JSON, respecting
/// string literals and escapes.
fn extract_first_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    for start in 0..bytes.len() {
        if bytes[start] != b'{' {
            continue;
        }
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &ch) in bytes[start..].iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=start + offset];
                        if is_valid_json(candidate) {
                            return Some(candidate.to_string());
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}
