//! Diagram kinds, prompt builders, and output parsing.
//!
//! The prompts and the diagram-spec schema are opaque to the concurrency
//! core; this module is the single place that knows them. Parsing is
//! defensive: model output arrives as clean JSON, fenced JSON, or JSON
//! buried in prose, and the parser falls back through those tiers rather
//! than failing on the first.

use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Leading list markers on a node line ("- ", "* ", "3. ", "7) ").
static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s*").expect("list marker regex"));

/// The diagram kinds the service renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagramKind {
    BubbleMap,
    DoubleBubbleMap,
    CircleMap,
    TreeMap,
    BraceMap,
    Mindmap,
}

impl DiagramKind {
    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BubbleMap => "bubble_map",
            Self::DoubleBubbleMap => "double_bubble_map",
            Self::CircleMap => "circle_map",
            Self::TreeMap => "tree_map",
            Self::BraceMap => "brace_map",
            Self::Mindmap => "mindmap",
        }
    }

    /// The palette stage sequence for this kind. Flat kinds have a
    /// single stage; hierarchical kinds progress through stages whose
    /// output feeds the next.
    pub fn stage_sequence(&self) -> &'static [&'static str] {
        match self {
            Self::Mindmap => &["dimensions", "categories", "children"],
            Self::TreeMap => &["categories", "children"],
            Self::BraceMap => &["parts", "subparts"],
            _ => &["nodes"],
        }
    }

    /// Guess the kind from a free-form prompt when the client did not
    /// pick one.
    pub fn infer(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();
        if lower.contains("compare") || lower.contains(" vs ") || lower.contains("difference") {
            Self::DoubleBubbleMap
        } else if lower.contains("parts of") || lower.contains("components of") {
            Self::BraceMap
        } else if lower.contains("classify") || lower.contains("categories") {
            Self::TreeMap
        } else {
            Self::BubbleMap
        }
    }
}

/// A parsed diagram specification ready to return to the client.
#[derive(Debug, Clone, Serialize)]
pub struct DiagramSpec {
    /// Diagram kind wire name.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Renderer-ready specification.
    pub spec: Value,
}

// ============================================================================
// Prompt builders (opaque pure functions)
// ============================================================================

/// System + user prompt for a one-shot diagram generation.
pub fn diagram_prompt(kind: DiagramKind, prompt: &str, language: &str) -> (String, String) {
    let system = format!(
        "You are a diagram assistant. Produce a {} specification as a single \
         JSON object with no surrounding prose. Respond in language: {}.",
        kind.as_str(),
        language
    );
    (system, prompt.to_string())
}

/// User prompt for one palette fan-out call. `already_suggested` is
/// included verbatim so duplicates are discouraged at the source.
pub fn palette_prompt(
    topic: &str,
    kind: DiagramKind,
    stage: &str,
    stage_data: Option<&str>,
    already_suggested: &[String],
    count: usize,
) -> String {
    let mut prompt = format!(
        "Brainstorm {count} fresh {stage} for a {} about \"{topic}\". \
         Answer with one item per line, no numbering, no commentary.",
        kind.as_str()
    );
    if let Some(data) = stage_data {
        prompt.push_str(&format!(" Focus on: {data}."));
    }
    if !already_suggested.is_empty() {
        prompt.push_str("\nDo not repeat any of these existing items:\n");
        for item in already_suggested {
            prompt.push_str(item);
            prompt.push('\n');
        }
    }
    prompt
}

// ============================================================================
// Output parsing
// ============================================================================

/// Parse model output into a structured diagram spec with a 3-tier
/// fallback strategy:
///
/// 1. Try a direct JSON parse
/// 2. Clean known artifacts (code fences, sentinel tokens) and retry
/// 3. Extract the outermost JSON object from mixed content
///
/// Fails with [`AppError::UpstreamError`] if no valid JSON object is
/// found.
pub fn parse_diagram_output(provider: &str, raw: &str) -> AppResult<Value> {
    log_debug!(
        content_length = raw.len(),
        "Parsing model output for diagram spec"
    );

    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return validate_spec(provider, value);
    }

    let cleaned = clean_artifacts(raw);
    if cleaned != raw {
        if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
            return validate_spec(provider, value);
        }
    }

    if let Some(extracted) = extract_json_object(&cleaned) {
        if let Ok(value) = serde_json::from_str::<Value>(&extracted) {
            return validate_spec(provider, value);
        }
    }

    let preview: String = raw.chars().take(200).collect();
    log_warn!(
        provider = provider,
        content_preview = %preview,
        "No parseable diagram spec in model output"
    );
    Err(AppError::upstream_error(
        provider,
        format!("could not parse diagram spec from: {preview}"),
        false,
        None,
    ))
}

fn validate_spec(provider: &str, value: Value) -> AppResult<Value> {
    match value.as_object() {
        Some(obj) if !obj.is_empty() => Ok(value),
        _ => Err(AppError::upstream_error(
            provider,
            "diagram spec must be a non-empty JSON object",
            false,
            None,
        )),
    }
}

/// Strip code fences and sentinel tokens models wrap around JSON.
fn clean_artifacts(content: &str) -> String {
    content
        .replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
        .replace("<|end|>", "")
        .replace("<|start|>", "")
        .trim()
        .to_string()
}

/// Extract the first balanced `{ ... }` from mixed content. Braces
/// inside string values and prose after the object do not move the
/// boundaries.
fn extract_json_object(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let chars: Vec<char> = content[start..].chars().collect();
    let end = find_balanced_json_end(&chars)?;
    Some(chars[0..=end].iter().collect())
}

/// Find the index where balanced JSON ends, tracking string literals
/// and escapes so `{`/`}` inside values are not counted.
fn find_balanced_json_end(chars: &[char]) -> Option<usize> {
    let mut brace_count = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (char_idx, ch) in chars.iter().enumerate() {
        match ch {
            '"' if !escaped => in_string = !in_string,
            '\\' if in_string => escaped = !escaped,
            '{' if !in_string => brace_count += 1,
            '}' if !in_string => {
                brace_count -= 1;
                if brace_count == 0 {
                    return Some(char_idx);
                }
            }
            _ => escaped = false,
        }

        if *ch != '\\' {
            escaped = false;
        }
    }

    None // Unbalanced braces
}

/// Parse a full completion into node candidates.
///
/// Accepts a JSON array of strings, a JSON object with a `nodes` array,
/// or a plain list with one item per line.
pub fn parse_node_candidates(raw: &str) -> Vec<String> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw.trim()) {
        return items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .filter_map(|s| clean_node_line(&s))
            .collect();
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw.trim()) {
        if let Some(Value::Array(items)) = map.get("nodes") {
            return items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(clean_node_line)
                .collect();
        }
    }
    raw.lines().filter_map(clean_node_line).collect()
}

/// Clean one line into a node candidate: strip list markers and wrapping
/// quotes, reject empties, fences, and over-long lines.
pub fn clean_node_line(line: &str) -> Option<String> {
    let stripped = LIST_MARKER.replace(line, "");
    let trimmed = stripped
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == ',')
        .trim();
    if trimmed.is_empty() || trimmed.len() > 120 {
        return None;
    }
    if trimmed.contains('{') || trimmed.contains('}') || trimmed.starts_with("```") {
        return None;
    }
    Some(trimmed.to_string())
}
