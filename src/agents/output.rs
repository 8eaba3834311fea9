//! Structured markers agents print into otherwise opaque output.
//!
//! ```text
//! @@ESCALATION {"what_i_tried": "...", "what_i_need": "...", "inputs": [{"key": "...", "label": "..."}]}
//! @@DONE {"summary": "..."}
//! @@VERDICT {"verdict": "approved" | "changes_requested", "notes": "..."}
//! @@COST {"usd": 0.42}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::runs::escalation::EscalationPayload;
use crate::runs::status::ReviewerVerdict;

pub const ESCALATION_MARKER: &str = "@@ESCALATION";
pub const DONE_MARKER: &str = "@@DONE";
pub const VERDICT_MARKER: &str = "@@VERDICT";
pub const COST_MARKER: &str = "@@COST";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub verdict: ReviewerVerdict,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputSignal {
    Escalation(EscalationPayload),
    Done(Option<Value>),
    Verdict(Verdict),
    Cost(f64),
}

#[derive(Deserialize)]
struct CostMarker {
    usd: f64,
}

/// Scans free text line by line for markers.
pub fn parse_markers(text: &str) -> Vec<OutputSignal> {
    text.lines().filter_map(parse_marker_line).collect()
}

fn parse_marker_line(line: &str) -> Option<OutputSignal> {
    let line = line.trim();
    if !line.starts_with("@@") {
        return None;
    }

    if let Some(rest) = line.strip_prefix(ESCALATION_MARKER) {
        return match serde_json::from_str::<EscalationPayload>(rest.trim()) {
            Ok(payload) if payload.validate().is_ok() => Some(OutputSignal::Escalation(payload)),
            Ok(_) => {
                warn!("Ignoring escalation marker with an incomplete payload");
                None
            }
            Err(e) => {
                warn!("Ignoring malformed escalation marker: {}", e);
                None
            }
        };
    }

    if let Some(rest) = line.strip_prefix(DONE_MARKER) {
        let rest = rest.trim();
        if rest.is_empty() {
            return Some(OutputSignal::Done(None));
        }
        return Some(OutputSignal::Done(serde_json::from_str(rest).ok()));
    }

    if let Some(rest) = line.strip_prefix(VERDICT_MARKER) {
        return match serde_json::from_str::<Verdict>(rest.trim()) {
            Ok(verdict) => Some(OutputSignal::Verdict(verdict)),
            Err(e) => {
                warn!("Ignoring malformed verdict marker: {}", e);
                None
            }
        };
    }

    if let Some(rest) = line.strip_prefix(COST_MARKER) {
        return match serde_json::from_str::<CostMarker>(rest.trim()) {
            Ok(cost) if cost.usd.is_finite() && cost.usd >= 0.0 => Some(OutputSignal::Cost(cost.usd)),
            _ => {
                debug!("Ignoring malformed cost marker");
                None
            }
        };
    }

    None
}

/// Parses one line of `claude --output-format stream-json`. Non-JSON lines
/// are treated as plain text.
pub fn parse_claude_stream_line(line: &str) -> Vec<OutputSignal> {
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        return parse_markers(line);
    };

    let mut signals = Vec::new();
    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let content = event
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for block in content {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        signals.extend(parse_markers(text));
                    }
                }
            }
        }
        Some("result") => {
            if let Some(result) = event.get("result").and_then(Value::as_str) {
                signals.extend(
                    parse_markers(result)
                        .into_iter()
                        .filter(|s| !matches!(s, OutputSignal::Cost(_))),
                );
            }
            if let Some(cost) = event.get("total_cost_usd").and_then(Value::as_f64) {
                signals.push(OutputSignal::Cost(cost));
            }
        }
        _ => {}
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_escalation_marker() {
        let line = r#"@@ESCALATION {"what_i_tried":"read the docs","what_i_need":"an API key","inputs":[{"key":"api_key","label":"API key"}]}"#;
        let signals = parse_markers(line);
        match &signals[..] {
            [OutputSignal::Escalation(payload)] => {
                assert_eq!(payload.what_i_need, "an API key");
                assert_eq!(payload.inputs[0].key, "api_key");
            }
            other => panic!("unexpected signals: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_markers_are_ignored() {
        assert!(parse_markers("@@ESCALATION {not json").is_empty());
        assert!(parse_markers("@@VERDICT maybe").is_empty());
        assert!(parse_markers("just some output mentioning @@DONE").is_empty());
    }

    #[test]
    fn test_done_and_verdict_markers() {
        let text = "working...\n@@DONE\n@@VERDICT {\"verdict\":\"changes_requested\",\"notes\":\"add tests\"}";
        let signals = parse_markers(text);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0], OutputSignal::Done(None));
        assert_eq!(
            signals[1],
            OutputSignal::Verdict(Verdict {
                verdict: ReviewerVerdict::ChangesRequested,
                notes: Some("add tests".to_string()),
            })
        );
    }

    #[test]
    fn test_claude_stream_events() {
        let assistant = json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "All set.\n@@DONE"}]}
        })
        .to_string();
        assert_eq!(
            parse_claude_stream_line(&assistant),
            vec![OutputSignal::Done(None)]
        );

        let result = json!({"type": "result", "result": "All set.", "total_cost_usd": 0.25}).to_string();
        assert_eq!(
            parse_claude_stream_line(&result),
            vec![OutputSignal::Cost(0.25)]
        );
    }
}
