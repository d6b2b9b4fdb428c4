//! OpenAI-compatible shaping of upstream output

use serde_json::{json, Map, Value};

/// Maximum upstream error text echoed back to the client
const PROXY_TEXT_LIMIT: usize = 200;

/// Format one upstream line as an SSE event.
///
/// Blank input yields nothing. Lines already in `data:` form pass through,
/// JSON objects and arrays are re-emitted compactly, and anything else is
/// wrapped as a synthetic delta.
pub fn format_streaming_line(line: &str) -> Option<String> {
    if line.trim().is_empty() {
        return None;
    }

    if line.starts_with("data:") {
        let mut event = line.trim_end_matches(['\r', '\n']).to_string();
        event.push_str("\n\n");
        return Some(event);
    }

    if let Ok(value @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str::<Value>(line) {
        return Some(format!("data: {}\n\n", value));
    }

    Some(text_delta(line))
}

/// Synthetic streaming delta carrying `text`
pub fn text_delta(text: &str) -> String {
    let event = json!({"choices": [{"delta": {"content": text}}]});
    format!("data: {}\n\n", event)
}

/// Inline error event sent when the upstream stream breaks
pub fn error_event(message: &str) -> String {
    let event = json!({"error": {"message": format!("Streaming error: {}", message)}});
    format!("data: {}\n\n", event)
}

pub const DONE_EVENT: &str = "data: [DONE]\n\n";

fn first_text(map: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match map.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Null | Value::Bool(false) => None,
        Value::String(_) => None,
        other => Some(other.to_string()),
    })
}

/// Guarantee a `choices[0].message.content` path.
///
/// Responses that already carry `choices` are returned untouched; otherwise
/// content is taken from `response`, `text` or `content`, falling back to the
/// serialised body.
pub fn normalize_completion(data: Value) -> Value {
    let mut map = match data {
        Value::Object(map) => map,
        other => {
            let content = match &other {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            return json!({"choices": [synthetic_choice(content)]});
        }
    };

    if map.get("choices").is_some_and(|c| !c.is_null()) {
        return Value::Object(map);
    }

    let content = first_text(&map, &["response", "text", "content"])
        .unwrap_or_else(|| Value::Object(map.clone()).to_string());
    map.insert("choices".to_string(), json!([synthetic_choice(content)]));
    Value::Object(map)
}

fn synthetic_choice(content: String) -> Value {
    json!({
        "index": 0,
        "message": {"role": "assistant", "content": content},
        "finish_reason": "stop"
    })
}

/// Body returned when the upstream fails with a non-JSON payload
pub fn proxy_error_body(status: u16, reason: &str, text: &str) -> Value {
    let snippet: String = text.chars().take(PROXY_TEXT_LIMIT).collect();
    let message = format!("Proxy error: {} {}", status, reason).trim_end().to_string();
    json!({
        "error": {
            "message": message,
            "type": "proxy_error",
            "proxy_status": status,
            "proxy_text": snippet
        }
    })
}
