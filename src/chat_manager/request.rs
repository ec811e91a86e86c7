use serde_json::{json, Value};

use crate::settings::BackendSettings;

pub fn chat_completions_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        format!("{}/chat/completions", trimmed)
    } else {
        format!("{}/v1/chat/completions", trimmed)
    }
}

pub fn build_chat_body(settings: &BackendSettings, prompt: &str) -> Value {
    json!({
        "model": settings.model,
        "stream": false,
        "temperature": settings.temperature,
        "messages": [
            { "role": "user", "content": prompt }
        ]
    })
}

/// Assistant text from `choices[0].message.content`. The content may be a
/// plain string or an array of `{ "type": "text", "text": .. }` parts.
/// `None` when the payload carries no non-blank text.
pub fn extract_text(data: &Value) -> Option<String> {
    let content = data
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?;

    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => return None,
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

pub fn extract_error_message(data: &Value) -> Option<String> {
    match data {
        Value::Object(map) => {
            if let Some(err) = map.get("error") {
                if let Some(Value::String(message)) = err.get("message") {
                    let trimmed = message.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
                if let Value::String(message) = err {
                    let trimmed = message.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
            }
            if let Some(Value::String(message)) = map.get("message") {
                let trimmed = message.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
            None
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}
