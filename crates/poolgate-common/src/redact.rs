use serde_json::Value as JsonValue;

const SENSITIVE_KEYS: &[&str] = &["apikey", "api_key", "authorization", "token", "password", "key"];
const REDACTED: &str = "[redacted]";

/// Case-insensitive check used before any header or body field reaches a log line.
pub fn is_sensitive_key(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| lower.contains(needle))
}

pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            if is_sensitive_key(name) {
                (name.clone(), REDACTED.to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Recursively redact sensitive fields in a JSON body before logging.
pub fn redact_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), JsonValue::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact_json(item));
                }
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_with_auth_material_are_masked() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer sk-abc".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
            ("x-api-key".to_string(), "secret".to_string()),
        ];
        let redacted = redact_headers(&headers);
        assert_eq!(redacted[0].1, REDACTED);
        assert_eq!(redacted[1].1, "application/json");
        assert_eq!(redacted[2].1, REDACTED);
    }

    #[test]
    fn nested_json_fields_are_masked() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "config": { "apiKey": "sk-123", "timeout": 5 }
        });
        let redacted = redact_json(&body);
        assert_eq!(redacted["config"]["apiKey"], REDACTED);
        assert_eq!(redacted["config"]["timeout"], 5);
        assert_eq!(redacted["model"], "gpt-4o");
    }
}
