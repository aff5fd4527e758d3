//! Decoding model text into role payloads.
//!
//! Model replies are reduced to their outermost JSON object (dropping markdown
//! fences and surrounding prose) and then decoded into a role's raw reply
//! shape. Anything that still fails is reported as [`Decoded::Unparseable`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use navi_core::errors::AgentError;

#[derive(Debug)]
pub enum Decoded<T> {
    Parsed(T),
    Unparseable { reason: String, raw: String },
}

impl<T> Decoded<T> {
    pub fn into_result(self) -> Result<T, AgentError> {
        match self {
            Self::Parsed(value) => Ok(value),
            Self::Unparseable { reason, .. } => Err(AgentError::Unparseable(reason)),
        }
    }
}

/// Slice from the first `{` to its matching `}`, skipping string contents.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Decoded<T> {
    let Some(object) = extract_json_object(text) else {
        return Decoded::Unparseable {
            reason: "no JSON object in reply".into(),
            raw: truncate(text),
        };
    };
    match serde_json::from_str::<T>(object) {
        Ok(value) => Decoded::Parsed(value),
        Err(e) => Decoded::Unparseable {
            reason: e.to_string(),
            raw: truncate(object),
        },
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Accepts `3`, `3.5`, `"3"` or `"about 3 feet"`; anything else becomes `None`.
pub fn loose_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_in))
}

fn number_in(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .find(|part| !part.is_empty())
            .and_then(|part| part.parse().ok()),
        _ => None,
    }
}

/// Accepts a bool or the strings "true"/"false".
pub fn loose_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        direction: String,
        #[serde(default, deserialize_with = "loose_f64")]
        distance_feet: Option<f64>,
    }

    #[test]
    fn strips_markdown_fences() {
        let text = "```json\n{\"direction\": \"left\", \"distance_feet\": 4}\n```";
        let sample = decode::<Sample>(text).into_result().unwrap();
        assert_eq!(sample.direction, "left");
        assert_eq!(sample.distance_feet, Some(4.0));
    }

    #[test]
    fn ignores_surrounding_prose_and_braces_in_strings() {
        let text = r#"Sure! {"direction": "a {weird} one", "distance_feet": "about 12 feet"} Hope that helps {"#;
        let sample = decode::<Sample>(text).into_result().unwrap();
        assert_eq!(sample.direction, "a {weird} one");
        assert_eq!(sample.distance_feet, Some(12.0));
    }

    #[test]
    fn unparseable_fails_closed() {
        assert!(matches!(
            decode::<Sample>("I cannot see anything"),
            Decoded::Unparseable { .. }
        ));
        let err = decode::<Sample>("{\"distance_feet\": 3}").into_result().unwrap_err();
        assert!(matches!(err, AgentError::Unparseable(_)));
        assert!(extract_json_object("{\"open\": ").is_none());
    }

    #[test]
    fn loose_numbers() {
        assert_eq!(number_in(&serde_json::json!(2.5)), Some(2.5));
        assert_eq!(number_in(&serde_json::json!("~8ft")), Some(8.0));
        assert_eq!(number_in(&serde_json::json!("far")), None);
        assert_eq!(number_in(&Value::Null), None);
    }
}
