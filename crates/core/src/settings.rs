//! Directive grammar and the normalized settings map.
//!
//! A transform request carries its directives in one of two shapes:
//!
//! - **Inline**: the first query key is a JSON object, e.g. `?{"w":200,"f":"webp"}`
//! - **Tokens**: a path segment of `key_value` / `key:value` tokens separated
//!   by `,` or `;`, e.g. `w_200,h_100;g:north`
//!
//! Both shapes normalize into [`Settings`], an ordered map whose iteration
//! order is the sorted key order. That ordering is what makes cache keys
//! independent of how the client happened to order its directives.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Raw directives as they arrived on the request.
#[derive(Clone, Debug, PartialEq)]
pub enum Directives {
    /// Settings supplied as a JSON object in the first query key.
    Inline(serde_json::Map<String, Value>),
    /// Settings supplied as a compact token list in a path segment.
    Tokens(String),
}

impl Directives {
    /// Interpret a query-string key as inline JSON settings.
    ///
    /// Returns `None` when the key is not a JSON object, so callers can fall
    /// back to path tokens or treat the query as an ordinary query string.
    pub fn inline_from_query_key(key: &str) -> Option<Self> {
        let trimmed = key.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Some(Self::Inline(map)),
            _ => None,
        }
    }

    /// Parse into a normalized settings map.
    pub fn parse(&self) -> Result<Settings> {
        let settings = match self {
            Self::Inline(map) => parse_inline(map)?,
            Self::Tokens(raw) => parse_tokens(raw),
        };

        if settings.is_empty() {
            return Err(Error::InvalidSettings(
                "no recognized directives in request".to_string(),
            ));
        }
        Ok(settings)
    }
}

/// A directive value: a single scalar, or the accumulated values of a
/// repeated key in arrival order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    Scalar(String),
    List(Vec<String>),
}

impl SettingValue {
    /// First value (the scalar itself, or the first list element).
    pub fn first(&self) -> &str {
        match self {
            Self::Scalar(v) => v,
            Self::List(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values in arrival order.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Scalar(v) => vec![v.as_str()],
            Self::List(values) => values.iter().map(String::as_str).collect(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Self::Scalar(existing) => {
                let first = std::mem::take(existing);
                *self = Self::List(vec![first, value]);
            }
            Self::List(values) => values.push(value),
        }
    }
}

/// Normalized, immutable-after-build directive map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    entries: BTreeMap<String, SettingValue>,
}

impl Settings {
    /// Create an empty settings map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, accumulating into a list when the key repeats.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                self.entries.insert(key, SettingValue::Scalar(value));
            }
        }
    }

    /// Replace a value outright.
    pub fn set(&mut self, key: impl Into<String>, value: SettingValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.entries.get(key)
    }

    /// First value for a key, if present and non-empty.
    pub fn scalar(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(SettingValue::first)
            .filter(|v| !v.is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// JSON array of `[key, value]` pairs in sorted key order.
    pub fn to_sorted_pairs_json(&self) -> String {
        let pairs: Vec<(&str, &SettingValue)> = self.iter().collect();
        // Serializing strings and string arrays cannot fail.
        serde_json::to_string(&pairs).unwrap_or_default()
    }
}

fn parse_tokens(raw: &str) -> Settings {
    let mut settings = Settings::new();

    for token in raw.split([',', ';']) {
        let token = token.trim();
        if !token.contains(['_', ':']) {
            continue;
        }

        let mut parts = token.split(['_', ':']);
        let key = parts.next().unwrap_or_default().to_lowercase();
        if key.is_empty() {
            continue;
        }
        let value = parts.collect::<Vec<_>>().join(":");
        settings.insert(key, value);
    }

    settings
}

fn parse_inline(map: &serde_json::Map<String, Value>) -> Result<Settings> {
    let mut settings = Settings::new();

    for (key, value) in map {
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    settings.insert(key.clone(), scalar_to_string(&key, item)?);
                }
            }
            other => settings.insert(key.clone(), scalar_to_string(&key, other)?),
        }
    }

    Ok(settings)
}

fn scalar_to_string(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(Error::InvalidSettings(format!(
            "directive {key} must be a scalar or a list of scalars"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(raw: &str) -> Result<Settings> {
        Directives::Tokens(raw.to_string()).parse()
    }

    #[test]
    fn parses_compact_tokens() {
        let settings = tokens("w_200,h_100,g_north,f_webp").unwrap();
        assert_eq!(settings.scalar("w"), Some("200"));
        assert_eq!(settings.scalar("h"), Some("100"));
        assert_eq!(settings.scalar("g"), Some("north"));
        assert_eq!(settings.scalar("f"), Some("webp"));
        assert_eq!(settings.len(), 4);
    }

    #[test]
    fn accepts_colon_and_semicolon_separators() {
        let settings = tokens("w:200;q_80").unwrap();
        assert_eq!(settings.scalar("w"), Some("200"));
        assert_eq!(settings.scalar("q"), Some("80"));
    }

    #[test]
    fn drops_tokens_without_separator() {
        let settings = tokens("thumbnail,w_10").unwrap();
        assert_eq!(settings.len(), 1);
        assert!(!settings.contains("thumbnail"));
    }

    #[test]
    fn keys_are_lowercased() {
        let settings = tokens("W_10,Q_90").unwrap();
        assert_eq!(settings.scalar("w"), Some("10"));
        assert_eq!(settings.scalar("q"), Some("90"));
    }

    #[test]
    fn multi_part_values_are_colon_joined() {
        let settings = tokens("sh_1_0.4_0.6").unwrap();
        assert_eq!(settings.scalar("sh"), Some("1:0.4:0.6"));
    }

    #[test]
    fn repeated_keys_accumulate_in_order() {
        let settings = tokens("fa_volume=2,fa_atempo=1.5").unwrap();
        assert_eq!(
            settings.get("fa"),
            Some(&SettingValue::List(vec![
                "volume=2".to_string(),
                "atempo=1.5".to_string()
            ]))
        );
    }

    #[test]
    fn rejects_segment_without_directives() {
        let err = tokens("photo").unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));
    }

    #[test]
    fn inline_json_from_query_key() {
        let directives = Directives::inline_from_query_key(r#"{"w":200,"F":"webp"}"#).unwrap();
        let settings = directives.parse().unwrap();
        assert_eq!(settings.scalar("w"), Some("200"));
        assert_eq!(settings.scalar("f"), Some("webp"));
    }

    #[test]
    fn inline_arrays_become_lists() {
        let directives = Directives::inline_from_query_key(r#"{"fa":["a","b"]}"#).unwrap();
        let settings = directives.parse().unwrap();
        assert_eq!(settings.get("fa").unwrap().values(), vec!["a", "b"]);
    }

    #[test]
    fn inline_rejects_nested_objects() {
        let directives = Directives::inline_from_query_key(r#"{"w":{"px":1}}"#).unwrap();
        assert!(matches!(
            directives.parse(),
            Err(Error::InvalidSettings(_))
        ));
    }

    #[test]
    fn non_json_query_key_is_not_inline() {
        assert!(Directives::inline_from_query_key("v=2").is_none());
        assert!(Directives::inline_from_query_key("[1,2]").is_none());
        assert!(Directives::inline_from_query_key("{broken").is_none());
    }

    #[test]
    fn empty_inline_object_is_invalid() {
        let directives = Directives::inline_from_query_key("{}").unwrap();
        assert!(directives.parse().is_err());
    }

    #[test]
    fn sorted_pairs_ignore_arrival_order() {
        let a = tokens("w_200,h_100,q_80").unwrap();
        let b = tokens("q_80;h_100,w_200").unwrap();
        assert_eq!(a.to_sorted_pairs_json(), b.to_sorted_pairs_json());
        assert_eq!(
            a.to_sorted_pairs_json(),
            r#"[["h","100"],["q","80"],["w","200"]]"#
        );
    }
}
