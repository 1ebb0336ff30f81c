use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// String-valued labels. Keys are always sanitized on insert.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Labels(HashMap<String, String>);

/// Number-valued labels. Kept apart from [`Labels`] so that they can be indexed as numbers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NumericLabels(HashMap<String, f64>);

impl Labels {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(sanitize_label_key(key), value.into());
    }

    fn remove(&mut self, key: &str) {
        self.0.remove(key);
    }
}

impl NumericLabels {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn set(&mut self, key: &str, value: f64) {
        self.0.insert(sanitize_label_key(key), value);
    }

    fn remove(&mut self, key: &str) {
        self.0.remove(key);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnsupportedLabelValue {
    pub key: String,
}

/// Merge free-form tags (metadata `labels` or per-event `context.tags`) into the two
/// label maps. A key only ever lives in one of them: the most recent value wins.
pub fn apply_tags<'a>(
    labels: &mut Labels,
    numeric_labels: &mut NumericLabels,
    tags: impl IntoIterator<Item = (&'a String, &'a Value)>,
) -> Result<(), UnsupportedLabelValue> {
    for (key, value) in tags {
        let sanitized = sanitize_label_key(key);
        match value {
            Value::Null => continue,
            Value::String(s) => {
                numeric_labels.remove(&sanitized);
                labels.0.insert(sanitized, s.clone());
            }
            Value::Bool(b) => {
                numeric_labels.remove(&sanitized);
                labels.0.insert(sanitized, b.to_string());
            }
            Value::Number(n) => match n.as_f64() {
                Some(f) => {
                    labels.remove(&sanitized);
                    numeric_labels.0.insert(sanitized, f);
                }
                None => return Err(UnsupportedLabelValue { key: key.clone() }),
            },
            Value::Array(_) | Value::Object(_) => {
                return Err(UnsupportedLabelValue { key: key.clone() })
            }
        }
    }
    Ok(())
}

/// Label keys may not contain `.`, `*` or `"`, which have special meaning downstream.
pub fn sanitize_label_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '*' | '"' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(sanitize_label_key("a.b*c\"d"), "a_b_c_d");
        assert_eq!(sanitize_label_key("plain_key"), "plain_key");
    }

    #[test]
    fn routes_values_by_type() {
        let mut labels = Labels::default();
        let mut numeric = NumericLabels::default();
        let tags = tags(json!({"region": "eu", "retries": 3, "cached": true, "gone": null}));

        apply_tags(&mut labels, &mut numeric, &tags).unwrap();

        assert_eq!(labels.get("region"), Some("eu"));
        assert_eq!(labels.get("cached"), Some("true"));
        assert_eq!(numeric.get("retries"), Some(3.0));
        assert_eq!(labels.len() + numeric.len(), 3);
    }

    #[test]
    fn later_value_moves_key_between_maps() {
        let mut labels = Labels::default();
        let mut numeric = NumericLabels::default();

        apply_tags(&mut labels, &mut numeric, &tags(json!({"k": 1}))).unwrap();
        apply_tags(&mut labels, &mut numeric, &tags(json!({"k": "one"}))).unwrap();

        assert_eq!(labels.get("k"), Some("one"));
        assert_eq!(numeric.get("k"), None);
    }

    #[test]
    fn rejects_nested_values() {
        let mut labels = Labels::default();
        let mut numeric = NumericLabels::default();

        let err = apply_tags(&mut labels, &mut numeric, &tags(json!({"obj": {"a": 1}})))
            .unwrap_err();
        assert_eq!(err.key, "obj");
    }
}
