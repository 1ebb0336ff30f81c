use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::labels::sanitize_label_key;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Transaction {
    pub id: String,
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub duration_ms: f64,
    pub sampled: bool,
    pub span_count: SpanCount,
    #[serde(skip_serializing_if = "TransactionMarks::is_empty")]
    pub marks: TransactionMarks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_experience: Option<UserExperience>,

    /// Approximate number of transactions this one stands in for, used for scaling
    /// metrics. Not indexed.
    pub representative_count: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SpanCount {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct UserExperience {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_layout_shift: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_input_delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_blocking_time: Option<f64>,
}

/// Named groups of timing marks, e.g. `navigationTiming.domComplete`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TransactionMarks(HashMap<String, TransactionMark>);

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TransactionMark(HashMap<String, f64>);

impl TransactionMarks {
    /// Builds marks from the wire representation, sanitizing group and mark names the
    /// same way as label keys. Empty groups are dropped.
    pub fn from_raw(raw: HashMap<String, HashMap<String, f64>>) -> Self {
        let marks = raw
            .into_iter()
            .filter(|(_, mark)| !mark.is_empty())
            .map(|(group, mark)| {
                let mark = mark
                    .into_iter()
                    .map(|(k, v)| (sanitize_label_key(&k), v))
                    .collect();
                (sanitize_label_key(&group), TransactionMark(mark))
            })
            .collect();
        TransactionMarks(marks)
    }

    pub fn get(&self, group: &str, mark: &str) -> Option<f64> {
        self.0.get(group).and_then(|m| m.0.get(mark)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
