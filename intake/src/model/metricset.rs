use std::collections::HashMap;

use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Metricset {
    pub samples: HashMap<String, MetricsetSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<SpanRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsetSample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Histogram buckets, paired with `counts`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub counts: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl MetricsetSample {
    pub fn gauge(value: f64) -> Self {
        Self {
            value: Some(value),
            ..Default::default()
        }
    }
}

/// The transaction a metricset or error belongs to.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TransactionRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampled: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}
