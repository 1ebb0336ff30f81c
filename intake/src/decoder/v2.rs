//! Decoders for the primary dialect, where every document is wrapped in a root key
//! naming its kind: `{"transaction": {...}}`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::decoder::{
    apply_context_tags, offset_timestamp, required, string_or_number, timestamp_from_micros,
    DecodeError,
};
use crate::model::{
    representative_count, Agent, Batch, BaseEvent, ErrorEvent, EventData, Exception,
    Host, Log, Metadata, Metricset, MetricsetSample, NameVersion, Process, Service, Span,
    SpanCount, SpanRef, Transaction, TransactionMarks, TransactionRef, User, UserExperience,
};

#[derive(Deserialize)]
struct MetadataDocument {
    metadata: MetadataDoc,
}

#[derive(Deserialize)]
struct MetadataDoc {
    service: Option<ServiceDoc>,
    process: Option<ProcessDoc>,
    system: Option<SystemDoc>,
    user: Option<UserDoc>,
    labels: Option<HashMap<String, Value>>,
}

#[derive(Deserialize)]
struct ServiceDoc {
    name: Option<String>,
    version: Option<String>,
    environment: Option<String>,
    node: Option<NodeDoc>,
    agent: Option<AgentDoc>,
    language: Option<NameVersionDoc>,
    runtime: Option<NameVersionDoc>,
    framework: Option<NameVersionDoc>,
}

#[derive(Deserialize)]
struct NodeDoc {
    configured_name: Option<String>,
}

#[derive(Deserialize)]
struct AgentDoc {
    name: Option<String>,
    version: Option<String>,
    ephemeral_id: Option<String>,
}

#[derive(Deserialize)]
struct NameVersionDoc {
    name: Option<String>,
    version: Option<String>,
}

#[derive(Deserialize)]
struct ProcessDoc {
    pid: Option<u32>,
    ppid: Option<u32>,
    title: Option<String>,
    #[serde(default)]
    argv: Vec<String>,
}

#[derive(Deserialize)]
struct SystemDoc {
    hostname: Option<String>,
    detected_hostname: Option<String>,
    configured_hostname: Option<String>,
    architecture: Option<String>,
    platform: Option<String>,
}

#[derive(Deserialize)]
struct UserDoc {
    id: Option<Value>,
    email: Option<String>,
    username: Option<String>,
}

#[derive(Deserialize, Default)]
struct ContextDoc {
    tags: Option<HashMap<String, Value>>,
    custom: Option<Map<String, Value>>,
}

pub fn decode_metadata(line: &[u8], base: &mut BaseEvent) -> Result<(), DecodeError> {
    let MetadataDocument { metadata: doc } = serde_json::from_slice(line)?;

    let service = required(doc.service, "metadata.service")?;
    let agent = required(service.agent, "metadata.service.agent")?;
    let metadata = Metadata {
        service: Service {
            name: required(service.name, "metadata.service.name")?,
            version: service.version,
            environment: service.environment,
            node_name: service.node.and_then(|node| node.configured_name),
            language: name_version(service.language, "metadata.service.language.name")?,
            runtime: name_version(service.runtime, "metadata.service.runtime.name")?,
            framework: name_version(service.framework, "metadata.service.framework.name")?,
        },
        agent: Agent {
            name: required(agent.name, "metadata.service.agent.name")?,
            version: required(agent.version, "metadata.service.agent.version")?,
            ephemeral_id: agent.ephemeral_id,
        },
        process: doc
            .process
            .map(|process| -> Result<Process, DecodeError> {
                Ok(Process {
                    pid: required(process.pid, "metadata.process.pid")?,
                    ppid: process.ppid,
                    title: process.title,
                    argv: process.argv,
                })
            })
            .transpose()?,
        host: doc.system.map(|system| Host {
            hostname: system
                .configured_hostname
                .or(system.detected_hostname)
                .or(system.hostname),
            architecture: system.architecture,
            os_platform: system.platform,
        }),
        user: doc
            .user
            .map(|user| -> Result<User, DecodeError> {
                Ok(User {
                    id: string_or_number(user.id, "metadata.user.id")?,
                    email: user.email,
                    name: user.username,
                })
            })
            .transpose()?,
    };

    apply_context_tags(base, doc.labels.as_ref(), "metadata.labels")?;
    base.metadata = Arc::new(metadata);
    Ok(())
}

fn name_version(doc: Option<NameVersionDoc>, field: &str) -> Result<Option<NameVersion>, DecodeError> {
    doc.map(|doc| -> Result<NameVersion, DecodeError> {
        Ok(NameVersion {
            name: required(doc.name, field)?,
            version: doc.version,
        })
    })
    .transpose()
}

#[derive(Deserialize)]
struct TransactionDocument {
    transaction: TransactionDoc,
}

#[derive(Deserialize)]
struct TransactionDoc {
    id: Option<String>,
    trace_id: Option<String>,
    parent_id: Option<String>,
    r#type: Option<String>,
    name: Option<String>,
    result: Option<String>,
    outcome: Option<String>,
    timestamp: Option<i64>,
    duration: Option<f64>,
    sampled: Option<bool>,
    sample_rate: Option<f64>,
    span_count: Option<SpanCountDoc>,
    marks: Option<HashMap<String, HashMap<String, f64>>>,
    context: Option<ContextDoc>,
    experience: Option<ExperienceDoc>,
}

#[derive(Deserialize)]
struct SpanCountDoc {
    started: Option<u32>,
    dropped: Option<u32>,
}

#[derive(Deserialize)]
struct ExperienceDoc {
    cls: Option<f64>,
    fid: Option<f64>,
    tbt: Option<f64>,
}

pub fn decode_transaction(line: &[u8], mut base: BaseEvent, batch: &mut Batch) -> Result<(), DecodeError> {
    let TransactionDocument { transaction: doc } = serde_json::from_slice(line)?;

    let span_count = required(doc.span_count, "transaction.span_count")?;
    let context = doc.context.unwrap_or_default();
    let transaction = Transaction {
        id: required(doc.id, "transaction.id")?,
        r#type: required(doc.r#type, "transaction.type")?,
        name: doc.name,
        result: doc.result,
        outcome: doc.outcome,
        duration_ms: required(doc.duration, "transaction.duration")?,
        sampled: doc.sampled.unwrap_or(true),
        span_count: SpanCount {
            started: Some(required(span_count.started, "transaction.span_count.started")?),
            dropped: span_count.dropped,
        },
        marks: doc.marks.map(TransactionMarks::from_raw).unwrap_or_default(),
        custom: context.custom,
        user_experience: doc.experience.map(|exp| UserExperience {
            cumulative_layout_shift: exp.cls,
            first_input_delay: exp.fid,
            total_blocking_time: exp.tbt,
        }),
        representative_count: representative_count(doc.sample_rate),
    };
    let trace_id = required(doc.trace_id, "transaction.trace_id")?;
    let timestamp = doc.timestamp.map(timestamp_from_micros).transpose()?;

    apply_context_tags(&mut base, context.tags.as_ref(), "transaction.context.tags")?;

    let mut event = base.into_event(EventData::Transaction(transaction));
    event.trace_id = Some(trace_id);
    event.parent_id = doc.parent_id;
    if timestamp.is_some() {
        event.timestamp = timestamp;
    }
    batch.push(event);
    Ok(())
}

#[derive(Deserialize)]
struct SpanDocument {
    span: SpanDoc,
}

#[derive(Deserialize)]
struct SpanDoc {
    id: Option<String>,
    trace_id: Option<String>,
    parent_id: Option<String>,
    transaction_id: Option<String>,
    name: Option<String>,
    r#type: Option<String>,
    subtype: Option<String>,
    action: Option<String>,
    outcome: Option<String>,
    start: Option<f64>,
    timestamp: Option<i64>,
    duration: Option<f64>,
    sync: Option<bool>,
    sample_rate: Option<f64>,
    context: Option<ContextDoc>,
}

pub fn decode_span(line: &[u8], mut base: BaseEvent, batch: &mut Batch) -> Result<(), DecodeError> {
    let SpanDocument { span: doc } = serde_json::from_slice(line)?;

    let span = Span {
        id: required(doc.id, "span.id")?,
        transaction_id: doc.transaction_id,
        name: required(doc.name, "span.name")?,
        r#type: required(doc.r#type, "span.type")?,
        subtype: doc.subtype,
        action: doc.action,
        outcome: doc.outcome,
        start_ms: doc.start,
        duration_ms: required(doc.duration, "span.duration")?,
        sync: doc.sync,
        representative_count: representative_count(doc.sample_rate),
    };
    let trace_id = required(doc.trace_id, "span.trace_id")?;
    let parent_id = required(doc.parent_id, "span.parent_id")?;
    let timestamp = match doc.timestamp {
        Some(micros) => Some(timestamp_from_micros(micros)?),
        None => offset_timestamp(base.timestamp, doc.start),
    };

    let context = doc.context.unwrap_or_default();
    apply_context_tags(&mut base, context.tags.as_ref(), "span.context.tags")?;

    let mut event = base.into_event(EventData::Span(span));
    event.trace_id = Some(trace_id);
    event.parent_id = Some(parent_id);
    event.timestamp = timestamp;
    batch.push(event);
    Ok(())
}

#[derive(Deserialize)]
struct ErrorDocument {
    error: ErrorDoc,
}

#[derive(Deserialize)]
struct ErrorDoc {
    id: Option<String>,
    trace_id: Option<String>,
    parent_id: Option<String>,
    transaction_id: Option<String>,
    culprit: Option<String>,
    timestamp: Option<i64>,
    exception: Option<ExceptionDoc>,
    log: Option<LogDoc>,
    transaction: Option<ErrorTransactionDoc>,
    context: Option<ContextDoc>,
}

#[derive(Deserialize)]
struct ExceptionDoc {
    message: Option<String>,
    r#type: Option<String>,
    module: Option<String>,
    code: Option<Value>,
    handled: Option<bool>,
}

#[derive(Deserialize)]
struct LogDoc {
    message: Option<String>,
    level: Option<String>,
    logger_name: Option<String>,
    param_message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorTransactionDoc {
    r#type: Option<String>,
    name: Option<String>,
    sampled: Option<bool>,
}

pub fn decode_error(line: &[u8], mut base: BaseEvent, batch: &mut Batch) -> Result<(), DecodeError> {
    let ErrorDocument { error: doc } = serde_json::from_slice(line)?;

    if doc.exception.is_none() && doc.log.is_none() {
        return Err(DecodeError::Validation(
            "error requires at least one of 'exception' or 'log'".to_string(),
        ));
    }
    let exception = doc
        .exception
        .map(|ex| decode_exception(ex.message, ex.r#type, ex.module, ex.code, ex.handled, "error.exception"))
        .transpose()?;
    let log = doc
        .log
        .map(|log| -> Result<Log, DecodeError> {
            Ok(Log {
                message: required(log.message, "error.log.message")?,
                level: log.level,
                logger_name: log.logger_name,
                param_message: log.param_message,
            })
        })
        .transpose()?;
    let error = ErrorEvent {
        id: required(doc.id, "error.id")?,
        transaction_id: doc.transaction_id,
        culprit: doc.culprit,
        exception,
        log,
        transaction: doc.transaction.map(|tx| TransactionRef {
            name: tx.name,
            r#type: tx.r#type,
            sampled: tx.sampled,
        }),
    };
    let timestamp = doc.timestamp.map(timestamp_from_micros).transpose()?;

    let context = doc.context.unwrap_or_default();
    apply_context_tags(&mut base, context.tags.as_ref(), "error.context.tags")?;

    let mut event = base.into_event(EventData::Error(error));
    event.trace_id = doc.trace_id;
    event.parent_id = doc.parent_id;
    if timestamp.is_some() {
        event.timestamp = timestamp;
    }
    batch.push(event);
    Ok(())
}

/// Shared by both dialects: an exception needs a message or a type, and its code may
/// only be a string or a number.
pub(crate) fn decode_exception(
    message: Option<String>,
    r#type: Option<String>,
    module: Option<String>,
    code: Option<Value>,
    handled: Option<bool>,
    field: &str,
) -> Result<Exception, DecodeError> {
    if message.is_none() && r#type.is_none() {
        return Err(DecodeError::Validation(format!(
            "{field} requires at least one of 'message' or 'type'"
        )));
    }
    let code = match code {
        None | Some(Value::Null) => None,
        Some(code @ (Value::String(_) | Value::Number(_))) => Some(code),
        Some(_) => {
            return Err(DecodeError::Validation(format!(
                "'{field}.code' must be a string or a number"
            )))
        }
    };
    Ok(Exception {
        message,
        r#type,
        module,
        code,
        handled,
    })
}

#[derive(Deserialize)]
struct MetricsetDocument {
    metricset: MetricsetDoc,
}

#[derive(Deserialize)]
struct MetricsetDoc {
    timestamp: Option<i64>,
    samples: Option<HashMap<String, SampleDoc>>,
    tags: Option<HashMap<String, Value>>,
    transaction: Option<TransactionRefDoc>,
    span: Option<SpanRefDoc>,
}

#[derive(Deserialize)]
struct SampleDoc {
    value: Option<f64>,
    values: Option<Vec<f64>>,
    counts: Option<Vec<u64>>,
    r#type: Option<String>,
    unit: Option<String>,
}

#[derive(Deserialize)]
struct TransactionRefDoc {
    name: Option<String>,
    r#type: Option<String>,
}

#[derive(Deserialize)]
struct SpanRefDoc {
    r#type: Option<String>,
    subtype: Option<String>,
}

pub fn decode_metricset(line: &[u8], mut base: BaseEvent, batch: &mut Batch) -> Result<(), DecodeError> {
    let MetricsetDocument { metricset: doc } = serde_json::from_slice(line)?;

    let samples = required(doc.samples, "metricset.samples")?;
    if samples.is_empty() {
        return Err(DecodeError::Validation(
            "'metricset.samples' must not be empty".to_string(),
        ));
    }
    let samples = samples
        .into_iter()
        .map(|(name, sample)| -> Result<(String, MetricsetSample), DecodeError> {
            let sample = metricset_sample(sample, &name)?;
            Ok((name, sample))
        })
        .collect::<Result<HashMap<_, _>, DecodeError>>()?;

    let metricset = Metricset {
        samples,
        transaction: doc.transaction.map(|tx| TransactionRef {
            name: tx.name,
            r#type: tx.r#type,
            sampled: None,
        }),
        span: doc.span.map(|span| SpanRef {
            r#type: span.r#type,
            subtype: span.subtype,
        }),
    };
    let timestamp = doc.timestamp.map(timestamp_from_micros).transpose()?;
    apply_context_tags(&mut base, doc.tags.as_ref(), "metricset.tags")?;

    let mut event = base.into_event(EventData::Metricset(metricset));
    if timestamp.is_some() {
        event.timestamp = timestamp;
    }
    batch.push(event);
    Ok(())
}

fn metricset_sample(sample: SampleDoc, name: &str) -> Result<MetricsetSample, DecodeError> {
    if sample.value.is_none() && sample.values.is_none() {
        return Err(DecodeError::Validation(format!(
            "metricset.samples.{name} requires 'value' or 'values'"
        )));
    }
    let values = sample.values.unwrap_or_default();
    let counts = sample.counts.unwrap_or_default();
    if values.len() != counts.len() {
        return Err(DecodeError::Validation(format!(
            "metricset.samples.{name}: 'counts' must have the same length as 'values'"
        )));
    }
    Ok(MetricsetSample {
        value: sample.value,
        values,
        counts,
        r#type: sample.r#type,
        unit: sample.unit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;
    use time::macros::datetime;

    fn base() -> BaseEvent {
        BaseEvent::new(datetime!(2024-05-01 12:00 UTC))
    }

    #[test]
    fn decodes_metadata_into_base() {
        let mut base = base();
        decode_metadata(
            br#"{"metadata": {"service": {"name": "checkout", "environment": "prod", "agent": {"name": "go", "version": "2.0.0"}, "language": {"name": "go"}}, "system": {"detected_hostname": "a", "configured_hostname": "b"}, "user": {"id": 42}, "labels": {"tier": "web", "shard": 3}}}"#,
            &mut base,
        )
        .unwrap();

        assert_eq!(base.metadata.service.name, "checkout");
        assert_eq!(base.metadata.agent.version, "2.0.0");
        assert_eq!(base.metadata.host.as_ref().unwrap().hostname.as_deref(), Some("b"));
        assert_eq!(base.metadata.user.as_ref().unwrap().id.as_deref(), Some("42"));
        assert_eq!(base.labels.get("tier"), Some("web"));
        assert_eq!(base.numeric_labels.get("shard"), Some(3.0));
    }

    #[test]
    fn metadata_requires_agent_version() {
        let err = decode_metadata(
            br#"{"metadata": {"service": {"name": "checkout", "agent": {"name": "go"}}}}"#,
            &mut base(),
        )
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "validation error: 'metadata.service.agent.version' required"
        );
    }

    #[test]
    fn decodes_transaction() {
        let mut batch = Batch::new();
        decode_transaction(
            br#"{"transaction": {"id": "tx", "trace_id": "tr", "type": "request", "name": "GET /", "duration": 12.5, "span_count": {"started": 2}, "sample_rate": 0.25, "timestamp": 1700000000000000, "context": {"tags": {"a.b": "c"}, "custom": {"k": [1]}}, "marks": {"agent": {"domComplete": 3.5}}}}"#,
            base(),
            &mut batch,
        )
        .unwrap();

        let event = &batch[0];
        assert_eq!(event.kind(), EventKind::Transaction);
        assert_eq!(event.trace_id.as_deref(), Some("tr"));
        assert_eq!(event.timestamp, Some(datetime!(2023-11-14 22:13:20 UTC)));
        assert_eq!(event.labels.get("a_b"), Some("c"));
        let EventData::Transaction(tx) = &event.data else {
            panic!("expected a transaction");
        };
        assert!(tx.sampled);
        assert_eq!(tx.representative_count, 4.0);
        assert_eq!(tx.marks.get("agent", "domComplete"), Some(3.5));
        assert!(tx.custom.is_some());
    }

    #[test]
    fn transaction_requires_span_count() {
        let mut batch = Batch::new();
        let err = decode_transaction(
            br#"{"transaction": {"id": "tx", "trace_id": "tr", "type": "request", "duration": 1}}"#,
            base(),
            &mut batch,
        )
        .unwrap_err();

        assert!(matches!(err, DecodeError::Validation(_)));
        assert!(batch.is_empty());
    }

    #[test]
    fn span_without_timestamp_is_offset_from_request_time() {
        let mut batch = Batch::new();
        decode_span(
            br#"{"span": {"id": "s", "trace_id": "t", "parent_id": "p", "name": "SELECT", "type": "db", "start": 250, "duration": 3}}"#,
            base(),
            &mut batch,
        )
        .unwrap();

        assert_eq!(batch[0].timestamp, Some(datetime!(2024-05-01 12:00:00.25 UTC)));
        assert_eq!(batch[0].parent_id.as_deref(), Some("p"));
    }

    #[test]
    fn error_needs_exception_or_log() {
        let mut batch = Batch::new();
        let err = decode_error(br#"{"error": {"id": "e1"}}"#, base(), &mut batch).unwrap_err();
        assert!(err.to_string().contains("'exception' or 'log'"));

        decode_error(
            br#"{"error": {"id": "e1", "log": {"message": "disk full", "level": "warn"}, "exception": {"type": "IOError", "code": 28}}}"#,
            base(),
            &mut batch,
        )
        .unwrap();
        let EventData::Error(error) = &batch[0].data else {
            panic!("expected an error");
        };
        assert_eq!(error.log.as_ref().unwrap().message, "disk full");
        assert_eq!(error.exception.as_ref().unwrap().code, Some(serde_json::json!(28)));
    }

    #[test]
    fn rejects_structured_exception_code() {
        let mut batch = Batch::new();
        let err = decode_error(
            br#"{"error": {"id": "e1", "exception": {"message": "x", "code": {"a": 1}}}}"#,
            base(),
            &mut batch,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::Validation(_)));
    }

    #[test]
    fn decodes_metricset_samples() {
        let mut batch = Batch::new();
        decode_metricset(
            br#"{"metricset": {"samples": {"cpu": {"value": 0.5}, "latency": {"values": [1, 2], "counts": [3, 4], "type": "histogram"}}, "tags": {"host": "a"}}}"#,
            base(),
            &mut batch,
        )
        .unwrap();

        let EventData::Metricset(metricset) = &batch[0].data else {
            panic!("expected a metricset");
        };
        assert_eq!(metricset.samples["cpu"].value, Some(0.5));
        assert_eq!(metricset.samples["latency"].counts, vec![3, 4]);
        assert_eq!(batch[0].labels.get("host"), Some("a"));
    }

    #[test]
    fn metricset_sample_needs_a_value() {
        let mut batch = Batch::new();
        let err = decode_metricset(
            br#"{"metricset": {"samples": {"cpu": {"unit": "percent"}}}}"#,
            base(),
            &mut batch,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error: metricset.samples.cpu requires 'value' or 'values'"
        );
    }
}
