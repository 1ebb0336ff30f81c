//! Decoders for the compact browser dialect. Keys are abbreviated, and a single
//! transaction document carries its spans and breakdown metricsets inline.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::decoder::v2::decode_exception;
use crate::decoder::{
    apply_context_tags, offset_timestamp, required, string_or_number, timestamp_from_micros,
    DecodeError,
};
use crate::model::{
    representative_count, Agent, Batch, BaseEvent, ErrorEvent, EventData, Log, Metadata,
    Metricset, MetricsetSample, NameVersion, Service, Span, SpanCount, SpanRef, Transaction,
    TransactionMarks, TransactionRef, User, UserExperience,
};

#[derive(Deserialize)]
struct MetadataDocument {
    m: MetadataDoc,
}

#[derive(Deserialize)]
struct MetadataDoc {
    se: Option<ServiceDoc>,
    u: Option<UserDoc>,
    l: Option<HashMap<String, Value>>,
}

#[derive(Deserialize)]
struct ServiceDoc {
    n: Option<String>,
    ve: Option<String>,
    en: Option<String>,
    a: Option<AgentDoc>,
    la: Option<NameVersionDoc>,
    ru: Option<NameVersionDoc>,
    fw: Option<NameVersionDoc>,
}

#[derive(Deserialize)]
struct AgentDoc {
    n: Option<String>,
    ve: Option<String>,
}

#[derive(Deserialize)]
struct NameVersionDoc {
    n: Option<String>,
    ve: Option<String>,
}

#[derive(Deserialize)]
struct UserDoc {
    id: Option<Value>,
    em: Option<String>,
    un: Option<String>,
}

#[derive(Deserialize, Default)]
struct ContextDoc {
    g: Option<HashMap<String, Value>>,
    cu: Option<Map<String, Value>>,
}

pub fn decode_metadata(line: &[u8], base: &mut BaseEvent) -> Result<(), DecodeError> {
    let MetadataDocument { m: doc } = serde_json::from_slice(line)?;

    let service = required(doc.se, "m.se")?;
    let agent = required(service.a, "m.se.a")?;
    let metadata = Metadata {
        service: Service {
            name: required(service.n, "m.se.n")?,
            version: service.ve,
            environment: service.en,
            node_name: None,
            language: name_version(service.la, "m.se.la.n")?,
            runtime: name_version(service.ru, "m.se.ru.n")?,
            framework: name_version(service.fw, "m.se.fw.n")?,
        },
        agent: Agent {
            name: required(agent.n, "m.se.a.n")?,
            version: required(agent.ve, "m.se.a.ve")?,
            ephemeral_id: None,
        },
        process: None,
        host: None,
        user: doc
            .u
            .map(|user| -> Result<User, DecodeError> {
                Ok(User {
                    id: string_or_number(user.id, "m.u.id")?,
                    email: user.em,
                    name: user.un,
                })
            })
            .transpose()?,
    };

    apply_context_tags(base, doc.l.as_ref(), "m.l")?;
    base.metadata = Arc::new(metadata);
    Ok(())
}

fn name_version(doc: Option<NameVersionDoc>, field: &str) -> Result<Option<NameVersion>, DecodeError> {
    doc.map(|doc| -> Result<NameVersion, DecodeError> {
        Ok(NameVersion {
            name: required(doc.n, field)?,
            version: doc.ve,
        })
    })
    .transpose()
}

#[derive(Deserialize)]
struct TransactionDocument {
    x: TransactionDoc,
}

#[derive(Deserialize)]
struct TransactionDoc {
    id: Option<String>,
    tid: Option<String>,
    pid: Option<String>,
    n: Option<String>,
    t: Option<String>,
    d: Option<f64>,
    rt: Option<String>,
    o: Option<String>,
    sm: Option<bool>,
    sr: Option<f64>,
    yc: Option<SpanCountDoc>,
    k: Option<HashMap<String, HashMap<String, f64>>>,
    c: Option<ContextDoc>,
    exp: Option<ExperienceDoc>,
    #[serde(default)]
    y: Vec<SpanDoc>,
    #[serde(default)]
    me: Vec<MetricsetDoc>,
}

#[derive(Deserialize)]
struct SpanCountDoc {
    sd: Option<u32>,
    dd: Option<u32>,
}

#[derive(Deserialize)]
struct ExperienceDoc {
    cls: Option<f64>,
    fid: Option<f64>,
    tbt: Option<f64>,
}

#[derive(Deserialize)]
struct SpanDoc {
    id: Option<String>,
    n: Option<String>,
    t: Option<String>,
    su: Option<String>,
    ac: Option<String>,
    s: Option<f64>,
    d: Option<f64>,
    pi: Option<usize>,
    sy: Option<bool>,
    o: Option<String>,
    sr: Option<f64>,
    c: Option<ContextDoc>,
}

#[derive(Deserialize)]
struct MetricsetDoc {
    sa: Option<HashMap<String, SampleDoc>>,
    y: Option<SpanRefDoc>,
    g: Option<HashMap<String, Value>>,
}

#[derive(Deserialize)]
struct SampleDoc {
    v: Option<f64>,
}

#[derive(Deserialize)]
struct SpanRefDoc {
    t: Option<String>,
    su: Option<String>,
}

/// Expands the abbreviated breakdown sample names into their full form.
fn sample_name(short: &str) -> Option<&'static str> {
    let name = match short {
        "xdc" => "transaction.duration.count",
        "xds" => "transaction.duration.sum.us",
        "xbc" => "transaction.breakdown.count",
        "ysc" => "span.self_time.count",
        "yss" => "span.self_time.sum.us",
        _ => return None,
    };
    Some(name)
}

/// Decodes a transaction together with its nested spans and metricsets. The events are
/// built up front and only appended once the whole document has been validated.
pub fn decode_transaction(line: &[u8], base: BaseEvent, batch: &mut Batch) -> Result<(), DecodeError> {
    let TransactionDocument { x: doc } = serde_json::from_slice(line)?;

    let id = required(doc.id, "x.id")?;
    let trace_id = required(doc.tid, "x.tid")?;
    let name = doc.n;
    let r#type = required(doc.t, "x.t")?;
    let span_count = required(doc.yc, "x.yc")?;
    let context = doc.c.unwrap_or_default();

    let transaction = Transaction {
        id: id.clone(),
        r#type: r#type.clone(),
        name: name.clone(),
        result: doc.rt,
        outcome: doc.o,
        duration_ms: required(doc.d, "x.d")?,
        sampled: doc.sm.unwrap_or(true),
        span_count: SpanCount {
            started: Some(required(span_count.sd, "x.yc.sd")?),
            dropped: span_count.dd,
        },
        marks: doc.k.map(TransactionMarks::from_raw).unwrap_or_default(),
        custom: context.cu,
        user_experience: doc.exp.map(|exp| UserExperience {
            cumulative_layout_shift: exp.cls,
            first_input_delay: exp.fid,
            total_blocking_time: exp.tbt,
        }),
        representative_count: representative_count(doc.sr),
    };

    let mut events = Batch::with_capacity(1 + doc.y.len() + doc.me.len());

    let mut tx_base = base.clone();
    apply_context_tags(&mut tx_base, context.g.as_ref(), "x.c.g")?;
    let mut tx_event = tx_base.into_event(EventData::Transaction(transaction));
    tx_event.trace_id = Some(trace_id.clone());
    tx_event.parent_id = doc.pid;
    events.push(tx_event);

    let span_ids = doc
        .y
        .iter()
        .map(|span| span.id.clone())
        .collect::<Vec<_>>();
    for (index, span) in doc.y.into_iter().enumerate() {
        let field = format!("x.y[{index}]");
        let parent_id = match span.pi {
            None => id.clone(),
            Some(pi) => span_ids
                .get(pi)
                .cloned()
                .flatten()
                .ok_or_else(|| {
                    DecodeError::Validation(format!("{field}.pi: no span at index {pi}"))
                })?,
        };
        let timestamp = offset_timestamp(base.timestamp, span.s);
        let nested = Span {
            id: required(span.id, &format!("{field}.id"))?,
            transaction_id: Some(id.clone()),
            name: required(span.n, &format!("{field}.n"))?,
            r#type: required(span.t, &format!("{field}.t"))?,
            subtype: span.su,
            action: span.ac,
            outcome: span.o,
            start_ms: Some(required(span.s, &format!("{field}.s"))?),
            duration_ms: required(span.d, &format!("{field}.d"))?,
            sync: span.sy,
            representative_count: representative_count(span.sr),
        };

        let mut span_base = base.clone();
        let tags = span.c.and_then(|c| c.g);
        apply_context_tags(&mut span_base, tags.as_ref(), &format!("{field}.c.g"))?;
        let mut event = span_base.into_event(EventData::Span(nested));
        event.trace_id = Some(trace_id.clone());
        event.parent_id = Some(parent_id);
        event.timestamp = timestamp;
        events.push(event);
    }

    for (index, metricset) in doc.me.into_iter().enumerate() {
        let field = format!("x.me[{index}]");
        let samples = required(metricset.sa, &format!("{field}.sa"))?;
        let samples = samples
            .into_iter()
            .map(|(short, sample)| -> Result<(String, MetricsetSample), DecodeError> {
                let name = sample_name(&short).ok_or_else(|| {
                    DecodeError::Validation(format!("{field}.sa: unknown sample '{short}'"))
                })?;
                let value = required(sample.v, &format!("{field}.sa.{short}.v"))?;
                Ok((name.to_string(), MetricsetSample::gauge(value)))
            })
            .collect::<Result<HashMap<_, _>, DecodeError>>()?;
        if samples.is_empty() {
            return Err(DecodeError::Validation(format!(
                "'{field}.sa' must not be empty"
            )));
        }

        let nested = Metricset {
            samples,
            transaction: Some(TransactionRef {
                name: name.clone(),
                r#type: Some(r#type.clone()),
                sampled: None,
            }),
            span: metricset.y.map(|span| SpanRef {
                r#type: span.t,
                subtype: span.su,
            }),
        };

        let mut metricset_base = base.clone();
        apply_context_tags(&mut metricset_base, metricset.g.as_ref(), &format!("{field}.g"))?;
        events.push(metricset_base.into_event(EventData::Metricset(nested)));
    }

    batch.extend(events);
    Ok(())
}

#[derive(Deserialize)]
struct ErrorDocument {
    e: ErrorDoc,
}

#[derive(Deserialize)]
struct ErrorDoc {
    id: Option<String>,
    tid: Option<String>,
    pid: Option<String>,
    xid: Option<String>,
    cl: Option<String>,
    timestamp: Option<i64>,
    ex: Option<ExceptionDoc>,
    log: Option<LogDoc>,
    x: Option<ErrorTransactionDoc>,
    c: Option<ContextDoc>,
}

#[derive(Deserialize)]
struct ExceptionDoc {
    mg: Option<String>,
    t: Option<String>,
    mo: Option<String>,
    cd: Option<Value>,
    hd: Option<bool>,
}

#[derive(Deserialize)]
struct LogDoc {
    mg: Option<String>,
    lv: Option<String>,
    ln: Option<String>,
    pmg: Option<String>,
}

#[derive(Deserialize)]
struct ErrorTransactionDoc {
    t: Option<String>,
    sm: Option<bool>,
}

pub fn decode_error(line: &[u8], mut base: BaseEvent, batch: &mut Batch) -> Result<(), DecodeError> {
    let ErrorDocument { e: doc } = serde_json::from_slice(line)?;

    if doc.ex.is_none() && doc.log.is_none() {
        return Err(DecodeError::Validation(
            "e requires at least one of 'ex' or 'log'".to_string(),
        ));
    }
    let exception = doc
        .ex
        .map(|ex| decode_exception(ex.mg, ex.t, ex.mo, ex.cd, ex.hd, "e.ex"))
        .transpose()?;
    let log = doc
        .log
        .map(|log| -> Result<Log, DecodeError> {
            Ok(Log {
                message: required(log.mg, "e.log.mg")?,
                level: log.lv,
                logger_name: log.ln,
                param_message: log.pmg,
            })
        })
        .transpose()?;
    let error = ErrorEvent {
        id: required(doc.id, "e.id")?,
        transaction_id: doc.xid,
        culprit: doc.cl,
        exception,
        log,
        transaction: doc.x.map(|tx| TransactionRef {
            name: None,
            r#type: tx.t,
            sampled: tx.sm,
        }),
    };
    let timestamp = doc.timestamp.map(timestamp_from_micros).transpose()?;

    let tags = doc.c.and_then(|c| c.g);
    apply_context_tags(&mut base, tags.as_ref(), "e.c.g")?;

    let mut event = base.into_event(EventData::Error(error));
    event.trace_id = doc.tid;
    event.parent_id = doc.pid;
    if timestamp.is_some() {
        event.timestamp = timestamp;
    }
    batch.push(event);
    Ok(())
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
    fn decodes_compact_metadata() {
        let mut base = base();
        decode_metadata(
            br#"{"m": {"se": {"n": "shop-ui", "ve": "1.2", "a": {"n": "rum-js", "ve": "5.0"}, "fw": {"n": "react"}}, "u": {"un": "ada"}, "l": {"release": "r1"}}}"#,
            &mut base,
        )
        .unwrap();

        assert_eq!(base.metadata.service.name, "shop-ui");
        assert_eq!(base.metadata.agent.name, "rum-js");
        assert_eq!(
            base.metadata.service.framework.as_ref().map(|fw| fw.name.as_str()),
            Some("react")
        );
        assert_eq!(base.metadata.user.as_ref().unwrap().name.as_deref(), Some("ada"));
        assert_eq!(base.labels.get("release"), Some("r1"));
    }

    #[test]
    fn compact_metadata_requires_service_name() {
        let err = decode_metadata(br#"{"m": {"se": {"a": {"n": "rum-js", "ve": "5"}}}}"#, &mut base())
            .unwrap_err();
        assert_eq!(err.to_string(), "validation error: 'm.se.n' required");
    }

    #[test]
    fn transaction_expands_to_spans_and_metricsets() {
        let mut batch = Batch::new();
        decode_transaction(
            br#"{"x": {"id": "tx", "tid": "tr", "n": "/home", "t": "page-load", "d": 120, "yc": {"sd": 2}, "y": [{"id": "s0", "n": "fetch", "t": "resource", "s": 10, "d": 5}, {"id": "s1", "n": "parse", "t": "script", "s": 20, "d": 1, "pi": 0}], "me": [{"sa": {"ysc": {"v": 1}, "yss": {"v": 500}}, "y": {"t": "resource"}}]}}"#,
            base(),
            &mut batch,
        )
        .unwrap();

        let kinds = batch.iter().map(|event| event.kind()).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![EventKind::Transaction, EventKind::Span, EventKind::Span, EventKind::Metricset]
        );
        assert_eq!(batch[1].parent_id.as_deref(), Some("tx"));
        assert_eq!(batch[2].parent_id.as_deref(), Some("s0"));
        assert_eq!(batch[2].trace_id.as_deref(), Some("tr"));
        assert_eq!(batch[1].timestamp, Some(datetime!(2024-05-01 12:00:00.01 UTC)));

        let EventData::Metricset(metricset) = &batch[3].data else {
            panic!("expected a metricset");
        };
        assert_eq!(metricset.samples["span.self_time.sum.us"].value, Some(500.0));
        assert_eq!(
            metricset.transaction.as_ref().and_then(|tx| tx.name.as_deref()),
            Some("/home")
        );
    }

    #[test]
    fn invalid_nested_span_appends_nothing() {
        let mut batch = Batch::new();
        let err = decode_transaction(
            br#"{"x": {"id": "tx", "tid": "tr", "t": "page-load", "d": 120, "yc": {"sd": 1}, "y": [{"id": "s0", "n": "fetch", "t": "resource", "s": 10}]}}"#,
            base(),
            &mut batch,
        )
        .unwrap_err();

        assert_eq!(err.to_string(), "validation error: 'x.y[0].d' required");
        assert!(batch.is_empty());
    }

    #[test]
    fn bad_parent_index_is_rejected() {
        let mut batch = Batch::new();
        let err = decode_transaction(
            br#"{"x": {"id": "tx", "tid": "tr", "t": "page-load", "d": 1, "yc": {"sd": 1}, "y": [{"id": "s0", "n": "a", "t": "b", "s": 0, "d": 1, "pi": 4}]}}"#,
            base(),
            &mut batch,
        )
        .unwrap_err();

        assert!(matches!(err, DecodeError::Validation(_)));
        assert!(batch.is_empty());
    }

    #[test]
    fn decodes_compact_error() {
        let mut batch = Batch::new();
        decode_error(
            br#"{"e": {"id": "e1", "tid": "tr", "xid": "tx", "ex": {"mg": "undefined is not a function", "hd": false}, "x": {"t": "page-load", "sm": true}, "c": {"g": {"page": "home"}}}}"#,
            base(),
            &mut batch,
        )
        .unwrap();

        let event = &batch[0];
        assert_eq!(event.labels.get("page"), Some("home"));
        let EventData::Error(error) = &event.data else {
            panic!("expected an error");
        };
        assert_eq!(error.transaction_id.as_deref(), Some("tx"));
        assert_eq!(error.exception.as_ref().unwrap().handled, Some(false));
    }
}
