use std::{collections::BTreeMap, io::Read};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AnalysisError;

/// One record in the Chromium JSON trace event schema.
///
/// Format spec: <https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU>
///
/// Every field is optional on the wire; timestamps may be fractional microseconds.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TraceEvent {
    pub ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    pub ph: String,
    pub name: String,
    pub cat: String,
    pub pid: u64,
    pub tid: u64,
    pub args: BTreeMap<String, Value>,
}

/// How a trace source lays out its events.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceFormat {
    /// Decide from the first JSON value.
    #[default]
    Auto,
    /// A JSON array of events, or an object with a `traceEvents` array.
    Document,
    /// Concatenated or newline-delimited event records.
    Stream,
}

/// Reads trace events from `reader`, handing each one to `sink` in file order.
///
/// A leading empty object (as written by WebPageTest) is discarded.
pub fn read_trace(
    reader: impl Read,
    format: TraceFormat,
    mut sink: impl FnMut(TraceEvent),
) -> Result<(), AnalysisError> {
    let mut values = serde_json::Deserializer::from_reader(reader).into_iter::<Value>();
    let Some(first) = values.next().transpose()? else {
        return Ok(());
    };

    match (format, first) {
        (TraceFormat::Auto | TraceFormat::Document, Value::Object(mut envelope))
            if envelope.contains_key("traceEvents") =>
        {
            if values.next().is_some() {
                return Err(AnalysisError::MalformedTrace(
                    "Unexpected data after trace document".to_owned(),
                ));
            }
            let Some(Value::Array(records)) = envelope.remove("traceEvents") else {
                return Err(AnalysisError::MalformedTrace(
                    "traceEvents is not an array".to_owned(),
                ));
            };
            parse_records(records, sink)
        }
        (TraceFormat::Auto | TraceFormat::Document, Value::Array(records)) => {
            if values.next().is_some() {
                return Err(AnalysisError::MalformedTrace(
                    "Unexpected data after trace document".to_owned(),
                ));
            }
            parse_records(records, sink)
        }
        (TraceFormat::Document, other) => Err(AnalysisError::MalformedTrace(format!(
            "Expected an event array or an object with traceEvents, found {}",
            kind(&other)
        ))),
        (TraceFormat::Auto | TraceFormat::Stream, first @ Value::Object(_)) => {
            if !is_empty_record(&first) {
                sink(parse_record(0, first)?);
            }
            for (i, value) in values.enumerate() {
                let value = value?;
                if !value.is_object() {
                    return Err(AnalysisError::MalformedTrace(format!(
                        "Record {} is {}, not an event",
                        i + 1,
                        kind(&value)
                    )));
                }
                sink(parse_record(i + 1, value)?);
            }
            Ok(())
        }
        (_, other) => Err(AnalysisError::MalformedTrace(format!(
            "Expected trace events, found {}",
            kind(&other)
        ))),
    }
}

fn parse_records(
    records: Vec<Value>,
    mut sink: impl FnMut(TraceEvent),
) -> Result<(), AnalysisError> {
    let skip = records.first().is_some_and(is_empty_record) as usize;
    for (i, record) in records.into_iter().enumerate().skip(skip) {
        sink(parse_record(i, record)?);
    }

    Ok(())
}

fn parse_record(index: usize, record: Value) -> Result<TraceEvent, AnalysisError> {
    serde_json::from_value(record)
        .map_err(|e| AnalysisError::MalformedTrace(format!("Record {index}: {e}")))
}

fn is_empty_record(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.is_empty())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
fn read_all(input: &str, format: TraceFormat) -> Result<Vec<TraceEvent>, AnalysisError> {
    let mut result = vec![];
    read_trace(input.as_bytes(), format, |e| result.push(e))?;
    Ok(result)
}

#[test]
fn test_read_envelope_skips_leading_empty_object() -> Result<(), AnalysisError> {
    let events = read_all(
        r#"{"traceEvents": [{}, {"name": "Layout", "ph": "X", "ts": 10, "dur": 5.5, "cat": "devtools.timeline"}], "metadata": {}}"#,
        TraceFormat::Auto,
    )?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "Layout");
    assert_eq!(events[0].dur, Some(5.5));
    Ok(())
}

#[test]
fn test_read_bare_array_keeps_empty_object_after_first() -> Result<(), AnalysisError> {
    let events = read_all(
        r#"[{"name": "A", "ph": "I", "ts": 1}, {}]"#,
        TraceFormat::Document,
    )?;
    assert_eq!(events.len(), 2);
    Ok(())
}

#[test]
fn test_read_stream_of_records() -> Result<(), AnalysisError> {
    let events = read_all(
        "{}\n{\"name\": \"A\", \"ph\": \"B\", \"ts\": 1}\n{\"name\": \"A\", \"ph\": \"E\", \"ts\": 4}\n",
        TraceFormat::Auto,
    )?;
    assert_eq!(
        events.iter().map(|e| &*e.ph).collect::<Vec<_>>(),
        ["B", "E"]
    );
    Ok(())
}

#[test]
fn test_read_empty_input_is_not_malformed() -> Result<(), AnalysisError> {
    assert!(read_all("", TraceFormat::Auto)?.is_empty());
    assert!(read_all("[]", TraceFormat::Auto)?.is_empty());
    Ok(())
}

#[test]
fn test_read_malformed_inputs() {
    for input in [
        "not json",
        "42",
        r#"{"traceEvents": 3}"#,
        r#"[{"name": "A", "ts": "soon"}]"#,
        r#"{"name": "A"} [1, 2]"#,
    ] {
        assert!(
            matches!(
                read_all(input, TraceFormat::Auto),
                Err(AnalysisError::MalformedTrace(_))
            ),
            "{input}"
        );
    }
    assert!(read_all(r#"{"name": "A"}"#, TraceFormat::Document).is_err());
}
