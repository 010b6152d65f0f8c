//! Builders for raw trace events used across the unit tests.

use serde_json::{json, Value};

use crate::json::TraceEvent;

pub fn thread_name(pid: u64, tid: u64, name: &str) -> TraceEvent {
    TraceEvent {
        ph: "M".to_owned(),
        name: "thread_name".to_owned(),
        cat: "__metadata".to_owned(),
        pid,
        tid,
        args: [("name".to_owned(), json!(name))].into_iter().collect(),
        ..Default::default()
    }
}

pub fn complete(name: &str, pid: u64, tid: u64, ts: i64, dur: i64) -> TraceEvent {
    TraceEvent {
        ts: ts as f64,
        dur: Some(dur as f64),
        ph: "X".to_owned(),
        name: name.to_owned(),
        cat: "devtools.timeline".to_owned(),
        pid,
        tid,
        ..Default::default()
    }
}

pub fn instant(name: &str, pid: u64, tid: u64, ts: i64) -> TraceEvent {
    TraceEvent {
        ts: ts as f64,
        ph: "I".to_owned(),
        name: name.to_owned(),
        cat: "devtools.timeline".to_owned(),
        pid,
        tid,
        ..Default::default()
    }
}

pub fn begin(name: &str, pid: u64, tid: u64, ts: i64) -> TraceEvent {
    TraceEvent {
        ph: "B".to_owned(),
        ..instant(name, pid, tid, ts)
    }
}

pub fn end(name: &str, pid: u64, tid: u64, ts: i64) -> TraceEvent {
    TraceEvent {
        ph: "E".to_owned(),
        ..instant(name, pid, tid, ts)
    }
}

/// A `console.timeStamp(message)` marker on the main thread.
pub fn time_stamp(message: &str, ts: i64) -> TraceEvent {
    with_data(instant("TimeStamp", 1, 1, ts), "message", json!(message))
}

pub fn websocket(name: &str, identifier: u64, ts: i64) -> TraceEvent {
    with_data(instant(name, 1, 1, ts), "identifier", json!(identifier))
}

pub fn with_data(mut event: TraceEvent, key: &str, value: Value) -> TraceEvent {
    event
        .args
        .entry("data".to_owned())
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .expect("data is an object")
        .insert(key.to_owned(), value);
    event
}

pub fn with_cat(mut event: TraceEvent, cat: &str) -> TraceEvent {
    event.cat = cat.to_owned();
    event
}
