use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::model::{RecordWindow, TraceEvent};

/// Names and messages of the events that open and close time windows.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Signals {
    /// Events that mark a WebSocket connection as established.
    pub websocket_open: Vec<String>,
    /// Events that mark a WebSocket connection as destroyed.
    pub websocket_close: Vec<String>,
    /// `TimeStamp` messages that mark a WebSocket connection as established.
    /// They carry no identifier, so each close marker ends the oldest open one.
    pub websocket_open_markers: Vec<String>,
    /// `TimeStamp` messages that mark a WebSocket connection as closed.
    pub websocket_close_markers: Vec<String>,
    /// `TimeStamp` messages that mean the page became hidden.
    pub hidden_markers: Vec<String>,
    /// `EventDispatch` types that mean the page became hidden.
    pub page_hide_event_types: Vec<String>,
    pub post_message_marker: String,
    pub worker_created_marker: String,
}

/// Counts open connections so overlapping ones merge into one window.
#[derive(Debug, Default)]
pub struct OpenConnectionTracker {
    open: BTreeSet<String>,
    earliest_open: Option<i64>,
}

/// Windows and counters derived from one forward pass over a trace.
#[derive(Debug, Default, PartialEq)]
pub struct Intervals {
    pub websocket: Vec<RecordWindow>,
    /// None if the page was never hidden.
    pub background: Option<RecordWindow>,
    pub post_message_count: usize,
    pub worker_created_count: usize,
}

#[derive(Debug)]
pub struct IntervalTracker<'signals> {
    signals: &'signals Signals,
    connections: OpenConnectionTracker,
    markers_opened: u64,
    markers_closed: u64,
    result: Intervals,
    last_ts: Option<i64>,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            websocket_open: vec!["WebSocketReceiveHandshakeResponse".to_owned()],
            websocket_close: vec!["WebSocketDestroy".to_owned()],
            websocket_open_markers: vec!["WebSocket connected".to_owned()],
            websocket_close_markers: vec!["WebSocket disconnected".to_owned()],
            hidden_markers: vec!["visibilitychange:hidden".to_owned(), "Page hidden".to_owned()],
            page_hide_event_types: vec!["pagehide".to_owned()],
            post_message_marker: "postMessage".to_owned(),
            worker_created_marker: "Worker created".to_owned(),
        }
    }
}

impl OpenConnectionTracker {
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Opening an identifier that is already open changes nothing.
    pub fn open(&mut self, identifier: &str, ts: i64) {
        if self.open.insert(identifier.to_owned()) && self.open.len() == 1 {
            self.earliest_open = Some(ts);
        }
    }

    /// Returns the finished window once the last open connection closes.
    pub fn close(&mut self, identifier: &str, ts: i64) -> Option<RecordWindow> {
        if !self.open.remove(identifier) {
            debug!(identifier, ts, "Close for a connection that is not open");
            return None;
        }
        if !self.open.is_empty() {
            return None;
        }

        self.earliest_open
            .take()
            .map(|start| RecordWindow::new(start, ts.max(start)))
    }

    /// The window still pending when the trace ends, if any.
    pub fn finish(self) -> Option<RecordWindow> {
        if self.open.is_empty() {
            return None;
        }
        self.earliest_open.map(RecordWindow::unbounded)
    }
}

impl<'signals> IntervalTracker<'signals> {
    pub fn new(signals: &'signals Signals) -> Self {
        Self {
            signals,
            connections: OpenConnectionTracker::default(),
            markers_opened: 0,
            markers_closed: 0,
            result: Intervals::default(),
            last_ts: None,
        }
    }

    /// Feeds the next event. Events must arrive in timestamp order.
    pub fn observe(&mut self, event: &TraceEvent) {
        debug_assert!(
            self.last_ts.map_or(true, |last| last <= event.ts),
            "events out of order"
        );
        self.last_ts = Some(event.ts);

        if contains(&self.signals.websocket_open, &event.name) {
            if let Some(identifier) = connection_identifier(event) {
                trace!(identifier, ts = event.ts, "WebSocket opened");
                self.connections.open(&identifier, event.ts);
            } else {
                debug!(ts = event.ts, name = event.name, "WebSocket event has no identifier");
            }
        } else if contains(&self.signals.websocket_close, &event.name) {
            if let Some(identifier) = connection_identifier(event) {
                trace!(identifier, ts = event.ts, "WebSocket closed");
                if let Some(window) = self.connections.close(&identifier, event.ts) {
                    self.result.websocket.push(window);
                }
            } else {
                debug!(ts = event.ts, name = event.name, "WebSocket event has no identifier");
            }
        }

        let hidden = match &*event.name {
            "TimeStamp" => {
                let message = event.data_str("message");
                if message == Some(&*self.signals.post_message_marker) {
                    self.result.post_message_count += 1;
                }
                if message == Some(&*self.signals.worker_created_marker) {
                    self.result.worker_created_count += 1;
                }
                if let Some(message) = message {
                    self.observe_websocket_marker(message, event.ts);
                }
                message.is_some_and(|m| contains(&self.signals.hidden_markers, m))
            }
            "EventDispatch" => event
                .data_str("type")
                .is_some_and(|t| contains(&self.signals.page_hide_event_types, t)),
            _ => false,
        };
        if hidden && self.result.background.is_none() {
            debug!(ts = event.ts, "Page became hidden");
            self.result.background = Some(RecordWindow::unbounded(event.ts));
        }
    }

    fn observe_websocket_marker(&mut self, message: &str, ts: i64) {
        if contains(&self.signals.websocket_open_markers, message) {
            let identifier = format!("timestamp:{}", self.markers_opened);
            self.markers_opened += 1;
            trace!(identifier, ts, "WebSocket opened");
            self.connections.open(&identifier, ts);
        } else if contains(&self.signals.websocket_close_markers, message) {
            if self.markers_closed == self.markers_opened {
                debug!(ts, "WebSocket close marker without an open one");
                return;
            }
            let identifier = format!("timestamp:{}", self.markers_closed);
            self.markers_closed += 1;
            trace!(identifier, ts, "WebSocket closed");
            if let Some(window) = self.connections.close(&identifier, ts) {
                self.result.websocket.push(window);
            }
        }
    }

    pub fn finish(self) -> Intervals {
        let mut result = self.result;
        let open = self.connections.open_count();
        if let Some(window) = self.connections.finish() {
            debug!(%window, open, "WebSocket window never closed");
            result.websocket.push(window);
        }
        result
    }
}

/// Runs a tracker over `events` from start to finish.
pub fn track<'event>(
    signals: &Signals,
    events: impl IntoIterator<Item = &'event TraceEvent>,
) -> Intervals {
    let mut tracker = IntervalTracker::new(signals);
    for event in events {
        tracker.observe(event);
    }
    tracker.finish()
}

fn contains(names: &[String], name: &str) -> bool {
    names.iter().any(|n| n == name)
}

fn connection_identifier(event: &TraceEvent) -> Option<String> {
    match event.data("identifier")? {
        Value::String(identifier) => Some(identifier.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
use serde_json::json;

#[cfg(test)]
use crate::{
    error::AnalysisError,
    model::TraceModel,
    test_util::{complete, time_stamp, websocket, with_data},
};

#[cfg(test)]
fn track_all(events: Vec<crate::json::TraceEvent>) -> Result<Intervals, AnalysisError> {
    let model = TraceModel::from_events(events)?;
    Ok(track(&Signals::default(), model.events()))
}

#[test]
fn test_overlapping_connections_merge_into_one_window() -> Result<(), AnalysisError> {
    let intervals = track_all(vec![
        websocket("WebSocketReceiveHandshakeResponse", 1, 10),
        websocket("WebSocketReceiveHandshakeResponse", 2, 20),
        websocket("WebSocketDestroy", 1, 30),
        websocket("WebSocketDestroy", 2, 50),
    ])?;
    assert_eq!(intervals.websocket, [RecordWindow::new(10, 50)]);
    Ok(())
}

#[test]
fn test_unterminated_connection() -> Result<(), AnalysisError> {
    let intervals = track_all(vec![
        websocket("WebSocketReceiveHandshakeResponse", 7, 5),
        complete("Layout", 1, 1, 900, 10),
        complete("Layout", 1, 1, 1000, 10),
    ])?;
    assert_eq!(intervals.websocket, [RecordWindow::unbounded(5)]);
    assert_eq!(intervals.websocket[0].recording_time(1000), 995);
    Ok(())
}

#[test]
fn test_separate_connections_and_stray_events() -> Result<(), AnalysisError> {
    let intervals = track_all(vec![
        websocket("WebSocketDestroy", 9, 1),
        websocket("WebSocketReceiveHandshakeResponse", 1, 10),
        websocket("WebSocketReceiveHandshakeResponse", 1, 15),
        websocket("WebSocketDestroy", 1, 20),
        websocket("WebSocketDestroy", 1, 25),
        with_data(
            websocket("WebSocketReceiveHandshakeResponse", 0, 40),
            "identifier",
            json!("abc"),
        ),
        with_data(
            websocket("WebSocketDestroy", 0, 60),
            "identifier",
            json!("abc"),
        ),
    ])?;
    assert_eq!(
        intervals.websocket,
        [RecordWindow::new(10, 20), RecordWindow::new(40, 60)]
    );
    Ok(())
}

#[test]
fn test_background_window_and_markers() -> Result<(), AnalysisError> {
    let intervals = track_all(vec![
        time_stamp("postMessage", 10),
        time_stamp("Worker created", 15),
        time_stamp("Page hidden", 100),
        time_stamp("postMessage", 120),
        time_stamp("visibilitychange:hidden", 300),
    ])?;
    assert_eq!(intervals.background, Some(RecordWindow::unbounded(100)));
    assert_eq!(intervals.post_message_count, 2);
    assert_eq!(intervals.worker_created_count, 1);
    Ok(())
}

#[test]
fn test_page_hide_dispatch_starts_background() -> Result<(), AnalysisError> {
    let intervals = track_all(vec![
        complete("Layout", 1, 1, 0, 5),
        with_data(complete("EventDispatch", 1, 1, 40, 2), "type", json!("pagehide")),
    ])?;
    assert_eq!(intervals.background, Some(RecordWindow::unbounded(40)));
    Ok(())
}

#[test]
fn test_absent_signals() -> Result<(), AnalysisError> {
    let intervals = track_all(vec![
        complete("Layout", 1, 1, 0, 5),
        with_data(complete("EventDispatch", 1, 1, 40, 2), "type", json!("click")),
    ])?;
    assert_eq!(intervals, Intervals::default());
    Ok(())
}

#[test]
fn test_websocket_timestamp_markers() -> Result<(), AnalysisError> {
    let intervals = track_all(vec![
        time_stamp("WebSocket disconnected", 50),
        time_stamp("WebSocket connected", 100),
        time_stamp("WebSocket connected", 150),
        time_stamp("WebSocket disconnected", 200),
        time_stamp("WebSocket disconnected", 400),
        time_stamp("WebSocket connected", 700),
        complete("Layout", 1, 1, 1000, 5),
    ])?;
    assert_eq!(
        intervals.websocket,
        [RecordWindow::new(100, 400), RecordWindow::unbounded(700)]
    );
    Ok(())
}
