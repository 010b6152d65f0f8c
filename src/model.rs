use std::{collections::BTreeMap, fmt::Display};

use serde_json::Value;
use tracing::trace;

use crate::{error::AnalysisError, json};

static MAIN_THREAD_NAME: &'static str = "CrRendererMain";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Begin,
    End,
    /// A span recorded with an explicit `dur`.
    Complete,
    Instant,
    AsyncStart,
    AsyncEnd,
    Metadata,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrackType {
    MainThread,
    Worker,
    #[default]
    Other,
}

/// A trace event after normalisation, with integer microsecond times.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceEvent {
    pub name: String,
    /// The `cat` field split on commas, in declaration order.
    pub categories: Vec<String>,
    pub ts: i64,
    /// Some if the event is a span, None if it is instantaneous (or an unmatched Begin).
    pub dur: Option<i64>,
    pub phase: Phase,
    pub pid: u64,
    pub tid: u64,
    pub track: TrackType,
    pub args: BTreeMap<String, Value>,
}

/// A contiguous span of interest, in trace microseconds.
///
/// `end` is None while the window is unterminated. It only becomes a number
/// when a recording time is computed, by clamping to the trace's last timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordWindow {
    pub start: i64,
    pub end: Option<i64>,
}

/// Ordered timing events of one trace, plus the recording bounds.
#[derive(Debug)]
pub struct TraceModel {
    events: Vec<TraceEvent>,
    threads: BTreeMap<(u64, u64), String>,
    min_ts: i64,
    max_ts: i64,
}

/// Collects events one at a time, for traces delivered as a stream.
#[derive(Debug, Default)]
pub struct TraceModelBuilder {
    events: Vec<TraceEvent>,
    threads: BTreeMap<(u64, u64), String>,
}

impl Phase {
    pub fn from_ph(ph: &str) -> Self {
        match ph {
            "B" => Self::Begin,
            "E" => Self::End,
            "X" => Self::Complete,
            "i" | "I" | "R" => Self::Instant,
            "b" | "S" => Self::AsyncStart,
            "e" | "F" => Self::AsyncEnd,
            "M" => Self::Metadata,
            _ => Self::Other,
        }
    }
}

impl TrackType {
    pub fn from_thread_name(name: &str) -> Self {
        if name == MAIN_THREAD_NAME {
            Self::MainThread
        } else if name.contains("Worker") {
            Self::Worker
        } else {
            Self::Other
        }
    }
}

impl From<json::TraceEvent> for TraceEvent {
    fn from(event: json::TraceEvent) -> Self {
        Self {
            categories: event
                .cat
                .split(",")
                .map(str::trim)
                .filter(|cat| !cat.is_empty())
                .map(str::to_owned)
                .collect(),
            ts: event.ts.round() as i64,
            dur: event.dur.map(|dur| dur.round() as i64),
            phase: Phase::from_ph(&event.ph),
            name: event.name,
            pid: event.pid,
            tid: event.tid,
            track: TrackType::Other,
            args: event.args,
        }
    }
}

impl TraceEvent {
    /// End of the event, or its start if it has no duration.
    pub fn end(&self) -> i64 {
        self.ts.saturating_add(self.dur.unwrap_or(0))
    }

    /// Looks up `.args.data.<key>`, where DevTools puts most event details.
    pub fn data(&self, key: &str) -> Option<&Value> {
        self.args
            .get("data")
            .and_then(|v| v.as_object())
            .and_then(|m| m.get(key))
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data(key).and_then(|v| v.as_str())
    }
}

impl RecordWindow {
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start <= end, "window ends before it starts");
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn unbounded(start: i64) -> Self {
        Self { start, end: None }
    }

    pub fn clamped_end(&self, max_ts: i64) -> i64 {
        self.end.map_or(max_ts, |end| end.min(max_ts))
    }

    /// Recording time of the window, with an open end clamped to `max_ts`.
    pub fn recording_time(&self, max_ts: i64) -> i64 {
        (self.clamped_end(max_ts) - self.start).max(0)
    }

    pub fn overlaps(&self, event: &TraceEvent) -> bool {
        event.end() >= self.start && self.end.map_or(true, |end| event.ts <= end)
    }
}

impl Display for RecordWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {}]", self.start, end),
            None => write!(f, "[{}, ∞)", self.start),
        }
    }
}

impl TraceModelBuilder {
    pub fn push(&mut self, event: json::TraceEvent) {
        let event = TraceEvent::from(event);
        if event.phase == Phase::Metadata {
            if event.name == "thread_name" {
                if let Some(name) = event.args.get("name").and_then(|v| v.as_str()) {
                    self.threads
                        .insert((event.pid, event.tid), name.to_owned());
                }
            }
            return;
        }
        self.events.push(event);
    }

    pub fn finish(self) -> Result<TraceModel, AnalysisError> {
        let Self {
            mut events,
            threads,
        } = self;
        let (Some(min_ts), Some(max_ts)) = (
            events.iter().map(|e| e.ts).min(),
            events.iter().map(|e| e.ts).max(),
        ) else {
            return Err(AnalysisError::MalformedTrace(
                "Trace contains no events".to_owned(),
            ));
        };

        // Stable, so events with equal timestamps keep their arrival order.
        events.sort_by_key(|e| e.ts);
        pair_begin_end(&mut events);
        events.retain(|e| e.phase != Phase::End);
        for event in events.iter_mut() {
            event.track = threads
                .get(&(event.pid, event.tid))
                .map_or(TrackType::Other, |name| TrackType::from_thread_name(name));
        }

        Ok(TraceModel {
            events,
            threads,
            min_ts,
            max_ts,
        })
    }
}

/// Gives each Begin the duration up to its matching End on the same thread.
fn pair_begin_end(events: &mut [TraceEvent]) {
    let mut stacks: BTreeMap<(u64, u64), Vec<usize>> = BTreeMap::default();
    for i in 0..events.len() {
        let key = (events[i].pid, events[i].tid);
        match events[i].phase {
            Phase::Begin => stacks.entry(key).or_default().push(i),
            Phase::End => {
                let stack = stacks.entry(key).or_default();
                let name = &events[i].name;
                let position = if name.is_empty() {
                    stack.len().checked_sub(1)
                } else {
                    stack.iter().rposition(|&j| events[j].name == *name)
                };
                let Some(position) = position else {
                    trace!(ts = events[i].ts, name, "End without matching Begin");
                    continue;
                };
                let begin = stack[position];
                stack.truncate(position);
                events[begin].dur = Some(events[i].ts - events[begin].ts);
            }
            _ => {}
        }
    }
}

impl TraceModel {
    pub fn builder() -> TraceModelBuilder {
        TraceModelBuilder::default()
    }

    pub fn from_events(
        events: impl IntoIterator<Item = json::TraceEvent>,
    ) -> Result<Self, AnalysisError> {
        let mut builder = Self::builder();
        for event in events {
            builder.push(event);
        }
        builder.finish()
    }

    pub fn min_timestamp(&self) -> i64 {
        self.min_ts
    }

    pub fn max_timestamp(&self) -> i64 {
        self.max_ts
    }

    /// The whole recording, from the first to the last timestamp.
    pub fn global_window(&self) -> RecordWindow {
        RecordWindow::new(self.min_ts, self.max_ts)
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn thread_name(&self, pid: u64, tid: u64) -> Option<&str> {
        self.threads.get(&(pid, tid)).map(|name| &**name)
    }

    /// Events that overlap `window`, in timestamp order.
    pub fn events_overlapping(
        &self,
        window: RecordWindow,
    ) -> impl Iterator<Item = &TraceEvent> + '_ {
        let upper = match window.end {
            Some(end) => self.events.partition_point(|e| e.ts <= end),
            None => self.events.len(),
        };
        self.events[..upper]
            .iter()
            .filter(move |e| window.overlaps(e))
    }
}

#[cfg(test)]
use crate::test_util::{begin, complete, end, instant, thread_name};

#[test]
fn test_bounds_exclude_metadata() -> Result<(), AnalysisError> {
    let model = TraceModel::from_events([
        thread_name(1, 1, "CrRendererMain"),
        complete("Layout", 1, 1, 100, 40),
        instant("Marker", 1, 1, 1000),
    ])?;
    assert_eq!(model.min_timestamp(), 100);
    assert_eq!(model.max_timestamp(), 1000);
    assert_eq!(model.global_window().recording_time(model.max_timestamp()), 900);
    assert_eq!(model.events().len(), 2);
    Ok(())
}

#[test]
fn test_sort_is_stable_and_tracks_are_assigned() -> Result<(), AnalysisError> {
    let model = TraceModel::from_events([
        complete("Second", 1, 2, 50, 1),
        complete("First", 1, 1, 10, 1),
        complete("Third", 1, 1, 50, 1),
        thread_name(1, 1, "CrRendererMain"),
        thread_name(1, 2, "DedicatedWorker thread"),
    ])?;
    let names = model.events().iter().map(|e| &*e.name).collect::<Vec<_>>();
    assert_eq!(names, ["First", "Second", "Third"]);
    let tracks = model.events().iter().map(|e| e.track).collect::<Vec<_>>();
    assert_eq!(
        tracks,
        [TrackType::MainThread, TrackType::Worker, TrackType::MainThread]
    );
    assert_eq!(model.thread_name(1, 2), Some("DedicatedWorker thread"));
    Ok(())
}

#[test]
fn test_begin_end_pairing() -> Result<(), AnalysisError> {
    let model = TraceModel::from_events([
        begin("Outer", 1, 1, 0),
        begin("Inner", 1, 1, 10),
        begin("Other thread", 1, 2, 15),
        end("", 1, 1, 30),
        end("Outer", 1, 1, 100),
        begin("Unmatched", 1, 1, 120),
    ])?;
    let durations = model
        .events()
        .iter()
        .map(|e| (&*e.name, e.dur))
        .collect::<Vec<_>>();
    assert_eq!(
        durations,
        [
            ("Outer", Some(100)),
            ("Inner", Some(20)),
            ("Other thread", None),
            ("Unmatched", None),
        ]
    );
    assert_eq!(model.max_timestamp(), 120);
    Ok(())
}

#[test]
fn test_events_overlapping() -> Result<(), AnalysisError> {
    let model = TraceModel::from_events([
        complete("A", 1, 1, 0, 10),
        complete("B", 1, 1, 20, 10),
        complete("C", 1, 1, 40, 100),
        instant("D", 1, 1, 200),
    ])?;
    let names = |window| {
        model
            .events_overlapping(window)
            .map(|e| e.name.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(RecordWindow::new(5, 25)), ["A", "B"]);
    assert_eq!(names(RecordWindow::new(31, 39)), Vec::<String>::new());
    assert_eq!(names(RecordWindow::unbounded(100)), ["C", "D"]);
    // Restartable: a second pass sees the same events.
    assert_eq!(names(RecordWindow::unbounded(100)), ["C", "D"]);
    Ok(())
}

#[test]
fn test_empty_trace_is_malformed() {
    let result = TraceModel::from_events([thread_name(1, 1, "CrRendererMain")]);
    assert!(matches!(result, Err(AnalysisError::MalformedTrace(_))));
}

#[test]
fn test_window_clamping() {
    let window = RecordWindow::unbounded(5);
    assert_eq!(window.end, None);
    assert_eq!(window.recording_time(1000), 995);
    assert_eq!(RecordWindow::new(10, 50).recording_time(1000), 40);
    assert_eq!(window.to_string(), "[5, ∞)");
}
