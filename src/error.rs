use thiserror::Error;

use crate::model::RecordWindow;

/// Failures raised by the analysis engine itself.
///
/// A missing “scripting” branch and a WebSocket window that never closes are
/// not errors: they become zero scripting time and an unbounded window.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Malformed trace: {0}")]
    MalformedTrace(String),

    #[error("Scripting time {scripting_time}μs exceeds recording time {recording_time}μs in window {window}")]
    AggregationInvariantViolation {
        window: RecordWindow,
        scripting_time: i64,
        recording_time: i64,
    },
}

impl From<serde_json::Error> for AnalysisError {
    fn from(error: serde_json::Error) -> Self {
        Self::MalformedTrace(error.to_string())
    }
}
