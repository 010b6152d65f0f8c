use std::{fmt::Write as _, fs::File, io::Write, path::Path};

use jane_eyre::eyre::{self, Context};
use serde::Serialize;
use tracing::info;

use crate::{
    analyse::TraceAnalysis,
    config::Source,
    summary::{Analysis, Summary},
};

/// One row of the report. Either `error` is set or `metrics` is.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub source_id: String,
    pub source_label: String,
    pub error: Option<String>,
    #[serde(flatten)]
    pub metrics: Option<Metrics>,
}

/// Times are in μs. Percentages are null when their denominator is zero.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub recording_time_micros: i64,
    pub global_scripting_time_micros: i64,
    pub global_scripting_score_percent: Option<f64>,
    pub background_recording_time_micros: Option<i64>,
    pub background_scripting_time_micros: Option<i64>,
    pub background_scripting_score_percent: Option<f64>,
    pub worker_scripting_time_micros: i64,
    pub worker_scripting_score_percent: Option<f64>,
    pub web_socket_recording_time_micros: i64,
    pub web_socket_scripting_time_micros: i64,
    pub web_socket_scripting_score_percent: Option<f64>,
    pub web_socket_scripting_score_percent_of_global: Option<f64>,
    pub post_message_count: usize,
    pub worker_created_count: usize,
}

impl From<&TraceAnalysis> for Metrics {
    fn from(analysis: &TraceAnalysis) -> Self {
        Self {
            recording_time_micros: analysis.global.recording_time,
            global_scripting_time_micros: analysis.global.scripting_time,
            global_scripting_score_percent: analysis.global.percent(),
            background_recording_time_micros: analysis.background.map(|s| s.recording_time),
            background_scripting_time_micros: analysis.background.map(|s| s.scripting_time),
            background_scripting_score_percent: analysis.background.and_then(|s| s.percent()),
            worker_scripting_time_micros: analysis.worker.scripting_time,
            worker_scripting_score_percent: analysis.worker.percent(),
            web_socket_recording_time_micros: analysis.websocket.recording_time,
            web_socket_scripting_time_micros: analysis.websocket.scripting_time,
            web_socket_scripting_score_percent: analysis.websocket.percent(),
            web_socket_scripting_score_percent_of_global: analysis.websocket_percent_of_global(),
            post_message_count: analysis.post_message_count,
            worker_created_count: analysis.worker_created_count,
        }
    }
}

impl ResultRow {
    pub fn new(source: &Source, result: eyre::Result<TraceAnalysis>) -> Self {
        match result {
            Ok(analysis) => Self {
                source_id: source.id.clone(),
                source_label: source.label.clone(),
                error: None,
                metrics: Some((&analysis).into()),
            },
            Err(error) => Self::failed(
                source,
                error
                    .chain()
                    .map(|cause| cause.to_string())
                    .collect::<Vec<_>>()
                    .join(": "),
            ),
        }
    }

    pub fn failed(source: &Source, error: impl Into<String>) -> Self {
        Self {
            source_id: source.id.clone(),
            source_label: source.label.clone(),
            error: Some(error.into()),
            metrics: None,
        }
    }
}

/// Writes the rows as JSON to `path`, and a plain text summary next to it.
pub fn write_report(rows: &[ResultRow], path: &Path) -> eyre::Result<()> {
    let mut file = File::create(path).wrap_err("Failed to create report")?;
    serde_json::to_writer_pretty(&mut file, rows)?;
    writeln!(file)?;
    info!("Wrote {}", path.display());

    let text_path = path.with_extension("txt");
    std::fs::write(&text_path, text_summary(rows)).wrap_err("Failed to write summary")?;
    info!("Wrote {}", text_path.display());

    Ok(())
}

pub fn text_summary(rows: &[ResultRow]) -> String {
    let analysis = Analysis {
        rows: rows.iter().filter_map(|row| row.metrics.as_ref()).collect(),
    };
    let failed = rows.iter().filter(|row| row.error.is_some());
    let mut result = String::default();

    // Writing to a String never fails.
    let _ = writeln!(
        result,
        "Sources: {} ({} succeeded, {} failed)",
        rows.len(),
        analysis.rows.len(),
        rows.len() - analysis.rows.len(),
    );
    let seconds = |micros: i64| micros as f64 / 1_000_000.0;
    let mut line = |label: &str, summary: eyre::Result<Summary<f64>>, percent: bool| {
        if let Ok(summary) = summary {
            let _ = if percent {
                writeln!(result, "{label}: {}", summary.percent())
            } else {
                writeln!(result, "{label}: {summary}")
            };
        }
    };
    line(
        "Recording time",
        analysis.summary(|m| seconds(m.recording_time_micros)),
        false,
    );
    line(
        "Global scripting time",
        analysis.summary(|m| seconds(m.global_scripting_time_micros)),
        false,
    );
    line(
        "Global scripting score",
        analysis.summary(|m| m.global_scripting_score_percent),
        true,
    );
    line(
        "Background scripting score",
        analysis.summary(|m| m.background_scripting_score_percent),
        true,
    );
    line(
        "Worker scripting score",
        analysis.summary(|m| m.worker_scripting_score_percent),
        true,
    );
    line(
        "WebSocket scripting score",
        analysis.summary(|m| m.web_socket_scripting_score_percent),
        true,
    );
    line(
        "WebSocket share of global scripting",
        analysis.summary(|m| m.web_socket_scripting_score_percent_of_global),
        true,
    );
    for row in failed {
        let _ = writeln!(
            result,
            "Failed: {} ({}): {}",
            row.source_id,
            row.source_label,
            row.error.as_deref().unwrap_or_default(),
        );
    }

    result
}

#[cfg(test)]
use crate::score::ScriptingScore;

#[cfg(test)]
fn source(id: &str) -> Source {
    Source {
        id: id.to_owned(),
        label: format!("trace {id}"),
        path: format!("{id}.json").into(),
        format: Default::default(),
    }
}

#[cfg(test)]
fn sample_analysis() -> TraceAnalysis {
    TraceAnalysis {
        global: ScriptingScore {
            recording_time: 2_000_000,
            scripting_time: 500_000,
        },
        background: None,
        worker: ScriptingScore {
            recording_time: 2_000_000,
            scripting_time: 0,
        },
        websocket: ScriptingScore::default(),
        post_message_count: 3,
        worker_created_count: 1,
    }
}

#[test]
fn test_row_serialization() -> eyre::Result<()> {
    let row = ResultRow::new(&source("1"), Ok(sample_analysis()));
    let json = serde_json::to_value(&row)?;
    assert_eq!(json["sourceId"], "1");
    assert_eq!(json["sourceLabel"], "trace 1");
    assert!(json["error"].is_null());
    assert_eq!(json["recordingTimeMicros"], 2_000_000);
    assert_eq!(json["globalScriptingScorePercent"], 25.0);
    assert!(json["backgroundRecordingTimeMicros"].is_null());
    assert_eq!(json["workerScriptingScorePercent"], 0.0);
    assert!(json["webSocketScriptingScorePercent"].is_null());
    assert_eq!(json["webSocketScriptingScorePercentOfGlobal"], 0.0);
    assert_eq!(json["postMessageCount"], 3);
    assert_eq!(json["workerCreatedCount"], 1);

    let error: eyre::Result<TraceAnalysis> = Err(eyre::eyre!("Trace contains no events"));
    let error = error.wrap_err("Failed to load trace");
    let row = ResultRow::new(&source("2"), error);
    assert_eq!(
        row.error.as_deref(),
        Some("Failed to load trace: Trace contains no events")
    );
    let json = serde_json::to_value(&row)?;
    assert_eq!(json.get("recordingTimeMicros"), None);
    Ok(())
}

#[test]
fn test_text_summary() {
    let rows = [
        ResultRow::new(&source("1"), Ok(sample_analysis())),
        ResultRow::failed(&source("2"), "Timed out"),
    ];
    let text = text_summary(&rows);
    assert!(text.starts_with("Sources: 2 (1 succeeded, 1 failed)\n"));
    assert!(text.contains("Recording time: n=1, μ=2.000s"));
    assert!(text.contains("Global scripting score: n=1, μ=25.00%"));
    assert!(!text.contains("Background scripting score"));
    assert!(text.ends_with("Failed: 2 (trace 2): Timed out\n"));
}

#[test]
fn test_write_report() -> eyre::Result<()> {
    let dir = mktemp::Temp::new_dir()?;
    let path = dir.join("results.json");
    write_report(&[ResultRow::failed(&source("1"), "Timed out")], &path)?;
    let rows: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(rows[0]["error"], "Timed out");
    assert!(dir.join("results.txt").exists());
    Ok(())
}
