use std::ops::Add;

use tracing::trace;

use crate::{
    category::CategoryNode,
    error::AnalysisError,
    model::RecordWindow,
};

static SCRIPTING_PATH: &'static [&'static str] = &["scripting"];

/// Recording and scripting time of a window, or of a set of windows, in μs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScriptingScore {
    pub recording_time: i64,
    pub scripting_time: i64,
}

impl ScriptingScore {
    /// Scripting time as a percentage of recording time, None for an empty window.
    pub fn percent(&self) -> Option<f64> {
        percent(self.scripting_time, self.recording_time)
    }
}

impl Add for ScriptingScore {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            recording_time: self.recording_time + other.recording_time,
            scripting_time: self.scripting_time + other.scripting_time,
        }
    }
}

pub fn percent(numerator: i64, denominator: i64) -> Option<f64> {
    (denominator != 0).then(|| numerator as f64 / denominator as f64 * 100.0)
}

/// Scores one window against the tree built for it.
///
/// An unbounded window is clamped to `max_ts` here, never earlier.
pub fn score(
    window: RecordWindow,
    tree: &CategoryNode,
    max_ts: i64,
) -> Result<ScriptingScore, AnalysisError> {
    let result = ScriptingScore {
        recording_time: window.recording_time(max_ts),
        scripting_time: tree.total_time_at(SCRIPTING_PATH),
    };
    trace!(%window, ?result, "Scored window");
    if result.scripting_time > result.recording_time {
        return Err(AnalysisError::AggregationInvariantViolation {
            window,
            scripting_time: result.scripting_time,
            recording_time: result.recording_time,
        });
    }

    Ok(result)
}

/// Scores one window whose events were split into one tree per thread.
///
/// Each thread must fit in the window on its own; their scripting times add up
/// while the recording time is counted once.
pub fn score_threads(
    window: RecordWindow,
    trees: &[CategoryNode],
    max_ts: i64,
) -> Result<ScriptingScore, AnalysisError> {
    let empty = ScriptingScore {
        recording_time: window.recording_time(max_ts),
        scripting_time: 0,
    };
    trees
        .iter()
        .map(|tree| score(window, tree, max_ts))
        .try_fold(empty, |sum, score| {
            Ok(ScriptingScore {
                scripting_time: sum.scripting_time + score?.scripting_time,
                ..sum
            })
        })
}

/// Scores each window separately and sums the results.
pub fn score_all<'tree>(
    windows: impl IntoIterator<Item = (RecordWindow, &'tree [CategoryNode])>,
    max_ts: i64,
) -> Result<ScriptingScore, AnalysisError> {
    windows
        .into_iter()
        .map(|(window, trees)| score_threads(window, trees, max_ts))
        .try_fold(ScriptingScore::default(), |sum, score| Ok(sum + score?))
}

#[cfg(test)]
use crate::{
    category::{build_tree, build_window_tree, CategoryTable, Grouping, TimeAttribution},
    model::TraceModel,
    test_util::complete,
};

#[test]
fn test_score_reads_scripting_branch() -> Result<(), AnalysisError> {
    let table = CategoryTable::default();
    let model = TraceModel::from_events([
        complete("EvaluateScript", 1, 1, 0, 250),
        complete("Layout", 1, 1, 300, 100),
        complete("Paint", 1, 1, 900, 100),
    ])?;
    let tree = build_tree(
        model.events(),
        Grouping::Category(&table),
        TimeAttribution::Inclusive,
    );
    let result = score(model.global_window(), &tree, model.max_timestamp())?;
    assert_eq!(
        result,
        ScriptingScore {
            recording_time: 900,
            scripting_time: 250,
        }
    );
    assert_eq!(result.percent().map(|p| p.round()), Some(28.0));
    Ok(())
}

#[test]
fn test_missing_scripting_branch_is_zero() -> Result<(), AnalysisError> {
    let tree = CategoryNode::new("");
    let result = score(RecordWindow::new(0, 10), &tree, 10)?;
    assert_eq!(result.scripting_time, 0);
    assert_eq!(result.percent(), Some(0.0));
    Ok(())
}

#[test]
fn test_empty_window_has_no_percent() -> Result<(), AnalysisError> {
    let result = score(RecordWindow::new(10, 10), &CategoryNode::new(""), 10)?;
    assert_eq!(result.recording_time, 0);
    assert_eq!(result.percent(), None);
    Ok(())
}

#[test]
fn test_invariant_violation_is_reported() -> Result<(), AnalysisError> {
    let table = CategoryTable::default();
    let model = TraceModel::from_events([
        complete("EvaluateScript", 1, 1, 0, 100),
        complete("FunctionCall", 1, 1, 0, 100),
        complete("Layout", 1, 1, 150, 1),
    ])?;
    let tree = build_tree(
        model.events(),
        Grouping::Category(&table),
        TimeAttribution::Inclusive,
    );
    let result = score(model.global_window(), &tree, model.max_timestamp());
    assert!(matches!(
        result,
        Err(AnalysisError::AggregationInvariantViolation {
            scripting_time: 200,
            recording_time: 150,
            ..
        })
    ));
    Ok(())
}

#[test]
fn test_score_threads_counts_recording_once() -> Result<(), AnalysisError> {
    let mut main = CategoryNode::new("");
    main.add(&["scripting"], 60);
    let mut worker = CategoryNode::new("");
    worker.add(&["scripting"], 70);
    let result = score_threads(RecordWindow::new(0, 100), &[main, worker], 100)?;
    assert_eq!(
        result,
        ScriptingScore {
            recording_time: 100,
            scripting_time: 130,
        }
    );
    Ok(())
}

#[test]
fn test_score_all_clamps_unbounded_windows() -> Result<(), AnalysisError> {
    let table = CategoryTable::default();
    let model = TraceModel::from_events([
        complete("FunctionCall", 1, 1, 10, 5),
        complete("FunctionCall", 1, 1, 600, 50),
        complete("Layout", 1, 1, 1000, 0),
    ])?;
    let windows = [RecordWindow::new(0, 100), RecordWindow::unbounded(500)];
    let trees = windows
        .iter()
        .map(|&window| {
            build_window_tree(
                model.events_overlapping(window),
                window,
                Grouping::Category(&table),
                TimeAttribution::Inclusive,
            )
        })
        .collect::<Vec<_>>();
    let result = score_all(
        windows.into_iter().zip(trees.iter().map(std::slice::from_ref)),
        model.max_timestamp(),
    )?;
    assert_eq!(
        result,
        ScriptingScore {
            recording_time: 100 + 500,
            scripting_time: 55,
        }
    );
    Ok(())
}
