use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use jane_eyre::eyre::{self, bail, Context, OptionExt};
use tracing::{debug, error_span, info, warn};

use crate::{
    category::{build_window_tree, CategoryNode, CategoryTable, Grouping, TimeAttribution},
    config::Source,
    error::AnalysisError,
    interval::{self, Signals},
    json::{read_trace, TraceFormat},
    model::{RecordWindow, TraceEvent, TraceModel, TrackType},
    report::{text_summary, ResultRow},
    score::{score_all, score_threads, ScriptingScore},
};

/// Everything that shapes how a trace is analysed, shared by all sources.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub signals: Signals,
    pub categories: CategoryTable,
    pub attribution: TimeAttribution,
}

/// Scores for every window of one trace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceAnalysis {
    /// Main thread over the whole recording.
    pub global: ScriptingScore,
    /// Main thread after the page was hidden; None if it never was.
    pub background: Option<ScriptingScore>,
    /// Worker threads over the whole recording.
    pub worker: ScriptingScore,
    /// Main thread while any WebSocket connection was open.
    pub websocket: ScriptingScore,
    pub post_message_count: usize,
    pub worker_created_count: usize,
}

impl TraceAnalysis {
    /// WebSocket scripting time as a percentage of global scripting time.
    pub fn websocket_percent_of_global(&self) -> Option<f64> {
        crate::score::percent(self.websocket.scripting_time, self.global.scripting_time)
    }
}

pub fn main(args: Vec<String>) -> eyre::Result<()> {
    let (group_by, paths) = match args.split_first() {
        Some((flag, rest)) if flag == "--group-by" => {
            let (group_by, paths) = rest
                .split_first()
                .ok_or_eyre("--group-by needs a value")?;
            (&**group_by, paths)
        }
        _ => ("category", &args[..]),
    };
    if paths.is_empty() {
        bail!("Usage: scripting-time trace [--group-by none|category|trace-category] <trace.json ...>");
    }

    let settings = Settings::default();
    let grouping = match group_by {
        "none" => Grouping::None,
        "category" => Grouping::Category(&settings.categories),
        "trace-category" => Grouping::TraceCategory,
        other => bail!("Unknown grouping: {other}"),
    };
    let mut rows = vec![];
    for (i, path) in paths.iter().enumerate() {
        let source = Source {
            id: (i + 1).to_string(),
            label: path.clone(),
            path: path.into(),
            format: TraceFormat::Auto,
        };
        let _enter = error_span!("trace", path = %path).entered();
        let result = load_model(&source.path, source.format).and_then(|model| {
            let analysis = analyse_trace(&model, &settings)?;
            log_analysis(&analysis);
            log_breakdown(&model, grouping, settings.attribution);
            Ok(analysis)
        });
        if let Err(error) = &result {
            warn!("Failed to analyse file: {error}");
        }
        rows.push(ResultRow::new(&source, result));
    }

    for line in text_summary(&rows).lines() {
        info!("{line}");
    }

    Ok(())
}

fn log_analysis(analysis: &TraceAnalysis) {
    let percent = |p: Option<f64>| p.map_or_else(|| "n/a".to_owned(), |p| format!("{p:.2}%"));
    info!(
        "Global: {}μs of {}μs ({})",
        analysis.global.scripting_time,
        analysis.global.recording_time,
        percent(analysis.global.percent())
    );
    match analysis.background {
        Some(background) => info!(
            "Background: {}μs of {}μs ({})",
            background.scripting_time,
            background.recording_time,
            percent(background.percent())
        ),
        None => info!("Background: page was never hidden"),
    }
    info!(
        "Worker: {}μs ({})",
        analysis.worker.scripting_time,
        percent(analysis.worker.percent())
    );
    info!(
        "WebSocket: {}μs of {}μs ({}, {} of global)",
        analysis.websocket.scripting_time,
        analysis.websocket.recording_time,
        percent(analysis.websocket.percent()),
        percent(analysis.websocket_percent_of_global())
    );
    info!(
        "postMessage: {}, workers created: {}",
        analysis.post_message_count, analysis.worker_created_count
    );
}

/// Logs where main thread time went over the whole recording.
fn log_breakdown(model: &TraceModel, grouping: Grouping<'_>, attribution: TimeAttribution) {
    let window = model.global_window();
    let tree = build_window_tree(
        model
            .events_overlapping(window)
            .filter(|e| e.track == TrackType::MainThread),
        window,
        grouping,
        attribution,
    );
    info!("Main thread: {}μs", tree.total_time);
    let mut stack = vec![(1, &tree)];
    while let Some((depth, node)) = stack.pop() {
        if depth > 1 {
            let indent = "  ".repeat(depth - 1);
            info!("{indent}{}: {}μs", node.name, node.total_time);
        }
        stack.extend(node.children.values().rev().map(|child| (depth + 1, child)));
    }
}

#[tracing::instrument(level = "error", skip(settings))]
pub fn analyse_file(
    path: &Path,
    format: TraceFormat,
    settings: &Settings,
) -> eyre::Result<TraceAnalysis> {
    info!("Analysing trace");
    let model = load_model(path, format)?;

    Ok(analyse_trace(&model, settings)?)
}

pub fn load_model(path: &Path, format: TraceFormat) -> eyre::Result<TraceModel> {
    let file = File::open(path).wrap_err("Failed to open trace")?;
    let mut builder = TraceModel::builder();
    read_trace(BufReader::new(file), format, |event| builder.push(event))?;
    let model = builder.finish()?;
    debug!(
        events = model.events().len(),
        min_ts = model.min_timestamp(),
        max_ts = model.max_timestamp(),
        "Loaded trace"
    );

    Ok(model)
}

pub fn analyse_trace(
    model: &TraceModel,
    settings: &Settings,
) -> Result<TraceAnalysis, AnalysisError> {
    let intervals = interval::track(&settings.signals, model.events());
    let max_ts = model.max_timestamp();
    let global_window = model.global_window();
    let trees = |window, track| thread_trees(model, window, track, settings);

    let global = score_threads(
        global_window,
        &trees(global_window, TrackType::MainThread),
        max_ts,
    )?;
    debug!(?global, "Global");
    let worker = score_threads(
        global_window,
        &trees(global_window, TrackType::Worker),
        max_ts,
    )?;
    debug!(?worker, "Worker");
    let background = intervals
        .background
        .map(|window| score_threads(window, &trees(window, TrackType::MainThread), max_ts))
        .transpose()?;
    debug!(?background, "Background");
    let websocket_trees = intervals
        .websocket
        .iter()
        .map(|&window| (window, trees(window, TrackType::MainThread)))
        .collect::<Vec<_>>();
    let websocket = score_all(
        websocket_trees
            .iter()
            .map(|(window, trees)| (*window, &trees[..])),
        max_ts,
    )?;
    debug!(?websocket, windows = websocket_trees.len(), "WebSocket");

    Ok(TraceAnalysis {
        global,
        background,
        worker,
        websocket,
        post_message_count: intervals.post_message_count,
        worker_created_count: intervals.worker_created_count,
    })
}

/// One tree per thread of `track`, from the events overlapping `window` clipped to it.
fn thread_trees(
    model: &TraceModel,
    window: RecordWindow,
    track: TrackType,
    settings: &Settings,
) -> Vec<CategoryNode> {
    let mut by_thread: BTreeMap<(u64, u64), Vec<&TraceEvent>> = BTreeMap::default();
    for event in model
        .events_overlapping(window)
        .filter(|e| e.track == track)
    {
        by_thread
            .entry((event.pid, event.tid))
            .or_default()
            .push(event);
    }

    by_thread
        .into_iter()
        .map(|((pid, tid), events)| {
            let tree = build_window_tree(
                events,
                window,
                Grouping::Category(&settings.categories),
                settings.attribution,
            );
            debug!(
                %window,
                thread = model.thread_name(pid, tid),
                total = tree.total_time,
                "Built tree"
            );
            tree
        })
        .collect()
}

#[cfg(test)]
use crate::test_util::{complete, thread_name, time_stamp, websocket};

#[cfg(test)]
fn sample_trace() -> Vec<crate::json::TraceEvent> {
    vec![
        thread_name(1, 1, "CrRendererMain"),
        thread_name(1, 2, "DedicatedWorker thread"),
        thread_name(1, 3, "Compositor"),
        complete("EvaluateScript", 1, 1, 0, 100),
        time_stamp("postMessage", 50),
        complete("FunctionCall", 1, 2, 100, 200),
        websocket("WebSocketReceiveHandshakeResponse", 1, 200),
        complete("TimerFire", 1, 1, 250, 100),
        complete("Layout", 1, 1, 400, 50),
        websocket("WebSocketDestroy", 1, 500),
        time_stamp("Page hidden", 600),
        complete("RasterTask", 1, 3, 600, 300),
        complete("FunctionCall", 1, 1, 700, 100),
        time_stamp("postMessage", 750),
        complete("Paint", 1, 1, 1000, 10),
    ]
}

#[test]
fn test_analyse_trace() -> eyre::Result<()> {
    let model = TraceModel::from_events(sample_trace())?;
    let result = analyse_trace(&model, &Settings::default())?;
    assert_eq!(
        result,
        TraceAnalysis {
            global: ScriptingScore {
                recording_time: 1000,
                scripting_time: 300,
            },
            background: Some(ScriptingScore {
                recording_time: 400,
                scripting_time: 100,
            }),
            worker: ScriptingScore {
                recording_time: 1000,
                scripting_time: 200,
            },
            websocket: ScriptingScore {
                recording_time: 300,
                scripting_time: 100,
            },
            post_message_count: 2,
            worker_created_count: 0,
        }
    );
    assert_eq!(result.websocket_percent_of_global().map(|p| p.round()), Some(33.0));
    Ok(())
}

#[test]
fn test_no_background_signal() -> eyre::Result<()> {
    let events = sample_trace()
        .into_iter()
        .filter(|e| {
            e.args
                .get("data")
                .and_then(|data| data.get("message"))
                .and_then(|message| message.as_str())
                != Some("Page hidden")
        })
        .collect::<Vec<_>>();
    let model = TraceModel::from_events(events)?;
    let result = analyse_trace(&model, &Settings::default())?;
    assert_eq!(result.background, None);
    assert_eq!(result.global.recording_time, 1000);
    Ok(())
}

#[test]
fn test_unterminated_websocket_window_is_clamped() -> eyre::Result<()> {
    let model = TraceModel::from_events([
        thread_name(1, 1, "CrRendererMain"),
        complete("Layout", 1, 1, 0, 5),
        websocket("WebSocketReceiveHandshakeResponse", 3, 5),
        complete("FunctionCall", 1, 1, 900, 100),
        complete("Layout", 1, 1, 1000, 5),
    ])?;
    let result = analyse_trace(&model, &Settings::default())?;
    assert_eq!(
        result.websocket,
        ScriptingScore {
            recording_time: 995,
            scripting_time: 100,
        }
    );
    Ok(())
}

#[test]
fn test_main() -> eyre::Result<()> {
    let dir = mktemp::Temp::new_dir()?;
    let path = dir.join("trace.json");
    std::fs::write(&path, serde_json::to_string(&sample_trace())?)?;
    let missing = dir.join("missing.json");
    let path = path.to_string_lossy().into_owned();
    main(vec![path.clone(), missing.to_string_lossy().into_owned()])?;
    for grouping in ["none", "trace-category"] {
        main(vec!["--group-by".to_owned(), grouping.to_owned(), path.clone()])?;
    }
    assert!(main(vec!["--group-by".to_owned(), "thread".to_owned(), path]).is_err());
    assert!(main(vec!["--group-by".to_owned()]).is_err());
    assert!(main(vec![]).is_err());
    Ok(())
}

#[test]
fn test_task_straddling_window_start_is_clipped() -> eyre::Result<()> {
    let model = TraceModel::from_events([
        thread_name(1, 1, "CrRendererMain"),
        complete("EvaluateScript", 1, 1, 0, 900),
        time_stamp("Page hidden", 600),
        websocket("WebSocketReceiveHandshakeResponse", 4, 200),
        websocket("WebSocketDestroy", 4, 300),
        complete("Layout", 1, 1, 1000, 5),
    ])?;
    let result = analyse_trace(&model, &Settings::default())?;
    assert_eq!(
        result.global,
        ScriptingScore {
            recording_time: 1000,
            scripting_time: 900,
        }
    );
    assert_eq!(
        result.background,
        Some(ScriptingScore {
            recording_time: 400,
            scripting_time: 300,
        })
    );
    assert_eq!(
        result.websocket,
        ScriptingScore {
            recording_time: 100,
            scripting_time: 100,
        }
    );
    Ok(())
}

#[test]
fn test_self_attribution_for_nested_scripting() -> eyre::Result<()> {
    let model = TraceModel::from_events([
        thread_name(1, 1, "CrRendererMain"),
        complete("EventDispatch", 1, 1, 0, 600),
        complete("FunctionCall", 1, 1, 1, 598),
        complete("Layout", 1, 1, 1000, 5),
    ])?;
    assert!(matches!(
        analyse_trace(&model, &Settings::default()),
        Err(AnalysisError::AggregationInvariantViolation {
            scripting_time: 1198,
            ..
        })
    ));

    let settings = Settings {
        attribution: TimeAttribution::SelfTime,
        ..Default::default()
    };
    let result = analyse_trace(&model, &settings)?;
    assert_eq!(result.global.scripting_time, 600);
    Ok(())
}

#[test]
fn test_analyse_file_reports_missing_file() {
    let result = analyse_file(
        Path::new("/nonexistent/trace.json"),
        TraceFormat::Auto,
        &Settings::default(),
    );
    assert!(result.is_err());
}
