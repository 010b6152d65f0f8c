use std::{
    any::Any,
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use jane_eyre::eyre::{self, eyre, OptionExt};
use rayon::ThreadPoolBuilder;
use tracing::{debug, error_span, info, warn};

use crate::{
    analyse::{analyse_file, TraceAnalysis},
    config::{BatchConfig, Ordering, Source},
    report::{write_report, ResultRow},
};

/// How often to check for timed out sources while waiting for results.
static POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one job per source on a bounded pool, emitting one row per source.
#[derive(Clone, Copy, Debug)]
pub struct BatchRunner {
    pub max_workers: usize,
    pub ordering: Ordering,
    /// Counted from when a worker starts on the source, not from submission.
    pub timeout: Option<Duration>,
}

pub fn main(args: Vec<String>) -> eyre::Result<()> {
    let batch_path = args
        .first()
        .ok_or_eyre("Usage: scripting-time batch <batch.toml>")?;
    let config = BatchConfig::load(batch_path)?;
    let settings = Arc::new(config.settings()?);
    let sources = config.sources()?;
    let runner = BatchRunner {
        max_workers: config.max_workers,
        ordering: config.ordering,
        timeout: config.timeout_secs,
    };
    info!(
        "Analysing {} sources with {} workers",
        sources.len(),
        runner.max_workers
    );

    let mut rows = vec![];
    runner.run(
        &sources,
        move |source| analyse_file(&source.path, source.format, &settings),
        |row| {
            if let Some(error) = &row.error {
                warn!(source = %row.source_id, "Failed: {error}");
            }
            rows.push(row);
        },
    )?;

    write_report(&rows, &config.output_path())
}

impl BatchRunner {
    /// Calls `emit` exactly once per source. A source that fails, panics, or
    /// times out gets a row with its error, and the batch carries on.
    ///
    /// A timed out job is not cancelled; its result is discarded when it arrives.
    pub fn run<J>(
        &self,
        sources: &[Source],
        job: J,
        mut emit: impl FnMut(ResultRow),
    ) -> eyre::Result<()>
    where
        J: Fn(&Source) -> eyre::Result<TraceAnalysis> + Send + Sync + 'static,
    {
        let total = sources.len();
        if total == 0 {
            info!("No sources");
            return Ok(());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .thread_name(|i| format!("batch-worker-{i}"))
            .build()?;
        let job = Arc::new(job);
        let started: Arc<Mutex<BTreeMap<usize, Instant>>> = Arc::default();
        let (sender, receiver) = mpsc::channel::<(usize, ResultRow)>();

        for (index, source) in sources.iter().enumerate() {
            let job = job.clone();
            let started = started.clone();
            let sender = sender.clone();
            let source = source.clone();
            pool.spawn(move || {
                let _span = error_span!("source", id = %source.id).entered();
                if let Ok(mut started) = started.lock() {
                    started.insert(index, Instant::now());
                }
                let row = match catch_unwind(AssertUnwindSafe(|| (*job)(&source))) {
                    Ok(result) => ResultRow::new(&source, result),
                    Err(payload) => ResultRow::failed(
                        &source,
                        format!("Panicked: {}", panic_message(&*payload)),
                    ),
                };
                // The receiver is gone if the batch has already given up on us.
                if sender.send((index, row)).is_err() {
                    debug!("Discarding late result");
                }
            });
        }
        drop(sender);

        let mut finished = vec![false; total];
        let mut completed = 0;
        let mut reorder_buffer = BTreeMap::default();
        let mut next = 0;
        while completed < total {
            let mut rows = vec![];
            match self.timeout {
                None => rows.push(
                    receiver
                        .recv()
                        .map_err(|_| eyre!("Workers exited without a result"))?,
                ),
                Some(timeout) => {
                    match receiver.recv_timeout(POLL_INTERVAL.min(timeout)) {
                        Ok(received) => rows.push(received),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(eyre!("Workers exited without a result"));
                        }
                    }
                    let mut started = started
                        .lock()
                        .map_err(|e| eyre!("Mutex poisoned: {e:?}"))?;
                    started.retain(|&index, start| {
                        if finished[index] {
                            return false;
                        }
                        if start.elapsed() < timeout {
                            return true;
                        }
                        let message = format!("Timed out after {}s", timeout.as_secs_f64());
                        rows.push((index, ResultRow::failed(&sources[index], message)));
                        false
                    });
                }
            }

            for (index, row) in rows {
                // Late result for a source that already timed out.
                if finished[index] {
                    continue;
                }
                finished[index] = true;
                completed += 1;
                info!(
                    "Completed {completed} of {total}, {}%",
                    completed * 100 / total
                );
                match self.ordering {
                    Ordering::Completion => emit(row),
                    Ordering::Submission => {
                        reorder_buffer.insert(index, row);
                        while let Some(row) = reorder_buffer.remove(&next) {
                            emit(row);
                            next += 1;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
use {
    crate::{
        json::TraceFormat,
        test_util::{complete, thread_name},
    },
    mktemp::Temp,
    std::{path::Path, thread::sleep},
};

#[cfg(test)]
fn sources(ids: &[&str]) -> Vec<Source> {
    ids.iter()
        .map(|id| Source {
            id: id.to_string(),
            label: format!("trace {id}"),
            path: format!("{id}.json").into(),
            format: TraceFormat::Auto,
        })
        .collect()
}

#[cfg(test)]
fn collect(
    runner: BatchRunner,
    sources: &[Source],
    job: fn(&Source) -> eyre::Result<TraceAnalysis>,
) -> eyre::Result<Vec<ResultRow>> {
    let mut rows = vec![];
    runner.run(sources, job, |row| rows.push(row))?;
    Ok(rows)
}

#[cfg(test)]
fn ids(rows: &[ResultRow]) -> Vec<&str> {
    rows.iter().map(|row| &*row.source_id).collect()
}

#[cfg(test)]
fn write_trace(path: &Path, events: &[crate::json::TraceEvent]) -> eyre::Result<()> {
    std::fs::write(path, serde_json::to_string(events)?)?;
    Ok(())
}

#[test]
fn test_malformed_source_does_not_abort_batch() -> eyre::Result<()> {
    let dir = Temp::new_dir()?;
    let events = [
        thread_name(1, 1, "CrRendererMain"),
        complete("FunctionCall", 1, 1, 0, 100),
        complete("Layout", 1, 1, 400, 100),
    ];
    write_trace(&dir.join("1.json"), &events)?;
    std::fs::write(dir.join("2.json"), "{\"traceEvents\": [")?;
    write_trace(&dir.join("3.json"), &events)?;
    let mut sources = sources(&["1", "2", "3"]);
    for source in &mut sources {
        source.path = dir.join(&source.path);
    }

    let settings = Arc::new(crate::analyse::Settings::default());
    let runner = BatchRunner {
        max_workers: 3,
        ordering: Ordering::Submission,
        timeout: None,
    };
    let mut rows = vec![];
    runner.run(
        &sources,
        move |source| analyse_file(&source.path, source.format, &settings),
        |row| rows.push(row),
    )?;

    assert_eq!(ids(&rows), ["1", "2", "3"]);
    for row in [&rows[0], &rows[2]] {
        assert_eq!(row.error, None);
        let metrics = row.metrics.as_ref().ok_or_eyre("No metrics")?;
        assert_eq!(metrics.recording_time_micros, 400);
        assert_eq!(metrics.global_scripting_time_micros, 100);
    }
    assert!(rows[1].error.is_some());
    assert_eq!(rows[1].metrics, None);
    Ok(())
}

#[cfg(test)]
fn slow_first(source: &Source) -> eyre::Result<TraceAnalysis> {
    if source.id == "1" {
        sleep(Duration::from_millis(300));
    }
    Ok(TraceAnalysis::default())
}

#[test]
fn test_submission_order_is_preserved() -> eyre::Result<()> {
    let runner = BatchRunner {
        max_workers: 2,
        ordering: Ordering::Submission,
        timeout: None,
    };
    let rows = collect(runner, &sources(&["1", "2", "3"]), slow_first)?;
    assert_eq!(ids(&rows), ["1", "2", "3"]);
    Ok(())
}

#[test]
fn test_completion_order() -> eyre::Result<()> {
    let runner = BatchRunner {
        max_workers: 2,
        ordering: Ordering::Completion,
        timeout: None,
    };
    let rows = collect(runner, &sources(&["1", "2", "3"]), slow_first)?;
    assert_eq!(ids(&rows), ["2", "3", "1"]);
    Ok(())
}

#[test]
fn test_timeout() -> eyre::Result<()> {
    let runner = BatchRunner {
        max_workers: 2,
        ordering: Ordering::Submission,
        timeout: Some(Duration::from_millis(50)),
    };
    let rows = collect(runner, &sources(&["1", "2"]), slow_first)?;
    assert_eq!(ids(&rows), ["1", "2"]);
    assert_eq!(rows[0].error.as_deref(), Some("Timed out after 0.05s"));
    assert_eq!(rows[1].error, None);
    Ok(())
}

#[test]
fn test_panic_becomes_error_row() -> eyre::Result<()> {
    let runner = BatchRunner {
        max_workers: 1,
        ordering: Ordering::Submission,
        timeout: None,
    };
    let rows = collect(runner, &sources(&["1", "2"]), |source| {
        if source.id == "1" {
            panic!("boom");
        }
        Ok(TraceAnalysis::default())
    })?;
    assert_eq!(rows[0].error.as_deref(), Some("Panicked: boom"));
    assert!(rows[1].metrics.is_some());
    Ok(())
}

#[test]
fn test_empty_batch() -> eyre::Result<()> {
    let runner = BatchRunner {
        max_workers: 1,
        ordering: Ordering::Submission,
        timeout: None,
    };
    assert!(collect(runner, &[], slow_first)?.is_empty());
    Ok(())
}

#[test]
fn test_main_writes_report() -> eyre::Result<()> {
    let dir = Temp::new_dir()?;
    write_trace(
        &dir.join("a.json"),
        &[
            thread_name(1, 1, "CrRendererMain"),
            complete("EvaluateScript", 1, 1, 0, 50),
            complete("Paint", 1, 1, 100, 10),
        ],
    )?;
    std::fs::write(
        dir.join("batch.toml"),
        "output = \"results.json\"\n[[sources]]\npath = \"a.json\"\n[[sources]]\npath = \"missing.json\"\n",
    )?;
    main(vec![dir.join("batch.toml").to_string_lossy().into_owned()])?;

    let rows: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("results.json"))?)?;
    assert_eq!(rows[0]["sourceLabel"], "a");
    assert_eq!(rows[0]["globalScriptingScorePercent"], 50.0);
    assert_eq!(rows[1]["sourceId"], "2");
    assert!(rows[1]["error"].is_string());
    assert!(dir.join("results.txt").exists());
    Ok(())
}
