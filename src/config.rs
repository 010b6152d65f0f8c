use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use jane_eyre::eyre::{self, bail, Context, OptionExt};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

use crate::{
    analyse::Settings,
    category::{CategoryRule, CategoryTable, TimeAttribution},
    interval::Signals,
    json::TraceFormat,
};

/// A batch of trace sources and how to analyse them, loaded from TOML.
#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Where the JSON report goes; a `.txt` summary is written next to it.
    pub output: PathBuf,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub ordering: Ordering,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub timeout_secs: Option<Duration>,
    #[serde(default)]
    pub attribution: TimeAttribution,
    #[serde(default)]
    pub signals: Signals,

    #[serde(default)]
    sources: Vec<SourceConfig>,
    trace_dir: Option<PathBuf>,
    categories: Option<BTreeMap<String, CategoryRule>>,
    #[serde(skip)]
    base_dir: PathBuf,
}

/// Order in which result rows are emitted.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Ordering {
    /// Same order as the sources, buffering rows that finish early.
    #[default]
    Submission,
    /// As soon as each source finishes.
    Completion,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceConfig {
    path: PathBuf,
    id: Option<String>,
    label: Option<String>,
    #[serde(default)]
    format: TraceFormat,
}

/// One trace to analyse, with its paths resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct Source {
    pub id: String,
    pub label: String,
    pub path: PathBuf,
    pub format: TraceFormat,
}

fn default_max_workers() -> usize {
    1
}

impl BatchConfig {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let mut result = String::default();
        File::open(path)
            .wrap_err("Failed to open batch file")?
            .read_to_string(&mut result)?;
        let mut result: BatchConfig = toml::from_str(&result)?;
        result.base_dir = path
            .parent()
            .map_or_else(PathBuf::default, |dir| dir.to_owned());
        if result.max_workers == 0 {
            bail!("max_workers must be at least 1");
        }

        Ok(result)
    }

    pub fn output_path(&self) -> PathBuf {
        self.base_dir.join(&self.output)
    }

    pub fn settings(&self) -> eyre::Result<Settings> {
        let categories = match &self.categories {
            Some(rules) => CategoryTable::new(rules)?,
            None => CategoryTable::default(),
        };

        Ok(Settings {
            signals: self.signals.clone(),
            categories,
            attribution: self.attribution,
        })
    }

    /// Listed sources first, then every `*.json` file in `trace_dir` by file name.
    pub fn sources(&self) -> eyre::Result<Vec<Source>> {
        let mut result = vec![];
        for source in &self.sources {
            let path = self.base_dir.join(&source.path);
            let index = result.len() + 1;
            result.push(Source {
                id: source.id.clone().unwrap_or_else(|| index.to_string()),
                label: match &source.label {
                    Some(label) => label.clone(),
                    None => file_stem(&path)?,
                },
                path,
                format: source.format,
            });
        }

        if let Some(trace_dir) = &self.trace_dir {
            let output = self.output_path();
            let mut paths = vec![];
            for entry in std::fs::read_dir(self.base_dir.join(trace_dir))
                .wrap_err("Failed to read trace_dir")?
            {
                let path = entry?.path();
                // Skip our own report, in case it is written into the same directory.
                if path == output {
                    continue;
                }
                if path.extension() == Some(OsStr::new("json")) {
                    paths.push(path);
                }
            }
            paths.sort();
            for path in paths {
                let index = result.len() + 1;
                result.push(Source {
                    id: index.to_string(),
                    label: file_stem(&path)?,
                    path,
                    format: TraceFormat::Auto,
                });
            }
        }

        Ok(result)
    }
}

fn file_stem(path: &Path) -> eyre::Result<String> {
    Ok(path
        .file_stem()
        .ok_or_eyre("Trace path has no file name")?
        .to_str()
        .ok_or_eyre("Unsupported path")?
        .to_owned())
}

#[cfg(test)]
use mktemp::Temp;

#[cfg(test)]
fn write(path: &Path, contents: &str) -> eyre::Result<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

#[test]
fn test_load_batch_config() -> eyre::Result<()> {
    let dir = Temp::new_dir()?;
    std::fs::create_dir(dir.join("out"))?;
    write(&dir.join("out/2_b.json"), "[]")?;
    write(&dir.join("out/1_a.json"), "[]")?;
    write(&dir.join("out/notes.txt"), "")?;
    write(
        &dir.join("batch.toml"),
        r#"
            output = "out/results.json"
            max_workers = 4
            ordering = "completion"
            timeout_secs = 30
            attribution = "self"
            trace_dir = "out"

            [[sources]]
            path = "extra.json"
            label = "Extra"
            format = "stream"

            [signals]
            hidden_markers = ["hidden!"]

            [categories.scripting]
            names = ["FunctionCall"]
        "#,
    )?;

    let config = BatchConfig::load(dir.join("batch.toml"))?;
    assert_eq!(config.max_workers, 4);
    assert_eq!(config.ordering, Ordering::Completion);
    assert_eq!(config.timeout_secs, Some(Duration::from_secs(30)));
    assert_eq!(config.output_path(), dir.join("out/results.json"));
    assert_eq!(config.signals.hidden_markers, ["hidden!"]);
    assert_eq!(config.signals.websocket_close, ["WebSocketDestroy"]);

    let settings = config.settings()?;
    assert_eq!(settings.attribution, TimeAttribution::SelfTime);

    let sources = config.sources()?;
    assert_eq!(
        sources,
        [
            Source {
                id: "1".to_owned(),
                label: "Extra".to_owned(),
                path: dir.join("extra.json"),
                format: TraceFormat::Stream,
            },
            Source {
                id: "2".to_owned(),
                label: "1_a".to_owned(),
                path: dir.join("out/1_a.json"),
                format: TraceFormat::Auto,
            },
            Source {
                id: "3".to_owned(),
                label: "2_b".to_owned(),
                path: dir.join("out/2_b.json"),
                format: TraceFormat::Auto,
            },
        ]
    );
    Ok(())
}

#[test]
fn test_defaults_and_rejections() -> eyre::Result<()> {
    let dir = Temp::new_dir()?;
    write(&dir.join("minimal.toml"), r#"output = "r.json""#)?;
    let config = BatchConfig::load(dir.join("minimal.toml"))?;
    assert_eq!(config.max_workers, 1);
    assert_eq!(config.ordering, Ordering::Submission);
    assert_eq!(config.timeout_secs, None);
    assert!(config.sources()?.is_empty());

    write(&dir.join("zero.toml"), "output = \"r.json\"\nmax_workers = 0")?;
    assert!(BatchConfig::load(dir.join("zero.toml")).is_err());
    write(&dir.join("typo.toml"), "output = \"r.json\"\nmax_worker = 2")?;
    assert!(BatchConfig::load(dir.join("typo.toml")).is_err());
    Ok(())
}
