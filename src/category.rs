use std::collections::{BTreeMap, HashMap};

use jane_eyre::eyre::{self, bail};
use serde::Deserialize;

use crate::model::{RecordWindow, TraceEvent};

static SCRIPTING_NAMES: &'static str = "EvaluateScript FunctionCall TimerFire EventDispatch FireAnimationFrame FireIdleCallback RunMicrotasks v8.compile v8.execute V8.Execute v8.run XHRReadyStateChange XHRLoad TimeStamp ConsoleTime";
static GC_NAMES: &'static str =
    "MinorGC MajorGC GCEvent BlinkGC.AtomicPhase V8.GCScavenger V8.GCCompactor";
static GC_TRACE_CATEGORIES: &'static str = "disabled-by-default-v8.gc";
static RENDERING_NAMES: &'static str = "UpdateLayoutTree RecalculateStyles Layout UpdateLayerTree HitTest ScrollLayer ParseAuthorStyleSheet";
static PAINTING_NAMES: &'static str = "Paint PaintImage PaintSetup CompositeLayers RasterTask Rasterize DecodeImage ResizeImage Layerize PrePaint";
static LOADING_NAMES: &'static str =
    "ParseHTML ResourceSendRequest ResourceReceiveResponse ResourceReceivedData ResourceFinish";
static OTHER: &'static str = "other";

/// Event names and trace categories that map to one category path.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CategoryRule {
    pub names: Vec<String>,
    pub trace_categories: Vec<String>,
}

/// Maps events to category paths such as `scripting` or `scripting/gc`.
///
/// Event names are checked first, then the event's declared trace categories
/// in declaration order. Anything else is `other`.
#[derive(Clone, Debug)]
pub struct CategoryTable {
    by_name: HashMap<String, Vec<String>>,
    by_trace_category: HashMap<String, Vec<String>>,
    other: Vec<String>,
}

/// How events are placed in the tree.
#[derive(Clone, Copy, Debug)]
pub enum Grouping<'table> {
    /// Everything lands on the root.
    None,
    /// Paths come from a [CategoryTable].
    Category(&'table CategoryTable),
    /// The first declared trace category, verbatim.
    TraceCategory,
}

/// How much of an event's duration is credited to its category.
///
/// The default table puts wrappers such as `EventDispatch` and the calls
/// nested inside them (`FunctionCall`, `v8.execute`) all under `scripting`.
/// Inclusive attribution counts that time once per level, so real Chrome
/// traces usually need `SelfTime` to stay within the recording time.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum TimeAttribution {
    /// The full duration, even when nested inside another counted event.
    #[default]
    #[serde(rename = "inclusive")]
    Inclusive,
    /// The duration minus that of events nested inside it on the same thread.
    #[serde(rename = "self")]
    SelfTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CategoryNode {
    pub name: String,
    /// Inclusive of all descendants.
    pub total_time: i64,
    pub children: BTreeMap<String, CategoryNode>,
}

impl CategoryTable {
    pub fn new(rules: &BTreeMap<String, CategoryRule>) -> eyre::Result<Self> {
        let mut by_name = HashMap::default();
        let mut by_trace_category = HashMap::default();
        for (path, rule) in rules {
            let path = split_path(path);
            if path.is_empty() {
                bail!("Category path must not be empty");
            }
            for name in &rule.names {
                if let Some(previous) = by_name.insert(name.clone(), path.clone()) {
                    bail!(
                        "Event name {name} is in both {} and {}",
                        previous.join("/"),
                        path.join("/")
                    );
                }
            }
            for cat in &rule.trace_categories {
                if let Some(previous) = by_trace_category.insert(cat.clone(), path.clone()) {
                    bail!(
                        "Trace category {cat} is in both {} and {}",
                        previous.join("/"),
                        path.join("/")
                    );
                }
            }
        }

        Ok(Self {
            by_name,
            by_trace_category,
            other: vec![OTHER.to_owned()],
        })
    }

    pub fn default_rules() -> BTreeMap<String, CategoryRule> {
        let rule = |names: &str, trace_categories: &str| CategoryRule {
            names: names.split_whitespace().map(str::to_owned).collect(),
            trace_categories: trace_categories
                .split_whitespace()
                .map(str::to_owned)
                .collect(),
        };
        [
            ("scripting", rule(SCRIPTING_NAMES, "")),
            ("scripting/gc", rule(GC_NAMES, GC_TRACE_CATEGORIES)),
            ("rendering", rule(RENDERING_NAMES, "")),
            ("painting", rule(PAINTING_NAMES, "")),
            ("loading", rule(LOADING_NAMES, "")),
        ]
        .into_iter()
        .map(|(path, rule)| (path.to_owned(), rule))
        .collect()
    }

    pub fn lookup(&self, event: &TraceEvent) -> &[String] {
        if let Some(path) = self.by_name.get(&event.name) {
            return path;
        }
        event
            .categories
            .iter()
            .find_map(|cat| self.by_trace_category.get(cat))
            .unwrap_or(&self.other)
    }
}

impl Default for CategoryTable {
    fn default() -> Self {
        Self::new(&Self::default_rules()).expect("Default rules are consistent")
    }
}

impl Grouping<'_> {
    pub fn path<'a>(&'a self, event: &'a TraceEvent) -> Vec<&'a str> {
        match self {
            Grouping::None => vec![],
            Grouping::Category(table) => table.lookup(event).iter().map(|p| &**p).collect(),
            Grouping::TraceCategory => {
                vec![event.categories.first().map_or(OTHER, |cat| &**cat)]
            }
        }
    }
}

impl CategoryNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            total_time: 0,
            children: BTreeMap::default(),
        }
    }

    pub fn find(&self, path: &[&str]) -> Option<&CategoryNode> {
        let mut node = self;
        for &name in path {
            node = node.children.get(name)?;
        }
        Some(node)
    }

    /// Total time at `path`, or zero if nothing was attributed there.
    pub fn total_time_at(&self, path: &[&str]) -> i64 {
        self.find(path).map_or(0, |node| node.total_time)
    }

    /// Credits `time` to the node at `path` and every node above it.
    pub fn add(&mut self, path: &[&str], time: i64) {
        let mut node = self;
        node.total_time = node.total_time.saturating_add(time);
        for &name in path {
            node = node
                .children
                .entry(name.to_owned())
                .or_insert_with(|| CategoryNode::new(name));
            node.total_time = node.total_time.saturating_add(time);
        }
    }
}

/// An event's contribution to a tree: the part of it inside the window.
struct Span<'event> {
    event: &'event TraceEvent,
    start: i64,
    end: i64,
}

impl<'event> Span<'event> {
    fn new(event: &'event TraceEvent, start: i64, end: i64) -> Self {
        Self {
            event,
            start,
            end: end.max(start),
        }
    }

    fn len(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

/// Builds a fresh attribution tree from events with a duration, each credited in full.
pub fn build_tree<'event>(
    events: impl IntoIterator<Item = &'event TraceEvent>,
    grouping: Grouping<'_>,
    attribution: TimeAttribution,
) -> CategoryNode {
    let spans = events
        .into_iter()
        .filter(|e| e.dur.is_some())
        .map(|e| Span::new(e, e.ts, e.end()))
        .collect();
    build(spans, grouping, attribution)
}

/// Builds a fresh attribution tree for `window`, crediting only the part of
/// each event that falls inside it.
///
/// An unbounded window clips event starts only.
pub fn build_window_tree<'event>(
    events: impl IntoIterator<Item = &'event TraceEvent>,
    window: RecordWindow,
    grouping: Grouping<'_>,
    attribution: TimeAttribution,
) -> CategoryNode {
    let spans = events
        .into_iter()
        .filter(|e| e.dur.is_some())
        .map(|e| {
            let end = window.end.map_or(e.end(), |end| e.end().min(end));
            Span::new(e, e.ts.max(window.start), end)
        })
        .collect();
    build(spans, grouping, attribution)
}

fn build(
    spans: Vec<Span<'_>>,
    grouping: Grouping<'_>,
    attribution: TimeAttribution,
) -> CategoryNode {
    let times: Vec<i64> = match attribution {
        TimeAttribution::Inclusive => spans.iter().map(Span::len).collect(),
        TimeAttribution::SelfTime => self_times(&spans),
    };

    let mut root = CategoryNode::new("");
    for (span, time) in spans.iter().zip(times) {
        root.add(&grouping.path(span.event), time);
    }
    root
}

/// Subtracts each span's nested children on the same thread from its length.
fn self_times(spans: &[Span<'_>]) -> Vec<i64> {
    let mut result = spans.iter().map(Span::len).collect::<Vec<_>>();

    let mut by_thread: BTreeMap<(u64, u64), Vec<usize>> = BTreeMap::default();
    for (i, span) in spans.iter().enumerate() {
        by_thread
            .entry((span.event.pid, span.event.tid))
            .or_default()
            .push(i);
    }
    for mut indices in by_thread.into_values() {
        // Parents before children when they start together.
        indices.sort_by(|&p, &q| {
            spans[p]
                .start
                .cmp(&spans[q].start)
                .then(spans[q].end.cmp(&spans[p].end))
        });
        let mut stack: Vec<usize> = vec![];
        for i in indices {
            let span = &spans[i];
            while stack
                .last()
                .is_some_and(|&parent| spans[parent].end <= span.start)
            {
                stack.pop();
            }
            if let Some(&parent) = stack.last() {
                let nested = span.end.min(spans[parent].end).saturating_sub(span.start);
                result[parent] -= nested.max(0);
            }
            stack.push(i);
        }
    }

    result.into_iter().map(|time| time.max(0)).collect()
}

fn split_path(path: &str) -> Vec<String> {
    path.split("/")
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
use crate::{
    model::TraceModel,
    test_util::{complete, instant, with_cat},
};

#[test]
fn test_flat_root_sums_all_durations() -> eyre::Result<()> {
    let model = TraceModel::from_events([
        complete("EvaluateScript", 1, 1, 0, 100),
        complete("FunctionCall", 1, 1, 10, 50),
        complete("Layout", 1, 2, 20, 30),
        instant("TimeStamp", 1, 1, 40),
    ])?;
    let tree = build_tree(model.events(), Grouping::None, TimeAttribution::Inclusive);
    assert_eq!(tree.total_time, 180);
    assert!(tree.children.is_empty());
    // Rebuilding from the same input gives the same tree.
    assert_eq!(
        build_tree(model.events(), Grouping::None, TimeAttribution::Inclusive),
        tree
    );
    Ok(())
}

#[test]
fn test_category_grouping() -> eyre::Result<()> {
    let table = CategoryTable::default();
    let model = TraceModel::from_events([
        complete("EvaluateScript", 1, 1, 0, 100),
        complete("MinorGC", 1, 1, 10, 20),
        complete("Layout", 1, 1, 200, 30),
        complete("Mystery", 1, 1, 300, 7),
        with_cat(
            complete("Collect", 1, 1, 400, 5),
            "devtools.timeline,disabled-by-default-v8.gc",
        ),
    ])?;
    let tree = build_tree(
        model.events(),
        Grouping::Category(&table),
        TimeAttribution::Inclusive,
    );
    assert_eq!(tree.total_time, 162);
    assert_eq!(tree.total_time_at(&["scripting"]), 125);
    assert_eq!(tree.total_time_at(&["scripting", "gc"]), 25);
    assert_eq!(tree.total_time_at(&["rendering"]), 30);
    assert_eq!(tree.total_time_at(&["other"]), 7);
    assert_eq!(tree.total_time_at(&["painting"]), 0);
    assert!(tree.find(&["painting"]).is_none());
    Ok(())
}

#[test]
fn test_first_declared_trace_category_wins() -> eyre::Result<()> {
    let rules = [
        (
            "scripting".to_owned(),
            CategoryRule {
                names: vec![],
                trace_categories: vec!["v8".to_owned()],
            },
        ),
        (
            "loading".to_owned(),
            CategoryRule {
                names: vec![],
                trace_categories: vec!["netlog".to_owned()],
            },
        ),
    ]
    .into_iter()
    .collect();
    let table = CategoryTable::new(&rules)?;
    let model = TraceModel::from_events([
        with_cat(complete("A", 1, 1, 0, 10), "netlog,v8"),
        with_cat(complete("B", 1, 1, 20, 10), "v8,netlog"),
    ])?;
    let tree = build_tree(
        model.events(),
        Grouping::Category(&table),
        TimeAttribution::Inclusive,
    );
    assert_eq!(tree.total_time_at(&["loading"]), 10);
    assert_eq!(tree.total_time_at(&["scripting"]), 10);

    let tree = build_tree(
        model.events(),
        Grouping::TraceCategory,
        TimeAttribution::Inclusive,
    );
    assert_eq!(tree.total_time_at(&["netlog"]), 10);
    assert_eq!(tree.total_time_at(&["v8"]), 10);
    Ok(())
}

#[test]
fn test_self_time_does_not_double_count_nesting() -> eyre::Result<()> {
    let table = CategoryTable::default();
    let model = TraceModel::from_events([
        complete("EvaluateScript", 1, 1, 0, 100),
        complete("FunctionCall", 1, 1, 10, 50),
        complete("Layout", 1, 1, 20, 10),
        // Same timestamps on another thread are independent.
        complete("FunctionCall", 1, 2, 10, 50),
    ])?;
    let inclusive = build_tree(
        model.events(),
        Grouping::Category(&table),
        TimeAttribution::Inclusive,
    );
    assert_eq!(inclusive.total_time_at(&["scripting"]), 200);

    let self_time = build_tree(
        model.events(),
        Grouping::Category(&table),
        TimeAttribution::SelfTime,
    );
    assert_eq!(self_time.total_time_at(&["scripting"]), 50 + 40 + 50);
    assert_eq!(self_time.total_time_at(&["rendering"]), 10);
    assert_eq!(self_time.total_time, 150);
    Ok(())
}

#[test]
fn test_duplicate_rules_are_rejected() {
    let rules = [
        (
            "scripting".to_owned(),
            CategoryRule {
                names: vec!["Layout".to_owned()],
                trace_categories: vec![],
            },
        ),
        (
            "rendering".to_owned(),
            CategoryRule {
                names: vec!["Layout".to_owned()],
                trace_categories: vec![],
            },
        ),
    ]
    .into_iter()
    .collect();
    assert!(CategoryTable::new(&rules).is_err());
}

#[test]
fn test_window_tree_clips_events_to_window() -> eyre::Result<()> {
    let table = CategoryTable::default();
    let model = TraceModel::from_events([
        complete("EvaluateScript", 1, 1, 0, 100),
        complete("FunctionCall", 1, 1, 10, 80),
        complete("TimerFire", 1, 1, 150, 100),
        complete("Layout", 1, 1, 300, 10),
    ])?;
    let tree = |window, attribution| {
        build_window_tree(
            model.events_overlapping(window),
            window,
            Grouping::Category(&table),
            attribution,
        )
    };

    let bounded = tree(RecordWindow::new(50, 200), TimeAttribution::Inclusive);
    assert_eq!(bounded.total_time_at(&["scripting"]), 50 + 40 + 50);
    let bounded = tree(RecordWindow::new(50, 200), TimeAttribution::SelfTime);
    assert_eq!(bounded.total_time_at(&["scripting"]), 10 + 40 + 50);

    let unbounded = tree(RecordWindow::unbounded(200), TimeAttribution::Inclusive);
    assert_eq!(unbounded.total_time_at(&["scripting"]), 50);
    assert_eq!(unbounded.total_time_at(&["rendering"]), 10);
    Ok(())
}

#[test]
fn test_huge_durations_saturate() -> eyre::Result<()> {
    let model = TraceModel::from_events([
        complete("A", 1, 1, 10, i64::MAX),
        complete("B", 1, 2, 20, i64::MAX),
    ])?;
    let tree = build_tree(model.events(), Grouping::None, TimeAttribution::Inclusive);
    assert_eq!(tree.total_time, i64::MAX);
    let tree = build_tree(model.events(), Grouping::None, TimeAttribution::SelfTime);
    assert_eq!(tree.total_time, i64::MAX);
    Ok(())
}
