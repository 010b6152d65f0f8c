use std::fmt::Display;

use jane_eyre::eyre::{self, OptionExt};

pub struct Analysis<RowType> {
    pub rows: Vec<RowType>,
}

#[derive(Debug, PartialEq)]
pub struct Summary<T> {
    pub n: usize,
    pub mean: T,
    pub stdev: T,
    pub min: T,
    pub max: T,
}

/// A percentage, for display purposes.
#[derive(Debug, PartialEq)]
pub struct Percent(pub f64);

impl<RowType> Analysis<RowType> {
    /// Summarises the values `getter` returns, skipping rows where it returns None.
    pub fn summary<T: Into<Option<f64>>>(
        &self,
        mut getter: impl FnMut(&RowType) -> T,
    ) -> eyre::Result<Summary<f64>> {
        let xs = self
            .rows
            .iter()
            .filter_map(|x| getter(x).into())
            .collect::<Vec<f64>>();
        let n = xs.len();
        let mean = xs.iter().sum::<f64>() / (n as f64);
        let stdev = if n > 1 {
            (xs.iter().map(|x| (x - mean).powf(2.0)).sum::<f64>() / ((n - 1) as f64)).sqrt()
        } else {
            0.0
        };
        let min = xs
            .iter()
            .cloned()
            .min_by(|p, q| p.total_cmp(q))
            .ok_or_eyre("No minimum")?;
        let max = xs
            .iter()
            .cloned()
            .max_by(|p, q| p.total_cmp(q))
            .ok_or_eyre("No maximum")?;

        Ok(Summary {
            n,
            mean,
            stdev,
            min,
            max,
        })
    }
}

impl Summary<f64> {
    pub fn percent(self) -> Summary<Percent> {
        Summary {
            n: self.n,
            mean: Percent(self.mean),
            stdev: Percent(self.stdev),
            min: Percent(self.min),
            max: Percent(self.max),
        }
    }
}

/// Values are seconds.
impl Display for Summary<f64> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={}, μ={}, s={}, min={}, max={}",
            self.n,
            fmt_seconds(self.mean),
            fmt_seconds(self.stdev),
            fmt_seconds(self.min),
            fmt_seconds(self.max),
        )
    }
}

/// Picks the largest unit that keeps the value at least 1, with up to four significant digits.
fn fmt_seconds(seconds: f64) -> String {
    let (value, unit) = [(1.0, "s"), (1e3, "ms"), (1e6, "μs")]
        .into_iter()
        .map(|(scale, unit)| (seconds * scale, unit))
        .find(|(value, _)| value.abs() >= 1.0)
        .unwrap_or((seconds * 1e9, "ns"));
    let decimals = match value.abs() {
        v if v >= 1000.0 => 0,
        v if v >= 100.0 => 1,
        v if v >= 10.0 => 2,
        _ => 3,
    };
    format!("{value:.decimals$}{unit}")
}

impl Display for Summary<Percent> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={}, μ={:.2}%, s={:.2}%, min={:.2}%, max={:.2}%",
            self.n, self.mean.0, self.stdev.0, self.min.0, self.max.0,
        )
    }
}

#[test]
fn test_summary() -> eyre::Result<()> {
    let analysis = Analysis {
        rows: vec![Some(2.0), None, Some(4.0), Some(9.0)],
    };
    let summary = analysis.summary(|x| *x)?;
    assert_eq!(summary.n, 3);
    assert_eq!(summary.mean, 5.0);
    assert_eq!(summary.stdev, 13f64.sqrt());
    assert_eq!((summary.min, summary.max), (2.0, 9.0));
    assert_eq!(
        summary.percent().to_string(),
        "n=3, μ=5.00%, s=3.61%, min=2.00%, max=9.00%"
    );

    let single = Analysis { rows: vec![0.25] }.summary(|x| *x)?;
    assert_eq!(single.stdev, 0.0);
    assert_eq!(
        single.to_string(),
        "n=1, μ=250.0ms, s=0.000ns, min=250.0ms, max=250.0ms"
    );

    let empty = Analysis::<f64> { rows: vec![] };
    assert!(empty.summary(|x| *x).is_err());
    Ok(())
}

#[test]
fn test_fmt_seconds() {
    assert_eq!(fmt_seconds(1500.0), "1500s");
    assert_eq!(fmt_seconds(2.0), "2.000s");
    assert_eq!(fmt_seconds(0.0425), "42.50ms");
    assert_eq!(fmt_seconds(0.0000025), "2.500μs");
    assert_eq!(fmt_seconds(0.0), "0.000ns");
}
