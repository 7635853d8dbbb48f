//! Mergeable statistics
//!
//! Every statistic stores compact raw data (counts, sums, buckets) rather than
//! derived values, so that snapshots taken on different workers can be combined
//! with [`Statistic::merge`] and summarized afterwards.
//!
//! # Implementor notes
//! - `merge` must be **associative** and **commutative**. Controllers merge
//!   worker snapshots in whatever order they arrive.
//! - Merging is "add once per received snapshot". Delivering the same snapshot twice
//!   counts it twice.
//! - Summaries are computed on demand from the raw data.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

mod counters;
mod histogram;

pub use counters::{Accumulator, Peak, Rate, ResultsCounter, Uniques};
pub use histogram::{DEFAULT_BUCKETS, DEFAULT_PERCENTILES, Histogram};

/// Derived, human readable view of a statistic.
pub type Summary = IndexMap<String, serde_json::Value>;

/// Statistics keyed by name, in insertion order.
pub type StatsGroup = IndexMap<String, Stat>;

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Operations shared by every statistic kind.
pub trait Statistic {
    /// Forget every observation, keeping the configuration.
    fn clear(&mut self);

    fn summary(&self) -> Summary;

    /// Fold `other` into `self`.
    fn merge(&mut self, other: Self) -> Result<()>
    where
        Self: Sized;

    /// Number of observations.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One of the known statistic kinds, tagged by `type` on the wire.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "type")]
pub enum Stat {
    Histogram(Histogram),
    Accumulator(Accumulator),
    ResultsCounter(ResultsCounter),
    Uniques(Uniques),
    Peak(Peak),
    Rate(Rate),
}

macro_rules! dispatch {
    ($stat:expr, $s:ident => $body:expr) => {
        match $stat {
            Stat::Histogram($s) => $body,
            Stat::Accumulator($s) => $body,
            Stat::ResultsCounter($s) => $body,
            Stat::Uniques($s) => $body,
            Stat::Peak($s) => $body,
            Stat::Rate($s) => $body,
        }
    };
}

impl Stat {
    pub fn kind(&self) -> &'static str {
        match self {
            Stat::Histogram(_) => "Histogram",
            Stat::Accumulator(_) => "Accumulator",
            Stat::ResultsCounter(_) => "ResultsCounter",
            Stat::Uniques(_) => "Uniques",
            Stat::Peak(_) => "Peak",
            Stat::Rate(_) => "Rate",
        }
    }

    /// An empty statistic of the same kind and configuration.
    pub fn empty_like(&self) -> Stat {
        match self {
            Stat::Histogram(h) => {
                Stat::Histogram(Histogram::new(h.bucket_count(), h.percentiles().to_vec()))
            }
            Stat::Accumulator(_) => Stat::Accumulator(Accumulator::default()),
            Stat::ResultsCounter(_) => Stat::ResultsCounter(ResultsCounter::default()),
            Stat::Uniques(_) => Stat::Uniques(Uniques::default()),
            Stat::Peak(_) => Stat::Peak(Peak::default()),
            Stat::Rate(_) => Stat::Rate(Rate::default()),
        }
    }
}

impl Statistic for Stat {
    fn clear(&mut self) {
        dispatch!(self, s => s.clear())
    }

    fn summary(&self) -> Summary {
        dispatch!(self, s => s.summary())
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        match (self, other) {
            (Stat::Histogram(a), Stat::Histogram(b)) => a.merge(b),
            (Stat::Accumulator(a), Stat::Accumulator(b)) => a.merge(b),
            (Stat::ResultsCounter(a), Stat::ResultsCounter(b)) => a.merge(b),
            (Stat::Uniques(a), Stat::Uniques(b)) => a.merge(b),
            (Stat::Peak(a), Stat::Peak(b)) => a.merge(b),
            (Stat::Rate(a), Stat::Rate(b)) => a.merge(b),
            (ours, theirs) => Err(Error::IncompatibleStats {
                ours: ours.kind(),
                theirs: theirs.kind(),
            }),
        }
    }

    fn len(&self) -> u64 {
        dispatch!(self, s => s.len())
    }
}

/// A single observation, in the shape each statistic kind accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// For histograms.
    Value(u64),
    /// For accumulators and peaks.
    Amount(f64),
    /// For results counters and uniques.
    Key(String),
    /// For rates.
    Tick,
}

impl Stat {
    /// Record `sample`. Samples of a shape the kind cannot hold are ignored.
    pub fn put(&mut self, sample: &Sample) {
        match (self, sample) {
            (Stat::Histogram(h), Sample::Value(v)) => h.put(*v),
            (Stat::Accumulator(a), Sample::Amount(x)) => a.put(*x),
            (Stat::Peak(p), Sample::Amount(x)) => p.put(*x),
            (Stat::ResultsCounter(c), Sample::Key(k)) => c.put(k.as_str()),
            (Stat::Uniques(u), Sample::Key(k)) => u.put(k.as_str()),
            (Stat::Rate(r), Sample::Tick) => r.put(),
            (stat, sample) => {
                tracing::debug!("{} ignores sample {sample:?}", stat.kind());
            }
        }
    }
}

macro_rules! impl_from {
    ($($kind:ident),*) => {
        $(
            impl From<$kind> for Stat {
                fn from(stat: $kind) -> Self {
                    Stat::$kind(stat)
                }
            }
        )*
    };
}

impl_from!(Histogram, Accumulator, ResultsCounter, Uniques, Peak, Rate);

/// Merge every statistic of `source` into the same-named statistic of `target`.
///
/// Names missing from `target` are first created as empty statistics of the same
/// kind and configuration. Stops at the first incompatible pair.
pub fn merge_groups(source: StatsGroup, target: &mut StatsGroup) -> Result<()> {
    for (name, stat) in source {
        let slot = target
            .entry(name)
            .or_insert_with(|| stat.empty_like());
        slot.merge(stat)?;
    }
    Ok(())
}

/// Summaries of every statistic in a group.
pub fn summarize(group: &StatsGroup) -> IndexMap<String, Summary> {
    group
        .iter()
        .map(|(name, stat)| (name.clone(), stat.summary()))
        .collect()
}
