use std::borrow::Cow;

use serde_json::json;
use volley_macros::stat;

use super::{Statistic, Summary, round1};
use crate::error::{Error, Result};

pub const DEFAULT_BUCKETS: usize = 3000;
pub const DEFAULT_PERCENTILES: [f64; 2] = [0.95, 0.99];

/// Distribution of small non-negative integers, typically latencies in milliseconds.
///
/// Values below `buckets` are counted in a dense array, anything larger is appended
/// to an overflow list that is only sorted when a percentile is asked for. With the
/// default 3000 buckets every latency up to three seconds costs a single increment.
#[stat]
pub struct Histogram {
    percentiles: Vec<f64>,
    buckets: Vec<u64>,
    overflow: Vec<u64>,
    len: u64,
    sum: u64,
    min: Option<u64>,
    max: Option<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS, DEFAULT_PERCENTILES.to_vec())
    }
}

impl Histogram {
    pub fn new(buckets: usize, percentiles: Vec<f64>) -> Self {
        Self {
            percentiles,
            buckets: vec![0; buckets],
            overflow: vec![],
            len: 0,
            sum: 0,
            min: None,
            max: None,
        }
    }

    /// Number of dense buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Percentiles reported by [`Statistic::summary`].
    pub fn percentiles(&self) -> &[f64] {
        &self.percentiles
    }

    pub fn put(&mut self, value: u64) {
        self.len += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));

        match self.buckets.get_mut(value as usize) {
            Some(count) => *count += 1,
            None => self.overflow.push(value),
        }
    }

    /// How many times `value` was observed.
    pub fn get(&self, value: u64) -> u64 {
        match self.buckets.get(value as usize) {
            Some(count) => *count,
            None => self.overflow.iter().filter(|v| **v == value).count() as u64,
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.min
    }

    pub fn max(&self) -> Option<u64> {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.sum as f64 / self.len as f64
    }

    /// The value below which a fraction `p` of the observations fall.
    ///
    /// Counts `floor(len * (1 - p))` observations down from the top, starting with the
    /// overflow list, and returns the first value at which that many were seen.
    pub fn percentile(&self, p: f64) -> u64 {
        self.percentile_in(&self.sorted_overflow(), p)
    }

    /// The overflow list in ascending order, sorting a copy only when values were
    /// appended out of order.
    fn sorted_overflow(&self) -> Cow<'_, [u64]> {
        if self.overflow.is_sorted() {
            Cow::Borrowed(&self.overflow)
        } else {
            let mut sorted = self.overflow.clone();
            sorted.sort_unstable();
            Cow::Owned(sorted)
        }
    }

    fn percentile_in(&self, sorted_overflow: &[u64], p: f64) -> u64 {
        let target = (self.len as f64 * (1.0 - p)).floor() as u64;
        let overflow = sorted_overflow.len() as u64;

        if overflow > target {
            return sorted_overflow[(overflow - target - 1) as usize];
        }

        let mut seen = overflow;
        for (value, count) in self.buckets.iter().enumerate().rev() {
            if *count > 0 {
                seen += count;
                if seen >= target {
                    return value as u64;
                }
            }
        }
        0
    }

    pub fn stddev(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let dense: f64 = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(value, count)| *count as f64 * (value as f64 - mean).powi(2))
            .sum();
        let sparse: f64 = self
            .overflow
            .iter()
            .map(|v| (*v as f64 - mean).powi(2))
            .sum();
        ((dense + sparse) / self.len as f64).sqrt()
    }
}

fn percentile_label(p: f64) -> String {
    let pct = (p * 100.0 * 1e6).round() / 1e6;
    format!("{pct}%")
}

impl Statistic for Histogram {
    fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|c| *c = 0);
        self.overflow.clear();
        self.len = 0;
        self.sum = 0;
        self.min = None;
        self.max = None;
    }

    fn summary(&self) -> Summary {
        let mut summary = Summary::new();
        summary.insert("min".into(), json!(self.min));
        summary.insert("max".into(), json!(self.max));
        summary.insert("avg".into(), json!(round1(self.mean())));
        let overflow = self.sorted_overflow();
        summary.insert("median".into(), json!(self.percentile_in(&overflow, 0.5)));
        for p in &self.percentiles {
            summary.insert(percentile_label(*p), json!(self.percentile_in(&overflow, *p)));
        }
        summary
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        if self.buckets.len() != other.buckets.len() {
            return Err(Error::IncompatibleHistograms {
                ours: self.buckets.len(),
                theirs: other.buckets.len(),
            });
        }

        self.len += other.len;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for (ours, theirs) in self.buckets.iter_mut().zip(other.buckets) {
            *ours += theirs;
        }
        self.overflow.extend(other.overflow);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}
