use indexmap::IndexMap;
use serde_json::json;
use tokio::time::Instant;
use volley_macros::stat;

use super::{Statistic, Summary, round1};
use crate::error::Result;

/// Running sum of observed amounts.
#[stat]
#[derive(Default)]
pub struct Accumulator {
    total: f64,
    len: u64,
}

impl Accumulator {
    pub fn put(&mut self, amount: f64) {
        self.total += amount;
        self.len += 1;
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

impl Statistic for Accumulator {
    fn clear(&mut self) {
        self.total = 0.0;
        self.len = 0;
    }

    fn summary(&self) -> Summary {
        Summary::from([("total".to_string(), json!(self.total))])
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        self.total += other.total;
        self.len += other.len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Frequency of every distinct key, such as response codes.
#[stat]
#[derive(Default)]
pub struct ResultsCounter {
    items: IndexMap<String, u64>,
    len: u64,
}

impl ResultsCounter {
    pub fn put(&mut self, key: impl Into<String>) {
        *self.items.entry(key.into()).or_default() += 1;
        self.len += 1;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.items.get(key).copied().unwrap_or_default()
    }
}

impl Statistic for ResultsCounter {
    fn clear(&mut self) {
        self.items.clear();
        self.len = 0;
    }

    fn summary(&self) -> Summary {
        let mut summary: Summary = self
            .items
            .iter()
            .map(|(key, count)| (key.clone(), json!(count)))
            .collect();
        summary.insert("total".into(), json!(self.len));
        summary
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        for (key, count) in other.items {
            *self.items.entry(key).or_default() += count;
        }
        self.len += other.len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Counts observations and how many distinct keys were among them.
#[stat]
#[derive(Default)]
pub struct Uniques {
    items: IndexMap<String, u64>,
    len: u64,
}

impl Uniques {
    pub fn put(&mut self, key: impl Into<String>) {
        *self.items.entry(key.into()).or_default() += 1;
        self.len += 1;
    }

    pub fn uniques(&self) -> usize {
        self.items.len()
    }
}

impl Statistic for Uniques {
    fn clear(&mut self) {
        self.items.clear();
        self.len = 0;
    }

    fn summary(&self) -> Summary {
        Summary::from([
            ("total".to_string(), json!(self.len)),
            ("uniqs".to_string(), json!(self.uniques())),
        ])
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        for (key, count) in other.items {
            *self.items.entry(key).or_default() += count;
        }
        self.len += other.len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Largest value observed.
#[stat]
#[derive(Default)]
pub struct Peak {
    peak: f64,
    len: u64,
}

impl Peak {
    pub fn put(&mut self, value: f64) {
        self.peak = self.peak.max(value);
        self.len += 1;
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }
}

impl Statistic for Peak {
    fn clear(&mut self) {
        self.peak = 0.0;
        self.len = 0;
    }

    fn summary(&self) -> Summary {
        Summary::from([("max".to_string(), json!(self.peak))])
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        self.peak = self.peak.max(other.peak);
        self.len += other.len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Observations per second since the last clear.
///
/// The clock is local: it is not serialized, a deserialized rate starts counting
/// from the moment it was received. Merging only adds counts, the receiver keeps
/// its own clock.
#[stat]
pub struct Rate {
    len: u64,
    #[serde(skip, default = "Instant::now")]
    since: Instant,
}

impl Default for Rate {
    fn default() -> Self {
        Self {
            len: 0,
            since: Instant::now(),
        }
    }
}

impl Rate {
    pub fn put(&mut self) {
        self.len += 1;
    }

    pub fn rps(&self) -> f64 {
        let elapsed = self.since.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        round1(self.len as f64 / elapsed)
    }
}

impl Statistic for Rate {
    fn clear(&mut self) {
        self.len = 0;
        self.since = Instant::now();
    }

    fn summary(&self) -> Summary {
        Summary::from([("rps".to_string(), json!(self.rps()))])
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        self.len += other.len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}
