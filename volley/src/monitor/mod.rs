//! Monitors: instrumenting calls with a set of statistics
//!
//! A [`Monitor`] owns one [`Collector`] per named statistic. Instrumented code
//! calls [`Monitor::start`] right before the work and [`MonitorContext::end`] with
//! the [`Outcome`] once it finished, which updates every statistic from a single
//! pair of calls. Loops do not need to be instrumented by hand:
//! [`Monitor::observe`] pairs the iteration events of a loop stream instead.
//!
//! [`Monitor::update`] publishes interval and cumulative snapshots to subscribers
//! and starts a new interval.
use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::Result;
use crate::executor::{LoopEvent, LoopId};
use crate::stats::{StatsGroup, Summary};

pub mod collectors;
mod group;

pub use collectors::{CallContext, Collector, CollectorParams, CollectorSpec};
pub use group::{MonitorGroup, MonitorGroupUpdate};

const UPDATE_BUFFER: usize = 64;

/// What an instrumented call reports back to the collectors.
///
/// Fields a collector has no use for can be left at their defaults: a step that
/// does not talk HTTP may only fill in `code`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Outcome {
    /// Result code, an HTTP status for HTTP steps.
    pub code: Option<u16>,
    /// Identifies what was requested, for `uniques`.
    pub key: Option<String>,
    /// Response headers with lowercase names, for `header-code`.
    pub headers: IndexMap<String, String>,
    pub request_bytes: u64,
    pub response_bytes: u64,
}

impl Outcome {
    pub fn ok() -> Self {
        Self::with_code(200)
    }

    pub fn with_code(code: u16) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }
}

/// Snapshot published by [`Monitor::update`].
#[derive(Debug, Clone, Serialize)]
pub struct MonitorUpdate {
    pub name: String,
    pub interval: StatsGroup,
    pub cumulative: StatsGroup,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub interval: IndexMap<String, Summary>,
    pub cumulative: IndexMap<String, Summary>,
}

#[derive(Debug)]
struct Inner {
    collectors: Vec<Collector>,
    in_flight: HashMap<LoopId, Vec<CallContext>>,
}

impl Inner {
    fn start(&mut self, at: Instant) -> Vec<CallContext> {
        self.collectors.iter_mut().map(|c| c.start_at(at)).collect()
    }

    fn end(&mut self, contexts: &[CallContext], outcome: &Outcome, at: Instant) {
        for (collector, ctx) in self.collectors.iter_mut().zip(contexts) {
            collector.end_at(ctx, outcome, at);
        }
    }

    fn interval(&self) -> StatsGroup {
        self.collectors
            .iter()
            .filter_map(|c| Some((c.name().to_string(), c.interval()?.clone())))
            .collect()
    }

    fn cumulative(&self) -> StatsGroup {
        self.collectors
            .iter()
            .map(|c| (c.name().to_string(), c.cumulative().clone()))
            .collect()
    }
}

/// A set of statistics fed from instrumented calls. Cloning yields another handle
/// to the same statistics.
#[derive(Debug, Clone)]
pub struct Monitor {
    name: String,
    inner: Arc<Mutex<Inner>>,
    updates: broadcast::Sender<MonitorUpdate>,
}

impl Monitor {
    pub fn new<S>(specs: impl IntoIterator<Item = S>) -> Result<Self>
    where
        S: Into<CollectorSpec>,
    {
        Self::named("", specs)
    }

    /// Unknown statistic names are rejected here, before anything runs.
    pub fn named<S>(name: impl Into<String>, specs: impl IntoIterator<Item = S>) -> Result<Self>
    where
        S: Into<CollectorSpec>,
    {
        let collectors = specs
            .into_iter()
            .map(|spec| Collector::from_spec(&spec.into()))
            .collect::<Result<Vec<_>>>()?;
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Ok(Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Inner {
                collectors,
                in_flight: HashMap::new(),
            })),
            updates,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive every snapshot published by [`Monitor::update`] from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorUpdate> {
        self.updates.subscribe()
    }

    /// Run every collector's start hook with a fresh context.
    pub fn start(&self) -> MonitorContext {
        MonitorContext {
            inner: Arc::clone(&self.inner),
            contexts: self.inner.lock().start(Instant::now()),
        }
    }

    /// Instrument a loop from its events: each iteration start opens a context that
    /// the same loop's next iteration end closes. Calls are timed with the instants
    /// carried by the events, not by when they are observed.
    pub fn observe<A>(&self, event: &LoopEvent<A, Outcome>) {
        let mut inner = self.inner.lock();
        match event {
            LoopEvent::IterationStart { id, at, .. } => {
                let contexts = inner.start(*at);
                inner.in_flight.insert(*id, contexts);
            }
            LoopEvent::IterationEnd { id, result, at } => {
                if let Some(contexts) = inner.in_flight.remove(id) {
                    inner.end(&contexts, result, *at);
                }
            }
            LoopEvent::End { id } => {
                inner.in_flight.remove(id);
            }
            LoopEvent::Start { .. } => {}
        }
    }

    pub fn interval(&self) -> StatsGroup {
        self.inner.lock().interval()
    }

    pub fn cumulative(&self) -> StatsGroup {
        self.inner.lock().cumulative()
    }

    pub fn summary(&self) -> MonitorSummary {
        let inner = self.inner.lock();
        MonitorSummary {
            interval: crate::stats::summarize(&inner.interval()),
            cumulative: crate::stats::summarize(&inner.cumulative()),
        }
    }

    /// Publish the current snapshots, then clear every interval statistic that has
    /// observations.
    pub fn update(&self) -> MonitorUpdate {
        let update = {
            let mut inner = self.inner.lock();
            let update = MonitorUpdate {
                name: self.name.clone(),
                interval: inner.interval(),
                cumulative: inner.cumulative(),
            };
            inner.collectors.iter_mut().for_each(Collector::next);
            update
        };

        // Nobody listening is fine.
        let _ = self.updates.send(update.clone());
        update
    }
}

/// Handle returned by [`Monitor::start`]; ending it runs every end hook once.
#[derive(Debug)]
pub struct MonitorContext {
    inner: Arc<Mutex<Inner>>,
    contexts: Vec<CallContext>,
}

impl MonitorContext {
    pub fn end(self, outcome: &Outcome) {
        self.inner.lock().end(&self.contexts, outcome, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::stats::Statistic;
    use serde_json::json;

    #[test]
    fn rejects_unknown_statistics() {
        assert!(matches!(
            Monitor::new(["latency", "nope"]),
            Err(Error::UnknownStatistic(_))
        ));
    }

    #[test]
    fn one_start_end_pair_feeds_every_statistic() {
        let monitor = Monitor::new(["latency", "result-codes", "uniques"]).unwrap();
        for (code, key) in [(200, "/a"), (500, "/b"), (200, "/a")] {
            let ctx = monitor.start();
            ctx.end(&Outcome {
                code: Some(code),
                key: Some(key.into()),
                ..Default::default()
            });
        }

        let cumulative = monitor.cumulative();
        assert_eq!(cumulative["latency"].len(), 3);
        assert_eq!(cumulative["result-codes"].summary()["200"], json!(2));
        assert_eq!(cumulative["uniques"].summary()["uniqs"], json!(2));

        let interval = monitor.interval();
        assert!(!interval.contains_key("uniques"));
        assert_eq!(interval["result-codes"].len(), 3);
    }

    #[tokio::test]
    async fn update_publishes_then_clears_interval() {
        let monitor = Monitor::new(["result-codes"]).unwrap();
        let mut rx = monitor.subscribe();
        monitor.start().end(&Outcome::ok());

        let published = monitor.update();
        assert_eq!(published.interval["result-codes"].len(), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.cumulative["result-codes"].len(), 1);

        assert_eq!(monitor.interval()["result-codes"].len(), 0);
        assert_eq!(monitor.cumulative()["result-codes"].len(), 1);
    }

    #[test]
    fn observe_pairs_iteration_events() {
        let monitor = Monitor::new(["result-codes", "concurrency"]).unwrap();
        let at = Instant::now();
        let events: Vec<LoopEvent<(), Outcome>> = vec![
            LoopEvent::Start { id: 1 },
            LoopEvent::IterationStart { id: 1, args: (), at },
            LoopEvent::IterationStart { id: 2, args: (), at },
            LoopEvent::IterationEnd {
                id: 1,
                result: Outcome::with_code(200),
                at,
            },
            LoopEvent::IterationEnd {
                id: 2,
                result: Outcome::with_code(503),
                at,
            },
            // without a matching start, ignored
            LoopEvent::IterationEnd {
                id: 3,
                result: Outcome::with_code(200),
                at,
            },
            LoopEvent::End { id: 1 },
        ];
        events.iter().for_each(|e| monitor.observe(e));

        let summary = monitor.summary();
        assert_eq!(summary.cumulative["result-codes"]["total"], json!(2));
        assert_eq!(summary.cumulative["result-codes"]["503"], json!(1));
        assert_eq!(summary.cumulative["concurrency"]["max"], json!(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn observed_latency_ignores_event_backlog() {
        use crate::executor::{Loop, Step, condition};
        use std::time::Duration;

        let monitor = Monitor::new(["latency"]).unwrap();
        let step = Step::new(|_: ()| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Outcome::ok()
        });
        let l = Loop::new(step, (), vec![condition::max_executions(3)], f64::INFINITY);
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        l.start(tx).unwrap().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        while let Ok(event) = rx.try_recv() {
            monitor.observe(&event);
        }
        let summary = monitor.summary();
        assert_eq!(summary.cumulative["latency"]["min"], json!(100));
        assert_eq!(summary.cumulative["latency"]["max"], json!(100));
    }
}
