use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use typed_builder::TypedBuilder;

use super::condition::{self, Condition};
use super::profile::Profile;
use super::single::{ArgSource, Loop, LoopEvent, LoopId, Step};
use crate::error::{Error, Result};

const EVENT_BUFFER: usize = 1024;

/// Parameters of a [`MultiLoop`].
///
/// `concurrency_profile` and `rate_profile` take precedence over the flat
/// `concurrency` and `rate` values.
#[derive(TypedBuilder)]
pub struct MultiLoopSpec<A, R> {
    pub step: Step<A, R>,
    pub args: ArgSource<A>,
    #[builder(default = 1)]
    pub concurrency: usize,
    #[builder(default, setter(strip_option))]
    pub concurrency_profile: Option<Profile>,
    /// Aggregate iterations per second across all loops. Unlimited by default.
    #[builder(default = f64::INFINITY)]
    pub rate: f64,
    #[builder(default, setter(strip_option))]
    pub rate_profile: Option<Profile>,
    #[builder(default, setter(strip_option))]
    pub duration: Option<Duration>,
    /// Total iterations across all loops.
    #[builder(default, setter(strip_option))]
    pub number_of_times: Option<u64>,
}

/// Notifications emitted by a [`MultiLoop`].
#[derive(Debug, Clone, PartialEq)]
pub enum MultiLoopEvent<A, R> {
    Start,
    /// Loops created because the concurrency went up.
    Add(Vec<LoopId>),
    /// Loops stopped because the concurrency went down, or because the
    /// multi-loop was stopped.
    Remove(Vec<LoopId>),
    /// The aggregate rate changed.
    Rps(f64),
    /// Forwarded from one of the child loops.
    Loop(LoopEvent<A, R>),
    End,
}

struct Shared {
    running: AtomicBool,
    stop: Notify,
    concurrency: AtomicUsize,
}

/// Runs a variable number of [`Loop`]s that share one step, following a concurrency
/// profile and an aggregate rate profile over time.
///
/// A supervisor task owns the child loops. It re-evaluates both profiles at whole
/// elapsed seconds and sleeps until the earliest point at which either can change
/// again. When the concurrency drops, the most recently created loops are removed
/// first. Whenever the concurrency or the rate changes, each loop gets
/// `floor(rate / concurrency)` iterations per second.
pub struct MultiLoop<A, R> {
    step: Step<A, R>,
    args: ArgSource<A>,
    concurrency_profile: Profile,
    rate_profile: Profile,
    duration: Option<Duration>,
    number_of_times: Option<u64>,
    shared: Arc<Shared>,
}

impl<A, R> MultiLoop<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(spec: MultiLoopSpec<A, R>) -> Result<Self> {
        let concurrency_profile = spec
            .concurrency_profile
            .unwrap_or_else(|| Profile::flat(spec.concurrency as f64));
        if !concurrency_profile.is_finite() {
            return Err(Error::InvalidProfile("concurrency must be finite".into()));
        }
        let rate_profile = spec.rate_profile.unwrap_or_else(|| {
            Profile::flat(if spec.rate >= 0.0 {
                spec.rate
            } else {
                f64::INFINITY
            })
        });

        Ok(Self {
            step: spec.step,
            args: spec.args,
            concurrency_profile,
            rate_profile,
            duration: spec.duration.filter(|d| !d.is_zero()),
            number_of_times: spec.number_of_times.filter(|n| *n > 0),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                stop: Notify::new(),
                concurrency: AtomicUsize::new(0),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of loops currently owned by the supervisor.
    pub fn concurrency(&self) -> usize {
        self.shared.concurrency.load(Ordering::Acquire)
    }

    /// Start the supervisor. Does nothing if it is already running.
    pub fn start(&self, events: mpsc::Sender<MultiLoopEvent<A, R>>) -> Option<JoinHandle<()>> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return None;
        }

        let mut conditions = vec![];
        if let Some(times) = self.number_of_times {
            conditions.push(condition::max_executions(times));
        }
        let (child_tx, child_rx) = mpsc::channel(EVENT_BUFFER);
        let supervisor = Supervisor {
            step: self.step.clone(),
            args: self.args.clone(),
            concurrency_profile: self.concurrency_profile.clone(),
            rate_profile: self.rate_profile.clone(),
            duration: self.duration,
            conditions,
            loops: vec![],
            pending: HashSet::new(),
            concurrency: 0,
            rate: 0.0,
            started: Instant::now(),
            child_tx,
            child_rx,
            events,
            shared: Arc::clone(&self.shared),
        };
        Some(tokio::spawn(supervisor.run()))
    }

    /// Stop every child loop and end the multi-loop.
    pub fn stop(&self) {
        if self.is_running() {
            self.shared.stop.notify_one();
        }
    }
}

/// Per-loop share of the aggregate rate, truncated to whole iterations per second.
pub(crate) fn per_loop_rate(rate: f64, concurrency: usize) -> f64 {
    if concurrency == 0 {
        0.0
    } else if rate.is_infinite() {
        f64::INFINITY
    } else {
        (rate / concurrency as f64).floor()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Supervisor<A, R> {
    step: Step<A, R>,
    args: ArgSource<A>,
    concurrency_profile: Profile,
    rate_profile: Profile,
    duration: Option<Duration>,
    conditions: Vec<Condition>,
    loops: Vec<Loop<A, R>>,
    /// Loops, owned or removed, whose `End` has not been forwarded yet.
    pending: HashSet<LoopId>,
    concurrency: usize,
    rate: f64,
    started: Instant,
    child_tx: mpsc::Sender<LoopEvent<A, R>>,
    child_rx: mpsc::Receiver<LoopEvent<A, R>>,
    events: mpsc::Sender<MultiLoopEvent<A, R>>,
    shared: Arc<Shared>,
}

impl<A, R> Supervisor<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    async fn run(mut self) {
        tracing::info!("MultiLoop started.");
        self.emit(MultiLoopEvent::Start).await;

        let time_limit = self.duration.map(|d| self.started + d);
        let mut next_update = self.update().await;

        let stopped = loop {
            tokio::select! {
                _ = self.shared.stop.notified() => break true,
                _ = sleep_until_opt(time_limit) => {
                    tracing::info!("MultiLoop reached its time limit.");
                    break true;
                }
                _ = sleep_until_opt(next_update) => {
                    next_update = self.update().await;
                }
                Some(event) = self.child_rx.recv() => {
                    // Removed loops do not count towards completion.
                    if let Some(id) = self.forward(event).await
                        && self.loops.iter().any(|l| l.id() == id)
                        && !self.loops.iter().any(|l| self.pending.contains(&l.id()))
                    {
                        tracing::info!("All loops finished.");
                        break false;
                    }
                }
            }
        };

        if stopped {
            let ids: Vec<LoopId> = self.loops.iter().map(|l| l.id()).collect();
            for l in &self.loops {
                l.stop();
            }
            if !ids.is_empty() {
                self.emit(MultiLoopEvent::Remove(ids)).await;
            }
        }
        // Iterations in flight still complete and are reported before the end.
        while !self.pending.is_empty() {
            let Some(event) = self.child_rx.recv().await else {
                break;
            };
            self.forward(event).await;
        }
        self.finish().await;
    }

    /// Pass a child event on, returning the loop id when it is the loop's `End`.
    async fn forward(&mut self, event: LoopEvent<A, R>) -> Option<LoopId> {
        let ended = match &event {
            LoopEvent::End { id } => Some(*id),
            _ => None,
        };
        if let Some(id) = ended {
            self.pending.remove(&id);
        }
        self.emit(MultiLoopEvent::Loop(event)).await;
        ended
    }

    async fn finish(&mut self) {
        self.loops.clear();
        self.shared.concurrency.store(0, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        tracing::info!("MultiLoop ended.");
        self.emit(MultiLoopEvent::End).await;
    }

    async fn emit(&self, event: MultiLoopEvent<A, R>) {
        let _ = self.events.send(event).await;
    }

    /// Apply the profiles at the current whole second and return when they next
    /// need to be looked at.
    async fn update(&mut self) -> Option<Instant> {
        let now = self.started.elapsed().as_secs();
        let secs = now as f64;
        let concurrency = self.concurrency_profile.value_at(secs) as usize;
        let rate = self.rate_profile.value_at(secs);

        if concurrency < self.loops.len() {
            let removed = self.loops.split_off(concurrency);
            for l in &removed {
                l.stop();
            }
            let ids = removed.iter().map(|l| l.id()).collect();
            self.emit(MultiLoopEvent::Remove(ids)).await;
        } else if concurrency > self.loops.len() {
            let mut ids = vec![];
            for _ in self.loops.len()..concurrency {
                let l = Loop::new(
                    self.step.clone(),
                    self.args.produce(),
                    self.conditions.clone(),
                    0.0,
                );
                self.pending.insert(l.id());
                l.start(self.child_tx.clone());
                ids.push(l.id());
                self.loops.push(l);
            }
            self.emit(MultiLoopEvent::Add(ids)).await;
        }
        self.shared
            .concurrency
            .store(self.loops.len(), Ordering::Release);

        if concurrency != self.concurrency || rate != self.rate {
            let share = per_loop_rate(rate, concurrency);
            for l in &self.loops {
                l.set_rate(share);
            }
            self.concurrency = concurrency;
            self.rate = rate;
            self.emit(MultiLoopEvent::Rps(rate)).await;
        }

        let wait = match (
            self.concurrency_profile.time_to_next_change(secs),
            self.rate_profile.time_to_next_change(secs),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        wait.map(|w| self.started + Duration::from_secs(now) + w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Step<(), ()> {
        Step::new(|_| async {})
    }

    async fn collect_until_end(
        rx: &mut mpsc::Receiver<MultiLoopEvent<(), ()>>,
    ) -> Vec<MultiLoopEvent<(), ()>> {
        let mut events = vec![];
        while let Some(e) = rx.recv().await {
            let end = e == MultiLoopEvent::End;
            events.push(e);
            if end {
                break;
            }
        }
        events
    }

    #[test]
    fn rate_is_split_with_truncation() {
        assert_eq!(per_loop_rate(10.0, 3), 3.0);
        assert_eq!(per_loop_rate(2.0, 5), 0.0);
        assert!(per_loop_rate(f64::INFINITY, 4).is_infinite());
        assert_eq!(per_loop_rate(10.0, 0), 0.0);
    }

    #[test]
    fn unlimited_concurrency_is_rejected() {
        let spec = MultiLoopSpec::builder()
            .step(noop())
            .args(ArgSource::Fixed(()))
            .concurrency_profile(Profile::new([(0.0, 1.0), (5.0, f64::INFINITY)]).unwrap())
            .build();
        assert!(MultiLoop::new(spec).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn follows_concurrency_profile() {
        let spec = MultiLoopSpec::builder()
            .step(noop())
            .args(ArgSource::Fixed(()))
            .concurrency_profile(Profile::new([(0.0, 5.0), (1.0, 10.0), (2.0, 3.0)]).unwrap())
            .rate(0.0)
            .build();
        let multi = MultiLoop::new(spec).unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        multi.start(tx).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(multi.concurrency(), 5);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(multi.concurrency(), 10);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(multi.concurrency(), 3);

        multi.stop();
        let events = collect_until_end(&mut rx).await;
        let adds: Vec<&Vec<LoopId>> = events
            .iter()
            .filter_map(|e| match e {
                MultiLoopEvent::Add(ids) => Some(ids),
                _ => None,
            })
            .collect();
        let removes: Vec<&Vec<LoopId>> = events
            .iter()
            .filter_map(|e| match e {
                MultiLoopEvent::Remove(ids) => Some(ids),
                _ => None,
            })
            .collect();
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0].len(), 5);
        assert_eq!(adds[1].len(), 5);

        // The drop to 3 removes the 7 most recent loops.
        let mut created: Vec<LoopId> = adds.iter().flat_map(|ids| ids.iter().copied()).collect();
        let newest = created.split_off(3);
        assert_eq!(removes[0], &newest);
        assert_eq!(removes[1], &created);
        assert_eq!(events.first(), Some(&MultiLoopEvent::Start));
        assert!(!multi.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_ends_the_multi_loop() {
        let spec = MultiLoopSpec::builder()
            .step(noop())
            .args(ArgSource::Fixed(()))
            .concurrency(4)
            .rate(40.0)
            .duration(Duration::from_secs(2))
            .build();
        let multi = MultiLoop::new(spec).unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        let handle = multi.start(tx).unwrap();
        let events = collect_until_end(&mut rx).await;
        handle.await.unwrap();

        let iterations = events
            .iter()
            .filter(|e| matches!(e, MultiLoopEvent::Loop(LoopEvent::IterationEnd { .. })))
            .count();
        assert!((76..=84).contains(&iterations), "got {iterations}");
        assert!(events.contains(&MultiLoopEvent::Rps(40.0)));
        assert!(!multi.is_running());
    }

    #[tokio::test]
    async fn shared_iteration_budget_ends_naturally() {
        let spec = MultiLoopSpec::builder()
            .step(noop())
            .args(ArgSource::Fixed(()))
            .concurrency(3)
            .number_of_times(10)
            .build();
        let multi = MultiLoop::new(spec).unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        multi.start(tx).unwrap();
        let events = collect_until_end(&mut rx).await;

        let iterations = events
            .iter()
            .filter(|e| matches!(e, MultiLoopEvent::Loop(LoopEvent::IterationEnd { .. })))
            .count();
        assert_eq!(iterations, 10);
        assert_eq!(events.last(), Some(&MultiLoopEvent::End));
    }

    fn count(events: &[MultiLoopEvent<(), ()>]) -> (usize, usize) {
        let starts = events
            .iter()
            .filter(|e| matches!(e, MultiLoopEvent::Loop(LoopEvent::IterationStart { .. })))
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, MultiLoopEvent::Loop(LoopEvent::IterationEnd { .. })))
            .count();
        (starts, ends)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_iteration_is_reported_before_the_end() {
        for _ in 0..20 {
            let spec = MultiLoopSpec::builder()
                .step(noop())
                .args(ArgSource::Fixed(()))
                .concurrency(4)
                .number_of_times(40)
                .build();
            let multi = MultiLoop::new(spec).unwrap();
            let (tx, mut rx) = mpsc::channel(1024);
            let handle = multi.start(tx).unwrap();
            let events = collect_until_end(&mut rx).await;
            handle.await.unwrap();

            assert_eq!(count(&events), (40, 40));
            let loop_ends = events
                .iter()
                .filter(|e| matches!(e, MultiLoopEvent::Loop(LoopEvent::End { .. })))
                .count();
            assert_eq!(loop_ends, 4);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_waits_for_iterations_in_flight() {
        let step = Step::new(|_: ()| tokio::time::sleep(Duration::from_millis(100)));
        let spec = MultiLoopSpec::builder()
            .step(step)
            .args(ArgSource::Fixed(()))
            .concurrency(3)
            .build();
        let multi = MultiLoop::new(spec).unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        let handle = multi.start(tx).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        multi.stop();
        let events = collect_until_end(&mut rx).await;
        handle.await.unwrap();

        let (starts, ends) = count(&events);
        assert!(starts >= 3);
        assert_eq!(starts, ends);
        let remove = events
            .iter()
            .position(|e| matches!(e, MultiLoopEvent::Remove(_)))
            .unwrap();
        // The in-flight iterations finish after the loops were removed
        assert!(
            events[remove..]
                .iter()
                .any(|e| matches!(e, MultiLoopEvent::Loop(LoopEvent::IterationEnd { .. })))
        );
        assert!(!multi.is_running());
    }
}
