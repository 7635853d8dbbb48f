use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use typed_builder::TypedBuilder;

use super::condition::{self, Condition};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies a [`Loop`] for the lifetime of the process.
pub type LoopId = u64;

/// The asynchronous operation a loop executes on every iteration.
///
/// A step receives the loop's argument and resolves to the iteration's result.
/// Resolving plays the role of the completion callback: a step that never resolves
/// stalls its loop forever. There is no internal timeout, making sure every step
/// finishes is the caller's job.
pub struct Step<A, R>(Arc<dyn Fn(A) -> BoxFuture<'static, R> + Send + Sync>);

impl<A, R> Step<A, R> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Self(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn call(&self, args: A) -> BoxFuture<'static, R> {
        (self.0)(args)
    }
}

impl<A, R> Clone for Step<A, R> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<A, R> std::fmt::Debug for Step<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Step")
    }
}

/// Wrap a plain synchronous function so a loop can run it.
pub fn fun_loop<A, R, F>(f: F) -> Step<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
    F: Fn(A) -> R + Send + Sync + 'static,
{
    Step::new(move |args| std::future::ready(f(args)))
}

/// Wrap a step so `start(&args)` runs before every iteration and
/// `finish(&result, start_value)` runs after it.
pub fn loop_wrapper<A, R, S, Start, Finish>(step: Step<A, R>, start: Start, finish: Finish) -> Step<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
    S: Send + 'static,
    Start: Fn(&A) -> S + Send + Sync + 'static,
    Finish: Fn(&R, S) + Send + Sync + 'static,
{
    let finish = Arc::new(finish);
    Step::new(move |args: A| {
        let started = start(&args);
        let fut = step.call(args);
        let finish = Arc::clone(&finish);
        async move {
            let result = fut.await;
            finish(&result, started);
            result
        }
    })
}

/// Where a loop gets its argument from.
pub enum ArgSource<A> {
    /// Every loop receives a clone of the same value.
    Fixed(A),
    /// Called once per loop, when the loop is created.
    Factory(Arc<dyn Fn() -> A + Send + Sync>),
}

impl<A: Clone> ArgSource<A> {
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::Factory(Arc::new(f))
    }

    pub fn produce(&self) -> A {
        match self {
            Self::Fixed(args) => args.clone(),
            Self::Factory(f) => f(),
        }
    }
}

impl<A: Clone> Clone for ArgSource<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(args) => Self::Fixed(args.clone()),
            Self::Factory(f) => Self::Factory(Arc::clone(f)),
        }
    }
}

/// Notifications emitted by a running [`Loop`].
///
/// For a given loop, `IterationStart` of iteration N is always delivered before
/// `IterationEnd` of iteration N. `at` is when the loop called the step and when
/// the step resolved, independent of when the event is received.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent<A, R> {
    Start { id: LoopId },
    IterationStart { id: LoopId, args: A, at: Instant },
    IterationEnd { id: LoopId, result: R, at: Instant },
    End { id: LoopId },
}

impl<A, R> LoopEvent<A, R> {
    pub fn loop_id(&self) -> LoopId {
        match self {
            Self::Start { id }
            | Self::IterationStart { id, .. }
            | Self::IterationEnd { id, .. }
            | Self::End { id } => *id,
        }
    }
}

/// Everything needed to build a standalone [`Loop`].
#[derive(TypedBuilder)]
pub struct LoopSpec<A, R> {
    pub step: Step<A, R>,
    pub args: ArgSource<A>,
    /// Target iterations per second. Unlimited by default.
    #[builder(default = f64::INFINITY)]
    pub rate: f64,
    /// Stop after this long.
    #[builder(default, setter(strip_option))]
    pub duration: Option<Duration>,
    /// Stop after this many iterations.
    #[builder(default, setter(strip_option))]
    pub number_of_times: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
struct Control {
    rate: f64,
    stopped: bool,
}

struct Shared {
    running: AtomicBool,
    control: watch::Sender<Control>,
}

/// Repeatedly executes a [`Step`] at a bounded rate until one of its conditions
/// fails or it is stopped.
///
/// Each cycle first evaluates every condition. When all hold, the step runs and the
/// next iteration is scheduled `floor(1000 / rate)` milliseconds after the current one
/// started. Iterations never overlap: if a step takes longer than the delay, the next
/// one starts as soon as it completes. A rate of `0` suspends the loop until the rate
/// is raised, an infinite rate runs iterations back to back.
pub struct Loop<A, R> {
    id: LoopId,
    step: Step<A, R>,
    args: A,
    conditions: Vec<Condition>,
    shared: Arc<Shared>,
}

impl<A, R> Loop<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(step: Step<A, R>, args: A, conditions: Vec<Condition>, rate: f64) -> Self {
        let (control, _) = watch::channel(Control {
            rate: normalize_rate(rate),
            stopped: false,
        });
        Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            step,
            args,
            conditions,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                control,
            }),
        }
    }

    pub fn from_spec(spec: LoopSpec<A, R>) -> Self {
        let mut conditions = vec![];
        if let Some(times) = spec.number_of_times.filter(|n| *n > 0) {
            conditions.push(condition::max_executions(times));
        }
        if let Some(duration) = spec.duration.filter(|d| !d.is_zero()) {
            conditions.push(condition::time_limit(duration));
        }
        Self::new(spec.step, spec.args.produce(), conditions, spec.rate)
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn rate(&self) -> f64 {
        self.shared.control.borrow().rate
    }

    /// Change the target rate. Negative values mean unlimited. A loop suspended at
    /// rate 0 resumes immediately when the rate is raised.
    pub fn set_rate(&self, rate: f64) {
        let rate = normalize_rate(rate);
        self.shared.control.send_modify(|c| c.rate = rate);
    }

    /// Begin scheduling iterations. Does nothing if the loop is already running.
    pub fn start(&self, events: mpsc::Sender<LoopEvent<A, R>>) -> Option<JoinHandle<()>> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.shared.control.send_modify(|c| c.stopped = false);

        let task = LoopTask {
            id: self.id,
            step: self.step.clone(),
            args: self.args.clone(),
            conditions: self.conditions.clone(),
            shared: Arc::clone(&self.shared),
            control: self.shared.control.subscribe(),
            events,
        };
        Some(tokio::spawn(task.run()))
    }

    /// Mark the loop for termination. An iteration already in flight completes,
    /// no further iteration starts.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.control.send_modify(|c| c.stopped = true);
    }
}

fn normalize_rate(rate: f64) -> f64 {
    if rate >= 0.0 { rate } else { f64::INFINITY }
}

/// Delay between the starts of two iterations, `None` when the loop must wait for
/// the rate to be raised.
fn iteration_delay(rate: f64) -> Option<Duration> {
    if rate <= 0.0 {
        None
    } else if rate.is_infinite() {
        Some(Duration::ZERO)
    } else {
        Some(Duration::from_millis((1000.0 / rate).floor() as u64))
    }
}

struct LoopTask<A, R> {
    id: LoopId,
    step: Step<A, R>,
    args: A,
    conditions: Vec<Condition>,
    shared: Arc<Shared>,
    control: watch::Receiver<Control>,
    events: mpsc::Sender<LoopEvent<A, R>>,
}

impl<A, R> LoopTask<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    async fn run(mut self) {
        let id = self.id;
        tracing::debug!("Loop {id} started.");
        // A missing receiver only means nobody is observing this loop.
        let _ = self.events.send(LoopEvent::Start { id }).await;

        while self.check_conditions() {
            let Some(delay) = self.wait_for_rate().await else {
                break;
            };

            let started = Instant::now();
            let _ = self
                .events
                .send(LoopEvent::IterationStart {
                    id,
                    args: self.args.clone(),
                    at: started,
                })
                .await;
            let result = self.step.call(self.args.clone()).await;
            let _ = self
                .events
                .send(LoopEvent::IterationEnd {
                    id,
                    result,
                    at: Instant::now(),
                })
                .await;

            // A lagging iteration has already used up its delay.
            if !delay.is_zero() {
                self.wait_until(started + delay).await;
            }
        }

        self.shared.running.store(false, Ordering::Release);
        tracing::debug!("Loop {id} ended.");
        let _ = self.events.send(LoopEvent::End { id }).await;
    }

    fn check_conditions(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) && self.conditions.iter().all(|c| c())
    }

    /// Resolve to the current iteration delay, suspending while the rate is 0.
    /// `None` when the loop was stopped while suspended.
    async fn wait_for_rate(&mut self) -> Option<Duration> {
        let control = self
            .control
            .wait_for(|c| c.stopped || iteration_delay(c.rate).is_some())
            .await
            .ok()
            .map(|c| *c)?;
        if control.stopped {
            return None;
        }
        iteration_delay(control.rate)
    }

    /// Sleep until `deadline`, waking early if the loop is stopped.
    async fn wait_until(&mut self, deadline: Instant) {
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return,
                changed = self.control.changed() => {
                    if changed.is_err() || self.control.borrow().stopped {
                        return;
                    }
                }
            }
        }
    }
}
