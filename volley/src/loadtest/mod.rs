//! Load tests: named test specifications run against a step function
//!
//! A [`TestSpec`] describes one test: how many concurrent users, how many requests
//! per second, for how long, which statistics to collect and which registered step
//! every user runs. [`LoadTest`] runs several of them side by side, each as a
//! [`MultiLoop`] observed by a [`Monitor`], and publishes interval and cumulative
//! statistics keyed by test name.
//!
//! ```rust,no_run
//! use volley::loadtest::{LoadTest, StepRegistry, TestSpec};
//! use volley::{NodeConfig, Outcome};
//!
//! # async fn run() -> volley::Result<()> {
//! let mut steps = StepRegistry::new();
//! steps.register_fn("noop", |_| async { Outcome::ok() });
//!
//! let mut spec = TestSpec::new("smoke", "noop");
//! spec.num_users = 4;
//! spec.target_rps = Some(100.0);
//! spec.time_limit = Some(10.0);
//!
//! let test = LoadTest::run(vec![spec], &steps, &NodeConfig::default())?;
//! test.wait().await;
//! println!("{:?}", test.summary());
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use volley_macros::message;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::executor::{ArgSource, MultiLoop, MultiLoopEvent, MultiLoopSpec, Profile, Step};
use crate::monitor::{CollectorSpec, Monitor, MonitorSummary, Outcome};
use crate::stats::{Statistic, StatsGroup};

pub mod cluster;
mod http;

pub use cluster::{LoadTestCluster, LoadTestClusterConfig, LoadTestClusterEvent, load_test_operations};
pub use http::http_step;

const EVENT_BUFFER: usize = 1024;
const UPDATE_BUFFER: usize = 64;

/// A step run by every user of a test. It receives the test's `args`.
pub type TestStep = Step<Value, Outcome>;

/// Steps test specifications can refer to by name.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: IndexMap<String, TestStep>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.steps.keys()).finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `http` step, see [`http_step`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("http", http_step(reqwest::Client::new()));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, step: TestStep) -> &mut Self {
        self.steps.insert(name.into(), step);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.register(name, Step::new(f))
    }

    pub fn get(&self, name: &str) -> Result<TestStep> {
        self.steps
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStep(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

fn default_name() -> String {
    "Debug test".to_string()
}

fn default_users() -> usize {
    10
}

fn default_time_limit() -> Option<f64> {
    Some(120.0)
}

fn default_stats() -> Vec<CollectorSpec> {
    vec!["latency".into(), "result-codes".into()]
}

/// One test of a [`LoadTest`].
///
/// Profiles take precedence over the flat values: `user_profile` over
/// `num_users`, `load_profile` over `target_rps`.
#[message]
#[derive(PartialEq)]
pub struct TestSpec {
    #[serde(default = "default_name")]
    pub name: String,
    /// Concurrent users.
    #[serde(default = "default_users")]
    pub num_users: usize,
    #[serde(default)]
    pub user_profile: Option<Profile>,
    /// Aggregate requests per second, unlimited when absent.
    #[serde(default)]
    pub target_rps: Option<f64>,
    #[serde(default)]
    pub load_profile: Option<Profile>,
    /// Total requests across all users.
    #[serde(default)]
    pub num_requests: Option<u64>,
    /// Seconds, `null` for no limit.
    #[serde(default = "default_time_limit")]
    pub time_limit: Option<f64>,
    /// Seconds to wait before the test starts.
    #[serde(default)]
    pub delay: f64,
    #[serde(default = "default_stats")]
    pub stats: Vec<CollectorSpec>,
    /// Registry name of the step every user runs.
    pub step: String,
    #[serde(default)]
    pub args: Value,
}

impl TestSpec {
    pub fn new(name: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_users: default_users(),
            user_profile: None,
            target_rps: None,
            load_profile: None,
            num_requests: None,
            time_limit: default_time_limit(),
            delay: 0.0,
            stats: default_stats(),
            step: step.into(),
            args: Value::Null,
        }
    }

    fn multi_loop(&self, step: TestStep) -> Result<MultiLoop<Value, Outcome>> {
        let mut spec = MultiLoopSpec::builder()
            .step(step)
            .args(ArgSource::Fixed(self.args.clone()))
            .concurrency(self.num_users)
            .rate(self.target_rps.unwrap_or(f64::INFINITY))
            .build();
        spec.concurrency_profile = self.user_profile.clone();
        spec.rate_profile = self.load_profile.clone();
        spec.number_of_times = self.num_requests;
        spec.duration = self
            .time_limit
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);
        MultiLoop::new(spec)
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum LoadTestEvent {
    Start,
    /// Statistics of the last interval and since the start, by test name.
    Update {
        interval: IndexMap<String, StatsGroup>,
        cumulative: IndexMap<String, StatsGroup>,
    },
    /// Every test finished. Follows the final update.
    End,
}

struct Test {
    name: String,
    multi: MultiLoop<Value, Outcome>,
    monitor: Monitor,
    delay: Duration,
}

struct Inner {
    tests: Mutex<Vec<Test>>,
    monitors: Vec<Monitor>,
    interval: Duration,
    quiet: bool,
    events: broadcast::Sender<LoadTestEvent>,
    stopped: watch::Sender<bool>,
    finished: watch::Sender<bool>,
}

/// Several tests run side by side. Cloning yields another handle to the same run.
#[derive(Clone)]
pub struct LoadTest {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LoadTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTest")
            .field("tests", &self.names())
            .field("running", &self.is_running())
            .finish()
    }
}

impl LoadTest {
    /// Validate every spec and prepare the tests without starting them.
    pub fn new(specs: Vec<TestSpec>, steps: &StepRegistry, config: &NodeConfig) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::NoTests);
        }
        let tests = specs
            .iter()
            .map(|spec| {
                let step = steps.get(&spec.step)?;
                Ok(Test {
                    name: spec.name.clone(),
                    multi: spec.multi_loop(step)?,
                    monitor: Monitor::named(spec.name.clone(), spec.stats.iter().cloned())?,
                    delay: Duration::from_secs_f64(spec.delay.max(0.0)),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (events, _) = broadcast::channel(UPDATE_BUFFER);
        let (stopped, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                monitors: tests.iter().map(|t| t.monitor.clone()).collect(),
                tests: Mutex::new(tests),
                interval: config.monitor_interval,
                quiet: config.quiet,
                events,
                stopped,
                finished,
            }),
        })
    }

    /// Prepare and start the tests.
    pub fn run(specs: Vec<TestSpec>, steps: &StepRegistry, config: &NodeConfig) -> Result<Self> {
        let test = Self::new(specs, steps, config)?;
        test.start()?;
        Ok(test)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoadTestEvent> {
        self.inner.events.subscribe()
    }

    /// Start every test. A load test runs once.
    pub fn start(&self) -> Result<()> {
        let tests = std::mem::take(&mut *self.inner.tests.lock());
        if tests.is_empty() {
            return Err(Error::AlreadyStarted);
        }
        tracing::info!("Starting {} tests.", tests.len());
        let _ = self.inner.events.send(LoadTestEvent::Start);

        let mut running = JoinSet::new();
        for test in tests {
            running.spawn(run_test(test, self.inner.stopped.subscribe()));
        }
        tokio::spawn(supervise(Arc::clone(&self.inner), running));
        Ok(())
    }

    /// Stop every test. Iterations in flight still complete and are counted.
    pub fn stop(&self) {
        self.inner.stopped.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.inner.tests.lock().is_empty() && !*self.inner.finished.borrow()
    }

    /// Resolve once every test finished and the final update was published.
    pub async fn wait(&self) {
        let mut finished = self.inner.finished.subscribe();
        // The sender lives as long as `self`.
        let _ = finished.wait_for(|done| *done).await;
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .monitors
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn interval(&self) -> IndexMap<String, StatsGroup> {
        self.inner.interval_stats()
    }

    pub fn cumulative(&self) -> IndexMap<String, StatsGroup> {
        self.inner
            .monitors
            .iter()
            .map(|m| (m.name().to_string(), m.cumulative()))
            .collect()
    }

    pub fn summary(&self) -> IndexMap<String, MonitorSummary> {
        self.inner
            .monitors
            .iter()
            .map(|m| (m.name().to_string(), m.summary()))
            .collect()
    }
}

impl Inner {
    /// One line per test with its completed iterations, nothing when quiet.
    fn progress(
        &self,
        interval: &IndexMap<String, StatsGroup>,
        cumulative: &IndexMap<String, StatsGroup>,
    ) -> Vec<String> {
        if self.quiet {
            return vec![];
        }
        // Every collector that samples each call has seen all of them
        let completed = |group: Option<&StatsGroup>| {
            group
                .map(|g| g.values().map(Statistic::len).max().unwrap_or(0))
                .unwrap_or(0)
        };
        cumulative
            .iter()
            .map(|(name, group)| {
                format!(
                    "{name}: {} iterations, {} in the last interval",
                    completed(Some(group)),
                    completed(interval.get(name))
                )
            })
            .collect()
    }

    fn interval_stats(&self) -> IndexMap<String, StatsGroup> {
        self.monitors
            .iter()
            .map(|m| (m.name().to_string(), m.interval()))
            .collect()
    }

    /// Publish the statistics, then start a new interval.
    fn update(&self) {
        let mut interval = IndexMap::new();
        let mut cumulative = IndexMap::new();
        for monitor in &self.monitors {
            let update = monitor.update();
            interval.insert(update.name.clone(), update.interval);
            cumulative.insert(update.name, update.cumulative);
        }
        for line in self.progress(&interval, &cumulative) {
            tracing::info!("{line}");
        }
        let _ = self.events.send(LoadTestEvent::Update {
            interval,
            cumulative,
        });
    }
}

async fn stop_requested(stopped: &mut watch::Receiver<bool>) {
    loop {
        if *stopped.borrow_and_update() {
            return;
        }
        if stopped.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn run_test(test: Test, mut stopped: watch::Receiver<bool>) {
    if !test.delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(test.delay) => {}
            _ = stop_requested(&mut stopped) => return,
        }
    }

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    if test.multi.start(tx).is_none() {
        return;
    }
    tracing::debug!("Test {} started.", test.name);

    let mut stopping = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(MultiLoopEvent::Loop(event)) => test.monitor.observe(&event),
                Some(MultiLoopEvent::End) | None => break,
                Some(_) => {}
            },
            _ = stop_requested(&mut stopped), if !stopping => {
                stopping = true;
                test.multi.stop();
            }
        }
    }
    tracing::debug!("Test {} finished.", test.name);
}

async fn supervise(inner: Arc<Inner>, mut running: JoinSet<()>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + inner.interval, inner.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => inner.update(),
            joined = running.join_next() => match joined {
                Some(Err(e)) => tracing::error!("Test task failed: {e}"),
                Some(Ok(())) => {}
                None => break,
            },
        }
    }

    inner.update();
    tracing::info!("Done.");
    inner.finished.send_replace(true);
    let _ = inner.events.send(LoadTestEvent::End);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statistic;
    use serde_json::json;

    fn steps() -> StepRegistry {
        let mut steps = StepRegistry::new();
        steps
            .register_fn("ok", |_| async { Outcome::ok() })
            .register_fn("echo-code", |args: Value| async move {
                Outcome::with_code(args["code"].as_u64().unwrap_or(200) as u16)
            });
        steps
    }

    fn config() -> NodeConfig {
        NodeConfig::builder()
            .monitor_interval(Duration::from_millis(500))
            .build()
    }

    #[test]
    fn specs_default_like_the_classic_runner() {
        let spec: TestSpec = serde_json::from_value(json!({"step": "ok"})).unwrap();
        assert_eq!(spec, TestSpec::new("Debug test", "ok"));
        assert_eq!(spec.num_users, 10);
        assert_eq!(spec.time_limit, Some(120.0));
        assert_eq!(spec.target_rps, None);
        assert_eq!(spec.stats.len(), 2);

        let spec: TestSpec = serde_json::from_value(json!({
            "name": "ramp",
            "step": "ok",
            "userProfile": [[0, 1], [10, 20]],
            "targetRps": 50,
            "timeLimit": null,
            "stats": ["rps", {"name": "slow-responses", "threshold": 10}],
        }))
        .unwrap();
        assert_eq!(spec.user_profile.unwrap().value_at(5.0), 10.0);
        assert_eq!(spec.time_limit, None);
        assert_eq!(spec.stats[1].params.threshold, Some(10));
    }

    #[test]
    fn rejects_bad_test_sets() {
        let config = NodeConfig::default();
        assert!(matches!(
            LoadTest::new(vec![], &steps(), &config),
            Err(Error::NoTests)
        ));
        assert!(matches!(
            LoadTest::new(vec![TestSpec::new("t", "missing")], &steps(), &config),
            Err(Error::UnknownStep(_))
        ));
        let mut spec = TestSpec::new("t", "ok");
        spec.stats = vec!["bogus".into()];
        assert!(matches!(
            LoadTest::new(vec![spec], &steps(), &config),
            Err(Error::UnknownStatistic(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tests_to_completion_with_updates() {
        let mut fast = TestSpec::new("fast", "ok");
        fast.num_users = 2;
        fast.num_requests = Some(20);
        let mut failing = TestSpec::new("failing", "echo-code");
        failing.num_users = 1;
        failing.target_rps = Some(10.0);
        failing.time_limit = Some(2.0);
        failing.args = json!({"code": 503});

        let test = LoadTest::new(vec![fast, failing], &steps(), &config()).unwrap();
        let mut events = test.subscribe();
        test.start().unwrap();
        assert!(matches!(test.start(), Err(Error::AlreadyStarted)));

        assert!(matches!(events.recv().await.unwrap(), LoadTestEvent::Start));
        let mut updates = 0;
        loop {
            match events.recv().await.unwrap() {
                LoadTestEvent::Update { interval, .. } => {
                    updates += 1;
                    assert_eq!(interval.keys().collect::<Vec<_>>(), ["fast", "failing"]);
                }
                LoadTestEvent::End => break,
                LoadTestEvent::Start => panic!("started twice"),
            }
        }
        // a couple of periodic updates plus the final one
        assert!(updates >= 4, "{updates} updates");
        assert!(!test.is_running());

        let cumulative = test.cumulative();
        assert_eq!(cumulative["fast"]["result-codes"].len(), 20);
        let failing = &cumulative["failing"]["result-codes"];
        assert!((19..=21).contains(&failing.len()), "{}", failing.len());
        assert!(failing.summary().contains_key("503"));
    }

    #[tokio::test]
    async fn quiet_suppresses_progress_lines() {
        let mut spec = TestSpec::new("count", "ok");
        spec.num_users = 1;
        spec.num_requests = Some(5);
        spec.stats = vec!["latency".into(), "uniques".into()];

        let loud = LoadTest::run(vec![spec.clone()], &steps(), &config()).unwrap();
        loud.wait().await;
        let cumulative = loud.cumulative();
        let interval = loud.interval();
        assert_eq!(
            loud.inner.progress(&interval, &cumulative),
            ["count: 5 iterations, 0 in the last interval"]
        );

        let quiet_config = NodeConfig::builder().quiet(true).build();
        let quiet = LoadTest::new(vec![spec], &steps(), &quiet_config).unwrap();
        assert!(quiet.inner.progress(&interval, &cumulative).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_running_and_delayed_tests() {
        let mut running = TestSpec::new("running", "ok");
        running.num_users = 1;
        running.target_rps = Some(5.0);
        let mut delayed = TestSpec::new("delayed", "ok");
        delayed.delay = 60.0;

        let test = LoadTest::run(vec![running, delayed], &steps(), &config()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        test.stop();
        test.wait().await;

        let cumulative = test.cumulative();
        assert!(cumulative["running"]["latency"].len() >= 9);
        assert_eq!(cumulative["delayed"]["latency"].len(), 0);
    }
}
