use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::Interval;
use typed_builder::TypedBuilder;

use super::{LoadTest, LoadTestEvent, StepRegistry, TestSpec};
use crate::config::{ClientConfig, DEFAULT_MONITOR_INTERVAL, NodeConfig};
use crate::error::{Error, Result};
use crate::monitor::MonitorSummary;
use crate::remote::{
    ClientError, Cluster, ClusterEvent, ClusterSpec, ClusterState, HttpServer, MethodDef,
    MethodError, OperationRegistry, SlaveContext,
};
use crate::stats::{StatsGroup, Statistic, merge_groups, summarize};

/// Worker operation starting the shipped test specifications.
pub const RUN_TESTS: &str = "runTests";
/// Worker operation stopping the running tests.
pub const STOP_TESTS: &str = "stopTests";
/// Master method receiving interval statistics from workers.
pub const SEND_STATS: &str = "sendStats";

const EVENT_BUFFER: usize = 256;

/// The worker half of a distributed load test.
///
/// `runTests` starts the specifications it receives unless tests are already
/// running, sets the worker state to `running`, pushes every interval of
/// statistics to the controller and sets the state to `done` once the tests ended.
/// `stopTests` stops them early.
pub fn load_test_operations(steps: StepRegistry, config: NodeConfig) -> OperationRegistry {
    let steps = Arc::new(steps);
    let config = Arc::new(config);
    let mut operations = OperationRegistry::new();
    operations
        .register(RUN_TESTS, move |ctx, params| {
            let (steps, config) = (Arc::clone(&steps), Arc::clone(&config));
            async move { run_tests(ctx, params, &steps, &config) }
        })
        .register(STOP_TESTS, |ctx: Arc<SlaveContext>, _| async move {
            if let Some(test) = ctx.extension::<LoadTest>() {
                test.stop();
            }
            Ok(Value::Null)
        });
    operations
}

fn run_tests(
    ctx: Arc<SlaveContext>,
    params: Vec<Value>,
    steps: &StepRegistry,
    config: &NodeConfig,
) -> std::result::Result<Value, MethodError> {
    if ctx.state() == "running" {
        tracing::warn!("Already running, ignoring new test specifications.");
        return Ok(Value::Null);
    }
    let specs = params
        .into_iter()
        .next()
        .ok_or_else(|| MethodError::from("no test specifications"))?;
    let specs: Vec<TestSpec> = serde_json::from_value(specs)?;
    let test = LoadTest::new(specs, steps, config)?;
    tracing::info!("Received remote test specifications: {:?}", test.names());

    let mut events = test.subscribe();
    ctx.set_state("running");
    ctx.insert_extension(test.clone());
    test.start()?;

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LoadTestEvent::Update { interval, .. }) => {
                    let interval = match serde_json::to_value(&interval) {
                        Ok(interval) => interval,
                        Err(e) => {
                            tracing::error!("Cannot serialize statistics: {e}");
                            continue;
                        }
                    };
                    // Awaited so the last interval lands before the state turns `done`.
                    if let Some(call) = ctx.call_master(SEND_STATS, vec![interval]) {
                        let _ = call.wait().await;
                    }
                }
                Ok(LoadTestEvent::End) => {
                    ctx.set_state("done");
                    break;
                }
                Ok(LoadTestEvent::Start) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {skipped} statistics updates.");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    Ok(Value::Null)
}

/// Parameters of a [`LoadTestCluster`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct LoadTestClusterConfig {
    /// `host:port` workers reach the controller at.
    #[builder(default, setter(strip_option, into))]
    pub master_host: Option<String>,
    pub slave_hosts: Vec<String>,
    /// Period of `update` events, also the workers' ping interval.
    #[builder(default = DEFAULT_MONITOR_INTERVAL)]
    pub update_interval: Duration,
    #[builder(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadTestClusterEvent {
    /// Every worker is running the tests.
    Start,
    /// Merged statistics of every worker, by test name.
    Update {
        interval: IndexMap<String, StatsGroup>,
        cumulative: IndexMap<String, StatsGroup>,
    },
    SlaveError {
        slave: String,
        error: Option<ClientError>,
    },
    /// The tests finished and the workers were uninstalled.
    End,
}

#[derive(Debug, Default)]
struct Aggregates {
    interval: IndexMap<String, StatsGroup>,
    cumulative: IndexMap<String, StatsGroup>,
}

struct Shared {
    stats: Mutex<Aggregates>,
    events: broadcast::Sender<LoadTestClusterEvent>,
    finished: watch::Sender<bool>,
}

impl Shared {
    fn emit(&self, event: LoadTestClusterEvent) {
        let _ = self.events.send(event);
    }

    /// Merge one worker's interval into the interval and cumulative statistics.
    fn receive_stats(&self, slave: &str, params: Vec<Value>) -> std::result::Result<Value, MethodError> {
        let interval = params
            .into_iter()
            .next()
            .ok_or_else(|| MethodError::from("no statistics"))?;
        let remote: IndexMap<String, StatsGroup> = serde_json::from_value(interval)?;
        tracing::trace!("Statistics from {slave} for {} tests.", remote.len());

        let mut stats = self.stats.lock();
        for (test, group) in remote {
            merge_groups(group.clone(), stats.interval.entry(test.clone()).or_default())?;
            merge_groups(group, stats.cumulative.entry(test).or_default())?;
        }
        Ok(Value::Null)
    }

    fn update(&self) {
        let (interval, cumulative) = {
            let mut stats = self.stats.lock();
            let snapshot = (stats.interval.clone(), stats.cumulative.clone());
            stats
                .interval
                .values_mut()
                .flat_map(|group| group.values_mut())
                .for_each(|stat| stat.clear());
            snapshot
        };
        self.emit(LoadTestClusterEvent::Update {
            interval,
            cumulative,
        });
    }
}

/// Runs test specifications on a fleet of workers and aggregates their
/// statistics.
///
/// Workers are plain nodes with the [`load_test_operations`] installed. Every
/// update interval the workers push their interval statistics, which are merged
/// per test name and per statistic.
pub struct LoadTestCluster {
    config: LoadTestClusterConfig,
    server: HttpServer,
    cluster: Mutex<Option<Arc<Cluster>>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LoadTestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTestCluster")
            .field("config", &self.config)
            .field("cluster", &*self.cluster.lock())
            .finish()
    }
}

impl LoadTestCluster {
    pub fn new(config: LoadTestClusterConfig, server: &HttpServer) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (finished, _) = watch::channel(false);
        Self {
            config,
            server: server.clone(),
            cluster: Mutex::new(None),
            shared: Arc::new(Shared {
                stats: Mutex::new(Aggregates::default()),
                events,
                finished,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoadTestClusterEvent> {
        self.shared.events.subscribe()
    }

    /// Install the workers once the transport runs, then start `specs` on all of
    /// them.
    pub fn run(&self, specs: Vec<TestSpec>) -> Result<()> {
        if specs.is_empty() {
            return Err(Error::NoTests);
        }
        let mut slot = self.cluster.lock();
        if slot.as_ref().is_some_and(|c| c.started()) {
            return Err(Error::AlreadyStarted);
        }
        let specs = serde_json::to_value(&specs)?;

        let mut spec = ClusterSpec::builder()
            .slave_hosts(self.config.slave_hosts.clone())
            .slave_methods(
                [RUN_TESTS, STOP_TESTS]
                    .into_iter()
                    .map(|name| MethodDef {
                        name: name.to_string(),
                        fun: name.to_string(),
                    })
                    .collect(),
            )
            .ping_interval(self.config.update_interval)
            .client(self.config.client.clone())
            .build();
        spec.master_host = self.config.master_host.clone();
        let cluster = Arc::new(Cluster::new(spec, &self.server));

        let shared = Arc::clone(&self.shared);
        cluster.define_master_method(SEND_STATS, move |slave, params| {
            let result = shared.receive_stats(&slave, params);
            async move { result }
        });

        *self.shared.stats.lock() = Aggregates::default();
        self.shared.finished.send_replace(false);
        let events = cluster.subscribe();
        *slot = Some(Arc::clone(&cluster));
        tokio::spawn(drive(
            Arc::clone(&self.shared),
            cluster,
            events,
            self.config.update_interval,
            specs,
        ));
        Ok(())
    }

    /// Stop the tests on every worker and uninstall them.
    pub async fn end(&self) {
        let cluster = self.cluster.lock().clone();
        if let Some(cluster) = cluster {
            end_cluster(&cluster).await;
        }
    }

    /// Resolve once the cluster ended.
    pub async fn wait(&self) {
        let mut finished = self.shared.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.lock().clone()
    }

    pub fn interval(&self) -> IndexMap<String, StatsGroup> {
        self.shared.stats.lock().interval.clone()
    }

    pub fn cumulative(&self) -> IndexMap<String, StatsGroup> {
        self.shared.stats.lock().cumulative.clone()
    }

    pub fn summary(&self) -> IndexMap<String, MonitorSummary> {
        let stats = self.shared.stats.lock();
        stats
            .cumulative
            .iter()
            .map(|(test, cumulative)| {
                let interval = stats.interval.get(test).map(summarize).unwrap_or_default();
                (
                    test.clone(),
                    MonitorSummary {
                        interval,
                        cumulative: summarize(cumulative),
                    },
                )
            })
            .collect()
    }
}

async fn end_cluster(cluster: &Cluster) {
    join_all(cluster.call(STOP_TESTS, vec![]).into_iter().map(|c| c.wait())).await;
    cluster.end().await;
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn drive(
    shared: Arc<Shared>,
    cluster: Arc<Cluster>,
    mut events: broadcast::Receiver<ClusterEvent>,
    period: Duration,
    specs: Value,
) {
    cluster.wait_for(ClusterState::Initialized).await;
    if let Err(e) = cluster.start().await {
        tracing::error!("Cannot start the load test cluster: {e}");
        shared.finished.send_replace(true);
        shared.emit(LoadTestClusterEvent::End);
        return;
    }

    let mut ticker = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClusterEvent::Start) => {
                    cluster.call(RUN_TESTS, vec![specs.clone()]);
                    if !period.is_zero() {
                        ticker = Some(tokio::time::interval_at(tokio::time::Instant::now() + period, period));
                    }
                }
                Ok(ClusterEvent::Running) => shared.emit(LoadTestClusterEvent::Start),
                Ok(ClusterEvent::Done) => {
                    ticker = None;
                    shared.update();
                    end_cluster(&cluster).await;
                }
                Ok(ClusterEvent::SlaveError { slave, error }) => {
                    shared.emit(LoadTestClusterEvent::SlaveError { slave, error });
                }
                Ok(ClusterEvent::End) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(ClusterEvent::Init | ClusterEvent::SlaveState { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {skipped} cluster events.");
                }
            },
            _ = tick(&mut ticker) => shared.update(),
        }
    }

    tracing::info!("Load test cluster finished.");
    shared.finished.send_replace(true);
    shared.emit(LoadTestClusterEvent::End);
}
