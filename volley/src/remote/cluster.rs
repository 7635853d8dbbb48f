use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use typed_builder::TypedBuilder;

use super::client::PendingCall;
use super::endpoint::Endpoint;
use super::error::{ClientError, MethodError};
use super::node::{MethodDef, UPDATE_STATE_METHOD};
use super::slave::{MasterInfo, Slave, SlaveEvent};
use super::transport::HttpServer;
use crate::config::{ClientConfig, DEFAULT_PING_INTERVAL};
use crate::error::{Error, Result};

const EVENT_BUFFER: usize = 1024;
/// A slave that stays silent for this many ping intervals is declared dead.
const LIVENESS_PINGS: u32 = 4;

const RUNNING: &str = "running";
const DONE: &str = "done";

/// Parameters of a [`Cluster`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClusterSpec {
    /// `host:port` workers reach the controller at. Defaults to the address the
    /// controller's transport is bound to.
    #[builder(default, setter(strip_option, into))]
    pub master_host: Option<String>,
    /// `host` or `host:port` of every worker.
    #[builder(default)]
    pub slave_hosts: Vec<String>,
    /// Methods installed on every worker, see [`Slave::define_method`].
    #[builder(default)]
    pub slave_methods: Vec<MethodDef>,
    #[builder(default = DEFAULT_PING_INTERVAL)]
    pub ping_interval: Duration,
    #[builder(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Waiting for the transport to listen.
    Initializing,
    Initialized,
    /// Every worker accepted its installation.
    Started,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    /// The cluster can be started.
    Init,
    Start,
    /// A worker reported a new state.
    SlaveState { slave: String, state: String },
    /// Every live worker reports `running`.
    Running,
    /// Every live worker reports `done`.
    Done,
    /// A call to the worker failed, or, with no error, the worker stopped
    /// reporting.
    SlaveError {
        slave: String,
        error: Option<ClientError>,
    },
    End,
}

#[derive(Debug)]
struct SlaveStatus {
    alive: bool,
    alive_since_last_check: bool,
    state: Option<String>,
}

impl Default for SlaveStatus {
    fn default() -> Self {
        Self {
            alive: true,
            alive_since_last_check: false,
            state: None,
        }
    }
}

struct Shared {
    slaves: IndexMap<String, Slave>,
    status: Mutex<IndexMap<String, SlaveStatus>>,
    fired: Mutex<HashSet<&'static str>>,
    state: watch::Sender<ClusterState>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Shared {
    fn emit(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }

    fn update_slave_state(&self, id: &str, state: String) {
        let mut status = self.status.lock();
        let Some(entry) = status.get_mut(id) else {
            tracing::warn!("Ignoring message from unexpected slave instance {id}.");
            return;
        };
        entry.alive_since_last_check = true;
        entry.alive = true;
        if entry.state.as_deref() == Some(state.as_str()) {
            return;
        }
        entry.state = Some(state.clone());

        let phase = match state.as_str() {
            RUNNING => Some(RUNNING),
            DONE => Some(DONE),
            _ => None,
        };
        self.emit(ClusterEvent::SlaveState {
            slave: id.to_string(),
            state,
        });
        if let Some(event) = phase.and_then(|phase| self.converged(&status, phase)) {
            self.emit(event);
        }
    }

    /// The phase event, if every live slave reached `phase` and it was not
    /// reported yet.
    fn converged(
        &self,
        status: &IndexMap<String, SlaveStatus>,
        phase: &'static str,
    ) -> Option<ClusterEvent> {
        let mut alive = status.values().filter(|s| s.alive).peekable();
        alive.peek()?;
        if !alive.all(|s| s.state.as_deref() == Some(phase)) {
            return None;
        }
        if !self.fired.lock().insert(phase) {
            return None;
        }
        tracing::info!("All slaves are {phase}.");
        Some(if phase == RUNNING {
            ClusterEvent::Running
        } else {
            ClusterEvent::Done
        })
    }

    fn check_liveness(&self) {
        let mut status = self.status.lock();
        let mut dead = vec![];
        for (id, s) in status.iter_mut() {
            if s.alive && !s.alive_since_last_check {
                s.alive = false;
                dead.push(id.clone());
            } else if s.alive_since_last_check {
                s.alive_since_last_check = false;
                s.alive = true;
            }
        }
        if dead.is_empty() {
            return;
        }

        for slave in dead {
            tracing::warn!("Slave {slave} stopped responding.");
            self.emit(ClusterEvent::SlaveError { slave, error: None });
        }
        // The rest of the fleet may be waiting on nobody now.
        for phase in [RUNNING, DONE] {
            if let Some(event) = self.converged(&status, phase) {
                self.emit(event);
            }
        }
    }
}

/// Controller of a fleet of workers.
///
/// The cluster installs a master endpoint on the controller's transport and one
/// worker endpoint per host through [`Slave`]s. Workers report their state to the
/// master every ping interval; the cluster turns those reports into
/// [`ClusterEvent::Running`] and [`ClusterEvent::Done`] once every live worker
/// agrees, and declares workers dead after four silent ping intervals.
///
/// ```text
/// Initializing -> Initialized -> Started -> Stopping -> Stopped
/// ```
///
/// Worker failures are reported as [`ClusterEvent::SlaveError`] and never stop the
/// cluster. Must be created within a Tokio runtime.
pub struct Cluster {
    server: HttpServer,
    master: Endpoint<Shared>,
    ping_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.state())
            .field("master", &self.master)
            .field("slaves", &self.slave_ids())
            .finish()
    }
}

impl Cluster {
    pub fn new(spec: ClusterSpec, server: &HttpServer) -> Self {
        let slaves: IndexMap<String, Slave> = spec
            .slave_hosts
            .iter()
            .map(|host| {
                let slave = Slave::new(None, host, spec.ping_interval, spec.client.clone());
                for method in &spec.slave_methods {
                    slave.define_method(method.name.clone(), method.fun.clone());
                }
                (slave.id().to_string(), slave)
            })
            .collect();
        let status = slaves
            .keys()
            .map(|id| (id.clone(), SlaveStatus::default()))
            .collect();

        let initial = if server.running() {
            ClusterState::Initialized
        } else {
            ClusterState::Initializing
        };
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Shared {
            slaves,
            status: Mutex::new(status),
            fired: Mutex::new(HashSet::new()),
            state,
            events,
        };

        let master = Endpoint::new(server, shared, spec.master_host);
        master.define_method(UPDATE_STATE_METHOD, |shared: Arc<Shared>, params| async move {
            match (params.first().and_then(Value::as_str), params.get(1)) {
                (Some(id), Some(Value::String(state))) => {
                    shared.update_slave_state(id, state.clone());
                    Ok(Value::Null)
                }
                _ => Err(MethodError::from("expected slave id and state")),
            }
        });

        let init = {
            let server = server.clone();
            let shared = Arc::clone(master.context());
            tokio::spawn(async move {
                server.wait_started().await;
                shared.state.send_if_modified(|state| {
                    let initializing = *state == ClusterState::Initializing;
                    if initializing {
                        *state = ClusterState::Initialized;
                    }
                    initializing
                });
                shared.emit(ClusterEvent::Init);
            })
        };

        Self {
            server: server.clone(),
            master,
            ping_interval: spec.ping_interval,
            tasks: Mutex::new(vec![init]),
        }
    }

    /// Define a master method workers can call. `f` gets the id of the calling
    /// worker and the call parameters.
    pub fn define_master_method<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, MethodError>> + Send + 'static,
    {
        self.master.define_method(name, move |_, params| {
            let mut params = params.into_iter();
            let slave = match params.next() {
                Some(Value::String(id)) => id,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            f(slave, params.collect())
        });
    }

    /// Install `name` on every worker, implemented by the registered operation `fun`.
    /// Only effective before [`Cluster::start`].
    pub fn define_slave_method(&self, name: impl Into<String>, fun: impl Into<String>) {
        let (name, fun) = (name.into(), fun.into());
        for slave in self.shared().slaves.values() {
            slave.define_method(name.clone(), fun.clone());
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        self.master.context()
    }

    pub fn state(&self) -> ClusterState {
        *self.shared().state.borrow()
    }

    pub fn started(&self) -> bool {
        self.state() == ClusterState::Started
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.shared().events.subscribe()
    }

    /// Resolve once the cluster reached `state`.
    pub async fn wait_for(&self, state: ClusterState) {
        let mut rx = self.shared().state.subscribe();
        // The sender lives in the master endpoint, which outlives this call.
        let _ = rx.wait_for(|s| *s == state).await;
    }

    pub fn slave_ids(&self) -> Vec<String> {
        self.shared().slaves.keys().cloned().collect()
    }

    pub fn slave(&self, id: &str) -> Option<&Slave> {
        self.shared().slaves.get(id)
    }

    /// Whether the slave delivered a heartbeat recently enough.
    pub fn is_alive(&self, id: &str) -> Option<bool> {
        self.shared().status.lock().get(id).map(|s| s.alive)
    }

    /// Last state the slave reported.
    pub fn slave_state(&self, id: &str) -> Option<String> {
        self.shared()
            .status
            .lock()
            .get(id)
            .and_then(|s| s.state.clone())
    }

    /// Install the master endpoint and every worker. Returns once the
    /// installations are under way; [`ClusterEvent::Start`] follows when all of
    /// them succeeded.
    pub async fn start(&self) -> Result<()> {
        if !self.server.running() {
            return Err(Error::TransportNotRunning);
        }
        if !matches!(
            self.state(),
            ClusterState::Initializing | ClusterState::Initialized
        ) {
            return Err(Error::AlreadyStarted);
        }

        self.master
            .start()
            .await
            .map_err(|e| Error::Setup(e.to_string()))?;
        let master = MasterInfo {
            url: self.master.url().ok_or(Error::TransportNotRunning)?,
            methods: self.master.method_names(),
        };

        let shared = Arc::clone(self.shared());
        shared.fired.lock().clear();
        for status in shared.status.lock().values_mut() {
            *status = SlaveStatus::default();
        }

        let mut tasks = self.tasks.lock();
        for slave in shared.slaves.values() {
            tasks.push(forward_slave_errors(slave, shared.events.clone()));
        }
        tasks.push(tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                let results = join_all(shared.slaves.values().map(|s| s.start(Some(&master)))).await;
                if results.iter().all(|r| r.is_ok()) {
                    shared.state.send_replace(ClusterState::Started);
                    tracing::info!("Cluster started with {} slaves.", results.len());
                    shared.emit(ClusterEvent::Start);
                }
            }
        }));

        let period = self.ping_interval * LIVENESS_PINGS;
        if !period.is_zero() {
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    shared.check_liveness();
                }
            }));
        }
        Ok(())
    }

    /// Call a method on every worker.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Vec<PendingCall> {
        self.shared()
            .slaves
            .values()
            .map(|s| s.call(method, args.clone()))
            .collect()
    }

    /// Remove every worker endpoint and the master endpoint. Workers that cannot
    /// be reached are reported and skipped.
    pub async fn end(&self) {
        let shared = Arc::clone(self.shared());
        shared.state.send_replace(ClusterState::Stopping);
        tracing::info!("Cluster stopping.");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        // Error forwarders were just aborted, so teardown failures are reported here.
        let mut receivers: Vec<_> = shared
            .slaves
            .values()
            .map(|s| (s.id().to_string(), s.subscribe()))
            .collect();
        join_all(shared.slaves.values().map(Slave::end)).await;
        for (slave, rx) in &mut receivers {
            while let Ok(event) = rx.try_recv() {
                if let SlaveEvent::Error(error) = event {
                    shared.emit(ClusterEvent::SlaveError {
                        slave: slave.clone(),
                        error: Some(error),
                    });
                }
            }
        }

        self.master.end();
        shared.state.send_replace(ClusterState::Stopped);
        tracing::info!("Cluster stopped.");
        shared.emit(ClusterEvent::End);
    }
}

fn forward_slave_errors(slave: &Slave, events: broadcast::Sender<ClusterEvent>) -> JoinHandle<()> {
    let id = slave.id().to_string();
    let mut rx = slave.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SlaveEvent::Error(error)) => {
                    let _ = events.send(ClusterEvent::SlaveError {
                        slave: id.clone(),
                        error: Some(error),
                    });
                }
                Ok(SlaveEvent::End) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(SlaveEvent::Start) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    })
}
