use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use http::{Method, StatusCode, header};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use volley_macros::message;

use super::client::{EndpointClient, PendingCall, split_url};
use super::endpoint::{Endpoint, EndpointState};
use super::error::MethodError;
use super::transport::{Handler, HttpServer, TransportRequest, TransportResponse};
use crate::config::NodeConfig;
use crate::error::Error;

/// Path workers accept installation requests on.
pub const INSTALL_PATH: &str = "/remote";
/// Master method every worker reports its state to.
pub const UPDATE_STATE_METHOD: &str = "updateSlaveState_";

/// A worker operation, looked up by name when a controller installs a worker.
pub type Operation = Arc<
    dyn Fn(Arc<SlaveContext>, Vec<Value>) -> BoxFuture<'static, Result<Value, MethodError>>
        + Send
        + Sync,
>;

/// One method a controller asks a worker to expose: `name` is what the controller
/// calls, `fun` the registry key of the operation that implements it.
#[message]
#[derive(PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    pub fun: String,
}

/// Body of an installation request.
#[message]
pub struct InstallSpec {
    /// Id the controller knows this worker by. Sent back with every master call.
    pub id: String,
    /// Full URL of the controller's master endpoint.
    #[serde(default)]
    pub master: Option<String>,
    #[serde(default)]
    pub master_methods: Vec<String>,
    #[serde(default)]
    pub slave_methods: Vec<MethodDef>,
    /// Milliseconds between heartbeats. 0 only reports state changes.
    #[serde(default)]
    pub ping_interval: Option<u64>,
}

/// Worker operations compiled into this binary.
///
/// Controllers never ship behavior, only operation names, so every node of a fleet
/// has to be built with the same registry.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: IndexMap<String, Operation>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.operations.keys()).finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Arc<SlaveContext>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        let operation: Operation = Arc::new(move |ctx, params| Box::pin(f(ctx, params)));
        self.operations.insert(name.into(), operation);
        self
    }

    pub fn get(&self, name: &str) -> Option<Operation> {
        self.operations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Add every operation of `other`, replacing those with the same name.
    pub fn extend(&mut self, other: OperationRegistry) {
        self.operations.extend(other.operations);
    }
}

/// What worker operations see of their node.
///
/// Setting the state immediately reports it to the controller. Operations keep
/// whatever they need between calls in the extensions.
pub struct SlaveContext {
    id: String,
    state: Mutex<String>,
    master: Option<EndpointClient>,
    heartbeat: mpsc::UnboundedSender<String>,
    extensions: Mutex<http::Extensions>,
}

impl std::fmt::Debug for SlaveContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveContext")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SlaveContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> String {
        self.state.lock().clone()
    }

    pub fn set_state(&self, state: impl Into<String>) {
        let state = state.into();
        *self.state.lock() = state.clone();
        // The heartbeat task is gone once the node ended.
        let _ = self.heartbeat.send(state);
    }

    /// Client of the controller's master endpoint, if the controller has one.
    pub fn master(&self) -> Option<&EndpointClient> {
        self.master.as_ref()
    }

    /// Call a master method. The worker id is sent as the first parameter.
    pub fn call_master(&self, method: &str, args: Vec<Value>) -> Option<PendingCall> {
        self.master.as_ref().map(|m| m.call(method, args))
    }

    pub fn insert_extension<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.extensions.lock().insert(value)
    }

    pub fn extension<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.extensions.lock().get::<T>().cloned()
    }

    pub fn remove_extension<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.extensions.lock().remove::<T>()
    }
}

/// The worker side of a controller's [`Slave`](super::Slave): an endpoint exposing
/// the installed operations plus a heartbeat to the controller.
#[derive(Debug, Clone)]
pub struct SlaveNode {
    endpoint: Endpoint<SlaveContext>,
}

impl SlaveNode {
    async fn install(host: &Arc<HostInner>, spec: InstallSpec) -> Result<Self, MethodError> {
        let config = &host.config;
        let master = match &spec.master {
            Some(url) => Some(master_client(url, &spec, config)?),
            None => None,
        };
        let operations = spec
            .slave_methods
            .iter()
            .map(|m| {
                host.registry
                    .get(&m.fun)
                    .map(|op| (m.name.clone(), op))
                    .ok_or_else(|| Error::UnknownOperation(m.fun.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (heartbeat, beats) = mpsc::unbounded_channel();
        let context = SlaveContext {
            id: spec.id.clone(),
            state: Mutex::new("initialized".to_string()),
            master,
            heartbeat,
            extensions: Mutex::new(http::Extensions::new()),
        };
        let endpoint = Endpoint::new(&host.server, context, config.host.clone());
        for (name, operation) in operations {
            endpoint.define_method(name, move |ctx, params| operation(ctx, params));
        }
        endpoint.start().await?;

        let period = spec
            .ping_interval
            .map(Duration::from_millis)
            .unwrap_or(config.ping_interval);
        let node = Self { endpoint };
        tokio::spawn(
            Heartbeat {
                context: Arc::clone(node.endpoint.context()),
                beats,
                ended: node.endpoint.subscribe_state(),
                period,
            }
            .run(Arc::downgrade(host), node.id().to_string()),
        );
        tracing::info!("Installed worker {} at {}.", node.id(), node.endpoint.base_path());
        Ok(node)
    }

    pub fn id(&self) -> &str {
        self.endpoint.context().id()
    }

    pub fn url(&self) -> Option<String> {
        self.endpoint.url()
    }

    pub fn base_path(&self) -> &str {
        self.endpoint.base_path()
    }

    pub fn context(&self) -> &Arc<SlaveContext> {
        self.endpoint.context()
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.state() == EndpointState::Started
    }

    /// Remove the endpoint and stop reporting to the controller.
    pub fn end(&self) {
        self.endpoint.end();
    }
}

fn master_client(url: &str, spec: &InstallSpec, config: &NodeConfig) -> Result<EndpointClient, MethodError> {
    let (origin, path) = split_url(url).map_err(|e| MethodError(e.to_string()))?;
    let client = EndpointClient::new(&origin, path, config.client.clone());
    client.define_method(UPDATE_STATE_METHOD);
    for method in &spec.master_methods {
        client.define_method(method.clone());
    }
    client.set_static_params(vec![json!(spec.id)]);
    Ok(client)
}

struct Heartbeat {
    context: Arc<SlaveContext>,
    beats: mpsc::UnboundedReceiver<String>,
    ended: watch::Receiver<EndpointState>,
    period: Duration,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Heartbeat {
    async fn run(mut self, host: std::sync::Weak<HostInner>, id: String) {
        let mut ticker = (!self.period.is_zero()).then(|| {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                changed = self.ended.changed() => {
                    if changed.is_err() || *self.ended.borrow() != EndpointState::Started {
                        break;
                    }
                }
                Some(state) = self.beats.recv() => self.report(state).await,
                _ = tick(&mut ticker) => self.report(self.context.state()).await,
            }
        }

        if let Some(master) = self.context.master() {
            master.destroy();
        }
        if let Some(host) = host.upgrade() {
            host.nodes.lock().retain(|n| n.id() != id);
        }
        tracing::info!("Worker {id} ended.");
    }

    /// Calls are awaited one at a time so the controller sees states in order.
    async fn report(&self, state: String) {
        let Some(call) = self
            .context
            .call_master(UPDATE_STATE_METHOD, vec![Value::String(state)])
        else {
            return;
        };
        if let Err(e) = call.wait().await {
            tracing::debug!("Heartbeat of {} failed: {e}", self.context.id());
        }
    }
}

struct HostInner {
    server: HttpServer,
    registry: OperationRegistry,
    config: NodeConfig,
    nodes: Mutex<Vec<SlaveNode>>,
}

/// The installation handler of a worker host.
///
/// | request         | answer                                                |
/// |-----------------|-------------------------------------------------------|
/// | `POST /remote`  | 201, `Location` is the new worker endpoint            |
/// | bad install     | 400 with the reason, nothing is left installed        |
/// | `GET /remote`   | 200, JSON list of the installed worker endpoint URLs  |
/// | other verbs     | 405                                                   |
#[derive(Clone)]
pub struct NodeHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for NodeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHost")
            .field("registry", &self.inner.registry)
            .field("nodes", &self.urls())
            .finish()
    }
}

/// Install the `/remote` handler on `server`, making this process a worker.
pub fn install_remote_handler(
    server: &HttpServer,
    registry: OperationRegistry,
    config: NodeConfig,
) -> NodeHost {
    let host = NodeHost {
        inner: Arc::new(HostInner {
            server: server.clone(),
            registry,
            config,
            nodes: Mutex::new(vec![]),
        }),
    };
    server.add_route(INSTALL_PATH, Arc::new(InstallRoute(Arc::clone(&host.inner))));
    host
}

impl NodeHost {
    pub fn nodes(&self) -> Vec<SlaveNode> {
        self.inner.nodes.lock().clone()
    }

    pub fn node(&self, id: &str) -> Option<SlaveNode> {
        self.inner.nodes.lock().iter().find(|n| n.id() == id).cloned()
    }

    pub fn urls(&self) -> Vec<String> {
        self.inner
            .nodes
            .lock()
            .iter()
            .filter_map(SlaveNode::url)
            .collect()
    }

    /// Remove the handler and end every installed worker.
    pub fn uninstall(&self) {
        self.inner.server.remove_route(INSTALL_PATH);
        for node in self.nodes() {
            node.end();
        }
    }
}

struct InstallRoute(Arc<HostInner>);

#[async_trait]
impl Handler for InstallRoute {
    async fn handle(&self, request: TransportRequest) -> TransportResponse {
        if request.path.trim_end_matches('/') != INSTALL_PATH {
            return TransportResponse::status(StatusCode::NOT_FOUND);
        }
        match request.method {
            Method::POST => {}
            Method::GET => {
                let urls = self
                    .0
                    .nodes
                    .lock()
                    .iter()
                    .filter_map(SlaveNode::url)
                    .collect::<Vec<_>>();
                return TransportResponse::json(&json!(urls));
            }
            _ => return TransportResponse::status(StatusCode::METHOD_NOT_ALLOWED),
        }

        let spec: InstallSpec = match serde_json::from_slice(&request.body) {
            Ok(spec) => spec,
            Err(e) => return TransportResponse::text(StatusCode::BAD_REQUEST, e.to_string()),
        };
        let node = match SlaveNode::install(&self.0, spec).await {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!("Rejected worker installation: {e}");
                return TransportResponse::text(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        let location = node
            .url()
            .unwrap_or_else(|| node.base_path().to_string());
        self.0.nodes.lock().push(node);
        TransportResponse::status(StatusCode::CREATED).with_header(header::LOCATION, &location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn registry() -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        registry
            .register("hello", |ctx: Arc<SlaveContext>, params| async move {
                Ok::<_, MethodError>(json!(format!("{} says hi to {}", ctx.id(), params[0])))
            })
            .register("go", |ctx: Arc<SlaveContext>, params| async move {
                let state = params.first().and_then(Value::as_str).unwrap_or("running");
                ctx.set_state(state);
                Ok::<_, MethodError>(Value::Null)
            })
            .register("remember", |ctx: Arc<SlaveContext>, _| async move {
                let count = ctx.extension::<u32>().unwrap_or(0) + 1;
                ctx.insert_extension(count);
                Ok::<_, MethodError>(json!(count))
            });
        registry
    }

    fn install_body(methods: &[(&str, &str)]) -> String {
        json!({
            "id": "w1",
            "slaveMethods": methods
                .iter()
                .map(|(name, fun)| json!({"name": name, "fun": fun}))
                .collect::<Vec<_>>(),
            "pingInterval": 0,
        })
        .to_string()
    }

    async fn install(server: &HttpServer, body: String) -> TransportResponse {
        server
            .dispatch(TransportRequest::new(Method::POST, "/remote", body))
            .await
    }

    #[test]
    fn install_spec_uses_camel_case() {
        let spec: InstallSpec = serde_json::from_str(
            r#"{"id":"a","master":"http://m:1/remote/x","masterMethods":["sendStats"],
                "slaveMethods":[{"name":"run","fun":"runTests"}],"pingInterval":250}"#,
        )
        .unwrap();
        assert_eq!(spec.master_methods, vec!["sendStats"]);
        assert_eq!(spec.slave_methods[0].fun, "runTests");
        assert_eq!(spec.ping_interval, Some(250));
    }

    #[tokio::test]
    async fn installs_and_serves_registered_operations() {
        let server = HttpServer::new();
        let host = install_remote_handler(&server, registry(), NodeConfig::default());

        let res = install(&server, install_body(&[("greet", "hello"), ("count", "remember")])).await;
        assert_eq!(res.status, StatusCode::CREATED);
        // not listening, so the location is the bare path
        let location = res.headers[header::LOCATION].to_str().unwrap().to_string();
        assert!(location.starts_with("/remote/"));

        let greet = server
            .dispatch(TransportRequest::new(Method::POST, format!("{location}/greet"), r#""bob""#))
            .await;
        assert_eq!(greet.body, Bytes::from(r#""w1 says hi to \"bob\"""#));

        for expected in ["1", "2"] {
            let res = server
                .dispatch(TransportRequest::new(Method::POST, format!("{location}/count"), ""))
                .await;
            assert_eq!(res.body, Bytes::from(expected));
        }

        assert_eq!(host.nodes().len(), 1);
        assert_eq!(host.node("w1").unwrap().base_path(), location);
    }

    #[tokio::test]
    async fn rejects_bad_installations() {
        let server = HttpServer::new();
        let host = install_remote_handler(&server, registry(), NodeConfig::default());

        assert_eq!(install(&server, "{".into()).await.status, StatusCode::BAD_REQUEST);
        let unknown = install(&server, install_body(&[("x", "not-registered")])).await;
        assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
        assert!(host.nodes().is_empty());
        assert_eq!(server.routes(), vec!["/remote".to_string()]);

        let put = server
            .dispatch(TransportRequest::new(Method::PUT, "/remote", ""))
            .await;
        assert_eq!(put.status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn delete_removes_the_worker() {
        let server = HttpServer::new();
        let host = install_remote_handler(&server, registry(), NodeConfig::default());
        let res = install(&server, install_body(&[("go", "go")])).await;
        let location = res.headers[header::LOCATION].to_str().unwrap().to_string();
        let node = host.node("w1").unwrap();
        assert!(node.is_running());

        let res = server
            .dispatch(TransportRequest::new(Method::DELETE, location.clone(), ""))
            .await;
        assert_eq!(res.status, StatusCode::NO_CONTENT);
        assert!(!node.is_running());

        // the heartbeat task drops the node from the host once it notices
        for _ in 0..100 {
            if host.nodes().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(host.nodes().is_empty());
    }

    #[tokio::test]
    async fn lists_installed_workers_over_http() {
        let server = HttpServer::new();
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        install_remote_handler(&server, registry(), NodeConfig::default());

        let client = reqwest::Client::new();
        let res = client
            .post(format!("http://{addr}/remote"))
            .body(install_body(&[("greet", "hello")]))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let location = res.headers()[header::LOCATION].to_str().unwrap().to_string();
        assert!(location.starts_with(&format!("http://{addr}/remote/")));

        let listed: Vec<String> = client
            .get(format!("http://{addr}/remote"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed, vec![location]);
        server.stop();
    }
}
