use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::error::ClientError;
use crate::config::ClientConfig;

const EVENT_BUFFER: usize = 256;

/// Asynchronous notifications of an [`EndpointClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A call hit a connection error or got a non-success answer.
    Error(ClientError),
    /// The client was destroyed. Nothing else is emitted afterwards.
    End,
}

/// What came back from a call.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CallResponse {
    /// Decode the body, `null` for an empty one.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        if self.body.is_empty() {
            return serde_json::from_value(Value::Null);
        }
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, name: http::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A call in flight. Dropping it does not cancel the call.
#[derive(Debug)]
pub struct PendingCall {
    handle: JoinHandle<Result<CallResponse, ClientError>>,
}

impl PendingCall {
    fn failed(error: ClientError) -> Self {
        Self {
            handle: tokio::spawn(async move { Err(error) }),
        }
    }

    /// Block until the call finished.
    pub async fn wait(self) -> Result<CallResponse, ClientError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ClientError::Connection {
                url: String::new(),
                reason: format!("call aborted: {e}"),
            }),
        }
    }
}

struct Inner {
    http: reqwest::Client,
    origin: String,
    basepath: RwLock<String>,
    static_params: RwLock<Vec<Value>>,
    methods: RwLock<Vec<String>>,
    config: ClientConfig,
    events: broadcast::Sender<ClientEvent>,
    destroyed: AtomicBool,
}

/// Calls the methods of one remote [`Endpoint`](super::Endpoint).
///
/// Calls are fire-and-forget: [`EndpointClient::call`] returns right away and
/// failures are reported as [`ClientEvent::Error`]. Callers that need the answer
/// wait on the returned [`PendingCall`]. Connection errors are retried every
/// `retry_interval`, up to `max_retries` times.
#[derive(Clone)]
pub struct EndpointClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EndpointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointClient")
            .field("origin", &self.inner.origin)
            .field("basepath", &*self.inner.basepath.read())
            .finish()
    }
}

/// Split `http://host:port/some/path` into origin and path.
pub fn split_url(url: &str) -> Result<(String, String), ClientError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ClientError::InvalidUrl(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ClientError::InvalidUrl(url.to_string()))?;
    let origin = match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    };
    Ok((origin, parsed.path().trim_end_matches('/').to_string()))
}

/// Accept `host:port` as well as a full `http://host:port` origin.
pub fn origin_of(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

impl EndpointClient {
    pub fn new(origin: &str, basepath: impl Into<String>, config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to a default HTTP client: {e}");
                reqwest::Client::new()
            });
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                http,
                origin: origin_of(origin),
                basepath: RwLock::new(basepath.into()),
                static_params: RwLock::new(vec![]),
                methods: RwLock::new(vec![]),
                config,
                events,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn basepath(&self) -> String {
        self.inner.basepath.read().clone()
    }

    /// Point the client at another endpoint on the same host.
    pub fn set_basepath(&self, basepath: impl Into<String>) {
        *self.inner.basepath.write() = basepath.into();
    }

    /// Values sent in front of the arguments of every call.
    pub fn set_static_params(&self, params: Vec<Value>) {
        *self.inner.static_params.write() = params;
    }

    pub fn define_method(&self, name: impl Into<String>) {
        let name = name.into();
        let mut methods = self.inner.methods.write();
        if !methods.contains(&name) {
            methods.push(name);
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        self.inner.methods.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// POST `static params ++ args` to `{basepath}/{name}` in the background.
    pub fn call(&self, name: &str, args: Vec<Value>) -> PendingCall {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return PendingCall::failed(ClientError::Destroyed);
        }
        if !self.inner.methods.read().iter().any(|m| m == name) {
            return PendingCall::failed(ClientError::InvalidUrl(format!(
                "method {name} is not defined"
            )));
        }

        let mut params = self.inner.static_params.read().clone();
        params.extend(args);
        let url = format!("{}{}/{name}", self.inner.origin, self.inner.basepath.read());
        let inner = Arc::clone(&self.inner);
        PendingCall {
            handle: tokio::spawn(async move { inner.post_with_retry(url, Value::Array(params)).await }),
        }
    }

    /// Send a single request, relative to the origin. Never retried and never
    /// reported as an event.
    pub async fn raw_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<CallResponse, ClientError> {
        let url = format!("{}{path}", self.inner.origin);
        self.inner.send(method, &url, body).await
    }

    /// Stop making calls. Emits [`ClientEvent::End`].
    pub fn destroy(&self) {
        if !self.inner.destroyed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.events.send(ClientEvent::End);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl Inner {
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<CallResponse, ClientError> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| ClientError::Connection {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| ClientError::Connection {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(CallResponse {
            status,
            headers,
            body,
        })
    }

    async fn post_with_retry(&self, url: String, params: Value) -> Result<CallResponse, ClientError> {
        let mut attempt = 0;
        loop {
            if self.destroyed.load(Ordering::Acquire) {
                return Err(ClientError::Destroyed);
            }
            match self.send(Method::POST, &url, Some(&params)).await {
                Ok(response) if response.status.is_success() => return Ok(response),
                Ok(response) => {
                    let error = ClientError::Status {
                        url,
                        status: response.status,
                        body: String::from_utf8_lossy(&response.body).into_owned(),
                    };
                    let _ = self.events.send(ClientEvent::Error(error.clone()));
                    return Err(error);
                }
                Err(error) => {
                    let _ = self.events.send(ClientEvent::Error(error.clone()));
                    if attempt >= self.config.max_retries {
                        return Err(error);
                    }
                    attempt += 1;
                    tracing::debug!("Retrying {url} in {:?}.", self.config.retry_interval);
                    tokio::time::sleep(self.config.retry_interval).await;
                }
            }
        }
    }
}
