use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};

use super::error::TransportError;

/// A request as seen by route handlers.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// A handler's answer.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        let mut response = Self::status(StatusCode::OK);
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response.body = Bytes::from(value.to_string());
        response
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut response = Self::status(status);
        response.body = Bytes::from(body.into());
        response
    }

    /// Add a header. Values that are not valid header text are dropped.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }
}

impl IntoResponse for TransportResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Serves every request below the base path it was installed at.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: TransportRequest) -> TransportResponse;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running(SocketAddr),
}

struct Inner {
    routes: RwLock<Vec<(String, Arc<dyn Handler>)>>,
    state: watch::Sender<ServerState>,
    shutdown: Mutex<Option<Arc<Notify>>>,
}

/// HTTP transport with a route table that can change while it is serving.
///
/// Requests go to the handler installed at the longest base path that is a prefix
/// of the request path on a `/` boundary. Requests nobody handles get a 404.
///
/// ```text
/// /remote             installation handler
/// /remote/3f2a...     one endpoint, and /remote/3f2a.../method for its methods
/// ```
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("state", &*self.inner.state.borrow())
            .field("routes", &self.routes())
            .finish()
    }
}

impl HttpServer {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            inner: Arc::new(Inner {
                routes: RwLock::new(vec![]),
                state,
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// Install `handler` under `base`, replacing whatever was there.
    pub fn add_route(&self, base: impl Into<String>, handler: Arc<dyn Handler>) {
        let base = base.into();
        let mut routes = self.inner.routes.write();
        routes.retain(|(b, _)| *b != base);
        tracing::debug!("Route {base} installed.");
        routes.push((base, handler));
    }

    pub fn remove_route(&self, base: &str) -> bool {
        let mut routes = self.inner.routes.write();
        let before = routes.len();
        routes.retain(|(b, _)| b != base);
        before != routes.len()
    }

    /// Installed base paths.
    pub fn routes(&self) -> Vec<String> {
        self.inner
            .routes
            .read()
            .iter()
            .map(|(b, _)| b.clone())
            .collect()
    }

    /// Route a request to its handler without going through the network.
    pub async fn dispatch(&self, request: TransportRequest) -> TransportResponse {
        let handler = {
            let routes = self.inner.routes.read();
            routes
                .iter()
                .filter(|(base, _)| matches_base(base, &request.path))
                .max_by_key(|(base, _)| base.len())
                .map(|(_, h)| Arc::clone(h))
        };
        match handler {
            Some(handler) => handler.handle(request).await,
            None => TransportResponse::status(StatusCode::NOT_FOUND),
        }
    }

    /// Bind `addr` and serve in the background. Port 0 picks a free port, the
    /// bound address is returned.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        if self.running() {
            return Err(TransportError::AlreadyRunning);
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let shutdown = Arc::new(Notify::new());
        *self.inner.shutdown.lock() = Some(Arc::clone(&shutdown));

        let app = Router::new().fallback(serve).with_state(self.clone());
        let state = self.inner.state.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.notified().await })
                .await;
            if let Err(e) = result {
                tracing::error!("HTTP server on {local} failed: {e}");
            }
            state.send_replace(ServerState::Stopped);
        });

        tracing::info!("HTTP server listening on {local}.");
        self.inner.state.send_replace(ServerState::Running(local));
        Ok(local)
    }

    pub fn running(&self) -> bool {
        matches!(*self.inner.state.borrow(), ServerState::Running(_))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.inner.state.borrow() {
            ServerState::Running(addr) => Some(addr),
            ServerState::Stopped => None,
        }
    }

    /// `http://host:port` of the running server.
    pub fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("http://{addr}"))
    }

    /// Resolve once the server is listening.
    pub async fn wait_started(&self) -> SocketAddr {
        let mut rx = self.inner.state.subscribe();
        loop {
            if let ServerState::Running(addr) = *rx.borrow_and_update() {
                return addr;
            }
            // The sender lives in `self`, so this cannot fail.
            let _ = rx.changed().await;
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Stop accepting connections and let in-flight requests finish.
    pub fn stop(&self) {
        if let Some(shutdown) = self.inner.shutdown.lock().take() {
            tracing::info!("HTTP server stopping.");
            shutdown.notify_one();
        }
        self.inner.state.send_replace(ServerState::Stopped);
    }
}

fn matches_base(base: &str, path: &str) -> bool {
    match path.strip_prefix(base) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || base.ends_with('/'),
        None => false,
    }
}

async fn serve(
    State(server): State<HttpServer>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> TransportResponse {
    let request = TransportRequest {
        method,
        path: uri.path().to_string(),
        headers,
        body,
    };
    server.dispatch(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, request: TransportRequest) -> TransportResponse {
            TransportResponse::text(StatusCode::OK, format!("{} {}", self.0, request.path))
        }
    }

    #[test]
    fn base_matching_respects_segments() {
        assert!(matches_base("/remote", "/remote"));
        assert!(matches_base("/remote", "/remote/abc"));
        assert!(!matches_base("/remote", "/remotely"));
        assert!(!matches_base("/remote/abc", "/remote"));
    }

    #[tokio::test]
    async fn longest_base_wins() {
        let server = HttpServer::new();
        server.add_route("/remote", Arc::new(Echo("install")));
        server.add_route("/remote/abc", Arc::new(Echo("endpoint")));

        let res = server
            .dispatch(TransportRequest::new(Method::POST, "/remote/abc/ping", ""))
            .await;
        assert_eq!(res.body, Bytes::from("endpoint /remote/abc/ping"));

        let res = server
            .dispatch(TransportRequest::new(Method::GET, "/remote", ""))
            .await;
        assert_eq!(res.body, Bytes::from("install /remote"));

        assert!(server.remove_route("/remote/abc"));
        let res = server
            .dispatch(TransportRequest::new(Method::POST, "/remote/abc/ping", ""))
            .await;
        assert_eq!(res.body, Bytes::from("install /remote/abc/ping"));

        let res = server
            .dispatch(TransportRequest::new(Method::GET, "/elsewhere", ""))
            .await;
        assert_eq!(res.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_over_loopback() {
        let server = HttpServer::new();
        server.add_route("/hello", Arc::new(Echo("hi")));
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(server.running());
        assert_eq!(server.wait_started().await, addr);

        let body = reqwest::get(format!("http://{addr}/hello/there"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hi /hello/there");

        let missing = reqwest::get(format!("http://{addr}/nope")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        server.stop();
        assert!(!server.running());
        assert_eq!(server.local_addr(), None);
    }
}
