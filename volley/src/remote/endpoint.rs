use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use http::{Method, StatusCode};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;

use super::error::MethodError;
use super::transport::{Handler, HttpServer, TransportRequest, TransportResponse};

/// Name of the method an endpoint runs once when it starts.
pub const SETUP_METHOD: &str = "setup";

type MethodFn<C> =
    Arc<dyn Fn(Arc<C>, Vec<Value>) -> BoxFuture<'static, Result<Value, MethodError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Initialized,
    /// `setup` is running.
    Starting,
    Started,
}

struct Inner<C> {
    id: String,
    base: String,
    host: Option<String>,
    server: HttpServer,
    context: Arc<C>,
    methods: RwLock<IndexMap<String, MethodFn<C>>>,
    static_params: RwLock<Vec<Value>>,
    state: watch::Sender<EndpointState>,
}

/// A set of named methods callable by POSTing to `/remote/{id}/{method}`.
///
/// Every method receives the endpoint's shared context and its parameter list: the
/// static parameters followed by whatever the request body carried. A JSON array
/// body is spread into several parameters, any other JSON value is a single one.
///
/// | request                      | answer                                         |
/// |------------------------------|------------------------------------------------|
/// | `DELETE /remote/{id}`        | 204, the endpoint ends                          |
/// | other verb on `/remote/{id}` | 405                                            |
/// | `POST .../{method}`          | 200 with the JSON result, empty body for `null` |
/// | unknown method               | 404                                            |
/// | body is not JSON             | 400                                            |
/// | method failed                | 500 with the error message                     |
pub struct Endpoint<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Endpoint<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> std::fmt::Debug for Endpoint<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("base", &self.inner.base)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl<C: Send + Sync + 'static> Endpoint<C> {
    /// `host` overrides the `host:port` advertised in [`Endpoint::url`]; by default
    /// the server's bound address is used.
    pub fn new(server: &HttpServer, context: C, host: Option<String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (state, _) = watch::channel(EndpointState::Initialized);
        Self {
            inner: Arc::new(Inner {
                base: format!("/remote/{id}"),
                id,
                host,
                server: server.clone(),
                context: Arc::new(context),
                methods: RwLock::new(IndexMap::new()),
                static_params: RwLock::new(vec![]),
                state,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// `/remote/{id}`
    pub fn base_path(&self) -> &str {
        &self.inner.base
    }

    pub fn context(&self) -> &Arc<C> {
        &self.inner.context
    }

    /// Full address of the endpoint, once started.
    pub fn url(&self) -> Option<String> {
        if self.state() != EndpointState::Started {
            return None;
        }
        let origin = match &self.inner.host {
            Some(host) => format!("http://{host}"),
            None => self.inner.server.url()?,
        };
        Some(format!("{origin}{}", self.inner.base))
    }

    pub fn state(&self) -> EndpointState {
        *self.inner.state.borrow()
    }

    /// Watch the endpoint go from started back to initialized.
    pub fn subscribe_state(&self) -> watch::Receiver<EndpointState> {
        self.inner.state.subscribe()
    }

    /// Register `f` under `name`, replacing an existing method of that name.
    pub fn define_method<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Arc<C>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        let method: MethodFn<C> = Arc::new(move |ctx, params| Box::pin(f(ctx, params)));
        self.inner.methods.write().insert(name.into(), method);
    }

    pub fn method_names(&self) -> Vec<String> {
        self.inner.methods.read().keys().cloned().collect()
    }

    /// Values passed in front of the request parameters of every call.
    pub fn set_static_params(&self, params: Vec<Value>) {
        *self.inner.static_params.write() = params;
    }

    /// Install the route and run `setup`, if defined, with the static parameters.
    /// Does nothing unless the endpoint is initialized, so concurrent calls run
    /// `setup` once.
    pub async fn start(&self) -> Result<(), MethodError> {
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state != EndpointState::Initialized {
                return false;
            }
            *state = EndpointState::Starting;
            true
        });
        if !claimed {
            return Ok(());
        }
        self.inner.server.add_route(
            self.inner.base.clone(),
            Arc::new(Route(Arc::clone(&self.inner))),
        );

        let setup = self.inner.methods.read().get(SETUP_METHOD).cloned();
        if let Some(setup) = setup {
            let params = self.inner.static_params.read().clone();
            if let Err(e) = setup(Arc::clone(&self.inner.context), params).await {
                self.inner.server.remove_route(&self.inner.base);
                self.inner.state.send_replace(EndpointState::Initialized);
                return Err(e);
            }
        }

        self.inner.state.send_replace(EndpointState::Started);
        tracing::debug!("Endpoint {} started.", self.inner.base);
        Ok(())
    }

    /// Remove the route. No method runs afterwards.
    pub fn end(&self) {
        self.inner.end();
    }
}

impl<C> Inner<C> {
    fn end(&self) {
        if *self.state.borrow() != EndpointState::Started {
            return;
        }
        self.server.remove_route(&self.base);
        self.state.send_replace(EndpointState::Initialized);
        tracing::debug!("Endpoint {} ended.", self.base);
    }
}

struct Route<C>(Arc<Inner<C>>);

/// Turn a request body into a parameter list.
fn parse_params(body: &[u8]) -> Result<Vec<Value>, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(vec![]);
    }
    Ok(match serde_json::from_slice(body)? {
        Value::Array(values) => values,
        value => vec![value],
    })
}

#[async_trait]
impl<C: Send + Sync + 'static> Handler for Route<C> {
    async fn handle(&self, request: TransportRequest) -> TransportResponse {
        let inner = &self.0;
        let Some(rest) = request.path.strip_prefix(inner.base.as_str()) else {
            return TransportResponse::status(StatusCode::NOT_FOUND);
        };
        let rest = rest.trim_start_matches('/');

        if rest.is_empty() {
            if request.method == Method::DELETE {
                inner.end();
                return TransportResponse::status(StatusCode::NO_CONTENT);
            }
            return TransportResponse::status(StatusCode::METHOD_NOT_ALLOWED);
        }
        if request.method != Method::POST {
            return TransportResponse::status(StatusCode::METHOD_NOT_ALLOWED);
        }

        let method = inner.methods.read().get(rest).cloned();
        let Some(method) = method else {
            return TransportResponse::status(StatusCode::NOT_FOUND);
        };
        let Ok(params) = parse_params(&request.body) else {
            return TransportResponse::status(StatusCode::BAD_REQUEST);
        };

        let mut args = inner.static_params.read().clone();
        args.extend(params);
        match method(Arc::clone(&inner.context), args).await {
            Ok(Value::Null) => TransportResponse::status(StatusCode::OK),
            Ok(value) => TransportResponse::json(&value),
            Err(e) => TransportResponse::text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;

    fn echo_endpoint(server: &HttpServer) -> Endpoint<Mutex<Vec<Value>>> {
        let endpoint = Endpoint::new(server, Mutex::new(vec![]), None);
        endpoint.define_method("echo", |_, params| async move {
            Ok::<_, MethodError>(Value::Array(params))
        });
        endpoint.define_method("record", |ctx: Arc<Mutex<Vec<Value>>>, params| async move {
            ctx.lock().extend(params);
            Ok::<_, MethodError>(Value::Null)
        });
        endpoint.define_method("fail", |_, _| async {
            Err::<Value, _>(MethodError::from("boom"))
        });
        endpoint
    }

    async fn post(server: &HttpServer, path: String, body: &str) -> TransportResponse {
        server
            .dispatch(TransportRequest::new(Method::POST, path, body.to_string()))
            .await
    }

    #[tokio::test]
    async fn dispatches_methods_with_static_params() {
        let server = HttpServer::new();
        let endpoint = echo_endpoint(&server);
        endpoint.set_static_params(vec![json!("id-1")]);
        endpoint.start().await.unwrap();
        let base = endpoint.base_path().to_string();

        let res = post(&server, format!("{base}/echo"), "[1, 2]").await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body, Bytes::from(r#"["id-1",1,2]"#));

        // single values are one parameter
        let res = post(&server, format!("{base}/echo"), r#"{"a":1}"#).await;
        assert_eq!(res.body, Bytes::from(r#"["id-1",{"a":1}]"#));

        let res = post(&server, format!("{base}/record"), "").await;
        assert_eq!(res.status, StatusCode::OK);
        assert!(res.body.is_empty());
        assert_eq!(*endpoint.context().lock(), vec![json!("id-1")]);
    }

    #[tokio::test]
    async fn error_statuses() {
        let server = HttpServer::new();
        let endpoint = echo_endpoint(&server);
        endpoint.start().await.unwrap();
        let base = endpoint.base_path().to_string();

        assert_eq!(
            post(&server, format!("{base}/echo"), "{not json").await.status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post(&server, format!("{base}/missing"), "[]").await.status,
            StatusCode::NOT_FOUND
        );
        let failed = post(&server, format!("{base}/fail"), "[]").await;
        assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failed.body, Bytes::from("boom"));

        let get = server
            .dispatch(TransportRequest::new(Method::GET, format!("{base}/echo"), ""))
            .await;
        assert_eq!(get.status, StatusCode::METHOD_NOT_ALLOWED);
        let put = server
            .dispatch(TransportRequest::new(Method::PUT, base.clone(), ""))
            .await;
        assert_eq!(put.status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn delete_tears_down() {
        let server = HttpServer::new();
        let endpoint = echo_endpoint(&server);
        endpoint.start().await.unwrap();
        let base = endpoint.base_path().to_string();
        let mut state = endpoint.subscribe_state();

        let res = server
            .dispatch(TransportRequest::new(Method::DELETE, base.clone(), ""))
            .await;
        assert_eq!(res.status, StatusCode::NO_CONTENT);
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), EndpointState::Initialized);
        assert!(server.routes().is_empty());

        let res = post(&server, format!("{base}/echo"), "[]").await;
        assert_eq!(res.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn setup_runs_once_on_start() {
        let server = HttpServer::new();
        let endpoint = Endpoint::new(&server, Mutex::new(0u32), None);
        endpoint.define_method(SETUP_METHOD, |ctx: Arc<Mutex<u32>>, params| async move {
            assert_eq!(params, vec![json!("static")]);
            *ctx.lock() += 1;
            Ok::<_, MethodError>(Value::Null)
        });
        endpoint.set_static_params(vec![json!("static")]);
        endpoint.start().await.unwrap();
        endpoint.start().await.unwrap();
        assert_eq!(*endpoint.context().lock(), 1);
        assert_eq!(endpoint.state(), EndpointState::Started);
        // not listening, so no url yet
        assert_eq!(endpoint.url(), None);
    }

    #[tokio::test]
    async fn concurrent_starts_run_setup_once() {
        let server = HttpServer::new();
        let endpoint = Endpoint::new(&server, Mutex::new(0u32), None);
        endpoint.define_method(SETUP_METHOD, |ctx: Arc<Mutex<u32>>, _| async move {
            *ctx.lock() += 1;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok::<_, MethodError>(Value::Null)
        });

        let (a, b) = tokio::join!(endpoint.start(), endpoint.start());
        a.unwrap();
        b.unwrap();
        assert_eq!(*endpoint.context().lock(), 1);
        assert_eq!(endpoint.state(), EndpointState::Started);
        assert_eq!(server.routes().len(), 1);
        assert!(format!("{endpoint:?}").contains("Started"));
    }

    #[tokio::test]
    async fn failed_setup_can_be_retried() {
        let server = HttpServer::new();
        let endpoint = Endpoint::new(&server, Mutex::new(0u32), None);
        endpoint.define_method(SETUP_METHOD, |ctx: Arc<Mutex<u32>>, _| async move {
            let calls = {
                let mut calls = ctx.lock();
                *calls += 1;
                *calls
            };
            if calls == 1 {
                return Err(MethodError::from("not yet"));
            }
            Ok(Value::Null)
        });

        assert!(endpoint.start().await.is_err());
        assert_eq!(endpoint.state(), EndpointState::Initialized);
        assert!(server.routes().is_empty());
        endpoint.start().await.unwrap();
        assert_eq!(endpoint.state(), EndpointState::Started);
    }
}
