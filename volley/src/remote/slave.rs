use std::time::Duration;

use http::{Method, StatusCode, header};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use super::client::{ClientEvent, EndpointClient, PendingCall, split_url};
use super::error::ClientError;
use super::node::{INSTALL_PATH, InstallSpec, MethodDef};
use crate::config::{ClientConfig, DEFAULT_HTTP_PORT};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    Initialized,
    /// The installation request is on its way.
    Connecting,
    Started,
    /// The installation was refused or never answered. Only a new slave can
    /// recover from this.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlaveEvent {
    Start,
    Error(ClientError),
    End,
}

/// Where a worker reports to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInfo {
    pub url: String,
    pub methods: Vec<String>,
}

/// Split `host` or `host:port` into an id and an origin, port 8000 by default.
pub fn parse_host(host_port: &str) -> (String, String) {
    let host_port = host_port.trim().trim_end_matches('/');
    let bare = host_port
        .split_once("://")
        .map_or(host_port, |(_, rest)| rest);
    let (host, port) = match bare.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (bare, DEFAULT_HTTP_PORT),
        },
        None => (bare, DEFAULT_HTTP_PORT),
    };
    (format!("{host}:{port}"), format!("http://{host}:{port}"))
}

/// A remote worker as seen from the controller.
///
/// [`Slave::start`] asks the worker host to install an endpoint exposing the
/// defined methods; afterwards [`Slave::call`] invokes them. Installation requests
/// are sent once and never retried.
#[derive(Debug)]
pub struct Slave {
    id: String,
    client: EndpointClient,
    ping_interval: Duration,
    methods: Mutex<Vec<MethodDef>>,
    state: Mutex<SlaveState>,
    events: broadcast::Sender<SlaveEvent>,
}

impl Slave {
    /// `host_port` is `host` or `host:port` of a node that installed the remote
    /// handler. The slave id defaults to `host:port`.
    pub fn new(
        id: Option<String>,
        host_port: &str,
        ping_interval: Duration,
        config: ClientConfig,
    ) -> Self {
        let (default_id, origin) = parse_host(host_port);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            id: id.unwrap_or(default_id),
            client: EndpointClient::new(&origin, "", config),
            ping_interval,
            methods: Mutex::new(vec![]),
            state: Mutex::new(SlaveState::Initialized),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SlaveState {
        *self.state.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlaveEvent> {
        self.events.subscribe()
    }

    /// Expose `name` on the worker, implemented by its registered operation `fun`.
    pub fn define_method(&self, name: impl Into<String>, fun: impl Into<String>) {
        let name = name.into();
        self.client.define_method(name.clone());
        let mut methods = self.methods.lock();
        methods.retain(|m| m.name != name);
        methods.push(MethodDef {
            name,
            fun: fun.into(),
        });
    }

    pub fn install_spec(&self, master: Option<&MasterInfo>) -> InstallSpec {
        InstallSpec {
            id: self.id.clone(),
            master: master.map(|m| m.url.clone()),
            master_methods: master.map(|m| m.methods.clone()).unwrap_or_default(),
            slave_methods: self.methods.lock().clone(),
            ping_interval: Some(self.ping_interval.as_millis() as u64),
        }
    }

    /// Install the worker endpoint. Emits [`SlaveEvent::Start`], or
    /// [`SlaveEvent::Error`] and leaves the slave in [`SlaveState::Error`].
    pub async fn start(&self, master: Option<&MasterInfo>) -> Result<(), ClientError> {
        let body = serde_json::to_value(self.install_spec(master)).map_err(|e| {
            ClientError::InvalidResponse {
                url: INSTALL_PATH.to_string(),
                reason: e.to_string(),
            }
        })?;
        {
            let mut state = self.state.lock();
            if *state != SlaveState::Initialized {
                return Ok(());
            }
            *state = SlaveState::Connecting;
        }

        match self.install(&body).await {
            Ok(basepath) => {
                self.client.set_basepath(basepath);
                self.forward_client_errors();
                *self.state.lock() = SlaveState::Started;
                tracing::debug!("Slave {} started.", self.id);
                let _ = self.events.send(SlaveEvent::Start);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Slave {} failed to install: {e}", self.id);
                *self.state.lock() = SlaveState::Error;
                let _ = self.events.send(SlaveEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    async fn install(&self, body: &Value) -> Result<String, ClientError> {
        let url = format!("{}{INSTALL_PATH}", self.client.origin());
        let response = self
            .client
            .raw_request(Method::POST, INSTALL_PATH, Some(body))
            .await?;
        if response.status != StatusCode::CREATED {
            return Err(ClientError::Status {
                url,
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        let location = response
            .header(header::LOCATION)
            .ok_or_else(|| ClientError::InvalidResponse {
                url: url.clone(),
                reason: "remote host does not have a proper /remote handler".into(),
            })?;
        if location.starts_with('/') {
            return Ok(location.trim_end_matches('/').to_string());
        }
        Ok(split_url(location)?.1)
    }

    fn forward_client_errors(&self) {
        let mut client_events = self.client.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match client_events.recv().await {
                    Ok(ClientEvent::Error(e)) => {
                        let _ = events.send(SlaveEvent::Error(e));
                    }
                    Ok(ClientEvent::End) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    /// Call a worker method. Failures are reported as [`SlaveEvent::Error`].
    pub fn call(&self, method: &str, args: Vec<Value>) -> PendingCall {
        self.client.call(method, args)
    }

    /// Remove the worker endpoint. A failed removal is reported but the slave ends
    /// anyway. Always emits [`SlaveEvent::End`].
    pub async fn end(&self) {
        if self.state() == SlaveState::Started {
            let basepath = self.client.basepath();
            match self.client.raw_request(Method::DELETE, &basepath, None).await {
                Ok(response) if response.status == StatusCode::NO_CONTENT => {}
                Ok(response) => {
                    let error = ClientError::Status {
                        url: format!("{}{basepath}", self.client.origin()),
                        status: response.status,
                        body: "error stopping slave".into(),
                    };
                    let _ = self.events.send(SlaveEvent::Error(error));
                }
                Err(e) => {
                    let _ = self.events.send(SlaveEvent::Error(e));
                }
            }
        }

        self.client.destroy();
        self.client.set_basepath("");
        {
            let mut state = self.state.lock();
            if *state != SlaveState::Error {
                *state = SlaveState::Initialized;
            }
        }
        tracing::debug!("Slave {} ended.", self.id);
        let _ = self.events.send(SlaveEvent::End);
    }
}
