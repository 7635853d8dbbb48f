use std::time::Duration;

use typed_builder::TypedBuilder;

/// Default period between interval statistics reports.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(2000);
/// Default period between worker heartbeats.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(3000);
/// Default delay before an RPC call is retried after a connection error.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Node wide settings shared by the scheduler, the monitors and the remote layer.
///
/// Everything that used to be ambient global state is carried here and passed
/// explicitly to the components that need it.
///
/// ```rust
/// use std::time::Duration;
/// use volley::NodeConfig;
///
/// let config = NodeConfig::builder()
///     .http_port(9000)
///     .ping_interval(Duration::from_millis(500))
///     .build();
/// assert_eq!(config.monitor_interval, Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct NodeConfig {
    /// Port the node's HTTP transport listens on.
    #[builder(default = DEFAULT_HTTP_PORT)]
    pub http_port: u16,
    /// `host:port` other nodes use to reach this one. Defaults to the address the
    /// transport is bound to.
    #[builder(default, setter(strip_option, into))]
    pub host: Option<String>,
    /// Period between `update` events of monitors and load tests.
    #[builder(default = DEFAULT_MONITOR_INTERVAL)]
    pub monitor_interval: Duration,
    /// Period between worker heartbeats to the controller.
    #[builder(default = DEFAULT_PING_INTERVAL)]
    pub ping_interval: Duration,
    /// Settings for outgoing RPC calls.
    #[builder(default)]
    pub client: ClientConfig,
    /// Suppress informational logging from long running loops.
    #[builder(default = false)]
    pub quiet: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl NodeConfig {
    /// Build a configuration from the process environment.
    ///
    /// Reads `HTTP_PORT`, `VOLLEY_HOST`, `QUIET`, `VOLLEY_MONITOR_INTERVAL_MS` and
    /// `VOLLEY_PING_INTERVAL_MS`. Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_parse::<u16>("HTTP_PORT") {
            config.http_port = port;
        }
        if let Ok(host) = std::env::var("VOLLEY_HOST")
            && !host.trim().is_empty()
        {
            config.host = Some(host.trim().to_string());
        }
        if let Ok(quiet) = std::env::var("QUIET") {
            config.quiet = !quiet.is_empty() && quiet != "0";
        }
        if let Some(ms) = env_parse::<u64>("VOLLEY_MONITOR_INTERVAL_MS") {
            config.monitor_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("VOLLEY_PING_INTERVAL_MS") {
            config.ping_interval = Duration::from_millis(ms);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Retry behavior of an [`crate::remote::EndpointClient`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClientConfig {
    /// Delay before a call that hit a connection error is attempted again.
    #[builder(default = DEFAULT_RETRY_INTERVAL)]
    pub retry_interval: Duration,
    /// How many times a call is retried after connection errors. Installation
    /// requests are never retried.
    #[builder(default = 3)]
    pub max_retries: usize,
    /// Per request timeout.
    #[builder(default = Duration::from_secs(30))]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.monitor_interval, Duration::from_millis(2000));
        assert_eq!(config.ping_interval, Duration::from_millis(3000));
        assert_eq!(config.client.retry_interval, Duration::from_millis(2000));
        assert!(!config.quiet);
    }

    #[test]
    fn builder_overrides_single_fields() {
        let config = NodeConfig::builder()
            .ping_interval(Duration::from_millis(50))
            .build();
        assert_eq!(config.ping_interval, Duration::from_millis(50));
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
    }
}
