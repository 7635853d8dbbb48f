//! Volley: profile-driven load generation for Rust, with mergeable statistics and
//! a small HTTP layer for running the same test on a fleet of workers.
//!
//! A test is a step (any async function) called over and over by a number of
//! concurrent users, at a target rate. Both the user count and the rate can follow
//! a piecewise-linear [`Profile`] over time. Every call produces an [`Outcome`],
//! which [`Monitor`]s fold into statistics: latency histograms, result codes,
//! byte counts, unique keys, peaks and rates. Statistics only keep raw data, so the
//! snapshots of many workers merge into one view on the controller.
//!
//! # Architecture
//!
//! - [`executor`]: [`Loop`] calls a step until a condition fails, optionally
//!   rate-limited. [`MultiLoop`] runs many of them and reshapes concurrency and
//!   rate every second according to its profiles.
//! - [`stats`]: the statistic kinds and their merge rules.
//! - [`monitor`]: collectors that turn call outcomes into statistics, grouped in
//!   [`Monitor`]s and [`MonitorGroup`]s which publish interval and cumulative
//!   snapshots.
//! - [`remote`]: an HTTP transport, named-method endpoints and their clients, and
//!   on top of those the [`Cluster`] that installs workers and tracks their state.
//! - [`loadtest`]: the [`LoadTest`] runner for a list of [`TestSpec`]s, locally or
//!   on a cluster through [`LoadTestCluster`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use volley::{LoadTest, NodeConfig, StepRegistry, TestSpec, http_step};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> volley::Result<()> {
//!     let mut steps = StepRegistry::new();
//!     steps.register("http", http_step(reqwest::Client::new()));
//!
//!     let mut spec = TestSpec::new("homepage", "http");
//!     spec.num_users = 20;
//!     spec.target_rps = Some(200.0);
//!     spec.time_limit = Some(30.0);
//!     spec.args = json!({"url": "http://localhost:3000/"});
//!
//!     let config = NodeConfig::builder()
//!         .monitor_interval(Duration::from_secs(5))
//!         .build();
//!     let test = LoadTest::run(vec![spec], &steps, &config)?;
//!     test.wait().await;
//!     println!("{}", serde_json::to_string_pretty(&test.summary())?);
//!     Ok(())
//! }
//! ```
//!
//! Runnable programs live in `demos/`: `local` runs a test in process, `fleet`
//! starts workers and a controller and runs the same test on all of them.

/// Node and client settings
pub mod config;
/// Construction errors
pub mod error;
/// Loops, multi-loops and load profiles
pub mod executor;
/// Load tests, local and distributed
pub mod loadtest;
/// Collectors and monitors
pub mod monitor;
/// HTTP coordination of worker fleets
pub mod remote;
/// Mergeable statistics
pub mod stats;

pub use config::{ClientConfig, NodeConfig};
pub use error::{Error, Result};
pub use executor::{Loop, MultiLoop, MultiLoopSpec, Profile, Step};
pub use loadtest::{
    LoadTest, LoadTestCluster, LoadTestClusterConfig, LoadTestEvent, StepRegistry, TestSpec,
    http_step, load_test_operations,
};
pub use monitor::{Monitor, MonitorGroup, Outcome};
pub use remote::{Cluster, ClusterSpec, HttpServer, install_remote_handler};
pub use stats::{Stat, Statistic, StatsGroup};

/// Attribute macros for custom statistics and wire messages
pub mod macros {
    pub use volley_macros::*;
}
