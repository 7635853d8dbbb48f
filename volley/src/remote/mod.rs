//! Remote coordination over HTTP
//!
//! The layer is built from a handful of pieces, each usable on its own:
//!
//! - [`HttpServer`]: the transport, an axum listener whose route table can change
//!   while it is serving.
//! - [`Endpoint`] and [`EndpointClient`]: a set of named methods served at
//!   `/remote/{id}`, and the client that calls them with JSON parameter lists.
//! - [`install_remote_handler`]: turns a process into a worker host. Controllers
//!   install workers by POSTing an [`InstallSpec`] to `/remote`; the worker looks
//!   the requested operations up in its [`OperationRegistry`].
//! - [`Slave`] and [`Cluster`]: the controller side. A cluster installs one worker
//!   per host, tracks their heartbeats and reports when the fleet converges on a
//!   state.
//!
//! ```text
//! controller                               worker host
//!   Cluster ── POST /remote {InstallSpec} ──▶ NodeHost ─▶ SlaveNode (/remote/{id})
//!   master endpoint ◀── updateSlaveState_ [id, state] ── heartbeat
//!   Slave::call ── POST /remote/{id}/{method} ──▶ registered operation
//! ```
mod client;
mod cluster;
mod endpoint;
mod error;
mod node;
mod slave;
mod transport;

pub use client::{CallResponse, ClientEvent, EndpointClient, PendingCall, origin_of, split_url};
pub use cluster::{Cluster, ClusterEvent, ClusterSpec, ClusterState};
pub use endpoint::{Endpoint, EndpointState, SETUP_METHOD};
pub use error::{ClientError, MethodError, TransportError};
pub use node::{
    INSTALL_PATH, InstallSpec, MethodDef, NodeHost, Operation, OperationRegistry, SlaveContext,
    SlaveNode, UPDATE_STATE_METHOD, install_remote_handler,
};
pub use slave::{MasterInfo, Slave, SlaveEvent, SlaveState, parse_host};
pub use transport::{Handler, HttpServer, ServerState, TransportRequest, TransportResponse};
