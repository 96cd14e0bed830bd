//! Server process engine for meridian.
//!
//! A server process holds the authoritative store of pushed object states,
//! leases global ids to clients, runs command streams and relays
//! collaboration traffic between connected clients. All mutation goes
//! through one actor task ([`service::CoreService`]); the socket layer in
//! [`ipc`] only talks to its [`service::CoreHandle`].

#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod error;
pub mod interpreter;
pub mod ipc;
pub mod service;

pub use config::ServerConfig;
pub use crate::core::{ClientSink, ObjectStore, ServiceCore};
pub use error::{ConfigError, ServerError};
pub use ipc::ServerContext;
pub use meridian_proto as proto;
pub use service::{CoreHandle, CoreService};
