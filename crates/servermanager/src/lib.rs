//! Client-side server manager.
//!
//! A [`Session`] owns the link to one server (in-process or remote) and the
//! client-side replicas of the objects living there. Everything above the
//! session replicates through [`Message`](proto::Message) snapshots keyed
//! by [`GlobalId`](proto::GlobalId):
//!
//! - [`Proxy`] instances and their [`SessionProxyManager`] registry, whose
//!   state is carried by the [`PipelineState`] object,
//! - the [`CollaborationManager`] for multi-client master/user bookkeeping,
//! - [`UndoStack`] and [`UndoStackBuilder`] recording state transitions.
//!
//! [`ServerManager`] is the process-wide context holding sessions and the
//! proxy definitions.

#![warn(missing_docs)]

pub mod collaboration;
pub mod config;
pub mod definitions;
pub mod error;
pub mod events;
pub mod global_properties;
pub mod links;
pub mod pipeline_state;
pub mod proxy;
pub mod proxy_locator;
pub mod proxy_manager;
pub mod remote_object;
pub mod selection;
pub mod server_manager;
pub mod session;
pub mod state_locator;
pub mod transport;
pub mod undo;
pub mod xml;

#[cfg(test)]
use tracing_subscriber as _;

pub use collaboration::{CollaborationEvent, CollaborationManager};
pub use config::SessionConfig;
pub use definitions::{ProxyDefinition, ProxyDefinitionManager};
pub use error::{ConfigError, Error, Result};
pub use events::{Listeners, Subscription};
pub use global_properties::GlobalPropertiesManager;
pub use links::{Link, PropertyLink, ProxyLink};
pub use meridian_proto as proto;
pub use pipeline_state::PipelineState;
pub use proxy::{Proxy, ProxyEvent};
pub use proxy_locator::{CacheBasedProxyLocator, ProxyLocator, SessionProxyLocator};
pub use proxy_manager::{ProxyManagerEvent, RegistrationDelta, SessionProxyManager, compute_delta};
pub use remote_object::{ObjectHandle, RemoteIdentity, RemoteObject, RemoteObjectRef};
pub use selection::{SelectionCommand, SelectionEvent, SelectionModel};
pub use server_manager::ServerManager;
pub use session::Session;
pub use state_locator::{ServerStateLocator, StateLocator, StateLookup};
pub use transport::{BuiltinTransport, SessionClient, Transport};
pub use undo::{UndoElement, UndoSet, UndoStack, UndoStackBuilder, UndoStackEvent};
pub use xml::{XmlElement, XmlError};
