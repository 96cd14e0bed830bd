//! Information gathering requests and their aggregated results.

use serde::{Deserialize, Serialize};

use crate::ids::GlobalId;
use crate::message::{Message, MultiClientsInfo};
use crate::variant::Variant;
use crate::wire::ServerRole;

/// Information classes a server can gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoKind {
	/// Number of processes behind the connection.
	ProcessCount,
	/// Role, process count and peer link status.
	Server,
	/// Connected clients and the master id.
	MultiClients,
	/// Stored state of one object.
	ObjectState,
}

impl InfoKind {
	/// Class name used in logs.
	pub fn class_name(self) -> &'static str {
		match self {
			Self::ProcessCount => "ProcessCountInformation",
			Self::Server => "ServerInformation",
			Self::MultiClients => "MultiClientsInformation",
			Self::ObjectState => "ObjectStateInformation",
		}
	}
}

/// GATHER_INFORMATION payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoRequest {
	/// Information class.
	pub kind: InfoKind,
	/// Object the information is about, if any.
	pub global_id: GlobalId,
	/// Class-specific parameters.
	pub params: Vec<Variant>,
}

impl InfoRequest {
	/// Request without object or parameters.
	pub fn new(kind: InfoKind) -> Self {
		Self {
			kind,
			global_id: GlobalId::NONE,
			params: Vec::new(),
		}
	}
}

/// Server description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInformation {
	/// Role of the answering server.
	pub role: ServerRole,
	/// Processes behind the connection.
	pub process_count: u32,
	/// Whether the data-server/render-server peer link is up.
	pub peer_connected: bool,
	/// Protocol version.
	pub version: String,
}

/// Gathered information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Information {
	/// Process count.
	ProcessCount(u32),
	/// Server description.
	Server(ServerInformation),
	/// Connected clients.
	MultiClients(MultiClientsInfo),
	/// Stored object state, `None` when the object is unknown.
	ObjectState(Option<Message>),
}

impl Information {
	/// Combines information gathered from several processes.
	///
	/// Process counts take the maximum, peer status is true if any side
	/// reports it and the first available client list or object state wins.
	pub fn merge(&mut self, other: Information) {
		match (self, other) {
			(Self::ProcessCount(a), Self::ProcessCount(b)) => *a = (*a).max(b),
			(Self::Server(a), Self::Server(b)) => {
				a.process_count = a.process_count.max(b.process_count);
				a.peer_connected |= b.peer_connected;
			}
			(Self::MultiClients(a), Self::MultiClients(b)) => {
				if a.clients.is_empty() {
					*a = b;
				}
			}
			(Self::ObjectState(a), Self::ObjectState(b)) => {
				if a.is_none() {
					*a = b;
				}
			}
			(this, other) => {
				tracing::warn!(
					left = ?std::mem::discriminant(&*this),
					right = ?std::mem::discriminant(&other),
					"ignoring information of mismatched class"
				);
			}
		}
	}
}
