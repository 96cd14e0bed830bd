//! Links between a [`Session`](crate::Session) and its server processes.
//!
//! - [`BuiltinTransport`]: the server engine runs in process.
//! - [`SessionClient`]: remote data (and optionally render) server over TCP.

use meridian_proto::{ClientId, GlobalId, InfoRequest, Information, Location, Message, Stream, Variant};

use crate::error::Result;

mod builtin;
mod client;
mod controller;

pub use builtin::BuiltinTransport;
pub use client::SessionClient;

/// Operations a session routes to its servers.
///
/// Every call is synchronous; remote implementations block on the reply
/// within the configured request timeout.
pub trait Transport: Send + Sync {
	/// Sends a state to the processes in its location.
	fn push_state(&self, msg: &Message) -> Result<()>;

	/// Fetches a state from the highest-priority process in its location.
	fn pull_state(&self, msg: &Message) -> Result<Message>;

	/// Tells the processes in the location to drop an object.
	fn delete_si(&self, msg: &Message) -> Result<()>;

	/// Runs a command stream.
	fn execute_stream(&self, location: Location, stream: &Stream, ignore_errors: bool) -> Result<()>;

	/// Result of this client's previous stream at `location`.
	fn last_result(&self, location: Location) -> Result<Option<Variant>>;

	/// Gathers and aggregates information from every process in `location`.
	fn gather_information(&self, location: Location, req: &InfoRequest) -> Result<Information>;

	/// Leases `count` global ids, returning the first.
	fn reserve_global_ids(&self, count: u32) -> Result<(GlobalId, u32)>;

	/// Id assigned by the data server, [`ClientId::NONE`] in process.
	fn client_id(&self) -> ClientId;

	/// Returns `true` while every connection is up.
	fn is_alive(&self) -> bool;

	/// Returns `true` for in-process servers.
	fn is_builtin(&self) -> bool;

	/// Takes the notifications relayed since the last call.
	fn drain_notifications(&self) -> Vec<Message>;

	/// Aborts pending and future blocking calls.
	fn cancel(&self);
}
