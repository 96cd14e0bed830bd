//! Synchronous server engine.
//!
//! [`ServiceCore`] is the state of one server process: the stored object
//! states, the connected clients, the master id, the global id allocator and
//! the per-client stream results. It performs no I/O besides pushing frames
//! into client sinks; the actor in [`crate::service`] owns it.
//!
//! # Relay rules
//!
//! - A regular PUSH is merged into the store and relayed to every other
//!   client when this process is a data server.
//! - A share-only PUSH is relayed and never stored. Collaboration bodies
//!   (master change, user name) are applied to the client table first.
//! - Connects and disconnects relay a `ClientsChanged` snapshot.

use std::collections::BTreeMap;

use meridian_proto::{
	Body, ClientId, ClientInfo, CollaborationBody, Command, ErrorCode, Frame, GlobalId, InfoKind,
	InfoRequest, Information, Location, Message, MultiClientsInfo, ServerInformation, ServerRole,
	Stream, Variant,
};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::interpreter::{DefaultInterpreter, StreamInterpreter};


/// Outbound frame queue of one connection.
pub type ClientSink = mpsc::UnboundedSender<Frame>;

/// Stored object states keyed by global id.
#[derive(Debug, Default)]
pub struct ObjectStore {
	states: FxHashMap<GlobalId, Message>,
}

impl ObjectStore {
	/// Stored state of `id`.
	pub fn get(&self, id: GlobalId) -> Option<&Message> {
		self.states.get(&id)
	}

	/// Merges a pushed state into the stored one, inserting when absent.
	pub fn merge(&mut self, msg: &Message) {
		match self.states.get_mut(&msg.global_id) {
			Some(stored) => stored.merge_from(msg),
			None => {
				let mut stored = msg.clone();
				stored.share_only = false;
				self.states.insert(msg.global_id, stored);
			}
		}
	}

	/// Drops the stored state of `id`.
	pub fn remove(&mut self, id: GlobalId) -> Option<Message> {
		self.states.remove(&id)
	}

	/// Number of stored states.
	pub fn len(&self) -> usize {
		self.states.len()
	}

	/// Returns `true` if nothing is stored.
	pub fn is_empty(&self) -> bool {
		self.states.is_empty()
	}
}

/// Hands out global ids in leased blocks.
///
/// Ids observed in pushes advance the allocator so that a lease never
/// overlaps ids that already exist.
#[derive(Debug)]
struct IdAllocator {
	next: u32,
}

impl Default for IdAllocator {
	fn default() -> Self {
		Self {
			next: GlobalId::FIRST_DYNAMIC.0,
		}
	}
}

impl IdAllocator {
	fn reserve(&mut self, count: u32) -> GlobalId {
		let first = self.next;
		self.next = self.next.saturating_add(count);
		GlobalId(first)
	}

	fn observe(&mut self, id: GlobalId) {
		if id.0 >= self.next {
			self.next = id.0.saturating_add(1);
		}
	}
}

struct ClientEntry {
	name: String,
	sink: ClientSink,
}

/// State of one server process.
pub struct ServiceCore {
	role: ServerRole,
	process_count: u32,
	objects: ObjectStore,
	clients: BTreeMap<ClientId, ClientEntry>,
	next_client: u32,
	master: ClientId,
	ids: IdAllocator,
	last_results: FxHashMap<ClientId, Option<Variant>>,
	interpreter: Box<dyn StreamInterpreter>,
	peer_connected: bool,
}

impl std::fmt::Debug for ServiceCore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServiceCore")
			.field("role", &self.role)
			.field("process_count", &self.process_count)
			.field("objects", &self.objects.len())
			.field("clients", &self.clients.keys().collect::<Vec<_>>())
			.field("master", &self.master)
			.field("peer_connected", &self.peer_connected)
			.finish()
	}
}

impl ServiceCore {
	/// Creates an engine with the [`DefaultInterpreter`].
	pub fn new(role: ServerRole, process_count: u32) -> Self {
		Self::with_interpreter(role, process_count, Box::new(DefaultInterpreter))
	}

	/// Creates an engine with a custom stream interpreter.
	pub fn with_interpreter(
		role: ServerRole,
		process_count: u32,
		interpreter: Box<dyn StreamInterpreter>,
	) -> Self {
		Self {
			role,
			process_count: process_count.max(1),
			objects: ObjectStore::default(),
			clients: BTreeMap::new(),
			next_client: 1,
			master: ClientId::NONE,
			ids: IdAllocator::default(),
			last_results: FxHashMap::default(),
			interpreter,
			peer_connected: false,
		}
	}

	/// Role of this process.
	pub fn role(&self) -> ServerRole {
		self.role
	}

	/// Processes reported to clients.
	pub fn process_count(&self) -> u32 {
		self.process_count
	}

	/// Current master, [`ClientId::NONE`] without clients.
	pub fn master(&self) -> ClientId {
		self.master
	}

	/// Stored object states.
	pub fn objects(&self) -> &ObjectStore {
		&self.objects
	}

	/// Registers a connection and returns its id. The first client becomes
	/// master.
	pub fn connect_client(&mut self, user_name: Option<String>, sink: ClientSink) -> ClientId {
		let id = ClientId(self.next_client);
		self.next_client += 1;
		let name = user_name.unwrap_or_else(|| format!("User {}", id.0));
		self.clients.insert(id, ClientEntry { name, sink });
		if self.master == ClientId::NONE {
			self.master = id;
		}
		info!(client_id = %id, master = %self.master, "client connected");
		self.broadcast_clients_changed(id);
		id
	}

	/// Removes a connection. A departing master is replaced by the lowest
	/// remaining client id.
	pub fn disconnect_client(&mut self, id: ClientId) {
		if self.clients.remove(&id).is_none() {
			return;
		}
		self.last_results.remove(&id);
		if self.master == id {
			self.master = self.clients.keys().next().copied().unwrap_or(ClientId::NONE);
			info!(previous = %id, master = %self.master, "master re-elected");
		}
		info!(client_id = %id, "client disconnected");
		self.broadcast_clients_changed(id);
	}

	/// Snapshot of the connected clients as seen by `requester`.
	pub fn clients_info(&self, requester: ClientId) -> MultiClientsInfo {
		MultiClientsInfo {
			requester,
			master: self.master,
			clients: self
				.clients
				.iter()
				.map(|(id, entry)| ClientInfo {
					id: *id,
					name: entry.name.clone(),
				})
				.collect(),
		}
	}

	/// Handles a PUSH from `from`.
	pub fn push(&mut self, from: ClientId, mut msg: Message) {
		msg.client_id = from;
		if msg.share_only {
			if let Body::Collaboration(body) = &msg.body {
				self.apply_collaboration(from, body);
			}
			trace!(global_id = %msg.global_id, client_id = %from, "relaying share-only message");
			self.relay(from, &msg);
			return;
		}

		self.ids.observe(msg.global_id);
		self.objects.merge(&msg);
		debug!(
			global_id = %msg.global_id,
			location = ?msg.location,
			client_id = %from,
			"stored pushed state"
		);
		if self.role.is_data_server() {
			self.relay(from, &msg);
		}
	}

	/// Handles DELETE_SI.
	pub fn delete_si(&mut self, from: ClientId, msg: &Message) {
		if self.objects.remove(msg.global_id).is_some() {
			debug!(global_id = %msg.global_id, client_id = %from, "deleted server-side object");
		}
	}

	/// Handles PULL.
	pub fn pull(&self, msg: &Message) -> Result<Message, ErrorCode> {
		let mut state = self
			.objects
			.get(msg.global_id)
			.cloned()
			.ok_or(ErrorCode::UnknownObject)?;
		state.location = msg.location;
		Ok(state)
	}

	/// Handles EXECUTE_STREAM. The last value produced by a successful
	/// command becomes the caller's LAST_RESULT.
	pub fn execute_stream(
		&mut self,
		from: ClientId,
		ignore_errors: bool,
		stream: &Stream,
	) -> Result<(), ErrorCode> {
		let mut last = None;
		let mut outcome = Ok(());
		for command in &stream.commands {
			match self.interpreter.invoke(&self.objects, command) {
				Ok(result) => last = result,
				Err(e) if ignore_errors => {
					warn!(method = %command.method, target = %command.target, error = %e, "ignored stream error");
				}
				Err(e) => {
					log_stream_error(command, &e);
					outcome = Err(ErrorCode::StreamFailed);
					break;
				}
			}
		}
		self.last_results.insert(from, last);
		outcome
	}

	/// Handles LAST_RESULT.
	pub fn last_result(&self, from: ClientId) -> Option<Variant> {
		self.last_results.get(&from).cloned().flatten()
	}

	/// Handles GATHER_INFORMATION.
	pub fn gather(&self, from: ClientId, req: &InfoRequest) -> Result<Information, ErrorCode> {
		Ok(match req.kind {
			InfoKind::ProcessCount => Information::ProcessCount(self.process_count),
			InfoKind::Server => Information::Server(ServerInformation {
				role: self.role,
				process_count: self.process_count,
				peer_connected: self.peer_connected,
				version: meridian_proto::PROTOCOL_VERSION.to_string(),
			}),
			InfoKind::MultiClients => Information::MultiClients(self.clients_info(from)),
			InfoKind::ObjectState => {
				Information::ObjectState(self.objects.get(req.global_id).cloned())
			}
		})
	}

	/// Leases `count` consecutive global ids.
	pub fn reserve_ids(&mut self, count: u32) -> Result<(GlobalId, u32), ErrorCode> {
		if count == 0 {
			return Err(ErrorCode::InvalidArgs);
		}
		if !self.role.is_data_server() {
			return Err(ErrorCode::Unsupported);
		}
		let first = self.ids.reserve(count);
		debug!(first = %first, count, "leased global ids");
		Ok((first, count))
	}

	/// Records the state of the data-server/render-server link.
	pub fn set_peer_connected(&mut self, connected: bool) {
		self.peer_connected = connected;
	}

	/// Returns `true` if the peer link is up.
	pub fn peer_connected(&self) -> bool {
		self.peer_connected
	}

	fn apply_collaboration(&mut self, from: ClientId, body: &CollaborationBody) {
		match body {
			CollaborationBody::MasterChange { next, .. } => {
				if self.clients.contains_key(next) {
					info!(previous = %self.master, next = %next, "master promoted");
					self.master = *next;
				} else {
					warn!(next = %next, client_id = %from, "promotion of unknown client ignored");
				}
			}
			CollaborationBody::UserName { client, name } => {
				if let Some(entry) = self.clients.get_mut(client) {
					entry.name.clone_from(name);
				}
			}
			CollaborationBody::ClientsChanged(_) => {}
		}
	}

	fn broadcast_clients_changed(&self, cause: ClientId) {
		if !self.role.is_data_server() {
			return;
		}
		let mut msg = Message::new(GlobalId::COLLABORATION_MANAGER, Location::CLIENT).with_body(
			Body::Collaboration(CollaborationBody::ClientsChanged(
				self.clients_info(ClientId::NONE),
			)),
		);
		msg.share_only = true;
		msg.client_id = cause;
		self.relay(cause, &msg);
	}

	fn relay(&self, from: ClientId, msg: &Message) {
		for (id, entry) in &self.clients {
			if *id == from {
				continue;
			}
			if entry.sink.send(Frame::Notify(msg.clone())).is_err() {
				debug!(client_id = %id, "dropping relay to closed connection");
			}
		}
	}
}

fn log_stream_error(command: &Command, e: &crate::interpreter::InterpretError) {
	error!(
		method = %command.method,
		target = %command.target,
		error = %e,
		"stream execution failed"
	);
}
