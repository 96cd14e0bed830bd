//! Multi-client collaboration.
//!
//! The [`CollaborationManager`] sends share-only messages to the other
//! clients of a session and tracks the master client. Its view of the
//! connected clients is a cached snapshot refreshed by
//! [`update_master_information`](CollaborationManager::update_master_information)
//! and by the notifications the server relays.

use std::sync::{Arc, Weak};

use meridian_proto::{
	Body, ClientId, ClientInfo, CollaborationBody, GlobalId, InfoKind, InfoRequest, Information,
	Location, Message, MultiClientsInfo, SelectionState,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::proxy_locator::ProxyLocator;
use crate::remote_object::{ObjectHandle, RemoteIdentity, RemoteObject};
use crate::selection::SELECTION_GROUP;
use crate::session::Session;

/// Collaboration notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum CollaborationEvent {
	/// A message from another client arrived. Fired once per message.
	Notification(Message),
	/// The master changed.
	MasterChanged {
		/// Master before the change.
		previous: ClientId,
		/// Master after the change.
		next: ClientId,
	},
	/// A client connected or disconnected.
	ClientsChanged(MultiClientsInfo),
	/// A client published a new user name.
	UserNameChanged {
		/// Renamed client.
		client: ClientId,
		/// New name.
		name: String,
	},
}

/// Master tracking and client-to-client messaging of one session.
pub struct CollaborationManager {
	this: Weak<CollaborationManager>,
	identity: RemoteIdentity,
	info: Mutex<MultiClientsInfo>,
	/// Last selection state per `(model name, client)`.
	selections: Mutex<FxHashMap<(String, ClientId), SelectionState>>,
	events: Listeners<CollaborationEvent>,
}

impl std::fmt::Debug for CollaborationManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CollaborationManager")
			.field("info", &*self.info.lock())
			.finish()
	}
}

impl CollaborationManager {
	pub(crate) fn new(session: Weak<Session>) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			identity: RemoteIdentity::reserved(
				session,
				GlobalId::COLLABORATION_MANAGER,
				Location::CLIENT,
			),
			info: Mutex::default(),
			selections: Mutex::default(),
			events: Listeners::default(),
		})
	}

	/// Subscribes to collaboration notifications.
	pub fn subscribe(
		&self,
		callback: impl Fn(&CollaborationEvent) + Send + Sync + 'static,
	) -> Subscription {
		self.events.subscribe(callback)
	}

	fn session(&self) -> Result<Arc<Session>> {
		self.identity.session().ok_or(Error::Disconnected)
	}

	/// Delivers `msg` to every other client of the session. It is never
	/// stored server-side.
	pub fn send_to_other_clients(&self, mut msg: Message) -> Result<()> {
		msg.share_only = true;
		if msg.location.is_empty() {
			msg.location = Location::CLIENT;
		}
		trace!(global_id = %msg.global_id, "sending to other clients");
		self.session()?.push_state(&msg)
	}

	/// Makes `client` the master. The other clients learn about it from the
	/// same message that changes the server-side master.
	pub fn promote_to_master(&self, client: ClientId) -> Result<()> {
		let previous = self.master_id();
		if previous == client {
			return Ok(());
		}
		let msg = Message::new(GlobalId::COLLABORATION_MANAGER, Location::CLIENT).with_body(
			Body::Collaboration(CollaborationBody::MasterChange {
				previous,
				next: client,
			}),
		);
		self.send_to_other_clients(msg)?;
		self.info.lock().master = client;
		info!(previous = %previous, next = %client, "master promoted");
		self.events.emit(&CollaborationEvent::MasterChanged {
			previous,
			next: client,
		});
		Ok(())
	}

	/// Refreshes the cached client list from the data server.
	pub fn update_master_information(&self) -> Result<()> {
		let info = self.session()?.gather_information(
			Location::DATA_SERVER_ROOT,
			&InfoRequest::new(InfoKind::MultiClients),
		)?;
		let Information::MultiClients(info) = info else {
			return Err(Error::InvalidState(
				"multi-clients request answered with other information".into(),
			));
		};
		debug!(master = %info.master, clients = info.clients.len(), "collaboration information updated");
		*self.info.lock() = info;
		Ok(())
	}

	/// Cached master id.
	pub fn master_id(&self) -> ClientId {
		self.info.lock().master
	}

	/// Id of this client.
	pub fn user_id(&self) -> ClientId {
		self.identity
			.session()
			.map_or(ClientId::NONE, |s| s.client_id())
	}

	/// Returns `true` if this client is the cached master.
	pub fn is_master(&self) -> bool {
		self.master_id() == self.user_id()
	}

	/// Cached user name of `client`.
	pub fn user_name(&self, client: ClientId) -> Option<String> {
		self.info.lock().user_name(client).map(str::to_string)
	}

	/// Cached connected clients.
	pub fn clients(&self) -> Vec<ClientInfo> {
		self.info.lock().clients.clone()
	}

	/// Publishes the user name of this client.
	pub fn set_user_name(&self, name: &str) -> Result<()> {
		let client = self.user_id();
		let msg = Message::new(GlobalId::COLLABORATION_MANAGER, Location::CLIENT).with_body(
			Body::Collaboration(CollaborationBody::UserName {
				client,
				name: name.to_string(),
			}),
		);
		self.send_to_other_clients(msg)?;
		set_name(&mut self.info.lock(), client, name);
		Ok(())
	}

	/// Applies a share-only message relayed from another client.
	pub fn handle_notification(&self, msg: &Message) {
		self.events
			.emit(&CollaborationEvent::Notification(msg.clone()));
		match &msg.body {
			Body::Collaboration(CollaborationBody::MasterChange { previous, next }) => {
				self.info.lock().master = *next;
				debug!(previous = %previous, next = %next, "master changed remotely");
				self.events.emit(&CollaborationEvent::MasterChanged {
					previous: *previous,
					next: *next,
				});
				self.follow_master(*next);
			}
			Body::Collaboration(CollaborationBody::ClientsChanged(update)) => {
				let snapshot = {
					let mut info = self.info.lock();
					let requester = info.requester;
					*info = update.clone();
					info.requester = requester;
					info.clone()
				};
				self.events
					.emit(&CollaborationEvent::ClientsChanged(snapshot));
			}
			Body::Collaboration(CollaborationBody::UserName { client, name }) => {
				set_name(&mut self.info.lock(), *client, name);
				self.events.emit(&CollaborationEvent::UserNameChanged {
					client: *client,
					name: name.clone(),
				});
			}
			Body::Selection(state) => self.handle_selection(msg, state),
			_ => trace!(global_id = %msg.global_id, "unhandled share-only message"),
		}
	}

	/// Caches a remote selection and applies it when it comes from the
	/// master while this client is not master.
	fn handle_selection(&self, msg: &Message, state: &SelectionState) {
		if msg.xml_group.as_deref() != Some(SELECTION_GROUP) {
			trace!(global_id = %msg.global_id, "selection message outside the selection group");
			return;
		}
		let Some(model) = msg.xml_name.clone() else {
			warn!(global_id = %msg.global_id, "selection message without model name");
			return;
		};
		self.selections
			.lock()
			.insert((model.clone(), msg.client_id), state.clone());
		if msg.client_id == self.master_id() && !self.is_master() {
			self.apply_selection(&model, state);
		}
	}

	/// Catches up with the cached selections of the new master.
	fn follow_master(&self, master: ClientId) {
		if master == self.user_id() {
			return;
		}
		let cached: Vec<(String, SelectionState)> = self
			.selections
			.lock()
			.iter()
			.filter(|((_, client), _)| *client == master)
			.map(|((model, _), state)| (model.clone(), state.clone()))
			.collect();
		for (model, state) in cached {
			self.apply_selection(&model, &state);
		}
	}

	fn apply_selection(&self, model: &str, state: &SelectionState) {
		let Some(session) = self.identity.session() else {
			return;
		};
		match session.proxy_manager().get_selection_model(model) {
			Some(model) => model.apply_remote(state),
			None => trace!(model, "no local selection model"),
		}
	}

	/// Last selection state `client` sent for `model`.
	pub fn cached_selection(&self, model: &str, client: ClientId) -> Option<SelectionState> {
		self.selections
			.lock()
			.get(&(model.to_string(), client))
			.cloned()
	}
}

fn set_name(info: &mut MultiClientsInfo, client: ClientId, name: &str) {
	if let Some(entry) = info.clients.iter_mut().find(|c| c.id == client) {
		entry.name = name.to_string();
	}
}

impl RemoteObject for CollaborationManager {
	fn identity(&self) -> &RemoteIdentity {
		&self.identity
	}

	fn handle(&self) -> ObjectHandle {
		ObjectHandle::Collaboration(self.this.clone())
	}

	fn full_state(&self) -> Option<Message> {
		None
	}

	fn load_state(&self, state: &Message, _locator: &dyn ProxyLocator) -> Result<()> {
		self.handle_notification(state);
		Ok(())
	}
}
