//! State caches keyed by global id.
//!
//! A [`StateLocator`] answers lookups from its own table and then from an
//! optional parent. The session keeps one as its undo-history cache, with a
//! [`ServerStateLocator`] parent that falls back to pulling from the server.

use std::sync::{Arc, Weak};

use meridian_proto::{GlobalId, Location, Message};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::proxy::Proxy;
use crate::remote_object::RemoteObject;
use crate::session::Session;

/// Lookup interface shared by state locators.
pub trait StateLookup: Send + Sync {
	/// Stores (or replaces) a snapshot.
	fn register_state(&self, state: &Message);

	/// Finds a snapshot, consulting parents when `use_parent` is set.
	fn find_state(&self, id: GlobalId, use_parent: bool) -> Option<Message>;

	/// Drops the local snapshot of `id`. With `force` the removal
	/// propagates to parents.
	fn unregister_state(&self, id: GlobalId, force: bool);

	/// Returns `true` if this locator holds `id` itself.
	fn is_state_local(&self, id: GlobalId) -> bool;

	/// Returns `true` if this locator or a parent holds `id`.
	fn is_state_available(&self, id: GlobalId) -> bool;
}

/// In-memory state cache with an optional parent.
#[derive(Default)]
pub struct StateLocator {
	states: Mutex<FxHashMap<GlobalId, Message>>,
	parent: Option<Arc<dyn StateLookup>>,
}

impl std::fmt::Debug for StateLocator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StateLocator")
			.field("states", &self.states.lock().len())
			.field("has_parent", &self.parent.is_some())
			.finish()
	}
}

impl StateLocator {
	/// Empty locator without parent.
	pub fn new() -> Self {
		Self::default()
	}

	/// Empty locator delegating misses to `parent`.
	pub fn with_parent(parent: Arc<dyn StateLookup>) -> Self {
		Self {
			states: Mutex::default(),
			parent: Some(parent),
		}
	}

	/// Stores the full state of `proxy` and, recursively, its sub-proxies.
	pub fn register_full_state(&self, proxy: &Proxy) {
		if let Some(state) = proxy.full_state() {
			self.register_state(&state);
		}
		for (_, sub) in proxy.sub_proxies() {
			self.register_full_state(sub);
		}
	}

	/// Ids held locally.
	pub fn local_ids(&self) -> Vec<GlobalId> {
		let mut ids: Vec<_> = self.states.lock().keys().copied().collect();
		ids.sort();
		ids
	}

	/// Drops every local snapshot.
	pub fn clear(&self) {
		self.states.lock().clear();
	}
}

impl StateLookup for StateLocator {
	fn register_state(&self, state: &Message) {
		trace!(global_id = %state.global_id, "state registered");
		self.states.lock().insert(state.global_id, state.clone());
	}

	fn find_state(&self, id: GlobalId, use_parent: bool) -> Option<Message> {
		if let Some(state) = self.states.lock().get(&id).cloned() {
			return Some(state);
		}
		match &self.parent {
			Some(parent) if use_parent => parent.find_state(id, true),
			_ => None,
		}
	}

	fn unregister_state(&self, id: GlobalId, force: bool) {
		self.states.lock().remove(&id);
		if force && let Some(parent) = &self.parent {
			parent.unregister_state(id, true);
		}
	}

	fn is_state_local(&self, id: GlobalId) -> bool {
		self.states.lock().contains_key(&id)
	}

	fn is_state_available(&self, id: GlobalId) -> bool {
		self.is_state_local(id) || self.parent.as_ref().is_some_and(|p| p.is_state_available(id))
	}
}

/// State locator that pulls misses from the server.
///
/// Pulled states are cached; a lookup only succeeds when the pulled state
/// carries object type metadata.
pub struct ServerStateLocator {
	local: StateLocator,
	session: Weak<Session>,
}

impl std::fmt::Debug for ServerStateLocator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServerStateLocator")
			.field("local", &self.local)
			.finish()
	}
}

impl ServerStateLocator {
	/// Locator pulling through `session`.
	pub fn new(session: Weak<Session>) -> Self {
		Self {
			local: StateLocator::new(),
			session,
		}
	}
}

impl StateLookup for ServerStateLocator {
	fn register_state(&self, state: &Message) {
		self.local.register_state(state);
	}

	fn find_state(&self, id: GlobalId, use_parent: bool) -> Option<Message> {
		if let Some(state) = self.local.find_state(id, use_parent) {
			return Some(state);
		}
		let session = self.session.upgrade()?;
		let request = Message::new(id, Location::DATA_SERVER_ROOT);
		match session.pull_state(&request) {
			Ok(state) => {
				self.local.register_state(&state);
				state.has_type().then_some(state)
			}
			Err(e) => {
				debug!(global_id = %id, error = %e, "server has no state");
				None
			}
		}
	}

	fn unregister_state(&self, id: GlobalId, force: bool) {
		self.local.unregister_state(id, force);
	}

	fn is_state_local(&self, id: GlobalId) -> bool {
		self.local.is_state_local(id)
	}

	fn is_state_available(&self, id: GlobalId) -> bool {
		self.find_state(id, true).is_some()
	}
}
