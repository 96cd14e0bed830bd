//! Resolution of global ids to proxies during state loading.

use std::sync::{Arc, Weak};

use meridian_proto::{GlobalId, Message};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::proxy::Proxy;
use crate::proxy_manager::xml_state;
use crate::remote_object::RemoteObject;
use crate::session::Session;
use crate::state_locator::StateLookup;
use crate::xml::XmlElement;

/// Finds (or recreates) the proxy for a global id.
pub trait ProxyLocator {
	/// Live or recreated proxy for `id`.
	fn locate_proxy(&self, id: GlobalId) -> Option<Arc<Proxy>>;

	/// State snapshot of `id`, used to rebuild missing proxies.
	fn find_state(&self, id: GlobalId) -> Option<Message>;
}

/// Locator backed by a session: live session objects first, then proxies
/// rebuilt from the states of a [`StateLookup`].
///
/// Located proxies are cached, so one locator resolves an id to one
/// instance for its whole lifetime.
pub struct SessionProxyLocator {
	session: Weak<Session>,
	states: Arc<dyn StateLookup>,
	located: Mutex<FxHashMap<GlobalId, Arc<Proxy>>>,
}

impl std::fmt::Debug for SessionProxyLocator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionProxyLocator")
			.field("located", &self.located.lock().len())
			.finish()
	}
}

impl SessionProxyLocator {
	/// Locator over `session` rebuilding from `states`.
	pub fn new(session: Weak<Session>, states: Arc<dyn StateLookup>) -> Self {
		Self {
			session,
			states,
			located: Mutex::default(),
		}
	}

	/// Proxies located so far.
	pub fn located_proxies(&self) -> Vec<Arc<Proxy>> {
		let mut proxies: Vec<_> = self.located.lock().values().cloned().collect();
		proxies.sort_by_key(|p| p.global_id());
		proxies
	}

	/// Forgets located proxies.
	pub fn clear(&self) {
		let released = std::mem::take(&mut *self.located.lock());
		drop(released);
	}

	/// Owning session.
	pub fn session(&self) -> Option<Arc<Session>> {
		self.session.upgrade()
	}

	fn remember(&self, id: GlobalId, proxy: &Arc<Proxy>) {
		self.located.lock().insert(id, proxy.clone());
	}

	/// [`locate_proxy`](ProxyLocator::locate_proxy) with an explicit
	/// locator for the references of rebuilt proxies.
	fn locate_with(&self, id: GlobalId, outer: &dyn ProxyLocator) -> Option<Arc<Proxy>> {
		if id.is_none() {
			return None;
		}
		if let Some(proxy) = self.located.lock().get(&id).cloned() {
			return Some(proxy);
		}
		let session = self.session.upgrade()?;
		if let Some(proxy) = session.get_remote_object(id).and_then(|o| o.as_proxy().cloned()) {
			self.remember(id, &proxy);
			return Some(proxy);
		}
		let proxy = session.proxy_manager().re_new_proxy(id, outer)?;
		self.remember(id, &proxy);
		Some(proxy)
	}
}

impl ProxyLocator for SessionProxyLocator {
	fn locate_proxy(&self, id: GlobalId) -> Option<Arc<Proxy>> {
		self.locate_with(id, self)
	}

	fn find_state(&self, id: GlobalId) -> Option<Message> {
		self.states.find_state(id, true)
	}
}

/// Locator that restores proxies to stored XML snapshots.
///
/// [`store_proxy_state`](Self::store_proxy_state) records a proxy's XML
/// state. Every later lookup of that id reloads the snapshot into the
/// located proxy and pushes it, recreating the proxy from the snapshot when
/// nothing else can provide it.
pub struct CacheBasedProxyLocator {
	base: SessionProxyLocator,
	stored: Mutex<FxHashMap<GlobalId, XmlElement>>,
}

impl std::fmt::Debug for CacheBasedProxyLocator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CacheBasedProxyLocator")
			.field("base", &self.base)
			.field("stored", &self.stored.lock().len())
			.finish()
	}
}

impl CacheBasedProxyLocator {
	/// Locator over `session` rebuilding from `states`.
	pub fn new(session: Weak<Session>, states: Arc<dyn StateLookup>) -> Self {
		Self {
			base: SessionProxyLocator::new(session, states),
			stored: Mutex::default(),
		}
	}

	/// Records the current XML state of `proxy`.
	pub fn store_proxy_state(&self, proxy: &Proxy) {
		let id = proxy.global_id();
		debug!(global_id = %id, "storing proxy snapshot");
		self.stored.lock().insert(id, proxy.save_xml_state());
	}

	/// Returns `true` if a snapshot of `id` is stored.
	pub fn has_stored_state(&self, id: GlobalId) -> bool {
		self.stored.lock().contains_key(&id)
	}

	/// Proxies located so far.
	pub fn located_proxies(&self) -> Vec<Arc<Proxy>> {
		self.base.located_proxies()
	}

	/// Forgets located proxies; stored snapshots stay.
	pub fn clear(&self) {
		self.base.clear();
	}

	fn create_from_snapshot(&self, id: GlobalId, snapshot: &XmlElement) -> Option<Arc<Proxy>> {
		let session = self.base.session()?;
		let state = match xml_state::proxy_message(snapshot) {
			Ok(state) => state,
			Err(e) => {
				warn!(global_id = %id, error = %e, "unreadable proxy snapshot");
				return None;
			}
		};
		let (Some(group), Some(name)) = (&state.xml_group, &state.xml_name) else {
			return None;
		};
		match session.proxy_manager().new_proxy(group, name) {
			Ok(proxy) => {
				proxy.assign_global_id(id);
				self.base.remember(id, &proxy);
				Some(proxy)
			}
			Err(e) => {
				warn!(global_id = %id, error = %e, "cannot recreate proxy from snapshot");
				None
			}
		}
	}
}

impl ProxyLocator for CacheBasedProxyLocator {
	fn locate_proxy(&self, id: GlobalId) -> Option<Arc<Proxy>> {
		let snapshot = self.stored.lock().get(&id).cloned();
		let proxy = self
			.base
			.locate_with(id, self)
			.or_else(|| snapshot.as_ref().and_then(|s| self.create_from_snapshot(id, s)))?;
		if let Some(snapshot) = &snapshot {
			let restored = proxy
				.load_xml_state(snapshot, self)
				.and_then(|()| proxy.update_vtk_objects());
			if let Err(e) = restored {
				warn!(global_id = %id, error = %e, "failed to restore proxy snapshot");
			}
		}
		Some(proxy)
	}

	fn find_state(&self, id: GlobalId) -> Option<Message> {
		self.base.find_state(id)
	}
}
