//! Per-session proxy registry.
//!
//! [`SessionProxyManager`] owns every registered proxy under
//! `(group, name)` keys, plus links, global properties managers and
//! selection models. Its full state is replicated through the
//! [`PipelineState`] object: every registration change re-pushes it, and
//! loading a state applies the registration delta.
//!
//! # Delta application
//!
//! [`load_state`](SessionProxyManager::load_state) registers the missing
//! tuples before unregistering the stale ones, so a proxy moving between
//! names is never left without a registration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use meridian_proto::{Body, GlobalId, Location, Message, ProxyManagerState, Registration};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, trace, warn};

use crate::definitions::{ProxyDefinition, ProxyDefinitionManager};
use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::global_properties::GlobalPropertiesManager;
use crate::links::Link;
use crate::pipeline_state::PipelineState;
use crate::proxy::{Proxy, ProxyEvent};
use crate::proxy_locator::{ProxyLocator, SessionProxyLocator};
use crate::remote_object::RemoteObject;
use crate::selection::SelectionModel;
use crate::session::Session;
use crate::state_locator::{StateLocator, StateLookup};
use crate::xml::XmlElement;

pub mod xml_state;

#[cfg(test)]
mod tests;

use xml_state::StateDocument;

/// Groups updated first, in this order, by bulk updates and state loads.
/// Later groups may read the state of earlier ones.
pub const GROUP_ORDER: [&str; 4] = ["sources", "lookup_tables", "representations", "scalar_bars"];

fn group_rank(group: &str) -> usize {
	GROUP_ORDER
		.iter()
		.position(|g| *g == group)
		.unwrap_or(GROUP_ORDER.len())
}

/// Registry notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyManagerEvent {
	/// A proxy was registered.
	Registered(Registration),
	/// A proxy was unregistered.
	Unregistered(Registration),
	/// A property of a registered proxy changed.
	PropertyModified {
		/// Registration of the proxy.
		registration: Registration,
		/// Changed property.
		property: String,
	},
	/// A registered proxy pushed its pending changes.
	ProxyUpdated(Registration),
	/// A manager state was loaded.
	StateLoaded,
}

/// Partition of two registration sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationDelta {
	/// In the incoming set only.
	pub to_register: Vec<Registration>,
	/// In the current set only.
	pub to_unregister: Vec<Registration>,
}

impl RegistrationDelta {
	/// Returns `true` if both sets were equal.
	pub fn is_empty(&self) -> bool {
		self.to_register.is_empty() && self.to_unregister.is_empty()
	}
}

/// `(incoming \ current, current \ incoming)`.
pub fn compute_delta(
	current: &BTreeSet<Registration>,
	incoming: &BTreeSet<Registration>,
) -> RegistrationDelta {
	RegistrationDelta {
		to_register: incoming.difference(current).cloned().collect(),
		to_unregister: current.difference(incoming).cloned().collect(),
	}
}

struct Entry {
	proxy: Arc<Proxy>,
	_subscription: Subscription,
}

/// `group -> name -> proxies`, most recent registration first.
type Registry = BTreeMap<String, BTreeMap<String, Vec<Entry>>>;

/// Guard returned by [`SessionProxyManager::suspend_state_updates`].
#[derive(Debug)]
pub struct SuspendStateUpdates<'a> {
	manager: &'a SessionProxyManager,
}

impl Drop for SuspendStateUpdates<'_> {
	fn drop(&mut self) {
		self.manager.suspended.fetch_sub(1, Ordering::AcqRel);
	}
}

/// Registry of the proxies of one session.
pub struct SessionProxyManager {
	this: Weak<SessionProxyManager>,
	session: Weak<Session>,
	definitions: Arc<ProxyDefinitionManager>,
	registry: Mutex<Registry>,
	links: Mutex<IndexMap<String, Link>>,
	global_properties: Mutex<IndexMap<String, (Arc<GlobalPropertiesManager>, Subscription)>>,
	selection_models: Mutex<IndexMap<String, Arc<SelectionModel>>>,
	prototypes: Mutex<FxHashMap<(String, String), Arc<Proxy>>>,
	pipeline_state: Arc<PipelineState>,
	suspended: AtomicUsize,
	events: Listeners<ProxyManagerEvent>,
}

impl std::fmt::Debug for SessionProxyManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionProxyManager")
			.field("registrations", &self.registrations().len())
			.field("links", &self.links.lock().len())
			.finish()
	}
}

impl SessionProxyManager {
	pub(crate) fn new(session: Weak<Session>, definitions: Arc<ProxyDefinitionManager>) -> Arc<Self> {
		Arc::new_cyclic(|this: &Weak<Self>| Self {
			this: this.clone(),
			pipeline_state: PipelineState::new(session.clone(), this.clone()),
			session,
			definitions,
			registry: Mutex::default(),
			links: Mutex::default(),
			global_properties: Mutex::default(),
			selection_models: Mutex::default(),
			prototypes: Mutex::default(),
			suspended: AtomicUsize::new(0),
			events: Listeners::default(),
		})
	}

	/// Remote object carrying this manager's state.
	pub fn pipeline_state(&self) -> &Arc<PipelineState> {
		&self.pipeline_state
	}

	/// Proxy definitions in use.
	pub fn definitions(&self) -> &Arc<ProxyDefinitionManager> {
		&self.definitions
	}

	/// Owning session.
	pub fn session(&self) -> Option<Arc<Session>> {
		self.session.upgrade()
	}

	/// Subscribes to registry notifications.
	pub fn subscribe(
		&self,
		callback: impl Fn(&ProxyManagerEvent) + Send + Sync + 'static,
	) -> Subscription {
		self.events.subscribe(callback)
	}

	/// New unregistered proxy of the given definition.
	pub fn new_proxy(&self, group: &str, name: &str) -> Result<Arc<Proxy>> {
		let definition = self.definition(group, name)?;
		Proxy::create(&self.session, definition, &self.definitions, false)
	}

	/// Cached prototype of the given definition. Prototypes have an empty
	/// location and never reach a server.
	pub fn prototype(&self, group: &str, name: &str) -> Result<Arc<Proxy>> {
		let key = (group.to_string(), name.to_string());
		if let Some(proto) = self.prototypes.lock().get(&key) {
			return Ok(proto.clone());
		}
		let definition = self.definition(group, name)?;
		let proto = Proxy::create(&self.session, definition, &self.definitions, true)?;
		Ok(self.prototypes.lock().entry(key).or_insert(proto).clone())
	}

	fn definition(&self, group: &str, name: &str) -> Result<Arc<ProxyDefinition>> {
		self.definitions
			.get(group, name)
			.ok_or_else(|| Error::UnknownDefinition {
				group: group.to_string(),
				name: name.to_string(),
			})
	}

	/// Registers `proxy` as `(group, name)`, creating its server-side
	/// objects first. Registering the same tuple twice is a no-op.
	pub fn register_proxy(&self, group: &str, name: &str, proxy: &Arc<Proxy>) -> Result<()> {
		proxy.create_vtk_objects()?;
		let global_id = proxy.try_global_id()?;
		let registration = Registration {
			group: group.to_string(),
			name: name.to_string(),
			global_id,
		};
		{
			let mut registry = self.registry.lock();
			let entries = registry
				.entry(registration.group.clone())
				.or_default()
				.entry(registration.name.clone())
				.or_default();
			if entries.iter().any(|e| Arc::ptr_eq(&e.proxy, proxy)) {
				return Ok(());
			}
			entries.insert(
				0,
				Entry {
					proxy: proxy.clone(),
					_subscription: self.observe(proxy, registration.clone()),
				},
			);
		}
		debug!(group, name, global_id = %global_id, "proxy registered");
		self.events.emit(&ProxyManagerEvent::Registered(registration));
		self.pipeline_state.validate_state()
	}

	fn observe(&self, proxy: &Proxy, registration: Registration) -> Subscription {
		let manager = self.this.clone();
		proxy.subscribe(move |event| {
			let Some(manager) = manager.upgrade() else {
				return;
			};
			let event = match event {
				ProxyEvent::PropertyModified(property) => ProxyManagerEvent::PropertyModified {
					registration: registration.clone(),
					property: property.clone(),
				},
				ProxyEvent::UpdateVtkObjects => ProxyManagerEvent::ProxyUpdated(registration.clone()),
				ProxyEvent::StateLoaded => return,
			};
			manager.events.emit(&event);
		})
	}

	/// Removes the registration of `proxy` as `(group, name)`.
	pub fn unregister_proxy(&self, group: &str, name: &str, proxy: &Proxy) -> Result<bool> {
		let removed = self.remove_entries(|g, n, p| g == group && n == name && std::ptr::eq(p, proxy));
		self.finish_unregister(removed)
	}

	/// Removes every proxy registered as `(group, name)`.
	pub fn unregister_proxies_named(&self, group: &str, name: &str) -> Result<bool> {
		let removed = self.remove_entries(|g, n, _| g == group && n == name);
		self.finish_unregister(removed)
	}

	/// Removes every registration.
	pub fn unregister_all_proxies(&self) -> Result<bool> {
		let removed = self.remove_entries(|_, _, _| true);
		self.finish_unregister(removed)
	}

	fn unregister_registration(&self, reg: &Registration) -> Vec<(Registration, Entry)> {
		self.remove_entries(|g, n, p| {
			g == reg.group && n == reg.name && p.identity().peek_global_id() == reg.global_id
		})
	}

	fn remove_entries(
		&self,
		mut matches: impl FnMut(&str, &str, &Proxy) -> bool,
	) -> Vec<(Registration, Entry)> {
		let mut removed = Vec::new();
		let mut registry = self.registry.lock();
		for (group, names) in registry.iter_mut() {
			for (name, entries) in names.iter_mut() {
				let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(entries)
					.into_iter()
					.partition(|e| matches(group.as_str(), name.as_str(), &*e.proxy));
				*entries = kept;
				removed.extend(gone.into_iter().map(|e| {
					let registration = Registration {
						group: group.clone(),
						name: name.clone(),
						global_id: e.proxy.identity().peek_global_id(),
					};
					(registration, e)
				}));
			}
			names.retain(|_, entries| !entries.is_empty());
		}
		registry.retain(|_, names| !names.is_empty());
		removed
	}

	/// Emits the notifications and pushes the new state before the removed
	/// proxies are released.
	fn finish_unregister(&self, removed: Vec<(Registration, Entry)>) -> Result<bool> {
		if removed.is_empty() {
			return Ok(false);
		}
		for (registration, _) in &removed {
			debug!(group = %registration.group, name = %registration.name, global_id = %registration.global_id, "proxy unregistered");
			self.events
				.emit(&ProxyManagerEvent::Unregistered(registration.clone()));
		}
		let pushed = self.pipeline_state.validate_state();
		drop(removed);
		pushed.map(|()| true)
	}

	/// Most recent proxy registered as `(group, name)`.
	pub fn get_proxy(&self, group: &str, name: &str) -> Option<Arc<Proxy>> {
		self.registry
			.lock()
			.get(group)?
			.get(name)?
			.first()
			.map(|e| e.proxy.clone())
	}

	/// Every proxy registered as `(group, name)`, most recent first.
	pub fn get_proxies(&self, group: &str, name: &str) -> Vec<Arc<Proxy>> {
		self.registry
			.lock()
			.get(group)
			.and_then(|names| names.get(name))
			.map(|entries| entries.iter().map(|e| e.proxy.clone()).collect())
			.unwrap_or_default()
	}

	/// Name under which `proxy` is registered in `group`.
	pub fn get_proxy_name(&self, group: &str, proxy: &Proxy) -> Option<String> {
		let registry = self.registry.lock();
		registry.get(group)?.iter().find_map(|(name, entries)| {
			entries
				.iter()
				.any(|e| std::ptr::eq(Arc::as_ptr(&e.proxy), proxy))
				.then(|| name.clone())
		})
	}

	/// `(name, proxy)` pairs of `group`, ordered by name.
	pub fn proxies_in_group(&self, group: &str) -> Vec<(String, Arc<Proxy>)> {
		let registry = self.registry.lock();
		let Some(names) = registry.get(group) else {
			return Vec::new();
		};
		names
			.iter()
			.flat_map(|(name, entries)| entries.iter().map(|e| (name.clone(), e.proxy.clone())))
			.collect()
	}

	/// Returns `true` if `proxy` is registered under any name.
	pub fn is_registered(&self, proxy: &Proxy) -> bool {
		self.registry.lock().values().any(|names| {
			names
				.values()
				.flatten()
				.any(|e| std::ptr::eq(Arc::as_ptr(&e.proxy), proxy))
		})
	}

	/// Registered groups.
	pub fn group_names(&self) -> Vec<String> {
		self.registry.lock().keys().cloned().collect()
	}

	/// Current registration tuples.
	pub fn registrations(&self) -> BTreeSet<Registration> {
		let registry = self.registry.lock();
		let mut set = BTreeSet::new();
		for (group, names) in registry.iter() {
			for (name, entries) in names {
				for entry in entries {
					set.insert(Registration {
						group: group.clone(),
						name: name.clone(),
						global_id: entry.proxy.identity().peek_global_id(),
					});
				}
			}
		}
		set
	}

	/// Registrations that replicate, i.e. all but prototypes.
	fn shared_registrations(&self) -> BTreeSet<Registration> {
		let registry = self.registry.lock();
		let mut set = BTreeSet::new();
		for (group, names) in registry.iter() {
			for (name, entries) in names {
				for entry in entries.iter().filter(|e| !e.proxy.is_prototype()) {
					set.insert(Registration {
						group: group.clone(),
						name: name.clone(),
						global_id: entry.proxy.identity().peek_global_id(),
					});
				}
			}
		}
		set
	}

	fn ordered_proxies(&self) -> Vec<Arc<Proxy>> {
		let registry = self.registry.lock();
		let mut groups: Vec<_> = registry.iter().collect();
		groups.sort_by_key(|(group, _)| group_rank(group));
		let mut seen = FxHashSet::default();
		groups
			.into_iter()
			.flat_map(|(_, names)| names.values().flatten())
			.filter(|e| seen.insert(Arc::as_ptr(&e.proxy)))
			.map(|e| e.proxy.clone())
			.collect()
	}

	/// Pushes the pending changes of every registered proxy, group by group
	/// in [`GROUP_ORDER`] before the remaining groups.
	pub fn update_registered_proxies(&self, modified_only: bool) -> Result<()> {
		for proxy in self.ordered_proxies() {
			if !modified_only || proxy.is_modified() {
				proxy.update_vtk_objects()?;
			}
		}
		Ok(())
	}

	/// [`update_registered_proxies`](Self::update_registered_proxies)
	/// restricted to `group`.
	pub fn update_registered_proxies_in_group(&self, group: &str, modified_only: bool) -> Result<()> {
		for (_, proxy) in self.proxies_in_group(group) {
			if !modified_only || proxy.is_modified() {
				proxy.update_vtk_objects()?;
			}
		}
		Ok(())
	}

	/// Registers a link under `name`, replacing any previous one.
	pub fn register_link(&self, name: &str, link: Link) -> Result<()> {
		let previous = self.links.lock().insert(name.to_string(), link);
		drop(previous);
		self.pipeline_state.validate_state()
	}

	/// Link registered under `name`.
	pub fn get_link(&self, name: &str) -> Option<Link> {
		self.links.lock().get(name).cloned()
	}

	/// Removes a link.
	pub fn unregister_link(&self, name: &str) -> Result<bool> {
		let removed = self.links.lock().shift_remove(name);
		match removed {
			Some(_) => self.pipeline_state.validate_state().map(|()| true),
			None => Ok(false),
		}
	}

	/// Registered link names.
	pub fn link_names(&self) -> Vec<String> {
		self.links.lock().keys().cloned().collect()
	}

	/// Registers a global properties manager. Changes to its values
	/// re-push the manager state.
	pub fn set_global_properties_manager(&self, manager: Arc<GlobalPropertiesManager>) -> Result<()> {
		let pm = self.this.clone();
		let subscription = manager.subscribe(move |_| {
			if let Some(pm) = pm.upgrade()
				&& let Err(e) = pm.pipeline_state.validate_state()
			{
				warn!(error = %e, "failed to push proxy manager state");
			}
		});
		let previous = self
			.global_properties
			.lock()
			.insert(manager.name().to_string(), (manager, subscription));
		drop(previous);
		self.pipeline_state.validate_state()
	}

	/// Global properties manager registered under `name`.
	pub fn get_global_properties_manager(&self, name: &str) -> Option<Arc<GlobalPropertiesManager>> {
		self.global_properties
			.lock()
			.get(name)
			.map(|(m, _)| m.clone())
	}

	/// Removes a global properties manager.
	pub fn remove_global_properties_manager(&self, name: &str) -> Result<bool> {
		let removed = self.global_properties.lock().shift_remove(name);
		match removed {
			Some(_) => self.pipeline_state.validate_state().map(|()| true),
			None => Ok(false),
		}
	}

	/// Creates and registers a selection model.
	pub fn new_selection_model(&self, name: &str) -> Arc<SelectionModel> {
		let model = SelectionModel::new(self.session.clone(), name);
		self.register_selection_model(model.clone());
		model
	}

	/// Registers a selection model, replacing one with the same name.
	pub fn register_selection_model(&self, model: Arc<SelectionModel>) {
		let previous = self
			.selection_models
			.lock()
			.insert(model.name().to_string(), model);
		drop(previous);
	}

	/// Selection model registered under `name`.
	pub fn get_selection_model(&self, name: &str) -> Option<Arc<SelectionModel>> {
		self.selection_models.lock().get(name).cloned()
	}

	/// Removes a selection model.
	pub fn unregister_selection_model(&self, name: &str) -> bool {
		let removed = self.selection_models.lock().shift_remove(name);
		removed.is_some()
	}

	/// Stops [`PipelineState::validate_state`] from pushing until the
	/// guard drops.
	pub fn suspend_state_updates(&self) -> SuspendStateUpdates<'_> {
		self.suspended.fetch_add(1, Ordering::AcqRel);
		SuspendStateUpdates { manager: self }
	}

	/// Returns `true` while state updates are suspended.
	pub fn is_state_update_suspended(&self) -> bool {
		self.suspended.load(Ordering::Acquire) > 0
	}

	/// Registrations, links and global properties of non-prototype proxies.
	pub fn full_state(&self) -> Message {
		let registered = self.shared_registrations().into_iter().collect();
		let links = self.links.lock().values().map(Link::state).collect();
		let managers: Vec<_> = self
			.global_properties
			.lock()
			.values()
			.map(|(m, _)| m.clone())
			.collect();
		Message::new(GlobalId::PROXY_MANAGER, Location::DATA_SERVER_ROOT).with_body(
			Body::ProxyManager(ProxyManagerState {
				registered,
				links,
				global_properties: managers.iter().map(|m| m.state()).collect(),
			}),
		)
	}

	/// Applies a manager state: registers the missing tuples in group
	/// order, then unregisters the stale ones, then replaces links and
	/// global properties managers that changed.
	///
	/// Proxies that cannot be located are skipped with a warning.
	pub fn load_state(&self, state: &Message, locator: &dyn ProxyLocator) -> Result<()> {
		let Body::ProxyManager(incoming) = &state.body else {
			return Err(Error::InvalidState(format!(
				"state {} is not a proxy manager state",
				state.global_id
			)));
		};
		let _suspended = self.suspend_state_updates();

		let incoming_set: BTreeSet<Registration> = incoming.registered.iter().cloned().collect();
		let mut delta = compute_delta(&self.shared_registrations(), &incoming_set);
		debug!(
			register = delta.to_register.len(),
			unregister = delta.to_unregister.len(),
			"applying proxy manager delta"
		);
		delta.to_register.sort_by_key(|r| group_rank(&r.group));

		for reg in &delta.to_register {
			let Some(proxy) = locator.locate_proxy(reg.global_id) else {
				warn!(group = %reg.group, name = %reg.name, global_id = %reg.global_id, "registered proxy not found");
				continue;
			};
			self.register_proxy(&reg.group, &reg.name, &proxy)?;
		}
		let mut removed = Vec::new();
		for reg in &delta.to_unregister {
			removed.extend(self.unregister_registration(reg));
		}
		for (registration, _) in &removed {
			self.events
				.emit(&ProxyManagerEvent::Unregistered(registration.clone()));
		}

		self.load_links(&incoming.links, locator);
		self.load_global_properties(&incoming.global_properties, locator);
		self.events.emit(&ProxyManagerEvent::StateLoaded);
		drop(removed);
		Ok(())
	}

	fn load_links(&self, states: &[meridian_proto::LinkState], locator: &dyn ProxyLocator) {
		let current: FxHashMap<String, meridian_proto::LinkState> = self
			.links
			.lock()
			.iter()
			.map(|(name, link)| (name.clone(), link.state()))
			.collect();
		if states.len() == current.len()
			&& states
				.iter()
				.all(|s| current.get(&s.name).is_some_and(|c| c == s))
		{
			return;
		}
		let rebuilt: IndexMap<String, Link> = states
			.iter()
			.map(|s| match (current.get(&s.name) == Some(s), self.get_link(&s.name)) {
				(true, Some(link)) => (s.name.clone(), link),
				_ => (s.name.clone(), Link::from_state(s, locator)),
			})
			.collect();
		let previous = std::mem::replace(&mut *self.links.lock(), rebuilt);
		drop(previous);
	}

	fn load_global_properties(
		&self,
		states: &[meridian_proto::GlobalPropertiesState],
		locator: &dyn ProxyLocator,
	) {
		let current: Vec<_> = self
			.global_properties
			.lock()
			.values()
			.map(|(m, _)| m.state())
			.collect();
		if current.as_slice() == states {
			return;
		}
		let previous = std::mem::take(&mut *self.global_properties.lock());
		drop(previous);
		for state in states {
			let manager = GlobalPropertiesManager::from_state(state, locator);
			let pm = self.this.clone();
			let subscription = manager.subscribe(move |_| {
				if let Some(pm) = pm.upgrade()
					&& let Err(e) = pm.pipeline_state.validate_state()
				{
					warn!(error = %e, "failed to push proxy manager state");
				}
			});
			self.global_properties
				.lock()
				.insert(state.name.clone(), (manager, subscription));
		}
	}

	/// Rebuilds the proxy `id` from the state `locator` finds for it.
	///
	/// The proxy is loaded in two passes: the first adopts the ids of the
	/// proxy and its sub-proxies, the second loads properties, whose proxy
	/// references can then resolve to any shell of the first pass.
	pub fn re_new_proxy(&self, id: GlobalId, locator: &dyn ProxyLocator) -> Option<Arc<Proxy>> {
		let Some(state) = locator.find_state(id) else {
			trace!(global_id = %id, "no state to rebuild proxy from");
			return None;
		};
		let (Some(group), Some(name)) = (&state.xml_group, &state.xml_name) else {
			debug!(global_id = %id, "state without type cannot rebuild a proxy");
			return None;
		};
		let rebuilt = self.new_proxy(group, name).and_then(|proxy| {
			proxy.load_state_with(&state, locator, true)?;
			proxy.load_state_with(&state, locator, false)?;
			proxy.update_vtk_objects()?;
			Ok(proxy)
		});
		match rebuilt {
			Ok(proxy) => {
				debug!(global_id = %id, group = %group, name = %name, "proxy rebuilt from state");
				Some(proxy)
			}
			Err(e) => {
				warn!(global_id = %id, error = %e, "failed to rebuild proxy");
				None
			}
		}
	}

	/// Pulls the manager state from the data server and loads it.
	pub fn update_from_remote(&self) -> Result<()> {
		let session = self.session.upgrade().ok_or(Error::Disconnected)?;
		let state = session.pull_state(&Message::new(
			GlobalId::PROXY_MANAGER,
			Location::DATA_SERVER_ROOT,
		))?;
		if !matches!(state.body, Body::ProxyManager(_)) {
			return Err(Error::StateNotFound(GlobalId::PROXY_MANAGER));
		}
		{
			let _local = session.local_push_only();
			let locator = session.proxy_locator();
			self.load_state(&state, &locator)?;
		}
		session.state_locator().register_state(&state);
		info!(registrations = self.registrations().len(), "proxy manager state loaded from server");
		Ok(())
	}

	/// `ServerManagerState` document of the registered proxies.
	pub fn save_xml_state(&self) -> XmlElement {
		let mut proxies = Vec::new();
		let mut seen = FxHashSet::default();
		for proxy in self.ordered_proxies() {
			collect_states(&proxy, &mut seen, &mut proxies);
		}
		let Body::ProxyManager(state) = self.full_state().body else {
			return XmlElement::new("ServerManagerState");
		};
		StateDocument {
			proxies,
			registrations: state.registered,
			links: state.links,
			global_properties: state.global_properties,
			custom_definitions: Some(self.definitions.custom_definitions_xml()),
		}
		.to_xml()
	}

	/// Loads a document written by [`save_xml_state`](Self::save_xml_state),
	/// adding its registrations to the current ones.
	///
	/// Without `renumber` the document ids are kept and must not be in use.
	/// With `renumber` every proxy gets a fresh id.
	pub fn load_xml_state(&self, root: &XmlElement, renumber: bool) -> Result<()> {
		let session = self.session.upgrade().ok_or(Error::Disconnected)?;
		let mut doc = StateDocument::from_xml(root)?;
		if let Some(defs) = &doc.custom_definitions {
			self.definitions.load_custom_definitions_xml(defs)?;
		}

		if renumber {
			let map = doc
				.proxy_ids()
				.into_iter()
				.map(|old| session.next_global_id().map(|new| (old, new)))
				.collect::<Result<FxHashMap<_, _>>>()?;
			doc.remap(&map);
		} else {
			for id in doc.proxy_ids() {
				if session.get_remote_object(id).is_some() {
					return Err(Error::GlobalIdInUse(id));
				}
			}
			for id in doc.proxy_ids() {
				session.observe_global_id(id);
			}
		}

		let states = Arc::new(StateLocator::new());
		for state in &doc.proxies {
			states.register_state(state);
		}
		let locator = SessionProxyLocator::new(self.session.clone(), states);

		let mut registered = self.registrations();
		registered.extend(doc.registrations);
		let mut links: Vec<_> = self.links.lock().values().map(Link::state).collect();
		links.retain(|l| doc.links.iter().all(|d| d.name != l.name));
		links.extend(doc.links);
		let state = Message::new(GlobalId::PROXY_MANAGER, Location::DATA_SERVER_ROOT).with_body(
			Body::ProxyManager(ProxyManagerState {
				registered: registered.into_iter().collect(),
				links,
				global_properties: doc.global_properties,
			}),
		);
		self.load_state(&state, &locator)?;
		info!(proxies = doc.proxies.len(), renumber, "state file loaded");
		self.pipeline_state.validate_state()
	}
}

fn collect_states(proxy: &Arc<Proxy>, seen: &mut FxHashSet<GlobalId>, out: &mut Vec<Message>) {
	if proxy.is_prototype() || !seen.insert(proxy.global_id()) {
		return;
	}
	if let Some(state) = proxy.full_state() {
		out.push(state);
	}
	for (_, sub) in proxy.sub_proxies() {
		collect_states(sub, seen, out);
	}
}
