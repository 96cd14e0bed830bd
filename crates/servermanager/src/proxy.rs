//! Client-side handle of a server-side object.
//!
//! A proxy keeps a typed property bag mirroring its definition. Property
//! writes only mark values as modified; [`Proxy::update_vtk_objects`]
//! pushes the first full state, then only modified properties.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use meridian_proto::{
	Body, GlobalId, Location, Message, Property, ProxyRef, ProxyState, SubProxyRef, Variant,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::definitions::{ProxyDefinition, ProxyDefinitionManager};
use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::proxy_locator::ProxyLocator;
use crate::proxy_manager::xml_state;
use crate::remote_object::{ObjectHandle, RemoteIdentity, RemoteObject};
use crate::session::Session;
use crate::xml::XmlElement;

const MAX_SUB_PROXY_DEPTH: usize = 16;

/// Proxy notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
	/// A property value changed.
	PropertyModified(String),
	/// Pending changes were pushed.
	UpdateVtkObjects,
	/// A state snapshot was applied.
	StateLoaded,
}

#[derive(Debug)]
struct Slot {
	value: Variant,
	modified: bool,
}

#[derive(Debug, Default)]
struct ProxyInner {
	properties: IndexMap<String, Slot>,
	/// Proxies referenced by proxy-valued properties, kept alive here.
	referents: FxHashMap<String, Vec<Arc<Proxy>>>,
	objects_created: bool,
}

/// Replicated object instance created from a [`ProxyDefinition`].
pub struct Proxy {
	this: Weak<Proxy>,
	identity: RemoteIdentity,
	definition: Arc<ProxyDefinition>,
	sub_proxies: Vec<(String, Arc<Proxy>)>,
	inner: Mutex<ProxyInner>,
	events: Listeners<ProxyEvent>,
}

impl std::fmt::Debug for Proxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Proxy")
			.field("global_id", &self.identity.peek_global_id())
			.field("group", &self.definition.group)
			.field("name", &self.definition.name)
			.field("location", &self.identity.location())
			.finish()
	}
}

impl Proxy {
	/// Instantiates `definition` and its sub-proxies. Prototypes get an
	/// empty location and never reach a server.
	pub(crate) fn create(
		session: &Weak<Session>,
		definition: Arc<ProxyDefinition>,
		definitions: &ProxyDefinitionManager,
		prototype: bool,
	) -> Result<Arc<Self>> {
		Self::create_nested(session, definition, definitions, prototype, 0)
	}

	fn create_nested(
		session: &Weak<Session>,
		definition: Arc<ProxyDefinition>,
		definitions: &ProxyDefinitionManager,
		prototype: bool,
		depth: usize,
	) -> Result<Arc<Self>> {
		if depth > MAX_SUB_PROXY_DEPTH {
			return Err(Error::InvalidState(format!(
				"sub-proxy nesting of {}/{} is too deep",
				definition.group, definition.name
			)));
		}
		let sub_proxies = definition
			.sub_proxies
			.iter()
			.map(|sub| {
				let def = definitions.get(&sub.group, &sub.proxy).ok_or_else(|| {
					Error::UnknownDefinition {
						group: sub.group.clone(),
						name: sub.proxy.clone(),
					}
				})?;
				let proxy = Self::create_nested(session, def, definitions, prototype, depth + 1)?;
				Ok((sub.name.clone(), proxy))
			})
			.collect::<Result<Vec<_>>>()?;

		let location = if prototype {
			Location::empty()
		} else {
			definition.location
		};
		let properties = definition
			.properties
			.iter()
			.map(|p| {
				(
					p.name.clone(),
					Slot {
						value: p.default.clone(),
						modified: true,
					},
				)
			})
			.collect();

		Ok(Arc::new_cyclic(|this| Self {
			this: this.clone(),
			identity: RemoteIdentity::new(session.clone(), location),
			definition,
			sub_proxies,
			inner: Mutex::new(ProxyInner {
				properties,
				..ProxyInner::default()
			}),
			events: Listeners::default(),
		}))
	}

	/// Definition group.
	pub fn xml_group(&self) -> &str {
		&self.definition.group
	}

	/// Definition name.
	pub fn xml_name(&self) -> &str {
		&self.definition.name
	}

	/// Definition this proxy was created from.
	pub fn definition(&self) -> &Arc<ProxyDefinition> {
		&self.definition
	}

	/// Global id, assigned on first use.
	pub fn global_id(&self) -> GlobalId {
		RemoteObject::global_id(self)
	}

	/// Target processes.
	pub fn location(&self) -> Location {
		self.identity.location()
	}

	/// Returns `true` for prototypes.
	pub fn is_prototype(&self) -> bool {
		self.identity.is_prototype()
	}

	/// Owning session.
	pub fn session(&self) -> Option<Arc<Session>> {
		self.identity.session()
	}

	/// Subscribes to proxy notifications.
	pub fn subscribe(&self, callback: impl Fn(&ProxyEvent) + Send + Sync + 'static) -> Subscription {
		self.events.subscribe(callback)
	}

	/// Current value of a property.
	pub fn property(&self, name: &str) -> Option<Variant> {
		self.inner.lock().properties.get(name).map(|s| s.value.clone())
	}

	/// Property names in definition order.
	pub fn property_names(&self) -> Vec<String> {
		self.inner.lock().properties.keys().cloned().collect()
	}

	/// Returns `true` if the proxy defines `name`.
	pub fn has_property(&self, name: &str) -> bool {
		self.inner.lock().properties.contains_key(name)
	}

	/// Sets a property; the new value is pushed by the next
	/// [`update_vtk_objects`](Self::update_vtk_objects).
	///
	/// Proxy references are resolved through the session so the referenced
	/// proxies stay alive while referenced.
	pub fn set_property(&self, name: &str, value: Variant) -> Result<()> {
		let referents = match &value {
			Variant::Proxy(refs) => self.resolve_in_session(refs),
			_ => Vec::new(),
		};
		self.store_property(name, value, referents)
	}

	/// Sets a proxy-valued property to `proxies` (output port 0).
	pub fn set_proxy_property(&self, name: &str, proxies: &[Arc<Proxy>]) -> Result<()> {
		let refs = proxies
			.iter()
			.map(|p| Ok(ProxyRef::new(p.try_global_id()?)))
			.collect::<Result<Vec<_>>>()?;
		self.store_property(name, Variant::Proxy(refs), proxies.to_vec())
	}

	/// Proxies referenced by a proxy-valued property.
	pub fn proxy_property(&self, name: &str) -> Vec<Arc<Proxy>> {
		self.inner
			.lock()
			.referents
			.get(name)
			.cloned()
			.unwrap_or_default()
	}

	fn store_property(&self, name: &str, value: Variant, referents: Vec<Arc<Proxy>>) -> Result<()> {
		let dropped = {
			let mut inner = self.inner.lock();
			let Some(slot) = inner.properties.get_mut(name) else {
				return Err(Error::UnknownProperty {
					proxy: self.definition.name.clone(),
					name: name.to_string(),
				});
			};
			if slot.value == value {
				return Ok(());
			}
			slot.value = value;
			slot.modified = true;
			if referents.is_empty() {
				inner.referents.remove(name)
			} else {
				inner.referents.insert(name.to_string(), referents)
			}
		};
		// Released referents may drop and notify their session.
		drop(dropped);
		trace!(global_id = %self.identity.peek_global_id(), property = name, "property modified");
		self.events.emit(&ProxyEvent::PropertyModified(name.to_string()));
		Ok(())
	}

	fn resolve_in_session(&self, refs: &[ProxyRef]) -> Vec<Arc<Proxy>> {
		let Some(session) = self.identity.session() else {
			return Vec::new();
		};
		refs.iter()
			.filter_map(|r| session.get_remote_object(r.id)?.as_proxy().cloned())
			.collect()
	}

	/// Named sub-proxy.
	pub fn sub_proxy(&self, name: &str) -> Option<&Arc<Proxy>> {
		self.sub_proxies
			.iter()
			.find(|(n, _)| n == name)
			.map(|(_, p)| p)
	}

	/// Sub-proxies in definition order.
	pub fn sub_proxies(&self) -> &[(String, Arc<Proxy>)] {
		&self.sub_proxies
	}

	/// Returns `true` if properties changed since the last push.
	pub fn is_modified(&self) -> bool {
		let inner = self.inner.lock();
		!inner.objects_created || inner.properties.values().any(|s| s.modified)
	}

	/// Returns `true` once the server-side counterpart was created.
	pub fn objects_created(&self) -> bool {
		self.inner.lock().objects_created
	}

	/// Creates the server-side counterpart if it does not exist yet.
	pub fn create_vtk_objects(&self) -> Result<()> {
		if self.objects_created() {
			return Ok(());
		}
		self.update_vtk_objects()
	}

	/// Pushes pending changes: the full state the first time, modified
	/// properties afterwards. Sub-proxies are updated first.
	pub fn update_vtk_objects(&self) -> Result<()> {
		for (_, sub) in &self.sub_proxies {
			sub.update_vtk_objects()?;
		}
		if self.identity.is_prototype() {
			self.mark_pushed();
			return Ok(());
		}

		let sub_refs = self.sub_proxy_refs()?;
		let msg = {
			let inner = self.inner.lock();
			let full = !inner.objects_created;
			if !full && !inner.properties.values().any(|s| s.modified) {
				return Ok(());
			}
			let mut msg = Message::new(GlobalId::NONE, self.identity.location())
				.with_type(&self.definition.group, &self.definition.name);
			msg.properties = inner
				.properties
				.iter()
				.filter(|(_, slot)| full || slot.modified)
				.map(|(name, slot)| Property {
					name: name.clone(),
					value: slot.value.clone(),
				})
				.collect();
			if full {
				msg.body = Body::Proxy(ProxyState {
					sub_proxies: sub_refs,
				});
			}
			msg
		};
		debug!(
			global_id = %self.identity.peek_global_id(),
			proxy = %self.definition.name,
			properties = msg.properties.len(),
			"updating server objects"
		);
		self.push_state(msg)?;
		self.mark_pushed();
		self.events.emit(&ProxyEvent::UpdateVtkObjects);
		Ok(())
	}

	/// Marks every property as in sync with the server.
	pub fn mark_pushed(&self) {
		let mut inner = self.inner.lock();
		for slot in inner.properties.values_mut() {
			slot.modified = false;
		}
		if !self.identity.is_prototype() {
			inner.objects_created = true;
		}
	}

	fn sub_proxy_refs(&self) -> Result<Vec<SubProxyRef>> {
		self.sub_proxies
			.iter()
			.map(|(name, sub)| {
				Ok(SubProxyRef {
					name: name.clone(),
					global_id: sub.try_global_id()?,
				})
			})
			.collect()
	}

	/// Applies `state`.
	///
	/// The first pass (`definition_only`) only adopts the global ids of this
	/// proxy and its sub-proxies so that later references resolve; the
	/// second applies property values, resolving proxy references through
	/// `locator`.
	pub fn load_state_with(
		&self,
		state: &Message,
		locator: &dyn ProxyLocator,
		definition_only: bool,
	) -> Result<()> {
		let current = self.identity.peek_global_id();
		if !state.global_id.is_none() {
			if !current.is_none() && current != state.global_id {
				return Err(Error::InvalidState(format!(
					"state of {} loaded into proxy {current}",
					state.global_id
				)));
			}
			self.assign_global_id(state.global_id);
		}

		if let Body::Proxy(topology) = &state.body {
			for sub_ref in &topology.sub_proxies {
				let Some(sub) = self.sub_proxy(&sub_ref.name) else {
					warn!(sub_proxy = %sub_ref.name, proxy = %self.definition.name, "unknown sub-proxy in state");
					continue;
				};
				let sub_state = locator
					.find_state(sub_ref.global_id)
					.unwrap_or_else(|| Message::new(sub_ref.global_id, sub.location()));
				sub.load_state_with(&sub_state, locator, definition_only)?;
			}
		}
		if definition_only {
			return Ok(());
		}

		for prop in &state.properties {
			if !self.has_property(&prop.name) {
				warn!(property = %prop.name, proxy = %self.definition.name, "ignoring unknown property in state");
				continue;
			}
			let (value, referents) = match &prop.value {
				Variant::Proxy(refs) => {
					let (kept, referents): (Vec<_>, Vec<_>) = refs
						.iter()
						.filter_map(|r| {
							let located = locator.locate_proxy(r.id);
							if located.is_none() {
								warn!(global_id = %r.id, property = %prop.name, "referenced proxy not found");
							}
							located.map(|p| (*r, p))
						})
						.unzip();
					(Variant::Proxy(kept), referents)
				}
				other => (other.clone(), Vec::new()),
			};
			self.store_property(&prop.name, value, referents)?;
		}
		self.events.emit(&ProxyEvent::StateLoaded);
		Ok(())
	}

	/// `<Proxy>` element with the full state.
	pub fn save_xml_state(&self) -> XmlElement {
		let state = self.full_state().unwrap_or_default();
		xml_state::proxy_element(&state)
	}

	/// Applies a `<Proxy>` element produced by
	/// [`save_xml_state`](Self::save_xml_state).
	pub fn load_xml_state(&self, element: &XmlElement, locator: &dyn ProxyLocator) -> Result<()> {
		let mut state = xml_state::proxy_message(element)?;
		state.global_id = self.identity.peek_global_id();
		self.load_state_with(&state, locator, false)
	}
}

impl RemoteObject for Proxy {
	fn identity(&self) -> &RemoteIdentity {
		&self.identity
	}

	fn handle(&self) -> ObjectHandle {
		ObjectHandle::Proxy(self.this.clone())
	}

	fn full_state(&self) -> Option<Message> {
		let (id, sub_refs) = if self.is_prototype() {
			let sub_refs = self
				.sub_proxies
				.iter()
				.map(|(name, sub)| SubProxyRef {
					name: name.clone(),
					global_id: sub.identity.peek_global_id(),
				})
				.collect();
			(self.identity.peek_global_id(), sub_refs)
		} else {
			(self.global_id(), self.sub_proxy_refs().ok()?)
		};
		let mut state = Message::new(id, self.identity.location())
			.with_type(&self.definition.group, &self.definition.name)
			.with_body(Body::Proxy(ProxyState {
				sub_proxies: sub_refs,
			}));
		state.properties = self
			.inner
			.lock()
			.properties
			.iter()
			.map(|(name, slot)| Property {
				name: name.clone(),
				value: slot.value.clone(),
			})
			.collect();
		Some(state)
	}

	fn load_state(&self, state: &Message, locator: &dyn ProxyLocator) -> Result<()> {
		self.load_state_with(state, locator, false)
	}
}

impl Drop for Proxy {
	fn drop(&mut self) {
		let id = self.identity.peek_global_id();
		if id.is_none() {
			return;
		}
		let Some(session) = self.identity.session() else {
			return;
		};
		session.unregister_remote_object(id);
		if self.identity.is_prototype() || !self.inner.get_mut().objects_created {
			return;
		}
		let msg = Message::new(id, self.identity.location());
		if let Err(e) = session.delete_si(&msg) {
			debug!(global_id = %id, error = %e, "failed to delete server-side object");
		}
	}
}

#[cfg(test)]
mod tests {
	use meridian_proto::Location;
	use pretty_assertions::assert_eq;

	use super::*;
	use crate::config::SessionConfig;

	fn session() -> Arc<Session> {
		let defs = ProxyDefinitionManager::new();
		defs.register(
			ProxyDefinition::new("sources", "SphereSource", Location::DATA_SERVER)
				.with_property("Radius", Variant::double(0.5)),
		);
		defs.register(
			ProxyDefinition::new("filters", "Shrink", Location::DATA_SERVER)
				.with_property("Input", Variant::Proxy(vec![]))
				.with_property("Factor", Variant::double(0.5)),
		);
		defs.register(
			ProxyDefinition::new("representations", "Geometry", Location::DATA_SERVER)
				.with_property("Opacity", Variant::double(1.0))
				.with_sub_proxy("Mapper", "misc", "Mapper"),
		);
		defs.register(
			ProxyDefinition::new("misc", "Mapper", Location::DATA_SERVER)
				.with_property("Scalars", Variant::string("")),
		);
		defs.register(
			ProxyDefinition::new("misc", "Loop", Location::DATA_SERVER).with_sub_proxy("Self", "misc", "Loop"),
		);
		Session::builtin(SessionConfig::default(), Arc::new(defs))
	}

	fn server_state(session: &Session, id: GlobalId) -> Message {
		session
			.pull_state(&Message::new(id, Location::DATA_SERVER))
			.unwrap()
	}

	#[test]
	fn first_push_is_full_later_pushes_are_deltas() {
		let session = session();
		let sphere = session
			.proxy_manager()
			.new_proxy("sources", "SphereSource")
			.unwrap();
		assert!(sphere.is_modified());
		assert!(!sphere.objects_created());

		sphere.update_vtk_objects().unwrap();
		assert!(sphere.objects_created());
		assert!(!sphere.is_modified());
		let id = sphere.global_id();
		assert_eq!(server_state(&session, id).property("Radius"), Some(&Variant::double(0.5)));

		sphere.set_property("Radius", Variant::double(2.0)).unwrap();
		assert!(sphere.is_modified());
		sphere.update_vtk_objects().unwrap();
		assert_eq!(server_state(&session, id).property("Radius"), Some(&Variant::double(2.0)));
	}

	#[test]
	fn setting_the_same_value_is_not_a_modification() {
		let session = session();
		let sphere = session
			.proxy_manager()
			.new_proxy("sources", "SphereSource")
			.unwrap();
		sphere.update_vtk_objects().unwrap();
		let events = Arc::new(Mutex::new(Vec::new()));
		let sink = events.clone();
		let _subscription = sphere.subscribe(move |e| sink.lock().push(e.clone()));

		sphere.set_property("Radius", Variant::double(0.5)).unwrap();
		assert!(!sphere.is_modified());
		sphere.set_property("Radius", Variant::double(0.75)).unwrap();
		assert_eq!(*events.lock(), vec![ProxyEvent::PropertyModified("Radius".into())]);
	}

	#[test]
	fn unknown_property_is_an_error() {
		let session = session();
		let sphere = session
			.proxy_manager()
			.new_proxy("sources", "SphereSource")
			.unwrap();
		assert!(matches!(
			sphere.set_property("Height", Variant::double(1.0)),
			Err(Error::UnknownProperty { .. })
		));
	}

	#[test]
	fn sub_proxies_get_their_own_ids_and_are_pushed_first() {
		let session = session();
		let repr = session
			.proxy_manager()
			.new_proxy("representations", "Geometry")
			.unwrap();
		let mapper = repr.sub_proxy("Mapper").unwrap().clone();
		repr.update_vtk_objects().unwrap();

		assert!(mapper.objects_created());
		assert_ne!(mapper.global_id(), repr.global_id());
		let Some(Message {
			body: Body::Proxy(topology),
			..
		}) = repr.full_state()
		else {
			panic!("expected proxy state");
		};
		assert_eq!(topology.sub_proxies.len(), 1);
		assert_eq!(topology.sub_proxies[0].global_id, mapper.global_id());
	}

	#[test]
	fn recursive_sub_proxies_are_rejected() {
		let session = session();
		assert!(matches!(
			session.proxy_manager().new_proxy("misc", "Loop"),
			Err(Error::InvalidState(_))
		));
	}

	#[test]
	fn proxy_property_keeps_referents_alive() {
		let session = session();
		let pm = session.proxy_manager();
		let shrink = pm.new_proxy("filters", "Shrink").unwrap();
		let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
		shrink.set_proxy_property("Input", &[sphere.clone()]).unwrap();
		let id = sphere.global_id();
		drop(sphere);

		let input = shrink.proxy_property("Input");
		assert_eq!(input.len(), 1);
		assert_eq!(input[0].global_id(), id);
		drop(input);

		shrink.set_property("Input", Variant::Proxy(vec![])).unwrap();
		assert!(session.get_remote_object(id).is_none());
	}

	#[test]
	fn definition_pass_only_adopts_ids() {
		let session = session();
		let source = session
			.proxy_manager()
			.new_proxy("representations", "Geometry")
			.unwrap();
		source.set_property("Opacity", Variant::double(0.25)).unwrap();
		let state = source.full_state().unwrap();
		let mapper_id = source.sub_proxy("Mapper").unwrap().global_id();
		let id = source.global_id();
		drop(source);

		let fresh = session
			.proxy_manager()
			.new_proxy("representations", "Geometry")
			.unwrap();
		let locator = session.proxy_locator();
		fresh.load_state_with(&state, &locator, true).unwrap();
		assert_eq!(fresh.global_id(), id);
		assert_eq!(fresh.sub_proxy("Mapper").unwrap().global_id(), mapper_id);
		assert_eq!(fresh.property("Opacity"), Some(Variant::double(1.0)));

		fresh.load_state_with(&state, &locator, false).unwrap();
		assert_eq!(fresh.property("Opacity"), Some(Variant::double(0.25)));
	}

	#[test]
	fn state_of_another_object_is_rejected() {
		let session = session();
		let pm = session.proxy_manager();
		let a = pm.new_proxy("sources", "SphereSource").unwrap();
		let b = pm.new_proxy("sources", "SphereSource").unwrap();
		let state = a.full_state().unwrap();
		b.global_id();
		assert!(matches!(
			b.load_state(&state, &session.proxy_locator()),
			Err(Error::InvalidState(_))
		));
	}

	#[test]
	fn prototypes_never_reach_the_server() {
		let session = session();
		let proto = session
			.proxy_manager()
			.prototype("sources", "SphereSource")
			.unwrap();
		assert!(proto.is_prototype());
		proto.set_property("Radius", Variant::double(3.0)).unwrap();
		proto.update_vtk_objects().unwrap();
		assert!(!proto.objects_created());
	}

	#[test]
	fn prototype_pull_and_full_state_stay_local() {
		let session = session();
		let proto = session
			.proxy_manager()
			.prototype("representations", "Geometry")
			.unwrap();
		proto.set_property("Opacity", Variant::double(0.3)).unwrap();

		let pulled = proto.pull_state().unwrap();
		assert_eq!(pulled.property("Opacity"), Some(&Variant::double(0.3)));
		assert!(pulled.global_id.is_none());
		assert!(proto.full_state().unwrap().global_id.is_none());
		assert!(proto.identity().peek_global_id().is_none());
		assert!(
			proto
				.sub_proxy("Mapper")
				.unwrap()
				.identity()
				.peek_global_id()
				.is_none()
		);
	}

	#[test]
	fn dangling_references_are_dropped_from_loaded_values() {
		let session = session();
		let pm = session.proxy_manager();
		let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
		let shrink = pm.new_proxy("filters", "Shrink").unwrap();
		let sphere_id = sphere.global_id();
		let id = shrink.global_id();

		let state = Message::new(id, Location::DATA_SERVER)
			.with_type("filters", "Shrink")
			.with_property(
				"Input",
				Variant::Proxy(vec![ProxyRef::new(sphere_id), ProxyRef::new(GlobalId(9999))]),
			);
		let locator = session.proxy_locator();
		shrink.load_state_with(&state, &locator, false).unwrap();

		let kept = Variant::Proxy(vec![ProxyRef::new(sphere_id)]);
		assert_eq!(shrink.property("Input"), Some(kept.clone()));
		assert_eq!(shrink.proxy_property("Input").len(), 1);

		shrink.update_vtk_objects().unwrap();
		assert_eq!(server_state(&session, id).property("Input"), Some(&kept));
	}
}
