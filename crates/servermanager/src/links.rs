//! Property and proxy links.
//!
//! Links propagate property changes from input proxies to output proxies.
//! They hold their participants weakly and are serialized into the proxy
//! manager state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use meridian_proto::{GlobalId, LinkDirection, LinkEntry, LinkKind, LinkState};
use parking_lot::Mutex;
use tracing::warn;

use crate::events::Subscription;
use crate::proxy::{Proxy, ProxyEvent};
use crate::proxy_locator::ProxyLocator;

struct Participant {
	proxy: Weak<Proxy>,
	id: GlobalId,
	property: Option<String>,
	direction: LinkDirection,
	_subscription: Option<Subscription>,
}

impl Participant {
	fn entry(&self) -> LinkEntry {
		LinkEntry {
			proxy: self.id,
			property: self.property.clone(),
			direction: self.direction,
		}
	}
}

/// Shared participant bookkeeping.
#[derive(Default)]
struct Participants {
	entries: Mutex<Vec<Participant>>,
	propagating: AtomicBool,
}

impl Participants {
	fn entries(&self) -> Vec<LinkEntry> {
		self.entries.lock().iter().map(Participant::entry).collect()
	}

	fn outputs(&self) -> Vec<(Arc<Proxy>, Option<String>)> {
		self.entries
			.lock()
			.iter()
			.filter(|p| p.direction == LinkDirection::Output)
			.filter_map(|p| Some((p.proxy.upgrade()?, p.property.clone())))
			.collect()
	}

	fn first_input(&self) -> Option<(Arc<Proxy>, Option<String>)> {
		self.entries
			.lock()
			.iter()
			.filter(|p| p.direction == LinkDirection::Input)
			.find_map(|p| Some((p.proxy.upgrade()?, p.property.clone())))
	}

	fn remove(&self, id: GlobalId, property: Option<&str>) -> usize {
		let removed: Vec<Participant> = {
			let mut entries = self.entries.lock();
			let (removed, kept) = std::mem::take(&mut *entries)
				.into_iter()
				.partition(|p| p.id == id && (property.is_none() || p.property.as_deref() == property));
			*entries = kept;
			removed
		};
		removed.len()
	}

	/// Runs `f` unless a propagation is already in progress.
	fn guarded(&self, f: impl FnOnce()) {
		if self.propagating.swap(true, Ordering::AcqRel) {
			return;
		}
		f();
		self.propagating.store(false, Ordering::Release);
	}

	fn update_outputs(&self) {
		for (output, _) in self.outputs() {
			if let Err(e) = output.update_vtk_objects() {
				warn!(global_id = %output.global_id(), error = %e, "linked proxy update failed");
			}
		}
	}
}

fn copy_property(from: &Proxy, from_property: &str, to: &Proxy, to_property: &str) {
	let Some(value) = from.property(from_property) else {
		return;
	};
	if let Err(e) = to.set_property(to_property, value) {
		warn!(global_id = %to.global_id(), property = to_property, error = %e, "link propagation failed");
	}
}

/// Links explicit (proxy, property) pairs.
pub struct PropertyLink {
	this: Weak<PropertyLink>,
	name: String,
	participants: Participants,
}

impl std::fmt::Debug for PropertyLink {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PropertyLink")
			.field("name", &self.name)
			.field("entries", &self.participants.entries())
			.finish()
	}
}

impl PropertyLink {
	/// Empty link.
	pub fn new(name: impl Into<String>) -> Arc<Self> {
		let name = name.into();
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			name,
			participants: Participants::default(),
		})
	}

	/// Registration name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Adds a participant. A new output immediately receives the value of
	/// the first input.
	pub fn add_linked_property(&self, proxy: &Arc<Proxy>, property: &str, direction: LinkDirection) {
		let subscription = (direction == LinkDirection::Input).then(|| {
			let link = self.this.clone();
			let source = Arc::downgrade(proxy);
			let linked = property.to_string();
			proxy.subscribe(move |event| {
				let (Some(link), Some(source)) = (link.upgrade(), source.upgrade()) else {
					return;
				};
				match event {
					ProxyEvent::PropertyModified(name) if *name == linked => {
						link.propagate(&source, &linked);
					}
					ProxyEvent::UpdateVtkObjects => link.participants.update_outputs(),
					_ => {}
				}
			})
		});
		self.participants.entries.lock().push(Participant {
			proxy: Arc::downgrade(proxy),
			id: proxy.global_id(),
			property: Some(property.to_string()),
			direction,
			_subscription: subscription,
		});
		if direction == LinkDirection::Output
			&& let Some((input, Some(input_property))) = self.participants.first_input()
		{
			self.participants
				.guarded(|| copy_property(&input, &input_property, proxy, property));
		}
	}

	/// Removes the participant `(proxy, property)`.
	pub fn remove_linked_property(&self, proxy: &Proxy, property: &str) -> bool {
		self.participants.remove(proxy.global_id(), Some(property)) > 0
	}

	/// Participants in insertion order.
	pub fn entries(&self) -> Vec<LinkEntry> {
		self.participants.entries()
	}

	fn propagate(&self, source: &Proxy, property: &str) {
		self.participants.guarded(|| {
			for (output, output_property) in self.participants.outputs() {
				if let Some(output_property) = output_property {
					copy_property(source, property, &output, &output_property);
				}
			}
		});
	}
}

/// Links every property of the participating proxies, except the
/// configured exceptions.
pub struct ProxyLink {
	this: Weak<ProxyLink>,
	name: String,
	participants: Participants,
	exceptions: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ProxyLink {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxyLink")
			.field("name", &self.name)
			.field("entries", &self.participants.entries())
			.finish()
	}
}

impl ProxyLink {
	/// Empty link.
	pub fn new(name: impl Into<String>) -> Arc<Self> {
		let name = name.into();
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			name,
			participants: Participants::default(),
			exceptions: Mutex::default(),
		})
	}

	/// Registration name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Adds a participant.
	pub fn add_linked_proxy(&self, proxy: &Arc<Proxy>, direction: LinkDirection) {
		let subscription = (direction == LinkDirection::Input).then(|| {
			let link = self.this.clone();
			let source = Arc::downgrade(proxy);
			proxy.subscribe(move |event| {
				let (Some(link), Some(source)) = (link.upgrade(), source.upgrade()) else {
					return;
				};
				match event {
					ProxyEvent::PropertyModified(name) => link.propagate(&source, name),
					ProxyEvent::UpdateVtkObjects => link.participants.update_outputs(),
					ProxyEvent::StateLoaded => {}
				}
			})
		});
		self.participants.entries.lock().push(Participant {
			proxy: Arc::downgrade(proxy),
			id: proxy.global_id(),
			property: None,
			direction,
			_subscription: subscription,
		});
	}

	/// Removes every participant entry of `proxy`.
	pub fn remove_linked_proxy(&self, proxy: &Proxy) -> bool {
		self.participants.remove(proxy.global_id(), None) > 0
	}

	/// Excludes a property from propagation.
	pub fn add_exception(&self, property: impl Into<String>) {
		let property = property.into();
		let mut exceptions = self.exceptions.lock();
		if !exceptions.contains(&property) {
			exceptions.push(property);
		}
	}

	/// Excluded properties.
	pub fn exceptions(&self) -> Vec<String> {
		self.exceptions.lock().clone()
	}

	/// Participants in insertion order.
	pub fn entries(&self) -> Vec<LinkEntry> {
		self.participants.entries()
	}

	fn propagate(&self, source: &Proxy, property: &str) {
		if self.exceptions.lock().iter().any(|e| e == property) {
			return;
		}
		self.participants.guarded(|| {
			for (output, _) in self.participants.outputs() {
				if output.has_property(property) {
					copy_property(source, property, &output, property);
				}
			}
		});
	}
}

/// Registered link of either kind.
#[derive(Debug, Clone)]
pub enum Link {
	/// Property pairs.
	Property(Arc<PropertyLink>),
	/// Whole proxies.
	Proxy(Arc<ProxyLink>),
}

impl Link {
	/// Registration name.
	pub fn name(&self) -> &str {
		match self {
			Self::Property(l) => l.name(),
			Self::Proxy(l) => l.name(),
		}
	}

	/// Serialized form.
	pub fn state(&self) -> LinkState {
		match self {
			Self::Property(l) => LinkState {
				name: l.name.clone(),
				kind: LinkKind::Property,
				entries: l.entries(),
				exceptions: Vec::new(),
			},
			Self::Proxy(l) => LinkState {
				name: l.name.clone(),
				kind: LinkKind::Proxy,
				entries: l.entries(),
				exceptions: l.exceptions(),
			},
		}
	}

	/// Rebuilds a link, resolving participants through `locator`.
	/// Unresolvable participants are skipped.
	pub fn from_state(state: &LinkState, locator: &dyn ProxyLocator) -> Self {
		let resolve = |entry: &LinkEntry| {
			let proxy = locator.locate_proxy(entry.proxy);
			if proxy.is_none() {
				warn!(link = %state.name, global_id = %entry.proxy, "linked proxy not found");
			}
			proxy
		};
		match state.kind {
			LinkKind::Property => {
				let link = PropertyLink::new(&state.name);
				for entry in &state.entries {
					if let (Some(proxy), Some(property)) = (resolve(entry), &entry.property) {
						link.add_linked_property(&proxy, property, entry.direction);
					}
				}
				Self::Property(link)
			}
			LinkKind::Proxy => {
				let link = ProxyLink::new(&state.name);
				for entry in &state.entries {
					if let Some(proxy) = resolve(entry) {
						link.add_linked_proxy(&proxy, entry.direction);
					}
				}
				for exception in &state.exceptions {
					link.add_exception(exception.clone());
				}
				Self::Proxy(link)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use meridian_proto::{Location, Variant};
	use pretty_assertions::assert_eq;

	use super::*;
	use crate::config::SessionConfig;
	use crate::definitions::{ProxyDefinition, ProxyDefinitionManager};
	use crate::session::Session;

	fn session() -> Arc<Session> {
		let defs = ProxyDefinitionManager::new();
		defs.register(
			ProxyDefinition::new("sources", "SphereSource", Location::DATA_SERVER)
				.with_property("Radius", Variant::double(0.5))
				.with_property("Center", Variant::Double(vec![0.0, 0.0, 0.0])),
		);
		Session::builtin(SessionConfig::default(), Arc::new(defs))
	}

	#[test]
	fn proxy_link_skips_exceptions() {
		let session = session();
		let pm = session.proxy_manager();
		let a = pm.new_proxy("sources", "SphereSource").unwrap();
		let b = pm.new_proxy("sources", "SphereSource").unwrap();

		let link = ProxyLink::new("spheres");
		link.add_linked_proxy(&a, LinkDirection::Input);
		link.add_linked_proxy(&b, LinkDirection::Output);
		link.add_exception("Center");
		link.add_exception("Center");
		assert_eq!(link.exceptions(), vec!["Center".to_string()]);

		a.set_property("Radius", Variant::double(2.0)).unwrap();
		a.set_property("Center", Variant::Double(vec![1.0, 1.0, 1.0]))
			.unwrap();
		assert_eq!(b.property("Radius"), Some(Variant::double(2.0)));
		assert_eq!(b.property("Center"), Some(Variant::Double(vec![0.0, 0.0, 0.0])));
	}

	#[test]
	fn new_output_takes_the_input_value() {
		let session = session();
		let pm = session.proxy_manager();
		let a = pm.new_proxy("sources", "SphereSource").unwrap();
		let b = pm.new_proxy("sources", "SphereSource").unwrap();
		a.set_property("Radius", Variant::double(7.0)).unwrap();

		let link = PropertyLink::new("radius");
		link.add_linked_property(&a, "Radius", LinkDirection::Input);
		link.add_linked_property(&b, "Radius", LinkDirection::Output);
		assert_eq!(b.property("Radius"), Some(Variant::double(7.0)));

		assert!(link.remove_linked_property(&b, "Radius"));
		a.set_property("Radius", Variant::double(1.0)).unwrap();
		assert_eq!(b.property("Radius"), Some(Variant::double(7.0)));
	}

	#[test]
	fn input_update_pushes_outputs() {
		let session = session();
		let pm = session.proxy_manager();
		let a = pm.new_proxy("sources", "SphereSource").unwrap();
		let b = pm.new_proxy("sources", "SphereSource").unwrap();
		let link = PropertyLink::new("radius");
		link.add_linked_property(&a, "Radius", LinkDirection::Input);
		link.add_linked_property(&b, "Radius", LinkDirection::Output);

		a.set_property("Radius", Variant::double(3.0)).unwrap();
		a.update_vtk_objects().unwrap();
		assert!(b.objects_created());
		assert!(!b.is_modified());
	}

	#[test]
	fn state_round_trip_keeps_entries_and_exceptions() {
		let session = session();
		let pm = session.proxy_manager();
		let a = pm.new_proxy("sources", "SphereSource").unwrap();
		let b = pm.new_proxy("sources", "SphereSource").unwrap();
		let link = ProxyLink::new("spheres");
		link.add_linked_proxy(&a, LinkDirection::Input);
		link.add_linked_proxy(&b, LinkDirection::Output);
		link.add_exception("Center");
		let state = Link::Proxy(link).state();

		let locator = session.proxy_locator();
		let rebuilt = Link::from_state(&state, &locator);
		assert_eq!(rebuilt.name(), "spheres");
		assert_eq!(rebuilt.state(), state);

		a.set_property("Radius", Variant::double(5.0)).unwrap();
		assert_eq!(b.property("Radius"), Some(Variant::double(5.0)));
	}

	#[test]
	fn unresolvable_participants_are_dropped() {
		let session = session();
		let state = LinkState {
			name: "ghost".into(),
			kind: LinkKind::Property,
			entries: vec![LinkEntry {
				proxy: GlobalId(4242),
				property: Some("Radius".into()),
				direction: LinkDirection::Input,
			}],
			exceptions: Vec::new(),
		};
		let locator = session.proxy_locator();
		assert!(Link::from_state(&state, &locator).state().entries.is_empty());
	}
}
