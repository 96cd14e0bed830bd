//! Named sets of global property values linked to proxy properties.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use meridian_proto::{GlobalId, GlobalPropertiesState, GlobalPropertyLink, Property, Variant};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::proxy::Proxy;
use crate::proxy_locator::ProxyLocator;

/// Notifications of a [`GlobalPropertiesManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalPropertiesEvent {
	/// A global value changed.
	ValueChanged(String),
	/// A target was linked or unlinked.
	LinksChanged,
}

struct Target {
	global_property: String,
	proxy: Weak<Proxy>,
	id: GlobalId,
	property: String,
}

#[derive(Default)]
struct Inner {
	values: IndexMap<String, Variant>,
	targets: Vec<Target>,
}

/// Global values (colors, fonts, ...) applied to every linked
/// `(proxy, property)` target.
pub struct GlobalPropertiesManager {
	name: String,
	inner: Mutex<Inner>,
	events: Listeners<GlobalPropertiesEvent>,
}

impl std::fmt::Debug for GlobalPropertiesManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = self.inner.lock();
		f.debug_struct("GlobalPropertiesManager")
			.field("name", &self.name)
			.field("values", &inner.values)
			.field("targets", &inner.targets.len())
			.finish()
	}
}

impl GlobalPropertiesManager {
	/// Empty manager.
	pub fn new(name: impl Into<String>) -> Arc<Self> {
		Arc::new(Self {
			name: name.into(),
			inner: Mutex::default(),
			events: Listeners::default(),
		})
	}

	/// Rebuilds a manager, resolving targets through `locator`.
	/// Unresolvable targets are dropped.
	pub fn from_state(state: &GlobalPropertiesState, locator: &dyn ProxyLocator) -> Arc<Self> {
		let manager = Self::new(&state.name);
		{
			let mut inner = manager.inner.lock();
			for value in &state.values {
				inner.values.insert(value.name.clone(), value.value.clone());
			}
		}
		for link in &state.links {
			let Some(proxy) = locator.locate_proxy(link.proxy) else {
				warn!(manager = %state.name, global_id = %link.proxy, "global property target not found");
				continue;
			};
			manager.inner.lock().targets.push(Target {
				global_property: link.global_property.clone(),
				proxy: Arc::downgrade(&proxy),
				id: link.proxy,
				property: link.property.clone(),
			});
		}
		manager
	}

	/// Registration name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Subscribes to value and link changes.
	pub fn subscribe(
		&self,
		callback: impl Fn(&GlobalPropertiesEvent) + Send + Sync + 'static,
	) -> Subscription {
		self.events.subscribe(callback)
	}

	/// Current value of a global property.
	pub fn global_property(&self, name: &str) -> Option<Variant> {
		self.inner.lock().values.get(name).cloned()
	}

	/// Global property names.
	pub fn global_property_names(&self) -> Vec<String> {
		self.inner.lock().values.keys().cloned().collect()
	}

	/// Sets a global value and applies it to every linked target.
	pub fn set_global_property(&self, name: &str, value: Variant) -> Result<()> {
		let targets: Vec<(Arc<Proxy>, String)> = {
			let mut inner = self.inner.lock();
			if inner.values.get(name) == Some(&value) {
				return Ok(());
			}
			inner.values.insert(name.to_string(), value.clone());
			inner
				.targets
				.iter()
				.filter(|t| t.global_property == name)
				.filter_map(|t| Some((t.proxy.upgrade()?, t.property.clone())))
				.collect()
		};
		debug!(manager = %self.name, property = name, targets = targets.len(), "global property changed");
		for (proxy, property) in targets {
			proxy.set_property(&property, value.clone())?;
			proxy.update_vtk_objects()?;
		}
		self.events
			.emit(&GlobalPropertiesEvent::ValueChanged(name.to_string()));
		Ok(())
	}

	/// Links `proxy.property` to a global property and applies the current
	/// value.
	pub fn link(&self, global_property: &str, proxy: &Arc<Proxy>, property: &str) -> Result<()> {
		if !proxy.has_property(property) {
			return Err(Error::UnknownProperty {
				proxy: proxy.xml_name().to_string(),
				name: property.to_string(),
			});
		}
		let current = {
			let mut inner = self.inner.lock();
			inner.targets.push(Target {
				global_property: global_property.to_string(),
				proxy: Arc::downgrade(proxy),
				id: proxy.global_id(),
				property: property.to_string(),
			});
			inner.values.get(global_property).cloned()
		};
		if let Some(value) = current {
			proxy.set_property(property, value)?;
		}
		self.events.emit(&GlobalPropertiesEvent::LinksChanged);
		Ok(())
	}

	/// Removes a target. Returns `true` if it was linked.
	pub fn unlink(&self, global_property: &str, proxy: &Proxy, property: &str) -> bool {
		let id = proxy.global_id();
		let removed = {
			let mut inner = self.inner.lock();
			let before = inner.targets.len();
			inner.targets.retain(|t| {
				!(t.global_property == global_property && t.id == id && t.property == property)
			});
			before != inner.targets.len()
		};
		if removed {
			self.events.emit(&GlobalPropertiesEvent::LinksChanged);
		}
		removed
	}

	/// Serialized values and targets.
	pub fn state(&self) -> GlobalPropertiesState {
		let inner = self.inner.lock();
		GlobalPropertiesState {
			name: self.name.clone(),
			values: inner
				.values
				.iter()
				.map(|(name, value)| Property {
					name: name.clone(),
					value: value.clone(),
				})
				.collect(),
			links: inner
				.targets
				.iter()
				.map(|t| GlobalPropertyLink {
					global_property: t.global_property.clone(),
					proxy: t.id,
					property: t.property.clone(),
				})
				.collect(),
		}
	}
}
