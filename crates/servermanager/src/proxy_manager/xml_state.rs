//! `ServerManagerState` documents.
//!
//! ```xml
//! <ServerManagerState version="5.11.0">
//!   <Proxy group="sources" type="SphereSource" id="11" servers="4">
//!     <Property name="Radius" type="double" number_of_elements="1">
//!       <Element index="0" value="0.5"/>
//!     </Property>
//!     <SubProxy name="Helper" id="12"/>
//!   </Proxy>
//!   <ProxyCollection name="sources">
//!     <Item id="11" name="Sphere1"/>
//!   </ProxyCollection>
//!   <CustomProxyDefinitions/>
//!   <Links/>
//!   <GlobalPropertiesManagers/>
//! </ServerManagerState>
//! ```

use std::collections::BTreeMap;

use meridian_proto::{
	Body, GlobalId, GlobalPropertiesState, GlobalPropertyLink, LinkDirection, LinkEntry, LinkKind,
	LinkState, Location, Message, Property, ProxyState, Registration, STATE_VERSION, SubProxyRef,
	Variant,
};
use rustc_hash::FxHashMap;

use crate::xml::{self, XmlElement, XmlError};

const ROOT: &str = "ServerManagerState";

/// `<Proxy>` element of a proxy state.
pub(crate) fn proxy_element(state: &Message) -> XmlElement {
	let mut element = XmlElement::new("Proxy")
		.with_attribute("group", state.xml_group.as_deref().unwrap_or_default())
		.with_attribute("type", state.xml_name.as_deref().unwrap_or_default())
		.with_attribute("id", state.global_id)
		.with_attribute("servers", state.location.bits());
	for prop in &state.properties {
		element.push_child(xml::property_element(&prop.name, &prop.value));
	}
	if let Body::Proxy(topology) = &state.body {
		for sub in &topology.sub_proxies {
			element.push_child(
				XmlElement::new("SubProxy")
					.with_attribute("name", &sub.name)
					.with_attribute("id", sub.global_id),
			);
		}
	}
	element
}

/// Proxy state of a `<Proxy>` element.
pub(crate) fn proxy_message(element: &XmlElement) -> Result<Message, XmlError> {
	expect_name(element, "Proxy")?;
	let id = GlobalId(element.parse_attribute("id")?);
	let location = Location::from_bits_truncate(element.parse_attribute("servers")?);
	let mut state = Message::new(id, location)
		.with_type(element.required("group")?, element.required("type")?);
	for child in element.children_named("Property") {
		let (name, value) = xml::property_value(child)?;
		state.properties.push(Property { name, value });
	}
	let sub_proxies = element
		.children_named("SubProxy")
		.map(|sub| {
			Ok(SubProxyRef {
				name: sub.required("name")?.to_string(),
				global_id: GlobalId(sub.parse_attribute("id")?),
			})
		})
		.collect::<Result<Vec<_>, XmlError>>()?;
	state.body = Body::Proxy(ProxyState { sub_proxies });
	Ok(state)
}

fn expect_name(element: &XmlElement, name: &str) -> Result<(), XmlError> {
	if element.name() == name {
		Ok(())
	} else {
		Err(XmlError::Structure(format!(
			"expected <{name}>, found <{}>",
			element.name()
		)))
	}
}

fn direction_name(direction: LinkDirection) -> &'static str {
	match direction {
		LinkDirection::Input => "input",
		LinkDirection::Output => "output",
	}
}

fn parse_direction(element: &XmlElement) -> Result<LinkDirection, XmlError> {
	match element.required("direction")? {
		"input" => Ok(LinkDirection::Input),
		"output" => Ok(LinkDirection::Output),
		_ => Err(element.invalid("direction")),
	}
}

/// Contents of a `ServerManagerState` document.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct StateDocument {
	pub proxies: Vec<Message>,
	pub registrations: Vec<Registration>,
	pub links: Vec<LinkState>,
	pub global_properties: Vec<GlobalPropertiesState>,
	pub custom_definitions: Option<XmlElement>,
}

impl StateDocument {
	pub fn to_xml(&self) -> XmlElement {
		let mut root = XmlElement::new(ROOT).with_attribute("version", STATE_VERSION);
		for state in &self.proxies {
			root.push_child(proxy_element(state));
		}

		let mut collections: BTreeMap<&str, Vec<&Registration>> = BTreeMap::new();
		for reg in &self.registrations {
			collections.entry(&reg.group).or_default().push(reg);
		}
		for (group, items) in collections {
			let mut collection = XmlElement::new("ProxyCollection").with_attribute("name", group);
			for reg in items {
				collection.push_child(
					XmlElement::new("Item")
						.with_attribute("id", reg.global_id)
						.with_attribute("name", &reg.name),
				);
			}
			root.push_child(collection);
		}

		if let Some(defs) = &self.custom_definitions {
			root.push_child(defs.clone());
		}

		let mut links = XmlElement::new("Links");
		for link in &self.links {
			links.push_child(link_element(link));
		}
		root.push_child(links);

		let mut managers = XmlElement::new("GlobalPropertiesManagers");
		for manager in &self.global_properties {
			managers.push_child(global_properties_element(manager));
		}
		root.push_child(managers);
		root
	}

	pub fn from_xml(root: &XmlElement) -> Result<Self, XmlError> {
		expect_name(root, ROOT)?;
		let proxies = root
			.children_named("Proxy")
			.map(proxy_message)
			.collect::<Result<Vec<_>, _>>()?;

		let mut registrations = Vec::new();
		for collection in root.children_named("ProxyCollection") {
			let group = collection.required("name")?;
			for item in collection.children_named("Item") {
				registrations.push(Registration {
					group: group.to_string(),
					name: item.required("name")?.to_string(),
					global_id: GlobalId(item.parse_attribute("id")?),
				});
			}
		}

		let links = match root.child("Links") {
			Some(links) => links
				.children()
				.iter()
				.map(link_state)
				.collect::<Result<Vec<_>, _>>()?,
			None => Vec::new(),
		};
		let global_properties = match root.child("GlobalPropertiesManagers") {
			Some(managers) => managers
				.children_named("GlobalPropertiesManager")
				.map(global_properties_state)
				.collect::<Result<Vec<_>, _>>()?,
			None => Vec::new(),
		};

		Ok(Self {
			proxies,
			registrations,
			links,
			global_properties,
			custom_definitions: root.child("CustomProxyDefinitions").cloned(),
		})
	}

	/// Ids of the stored proxy states.
	pub fn proxy_ids(&self) -> Vec<GlobalId> {
		self.proxies.iter().map(|p| p.global_id).collect()
	}

	/// Rewrites every id found in `map`. Unmapped ids are kept.
	pub fn remap(&mut self, map: &FxHashMap<GlobalId, GlobalId>) {
		let id = |old: GlobalId| map.get(&old).copied().unwrap_or(old);
		for state in &mut self.proxies {
			state.global_id = id(state.global_id);
			if let Body::Proxy(topology) = &mut state.body {
				for sub in &mut topology.sub_proxies {
					sub.global_id = id(sub.global_id);
				}
			}
			for prop in &mut state.properties {
				if let Variant::Proxy(refs) = &mut prop.value {
					for r in refs {
						r.id = id(r.id);
					}
				}
			}
		}
		for reg in &mut self.registrations {
			reg.global_id = id(reg.global_id);
		}
		for link in &mut self.links {
			for entry in &mut link.entries {
				entry.proxy = id(entry.proxy);
			}
		}
		for manager in &mut self.global_properties {
			for link in &mut manager.links {
				link.proxy = id(link.proxy);
			}
		}
	}
}

fn link_element(link: &LinkState) -> XmlElement {
	match link.kind {
		LinkKind::Property => {
			let mut element = XmlElement::new("PropertyLink").with_attribute("name", &link.name);
			for entry in &link.entries {
				element.push_child(
					XmlElement::new("Property")
						.with_attribute("id", entry.proxy)
						.with_attribute("name", entry.property.as_deref().unwrap_or_default())
						.with_attribute("direction", direction_name(entry.direction)),
				);
			}
			element
		}
		LinkKind::Proxy => {
			let mut element = XmlElement::new("ProxyLink").with_attribute("name", &link.name);
			for entry in &link.entries {
				element.push_child(
					XmlElement::new("Proxy")
						.with_attribute("id", entry.proxy)
						.with_attribute("direction", direction_name(entry.direction)),
				);
			}
			for exception in &link.exceptions {
				element.push_child(XmlElement::new("Exception").with_attribute("name", exception));
			}
			element
		}
	}
}

fn link_state(element: &XmlElement) -> Result<LinkState, XmlError> {
	let name = element.required("name")?.to_string();
	let (kind, tag) = match element.name() {
		"PropertyLink" => (LinkKind::Property, "Property"),
		"ProxyLink" => (LinkKind::Proxy, "Proxy"),
		other => return Err(XmlError::Structure(format!("unknown link <{other}>"))),
	};
	let entries = element
		.children_named(tag)
		.map(|entry| {
			Ok(LinkEntry {
				proxy: GlobalId(entry.parse_attribute("id")?),
				property: match kind {
					LinkKind::Property => Some(entry.required("name")?.to_string()),
					LinkKind::Proxy => None,
				},
				direction: parse_direction(entry)?,
			})
		})
		.collect::<Result<Vec<_>, XmlError>>()?;
	let exceptions = element
		.children_named("Exception")
		.map(|e| e.required("name").map(str::to_string))
		.collect::<Result<Vec<_>, _>>()?;
	Ok(LinkState {
		name,
		kind,
		entries,
		exceptions,
	})
}

fn global_properties_element(state: &GlobalPropertiesState) -> XmlElement {
	let mut element = XmlElement::new("GlobalPropertiesManager").with_attribute("name", &state.name);
	for value in &state.values {
		element.push_child(xml::property_element(&value.name, &value.value));
	}
	for link in &state.links {
		element.push_child(
			XmlElement::new("Link")
				.with_attribute("global_name", &link.global_property)
				.with_attribute("proxy", link.proxy)
				.with_attribute("property", &link.property),
		);
	}
	element
}

fn global_properties_state(element: &XmlElement) -> Result<GlobalPropertiesState, XmlError> {
	let values = element
		.children_named("Property")
		.map(|p| xml::property_value(p).map(|(name, value)| Property { name, value }))
		.collect::<Result<Vec<_>, _>>()?;
	let links = element
		.children_named("Link")
		.map(|link| {
			Ok(GlobalPropertyLink {
				global_property: link.required("global_name")?.to_string(),
				proxy: GlobalId(link.parse_attribute("proxy")?),
				property: link.required("property")?.to_string(),
			})
		})
		.collect::<Result<Vec<_>, XmlError>>()?;
	Ok(GlobalPropertiesState {
		name: element.required("name")?.to_string(),
		values,
		links,
	})
}
