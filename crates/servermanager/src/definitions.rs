//! Proxy definitions.
//!
//! Definitions are loaded from TOML:
//!
//! ```toml
//! [[proxy]]
//! group = "sources"
//! name = "SphereSource"
//! location = "data-server"
//! properties = [
//!     { name = "Radius", default = { double = [0.5] } },
//!     { name = "Input", default = "proxy" },
//! ]
//! sub_proxies = [{ name = "Transform", group = "extended_sources", proxy = "Transform" }]
//! ```
//!
//! Locations are `|`-separated role names: `client`, `data-server`,
//! `data-server-root`, `render-server`, `render-server-root`, `servers`,
//! `client-and-servers`.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use meridian_proto::{Location, Variant};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::ConfigError;
use crate::xml::{XmlElement, XmlError, property_element, property_value};

/// Property of a proxy definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropertyDefinition {
	/// Property name.
	pub name: String,
	/// Initial value; its kind fixes the property type.
	#[serde(deserialize_with = "deserialize_default")]
	pub default: Variant,
}

/// Sub-proxy of a proxy definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubProxyDefinition {
	/// Name within the parent.
	pub name: String,
	/// Definition group of the sub-proxy.
	pub group: String,
	/// Definition name of the sub-proxy.
	pub proxy: String,
}

/// Type description of a proxy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyDefinition {
	/// Definition group.
	pub group: String,
	/// Definition name.
	pub name: String,
	/// Processes hosting instances.
	#[serde(default = "default_location", deserialize_with = "deserialize_location")]
	pub location: Location,
	/// Properties in declaration order.
	#[serde(default)]
	pub properties: Vec<PropertyDefinition>,
	/// Sub-proxies in declaration order.
	#[serde(default)]
	pub sub_proxies: Vec<SubProxyDefinition>,
}

impl ProxyDefinition {
	/// Definition without properties.
	pub fn new(group: impl Into<String>, name: impl Into<String>, location: Location) -> Self {
		Self {
			group: group.into(),
			name: name.into(),
			location,
			properties: Vec::new(),
			sub_proxies: Vec::new(),
		}
	}

	/// Adds a property.
	pub fn with_property(mut self, name: impl Into<String>, default: Variant) -> Self {
		self.properties.push(PropertyDefinition {
			name: name.into(),
			default,
		});
		self
	}

	/// Adds a sub-proxy.
	pub fn with_sub_proxy(
		mut self,
		name: impl Into<String>,
		group: impl Into<String>,
		proxy: impl Into<String>,
	) -> Self {
		self.sub_proxies.push(SubProxyDefinition {
			name: name.into(),
			group: group.into(),
			proxy: proxy.into(),
		});
		self
	}

	/// Property definition by name.
	pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
		self.properties.iter().find(|p| p.name == name)
	}

	/// `<CustomProxyDefinition>` element.
	pub fn to_xml(&self) -> XmlElement {
		let mut element = XmlElement::new("CustomProxyDefinition")
			.with_attribute("group", &self.group)
			.with_attribute("name", &self.name)
			.with_attribute("location", location_name(self.location));
		for prop in &self.properties {
			element.push_child(property_element(&prop.name, &prop.default));
		}
		for sub in &self.sub_proxies {
			element.push_child(
				XmlElement::new("SubProxy")
					.with_attribute("name", &sub.name)
					.with_attribute("group", &sub.group)
					.with_attribute("proxy", &sub.proxy),
			);
		}
		element
	}

	/// Inverse of [`to_xml`](Self::to_xml).
	pub fn from_xml(element: &XmlElement) -> Result<Self, XmlError> {
		let location = parse_location(element.required("location")?).map_err(|_| XmlError::Attribute {
			element: element.name().to_string(),
			attribute: "location".into(),
		})?;
		let mut def = Self::new(element.required("group")?, element.required("name")?, location);
		for prop in element.children_named("Property") {
			let (name, default) = property_value(prop)?;
			def.properties.push(PropertyDefinition { name, default });
		}
		for sub in element.children_named("SubProxy") {
			def.sub_proxies.push(SubProxyDefinition {
				name: sub.required("name")?.to_string(),
				group: sub.required("group")?.to_string(),
				proxy: sub.required("proxy")?.to_string(),
			});
		}
		Ok(def)
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum DefaultValue {
	Int(Vec<i64>),
	Double(Vec<f64>),
	String(Vec<String>),
	Proxy,
}

fn deserialize_default<'de, D: Deserializer<'de>>(d: D) -> Result<Variant, D::Error> {
	Ok(match DefaultValue::deserialize(d)? {
		DefaultValue::Int(v) => Variant::Int(v),
		DefaultValue::Double(v) => Variant::Double(v),
		DefaultValue::String(v) => Variant::Str(v),
		DefaultValue::Proxy => Variant::Proxy(Vec::new()),
	})
}

fn default_location() -> Location {
	Location::DATA_SERVER
}

fn deserialize_location<'de, D: Deserializer<'de>>(d: D) -> Result<Location, D::Error> {
	let s = String::deserialize(d)?;
	parse_location(&s).map_err(serde::de::Error::custom)
}

const LOCATION_NAMES: [(&str, Location); 5] = [
	("client", Location::CLIENT),
	("data-server", Location::DATA_SERVER),
	("data-server-root", Location::DATA_SERVER_ROOT),
	("render-server", Location::RENDER_SERVER),
	("render-server-root", Location::RENDER_SERVER_ROOT),
];

/// Parses a `|`-separated location list; an empty string is a prototype
/// location.
pub fn parse_location(input: &str) -> Result<Location, ConfigError> {
	let mut location = Location::empty();
	for part in input.split('|').map(str::trim).filter(|p| !p.is_empty()) {
		location |= match part {
			"servers" => Location::SERVERS,
			"client-and-servers" => Location::CLIENT_AND_SERVERS,
			_ => LOCATION_NAMES
				.iter()
				.find(|(name, _)| *name == part)
				.map(|(_, loc)| *loc)
				.ok_or_else(|| ConfigError::UnknownLocation(part.to_string()))?,
		};
	}
	Ok(location)
}

/// Inverse of [`parse_location`].
pub fn location_name(location: Location) -> String {
	LOCATION_NAMES
		.iter()
		.filter(|(_, loc)| location.contains(*loc))
		.map(|(name, _)| *name)
		.collect::<Vec<_>>()
		.join("|")
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionFile {
	#[serde(default, rename = "proxy")]
	proxies: Vec<ProxyDefinition>,
}

type Key = (String, String);

fn key(group: &str, name: &str) -> Key {
	(group.to_string(), name.to_string())
}

/// Registry of proxy definitions.
///
/// Custom definitions are the ones registered at run time; only they are
/// written to state files.
#[derive(Debug, Default)]
pub struct ProxyDefinitionManager {
	definitions: RwLock<IndexMap<Key, Arc<ProxyDefinition>>>,
	custom: RwLock<FxHashSet<Key>>,
}

impl ProxyDefinitionManager {
	/// Empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registry holding the definitions of a TOML document.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let file: DefinitionFile = toml::from_str(input)?;
		let manager = Self::new();
		for def in file.proxies {
			manager.register(def);
		}
		Ok(manager)
	}

	/// Registry loaded from a TOML file.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&input)
	}

	/// Adds or replaces a built-in definition.
	pub fn register(&self, def: ProxyDefinition) {
		debug!(group = %def.group, name = %def.name, "proxy definition registered");
		self.definitions
			.write()
			.insert(key(&def.group, &def.name), Arc::new(def));
	}

	/// Adds or replaces a custom definition.
	pub fn register_custom(&self, def: ProxyDefinition) {
		self.custom.write().insert(key(&def.group, &def.name));
		self.register(def);
	}

	/// Removes a custom definition. Built-in definitions stay.
	pub fn unregister_custom(&self, group: &str, name: &str) -> bool {
		let k = key(group, name);
		if !self.custom.write().remove(&k) {
			return false;
		}
		self.definitions.write().shift_remove(&k);
		true
	}

	/// Definition by group and name.
	pub fn get(&self, group: &str, name: &str) -> Option<Arc<ProxyDefinition>> {
		self.definitions.read().get(&key(group, name)).cloned()
	}

	/// Returns `true` if the definition exists.
	pub fn contains(&self, group: &str, name: &str) -> bool {
		self.definitions.read().contains_key(&key(group, name))
	}

	/// Number of definitions.
	pub fn len(&self) -> usize {
		self.definitions.read().len()
	}

	/// Returns `true` without definitions.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Custom definitions in registration order.
	pub fn custom_definitions(&self) -> Vec<Arc<ProxyDefinition>> {
		let custom = self.custom.read();
		self.definitions
			.read()
			.iter()
			.filter(|(k, _)| custom.contains(*k))
			.map(|(_, def)| def.clone())
			.collect()
	}

	/// `<CustomProxyDefinitions>` element for state files.
	pub fn custom_definitions_xml(&self) -> XmlElement {
		let mut root = XmlElement::new("CustomProxyDefinitions");
		for def in self.custom_definitions() {
			root.push_child(def.to_xml());
		}
		root
	}

	/// Registers every definition of a `<CustomProxyDefinitions>` element.
	pub fn load_custom_definitions_xml(&self, root: &XmlElement) -> Result<(), XmlError> {
		for element in root.children_named("CustomProxyDefinition") {
			self.register_custom(ProxyDefinition::from_xml(element)?);
		}
		Ok(())
	}
}
