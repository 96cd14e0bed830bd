//! Replicated state envelope.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::ids::{ClientId, GlobalId};
use crate::location::Location;
use crate::variant::Variant;

/// Named property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
	/// Property name.
	pub name: String,
	/// Property value.
	pub value: Variant,
}

/// Snapshot of one replicated object's identity and state.
///
/// Two messages with the same [`GlobalId`] are two snapshots of the same
/// object. Change detection compares their postcard encodings
/// ([`Message::serialized_eq`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
	/// Object identity.
	pub global_id: GlobalId,
	/// Target process roles.
	pub location: Location,
	/// Sending client, stamped by the server on relay.
	pub client_id: ClientId,
	/// Deliver to other clients only, never applied to server-side objects.
	pub share_only: bool,
	/// Definition group of the object type.
	pub xml_group: Option<String>,
	/// Definition name of the object type.
	pub xml_name: Option<String>,
	/// Property bag.
	pub properties: Vec<Property>,
	/// Structural extension.
	pub body: Body,
}

/// Typed structural extension of a [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Body {
	/// Properties only.
	#[default]
	Empty,
	/// Proxy sub-object topology.
	Proxy(ProxyState),
	/// Proxy manager registrations.
	ProxyManager(ProxyManagerState),
	/// Collaboration notification.
	Collaboration(CollaborationBody),
	/// Selection model state.
	Selection(SelectionState),
}

/// Sub-proxy topology of a proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyState {
	/// Named sub-proxies, in definition order.
	pub sub_proxies: Vec<SubProxyRef>,
}

/// Named sub-proxy of a proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProxyRef {
	/// Name within the parent.
	pub name: String,
	/// Sub-proxy identity.
	pub global_id: GlobalId,
}

/// Serializable full state of the session proxy manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyManagerState {
	/// Registered (group, name, id) tuples.
	pub registered: Vec<Registration>,
	/// Registered links.
	pub links: Vec<LinkState>,
	/// Registered global properties managers.
	pub global_properties: Vec<GlobalPropertiesState>,
}

/// One proxy registration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Registration {
	/// Registration group.
	pub group: String,
	/// Registration name.
	pub name: String,
	/// Registered proxy.
	pub global_id: GlobalId,
}

/// Kind of a registered link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
	/// Explicit property pairs.
	Property,
	/// Every property of the linked proxies.
	Proxy,
}

/// Direction of a link participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkDirection {
	/// Changes here propagate to the outputs.
	Input,
	/// Receives propagated changes.
	Output,
}

/// One participant of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
	/// Linked proxy.
	pub proxy: GlobalId,
	/// Linked property, for property links.
	pub property: Option<String>,
	/// Participant direction.
	pub direction: LinkDirection,
}

/// Serialized link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkState {
	/// Registration name.
	pub name: String,
	/// Link kind.
	pub kind: LinkKind,
	/// Participants.
	pub entries: Vec<LinkEntry>,
	/// Property names a proxy link never propagates.
	pub exceptions: Vec<String>,
}

/// Target of a global property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPropertyLink {
	/// Global property name.
	pub global_property: String,
	/// Linked proxy.
	pub proxy: GlobalId,
	/// Linked property on that proxy.
	pub property: String,
}

/// Serialized global properties manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPropertiesState {
	/// Registration name.
	pub name: String,
	/// Global property values.
	pub values: Vec<Property>,
	/// Linked targets.
	pub links: Vec<GlobalPropertyLink>,
}

/// Notification exchanged between collaborating clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollaborationBody {
	/// The master role moved from `previous` to `next`.
	MasterChange {
		/// Master before the change.
		previous: ClientId,
		/// Master after the change.
		next: ClientId,
	},
	/// A client published its user name.
	UserName {
		/// Publishing client.
		client: ClientId,
		/// New user name.
		name: String,
	},
	/// A client connected or disconnected.
	ClientsChanged(MultiClientsInfo),
}

/// A connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
	/// Client id.
	pub id: ClientId,
	/// Published user name.
	pub name: String,
}

/// Snapshot of the connected clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiClientsInfo {
	/// Client the snapshot was gathered for.
	pub requester: ClientId,
	/// Current master.
	pub master: ClientId,
	/// Connected clients ordered by id.
	pub clients: Vec<ClientInfo>,
}

impl MultiClientsInfo {
	/// User name of `id`, if connected.
	pub fn user_name(&self, id: ClientId) -> Option<&str> {
		self.clients
			.iter()
			.find(|c| c.id == id)
			.map(|c| c.name.as_str())
	}
}

/// Selection model state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionState {
	/// Current proxy.
	pub current: GlobalId,
	/// Selected proxies.
	pub selected: Vec<GlobalId>,
}

impl Message {
	/// Empty message for `global_id` at `location`.
	pub fn new(global_id: GlobalId, location: Location) -> Self {
		Self {
			global_id,
			location,
			..Self::default()
		}
	}

	/// Sets the definition group and name.
	#[must_use]
	pub fn with_type(mut self, group: impl Into<String>, name: impl Into<String>) -> Self {
		self.xml_group = Some(group.into());
		self.xml_name = Some(name.into());
		self
	}

	/// Sets the structural extension.
	#[must_use]
	pub fn with_body(mut self, body: Body) -> Self {
		self.body = body;
		self
	}

	/// Returns `true` when the message carries object type metadata, i.e.
	/// the object it describes exists.
	pub fn has_type(&self) -> bool {
		self.xml_name.is_some() || !matches!(self.body, Body::Empty)
	}

	/// Value of the named property.
	pub fn property(&self, name: &str) -> Option<&Variant> {
		self.properties
			.iter()
			.find(|p| p.name == name)
			.map(|p| &p.value)
	}

	/// Inserts or replaces a property, preserving insertion order.
	pub fn set_property(&mut self, name: impl Into<String>, value: Variant) {
		let name = name.into();
		match self.properties.iter_mut().find(|p| p.name == name) {
			Some(p) => p.value = value,
			None => self.properties.push(Property { name, value }),
		}
	}

	/// Builder form of [`set_property`](Self::set_property).
	#[must_use]
	pub fn with_property(mut self, name: impl Into<String>, value: Variant) -> Self {
		self.set_property(name, value);
		self
	}

	/// Merges a newer partial snapshot into this one.
	///
	/// Properties are merged by name, type metadata is taken when present and
	/// a non-empty body replaces the current one.
	pub fn merge_from(&mut self, newer: &Message) {
		self.location = newer.location;
		if newer.xml_group.is_some() {
			self.xml_group.clone_from(&newer.xml_group);
		}
		if newer.xml_name.is_some() {
			self.xml_name.clone_from(&newer.xml_name);
		}
		for prop in &newer.properties {
			self.set_property(prop.name.clone(), prop.value.clone());
		}
		if !matches!(newer.body, Body::Empty) {
			self.body = newer.body.clone();
		}
	}

	/// Postcard encoding of the message.
	pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
		Ok(postcard::to_allocvec(self)?)
	}

	/// Decodes a message produced by [`encode`](Self::encode).
	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		Ok(postcard::from_bytes(bytes)?)
	}

	/// Byte-equality of the encodings, the change-detection test.
	pub fn serialized_eq(&self, other: &Message) -> bool {
		match (self.encode(), other.encode()) {
			(Ok(a), Ok(b)) => a == b,
			_ => false,
		}
	}
}
