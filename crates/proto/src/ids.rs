//! Identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session-wide identifier of a replicated object.
///
/// `0` means "no object". Ids `1..=RESERVED_MAX` belong to well-known
/// singletons; dynamically created objects start at [`GlobalId::FIRST_DYNAMIC`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(pub u32);

impl GlobalId {
	/// The invalid id.
	pub const NONE: Self = Self(0);
	/// The session proxy manager. The pipeline state shares this id since it
	/// replicates the proxy manager's registration state.
	pub const PROXY_MANAGER: Self = Self(1);
	/// The proxy definition manager.
	pub const PROXY_DEFINITION_MANAGER: Self = Self(2);
	/// The collaboration communicator (client side: collaboration manager).
	pub const COLLABORATION_MANAGER: Self = Self(3);
	/// Last id of the reserved block.
	pub const RESERVED_MAX: Self = Self(10);
	/// First id handed out to dynamically created objects.
	pub const FIRST_DYNAMIC: Self = Self(Self::RESERVED_MAX.0 + 1);

	/// Returns `true` for the invalid id.
	pub fn is_none(self) -> bool {
		self.0 == 0
	}

	/// Returns `true` for ids in the reserved singleton block.
	pub fn is_reserved(self) -> bool {
		self.0 != 0 && self.0 <= Self::RESERVED_MAX.0
	}
}

impl fmt::Display for GlobalId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Identifier the server assigns to each connected client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl ClientId {
	/// No client (builtin sessions and "no master").
	pub const NONE: Self = Self(0);
}

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Identifier of a session registered with a server manager context.
///
/// `0` is the failure sentinel of connection attempts and is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

/// Correlates a request frame with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reserved_block() {
		assert!(!GlobalId::NONE.is_reserved());
		assert!(GlobalId::PROXY_MANAGER.is_reserved());
		assert!(GlobalId::RESERVED_MAX.is_reserved());
		assert!(!GlobalId::FIRST_DYNAMIC.is_reserved());
		assert_eq!(GlobalId::FIRST_DYNAMIC, GlobalId(11));
	}
}
