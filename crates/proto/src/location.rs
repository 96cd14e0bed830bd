//! Process-role location mask.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Set of process roles a message is routed to, or on which an object has a
/// counterpart.
///
/// An object with an empty location is a prototype: it is never pushed or
/// pulled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(u32);

bitflags! {
	impl Location: u32 {
		/// The client process.
		const CLIENT = 0x01;
		/// Every data-server process.
		const DATA_SERVER = 0x04;
		/// The root data-server process only.
		const DATA_SERVER_ROOT = 0x08;
		/// Every render-server process.
		const RENDER_SERVER = 0x10;
		/// The root render-server process only.
		const RENDER_SERVER_ROOT = 0x20;
		/// All server roles.
		const SERVERS = Self::DATA_SERVER.bits() | Self::RENDER_SERVER.bits();
		/// Client plus all server roles.
		const CLIENT_AND_SERVERS = Self::CLIENT.bits() | Self::SERVERS.bits();
	}
}

impl Location {
	/// Returns `true` if any data-server bit is set.
	pub fn targets_data_server(self) -> bool {
		self.intersects(Self::DATA_SERVER | Self::DATA_SERVER_ROOT)
	}

	/// Returns `true` if any render-server bit is set.
	pub fn targets_render_server(self) -> bool {
		self.intersects(Self::RENDER_SERVER | Self::RENDER_SERVER_ROOT)
	}

	/// Folds render-server bits onto the matching data-server bits.
	///
	/// Used when the data server also plays the render-server role.
	pub fn fold_render_into_data(self) -> Self {
		let mut folded = self - (Self::RENDER_SERVER | Self::RENDER_SERVER_ROOT);
		if self.contains(Self::RENDER_SERVER) {
			folded |= Self::DATA_SERVER;
		}
		if self.contains(Self::RENDER_SERVER_ROOT) {
			folded |= Self::DATA_SERVER_ROOT;
		}
		folded
	}
}
