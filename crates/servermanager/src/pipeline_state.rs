//! Remote object carrying the proxy manager's registrations.

use std::sync::{Arc, Weak};

use meridian_proto::{GlobalId, Location, Message};
use tracing::trace;

use crate::error::Result;
use crate::proxy_locator::ProxyLocator;
use crate::proxy_manager::SessionProxyManager;
use crate::remote_object::{ObjectHandle, RemoteIdentity, RemoteObject};
use crate::session::Session;

/// Replicates the [`SessionProxyManager`] state under the reserved
/// [`GlobalId::PROXY_MANAGER`] id at the data-server root.
pub struct PipelineState {
	this: Weak<PipelineState>,
	identity: RemoteIdentity,
	proxy_manager: Weak<SessionProxyManager>,
}

impl std::fmt::Debug for PipelineState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PipelineState")
			.field("global_id", &self.identity.peek_global_id())
			.finish()
	}
}

impl PipelineState {
	pub(crate) fn new(session: Weak<Session>, proxy_manager: Weak<SessionProxyManager>) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			identity: RemoteIdentity::reserved(
				session,
				GlobalId::PROXY_MANAGER,
				Location::DATA_SERVER_ROOT,
			),
			proxy_manager,
		})
	}

	/// Pushes the current proxy manager state unless updates are
	/// suspended (bulk registration changes in progress).
	pub fn validate_state(&self) -> Result<()> {
		let Some(pm) = self.proxy_manager.upgrade() else {
			return Ok(());
		};
		if pm.is_state_update_suspended() {
			return Ok(());
		}
		trace!("pushing proxy manager state");
		self.push_state(pm.full_state())
	}
}

impl RemoteObject for PipelineState {
	fn identity(&self) -> &RemoteIdentity {
		&self.identity
	}

	fn handle(&self) -> ObjectHandle {
		ObjectHandle::PipelineState(self.this.clone())
	}

	fn full_state(&self) -> Option<Message> {
		self.proxy_manager.upgrade().map(|pm| pm.full_state())
	}

	fn load_state(&self, state: &Message, locator: &dyn ProxyLocator) -> Result<()> {
		match self.proxy_manager.upgrade() {
			Some(pm) => pm.load_state(state, locator),
			None => Ok(()),
		}
	}
}
