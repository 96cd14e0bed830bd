use meridian_proto::{
	ClientId, GlobalId, InfoRequest, Information, Location, Message, ServerRole, Stream, Variant,
};
use meridian_server::ServiceCore;
use parking_lot::Mutex;
use tracing::trace;

use super::Transport;
use crate::error::{Error, Result};

/// In-process server.
///
/// One [`ServiceCore`] stands in for every process role; ids are leased
/// from its allocator exactly as a remote data server would.
#[derive(Debug)]
pub struct BuiltinTransport {
	core: Mutex<ServiceCore>,
}

impl Default for BuiltinTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl BuiltinTransport {
	/// Fresh in-process server.
	pub fn new() -> Self {
		Self {
			core: Mutex::new(ServiceCore::new(ServerRole::Combined, 1)),
		}
	}
}

impl Transport for BuiltinTransport {
	fn push_state(&self, msg: &Message) -> Result<()> {
		trace!(global_id = %msg.global_id, "builtin push");
		self.core.lock().push(ClientId::NONE, msg.clone());
		Ok(())
	}

	fn pull_state(&self, msg: &Message) -> Result<Message> {
		self.core.lock().pull(msg).map_err(Error::Remote)
	}

	fn delete_si(&self, msg: &Message) -> Result<()> {
		self.core.lock().delete_si(ClientId::NONE, msg);
		Ok(())
	}

	fn execute_stream(&self, _location: Location, stream: &Stream, ignore_errors: bool) -> Result<()> {
		self.core
			.lock()
			.execute_stream(ClientId::NONE, ignore_errors, stream)
			.map_err(Error::Remote)
	}

	fn last_result(&self, _location: Location) -> Result<Option<Variant>> {
		Ok(self.core.lock().last_result(ClientId::NONE))
	}

	fn gather_information(&self, _location: Location, req: &InfoRequest) -> Result<Information> {
		self.core
			.lock()
			.gather(ClientId::NONE, req)
			.map_err(Error::GatherInformation)
	}

	fn reserve_global_ids(&self, count: u32) -> Result<(GlobalId, u32)> {
		self.core.lock().reserve_ids(count).map_err(Error::Remote)
	}

	fn client_id(&self) -> ClientId {
		ClientId::NONE
	}

	fn is_alive(&self) -> bool {
		true
	}

	fn is_builtin(&self) -> bool {
		true
	}

	fn drain_notifications(&self) -> Vec<Message> {
		Vec::new()
	}

	fn cancel(&self) {}
}
