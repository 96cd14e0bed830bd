//! Identity shared by every replicated client-side object.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use meridian_proto::{GlobalId, Location, Message};
use tracing::error;

use crate::collaboration::CollaborationManager;
use crate::error::{Error, Result};
use crate::pipeline_state::PipelineState;
use crate::proxy::Proxy;
use crate::proxy_locator::ProxyLocator;
use crate::selection::SelectionModel;
use crate::session::Session;

/// Global id, location and owning session of a remote object.
///
/// The id is assigned at most once: it starts unset and is either forced
/// through [`set_global_id`](Self::set_global_id) or drawn from the session
/// the first time it is needed.
#[derive(Debug)]
pub struct RemoteIdentity {
	global_id: AtomicU32,
	location: Location,
	session: Weak<Session>,
}

impl RemoteIdentity {
	/// Identity without an id yet.
	pub fn new(session: Weak<Session>, location: Location) -> Self {
		Self {
			global_id: AtomicU32::new(GlobalId::NONE.0),
			location,
			session,
		}
	}

	/// Identity with a reserved id.
	pub fn reserved(session: Weak<Session>, id: GlobalId, location: Location) -> Self {
		Self {
			global_id: AtomicU32::new(id.0),
			location,
			session,
		}
	}

	/// Current id, [`GlobalId::NONE`] until assigned.
	pub fn peek_global_id(&self) -> GlobalId {
		GlobalId(self.global_id.load(Ordering::Acquire))
	}

	/// Assigns the id.
	///
	/// Returns `true` if the id was newly set.
	///
	/// # Panics
	///
	/// Reassigning a different non-zero id breaks the identity invariant
	/// and panics.
	pub fn set_global_id(&self, id: GlobalId) -> bool {
		match self
			.global_id
			.compare_exchange(0, id.0, Ordering::AcqRel, Ordering::Acquire)
		{
			Ok(_) => !id.is_none(),
			Err(current) => {
				assert!(
					current == id.0 || id.is_none(),
					"global id {current} cannot be reassigned to {id}"
				);
				false
			}
		}
	}

	/// Target processes; empty for prototypes.
	pub fn location(&self) -> Location {
		self.location
	}

	/// Returns `true` for prototypes, which never reach a server.
	pub fn is_prototype(&self) -> bool {
		self.location.is_empty()
	}

	/// Owning session if it is still alive.
	pub fn session(&self) -> Option<Arc<Session>> {
		self.session.upgrade()
	}

	/// Weak session reference.
	pub fn session_weak(&self) -> &Weak<Session> {
		&self.session
	}
}

/// Behaviour shared by replicated objects.
pub trait RemoteObject: Send + Sync {
	/// Identity record.
	fn identity(&self) -> &RemoteIdentity;

	/// Weak handle stored in the session's object table.
	fn handle(&self) -> ObjectHandle;

	/// Complete current state of the object, `None` if it has none.
	fn full_state(&self) -> Option<Message>;

	/// Applies a state snapshot, resolving proxy references through
	/// `locator`.
	fn load_state(&self, state: &Message, locator: &dyn ProxyLocator) -> Result<()>;

	/// Global id, assigning one from the session on first use.
	fn try_global_id(&self) -> Result<GlobalId> {
		let identity = self.identity();
		let current = identity.peek_global_id();
		if !current.is_none() {
			return Ok(current);
		}
		let session = identity.session().ok_or(Error::Disconnected)?;
		let id = session.next_global_id()?;
		self.assign_global_id(id);
		Ok(identity.peek_global_id())
	}

	/// [`try_global_id`](Self::try_global_id) that logs failures and
	/// returns [`GlobalId::NONE`].
	fn global_id(&self) -> GlobalId {
		self.try_global_id().unwrap_or_else(|e| {
			error!(error = %e, "failed to assign global id");
			GlobalId::NONE
		})
	}

	/// Forces the id and registers the object with its session.
	fn assign_global_id(&self, id: GlobalId) {
		if self.identity().set_global_id(id)
			&& let Some(session) = self.identity().session()
		{
			session.register_remote_object(id, self.handle());
		}
	}

	/// Sends `msg` to the object's location. Prototypes never push.
	fn push_state(&self, mut msg: Message) -> Result<()> {
		let identity = self.identity();
		if identity.is_prototype() {
			return Ok(());
		}
		msg.global_id = self.try_global_id()?;
		msg.location = identity.location();
		let session = identity.session().ok_or(Error::Disconnected)?;
		session.push_state(&msg)
	}

	/// Fetches the server-side state of the object. Prototypes answer with
	/// their local state.
	fn pull_state(&self) -> Result<Message> {
		let identity = self.identity();
		if identity.is_prototype() {
			return Ok(self
				.full_state()
				.unwrap_or_else(|| Message::new(identity.peek_global_id(), identity.location())));
		}
		let session = identity.session().ok_or(Error::Disconnected)?;
		let msg = Message::new(self.try_global_id()?, identity.location());
		session.pull_state(&msg)
	}
}

/// Weak entry of the session's object table.
#[derive(Debug, Clone)]
pub enum ObjectHandle {
	/// Proxy.
	Proxy(Weak<Proxy>),
	/// Pipeline state of the proxy manager.
	PipelineState(Weak<PipelineState>),
	/// Collaboration manager.
	Collaboration(Weak<CollaborationManager>),
	/// Selection model.
	Selection(Weak<SelectionModel>),
}

impl ObjectHandle {
	/// Strong reference, if the object is alive.
	pub fn upgrade(&self) -> Option<RemoteObjectRef> {
		Some(match self {
			Self::Proxy(p) => RemoteObjectRef::Proxy(p.upgrade()?),
			Self::PipelineState(p) => RemoteObjectRef::PipelineState(p.upgrade()?),
			Self::Collaboration(c) => RemoteObjectRef::Collaboration(c.upgrade()?),
			Self::Selection(s) => RemoteObjectRef::Selection(s.upgrade()?),
		})
	}

	/// Returns `true` once the object is gone.
	pub fn is_dead(&self) -> bool {
		match self {
			Self::Proxy(p) => p.strong_count() == 0,
			Self::PipelineState(p) => p.strong_count() == 0,
			Self::Collaboration(c) => c.strong_count() == 0,
			Self::Selection(s) => s.strong_count() == 0,
		}
	}
}

/// Strong reference to a live remote object.
#[derive(Debug, Clone)]
pub enum RemoteObjectRef {
	/// Proxy.
	Proxy(Arc<Proxy>),
	/// Pipeline state of the proxy manager.
	PipelineState(Arc<PipelineState>),
	/// Collaboration manager.
	Collaboration(Arc<CollaborationManager>),
	/// Selection model.
	Selection(Arc<SelectionModel>),
}

impl RemoteObjectRef {
	fn object(&self) -> &dyn RemoteObject {
		match self {
			Self::Proxy(p) => p.as_ref(),
			Self::PipelineState(p) => p.as_ref(),
			Self::Collaboration(c) => c.as_ref(),
			Self::Selection(s) => s.as_ref(),
		}
	}

	/// The proxy, if this is one.
	pub fn as_proxy(&self) -> Option<&Arc<Proxy>> {
		match self {
			Self::Proxy(p) => Some(p),
			_ => None,
		}
	}

	/// Id of the object.
	pub fn global_id(&self) -> GlobalId {
		self.object().identity().peek_global_id()
	}

	/// Returns `true` for prototypes.
	pub fn is_prototype(&self) -> bool {
		self.object().identity().is_prototype()
	}

	/// See [`RemoteObject::full_state`].
	pub fn full_state(&self) -> Option<Message> {
		self.object().full_state()
	}

	/// See [`RemoteObject::load_state`].
	pub fn load_state(&self, state: &Message, locator: &dyn ProxyLocator) -> Result<()> {
		self.object().load_state(state, locator)
	}

	/// Pushes whatever [`load_state`](Self::load_state) left pending.
	pub fn push_loaded_state(&self) -> Result<()> {
		match self {
			Self::Proxy(p) => p.update_vtk_objects(),
			Self::PipelineState(p) => p.validate_state(),
			Self::Collaboration(_) | Self::Selection(_) => Ok(()),
		}
	}

	/// Marks a remotely received state as already applied server-side.
	pub fn mark_remote_applied(&self) {
		if let Self::Proxy(p) = self {
			p.mark_pushed();
		}
	}
}
