//! Client-side session.
//!
//! The session owns the transport to its servers, the table of live remote
//! objects, the id lease, and the state cache feeding the undo history.
//! Every remote object holds only a weak reference back to it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use meridian_proto::{
	ClientId, GlobalId, InfoRequest, Information, Location, Message, Scheme, ServerUrl, Stream,
	Variant,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};

use crate::collaboration::CollaborationManager;
use crate::config::SessionConfig;
use crate::definitions::ProxyDefinitionManager;
use crate::error::Result;
use crate::proxy_locator::SessionProxyLocator;
use crate::proxy_manager::SessionProxyManager;
use crate::remote_object::{ObjectHandle, RemoteObject, RemoteObjectRef};
use crate::state_locator::{ServerStateLocator, StateLocator, StateLookup};
use crate::transport::{BuiltinTransport, SessionClient, Transport};
use crate::undo::UndoStackBuilder;

#[derive(Debug, Default)]
struct IdLease {
	next: u32,
	end: u32,
}

/// Connection to one server plus the client-side object replicas.
pub struct Session {
	this: Weak<Session>,
	config: SessionConfig,
	transport: Box<dyn Transport>,
	objects: Mutex<FxHashMap<GlobalId, ObjectHandle>>,
	ids: Mutex<IdLease>,
	state_locator: Arc<StateLocator>,
	undo_builder: Mutex<Option<Arc<UndoStackBuilder>>>,
	local_push_only: AtomicUsize,
	proxy_manager: Arc<SessionProxyManager>,
	collaboration: Arc<CollaborationManager>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("client_id", &self.client_id())
			.field("builtin", &self.transport.is_builtin())
			.field("objects", &self.objects.lock().len())
			.finish()
	}
}

impl Session {
	/// Session with an in-process server.
	pub fn builtin(config: SessionConfig, definitions: Arc<ProxyDefinitionManager>) -> Arc<Self> {
		Self::with_transport(Box::new(BuiltinTransport::new()), config, definitions)
	}

	/// Session for `url`. Connection loops poll `should_continue`.
	pub fn connect(
		url: &ServerUrl,
		config: SessionConfig,
		definitions: Arc<ProxyDefinitionManager>,
		should_continue: &mut dyn FnMut() -> bool,
	) -> Result<Arc<Self>> {
		if url.scheme == Scheme::Builtin {
			return Ok(Self::builtin(config, definitions));
		}
		let client = SessionClient::connect(url, &config, should_continue)?;
		Ok(Self::with_transport(Box::new(client), config, definitions))
	}

	/// Session over an arbitrary transport.
	pub fn with_transport(
		transport: Box<dyn Transport>,
		config: SessionConfig,
		definitions: Arc<ProxyDefinitionManager>,
	) -> Arc<Self> {
		let session = Arc::new_cyclic(|this: &Weak<Session>| {
			let server_states: Arc<dyn StateLookup> = Arc::new(ServerStateLocator::new(this.clone()));
			Self {
				this: this.clone(),
				config,
				transport,
				objects: Mutex::default(),
				ids: Mutex::default(),
				state_locator: Arc::new(StateLocator::with_parent(server_states)),
				undo_builder: Mutex::new(None),
				local_push_only: AtomicUsize::new(0),
				proxy_manager: SessionProxyManager::new(this.clone(), definitions),
				collaboration: CollaborationManager::new(this.clone()),
			}
		});
		session.register_remote_object(
			GlobalId::PROXY_MANAGER,
			session.proxy_manager.pipeline_state().handle(),
		);
		session.register_remote_object(
			GlobalId::COLLABORATION_MANAGER,
			session.collaboration.handle(),
		);
		// The first registration is then recorded as a change of this state.
		session
			.state_locator
			.register_state(&session.proxy_manager.full_state());
		if !session.transport.is_builtin()
			&& let Err(e) = session.collaboration.update_master_information()
		{
			warn!(error = %e, "failed to fetch collaboration information");
		}
		info!(client_id = %session.client_id(), builtin = session.is_builtin(), "session started");
		session
	}

	/// Tunables.
	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	/// Id assigned by the data server.
	pub fn client_id(&self) -> ClientId {
		self.transport.client_id()
	}

	/// Returns `true` for in-process sessions.
	pub fn is_builtin(&self) -> bool {
		self.transport.is_builtin()
	}

	/// Returns `true` while the connections are up.
	pub fn is_alive(&self) -> bool {
		self.transport.is_alive()
	}

	/// Aborts pending and future blocking calls.
	pub fn cancel(&self) {
		self.transport.cancel();
	}

	/// Session proxy manager.
	pub fn proxy_manager(&self) -> &Arc<SessionProxyManager> {
		&self.proxy_manager
	}

	/// Collaboration manager.
	pub fn collaboration_manager(&self) -> &Arc<CollaborationManager> {
		&self.collaboration
	}

	/// State cache of the undo history. Misses fall back to the server.
	pub fn state_locator(&self) -> &Arc<StateLocator> {
		&self.state_locator
	}

	/// Fresh proxy locator over this session and its state cache.
	pub fn proxy_locator(&self) -> SessionProxyLocator {
		SessionProxyLocator::new(self.this.clone(), self.state_locator.clone())
	}

	/// Installs (or removes) the builder recording undo elements.
	pub fn set_undo_stack_builder(&self, builder: Option<Arc<UndoStackBuilder>>) {
		*self.undo_builder.lock() = builder;
	}

	/// Installed undo builder.
	pub fn undo_stack_builder(&self) -> Option<Arc<UndoStackBuilder>> {
		self.undo_builder.lock().clone()
	}

	/// Next unused global id. Ids come from leases of
	/// `id_chunk_size` ids granted by the data server.
	pub fn next_global_id(&self) -> Result<GlobalId> {
		loop {
			{
				let mut lease = self.ids.lock();
				if lease.next < lease.end {
					let id = GlobalId(lease.next);
					lease.next += 1;
					return Ok(id);
				}
			}
			let (first, count) = self.transport.reserve_global_ids(self.config.id_chunk_size.max(1))?;
			debug!(first = %first, count, "global id lease granted");
			let mut lease = self.ids.lock();
			if lease.next >= lease.end {
				lease.next = first.0;
				lease.end = first.0.saturating_add(count);
			}
		}
	}

	/// Skips `id` in the current lease so it is never handed out.
	pub fn observe_global_id(&self, id: GlobalId) {
		let mut lease = self.ids.lock();
		if id.0 >= lease.next && id.0 < lease.end {
			lease.next = id.0 + 1;
		}
	}

	/// Adds an object to the table of live objects.
	pub fn register_remote_object(&self, id: GlobalId, handle: ObjectHandle) {
		trace!(global_id = %id, "remote object registered");
		if let Some(previous) = self.objects.lock().insert(id, handle)
			&& !previous.is_dead()
		{
			warn!(global_id = %id, "replaced a live remote object");
		}
	}

	/// Drops the table entry of `id` once its object is gone.
	pub fn unregister_remote_object(&self, id: GlobalId) {
		let mut objects = self.objects.lock();
		if objects.get(&id).is_some_and(ObjectHandle::is_dead) {
			objects.remove(&id);
		}
	}

	/// Live object with `id`.
	pub fn get_remote_object(&self, id: GlobalId) -> Option<RemoteObjectRef> {
		let handle = self.objects.lock().get(&id).cloned();
		handle.and_then(|h| h.upgrade())
	}

	/// Strong references to every live object.
	pub fn collect_remote_objects(&self) -> Vec<RemoteObjectRef> {
		let handles: Vec<ObjectHandle> = self.objects.lock().values().cloned().collect();
		handles.iter().filter_map(ObjectHandle::upgrade).collect()
	}

	/// Routes a state to its location and records it in the undo history.
	pub fn push_state(&self, msg: &Message) -> Result<()> {
		if !msg.share_only {
			self.update_state_history(msg);
		}
		if self.local_push_only.load(Ordering::Acquire) > 0 {
			let local = msg.location & Location::CLIENT;
			if local.is_empty() {
				return Ok(());
			}
			let mut msg = msg.clone();
			msg.location = local;
			return self.transport.push_state(&msg);
		}
		self.transport.push_state(msg)
	}

	/// Fetches the server-side state of `msg.global_id`.
	pub fn pull_state(&self, msg: &Message) -> Result<Message> {
		self.transport.pull_state(msg)
	}

	/// Drops the server-side counterpart of an object.
	pub fn delete_si(&self, msg: &Message) -> Result<()> {
		if self.local_push_only.load(Ordering::Acquire) > 0 {
			return Ok(());
		}
		self.transport.delete_si(msg)
	}

	/// Runs a command stream at `location`.
	pub fn execute_stream(&self, location: Location, stream: &Stream, ignore_errors: bool) -> Result<()> {
		self.transport.execute_stream(location, stream, ignore_errors)
	}

	/// Result of the previous stream at `location`.
	pub fn last_result(&self, location: Location) -> Result<Option<Variant>> {
		self.transport.last_result(location)
	}

	/// Gathers information from the processes in `location`.
	pub fn gather_information(&self, location: Location, req: &InfoRequest) -> Result<Information> {
		self.transport
			.gather_information(location, req)
			.inspect_err(|e| error!(class = req.kind.class_name(), error = %e, "Server failed to gather information"))
	}

	/// Pushes issued until the guard drops reach the client side only.
	pub fn local_push_only(&self) -> LocalPushOnly<'_> {
		self.local_push_only.fetch_add(1, Ordering::AcqRel);
		LocalPushOnly { session: self }
	}

	/// Applies the notifications relayed since the last call and returns
	/// how many were processed.
	///
	/// Share-only messages go to the collaboration manager. Other states
	/// are loaded into the matching live object without pushing them back;
	/// states of unknown objects are cached for later rebuilding.
	pub fn process_notifications(&self) -> Result<usize> {
		let messages = self.transport.drain_notifications();
		let count = messages.len();
		for msg in messages {
			if msg.share_only {
				self.collaboration.handle_notification(&msg);
			} else if let Err(e) = self.apply_remote_state(&msg) {
				warn!(global_id = %msg.global_id, client_id = %msg.client_id, error = %e, "failed to apply remote state");
			}
		}
		Ok(count)
	}

	fn apply_remote_state(&self, msg: &Message) -> Result<()> {
		trace!(global_id = %msg.global_id, client_id = %msg.client_id, "remote state");
		let Some(object) = self.get_remote_object(msg.global_id) else {
			let mut cached = self
				.state_locator
				.find_state(msg.global_id, false)
				.unwrap_or_else(|| Message::new(msg.global_id, msg.location));
			cached.merge_from(msg);
			if cached.has_type() {
				self.state_locator.register_state(&cached);
			}
			return Ok(());
		};
		let _local = self.local_push_only();
		let locator = self.proxy_locator();
		object.load_state(msg, &locator)?;
		object.mark_remote_applied();
		if let Some(mut state) = object.full_state() {
			state.location = msg.location;
			self.state_locator.register_state(&state);
		}
		Ok(())
	}

	/// Records the transition of the pushed object in the state cache and,
	/// while recording, in the undo builder.
	fn update_state_history(&self, msg: &Message) {
		let Some(object) = self.get_remote_object(msg.global_id) else {
			return;
		};
		if object.is_prototype() {
			return;
		}
		let Some(mut new_state) = object.full_state() else {
			return;
		};
		if self.config.is_undo_excluded(new_state.xml_name.as_deref()) {
			return;
		}
		new_state.global_id = msg.global_id;
		new_state.location = msg.location;

		let old_state = self.state_locator.find_state(msg.global_id, false);
		if old_state.as_ref().is_some_and(|old| old.serialized_eq(&new_state)) {
			return;
		}
		self.state_locator.register_state(&new_state);

		if self.local_push_only.load(Ordering::Acquire) > 0 {
			return;
		}
		let Some(builder) = self.undo_stack_builder() else {
			return;
		};
		match old_state {
			None => builder.on_create_object(&self.this, &new_state),
			Some(old_state) => builder.on_state_change(&self.this, msg.global_id, &old_state, &new_state),
		}
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		debug!("session closed");
	}
}

/// Guard returned by [`Session::local_push_only`].
#[derive(Debug)]
pub struct LocalPushOnly<'a> {
	session: &'a Session,
}

impl Drop for LocalPushOnly<'_> {
	fn drop(&mut self) {
		self.session.local_push_only.fetch_sub(1, Ordering::AcqRel);
	}
}
