//! Process-wide server manager context.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use meridian_proto::{ServerUrl, SessionId};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::definitions::ProxyDefinitionManager;
use crate::error::Result;
use crate::session::Session;

/// Sessions of this process plus the definitions they share.
///
/// Session ids are non-zero and never reused. The active session is an
/// explicit choice, not the most recent connection, except that the first
/// session becomes active when none is.
#[derive(Debug)]
pub struct ServerManager {
	definitions: Arc<ProxyDefinitionManager>,
	config: SessionConfig,
	sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
	next_session: AtomicU32,
	active: Mutex<Option<SessionId>>,
}

impl ServerManager {
	/// Context whose sessions start with `config`.
	pub fn new(config: SessionConfig, definitions: Arc<ProxyDefinitionManager>) -> Self {
		Self {
			definitions,
			config,
			sessions: Mutex::default(),
			next_session: AtomicU32::new(1),
			active: Mutex::new(None),
		}
	}

	/// Shared proxy definitions.
	pub fn definitions(&self) -> &Arc<ProxyDefinitionManager> {
		&self.definitions
	}

	/// Default session configuration.
	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	/// Connects to `url` (`builtin:`, `cs://`, `csrc://`, `cdsrs://` or
	/// `cdsrsrc://`) and registers the session.
	pub fn connect(&self, url: &str) -> Result<SessionId> {
		self.connect_with(url, &mut || true)
	}

	/// [`connect`](Self::connect) whose connection loop stops once
	/// `should_continue` returns `false`.
	pub fn connect_with(&self, url: &str, should_continue: &mut dyn FnMut() -> bool) -> Result<SessionId> {
		let parsed = ServerUrl::parse(url)?;
		let session = Session::connect(
			&parsed,
			self.config.clone(),
			self.definitions.clone(),
			should_continue,
		)?;
		Ok(self.add_session(session))
	}

	/// [`connect`](Self::connect) reporting failure as `SessionId(0)`.
	pub fn connect_or_zero(&self, url: &str) -> SessionId {
		self.connect(url).unwrap_or_else(|e| {
			warn!(url, error = %e, "connection failed");
			SessionId(0)
		})
	}

	/// Registers an already connected session.
	pub fn add_session(&self, session: Arc<Session>) -> SessionId {
		let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
		self.sessions.lock().insert(id, session);
		let mut active = self.active.lock();
		if active.is_none() {
			*active = Some(id);
		}
		info!(session_id = id.0, "session registered");
		id
	}

	/// Session registered as `id`.
	pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
		self.sessions.lock().get(&id).cloned()
	}

	/// Registered session ids in ascending order.
	pub fn session_ids(&self) -> Vec<SessionId> {
		self.sessions.lock().keys().copied().collect()
	}

	/// Active session, if any.
	pub fn active_session(&self) -> Option<Arc<Session>> {
		let id = (*self.active.lock())?;
		self.session(id)
	}

	/// Id of the active session.
	pub fn active_session_id(&self) -> Option<SessionId> {
		*self.active.lock()
	}

	/// Makes `id` active. Returns `false` if no such session exists.
	pub fn set_active_session(&self, id: SessionId) -> bool {
		if !self.sessions.lock().contains_key(&id) {
			return false;
		}
		*self.active.lock() = Some(id);
		true
	}

	/// Unregisters a session. It closes once the last reference drops.
	pub fn remove_session(&self, id: SessionId) -> Option<Arc<Session>> {
		let removed = self.sessions.lock().remove(&id);
		let mut active = self.active.lock();
		if *active == Some(id) {
			*active = None;
		}
		if removed.is_some() {
			info!(session_id = id.0, "session removed");
		}
		removed
	}
}
