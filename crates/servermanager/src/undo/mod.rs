//! Undo history built from replicated state transitions.
//!
//! Every undoable change is an [`UndoElement`]: the state of one remote
//! object before and after a push. Elements recorded between a
//! [`UndoStackBuilder::begin`] and the matching `end` form one [`UndoSet`],
//! the unit the [`UndoStack`] undoes and redoes.
//!
//! Replaying a set loads the recorded states back into the live objects.
//! Objects that no longer exist are rebuilt from the session's state cache,
//! so undoing a deletion brings the proxy back under its original id.

mod builder;
#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub use builder::UndoStackBuilder;
use meridian_proto::{GlobalId, Message};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::proxy_locator::{ProxyLocator, SessionProxyLocator};
use crate::remote_object::RemoteObjectRef;
use crate::session::Session;

/// One state transition of a remote object.
#[derive(Debug, Clone)]
pub struct UndoElement {
	session: Weak<Session>,
	global_id: GlobalId,
	before: Option<Message>,
	after: Message,
}

impl UndoElement {
	/// Transition of an existing object from `before` to `after`.
	pub fn state_change(session: Weak<Session>, global_id: GlobalId, before: Message, after: Message) -> Self {
		Self {
			session,
			global_id,
			before: Some(before),
			after,
		}
	}

	/// First state of a new object. Undoing it does nothing; the registry
	/// change recorded alongside releases the object.
	pub fn creation(session: Weak<Session>, after: Message) -> Self {
		Self {
			session,
			global_id: after.global_id,
			before: None,
			after,
		}
	}

	/// Object the transition belongs to.
	pub fn global_id(&self) -> GlobalId {
		self.global_id
	}

	/// State before the transition, `None` for a creation.
	pub fn before(&self) -> Option<&Message> {
		self.before.as_ref()
	}

	/// State after the transition.
	pub fn after(&self) -> &Message {
		&self.after
	}

	/// Returns `true` if this records the creation of an object.
	pub fn is_creation(&self) -> bool {
		self.before.is_none()
	}
}

/// Elements undone and redone together.
#[derive(Debug, Clone, Default)]
pub struct UndoSet {
	label: String,
	elements: Vec<UndoElement>,
}

impl UndoSet {
	/// Empty set.
	pub fn new(label: impl Into<String>) -> Self {
		Self {
			label: label.into(),
			elements: Vec::new(),
		}
	}

	/// User-visible label.
	pub fn label(&self) -> &str {
		&self.label
	}

	/// Number of elements.
	pub fn len(&self) -> usize {
		self.elements.len()
	}

	/// Returns `true` if nothing was recorded.
	pub fn is_empty(&self) -> bool {
		self.elements.is_empty()
	}

	/// Appends an element.
	pub fn push(&mut self, element: UndoElement) {
		self.elements.push(element);
	}

	/// Elements in recording order.
	pub fn elements(&self) -> &[UndoElement] {
		&self.elements
	}

	fn undo(&self) -> Result<()> {
		let replay = Replay::new(self);
		for element in self.elements.iter().rev() {
			if let Some(before) = &element.before {
				replay.apply(element, before)?;
			}
		}
		Ok(())
	}

	fn redo(&self) -> Result<()> {
		let replay = Replay::new(self);
		for element in &self.elements {
			replay.apply(element, &element.after)?;
		}
		Ok(())
	}
}

/// Sessions touched by a replay, with their live objects held for its
/// whole duration: loading one state may release objects a later element
/// of the same set still refers to.
struct Replay {
	sessions: Vec<(Arc<Session>, SessionProxyLocator, Vec<RemoteObjectRef>)>,
}

impl Replay {
	fn new(set: &UndoSet) -> Self {
		let mut sessions: Vec<(Arc<Session>, SessionProxyLocator, Vec<RemoteObjectRef>)> = Vec::new();
		for element in &set.elements {
			let Some(session) = element.session.upgrade() else {
				continue;
			};
			if sessions.iter().any(|(s, ..)| Arc::ptr_eq(s, &session)) {
				continue;
			}
			let pinned = session.collect_remote_objects();
			let locator = session.proxy_locator();
			sessions.push((session, locator, pinned));
		}
		Self { sessions }
	}

	fn apply(&self, element: &UndoElement, state: &Message) -> Result<()> {
		let session = element.session.upgrade().ok_or(Error::Disconnected)?;
		let (session, locator, _) = self
			.sessions
			.iter()
			.find(|(s, ..)| Arc::ptr_eq(s, &session))
			.ok_or(Error::Disconnected)?;
		let id = element.global_id;
		let object = session
			.get_remote_object(id)
			.or_else(|| locator.locate_proxy(id).map(RemoteObjectRef::Proxy))
			.ok_or(Error::StateNotFound(id))?;
		trace!(global_id = %id, "replaying state");
		object.load_state(state, locator)?;
		object.push_loaded_state()
	}
}

/// Undo stack notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoStackEvent {
	/// A set was committed.
	Pushed(String),
	/// A set was undone.
	Undone(String),
	/// A set was redone.
	Redone(String),
	/// Both stacks were emptied.
	Cleared,
}

#[derive(Debug, Default)]
struct Stacks {
	undo: Vec<UndoSet>,
	redo: Vec<UndoSet>,
}

/// Committed undo sets plus the sets available for redo.
#[derive(Debug)]
pub struct UndoStack {
	max_depth: usize,
	stacks: Mutex<Stacks>,
	replaying: AtomicBool,
	events: Listeners<UndoStackEvent>,
}

impl UndoStack {
	/// Stack keeping at most `max_depth` undo sets.
	pub fn new(max_depth: usize) -> Arc<Self> {
		Arc::new(Self {
			max_depth: max_depth.max(1),
			stacks: Mutex::default(),
			replaying: AtomicBool::new(false),
			events: Listeners::default(),
		})
	}

	/// Subscribes to stack changes.
	pub fn subscribe(&self, callback: impl Fn(&UndoStackEvent) + Send + Sync + 'static) -> Subscription {
		self.events.subscribe(callback)
	}

	/// Commits `set` and discards the redo stack. The oldest set is dropped
	/// beyond the depth limit.
	pub fn push(&self, set: UndoSet) {
		let label = set.label.clone();
		let (cleared, dropped) = {
			let mut stacks = self.stacks.lock();
			trace!(
				label = %set.label,
				elements = set.len(),
				undo_stack = stacks.undo.len() + 1,
				"undo set pushed"
			);
			stacks.undo.push(set);
			let excess = stacks.undo.len().saturating_sub(self.max_depth);
			let dropped: Vec<UndoSet> = stacks.undo.drain(..excess).collect();
			(std::mem::take(&mut stacks.redo), dropped)
		};
		if !cleared.is_empty() {
			trace!(cleared = cleared.len(), "redo stack cleared");
		}
		drop((cleared, dropped));
		self.events.emit(&UndoStackEvent::Pushed(label));
	}

	/// Reverts the most recent set. Returns `false` if there is nothing to
	/// undo. A set that fails to replay stays on the undo stack.
	pub fn undo(&self) -> Result<bool> {
		let Some(set) = self.stacks.lock().undo.pop() else {
			trace!("undo: nothing to undo");
			return Ok(false);
		};
		debug!(label = %set.label, elements = set.len(), "undo");
		match self.replaying(|| set.undo()) {
			Ok(()) => {
				let label = set.label.clone();
				self.stacks.lock().redo.push(set);
				self.events.emit(&UndoStackEvent::Undone(label));
				Ok(true)
			}
			Err(e) => {
				warn!(label = %set.label, error = %e, "undo failed");
				self.stacks.lock().undo.push(set);
				Err(e)
			}
		}
	}

	/// Re-applies the most recently undone set. Returns `false` if there is
	/// nothing to redo.
	pub fn redo(&self) -> Result<bool> {
		let Some(set) = self.stacks.lock().redo.pop() else {
			trace!("redo: nothing to redo");
			return Ok(false);
		};
		debug!(label = %set.label, elements = set.len(), "redo");
		match self.replaying(|| set.redo()) {
			Ok(()) => {
				let label = set.label.clone();
				self.stacks.lock().undo.push(set);
				self.events.emit(&UndoStackEvent::Redone(label));
				Ok(true)
			}
			Err(e) => {
				warn!(label = %set.label, error = %e, "redo failed");
				self.stacks.lock().redo.push(set);
				Err(e)
			}
		}
	}

	fn replaying<T>(&self, f: impl FnOnce() -> T) -> T {
		let was = self.replaying.swap(true, Ordering::AcqRel);
		let out = f();
		self.replaying.store(was, Ordering::Release);
		out
	}

	/// Returns `true` while a set is being undone or redone.
	pub fn is_replaying(&self) -> bool {
		self.replaying.load(Ordering::Acquire)
	}

	/// Returns `true` if a set can be undone.
	pub fn can_undo(&self) -> bool {
		!self.stacks.lock().undo.is_empty()
	}

	/// Returns `true` if a set can be redone.
	pub fn can_redo(&self) -> bool {
		!self.stacks.lock().redo.is_empty()
	}

	/// Number of undo sets.
	pub fn undo_len(&self) -> usize {
		self.stacks.lock().undo.len()
	}

	/// Number of redo sets.
	pub fn redo_len(&self) -> usize {
		self.stacks.lock().redo.len()
	}

	/// Label of the next set to undo.
	pub fn undo_label(&self) -> Option<String> {
		self.stacks.lock().undo.last().map(|s| s.label.clone())
	}

	/// Label of the next set to redo.
	pub fn redo_label(&self) -> Option<String> {
		self.stacks.lock().redo.last().map(|s| s.label.clone())
	}

	/// Drops every set.
	pub fn clear(&self) {
		let released = std::mem::take(&mut *self.stacks.lock());
		drop(released);
		self.events.emit(&UndoStackEvent::Cleared);
	}
}
