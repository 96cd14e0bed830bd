use std::sync::{Arc, Weak};

use meridian_proto::{GlobalId, Message};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{UndoElement, UndoSet, UndoStack};
use crate::session::Session;

#[derive(Debug, Default)]
struct Recording {
	depth: usize,
	pending: Option<UndoSet>,
	ignore_all: bool,
}

/// Groups the state transitions reported by sessions into undo sets.
///
/// [`begin`](Self::begin) and [`end`](Self::end) nest: only the outermost
/// `end` closes the set, and [`push_to_stack`](Self::push_to_stack) before
/// that is a no-op.
#[derive(Debug)]
pub struct UndoStackBuilder {
	stack: Arc<UndoStack>,
	recording: Mutex<Recording>,
}

impl UndoStackBuilder {
	/// Builder committing to `stack`.
	pub fn new(stack: Arc<UndoStack>) -> Arc<Self> {
		Arc::new(Self {
			stack,
			recording: Mutex::default(),
		})
	}

	/// Target stack.
	pub fn stack(&self) -> &Arc<UndoStack> {
		&self.stack
	}

	/// Opens a recording block. Nested blocks join the outer set and keep
	/// its label.
	pub fn begin(&self, label: &str) {
		let mut recording = self.recording.lock();
		recording.depth += 1;
		if recording.pending.is_none() {
			recording.pending = Some(UndoSet::new(label));
		}
		trace!(label, depth = recording.depth, "undo recording begins");
	}

	/// Closes a recording block.
	pub fn end(&self) {
		let mut recording = self.recording.lock();
		recording.depth = recording.depth.saturating_sub(1);
		trace!(depth = recording.depth, "undo recording ends");
	}

	/// Returns `true` inside a begin/end block.
	pub fn is_recording(&self) -> bool {
		self.recording.lock().depth > 0
	}

	/// Commits the pending set once every block is closed. Empty sets are
	/// discarded. Returns `true` if a set was pushed.
	pub fn push_to_stack(&self) -> bool {
		let set = {
			let mut recording = self.recording.lock();
			if recording.depth > 0 {
				return false;
			}
			recording.pending.take()
		};
		match set {
			Some(set) if !set.is_empty() => {
				debug!(label = %set.label(), elements = set.len(), "undo set committed");
				self.stack.push(set);
				true
			}
			_ => false,
		}
	}

	/// [`end`](Self::end) followed by [`push_to_stack`](Self::push_to_stack).
	pub fn end_and_push_to_stack(&self) -> bool {
		self.end();
		self.push_to_stack()
	}

	/// Discards the pending set and closes every block.
	pub fn clear(&self) {
		let mut recording = self.recording.lock();
		recording.depth = 0;
		recording.pending = None;
	}

	/// Skips every change, even inside a begin/end block.
	pub fn set_ignore_all_changes(&self, ignore: bool) {
		self.recording.lock().ignore_all = ignore;
	}

	/// Returns `true` while changes are ignored.
	pub fn ignore_all_changes(&self) -> bool {
		self.recording.lock().ignore_all
	}

	/// Records a transition of an existing object.
	pub fn on_state_change(&self, session: &Weak<Session>, id: GlobalId, before: &Message, after: &Message) {
		self.record(|| UndoElement::state_change(session.clone(), id, before.clone(), after.clone()));
	}

	/// Records the creation of an object.
	pub fn on_create_object(&self, session: &Weak<Session>, state: &Message) {
		self.record(|| UndoElement::creation(session.clone(), state.clone()));
	}

	fn record(&self, element: impl FnOnce() -> UndoElement) {
		if self.stack.is_replaying() {
			return;
		}
		let mut recording = self.recording.lock();
		if recording.depth == 0 || recording.ignore_all {
			return;
		}
		if let Some(set) = recording.pending.as_mut() {
			let element = element();
			trace!(global_id = %element.global_id(), creation = element.is_creation(), "undo element recorded");
			set.push(element);
		}
	}
}
