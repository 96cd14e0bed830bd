//! Proxy selection models shared between collaborating clients.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use meridian_proto::{Body, GlobalId, Location, Message, SelectionState};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::proxy_locator::ProxyLocator;
use crate::remote_object::{ObjectHandle, RemoteIdentity, RemoteObject};
use crate::session::Session;

/// Group carried by selection messages; the name identifies the model.
pub const SELECTION_GROUP: &str = "selection_models";

bitflags! {
	/// How a selection request combines with the current selection.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct SelectionCommand: u8 {
		/// Leave the selection untouched.
		const NO_UPDATE = 0;
		/// Empty the selection first.
		const CLEAR = 0x01;
		/// Add the given proxies.
		const SELECT = 0x02;
		/// Remove the given proxies.
		const DESELECT = 0x04;
		/// Replace the selection.
		const CLEAR_AND_SELECT = Self::CLEAR.bits() | Self::SELECT.bits();
	}
}

/// Selection model notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionEvent {
	/// The current proxy changed.
	CurrentChanged {
		/// Previous current proxy.
		previous: GlobalId,
		/// New current proxy.
		current: GlobalId,
	},
	/// The selected set changed.
	SelectionChanged,
}

/// Current proxy plus a selected set, mirrored to other clients.
///
/// Local changes are broadcast through the
/// [`CollaborationManager`](crate::CollaborationManager); states received
/// from other clients are applied without being sent back.
pub struct SelectionModel {
	this: Weak<SelectionModel>,
	name: String,
	identity: RemoteIdentity,
	state: Mutex<SelectionState>,
	events: Listeners<SelectionEvent>,
}

impl std::fmt::Debug for SelectionModel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SelectionModel")
			.field("name", &self.name)
			.field("state", &*self.state.lock())
			.finish()
	}
}

impl SelectionModel {
	pub(crate) fn new(session: Weak<Session>, name: &str) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			name: name.to_string(),
			identity: RemoteIdentity::new(session, Location::CLIENT),
			state: Mutex::default(),
			events: Listeners::default(),
		})
	}

	/// Registration name, shared by the same model on every client.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Subscribes to selection changes.
	pub fn subscribe(&self, callback: impl Fn(&SelectionEvent) + Send + Sync + 'static) -> Subscription {
		self.events.subscribe(callback)
	}

	/// Current proxy, [`GlobalId::NONE`] if unset.
	pub fn current_proxy(&self) -> GlobalId {
		self.state.lock().current
	}

	/// Selected proxies in selection order.
	pub fn selection(&self) -> Vec<GlobalId> {
		self.state.lock().selected.clone()
	}

	/// Returns `true` if `id` is selected.
	pub fn is_selected(&self, id: GlobalId) -> bool {
		self.state.lock().selected.contains(&id)
	}

	/// Current state.
	pub fn snapshot(&self) -> SelectionState {
		self.state.lock().clone()
	}

	/// Makes `id` current and applies `command` to it.
	pub fn set_current_proxy(&self, id: GlobalId, command: SelectionCommand) -> Result<()> {
		let mut next = self.snapshot();
		next.current = id;
		apply_command(&mut next.selected, &[id], command);
		self.update(next, true)
	}

	/// Applies `command` with `ids` to the selected set.
	pub fn select(&self, ids: &[GlobalId], command: SelectionCommand) -> Result<()> {
		let mut next = self.snapshot();
		apply_command(&mut next.selected, ids, command);
		self.update(next, true)
	}

	/// Empties the selection and unsets the current proxy.
	pub fn clear(&self) -> Result<()> {
		self.update(SelectionState::default(), true)
	}

	/// Applies a state received from another client.
	pub(crate) fn apply_remote(&self, state: &SelectionState) {
		if let Err(e) = self.update(state.clone(), false) {
			warn!(model = %self.name, error = %e, "failed to apply remote selection");
		}
	}

	fn update(&self, next: SelectionState, share: bool) -> Result<()> {
		let previous = {
			let mut state = self.state.lock();
			if *state == next {
				return Ok(());
			}
			std::mem::replace(&mut *state, next.clone())
		};
		trace!(model = %self.name, current = %next.current, selected = next.selected.len(), "selection changed");
		if previous.current != next.current {
			self.events.emit(&SelectionEvent::CurrentChanged {
				previous: previous.current,
				current: next.current,
			});
		}
		if previous.selected != next.selected {
			self.events.emit(&SelectionEvent::SelectionChanged);
		}
		if share {
			self.share()?;
		}
		Ok(())
	}

	fn state_message(&self) -> Result<Message> {
		Ok(Message::new(self.try_global_id()?, Location::CLIENT)
			.with_type(SELECTION_GROUP, &self.name)
			.with_body(Body::Selection(self.snapshot())))
	}

	fn share(&self) -> Result<()> {
		let session = self.identity.session().ok_or(Error::Disconnected)?;
		session
			.collaboration_manager()
			.send_to_other_clients(self.state_message()?)
	}
}

fn apply_command(selected: &mut Vec<GlobalId>, ids: &[GlobalId], command: SelectionCommand) {
	if command.contains(SelectionCommand::CLEAR) {
		selected.clear();
	}
	if command.contains(SelectionCommand::SELECT) {
		for id in ids {
			if !id.is_none() && !selected.contains(id) {
				selected.push(*id);
			}
		}
	}
	if command.contains(SelectionCommand::DESELECT) {
		selected.retain(|s| !ids.contains(s));
	}
}

impl RemoteObject for SelectionModel {
	fn identity(&self) -> &RemoteIdentity {
		&self.identity
	}

	fn handle(&self) -> ObjectHandle {
		ObjectHandle::Selection(self.this.clone())
	}

	fn full_state(&self) -> Option<Message> {
		self.state_message().ok()
	}

	fn load_state(&self, state: &Message, _locator: &dyn ProxyLocator) -> Result<()> {
		let Body::Selection(selection) = &state.body else {
			return Err(Error::InvalidState(format!(
				"state {} is not a selection state",
				state.global_id
			)));
		};
		self.update(selection.clone(), false)
	}
}
