//! Command streams executed by server-side interpreters.

use serde::{Deserialize, Serialize};

use crate::ids::GlobalId;
use crate::variant::Variant;

/// One method invocation on a server-side object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
	/// Target object.
	pub target: GlobalId,
	/// Method name.
	pub method: String,
	/// Arguments.
	pub args: Vec<Variant>,
}

/// Ordered list of commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stream {
	/// Commands, executed in order.
	pub commands: Vec<Command>,
}

impl Stream {
	/// Empty stream.
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a command.
	#[must_use]
	pub fn invoke(mut self, target: GlobalId, method: impl Into<String>, args: Vec<Variant>) -> Self {
		self.commands.push(Command {
			target,
			method: method.into(),
			args,
		});
		self
	}

	/// Returns `true` if the stream has no commands.
	pub fn is_empty(&self) -> bool {
		self.commands.is_empty()
	}
}
