//! Command stream interpretation.

use meridian_proto::{Command, GlobalId, Variant};
use thiserror::Error;

use crate::core::ObjectStore;

/// Failure of a single command.
#[derive(Debug, Error, PartialEq)]
pub enum InterpretError {
	/// No stored state for the target.
	#[error("no object with id {0}")]
	UnknownObject(GlobalId),
	/// The interpreter does not know the method.
	#[error("unknown method {0:?}")]
	UnknownMethod(String),
	/// Missing or mistyped argument.
	#[error("invalid arguments for {0:?}")]
	InvalidArgs(String),
	/// The target has no such property.
	#[error("object {id} has no property {name:?}")]
	UnknownProperty {
		/// Target object.
		id: GlobalId,
		/// Requested property.
		name: String,
	},
}

/// Executes stream commands against the object store.
///
/// Each server process owns one interpreter. Commands returning a value
/// update the invoking client's last result.
pub trait StreamInterpreter: Send {
	/// Runs one command.
	fn invoke(
		&mut self,
		objects: &ObjectStore,
		command: &Command,
	) -> Result<Option<Variant>, InterpretError>;
}

/// Interpreter for the built-in introspection methods:
///
/// - `Echo(value)` returns its first argument.
/// - `ClassName()` returns the target's definition name.
/// - `GetProperty(name)` returns the stored property value.
/// - `GetPropertyNames()` lists stored property names.
#[derive(Debug, Default)]
pub struct DefaultInterpreter;

impl StreamInterpreter for DefaultInterpreter {
	fn invoke(
		&mut self,
		objects: &ObjectStore,
		command: &Command,
	) -> Result<Option<Variant>, InterpretError> {
		match command.method.as_str() {
			"Echo" => Ok(command.args.first().cloned()),
			"ClassName" => {
				let state = objects
					.get(command.target)
					.ok_or(InterpretError::UnknownObject(command.target))?;
				Ok(state.xml_name.clone().map(Variant::string))
			}
			"GetProperty" => {
				let name = command
					.args
					.first()
					.and_then(Variant::as_str)
					.ok_or_else(|| InterpretError::InvalidArgs(command.method.clone()))?;
				let state = objects
					.get(command.target)
					.ok_or(InterpretError::UnknownObject(command.target))?;
				let value = state
					.property(name)
					.ok_or_else(|| InterpretError::UnknownProperty {
						id: command.target,
						name: name.to_string(),
					})?;
				Ok(Some(value.clone()))
			}
			"GetPropertyNames" => {
				let state = objects
					.get(command.target)
					.ok_or(InterpretError::UnknownObject(command.target))?;
				Ok(Some(Variant::Str(
					state.properties.iter().map(|p| p.name.clone()).collect(),
				)))
			}
			other => Err(InterpretError::UnknownMethod(other.to_string())),
		}
	}
}
