//! Error types for the server manager.

use std::path::PathBuf;
use std::time::Duration;

use meridian_proto::{CodecError, ErrorCode, GlobalId, UrlError};
use thiserror::Error;

use crate::xml::XmlError;

/// Server manager errors.
#[derive(Debug, Error)]
pub enum Error {
	/// Could not reach the server.
	#[error("connection failed: {0}")]
	Connection(String),

	/// The server refused the handshake or answered with a foreign one.
	#[error("handshake failed: {0}")]
	Handshake(String),

	/// A blocking request did not complete in time.
	#[error("{op} timed out after {timeout:?}")]
	TimedOut {
		/// Opcode of the request.
		op: &'static str,
		/// Configured limit.
		timeout: Duration,
	},

	/// A blocking call was aborted through the session's cancellation token.
	#[error("operation cancelled")]
	Cancelled,

	/// The connection dropped or the session is gone.
	#[error("session disconnected")]
	Disconnected,

	/// No state is available for the object.
	#[error("no state for object {0}")]
	StateNotFound(GlobalId),

	/// The server answered with an error code.
	#[error("server error: {0}")]
	Remote(ErrorCode),

	/// GATHER_INFORMATION failed.
	#[error("server failed to gather information: {0}")]
	GatherInformation(ErrorCode),

	/// No proxy definition for the requested type.
	#[error("unknown proxy definition {group}/{name}")]
	UnknownDefinition {
		/// Definition group.
		group: String,
		/// Definition name.
		name: String,
	},

	/// The proxy has no property of that name.
	#[error("proxy {proxy} has no property {name}")]
	UnknownProperty {
		/// Proxy type name.
		proxy: String,
		/// Property name.
		name: String,
	},

	/// A loaded state reuses an id held by a live object.
	#[error("global id {0} is already in use")]
	GlobalIdInUse(GlobalId),

	/// A state message has the wrong shape.
	#[error("invalid state: {0}")]
	InvalidState(String),

	/// Malformed connection URL.
	#[error(transparent)]
	Url(#[from] UrlError),

	/// Wire encoding failure.
	#[error(transparent)]
	Codec(#[from] CodecError),

	/// XML state failure.
	#[error(transparent)]
	Xml(#[from] XmlError),

	/// Configuration failure.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// I/O failure.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Reading a file failed.
	#[error("failed to read {path}: {error}")]
	Io {
		/// Offending file.
		path: PathBuf,
		/// Underlying error.
		error: std::io::Error,
	},

	/// TOML parse failure.
	#[error("parse error: {0}")]
	Parse(#[from] toml::de::Error),

	/// A definition names an unknown location.
	#[error("unknown location {0:?}")]
	UnknownLocation(String),
}

/// Result alias for server manager operations.
pub type Result<T> = std::result::Result<T, Error>;
