//! Server error types.

use std::path::PathBuf;

use meridian_proto::CodecError;
use thiserror::Error;

/// Errors surfaced by the socket layer.
#[derive(Debug, Error)]
pub enum ServerError {
	/// Socket error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	/// Framing error.
	#[error(transparent)]
	Codec(#[from] CodecError),
	/// The peer sent an unexpected first frame or a foreign handshake.
	#[error("handshake failed: {0}")]
	Handshake(String),
	/// The peer did not complete the handshake in time.
	#[error("handshake timed out")]
	HandshakeTimeout,
	/// The core actor stopped.
	#[error("server core stopped")]
	CoreStopped,
}

/// Errors loading a [`ServerConfig`](crate::ServerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Reading the file failed.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// File that failed to read.
		path: PathBuf,
		/// Underlying error.
		error: std::io::Error,
	},
	/// Invalid TOML or schema mismatch.
	#[error("config parse error: {0}")]
	Parse(#[from] toml::de::Error),
}
