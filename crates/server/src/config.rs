//! Server configuration.

use std::path::Path;
use std::time::Duration;

use meridian_proto::ServerRole;
use serde::Deserialize;

use crate::error::ConfigError;

/// Server process configuration, read from TOML.
///
/// ```toml
/// host = "0.0.0.0"
/// port = 11111
/// role = "combined"
/// process_count = 1
/// reverse_connect_to = "client.example:11111"
/// client_timeout_ms = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
	/// Listen address.
	pub host: String,
	/// Listen port.
	pub port: u16,
	/// Role of this process.
	pub role: ServerRole,
	/// Processes reported to clients.
	pub process_count: u32,
	/// Connect to a listening client instead of listening.
	pub reverse_connect_to: Option<String>,
	/// Time a new connection has to complete the handshake.
	pub client_timeout_ms: u64,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			host: "0.0.0.0".to_string(),
			port: meridian_proto::server_url::DEFAULT_DATA_PORT,
			role: ServerRole::Combined,
			process_count: 1,
			reverse_connect_to: None,
			client_timeout_ms: 10_000,
		}
	}
}

impl ServerConfig {
	/// Parses a TOML document.
	pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(s)?)
	}

	/// Reads and parses a TOML file.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&text)
	}

	/// `host:port` to bind.
	pub fn bind_addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Handshake deadline.
	pub fn client_timeout(&self) -> Duration {
		Duration::from_millis(self.client_timeout_ms)
	}
}
