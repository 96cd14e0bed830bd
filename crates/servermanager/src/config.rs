//! Session configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Tunables of a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
	/// Limit for blocking requests (PULL, GATHER_INFORMATION, LAST_RESULT).
	pub request_timeout_ms: u64,
	/// Overall limit for forward connection attempts.
	pub connect_timeout_ms: u64,
	/// Interval at which connection loops re-check their callback.
	pub poll_interval_ms: u64,
	/// Size of each global id lease.
	pub id_chunk_size: u32,
	/// Object types never recorded in the undo history.
	pub undo_exclusions: Vec<String>,
	/// Maximum undo sets kept on an [`UndoStack`](crate::UndoStack).
	pub undo_stack_depth: usize,
	/// User name announced to the server.
	pub user_name: Option<String>,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			request_timeout_ms: 30_000,
			connect_timeout_ms: 60_000,
			poll_interval_ms: 100,
			id_chunk_size: 256,
			undo_exclusions: vec!["Camera".to_string()],
			undo_stack_depth: 10,
			user_name: None,
		}
	}
}

impl SessionConfig {
	/// Parses a TOML document; missing keys keep their defaults.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(input)?)
	}

	/// Loads a TOML file.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&input)
	}

	/// Blocking request limit.
	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms)
	}

	/// Forward connection limit.
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_millis(self.connect_timeout_ms)
	}

	/// Connection loop poll interval.
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms.max(1))
	}

	/// Returns `true` if states of `xml_name` stay out of the undo history.
	pub fn is_undo_excluded(&self, xml_name: Option<&str>) -> bool {
		xml_name.is_some_and(|name| self.undo_exclusions.iter().any(|e| e == name))
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn defaults_exclude_camera() {
		let config = SessionConfig::default();
		assert!(config.is_undo_excluded(Some("Camera")));
		assert!(!config.is_undo_excluded(Some("SphereSource")));
		assert!(!config.is_undo_excluded(None));
		assert_eq!(config.request_timeout(), Duration::from_secs(30));
	}

	#[test]
	fn partial_toml_keeps_defaults() {
		let config = SessionConfig::from_toml_str(
			"request_timeout_ms = 500\nundo_exclusions = []\nuser_name = \"ada\"\n",
		)
		.unwrap();
		assert_eq!(config.request_timeout_ms, 500);
		assert!(config.undo_exclusions.is_empty());
		assert_eq!(config.user_name.as_deref(), Some("ada"));
		assert_eq!(config.id_chunk_size, 256);
	}

	#[test]
	fn unknown_keys_are_rejected() {
		assert!(SessionConfig::from_toml_str("bogus = 1").is_err());
	}

	#[test]
	fn load_reads_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "poll_interval_ms = 5").unwrap();
		let config = SessionConfig::load(file.path()).unwrap();
		assert_eq!(config.poll_interval(), Duration::from_millis(5));

		let err = SessionConfig::load(Path::new("/nonexistent/meridian.toml")).unwrap_err();
		assert!(matches!(err, ConfigError::Io { .. }));
	}
}
