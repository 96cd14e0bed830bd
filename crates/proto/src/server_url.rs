//! Connection URL schemes.
//!
//! | scheme | meaning |
//! |---|---|
//! | `builtin:` | in-process server |
//! | `cs://host[:port]` | unified server, default port 11111 |
//! | `csrc://[host][:port]` | reverse-connect unified server |
//! | `cdsrs://dshost[:dsport]/rshost[:rsport]` | split servers, render default port 22221 |
//! | `cdsrsrc://[dshost][:dsport]/[rshost][:rsport]` | reverse-connect split servers |
//!
//! Every resolved transport URL carries `handshake=paraview.<version>`.

use std::fmt;

use thiserror::Error;
use url::Url;

/// Default data (or unified) server port.
pub const DEFAULT_DATA_PORT: u16 = 11111;
/// Default render server port.
pub const DEFAULT_RENDER_PORT: u16 = 22221;

/// URL parsing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
	/// Scheme is none of the known ones.
	#[error("unknown connection scheme: {0}")]
	UnknownScheme(String),
	/// Port is not a valid `u16`.
	#[error("invalid port in {0}")]
	InvalidPort(String),
	/// A forward-connect URL without host.
	#[error("missing host in {0}")]
	MissingHost(String),
	/// The split URL lacks its render-server part.
	#[error("missing render server in {0}")]
	MissingRenderServer(String),
	/// The resolved transport URL failed to build.
	#[error("invalid transport url: {0}")]
	Transport(#[from] url::ParseError),
}

/// Connection scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
	/// In-process server.
	Builtin,
	/// Unified server.
	Cs,
	/// Reverse-connect unified server.
	CsRc,
	/// Split data and render servers.
	CdsRs,
	/// Reverse-connect split servers.
	CdsRsRc,
}

impl Scheme {
	fn parse(s: &str) -> Option<Self> {
		Some(match s {
			"builtin" => Self::Builtin,
			"cs" => Self::Cs,
			"csrc" => Self::CsRc,
			"cdsrs" => Self::CdsRs,
			"cdsrsrc" => Self::CdsRsRc,
			_ => return None,
		})
	}

	/// Returns `true` for the reverse-connect variants.
	pub fn is_reverse(self) -> bool {
		matches!(self, Self::CsRc | Self::CdsRsRc)
	}

	/// Returns `true` for split configurations.
	pub fn is_split(self) -> bool {
		matches!(self, Self::CdsRs | Self::CdsRsRc)
	}
}

/// Host and port of one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
	/// Host name or address.
	pub host: String,
	/// TCP port.
	pub port: u16,
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// Parsed connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
	/// Scheme.
	pub scheme: Scheme,
	/// Data (or unified) server, absent for `builtin:`.
	pub data: Option<Endpoint>,
	/// Render server of split configurations.
	pub render: Option<Endpoint>,
}

impl ServerUrl {
	/// Parses a connection URL.
	pub fn parse(input: &str) -> Result<Self, UrlError> {
		let (scheme, rest) = match input.split_once("://") {
			Some((scheme, rest)) => (scheme, rest),
			None => (input.trim_end_matches(':'), ""),
		};
		let scheme =
			Scheme::parse(scheme).ok_or_else(|| UrlError::UnknownScheme(scheme.to_string()))?;
		let reverse = scheme.is_reverse();

		let (data, render) = match scheme {
			Scheme::Builtin => (None, None),
			Scheme::Cs | Scheme::CsRc => {
				let authority = rest.trim_end_matches('/');
				(
					Some(parse_endpoint(input, authority, DEFAULT_DATA_PORT, reverse)?),
					None,
				)
			}
			Scheme::CdsRs | Scheme::CdsRsRc => {
				let (ds, rs) = rest
					.split_once('/')
					.ok_or_else(|| UrlError::MissingRenderServer(input.to_string()))?;
				(
					Some(parse_endpoint(input, ds, DEFAULT_DATA_PORT, reverse)?),
					Some(parse_endpoint(
						input,
						rs.trim_end_matches('/'),
						DEFAULT_RENDER_PORT,
						reverse,
					)?),
				)
			}
		};
		Ok(Self {
			scheme,
			data,
			render,
		})
	}

	/// Transport URL of the data (or unified) server.
	pub fn data_transport_url(&self) -> Result<Option<String>, UrlError> {
		self.data
			.as_ref()
			.map(|ep| transport_url(ep, self.scheme.is_reverse()))
			.transpose()
	}

	/// Transport URL of the render server.
	pub fn render_transport_url(&self) -> Result<Option<String>, UrlError> {
		self.render
			.as_ref()
			.map(|ep| transport_url(ep, self.scheme.is_reverse()))
			.transpose()
	}
}

fn parse_endpoint(
	input: &str,
	authority: &str,
	default_port: u16,
	reverse: bool,
) -> Result<Endpoint, UrlError> {
	let (host, port) = match authority.rsplit_once(':') {
		Some((host, port)) => (
			host,
			port.parse::<u16>()
				.map_err(|_| UrlError::InvalidPort(input.to_string()))?,
		),
		None => (authority, default_port),
	};
	if host.is_empty() && !reverse {
		return Err(UrlError::MissingHost(input.to_string()));
	}
	let host = if host.is_empty() { "localhost" } else { host };
	Ok(Endpoint {
		host: host.to_string(),
		port,
	})
}

fn transport_url(ep: &Endpoint, reverse: bool) -> Result<String, UrlError> {
	let mut url = Url::parse(&format!("tcp://{ep}"))?;
	{
		let mut query = url.query_pairs_mut();
		if reverse {
			query.append_pair("listen", "true");
			query.append_pair("nonblocking", "true");
		}
		query.append_pair("handshake", &crate::handshake());
	}
	Ok(url.into())
}
