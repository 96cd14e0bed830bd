//! Wire types for the meridian state replication protocol.
//!
//! Everything that crosses a process boundary lives here: object identity
//! ([`GlobalId`], [`Location`]), the replicated state envelope ([`Message`]),
//! command streams, information requests, the socket [`Frame`] set and the
//! length-prefixed postcard codec that carries it.

#![warn(missing_docs)]

pub mod codec;
pub mod ids;
pub mod info;
pub mod location;
pub mod message;
pub mod server_url;
pub mod stream;
pub mod variant;
pub mod wire;

pub use codec::{CodecError, MAX_FRAME_LEN, read_frame, write_frame};
pub use ids::{ClientId, GlobalId, RequestId, SessionId};
pub use info::{InfoKind, InfoRequest, Information, ServerInformation};
pub use location::Location;
pub use message::{
	Body, ClientInfo, CollaborationBody, GlobalPropertiesState, GlobalPropertyLink, LinkDirection,
	LinkEntry, LinkKind, LinkState, Message, MultiClientsInfo, Property, ProxyManagerState,
	ProxyState, Registration, SelectionState, SubProxyRef,
};
pub use server_url::{Endpoint, Scheme, ServerUrl, UrlError};
pub use stream::{Command, Stream};
pub use variant::{ProxyRef, Variant};
pub use wire::{
	ErrorCode, Frame, Hello, Oneway, Op, Opcode, Reply, ReplyPayload, Request, ServerRole, Welcome,
};

/// Protocol version exchanged in the connection handshake.
pub const PROTOCOL_VERSION: &str = "5.11";

/// Version written into the `ServerManagerState` root of saved state files.
pub const STATE_VERSION: &str = "5.11.0";

/// Returns the handshake string every connection URL carries.
pub fn handshake() -> String {
	format!("paraview.{PROTOCOL_VERSION}")
}
