//! Socket frames exchanged between a session and a server process.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, GlobalId, RequestId};
use crate::info::{InfoRequest, Information};
use crate::message::Message;
use crate::stream::Stream;
use crate::variant::Variant;

/// A single frame on a session socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
	/// First frame from the connecting client.
	Hello(Hello),
	/// Handshake accepted.
	Welcome(Welcome),
	/// Handshake refused; the server closes the socket.
	Rejected(ErrorCode),
	/// Fire-and-forget invocation.
	Oneway(Oneway),
	/// Invocation that expects a [`Frame::Reply`].
	Request(Request),
	/// Reply to a [`Frame::Request`].
	Reply(Reply),
	/// State relayed from another client.
	Notify(Message),
}

/// Connection handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
	/// `paraview.<version>`; must match the server's.
	pub handshake: String,
	/// User name to publish, if any.
	pub user_name: Option<String>,
	/// Set on the data-server to render-server peer link.
	pub peer: bool,
}

/// Handshake acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
	/// Id assigned to the client.
	pub client_id: ClientId,
	/// Role of the accepting server.
	pub role: ServerRole,
	/// Processes behind the connection.
	pub process_count: u32,
}

/// Role a server process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerRole {
	/// Data server of a split configuration.
	DataServer,
	/// Render server of a split configuration.
	RenderServer,
	/// Unified data and render server.
	Combined,
}

impl ServerRole {
	/// Returns `true` if the role owns the authoritative object store and
	/// relays collaboration traffic.
	pub fn is_data_server(self) -> bool {
		matches!(self, Self::DataServer | Self::Combined)
	}
}

/// One-way invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Oneway {
	/// PUSH a state.
	Push(Message),
	/// DELETE_SI: drop the server-side counterpart.
	DeleteSi(Message),
	/// EXECUTE_STREAM.
	ExecuteStream {
		/// Keep executing after a failing command.
		ignore_errors: bool,
		/// Commands.
		stream: Stream,
	},
}

/// Request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	/// Correlation id.
	pub id: RequestId,
	/// Operation.
	pub op: Op,
}

/// Operations that expect a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
	/// PULL a stored state.
	Pull(Message),
	/// GATHER_INFORMATION.
	GatherInformation(InfoRequest),
	/// LAST_RESULT of the caller's previous stream.
	LastResult,
	/// Lease a contiguous block of global ids.
	ReserveIds {
		/// Block size.
		count: u32,
	},
	/// Render server: open the peer listener for the data server.
	PeerListen,
	/// Data server: connect to the render server's peer listener.
	PeerConnect {
		/// Render server host.
		host: String,
		/// Port returned by [`Op::PeerListen`].
		port: u16,
	},
}

/// Reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
	/// Request this answers.
	pub id: RequestId,
	/// Outcome.
	pub result: Result<ReplyPayload, ErrorCode>,
}

/// Successful reply payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyPayload {
	/// REPLY_PULL.
	Pull(Message),
	/// REPLY_GATHER_INFORMATION.
	Information(Information),
	/// REPLY_LAST_RESULT.
	LastResult(Option<Variant>),
	/// Leased ids `first..first + count`.
	IdRange {
		/// First leased id.
		first: GlobalId,
		/// Number of leased ids.
		count: u32,
	},
	/// Port of the opened peer listener.
	PeerPort(u16),
	/// Generic acknowledgement.
	Ack,
}

/// Error codes carried in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
	/// Generic internal error.
	Internal,
	/// No stored state for the requested object.
	UnknownObject,
	/// Handshake strings differ.
	HandshakeMismatch,
	/// Malformed arguments.
	InvalidArgs,
	/// A stream command failed.
	StreamFailed,
	/// Target client is not connected.
	UnknownClient,
	/// Operation not available for this server role.
	Unsupported,
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Internal => "internal error",
			Self::UnknownObject => "unknown object",
			Self::HandshakeMismatch => "handshake mismatch",
			Self::InvalidArgs => "invalid arguments",
			Self::StreamFailed => "stream execution failed",
			Self::UnknownClient => "unknown client",
			Self::Unsupported => "unsupported operation",
		};
		f.write_str(s)
	}
}

/// Opcode of a frame, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
	/// PUSH.
	Push,
	/// PULL.
	Pull,
	/// EXECUTE_STREAM.
	ExecuteStream,
	/// DELETE_SI.
	DeleteSi,
	/// GATHER_INFORMATION.
	GatherInformation,
	/// LAST_RESULT.
	LastResult,
	/// RESERVE_IDS.
	ReserveIds,
	/// PEER_LISTEN / PEER_CONNECT.
	Peer,
}

impl Opcode {
	/// Upper-case wire name.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Push => "PUSH",
			Self::Pull => "PULL",
			Self::ExecuteStream => "EXECUTE_STREAM",
			Self::DeleteSi => "DELETE_SI",
			Self::GatherInformation => "GATHER_INFORMATION",
			Self::LastResult => "LAST_RESULT",
			Self::ReserveIds => "RESERVE_IDS",
			Self::Peer => "PEER",
		}
	}
}

impl fmt::Display for Opcode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl Oneway {
	/// Opcode of this invocation.
	pub fn opcode(&self) -> Opcode {
		match self {
			Self::Push(_) => Opcode::Push,
			Self::DeleteSi(_) => Opcode::DeleteSi,
			Self::ExecuteStream { .. } => Opcode::ExecuteStream,
		}
	}
}

impl Op {
	/// Opcode of this operation.
	pub fn opcode(&self) -> Opcode {
		match self {
			Self::Pull(_) => Opcode::Pull,
			Self::GatherInformation(_) => Opcode::GatherInformation,
			Self::LastResult => Opcode::LastResult,
			Self::ReserveIds { .. } => Opcode::ReserveIds,
			Self::PeerListen | Self::PeerConnect { .. } => Opcode::Peer,
		}
	}
}
