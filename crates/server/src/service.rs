//! Actor owning the [`ServiceCore`].
//!
//! Connections never touch the core directly: they send [`CoreCmd`]s through
//! a [`CoreHandle`] and the single [`CoreService`] task applies them in
//! arrival order.

use meridian_proto::{
	ClientId, ErrorCode, GlobalId, InfoRequest, Information, Message, ServerRole, Stream, Variant,
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::core::{ClientSink, ServiceCore};

/// Commands accepted by the core actor.
#[derive(Debug)]
pub enum CoreCmd {
	/// Register a connection.
	Connect {
		/// User name sent in the handshake.
		user_name: Option<String>,
		/// Outbound queue of the connection.
		sink: ClientSink,
		/// Reply channel for the assigned id.
		reply: oneshot::Sender<(ClientId, ServerRole, u32)>,
	},
	/// Unregister a connection.
	Disconnect {
		/// Departing client.
		client: ClientId,
	},
	/// PUSH.
	Push {
		/// Sender.
		client: ClientId,
		/// Pushed state.
		msg: Message,
	},
	/// DELETE_SI.
	DeleteSi {
		/// Sender.
		client: ClientId,
		/// Deleted object.
		msg: Message,
	},
	/// EXECUTE_STREAM.
	ExecuteStream {
		/// Sender.
		client: ClientId,
		/// Keep going on failures.
		ignore_errors: bool,
		/// Commands.
		stream: Stream,
		/// Reply channel for the outcome.
		reply: oneshot::Sender<Result<(), ErrorCode>>,
	},
	/// PULL.
	Pull {
		/// Requested object.
		msg: Message,
		/// Reply channel for the state.
		reply: oneshot::Sender<Result<Message, ErrorCode>>,
	},
	/// GATHER_INFORMATION.
	Gather {
		/// Requester.
		client: ClientId,
		/// Request.
		req: InfoRequest,
		/// Reply channel for the information.
		reply: oneshot::Sender<Result<Information, ErrorCode>>,
	},
	/// LAST_RESULT.
	LastResult {
		/// Requester.
		client: ClientId,
		/// Reply channel for the result.
		reply: oneshot::Sender<Option<Variant>>,
	},
	/// RESERVE_IDS.
	ReserveIds {
		/// Block size.
		count: u32,
		/// Reply channel for the lease.
		reply: oneshot::Sender<Result<(GlobalId, u32), ErrorCode>>,
	},
	/// Peer link state change.
	PeerConnected {
		/// New state.
		connected: bool,
	},
}

/// Cloneable handle to the core actor.
#[derive(Clone, Debug)]
pub struct CoreHandle {
	tx: mpsc::Sender<CoreCmd>,
}

impl CoreHandle {
	/// Registers a connection and returns `(client id, role, process count)`.
	pub async fn connect(
		&self,
		user_name: Option<String>,
		sink: ClientSink,
	) -> Result<(ClientId, ServerRole, u32), ErrorCode> {
		let (reply, rx) = oneshot::channel();
		self.send(CoreCmd::Connect {
			user_name,
			sink,
			reply,
		})
		.await?;
		rx.await.map_err(|_| ErrorCode::Internal)
	}

	/// Unregisters a connection.
	pub async fn disconnect(&self, client: ClientId) {
		let _ = self.send(CoreCmd::Disconnect { client }).await;
	}

	/// Applies a PUSH.
	pub async fn push(&self, client: ClientId, msg: Message) -> Result<(), ErrorCode> {
		self.send(CoreCmd::Push { client, msg }).await
	}

	/// Applies a DELETE_SI.
	pub async fn delete_si(&self, client: ClientId, msg: Message) -> Result<(), ErrorCode> {
		self.send(CoreCmd::DeleteSi { client, msg }).await
	}

	/// Runs a stream.
	pub async fn execute_stream(
		&self,
		client: ClientId,
		ignore_errors: bool,
		stream: Stream,
	) -> Result<(), ErrorCode> {
		let (reply, rx) = oneshot::channel();
		self.send(CoreCmd::ExecuteStream {
			client,
			ignore_errors,
			stream,
			reply,
		})
		.await?;
		rx.await.map_err(|_| ErrorCode::Internal)?
	}

	/// Answers a PULL.
	pub async fn pull(&self, msg: Message) -> Result<Message, ErrorCode> {
		let (reply, rx) = oneshot::channel();
		self.send(CoreCmd::Pull { msg, reply }).await?;
		rx.await.map_err(|_| ErrorCode::Internal)?
	}

	/// Answers a GATHER_INFORMATION.
	pub async fn gather(&self, client: ClientId, req: InfoRequest) -> Result<Information, ErrorCode> {
		let (reply, rx) = oneshot::channel();
		self.send(CoreCmd::Gather { client, req, reply }).await?;
		rx.await.map_err(|_| ErrorCode::Internal)?
	}

	/// Answers a LAST_RESULT.
	pub async fn last_result(&self, client: ClientId) -> Result<Option<Variant>, ErrorCode> {
		let (reply, rx) = oneshot::channel();
		self.send(CoreCmd::LastResult { client, reply }).await?;
		rx.await.map_err(|_| ErrorCode::Internal)
	}

	/// Leases global ids.
	pub async fn reserve_ids(&self, count: u32) -> Result<(GlobalId, u32), ErrorCode> {
		let (reply, rx) = oneshot::channel();
		self.send(CoreCmd::ReserveIds { count, reply }).await?;
		rx.await.map_err(|_| ErrorCode::Internal)?
	}

	/// Records the peer link state.
	pub async fn set_peer_connected(&self, connected: bool) {
		let _ = self.send(CoreCmd::PeerConnected { connected }).await;
	}

	async fn send(&self, cmd: CoreCmd) -> Result<(), ErrorCode> {
		self.tx.send(cmd).await.map_err(|_| ErrorCode::Internal)
	}
}

/// Core actor task.
pub struct CoreService {
	core: ServiceCore,
	rx: mpsc::Receiver<CoreCmd>,
}

impl CoreService {
	/// Spawns the actor on the current runtime and returns its handle.
	pub fn start(core: ServiceCore) -> CoreHandle {
		let (tx, rx) = mpsc::channel(256);
		tokio::spawn(Self { core, rx }.run());
		CoreHandle { tx }
	}

	async fn run(mut self) {
		while let Some(cmd) = self.rx.recv().await {
			self.handle(cmd);
		}
		debug!("core service stopped");
	}

	fn handle(&mut self, cmd: CoreCmd) {
		match cmd {
			CoreCmd::Connect {
				user_name,
				sink,
				reply,
			} => {
				let id = self.core.connect_client(user_name, sink);
				let _ = reply.send((id, self.core.role(), self.core.process_count()));
			}
			CoreCmd::Disconnect { client } => self.core.disconnect_client(client),
			CoreCmd::Push { client, msg } => self.core.push(client, msg),
			CoreCmd::DeleteSi { client, msg } => self.core.delete_si(client, &msg),
			CoreCmd::ExecuteStream {
				client,
				ignore_errors,
				stream,
				reply,
			} => {
				let _ = reply.send(self.core.execute_stream(client, ignore_errors, &stream));
			}
			CoreCmd::Pull { msg, reply } => {
				let _ = reply.send(self.core.pull(&msg));
			}
			CoreCmd::Gather { client, req, reply } => {
				let _ = reply.send(self.core.gather(client, &req));
			}
			CoreCmd::LastResult { client, reply } => {
				let _ = reply.send(self.core.last_result(client));
			}
			CoreCmd::ReserveIds { count, reply } => {
				let _ = reply.send(self.core.reserve_ids(count));
			}
			CoreCmd::PeerConnected { connected } => self.core.set_peer_connected(connected),
		}
	}
}
