//! One TCP connection to a server process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use meridian_proto::{
	ClientId, CodecError, ErrorCode, Frame, Hello, Message, Oneway, Op, Reply, ReplyPayload,
	Request, RequestId, ServerRole, read_frame, write_frame,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

type ReplySender = oneshot::Sender<std::result::Result<ReplyPayload, ErrorCode>>;
pub(super) type ReplyReceiver = oneshot::Receiver<std::result::Result<ReplyPayload, ErrorCode>>;
type Pending = Arc<Mutex<FxHashMap<RequestId, ReplySender>>>;

/// Connection to one server process after a successful handshake.
///
/// A reader task resolves pending requests and forwards relayed
/// notifications; a writer task drains the outbound queue.
pub(super) struct ProcessController {
	label: &'static str,
	pub(super) client_id: ClientId,
	pub(super) role: ServerRole,
	pub(super) process_count: u32,
	/// Host of the process as seen from this client.
	pub(super) host: String,
	out: mpsc::UnboundedSender<Frame>,
	pending: Pending,
	next_request: AtomicU64,
	alive: Arc<AtomicBool>,
	tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ProcessController {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProcessController")
			.field("label", &self.label)
			.field("client_id", &self.client_id)
			.field("role", &self.role)
			.field("host", &self.host)
			.field("alive", &self.is_alive())
			.finish()
	}
}

impl ProcessController {
	/// Performs the handshake on `stream` and starts the I/O tasks. Must
	/// run inside the session runtime.
	pub(super) async fn start(
		label: &'static str,
		stream: TcpStream,
		host: String,
		user_name: Option<String>,
		handshake_timeout: Duration,
		notify: Option<mpsc::UnboundedSender<Message>>,
	) -> Result<Self> {
		stream.set_nodelay(true)?;
		let (mut reader, mut writer) = stream.into_split();
		let hello = Frame::Hello(Hello {
			handshake: meridian_proto::handshake(),
			user_name,
			peer: false,
		});
		write_frame(&mut writer, &hello).await?;

		let welcome = match tokio::time::timeout(
			handshake_timeout,
			read_frame::<_, Frame>(&mut reader),
		)
		.await
		{
			Err(_) => {
				return Err(Error::TimedOut {
					op: "HANDSHAKE",
					timeout: handshake_timeout,
				});
			}
			Ok(Ok(Frame::Welcome(welcome))) => welcome,
			Ok(Ok(Frame::Rejected(code))) => return Err(Error::Handshake(code.to_string())),
			Ok(Ok(other)) => return Err(Error::Handshake(format!("unexpected frame {other:?}"))),
			Ok(Err(CodecError::Closed)) => {
				return Err(Error::Handshake("connection closed during handshake".into()));
			}
			Ok(Err(e)) => return Err(e.into()),
		};
		info!(
			label,
			%host,
			client_id = %welcome.client_id,
			role = ?welcome.role,
			process_count = welcome.process_count,
			"connected to server"
		);

		let (out, rx) = mpsc::unbounded_channel();
		let pending: Pending = Arc::default();
		let alive = Arc::new(AtomicBool::new(true));
		let tasks = vec![
			tokio::spawn(write_loop(writer, rx)),
			tokio::spawn(read_loop(label, reader, pending.clone(), notify, alive.clone())),
		];
		Ok(Self {
			label,
			client_id: welcome.client_id,
			role: welcome.role,
			process_count: welcome.process_count,
			host,
			out,
			pending,
			next_request: AtomicU64::new(1),
			alive,
			tasks,
		})
	}

	/// Queues a one-way call.
	pub(super) fn send(&self, call: Oneway) -> Result<()> {
		if !self.is_alive() {
			return Err(Error::Disconnected);
		}
		self.out
			.send(Frame::Oneway(call))
			.map_err(|_| Error::Disconnected)
	}

	/// Queues a request and returns its id and reply channel.
	pub(super) fn start_request(&self, op: Op) -> Result<(RequestId, ReplyReceiver)> {
		if !self.is_alive() {
			return Err(Error::Disconnected);
		}
		let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);
		if self.out.send(Frame::Request(Request { id, op })).is_err() {
			self.pending.lock().remove(&id);
			return Err(Error::Disconnected);
		}
		Ok((id, rx))
	}

	/// Drops a request that will no longer be awaited.
	pub(super) fn forget(&self, id: RequestId) {
		self.pending.lock().remove(&id);
	}

	pub(super) fn is_alive(&self) -> bool {
		self.alive.load(Ordering::Acquire)
	}

	pub(super) fn label(&self) -> &'static str {
		self.label
	}
}

impl Drop for ProcessController {
	fn drop(&mut self) {
		for task in &self.tasks {
			task.abort();
		}
	}
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
	while let Some(frame) = rx.recv().await {
		if let Err(e) = write_frame(&mut writer, &frame).await {
			debug!(error = %e, "writer stopped");
			break;
		}
	}
}

async fn read_loop(
	label: &'static str,
	mut reader: OwnedReadHalf,
	pending: Pending,
	notify: Option<mpsc::UnboundedSender<Message>>,
	alive: Arc<AtomicBool>,
) {
	loop {
		match read_frame::<_, Frame>(&mut reader).await {
			Ok(Frame::Reply(Reply { id, result })) => match pending.lock().remove(&id) {
				Some(tx) => {
					let _ = tx.send(result);
				}
				None => debug!(label, request = id.0, "reply for abandoned request"),
			},
			Ok(Frame::Notify(msg)) => {
				if let Some(notify) = &notify {
					let _ = notify.send(msg);
				}
			}
			Ok(other) => warn!(label, frame = ?other, "ignoring unexpected frame"),
			Err(CodecError::Closed) => break,
			Err(e) => {
				warn!(label, error = %e, "failed to read frame");
				break;
			}
		}
	}
	alive.store(false, Ordering::Release);
	pending.lock().clear();
	info!(label, "server connection closed");
}
