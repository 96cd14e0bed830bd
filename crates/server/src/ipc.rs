//! TCP server for session connections.
//!
//! Every connection starts with a [`Hello`] carrying the handshake string.
//! After the [`Welcome`] the reader loop forwards frames to the core actor
//! while a writer task drains the connection's sink, so replies and relayed
//! notifications share one ordered outbound queue.

use std::time::Duration;

use meridian_proto::{
	ClientId, ErrorCode, Frame, Hello, Oneway, Op, Reply, ReplyPayload, Request, Welcome,
	read_frame, write_frame,
};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::core::ServiceCore;
use crate::error::ServerError;
use crate::service::{CoreHandle, CoreService};

/// Shared state of every connection task.
#[derive(Clone, Debug)]
pub struct ServerContext {
	core: CoreHandle,
	client_timeout: Duration,
	peer_host: String,
	shutdown: CancellationToken,
}

impl ServerContext {
	/// Bundles a running core with connection settings.
	pub fn new(core: CoreHandle, config: &ServerConfig, shutdown: CancellationToken) -> Self {
		Self {
			core,
			client_timeout: config.client_timeout(),
			peer_host: config.host.clone(),
			shutdown,
		}
	}

	/// Handle of the core actor.
	pub fn core(&self) -> &CoreHandle {
		&self.core
	}
}

/// Starts the core and serves until `shutdown` fires.
///
/// Listens on the configured address, or connects out to a listening client
/// when `reverse_connect_to` is set.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or the reverse connection
/// fails.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
	let core = CoreService::start(ServiceCore::new(config.role, config.process_count));
	let ctx = ServerContext::new(core, &config, shutdown);
	match &config.reverse_connect_to {
		Some(addr) => connect_out(addr, ctx).await,
		None => {
			let listener = TcpListener::bind(config.bind_addr()).await?;
			serve(listener, ctx).await?;
			Ok(())
		}
	}
}

/// Accepts session connections until shutdown.
///
/// # Errors
///
/// Returns an error if the local address of the listener is unavailable.
pub async fn serve(listener: TcpListener, ctx: ServerContext) -> std::io::Result<()> {
	tracing::info!(addr = %listener.local_addr()?, "server listening");
	loop {
		tokio::select! {
			_ = ctx.shutdown.cancelled() => {
				tracing::info!("server shutting down");
				break;
			}
			res = listener.accept() => match res {
				Ok((stream, addr)) => {
					tracing::debug!(%addr, "accepted connection");
					let ctx = ctx.clone();
					tokio::spawn(async move {
						if let Err(e) = handle_connection(stream, ctx).await {
							tracing::warn!(error = %e, "connection ended with error");
						}
					});
				}
				Err(e) => tracing::error!(error = %e, "failed to accept connection"),
			}
		}
	}
	Ok(())
}

/// Reverse connection: connects to a listening client and serves it.
///
/// # Errors
///
/// Returns an error if the client cannot be reached or the session fails.
pub async fn connect_out(addr: &str, ctx: ServerContext) -> Result<(), ServerError> {
	tracing::info!(%addr, "connecting to listening client");
	let stream = TcpStream::connect(addr).await?;
	handle_connection(stream, ctx).await
}

/// Serves one session connection to completion.
pub(crate) async fn handle_connection(
	stream: TcpStream,
	ctx: ServerContext,
) -> Result<(), ServerError> {
	stream.set_nodelay(true)?;
	let (mut reader, mut writer) = stream.into_split();

	let hello = match tokio::time::timeout(ctx.client_timeout, read_frame::<_, Frame>(&mut reader))
		.await
	{
		Err(_) => return Err(ServerError::HandshakeTimeout),
		Ok(Ok(Frame::Hello(hello))) => hello,
		Ok(Ok(other)) => {
			return Err(ServerError::Handshake(format!(
				"expected hello, got {other:?}"
			)));
		}
		Ok(Err(e)) => return Err(e.into()),
	};
	if hello.handshake != meridian_proto::handshake() {
		tracing::warn!(handshake = %hello.handshake, "rejecting connection with foreign handshake");
		write_frame(&mut writer, &Frame::Rejected(ErrorCode::HandshakeMismatch)).await?;
		return Err(ServerError::Handshake(hello.handshake));
	}

	let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
	let (client, role, process_count) = ctx
		.core
		.connect(hello.user_name, tx.clone())
		.await
		.map_err(|_| ServerError::CoreStopped)?;
	write_frame(
		&mut writer,
		&Frame::Welcome(Welcome {
			client_id: client,
			role,
			process_count,
		}),
	)
	.await?;

	let writer_task = tokio::spawn(async move {
		while let Some(frame) = rx.recv().await {
			if let Err(e) = write_frame(&mut writer, &frame).await {
				tracing::debug!(error = %e, "writer stopped");
				break;
			}
		}
	});

	let result = read_loop(&mut reader, client, &tx, &ctx).await;

	ctx.core.disconnect(client).await;
	drop(tx);
	writer_task.abort();
	tracing::info!(client_id = %client, "connection closed");
	result
}

async fn read_loop(
	reader: &mut OwnedReadHalf,
	client: ClientId,
	tx: &mpsc::UnboundedSender<Frame>,
	ctx: &ServerContext,
) -> Result<(), ServerError> {
	loop {
		let frame = tokio::select! {
			_ = ctx.shutdown.cancelled() => return Ok(()),
			frame = read_frame::<_, Frame>(reader) => frame,
		};
		let frame = match frame {
			Ok(frame) => frame,
			Err(meridian_proto::CodecError::Closed) => return Ok(()),
			Err(e) => {
				tracing::error!(client_id = %client, error = %e, "failed to read frame");
				return Err(e.into());
			}
		};
		match frame {
			Frame::Oneway(call) => {
				tracing::trace!(client_id = %client, opcode = %call.opcode(), "oneway");
				let res = match call {
					Oneway::Push(msg) => ctx.core.push(client, msg).await,
					Oneway::DeleteSi(msg) => ctx.core.delete_si(client, msg).await,
					Oneway::ExecuteStream {
						ignore_errors,
						stream,
					} => ctx.core.execute_stream(client, ignore_errors, stream).await,
				};
				if let Err(code) = res {
					tracing::debug!(client_id = %client, %code, "oneway call failed");
				}
			}
			Frame::Request(Request { id, op }) => {
				tracing::trace!(client_id = %client, opcode = %op.opcode(), "request");
				let result = dispatch(op, client, ctx).await;
				if tx.send(Frame::Reply(Reply { id, result })).is_err() {
					return Err(ServerError::CoreStopped);
				}
			}
			other => {
				tracing::warn!(client_id = %client, frame = ?other, "ignoring unexpected frame");
			}
		}
	}
}

async fn dispatch(op: Op, client: ClientId, ctx: &ServerContext) -> Result<ReplyPayload, ErrorCode> {
	match op {
		Op::Pull(msg) => ctx.core.pull(msg).await.map(ReplyPayload::Pull),
		Op::GatherInformation(req) => ctx
			.core
			.gather(client, req)
			.await
			.map(ReplyPayload::Information),
		Op::LastResult => ctx.core.last_result(client).await.map(ReplyPayload::LastResult),
		Op::ReserveIds { count } => ctx
			.core
			.reserve_ids(count)
			.await
			.map(|(first, count)| ReplyPayload::IdRange { first, count }),
		Op::PeerListen => open_peer_listener(ctx).await.map(ReplyPayload::PeerPort),
		Op::PeerConnect { host, port } => {
			connect_peer(ctx, &host, port).await.map(|()| ReplyPayload::Ack)
		}
	}
}

/// Render-server side of the peer link: binds an ephemeral port and accepts
/// one data-server connection on it.
async fn open_peer_listener(ctx: &ServerContext) -> Result<u16, ErrorCode> {
	let listener = TcpListener::bind((ctx.peer_host.as_str(), 0))
		.await
		.map_err(|e| {
			tracing::error!(error = %e, "failed to open peer listener");
			ErrorCode::Internal
		})?;
	let port = listener
		.local_addr()
		.map_err(|_| ErrorCode::Internal)?
		.port();
	let ctx = ctx.clone();
	tokio::spawn(async move {
		let accepted = tokio::select! {
			_ = ctx.shutdown.cancelled() => return,
			res = listener.accept() => res,
		};
		match accepted {
			Ok((stream, addr)) => {
				tracing::info!(%addr, "peer connected");
				if let Err(e) = serve_peer(stream, &ctx).await {
					tracing::warn!(error = %e, "peer link failed");
				}
			}
			Err(e) => tracing::error!(error = %e, "failed to accept peer"),
		}
	});
	Ok(port)
}

async fn serve_peer(stream: TcpStream, ctx: &ServerContext) -> Result<(), ServerError> {
	let (mut reader, mut writer) = stream.into_split();
	match read_frame::<_, Frame>(&mut reader).await? {
		Frame::Hello(Hello {
			handshake, peer: true, ..
		}) if handshake == meridian_proto::handshake() => {}
		other => return Err(ServerError::Handshake(format!("bad peer hello: {other:?}"))),
	}
	write_frame(
		&mut writer,
		&Frame::Welcome(Welcome {
			client_id: ClientId::NONE,
			role: meridian_proto::ServerRole::RenderServer,
			process_count: 1,
		}),
	)
	.await?;
	ctx.core.set_peer_connected(true).await;
	hold_peer(&mut reader, ctx).await;
	Ok(())
}

/// Data-server side of the peer link.
async fn connect_peer(ctx: &ServerContext, host: &str, port: u16) -> Result<(), ErrorCode> {
	let stream = TcpStream::connect((host, port)).await.map_err(|e| {
		tracing::error!(%host, port, error = %e, "failed to connect to peer");
		ErrorCode::Internal
	})?;
	let (mut reader, mut writer) = stream.into_split();
	let hello = Frame::Hello(Hello {
		handshake: meridian_proto::handshake(),
		user_name: None,
		peer: true,
	});
	write_frame(&mut writer, &hello)
		.await
		.map_err(|_| ErrorCode::Internal)?;
	match read_frame::<_, Frame>(&mut reader).await {
		Ok(Frame::Welcome(_)) => {}
		_ => return Err(ErrorCode::HandshakeMismatch),
	}
	ctx.core.set_peer_connected(true).await;
	let ctx = ctx.clone();
	tokio::spawn(async move {
		let _writer = writer;
		hold_peer(&mut reader, &ctx).await;
	});
	Ok(())
}

/// Waits for the other side to close the link, then marks it down.
async fn hold_peer(reader: &mut OwnedReadHalf, ctx: &ServerContext) {
	loop {
		tokio::select! {
			_ = ctx.shutdown.cancelled() => break,
			res = read_frame::<_, Frame>(reader) => {
				if res.is_err() {
					break;
				}
			}
		}
	}
	ctx.core.set_peer_connected(false).await;
	tracing::info!("peer link closed");
}
