use std::net::SocketAddr;
use std::time::{Duration, Instant};

use meridian_proto::{
	ClientId, Endpoint, GlobalId, InfoRequest, Information, Location, Message, Oneway, Op,
	ReplyPayload, ServerUrl, Stream, Variant,
};
use meridian_server::ServiceCore;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Transport;
use super::controller::{ProcessController, ReplyReceiver};
use crate::config::SessionConfig;
use crate::error::{Error, Result};

/// Connection to a remote unified server or a data/render server pair.
///
/// The client owns a private runtime driving the socket tasks, so every
/// [`Transport`] call blocks the calling thread without requiring an
/// ambient executor. Objects with a `CLIENT` location are applied to a
/// local engine before anything is sent.
#[derive(Debug)]
pub struct SessionClient {
	data: ProcessController,
	render: Option<ProcessController>,
	local: Mutex<ServiceCore>,
	notifications: Mutex<mpsc::UnboundedReceiver<Message>>,
	request_timeout: Duration,
	cancel: CancellationToken,
	// Last field: dropping the runtime stops the controller tasks.
	runtime: Runtime,
}

impl SessionClient {
	/// Connects to the servers named by `url`.
	///
	/// Forward connections retry until `connect_timeout_ms` elapses;
	/// reverse connections listen until a server connects. Both loops
	/// poll `should_continue` every `poll_interval_ms` and fail with
	/// [`Error::Cancelled`] once it returns `false`. Split configurations
	/// also establish the data-server/render-server peer link.
	pub fn connect(
		url: &ServerUrl,
		config: &SessionConfig,
		should_continue: &mut dyn FnMut() -> bool,
	) -> Result<Self> {
		let data_endpoint = url
			.data
			.as_ref()
			.ok_or_else(|| Error::Connection("builtin URL has no server".into()))?;
		if let Some(transport) = url.data_transport_url()? {
			info!(%transport, "connecting session");
		}

		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(1)
			.thread_name("meridian-session")
			.enable_all()
			.build()?;
		let cancel = CancellationToken::new();
		let (notify_tx, notify_rx) = mpsc::unbounded_channel();

		let (data, render) = runtime.block_on(async {
			let streams = if url.scheme.is_reverse() {
				accept_all(data_endpoint, url.render.as_ref(), config, &cancel, should_continue)
					.await?
			} else {
				let data = dial(data_endpoint, config, &cancel, should_continue).await?;
				let render = match &url.render {
					Some(ep) => Some(dial(ep, config, &cancel, should_continue).await?),
					None => None,
				};
				(data, render)
			};
			let ((data_stream, data_host), render_stream) = streams;
			let data = ProcessController::start(
				"data server",
				data_stream,
				data_host,
				config.user_name.clone(),
				config.request_timeout(),
				Some(notify_tx),
			)
			.await?;
			let render = match render_stream {
				Some((stream, host)) => Some(
					ProcessController::start(
						"render server",
						stream,
						host,
						config.user_name.clone(),
						config.request_timeout(),
						None,
					)
					.await?,
				),
				None => None,
			};
			Ok::<_, Error>((data, render))
		})?;

		let client = Self {
			data,
			render,
			local: Mutex::new(ServiceCore::new(meridian_proto::ServerRole::Combined, 1)),
			notifications: Mutex::new(notify_rx),
			request_timeout: config.request_timeout(),
			cancel,
			runtime,
		};
		client.initialize()?;
		Ok(client)
	}

	/// Links the data server to the render server of a split
	/// configuration.
	fn initialize(&self) -> Result<()> {
		let Some(render) = &self.render else {
			return Ok(());
		};
		let port = match self.request(render, Op::PeerListen)? {
			ReplyPayload::PeerPort(port) => port,
			other => return Err(unexpected_reply(other)),
		};
		self.request(
			&self.data,
			Op::PeerConnect {
				host: render.host.clone(),
				port,
			},
		)?;
		info!(host = %render.host, port, "data server linked to render server");
		Ok(())
	}

	/// Processes behind the data-server connection.
	pub fn data_process_count(&self) -> u32 {
		self.data.process_count
	}

	/// Returns `true` for split data/render configurations.
	pub fn is_split(&self) -> bool {
		self.render.is_some()
	}

	fn route(&self, location: Location) -> Location {
		if self.render.is_some() {
			location
		} else {
			location.fold_render_into_data()
		}
	}

	fn controllers(&self, location: Location) -> Vec<&ProcessController> {
		let mut out = Vec::with_capacity(2);
		if location.targets_data_server() {
			out.push(&self.data);
		}
		if location.targets_render_server()
			&& let Some(render) = &self.render
		{
			out.push(render);
		}
		out
	}

	/// Server controller answering pulls for `location`: data before render.
	fn pull_controller(&self, location: Location) -> &ProcessController {
		match &self.render {
			Some(render) if location.targets_render_server() && !location.targets_data_server() => {
				render
			}
			_ => &self.data,
		}
	}

	fn send(&self, location: Location, call: impl Fn() -> Oneway) -> Result<()> {
		for controller in self.controllers(self.route(location)) {
			controller.send(call())?;
		}
		Ok(())
	}

	fn request(&self, controller: &ProcessController, op: Op) -> Result<ReplyPayload> {
		let opcode = op.opcode();
		let (id, rx) = controller.start_request(op)?;
		let result = self.runtime.block_on(self.await_reply(rx, opcode.as_str()));
		if result.is_err() {
			controller.forget(id);
		}
		result
	}

	async fn await_reply(&self, rx: ReplyReceiver, op: &'static str) -> Result<ReplyPayload> {
		let timeout = self.request_timeout;
		tokio::select! {
			_ = self.cancel.cancelled() => Err(Error::Cancelled),
			res = tokio::time::timeout(timeout, rx) => match res {
				Err(_) => Err(Error::TimedOut { op, timeout }),
				Ok(Err(_)) => Err(Error::Disconnected),
				Ok(Ok(Err(code))) => Err(Error::Remote(code)),
				Ok(Ok(Ok(payload))) => Ok(payload),
			}
		}
	}
}

impl Transport for SessionClient {
	fn push_state(&self, msg: &Message) -> Result<()> {
		if msg.share_only {
			return self.data.send(Oneway::Push(msg.clone()));
		}
		let location = self.route(msg.location);
		if location.contains(Location::CLIENT) {
			self.local.lock().push(ClientId::NONE, msg.clone());
		}
		self.send(location, || Oneway::Push(msg.clone()))
	}

	fn pull_state(&self, msg: &Message) -> Result<Message> {
		let location = self.route(msg.location);
		if location.contains(Location::CLIENT) {
			return self.local.lock().pull(msg).map_err(Error::Remote);
		}
		match self.request(self.pull_controller(location), Op::Pull(msg.clone()))? {
			ReplyPayload::Pull(state) => Ok(state),
			other => Err(unexpected_reply(other)),
		}
	}

	fn delete_si(&self, msg: &Message) -> Result<()> {
		let location = self.route(msg.location);
		if location.contains(Location::CLIENT) {
			self.local.lock().delete_si(ClientId::NONE, msg);
		}
		self.send(location, || Oneway::DeleteSi(msg.clone()))
	}

	fn execute_stream(&self, location: Location, stream: &Stream, ignore_errors: bool) -> Result<()> {
		let location = self.route(location);
		if location.contains(Location::CLIENT) {
			self.local
				.lock()
				.execute_stream(ClientId::NONE, ignore_errors, stream)
				.map_err(Error::Remote)?;
		}
		self.send(location, || Oneway::ExecuteStream {
			ignore_errors,
			stream: stream.clone(),
		})
	}

	fn last_result(&self, location: Location) -> Result<Option<Variant>> {
		let location = self.route(location);
		if location.contains(Location::CLIENT) {
			return Ok(self.local.lock().last_result(ClientId::NONE));
		}
		match self.request(self.pull_controller(location), Op::LastResult)? {
			ReplyPayload::LastResult(value) => Ok(value),
			other => Err(unexpected_reply(other)),
		}
	}

	fn gather_information(&self, location: Location, req: &InfoRequest) -> Result<Information> {
		let location = self.route(location);
		let mut gathered: Option<Information> = None;
		let mut absorb = |info: Information| {
			gathered = Some(match gathered.take() {
				Some(mut acc) => {
					acc.merge(info);
					acc
				}
				None => info,
			});
		};
		if location.contains(Location::CLIENT) {
			absorb(
				self.local
					.lock()
					.gather(ClientId::NONE, req)
					.map_err(Error::GatherInformation)?,
			);
		}
		for controller in self.controllers(location) {
			match self.request(controller, Op::GatherInformation(req.clone())) {
				Ok(ReplyPayload::Information(info)) => absorb(info),
				Ok(other) => return Err(unexpected_reply(other)),
				Err(Error::Remote(code)) => {
					error!(
						server = controller.label(),
						class = req.kind.class_name(),
						%code,
						"server failed to gather information"
					);
					return Err(Error::GatherInformation(code));
				}
				Err(e) => return Err(e),
			}
		}
		gathered.ok_or_else(|| Error::InvalidState(format!("no process at {location:?}")))
	}

	fn reserve_global_ids(&self, count: u32) -> Result<(GlobalId, u32)> {
		match self.request(&self.data, Op::ReserveIds { count })? {
			ReplyPayload::IdRange { first, count } => Ok((first, count)),
			other => Err(unexpected_reply(other)),
		}
	}

	fn client_id(&self) -> ClientId {
		self.data.client_id
	}

	fn is_alive(&self) -> bool {
		self.data.is_alive() && self.render.as_ref().is_none_or(|r| r.is_alive())
	}

	fn is_builtin(&self) -> bool {
		false
	}

	fn drain_notifications(&self) -> Vec<Message> {
		let mut rx = self.notifications.lock();
		let mut out = Vec::new();
		while let Ok(msg) = rx.try_recv() {
			out.push(msg);
		}
		out
	}

	fn cancel(&self) {
		self.cancel.cancel();
	}
}

fn unexpected_reply(payload: ReplyPayload) -> Error {
	Error::InvalidState(format!("unexpected reply {payload:?}"))
}

type Accepted = (TcpStream, String);

/// Forward connection with retries until the connect timeout.
async fn dial(
	endpoint: &Endpoint,
	config: &SessionConfig,
	cancel: &CancellationToken,
	should_continue: &mut dyn FnMut() -> bool,
) -> Result<Accepted> {
	let deadline = Instant::now() + config.connect_timeout();
	let poll = config.poll_interval();
	loop {
		match tokio::time::timeout(
			poll,
			TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
		)
		.await
		{
			Ok(Ok(stream)) => return Ok((stream, endpoint.host.clone())),
			Ok(Err(e)) => {
				debug!(%endpoint, error = %e, "connection attempt failed");
				tokio::time::sleep(poll).await;
			}
			Err(_) => {}
		}
		if cancel.is_cancelled() || !should_continue() {
			return Err(Error::Cancelled);
		}
		if Instant::now() >= deadline {
			return Err(Error::Connection(format!(
				"{endpoint}: no server after {:?}",
				config.connect_timeout()
			)));
		}
	}
}

/// Reverse connection: binds every listener first, then waits for each
/// server to connect.
async fn accept_all(
	data: &Endpoint,
	render: Option<&Endpoint>,
	config: &SessionConfig,
	cancel: &CancellationToken,
	should_continue: &mut dyn FnMut() -> bool,
) -> Result<(Accepted, Option<Accepted>)> {
	let data_listener = bind(data).await?;
	let render_listener = match render {
		Some(ep) => Some(bind(ep).await?),
		None => None,
	};
	let data = accept(&data_listener, config.poll_interval(), cancel, should_continue).await?;
	let render = match &render_listener {
		Some(listener) => {
			Some(accept(listener, config.poll_interval(), cancel, should_continue).await?)
		}
		None => None,
	};
	Ok((data, render))
}

async fn bind(endpoint: &Endpoint) -> Result<TcpListener> {
	let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))
		.await
		.map_err(|e| Error::Connection(format!("cannot listen on {endpoint}: {e}")))?;
	info!(addr = ?listener.local_addr().ok(), "waiting for reverse connection");
	Ok(listener)
}

async fn accept(
	listener: &TcpListener,
	poll: Duration,
	cancel: &CancellationToken,
	should_continue: &mut dyn FnMut() -> bool,
) -> Result<Accepted> {
	loop {
		match tokio::time::timeout(poll, listener.accept()).await {
			Ok(Ok((stream, addr))) => return Ok((stream, peer_host(addr))),
			Ok(Err(e)) => return Err(e.into()),
			Err(_) => {}
		}
		if cancel.is_cancelled() || !should_continue() {
			return Err(Error::Cancelled);
		}
	}
}

fn peer_host(addr: SocketAddr) -> String {
	addr.ip().to_string()
}
