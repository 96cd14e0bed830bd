//! Servers and sessions shared by the integration tests.
//!
//! Sessions block on their own runtime, so every server here runs on a
//! dedicated thread with a private current-thread runtime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use meridian_proto::{
	ClientId, Frame, Location, ServerRole, ServerUrl, Variant, Welcome, read_frame, write_frame,
};
use meridian_server::{CoreService, ServerConfig, ServerContext, ServiceCore, ipc};
use meridian_servermanager::{ProxyDefinition, ProxyDefinitionManager, Session, SessionConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Server thread stopped and joined on drop.
pub struct TestServer {
	addr: SocketAddr,
	shutdown: CancellationToken,
	thread: Option<JoinHandle<()>>,
}

impl TestServer {
	/// Unified server on an ephemeral port.
	pub fn start() -> Self {
		Self::spawn(|listener, shutdown| async move {
			let config = ServerConfig {
				host: "127.0.0.1".into(),
				..ServerConfig::default()
			};
			let core = CoreService::start(ServiceCore::new(ServerRole::Combined, 1));
			let ctx = ServerContext::new(core, &config, shutdown);
			if let Err(e) = ipc::serve(listener, ctx).await {
				tracing::error!(error = %e, "test server failed");
			}
		})
	}

	/// Server that completes the handshake and then never answers.
	pub fn stalled() -> Self {
		Self::spawn(|listener, shutdown| async move {
			loop {
				tokio::select! {
					_ = shutdown.cancelled() => break,
					res = listener.accept() => {
						let Ok((mut stream, _)) = res else { continue };
						tokio::spawn(async move {
							if read_frame::<_, Frame>(&mut stream).await.is_err() {
								return;
							}
							let welcome = Frame::Welcome(Welcome {
								client_id: ClientId(1),
								role: ServerRole::Combined,
								process_count: 1,
							});
							if write_frame(&mut stream, &welcome).await.is_err() {
								return;
							}
							while read_frame::<_, Frame>(&mut stream).await.is_ok() {}
						});
					}
				}
			}
		})
	}

	fn spawn<F, Fut>(serve: F) -> Self
	where
		F: FnOnce(TcpListener, CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = ()>,
	{
		let _ = tracing_subscriber::fmt::try_init();
		let shutdown = CancellationToken::new();
		let token = shutdown.clone();
		let (tx, rx) = std::sync::mpsc::channel();
		let thread = std::thread::spawn(move || {
			let runtime = tokio::runtime::Builder::new_current_thread()
				.enable_all()
				.build()
				.expect("failed to build server runtime");
			runtime.block_on(async move {
				let listener = TcpListener::bind("127.0.0.1:0")
					.await
					.expect("failed to bind test server");
				tx.send(listener.local_addr().expect("no local address"))
					.expect("test thread gone");
				serve(listener, token).await;
			});
		});
		let addr = rx.recv().expect("test server did not start");
		Self {
			addr,
			shutdown,
			thread: Some(thread),
		}
	}

	/// `cs://` URL of the server.
	pub fn url(&self) -> String {
		format!("cs://127.0.0.1:{}", self.addr.port())
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.shutdown.cancel();
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

/// Tunables with short timeouts.
pub fn config(user: &str) -> SessionConfig {
	SessionConfig {
		request_timeout_ms: 2_000,
		connect_timeout_ms: 1_000,
		poll_interval_ms: 20,
		user_name: Some(user.into()),
		..SessionConfig::default()
	}
}

/// Pipeline definitions shared by every test.
pub fn definitions() -> Arc<ProxyDefinitionManager> {
	let defs = ProxyDefinitionManager::new();
	defs.register(
		ProxyDefinition::new("sources", "SphereSource", Location::DATA_SERVER)
			.with_property("Radius", Variant::double(0.5))
			.with_property("Center", Variant::Double(vec![0.0, 0.0, 0.0])),
	);
	defs.register(
		ProxyDefinition::new("filters", "Shrink", Location::DATA_SERVER)
			.with_property("Input", Variant::Proxy(vec![]))
			.with_property("Factor", Variant::double(0.5)),
	);
	defs.register(
		ProxyDefinition::new("representations", "Geometry", Location::DATA_SERVER)
			.with_property("Input", Variant::Proxy(vec![]))
			.with_property("Opacity", Variant::double(1.0))
			.with_sub_proxy("Mapper", "misc", "Mapper"),
	);
	defs.register(
		ProxyDefinition::new("misc", "Mapper", Location::DATA_SERVER)
			.with_property("Scalars", Variant::string("")),
	);
	Arc::new(defs)
}

/// Session connected to `server` as `user`.
pub fn connect(server: &TestServer, user: &str) -> Arc<Session> {
	connect_with(server, config(user))
}

/// Session connected to `server` with `config`.
pub fn connect_with(server: &TestServer, config: SessionConfig) -> Arc<Session> {
	let url = ServerUrl::parse(&server.url()).expect("bad test url");
	Session::connect(&url, config, definitions(), &mut || true).expect("failed to connect")
}

/// Processes notifications on `sessions` until `done` holds.
pub fn wait_until(sessions: &[&Arc<Session>], timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
	let start = Instant::now();
	loop {
		for session in sessions {
			let _ = session.process_notifications();
		}
		if done() {
			return true;
		}
		if start.elapsed() > timeout {
			return false;
		}
		std::thread::sleep(Duration::from_millis(10));
	}
}

/// Processes whatever arrives on `sessions` within `window`.
pub fn settle(sessions: &[&Arc<Session>], window: Duration) {
	let _ = wait_until(sessions, window, || false);
}
