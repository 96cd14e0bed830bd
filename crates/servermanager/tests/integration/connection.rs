use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_proto::{GlobalId, Location, Message, ServerUrl, SessionId};
use meridian_servermanager::{Error, ServerManager, Session, SessionConfig};

use crate::common::{TestServer, config, connect, connect_with, definitions};

fn closed_port() -> u16 {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	listener.local_addr().unwrap().port()
}

fn quick(user: &str) -> SessionConfig {
	SessionConfig {
		request_timeout_ms: 200,
		connect_timeout_ms: 300,
		..config(user)
	}
}

#[test]
fn remote_session_reports_its_client_id() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");
	assert!(!alice.is_builtin());
	assert!(alice.is_alive());
	assert_ne!(alice.client_id(), bob.client_id());
}

#[test]
fn request_without_reply_times_out() {
	let server = TestServer::stalled();
	let session = connect_with(&server, quick("alice"));
	let started = Instant::now();
	let err = session
		.pull_state(&Message::new(GlobalId(20), Location::DATA_SERVER))
		.unwrap_err();
	assert!(matches!(err, Error::TimedOut { .. }), "{err}");
	assert!(started.elapsed() >= Duration::from_millis(200));
}

#[test]
fn cancelled_session_aborts_blocking_calls() {
	let server = TestServer::stalled();
	let session = connect_with(
		&server,
		SessionConfig {
			request_timeout_ms: 1_000,
			..quick("alice")
		},
	);
	let remote = Arc::clone(&session);
	let canceller = std::thread::spawn(move || {
		std::thread::sleep(Duration::from_millis(100));
		remote.cancel();
	});
	let started = Instant::now();
	let err = session.next_global_id().unwrap_err();
	canceller.join().unwrap();
	assert!(matches!(err, Error::Cancelled), "{err}");
	assert!(started.elapsed() < Duration::from_millis(900));
}

#[test]
fn unreachable_server_yields_session_zero() {
	let manager = ServerManager::new(quick("alice"), definitions());
	let url = format!("cs://127.0.0.1:{}", closed_port());
	assert_eq!(manager.connect_or_zero(&url), SessionId(0));
	assert!(manager.session_ids().is_empty());
	assert!(manager.active_session().is_none());
}

#[test]
fn connection_loop_stops_when_asked() {
	let url = ServerUrl::parse(&format!("cs://127.0.0.1:{}", closed_port())).unwrap();
	let config = SessionConfig {
		connect_timeout_ms: 10_000,
		..quick("alice")
	};
	let mut polls = 0;
	let started = Instant::now();
	let err = Session::connect(&url, config, definitions(), &mut || {
		polls += 1;
		polls < 3
	})
	.unwrap_err();
	assert!(matches!(err, Error::Cancelled), "{err}");
	assert_eq!(polls, 3);
	assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn server_manager_tracks_remote_sessions() {
	let server = TestServer::start();
	let manager = ServerManager::new(config("alice"), definitions());
	let remote = manager.connect(&server.url()).unwrap();
	let local = manager.connect("builtin:").unwrap();
	assert_eq!(manager.session_ids(), vec![remote, local]);
	assert_eq!(manager.active_session_id(), Some(remote));
	assert!(!manager.active_session().unwrap().is_builtin());
	assert!(manager.session(local).unwrap().is_builtin());
}
