use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meridian_proto::{Body, CollaborationBody, GlobalId};
use meridian_servermanager::{CollaborationEvent, SelectionCommand, Session, Subscription};
use pretty_assertions::assert_eq;

use crate::common::{TestServer, connect, settle, wait_until};

const TIMEOUT: Duration = Duration::from_secs(5);

fn count_master_changes(session: &Session) -> (Arc<AtomicUsize>, Subscription) {
	let count = Arc::new(AtomicUsize::new(0));
	let sink = count.clone();
	let subscription = session.collaboration_manager().subscribe(move |event| {
		if let CollaborationEvent::Notification(msg) = event
			&& matches!(msg.body, Body::Collaboration(CollaborationBody::MasterChange { .. }))
		{
			sink.fetch_add(1, Ordering::Relaxed);
		}
	});
	(count, subscription)
}

#[test]
fn first_client_is_master() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");
	assert!(wait_until(&[&alice], TIMEOUT, || {
		alice.collaboration_manager().clients().len() == 2
	}));

	assert!(alice.collaboration_manager().is_master());
	assert!(!bob.collaboration_manager().is_master());
	assert_eq!(bob.collaboration_manager().master_id(), alice.client_id());
	assert_eq!(bob.collaboration_manager().user_id(), bob.client_id());
}

#[test]
fn promotion_reaches_every_other_client_once() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");
	let carol = connect(&server, "carol");
	let all = [&alice, &bob, &carol];
	settle(&all, Duration::from_millis(100));

	let (alice_count, _a) = count_master_changes(&alice);
	let (bob_count, _b) = count_master_changes(&bob);
	let (carol_count, _c) = count_master_changes(&carol);

	alice
		.collaboration_manager()
		.promote_to_master(bob.client_id())
		.unwrap();
	assert_eq!(alice.collaboration_manager().master_id(), bob.client_id());
	assert!(wait_until(&all, TIMEOUT, || {
		bob.collaboration_manager().is_master()
			&& carol.collaboration_manager().master_id() == bob.client_id()
	}));
	settle(&all, Duration::from_millis(200));

	assert_eq!(alice_count.load(Ordering::Relaxed), 0);
	assert_eq!(bob_count.load(Ordering::Relaxed), 1);
	assert_eq!(carol_count.load(Ordering::Relaxed), 1);

	// A late joiner sees the promoted master.
	let dave = connect(&server, "dave");
	assert_eq!(dave.collaboration_manager().master_id(), bob.client_id());
}

#[test]
fn departing_master_hands_over_to_the_lowest_client() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");
	let carol = connect(&server, "carol");
	settle(&[&alice, &bob, &carol], Duration::from_millis(100));
	assert!(alice.collaboration_manager().is_master());

	drop(alice);
	assert!(wait_until(&[&bob, &carol], TIMEOUT, || {
		bob.collaboration_manager().is_master()
			&& carol.collaboration_manager().master_id() == bob.client_id()
	}));
	assert_eq!(carol.collaboration_manager().clients().len(), 2);
}

#[test]
fn user_names_are_shared() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");
	assert_eq!(
		bob.collaboration_manager()
			.user_name(alice.client_id())
			.as_deref(),
		Some("alice")
	);

	alice
		.collaboration_manager()
		.set_user_name("Alice Liddell")
		.unwrap();
	assert!(wait_until(&[&bob], TIMEOUT, || {
		bob.collaboration_manager()
			.user_name(alice.client_id())
			.as_deref() == Some("Alice Liddell")
	}));
}

#[test]
fn selection_follows_the_master() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");
	let carol = connect(&server, "carol");
	let all = [&alice, &bob, &carol];
	settle(&all, Duration::from_millis(100));

	let models: Vec<_> = all
		.iter()
		.map(|s| s.proxy_manager().new_selection_model("ActiveSources"))
		.collect();
	models[0]
		.set_current_proxy(GlobalId(100), SelectionCommand::CLEAR_AND_SELECT)
		.unwrap();
	assert!(wait_until(&all, TIMEOUT, || {
		models[1].current_proxy() == GlobalId(100) && models[2].current_proxy() == GlobalId(100)
	}));

	// Carol is not master: her selection is cached elsewhere, not applied.
	models[2]
		.set_current_proxy(GlobalId(200), SelectionCommand::CLEAR_AND_SELECT)
		.unwrap();
	assert!(wait_until(&all, TIMEOUT, || {
		bob.collaboration_manager()
			.cached_selection("ActiveSources", carol.client_id())
			.is_some()
	}));
	assert_eq!(models[1].current_proxy(), GlobalId(100));
	assert_eq!(models[0].current_proxy(), GlobalId(100));

	alice
		.collaboration_manager()
		.promote_to_master(carol.client_id())
		.unwrap();
	assert!(wait_until(&all, TIMEOUT, || {
		models[1].current_proxy() == GlobalId(200)
	}));
	assert_eq!(models[1].selection(), vec![GlobalId(200)]);
}
