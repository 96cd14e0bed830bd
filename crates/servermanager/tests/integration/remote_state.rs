use std::collections::BTreeSet;
use std::time::Duration;

use meridian_proto::{GlobalId, Location, Message, Variant};
use meridian_servermanager::{StateLookup, UndoStack, UndoStackBuilder};
use pretty_assertions::assert_eq;

use crate::common::{TestServer, connect, wait_until};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn registered_proxy_replicates_to_other_clients() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");

	let pm = alice.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	sphere.set_property("Radius", Variant::double(2.0)).unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();

	assert!(wait_until(&[&bob], TIMEOUT, || {
		bob.proxy_manager().get_proxy("sources", "Sphere1").is_some()
	}));
	let replica = bob.proxy_manager().get_proxy("sources", "Sphere1").unwrap();
	assert_eq!(replica.global_id(), sphere.global_id());
	assert_eq!(replica.property("Radius"), Some(Variant::double(2.0)));
	assert!(!replica.is_modified());

	sphere.set_property("Radius", Variant::double(3.0)).unwrap();
	sphere.update_vtk_objects().unwrap();
	assert!(wait_until(&[&bob], TIMEOUT, || {
		replica.property("Radius") == Some(Variant::double(3.0))
	}));
}

#[test]
fn late_joiner_loads_the_pipeline_from_the_server() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let pm = alice.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	sphere.set_property("Radius", Variant::double(1.25)).unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	let shrink = pm.new_proxy("filters", "Shrink").unwrap();
	shrink.set_proxy_property("Input", &[sphere.clone()]).unwrap();
	pm.register_proxy("filters", "Shrink1", &shrink).unwrap();

	let bob = connect(&server, "bob");
	bob.proxy_manager().update_from_remote().unwrap();
	assert_eq!(bob.proxy_manager().registrations(), pm.registrations());

	let replica = bob.proxy_manager().get_proxy("filters", "Shrink1").unwrap();
	let input = replica.proxy_property("Input");
	assert_eq!(input.len(), 1);
	assert_eq!(input[0].global_id(), sphere.global_id());
	assert_eq!(input[0].property("Radius"), Some(Variant::double(1.25)));
}

#[test]
fn ids_are_unique_across_clients() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");

	let mut ids = BTreeSet::new();
	for _ in 0..20 {
		assert!(ids.insert(alice.next_global_id().unwrap()));
		assert!(ids.insert(bob.next_global_id().unwrap()));
	}
	assert!(ids.iter().all(|id| !id.is_reserved()));
}

#[test]
fn pushed_state_is_readable_back() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let sphere = alice
		.proxy_manager()
		.new_proxy("sources", "SphereSource")
		.unwrap();
	sphere.set_property("Radius", Variant::double(3.0)).unwrap();
	sphere.update_vtk_objects().unwrap();
	sphere.set_property("Radius", Variant::double(5.0)).unwrap();
	sphere.update_vtk_objects().unwrap();

	let id = sphere.global_id();
	let pulled = alice
		.pull_state(&Message::new(id, Location::DATA_SERVER))
		.unwrap();
	assert_eq!(pulled.property("Radius"), Some(&Variant::double(5.0)));
	let cached = alice.state_locator().find_state(id, false).unwrap();
	assert_eq!(cached.property("Radius"), Some(&Variant::double(5.0)));
	assert!(
		alice
			.pull_state(&Message::new(GlobalId(9_999_999), Location::DATA_SERVER))
			.is_err()
	);
}

#[test]
fn undo_replicates_to_other_clients() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");
	let builder = UndoStackBuilder::new(UndoStack::new(8));
	alice.set_undo_stack_builder(Some(builder.clone()));

	let pm = alice.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	assert!(wait_until(&[&bob], TIMEOUT, || {
		bob.proxy_manager().get_proxy("sources", "Sphere1").is_some()
	}));
	let replica = bob.proxy_manager().get_proxy("sources", "Sphere1").unwrap();

	builder.begin("Radius");
	sphere.set_property("Radius", Variant::double(4.0)).unwrap();
	sphere.update_vtk_objects().unwrap();
	assert!(builder.end_and_push_to_stack());
	assert!(wait_until(&[&bob], TIMEOUT, || {
		replica.property("Radius") == Some(Variant::double(4.0))
	}));

	assert!(builder.stack().undo().unwrap());
	assert!(wait_until(&[&bob], TIMEOUT, || {
		replica.property("Radius") == Some(Variant::double(0.5))
	}));
	assert!(!builder.stack().can_undo());
}

#[test]
fn undone_deletion_comes_back_on_other_clients() {
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	let bob = connect(&server, "bob");
	let builder = UndoStackBuilder::new(UndoStack::new(8));
	alice.set_undo_stack_builder(Some(builder.clone()));

	let pm = alice.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	sphere.set_property("Radius", Variant::double(6.0)).unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	let id = sphere.global_id();
	assert!(wait_until(&[&bob], TIMEOUT, || {
		bob.proxy_manager().get_proxy("sources", "Sphere1").is_some()
	}));

	builder.begin("Delete");
	pm.unregister_proxy("sources", "Sphere1", &sphere).unwrap();
	drop(sphere);
	assert!(builder.end_and_push_to_stack());
	assert!(wait_until(&[&bob], TIMEOUT, || {
		bob.proxy_manager().get_proxy("sources", "Sphere1").is_none()
	}));

	assert!(builder.stack().undo().unwrap());
	let restored = pm.get_proxy("sources", "Sphere1").unwrap();
	assert_eq!(restored.global_id(), id);
	assert!(wait_until(&[&bob], TIMEOUT, || {
		bob.proxy_manager()
			.get_proxy("sources", "Sphere1")
			.is_some_and(|p| p.global_id() == id && p.property("Radius") == Some(Variant::double(6.0)))
	}));
}
