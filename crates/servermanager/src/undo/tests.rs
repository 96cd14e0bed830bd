use std::sync::{Arc, Weak};

use meridian_proto::{GlobalId, Location, Message, Variant};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::{UndoElement, UndoSet, UndoStack, UndoStackBuilder, UndoStackEvent};
use crate::config::SessionConfig;
use crate::definitions::{ProxyDefinition, ProxyDefinitionManager};
use crate::error::Error;
use crate::session::Session;

fn recording_session() -> (Arc<Session>, Arc<UndoStackBuilder>) {
	let defs = ProxyDefinitionManager::new();
	defs.register(
		ProxyDefinition::new("sources", "SphereSource", Location::DATA_SERVER)
			.with_property("Radius", Variant::double(0.5)),
	);
	defs.register(
		ProxyDefinition::new("views", "Camera", Location::CLIENT | Location::RENDER_SERVER)
			.with_property("Position", Variant::Double(vec![0.0, 0.0, 1.0])),
	);
	let config = SessionConfig::default();
	let stack = UndoStack::new(config.undo_stack_depth);
	let builder = UndoStackBuilder::new(stack);
	let session = Session::builtin(config, Arc::new(defs));
	session.set_undo_stack_builder(Some(builder.clone()));
	(session, builder)
}

fn bare_set(label: &str) -> UndoSet {
	let mut set = UndoSet::new(label);
	set.push(UndoElement::creation(
		Weak::new(),
		Message::new(GlobalId(99), Location::DATA_SERVER),
	));
	set
}

#[test]
fn property_change_undoes_and_redoes() {
	let (session, builder) = recording_session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();

	builder.begin("Change Radius");
	sphere.set_property("Radius", Variant::double(3.0)).unwrap();
	sphere.update_vtk_objects().unwrap();
	assert!(builder.end_and_push_to_stack());

	let stack = builder.stack();
	assert_eq!(stack.undo_label().as_deref(), Some("Change Radius"));
	assert!(stack.undo().unwrap());
	assert_eq!(sphere.property("Radius"), Some(Variant::double(0.5)));
	assert!(!sphere.is_modified());
	assert!(stack.can_redo());

	assert!(stack.redo().unwrap());
	assert_eq!(sphere.property("Radius"), Some(Variant::double(3.0)));
	assert!(!stack.can_redo());
}

#[test]
fn undoing_a_creation_unregisters_and_redo_restores_the_same_id() {
	let (session, builder) = recording_session();
	let pm = session.proxy_manager();

	builder.begin("Create Sphere");
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	sphere.set_property("Radius", Variant::double(2.0)).unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	builder.end_and_push_to_stack();
	let id = sphere.global_id();
	drop(sphere);

	let stack = builder.stack();
	assert!(stack.undo().unwrap());
	assert!(pm.get_proxy("sources", "Sphere1").is_none());
	assert!(session.get_remote_object(id).is_none());

	assert!(stack.redo().unwrap());
	let restored = pm.get_proxy("sources", "Sphere1").unwrap();
	assert_eq!(restored.global_id(), id);
	assert_eq!(restored.property("Radius"), Some(Variant::double(2.0)));
}

#[test]
fn undoing_a_deletion_rebuilds_the_proxy() {
	let (session, builder) = recording_session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	sphere.set_property("Radius", Variant::double(4.0)).unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	let id = sphere.global_id();

	builder.begin("Delete");
	assert!(pm.unregister_proxy("sources", "Sphere1", &sphere).unwrap());
	drop(sphere);
	builder.end_and_push_to_stack();
	assert!(session.get_remote_object(id).is_none());

	assert!(builder.stack().undo().unwrap());
	let rebuilt = pm.get_proxy("sources", "Sphere1").unwrap();
	assert_eq!(rebuilt.global_id(), id);
	assert_eq!(rebuilt.property("Radius"), Some(Variant::double(4.0)));
	assert!(rebuilt.objects_created());
}

#[test]
fn nested_blocks_commit_once() {
	let (session, builder) = recording_session();
	let pm = session.proxy_manager();

	builder.begin("Outer");
	builder.begin("Inner");
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	builder.end();
	assert!(!builder.push_to_stack());
	assert!(builder.is_recording());

	sphere.set_property("Radius", Variant::double(1.5)).unwrap();
	sphere.update_vtk_objects().unwrap();
	assert!(builder.end_and_push_to_stack());

	let stack = builder.stack();
	assert_eq!(stack.undo_len(), 1);
	assert_eq!(stack.undo_label().as_deref(), Some("Outer"));
}

#[test]
fn nothing_recorded_pushes_nothing() {
	let (_session, builder) = recording_session();
	builder.begin("Idle");
	assert!(!builder.end_and_push_to_stack());
	assert!(!builder.stack().can_undo());
}

#[test]
fn ignored_and_excluded_changes_are_not_recorded() {
	let (session, builder) = recording_session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	let camera = pm.new_proxy("views", "Camera").unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	pm.register_proxy("views", "Camera1", &camera).unwrap();

	builder.set_ignore_all_changes(true);
	builder.begin("Ignored");
	sphere.set_property("Radius", Variant::double(9.0)).unwrap();
	sphere.update_vtk_objects().unwrap();
	assert!(!builder.end_and_push_to_stack());
	builder.set_ignore_all_changes(false);

	builder.begin("Camera");
	camera
		.set_property("Position", Variant::Double(vec![1.0, 2.0, 3.0]))
		.unwrap();
	camera.update_vtk_objects().unwrap();
	assert!(!builder.end_and_push_to_stack());
	assert!(!builder.stack().can_undo());
}

#[test]
fn replay_is_not_recorded() {
	let (session, builder) = recording_session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();

	builder.begin("Change Radius");
	sphere.set_property("Radius", Variant::double(3.0)).unwrap();
	sphere.update_vtk_objects().unwrap();
	builder.end_and_push_to_stack();

	builder.begin("While undoing");
	assert!(builder.stack().undo().unwrap());
	assert!(!builder.end_and_push_to_stack());
	assert_eq!(builder.stack().redo_len(), 1);
}

#[test]
fn depth_limit_drops_oldest_and_push_clears_redo() {
	let stack = UndoStack::new(2);
	let events = Arc::new(Mutex::new(Vec::new()));
	let sink = events.clone();
	let _subscription = stack.subscribe(move |e| sink.lock().push(e.clone()));

	stack.push(bare_set("first"));
	stack.push(bare_set("second"));
	stack.push(bare_set("third"));
	assert_eq!(stack.undo_len(), 2);

	assert!(stack.undo().unwrap());
	assert_eq!(stack.undo_label().as_deref(), Some("second"));
	assert_eq!(stack.redo_label().as_deref(), Some("third"));

	stack.push(bare_set("fourth"));
	assert!(!stack.can_redo());

	stack.clear();
	assert!(!stack.undo().unwrap());
	assert_eq!(
		*events.lock(),
		vec![
			UndoStackEvent::Pushed("first".into()),
			UndoStackEvent::Pushed("second".into()),
			UndoStackEvent::Pushed("third".into()),
			UndoStackEvent::Undone("third".into()),
			UndoStackEvent::Pushed("fourth".into()),
			UndoStackEvent::Cleared,
		]
	);
}

#[test]
fn failed_redo_keeps_the_set() {
	let stack = UndoStack::new(4);
	stack.push(bare_set("orphan"));
	assert!(stack.undo().unwrap());

	assert!(matches!(stack.redo(), Err(Error::Disconnected)));
	assert_eq!(stack.redo_label().as_deref(), Some("orphan"));
	assert!(!stack.is_replaying());
}
