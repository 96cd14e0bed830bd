use std::sync::Arc;

use meridian_proto::Variant;
use meridian_servermanager::{Session, XmlElement};
use pretty_assertions::assert_eq;

use crate::common::{TestServer, config, connect, definitions};

fn build_pipeline(session: &Session) {
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	sphere.set_property("Radius", Variant::double(2.5)).unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	let shrink = pm.new_proxy("filters", "Shrink").unwrap();
	shrink.set_proxy_property("Input", &[sphere.clone()]).unwrap();
	shrink.set_property("Factor", Variant::double(0.8)).unwrap();
	pm.register_proxy("filters", "Shrink1", &shrink).unwrap();
	let repr = pm.new_proxy("representations", "Geometry").unwrap();
	repr.set_proxy_property("Input", &[shrink]).unwrap();
	repr.sub_proxy("Mapper")
		.unwrap()
		.set_property("Scalars", Variant::string("Normals"))
		.unwrap();
	pm.register_proxy("representations", "Geometry1", &repr).unwrap();
}

fn save(session: &Session, path: &std::path::Path) {
	let text = session
		.proxy_manager()
		.save_xml_state()
		.to_xml_string()
		.unwrap();
	std::fs::write(path, text).unwrap();
}

fn load(session: &Session, path: &std::path::Path, renumber: bool) {
	let text = std::fs::read_to_string(path).unwrap();
	let root = XmlElement::parse(&text).unwrap();
	session.proxy_manager().load_xml_state(&root, renumber).unwrap();
}

fn assert_pipeline(session: &Session) {
	let pm = session.proxy_manager();
	let sphere = pm.get_proxy("sources", "Sphere1").unwrap();
	assert_eq!(sphere.property("Radius"), Some(Variant::double(2.5)));
	let shrink = pm.get_proxy("filters", "Shrink1").unwrap();
	assert_eq!(shrink.property("Factor"), Some(Variant::double(0.8)));
	assert!(Arc::ptr_eq(&shrink.proxy_property("Input")[0], &sphere));
	let repr = pm.get_proxy("representations", "Geometry1").unwrap();
	assert!(Arc::ptr_eq(&repr.proxy_property("Input")[0], &shrink));
	assert_eq!(
		repr.sub_proxy("Mapper").unwrap().property("Scalars"),
		Some(Variant::string("Normals"))
	);
}

#[test]
fn remote_pipeline_saves_and_loads_into_builtin_session() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("pipeline.pvsm");
	let server = TestServer::start();
	let alice = connect(&server, "alice");
	build_pipeline(&alice);
	save(&alice, &path);

	let local = Session::builtin(config("local"), definitions());
	load(&local, &path, false);
	assert_pipeline(&local);
	assert_eq!(
		local.proxy_manager().registrations(),
		alice.proxy_manager().registrations()
	);
}

#[test]
fn state_file_loads_into_a_busy_server_with_renumbering() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("pipeline.pvsm");
	let origin = Session::builtin(config("origin"), definitions());
	build_pipeline(&origin);
	save(&origin, &path);

	let server = TestServer::start();
	let alice = connect(&server, "alice");
	build_pipeline(&alice);
	let before = alice.proxy_manager().registrations();

	load(&alice, &path, true);
	let after = alice.proxy_manager().registrations();
	assert_eq!(after.len(), 2 * before.len());
	let copies = alice.proxy_manager().get_proxies("sources", "Sphere1");
	assert_eq!(copies.len(), 2);
	assert!(copies.iter().all(|p| p.property("Radius") == Some(Variant::double(2.5))));
	assert_ne!(copies[0].global_id(), copies[1].global_id());
}
