use std::collections::BTreeSet;
use std::sync::Arc;

use meridian_proto::{
	Body, GlobalId, LinkDirection, Location, Message, ProxyManagerState, ProxyRef, ProxyState,
	Registration, Variant,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::{ProxyManagerEvent, compute_delta};
use crate::config::SessionConfig;
use crate::definitions::{ProxyDefinition, ProxyDefinitionManager};
use crate::error::Error;
use crate::links::{Link, PropertyLink};
use crate::proxy_locator::SessionProxyLocator;
use crate::remote_object::RemoteObject;
use crate::session::Session;
use crate::state_locator::{StateLocator, StateLookup};
use crate::xml::XmlElement;

fn definitions() -> Arc<ProxyDefinitionManager> {
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
		ProxyDefinition::new(
			"representations",
			"Geometry",
			Location::DATA_SERVER | Location::RENDER_SERVER,
		)
		.with_property("Input", Variant::Proxy(vec![]))
		.with_property("Opacity", Variant::double(1.0))
		.with_sub_proxy("Mapper", "misc", "Mapper"),
	);
	defs.register(
		ProxyDefinition::new("misc", "Mapper", Location::DATA_SERVER | Location::RENDER_SERVER)
			.with_property("Scalars", Variant::string("")),
	);
	Arc::new(defs)
}

fn session() -> Arc<Session> {
	Session::builtin(SessionConfig::default(), definitions())
}

fn reg(group: &str, name: &str, id: GlobalId) -> Registration {
	Registration {
		group: group.into(),
		name: name.into(),
		global_id: id,
	}
}

fn manager_state(registered: Vec<Registration>) -> Message {
	Message::new(GlobalId::PROXY_MANAGER, Location::DATA_SERVER_ROOT).with_body(
		Body::ProxyManager(ProxyManagerState {
			registered,
			..ProxyManagerState::default()
		}),
	)
}

fn registration_events(session: &Session) -> (Arc<Mutex<Vec<ProxyManagerEvent>>>, crate::Subscription) {
	let events = Arc::new(Mutex::new(Vec::new()));
	let sink = events.clone();
	let subscription = session.proxy_manager().subscribe(move |event| {
		if matches!(
			event,
			ProxyManagerEvent::Registered(_) | ProxyManagerEvent::Unregistered(_)
		) {
			sink.lock().push(event.clone());
		}
	});
	(events, subscription)
}

#[test]
fn delta_partitions_registrations() {
	let a = reg("sources", "Sphere1", GlobalId(11));
	let b = reg("sources", "Sphere2", GlobalId(12));
	let c = reg("filters", "Shrink1", GlobalId(13));
	let current: BTreeSet<_> = [a.clone(), b.clone()].into();
	let incoming: BTreeSet<_> = [b, c.clone()].into();

	let delta = compute_delta(&current, &incoming);
	assert_eq!(delta.to_register, vec![c]);
	assert_eq!(delta.to_unregister, vec![a]);
	assert!(compute_delta(&incoming, &incoming).is_empty());
}

fn registration_sets() -> impl Strategy<Value = BTreeSet<Registration>> {
	const GROUPS: [&str; 3] = ["sources", "filters", "representations"];
	prop::collection::btree_set((0..GROUPS.len(), 0..4u32, 11..20u32), 0..12).prop_map(|set| {
		set.into_iter()
			.map(|(g, n, id)| reg(GROUPS[g], &format!("P{n}"), GlobalId(id)))
			.collect()
	})
}

proptest! {
	#[test]
	fn applying_delta_yields_incoming(current in registration_sets(), incoming in registration_sets()) {
		let delta = compute_delta(&current, &incoming);
		prop_assert!(delta.to_register.iter().all(|r| !current.contains(r)));
		prop_assert!(delta.to_unregister.iter().all(|r| current.contains(r)));

		let mut applied = current.clone();
		applied.extend(delta.to_register.iter().cloned());
		for r in &delta.to_unregister {
			applied.remove(r);
		}
		prop_assert_eq!(applied, incoming);
	}
}

#[test]
fn registration_is_pushed_to_the_server() {
	let session = session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();

	let id = sphere.global_id();
	assert!(id > GlobalId::RESERVED_MAX);
	assert!(sphere.objects_created());

	let pulled = session
		.pull_state(&Message::new(GlobalId::PROXY_MANAGER, Location::DATA_SERVER_ROOT))
		.unwrap();
	let Body::ProxyManager(state) = pulled.body else {
		panic!("expected proxy manager state");
	};
	assert_eq!(state.registered, vec![reg("sources", "Sphere1", id)]);
	assert_eq!(pm.get_proxy_name("sources", &sphere).as_deref(), Some("Sphere1"));
	assert!(pm.is_registered(&sphere));
}

#[test]
fn unknown_definition_is_an_error() {
	let session = session();
	let err = session.proxy_manager().new_proxy("sources", "Cone").unwrap_err();
	assert!(matches!(err, Error::UnknownDefinition { .. }));
}

#[test]
fn load_state_registers_before_unregistering() {
	let session = session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "A", &sphere).unwrap();
	let id = sphere.global_id();
	let weak = Arc::downgrade(&sphere);
	drop(sphere);

	let (events, _subscription) = registration_events(&session);
	let locator = session.proxy_locator();
	pm.load_state(&manager_state(vec![reg("sources", "B", id)]), &locator)
		.unwrap();

	assert_eq!(
		*events.lock(),
		vec![
			ProxyManagerEvent::Registered(reg("sources", "B", id)),
			ProxyManagerEvent::Unregistered(reg("sources", "A", id)),
		]
	);
	let renamed = pm.get_proxy("sources", "B").unwrap();
	assert!(std::ptr::eq(Arc::as_ptr(&renamed), weak.as_ptr()));
	assert!(pm.get_proxy("sources", "A").is_none());
}

#[test]
fn load_state_rebuilds_missing_proxies_in_two_passes() {
	let session = session();
	let pm = session.proxy_manager();
	let (source, geometry, mapper) = (GlobalId(5000), GlobalId(5001), GlobalId(5002));

	let states = Arc::new(StateLocator::new());
	states.register_state(
		&Message::new(source, Location::DATA_SERVER)
			.with_type("sources", "SphereSource")
			.with_property("Radius", Variant::double(7.0))
			.with_body(Body::Proxy(ProxyState::default())),
	);
	states.register_state(
		&Message::new(geometry, Location::DATA_SERVER | Location::RENDER_SERVER)
			.with_type("representations", "Geometry")
			.with_property("Input", Variant::Proxy(vec![ProxyRef::new(source)]))
			.with_body(Body::Proxy(ProxyState {
				sub_proxies: vec![meridian_proto::SubProxyRef {
					name: "Mapper".into(),
					global_id: mapper,
				}],
			})),
	);
	states.register_state(
		&Message::new(mapper, Location::DATA_SERVER | Location::RENDER_SERVER)
			.with_type("misc", "Mapper")
			.with_property("Scalars", Variant::string("Normals")),
	);
	let locator = SessionProxyLocator::new(Arc::downgrade(&session), states);

	// The representation is registered in its own group, referencing the
	// source that only exists in the locator's states.
	pm.load_state(
		&manager_state(vec![
			reg("representations", "Geometry1", geometry),
			reg("sources", "Sphere1", source),
		]),
		&locator,
	)
	.unwrap();

	let sphere = pm.get_proxy("sources", "Sphere1").unwrap();
	assert_eq!(sphere.global_id(), source);
	assert_eq!(sphere.property("Radius"), Some(Variant::double(7.0)));

	let repr = pm.get_proxy("representations", "Geometry1").unwrap();
	let input = repr.proxy_property("Input");
	assert_eq!(input.len(), 1);
	assert!(Arc::ptr_eq(&input[0], &sphere));
	let sub = repr.sub_proxy("Mapper").unwrap();
	assert_eq!(sub.global_id(), mapper);
	assert_eq!(sub.property("Scalars"), Some(Variant::string("Normals")));
}

#[test]
fn unresolvable_registration_is_skipped() {
	let session = session();
	let pm = session.proxy_manager();
	let locator = session.proxy_locator();
	pm.load_state(
		&manager_state(vec![reg("sources", "Ghost", GlobalId(9999))]),
		&locator,
	)
	.unwrap();
	assert!(pm.registrations().is_empty());
}

#[test]
fn non_manager_state_is_rejected() {
	let session = session();
	let locator = session.proxy_locator();
	let err = session
		.proxy_manager()
		.load_state(&Message::new(GlobalId(12), Location::CLIENT), &locator)
		.unwrap_err();
	assert!(matches!(err, Error::InvalidState(_)));
}

#[test]
fn bulk_update_follows_group_order() {
	let session = session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	let repr = pm.new_proxy("representations", "Geometry").unwrap();
	pm.register_proxy("representations", "Geometry1", &repr).unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();

	let updated = Arc::new(Mutex::new(Vec::new()));
	let sink = updated.clone();
	let _subscription = pm.subscribe(move |event| {
		if let ProxyManagerEvent::ProxyUpdated(r) = event {
			sink.lock().push(r.group.clone());
		}
	});

	repr.set_property("Opacity", Variant::double(0.3)).unwrap();
	sphere.set_property("Radius", Variant::double(2.0)).unwrap();
	pm.update_registered_proxies(true).unwrap();
	assert_eq!(*updated.lock(), vec!["sources", "representations"]);

	pm.update_registered_proxies(true).unwrap();
	assert_eq!(updated.lock().len(), 2);
}

#[test]
fn unregistering_releases_the_proxy() {
	let session = session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	let id = sphere.global_id();
	let weak = Arc::downgrade(&sphere);
	drop(sphere);

	assert!(pm.unregister_proxies_named("sources", "Sphere1").unwrap());
	assert!(weak.upgrade().is_none());
	assert!(session.get_remote_object(id).is_none());
	assert!(matches!(
		session.pull_state(&Message::new(id, Location::DATA_SERVER)),
		Err(Error::Remote(_))
	));
	assert!(!pm.unregister_proxies_named("sources", "Sphere1").unwrap());
}

#[test]
fn prototypes_stay_local() {
	let session = session();
	let pm = session.proxy_manager();
	let proto = pm.prototype("sources", "SphereSource").unwrap();
	assert!(proto.is_prototype());
	assert!(Arc::ptr_eq(&proto, &pm.prototype("sources", "SphereSource").unwrap()));

	proto.set_property("Radius", Variant::double(3.0)).unwrap();
	proto.update_vtk_objects().unwrap();
	assert!(!proto.objects_created());
	assert_eq!(
		proto.pull_state().unwrap().property("Radius"),
		Some(&Variant::double(3.0))
	);
	assert!(proto.identity().peek_global_id().is_none());
}

#[test]
fn reloading_own_state_keeps_registered_prototypes() {
	let session = session();
	let pm = session.proxy_manager();
	let proto = pm.prototype("sources", "SphereSource").unwrap();
	pm.register_proxy("prototypes", "SphereSource", &proto).unwrap();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();

	let (events, _subscription) = registration_events(&session);
	let locator = session.proxy_locator();
	pm.load_state(&pm.full_state(), &locator).unwrap();

	assert!(events.lock().is_empty());
	assert!(pm.get_proxy("prototypes", "SphereSource").is_some());
	assert!(pm.get_proxy("sources", "Sphere1").is_some());
}

#[test]
fn property_links_propagate_and_serialize() {
	let session = session();
	let pm = session.proxy_manager();
	let a = pm.new_proxy("sources", "SphereSource").unwrap();
	let b = pm.new_proxy("sources", "SphereSource").unwrap();
	pm.register_proxy("sources", "A", &a).unwrap();
	pm.register_proxy("sources", "B", &b).unwrap();

	let link = PropertyLink::new("radius");
	link.add_linked_property(&a, "Radius", LinkDirection::Input);
	link.add_linked_property(&b, "Radius", LinkDirection::Output);
	pm.register_link("radius", Link::Property(link)).unwrap();

	a.set_property("Radius", Variant::double(4.0)).unwrap();
	assert_eq!(b.property("Radius"), Some(Variant::double(4.0)));
	b.set_property("Radius", Variant::double(1.0)).unwrap();
	assert_eq!(a.property("Radius"), Some(Variant::double(4.0)));

	let Body::ProxyManager(state) = pm.full_state().body else {
		panic!("expected proxy manager state");
	};
	assert_eq!(state.links.len(), 1);
	assert_eq!(state.links[0].entries.len(), 2);
	assert!(pm.unregister_link("radius").unwrap());
	assert!(pm.get_link("radius").is_none());
}

fn populated() -> Arc<Session> {
	let session = session();
	let pm = session.proxy_manager();
	let sphere = pm.new_proxy("sources", "SphereSource").unwrap();
	sphere.set_property("Radius", Variant::double(2.5)).unwrap();
	pm.register_proxy("sources", "Sphere1", &sphere).unwrap();
	let shrink = pm.new_proxy("filters", "Shrink").unwrap();
	shrink.set_proxy_property("Input", &[sphere]).unwrap();
	pm.register_proxy("filters", "Shrink1", &shrink).unwrap();
	session
}

fn saved(session: &Session) -> XmlElement {
	let text = session
		.proxy_manager()
		.save_xml_state()
		.to_xml_string()
		.unwrap();
	XmlElement::parse(&text).unwrap()
}

#[test]
fn xml_state_round_trips_into_fresh_session() {
	let original = populated();
	let doc = saved(&original);

	let fresh = session();
	fresh.proxy_manager().load_xml_state(&doc, false).unwrap();
	assert_eq!(
		fresh.proxy_manager().registrations(),
		original.proxy_manager().registrations()
	);

	let pm = fresh.proxy_manager();
	let sphere = pm.get_proxy("sources", "Sphere1").unwrap();
	assert_eq!(sphere.property("Radius"), Some(Variant::double(2.5)));
	let shrink = pm.get_proxy("filters", "Shrink1").unwrap();
	assert!(Arc::ptr_eq(&shrink.proxy_property("Input")[0], &sphere));

	let next = fresh.next_global_id().unwrap();
	assert!(next > shrink.global_id());
}

#[test]
fn xml_state_with_live_ids_requires_renumbering() {
	let session = populated();
	let doc = saved(&session);
	let pm = session.proxy_manager();
	let before = pm.registrations();

	let err = pm.load_xml_state(&doc, false).unwrap_err();
	assert!(matches!(err, Error::GlobalIdInUse(_)));

	pm.load_xml_state(&doc, true).unwrap();
	let after = pm.registrations();
	assert_eq!(after.len(), 2 * before.len());

	let copies = pm.get_proxies("filters", "Shrink1");
	assert_eq!(copies.len(), 2);
	let copy = &copies[0];
	assert!(!before.iter().any(|r| r.global_id == copy.global_id()));
	let input = copy.proxy_property("Input");
	assert_eq!(input.len(), 1);
	assert!(!before.iter().any(|r| r.global_id == input[0].global_id()));
}
