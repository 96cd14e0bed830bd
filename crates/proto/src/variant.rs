//! Property values.

use serde::{Deserialize, Serialize};

use crate::ids::GlobalId;

/// Reference from a proxy-valued property to another object's output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyRef {
	/// Referenced object.
	pub id: GlobalId,
	/// Output port on the referenced object.
	pub port: u32,
}

impl ProxyRef {
	/// Reference to port 0 of `id`.
	pub fn new(id: GlobalId) -> Self {
		Self { id, port: 0 }
	}
}

/// Value of a named property. Every property is a vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variant {
	/// Integer elements.
	Int(Vec<i64>),
	/// Floating point elements.
	Double(Vec<f64>),
	/// String elements.
	Str(Vec<String>),
	/// Proxy references (input connections, proxy lists).
	Proxy(Vec<ProxyRef>),
}

impl Variant {
	/// Single-element integer value.
	pub fn int(v: i64) -> Self {
		Self::Int(vec![v])
	}

	/// Single-element double value.
	pub fn double(v: f64) -> Self {
		Self::Double(vec![v])
	}

	/// Single-element string value.
	pub fn string(v: impl Into<String>) -> Self {
		Self::Str(vec![v.into()])
	}

	/// Number of elements.
	pub fn len(&self) -> usize {
		match self {
			Self::Int(v) => v.len(),
			Self::Double(v) => v.len(),
			Self::Str(v) => v.len(),
			Self::Proxy(v) => v.len(),
		}
	}

	/// Returns `true` if the value has no elements.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// First element as `f64`, converting integers.
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Self::Double(v) => v.first().copied(),
			Self::Int(v) => v.first().map(|i| *i as f64),
			_ => None,
		}
	}

	/// First element as `i64`.
	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Self::Int(v) => v.first().copied(),
			_ => None,
		}
	}

	/// First element as a string slice.
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::Str(v) => v.first().map(String::as_str),
			_ => None,
		}
	}

	/// Proxy references, if this is a proxy-valued property.
	pub fn proxies(&self) -> &[ProxyRef] {
		match self {
			Self::Proxy(v) => v,
			_ => &[],
		}
	}

	/// Name of the element type, as written in XML state files.
	pub fn kind_name(&self) -> &'static str {
		match self {
			Self::Int(_) => "int",
			Self::Double(_) => "double",
			Self::Str(_) => "string",
			Self::Proxy(_) => "proxy",
		}
	}

	/// Elements rendered as strings, as written in XML state files.
	pub fn elements(&self) -> Vec<String> {
		match self {
			Self::Int(v) => v.iter().map(ToString::to_string).collect(),
			Self::Double(v) => v.iter().map(ToString::to_string).collect(),
			Self::Str(v) => v.clone(),
			Self::Proxy(v) => v.iter().map(|r| format!("{}:{}", r.id, r.port)).collect(),
		}
	}

	/// Rebuilds a value from [`kind_name`](Self::kind_name) and
	/// [`elements`](Self::elements). Returns `None` on unknown kinds or
	/// malformed elements.
	pub fn from_elements(kind: &str, elements: &[String]) -> Option<Self> {
		match kind {
			"int" => elements
				.iter()
				.map(|e| e.parse().ok())
				.collect::<Option<Vec<_>>>()
				.map(Self::Int),
			"double" => elements
				.iter()
				.map(|e| e.parse().ok())
				.collect::<Option<Vec<_>>>()
				.map(Self::Double),
			"string" => Some(Self::Str(elements.to_vec())),
			"proxy" => elements
				.iter()
				.map(|e| {
					let (id, port) = e.split_once(':').unwrap_or((e.as_str(), "0"));
					Some(ProxyRef {
						id: GlobalId(id.parse().ok()?),
						port: port.parse().ok()?,
					})
				})
				.collect::<Option<Vec<_>>>()
				.map(Self::Proxy),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn elements_rebuild() {
		let v = Variant::Proxy(vec![ProxyRef { id: GlobalId(12), port: 1 }]);
		assert_eq!(v.elements(), vec!["12:1".to_string()]);
		assert_eq!(Variant::from_elements(v.kind_name(), &v.elements()), Some(v));
		assert_eq!(
			Variant::from_elements("double", &["2.5".into()]),
			Some(Variant::double(2.5))
		);
		assert_eq!(Variant::from_elements("int", &["x".into()]), None);
		assert_eq!(Variant::from_elements("blob", &[]), None);
	}

	#[test]
	fn scalar_accessors() {
		assert_eq!(Variant::int(3).as_f64(), Some(3.0));
		assert_eq!(Variant::string("a").as_str(), Some("a"));
		assert!(Variant::double(1.0).proxies().is_empty());
	}
}
