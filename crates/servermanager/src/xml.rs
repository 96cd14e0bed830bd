//! Minimal attribute-only XML DOM for state files.

use std::str;

use meridian_proto::{GlobalId, ProxyRef, Variant};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// XML parse and write errors.
#[derive(Debug, Error)]
pub enum XmlError {
	/// Malformed document.
	#[error("malformed XML: {0}")]
	Syntax(#[from] quick_xml::Error),
	/// Non UTF-8 names.
	#[error("invalid UTF-8 in XML: {0}")]
	Utf8(#[from] str::Utf8Error),
	/// Mismatched or missing tags.
	#[error("invalid XML structure: {0}")]
	Structure(String),
	/// Writing failed.
	#[error("XML write failed: {0}")]
	Io(#[from] std::io::Error),
	/// A required attribute is missing or unparsable.
	#[error("element <{element}> has invalid attribute {attribute:?}")]
	Attribute {
		/// Element name.
		element: String,
		/// Attribute name.
		attribute: String,
	},
}

/// XML element with ordered attributes and child elements.
///
/// Text content is ignored on parse and never written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
	name: String,
	attributes: Vec<(String, String)>,
	children: Vec<XmlElement>,
}

impl XmlElement {
	/// Empty element called `name`.
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Self::default()
		}
	}

	/// Element name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Attribute value.
	pub fn attribute(&self, key: &str) -> Option<&str> {
		self.attributes
			.iter()
			.find(|(k, _)| k == key)
			.map(|(_, v)| v.as_str())
	}

	/// Attribute value, or [`XmlError::Attribute`] when missing.
	pub fn required(&self, key: &str) -> Result<&str, XmlError> {
		self.attribute(key).ok_or_else(|| self.invalid(key))
	}

	/// Attribute parsed with [`str::parse`].
	pub fn parse_attribute<T: str::FromStr>(&self, key: &str) -> Result<T, XmlError> {
		self.required(key)?.parse().map_err(|_| self.invalid(key))
	}

	/// Sets or replaces an attribute.
	pub fn set_attribute(&mut self, key: impl Into<String>, value: impl ToString) {
		let key = key.into();
		let value = value.to_string();
		match self.attributes.iter_mut().find(|(k, _)| *k == key) {
			Some(slot) => slot.1 = value,
			None => self.attributes.push((key, value)),
		}
	}

	/// Builder form of [`set_attribute`](Self::set_attribute).
	pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
		self.set_attribute(key, value);
		self
	}

	/// Child elements in document order.
	pub fn children(&self) -> &[XmlElement] {
		&self.children
	}

	/// Children called `name`.
	pub fn children_named<'a, 'n>(
		&'a self,
		name: &'n str,
	) -> impl Iterator<Item = &'a XmlElement> + use<'a, 'n> {
		self.children.iter().filter(move |c| c.name == name)
	}

	/// First child called `name`.
	pub fn child(&self, name: &str) -> Option<&XmlElement> {
		self.children_named(name).next()
	}

	/// Appends a child element.
	pub fn push_child(&mut self, child: XmlElement) {
		self.children.push(child);
	}

	/// Builder form of [`push_child`](Self::push_child).
	pub fn with_child(mut self, child: XmlElement) -> Self {
		self.push_child(child);
		self
	}

	/// Parses the root element of a document.
	pub fn parse(input: &str) -> Result<Self, XmlError> {
		let mut reader = Reader::from_str(input);
		reader.config_mut().trim_text(true);
		let mut stack: Vec<XmlElement> = Vec::new();

		loop {
			match reader.read_event()? {
				Event::Start(start) => stack.push(element_from(&start)?),
				Event::Empty(start) => {
					let element = element_from(&start)?;
					match stack.last_mut() {
						Some(parent) => parent.children.push(element),
						None => return Ok(element),
					}
				}
				Event::End(end) => {
					let element = stack
						.pop()
						.ok_or_else(|| XmlError::Structure("unexpected closing tag".into()))?;
					let qname = end.name();
					let end_name = str::from_utf8(qname.as_ref())?;
					if end_name != element.name {
						return Err(XmlError::Structure(format!(
							"<{}> closed by </{end_name}>",
							element.name
						)));
					}
					match stack.last_mut() {
						Some(parent) => parent.children.push(element),
						None => return Ok(element),
					}
				}
				Event::Eof => return Err(XmlError::Structure("missing root element".into())),
				_ => {}
			}
		}
	}

	/// Serializes the element as an indented document with declaration.
	pub fn to_xml_string(&self) -> Result<String, XmlError> {
		let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
		writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
		self.write_to(&mut writer)?;
		String::from_utf8(writer.into_inner())
			.map_err(|e| XmlError::Utf8(e.utf8_error()))
	}

	fn write_to(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), XmlError> {
		let mut start = BytesStart::new(self.name.as_str());
		for (key, value) in &self.attributes {
			start.push_attribute((key.as_str(), value.as_str()));
		}
		if self.children.is_empty() {
			writer.write_event(Event::Empty(start))?;
			return Ok(());
		}
		writer.write_event(Event::Start(start))?;
		for child in &self.children {
			child.write_to(writer)?;
		}
		writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
		Ok(())
	}

	pub(crate) fn invalid(&self, key: &str) -> XmlError {
		XmlError::Attribute {
			element: self.name.clone(),
			attribute: key.to_string(),
		}
	}
}

/// `<Property>` element holding a named value.
///
/// Scalars become `<Element index value/>` children, proxy references
/// `<Proxy value output_port/>` children.
pub fn property_element(name: &str, value: &Variant) -> XmlElement {
	let mut element = XmlElement::new("Property")
		.with_attribute("name", name)
		.with_attribute("type", value.kind_name())
		.with_attribute("number_of_elements", value.len());
	match value {
		Variant::Proxy(refs) => {
			for r in refs {
				element.push_child(
					XmlElement::new("Proxy")
						.with_attribute("value", r.id)
						.with_attribute("output_port", r.port),
				);
			}
		}
		_ => {
			for (index, item) in value.elements().into_iter().enumerate() {
				element.push_child(
					XmlElement::new("Element")
						.with_attribute("index", index)
						.with_attribute("value", item),
				);
			}
		}
	}
	element
}

/// Inverse of [`property_element`]: `(name, value)`.
pub fn property_value(element: &XmlElement) -> Result<(String, Variant), XmlError> {
	let name = element.required("name")?.to_string();
	let kind = element.required("type")?;
	if kind == "proxy" {
		let refs = element
			.children_named("Proxy")
			.map(|p| {
				Ok(ProxyRef {
					id: GlobalId(p.parse_attribute("value")?),
					port: match p.attribute("output_port") {
						Some(_) => p.parse_attribute("output_port")?,
						None => 0,
					},
				})
			})
			.collect::<Result<Vec<_>, XmlError>>()?;
		return Ok((name, Variant::Proxy(refs)));
	}
	let items = element
		.children_named("Element")
		.map(|e| e.required("value").map(str::to_string))
		.collect::<Result<Vec<_>, XmlError>>()?;
	let value = Variant::from_elements(kind, &items).ok_or_else(|| element.invalid("type"))?;
	Ok((name, value))
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, XmlError> {
	let mut element = XmlElement::new(str::from_utf8(start.name().as_ref())?);
	for attr in start.attributes() {
		let attr = attr.map_err(quick_xml::Error::from)?;
		let key = str::from_utf8(attr.key.as_ref())?.to_string();
		let value = attr.unescape_value()?.into_owned();
		element.attributes.push((key, value));
	}
	Ok(element)
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn parse_nested_document() {
		let doc = r#"<?xml version="1.0"?>
			<Root version="1">
				<Item id="11" name="a &amp; b"/>
				<Group><Item id="12"/></Group>
			</Root>"#;
		let root = XmlElement::parse(doc).unwrap();
		assert_eq!(root.name(), "Root");
		assert_eq!(root.attribute("version"), Some("1"));
		let item = root.child("Item").unwrap();
		assert_eq!(item.parse_attribute::<u32>("id").unwrap(), 11);
		assert_eq!(item.attribute("name"), Some("a & b"));
		assert_eq!(root.child("Group").unwrap().children().len(), 1);
	}

	#[test]
	fn write_then_parse_preserves_tree() {
		let tree = XmlElement::new("State")
			.with_attribute("version", "5.11.0")
			.with_child(XmlElement::new("Proxy").with_attribute("name", "<quoted>"))
			.with_child(XmlElement::new("Empty"));
		let text = tree.to_xml_string().unwrap();
		assert!(text.starts_with("<?xml"));
		assert_eq!(XmlElement::parse(&text).unwrap(), tree);
	}

	#[test]
	fn mismatched_tags_fail() {
		assert!(matches!(
			XmlElement::parse("<a><b></a>"),
			Err(XmlError::Structure(_) | XmlError::Syntax(_))
		));
		assert!(XmlElement::parse("").is_err());
	}

	#[test]
	fn property_elements_keep_kind() {
		let values = [
			Variant::Double(vec![1.5, -2.0]),
			Variant::Str(vec!["a b".into()]),
			Variant::Proxy(vec![ProxyRef { id: GlobalId(12), port: 1 }]),
			Variant::Int(vec![]),
		];
		for value in values {
			let element = property_element("P", &value);
			let (name, parsed) = property_value(&element).unwrap();
			assert_eq!(name, "P");
			assert_eq!(parsed, value);
		}
	}

	#[test]
	fn missing_attribute_is_reported() {
		let e = XmlElement::new("Proxy");
		assert!(matches!(e.required("id"), Err(XmlError::Attribute { .. })));
	}
}
