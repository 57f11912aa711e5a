//! Minimal owned element tree over `quick_xml` events.
//!
//! Export files are element-only documents (no mixed content), so each element
//! keeps a single optional text value alongside its children. Leaf text is
//! kept exactly as written; whitespace-only text between child elements is
//! layout and is dropped.

use crate::error::StructuralError;
use encoding_rs::{Encoding, UTF_8};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::borrow::Cow;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(Element::text)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First descendant (document order, excluding `self`) with the given name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Element> {
        for child in self.children.iter_mut() {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find_mut(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given name, in document order.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        self.collect_named(name, &mut out);
        out
    }

    fn collect_named<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            }
            child.collect_named(name, out);
        }
    }

    /// Every descendant in document order.
    pub fn descendants(&self) -> Vec<&Element> {
        let mut out = Vec::new();
        self.collect_all(&mut out);
        out
    }

    fn collect_all<'a>(&'a self, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            out.push(child);
            child.collect_all(out);
        }
    }

    pub fn to_xml_string(&self) -> Result<String, StructuralError> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .and_then(|_| write_element(&mut writer, self))
            .map_err(|e| StructuralError::Xml(e.to_string()))?;
        String::from_utf8(writer.into_inner()).map_err(|e| StructuralError::Xml(e.to_string()))
    }
}

fn write_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    element: &Element,
) -> Result<(), quick_xml::Error> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.text.is_none() && element.children.is_empty() {
        return writer.write_event(Event::Empty(start));
    }
    writer.write_event(Event::Start(start))?;
    if let Some(text) = &element.text {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))
}

fn element_from_start(start: &BytesStart) -> Result<Element, StructuralError> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(|e| StructuralError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| StructuralError::Xml(e.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn append_text(element: &mut Element, text: &str) {
    match element.text.as_mut() {
        Some(existing) => existing.push_str(text),
        None => element.text = Some(text.to_string()),
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), StructuralError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(StructuralError::Xml("multiple root elements".to_string()));
    }
    *root = Some(element);
    Ok(())
}

fn declared_encoding(bytes: &[u8]) -> Result<Option<&'static Encoding>, StructuralError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let decl = match reader.read_event_into(&mut buf) {
        Ok(Event::Decl(decl)) => decl,
        _ => return Ok(None),
    };
    match decl.encoding() {
        None => Ok(None),
        Some(Err(e)) => Err(StructuralError::Xml(e.to_string())),
        Some(Ok(label)) => Encoding::for_label(label.as_ref())
            .map(Some)
            .ok_or_else(|| {
                StructuralError::Encoding(format!(
                    "unsupported encoding '{}'",
                    String::from_utf8_lossy(&label)
                ))
            }),
    }
}

/// Raw file bytes to text: byte-order mark first, then the encoding named by
/// the XML declaration, then UTF-8. Bytes invalid in that encoding are an error.
pub fn decode_document(bytes: &[u8]) -> Result<Cow<'_, str>, StructuralError> {
    let (encoding, body) = match Encoding::for_bom(bytes) {
        Some((encoding, bom_len)) => (encoding, &bytes[bom_len..]),
        None => (declared_encoding(bytes)?.unwrap_or(UTF_8), bytes),
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or_else(|| StructuralError::Encoding(format!("bytes invalid as {}", encoding.name())))
}

/// Parse a whole document into its root element.
pub fn parse_document(xml: &str) -> Result<Element, StructuralError> {
    let mut reader = Reader::from_str(xml);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => stack.push(element_from_start(e)?),
            Ok(Event::Empty(ref e)) => {
                let element = element_from_start(e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(ref e)) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| StructuralError::Xml("unexpected closing tag".to_string()))?;
                if element.name.as_bytes() != e.name().as_ref() {
                    return Err(StructuralError::Xml(format!(
                        "closing tag does not match <{}>",
                        element.name
                    )));
                }
                let layout_only = !element.children.is_empty()
                    && element.text.as_deref().map_or(false, |t| t.trim().is_empty());
                if layout_only {
                    element.text = None;
                }
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(ref t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| StructuralError::Xml(e.to_string()))?;
                if let Some(current) = stack.last_mut() {
                    append_text(current, &text);
                }
            }
            Ok(Event::CData(t)) => {
                let bytes = t.into_inner();
                if let Some(current) = stack.last_mut() {
                    append_text(current, &String::from_utf8_lossy(&bytes));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(StructuralError::Xml(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(StructuralError::Xml(format!("unclosed element <{}>", open.name)));
    }
    root.ok_or_else(|| StructuralError::Xml("document has no root element".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<!DOCTYPE RestingECG SYSTEM "restecg.dtd">
<RestingECG>
  <PatientDemographics>
    <PatientID>12345</PatientID>
    <PatientLastName>DOE &amp; SONS</PatientLastName>
  </PatientDemographics>
  <Waveform><WaveformType>Median</WaveformType></Waveform>
  <Waveform kind="rhythm"><WaveformType>Rhythm</WaveformType><Empty/></Waveform>
</RestingECG>"#;

    #[test]
    fn test_parse_and_find() {
        let root = parse_document(DOC).unwrap();
        assert_eq!(root.name, "RestingECG");
        assert_eq!(root.find("PatientID").and_then(Element::text), Some("12345"));
        assert_eq!(
            root.find("PatientLastName").and_then(Element::text),
            Some("DOE & SONS")
        );
        let waveforms = root.find_all("Waveform");
        assert_eq!(waveforms.len(), 2);
        assert_eq!(waveforms[1].child_text("WaveformType"), Some("Rhythm"));
        assert_eq!(
            waveforms[1].attributes,
            vec![("kind".to_string(), "rhythm".to_string())]
        );
        assert!(waveforms[1].child("Empty").is_some());
    }

    #[test]
    fn test_find_is_document_order() {
        let root = parse_document("<a><b><c>1</c></b><c>2</c></a>").unwrap();
        assert_eq!(root.find("c").and_then(Element::text), Some("1"));
    }

    #[test]
    fn test_find_mut_edits_in_place() {
        let mut root = parse_document(DOC).unwrap();
        root.find_mut("PatientID").unwrap().text = Some("p1234abcd".to_string());
        assert_eq!(root.find("PatientID").and_then(Element::text), Some("p1234abcd"));
    }

    #[test]
    fn test_serialize_round_trip() {
        let root = parse_document(DOC).unwrap();
        let xml = root.to_xml_string().unwrap();
        assert!(xml.contains("DOE &amp; SONS"));
        assert_eq!(parse_document(&xml).unwrap(), root);
    }

    #[test]
    fn test_leaf_text_kept_verbatim() {
        let root = parse_document(
            "<a>\n  <b> DOE </b>\n  <c>   </c>\n  <d></d>\n  <e>x\n y</e>\n</a>",
        )
        .unwrap();
        assert_eq!(root.text, None);
        assert_eq!(root.child_text("b"), Some(" DOE "));
        assert_eq!(root.child_text("c"), Some("   "));
        assert_eq!(root.child_text("d"), None);
        assert_eq!(root.child_text("e"), Some("x\n y"));
    }

    #[test]
    fn test_decode_follows_declaration() {
        let latin1 = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><a>REN\xC9</a>";
        assert_eq!(decode_document(latin1).unwrap(), "<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><a>REN\u{C9}</a>");

        let utf8 = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><a>REN\u{C9}</a>";
        assert_eq!(decode_document(utf8.as_bytes()).unwrap(), utf8);

        let undeclared = "<a>REN\u{C9}</a>";
        assert_eq!(decode_document(undeclared.as_bytes()).unwrap(), undeclared);

        let mut bom = vec![0xEF, 0xBB, 0xBF];
        bom.extend_from_slice(undeclared.as_bytes());
        assert_eq!(decode_document(&bom).unwrap(), undeclared);
    }

    #[test]
    fn test_decode_rejects_bad_bytes_and_unknown_encodings() {
        assert!(matches!(
            decode_document(b"<a>REN\xC9</a>"),
            Err(StructuralError::Encoding(_))
        ));
        assert!(matches!(
            decode_document(b"<?xml version=\"1.0\" encoding=\"X-NOPE\"?><a/>"),
            Err(StructuralError::Encoding(_))
        ));
    }

    #[test]
    fn test_malformed_documents_rejected() {
        assert!(parse_document("<a><b></a>").is_err());
        assert!(parse_document("<a>").is_err());
        assert!(parse_document("").is_err());
        assert!(parse_document("<a/><b/>").is_err());
    }
}
