// book-loader - ebook DRM removal core
// Copyright (C) 2025 book-loader contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Minimal namespace-aware XML element tree
//!
//! ADEPT documents (vouchers, activation records, fulfillment requests and
//! responses, license tokens) are small XML documents. They need three
//! things from an XML layer:
//! - lookup of elements by local name regardless of the prefix in use
//! - verbatim re-embedding of a parsed subtree (the voucher token is copied
//!   into the fulfillment request)
//! - a stable view of namespace, local name, attributes and text for the
//!   signature tree hash (see `signing.rs`)
//!
//! Parsing uses quick-xml's `NsReader`; whitespace-only text is dropped.

use crate::error::{LoaderError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use std::fmt::Write as _;

/// ADEPT namespace
pub const ADEPT_NS: &str = "http://ns.adobe.com/adept";

/// Dublin Core namespace (voucher metadata)
pub const DC_NS: &str = "http://purl.org/dc/elements/1.1/";

/// XML node: element or non-blank text
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// Attribute as written in the document
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Qualified name, e.g. `method` or `xmlns:adept`
    pub qname: String,
    pub value: String,
}

impl Attribute {
    /// Local part of the attribute name
    pub fn local_name(&self) -> &str {
        self.qname.rsplit(':').next().unwrap_or(&self.qname)
    }

    /// `xmlns` / `xmlns:*` declarations
    pub fn is_namespace_decl(&self) -> bool {
        self.qname == "xmlns" || self.qname.starts_with("xmlns:")
    }
}

/// XML element with resolved namespace
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Qualified name as written, e.g. `adept:fulfill`
    pub qname: String,
    /// Resolved namespace URI
    pub namespace: Option<String>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    /// Create an element; `qname` may carry a prefix
    pub fn new<S: Into<String>>(qname: S, namespace: Option<&str>) -> Self {
        Self {
            qname: qname.into(),
            namespace: namespace.map(str::to_string),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Element in the ADEPT namespace using the `adept:` prefix
    pub fn adept(local_name: &str) -> Self {
        Self::new(format!("adept:{}", local_name), Some(ADEPT_NS))
    }

    pub fn with_attr<K: Into<String>, V: Into<String>>(mut self, qname: K, value: V) -> Self {
        self.attributes.push(Attribute {
            qname: qname.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_text<S: Into<String>>(mut self, text: S) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Local part of the element name
    pub fn local_name(&self) -> &str {
        self.qname.rsplit(':').next().unwrap_or(&self.qname)
    }

    /// Attribute value by qualified or local name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.qname == name || a.local_name() == name)
            .map(|a| a.value.as_str())
    }

    /// Child elements in document order
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child with the given local name
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.elements().find(|e| e.local_name() == local_name)
    }

    /// First descendant (depth-first, self excluded) with the given local name
    pub fn find(&self, local_name: &str) -> Option<&Element> {
        for child in self.elements() {
            if child.local_name() == local_name {
                return Some(child);
            }
            if let Some(found) = child.find(local_name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given local name, depth-first
    pub fn find_all<'a>(&'a self, local_name: &str, out: &mut Vec<&'a Element>) {
        for child in self.elements() {
            if child.local_name() == local_name {
                out.push(child);
            }
            child.find_all(local_name, out);
        }
    }

    /// Concatenated direct text, trimmed
    pub fn text(&self) -> String {
        let mut text = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                text.push_str(t);
            }
        }
        text.trim().to_string()
    }

    /// Trimmed text of the first descendant with the given local name
    pub fn find_text(&self, local_name: &str) -> Option<String> {
        self.find(local_name)
            .map(|e| e.text())
            .filter(|t| !t.is_empty())
    }

    /// Serialize this element (no XML declaration)
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    /// Serialize as a standalone document with XML declaration
    pub fn to_document(&self) -> String {
        format!("<?xml version=\"1.0\"?>\n{}", self.to_xml())
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.qname);
        for attr in &self.attributes {
            let _ = write!(
                out,
                " {}=\"{}\"",
                attr.qname,
                quick_xml::escape::escape(attr.value.as_str())
            );
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_to(out),
                Node::Text(t) => out.push_str(&quick_xml::escape::escape(t.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.qname);
        out.push('>');
    }
}

/// Parse a document and return its root element
pub fn parse(xml: &str) -> Result<Element> {
    let mut reader = NsReader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (ns, event) = reader.read_resolved_event()?;
        let namespace = resolved_namespace(ns)?;

        match event {
            Event::Start(start) => {
                stack.push(start_element(&start, namespace)?);
            }
            Event::Empty(start) => {
                let element = start_element(&start, namespace)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| LoaderError::InvalidData("Unbalanced XML end tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let text = text.unescape()?.into_owned();
                if !text.trim().is_empty() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text));
                    }
                }
            }
            Event::CData(data) => {
                let text = String::from_utf8(data.into_inner().into_owned())?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(text));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(LoaderError::InvalidData("Unclosed XML element".to_string()));
    }

    root.ok_or_else(|| LoaderError::InvalidData("XML document has no root element".to_string()))
}

/// Parse raw bytes, accepting UTF-8 (with or without BOM) and UTF-16LE with BOM
pub fn parse_bytes(bytes: &[u8]) -> Result<Element> {
    if let Some(utf16) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        if utf16.len() % 2 != 0 {
            return Err(LoaderError::InvalidData("Truncated UTF-16 document".to_string()));
        }
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16(&units)
            .map_err(|e| LoaderError::InvalidData(format!("Invalid UTF-16 document: {}", e)))?;
        return parse(&text);
    }

    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    let text = std::str::from_utf8(bytes)
        .map_err(|e| LoaderError::InvalidData(format!("Invalid UTF-8 document: {}", e)))?;
    parse(text)
}

fn resolved_namespace(ns: ResolveResult) -> Result<Option<String>> {
    match ns {
        ResolveResult::Bound(namespace) => Ok(Some(
            String::from_utf8_lossy(namespace.as_ref()).into_owned(),
        )),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(LoaderError::InvalidData(format!(
            "Unknown XML namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn start_element(start: &BytesStart, namespace: Option<String>) -> Result<Element> {
    let qname = String::from_utf8(start.name().as_ref().to_vec())?;
    let mut attributes = Vec::new();

    for attr in start.attributes() {
        let attr = attr?;
        attributes.push(Attribute {
            qname: String::from_utf8(attr.key.as_ref().to_vec())?,
            value: attr.unescape_value()?.into_owned(),
        });
    }

    Ok(Element {
        qname,
        namespace,
        attributes,
        children: Vec::new(),
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(LoaderError::InvalidData(
            "XML document has more than one root element".to_string(),
        )),
    }
}
