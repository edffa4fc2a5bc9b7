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


//! PDF object model
//!
//! Just enough structure to decrypt and rewrite a file: numbers keep their
//! original spelling, names keep their raw (possibly `#`-escaped) bytes and
//! dictionaries keep key order.

use std::collections::BTreeMap;

/// How a string was written in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    Literal,
    Hex,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Null,
    Bool(bool),
    Integer(i64),
    /// Real number as written
    Real(String),
    String(Vec<u8>, StringFormat),
    /// Name without the leading `/`
    Name(Vec<u8>),
    Array(Vec<Object>),
    Dictionary(Dictionary),
    Stream(Stream),
    Reference(u32, u16),
}

impl Object {
    pub fn name(name: &str) -> Self {
        Object::Name(name.as_bytes().to_vec())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Object::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&[u8]> {
        match self {
            Object::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dictionary> {
        match self {
            Object::Dictionary(d) => Some(d),
            Object::Stream(s) => Some(&s.dict),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<(u32, u16)> {
        match self {
            Object::Reference(n, g) => Some((*n, *g)),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&[u8]> {
        match self {
            Object::String(s, _) => Some(s),
            _ => None,
        }
    }
}

/// Ordered dictionary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    entries: Vec<(Vec<u8>, Object)>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Object> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == key.as_bytes())
            .map(|(_, v)| v)
    }

    /// Insert or replace, keeping the original position
    pub fn set(&mut self, key: &str, value: Object) {
        match self.entries.iter_mut().find(|(k, _)| k.as_slice() == key.as_bytes()) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.as_bytes().to_vec(), value)),
        }
    }

    pub(crate) fn push_raw(&mut self, key: Vec<u8>, value: Object) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Object> {
        let index = self
            .entries
            .iter()
            .position(|(k, _)| k.as_slice() == key.as_bytes())?;
        Some(self.entries.remove(index).1)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Object::as_i64)
    }

    pub fn get_name(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Object::as_name)
    }

    /// `/Type` equals `name`
    pub fn is_type(&self, name: &str) -> bool {
        self.get_name("Type") == Some(name.as_bytes())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Object)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub dict: Dictionary,
    /// Raw (still filtered) stream bytes
    pub data: Vec<u8>,
}

impl Stream {
    /// Filter names, whether `/Filter` is a name or an array
    pub fn filters(&self) -> Vec<&[u8]> {
        match self.dict.get("Filter") {
            Some(Object::Name(n)) => vec![n.as_slice()],
            Some(Object::Array(items)) => items.iter().filter_map(Object::as_name).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndirectObject {
    pub generation: u16,
    pub object: Object,
}

/// Parsed file: header version, objects by number, merged trailer
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub version: String,
    pub objects: BTreeMap<u32, IndirectObject>,
    pub trailer: Dictionary,
}

impl Document {
    pub fn get(&self, number: u32) -> Option<&Object> {
        self.objects.get(&number).map(|o| &o.object)
    }

    /// Follow a reference (one level); direct objects are returned as is
    pub fn resolve<'a>(&'a self, object: &'a Object) -> Option<&'a Object> {
        match object {
            Object::Reference(n, _) => self.get(*n),
            other => Some(other),
        }
    }

    /// The trailer's `/Encrypt` dictionary, resolved
    pub fn encrypt_dict(&self) -> Option<&Dictionary> {
        self.trailer
            .get("Encrypt")
            .and_then(|o| self.resolve(o))
            .and_then(Object::as_dict)
    }

    /// Object number holding the encryption dictionary, if indirect
    pub fn encrypt_ref(&self) -> Option<u32> {
        self.trailer
            .get("Encrypt")
            .and_then(Object::as_reference)
            .map(|(n, _)| n)
    }
}
