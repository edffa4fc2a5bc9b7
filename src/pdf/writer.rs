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


//! PDF serialization with a classic cross-reference table

use crate::pdf::object::{Dictionary, Document, Object, StringFormat};
use std::io::Write;

/// Serialize a single object
pub fn write_object(out: &mut Vec<u8>, object: &Object) {
    match object {
        Object::Null => out.extend_from_slice(b"null"),
        Object::Bool(true) => out.extend_from_slice(b"true"),
        Object::Bool(false) => out.extend_from_slice(b"false"),
        Object::Integer(i) => {
            let _ = write!(out, "{}", i);
        }
        Object::Real(r) => out.extend_from_slice(r.as_bytes()),
        Object::String(bytes, StringFormat::Hex) => {
            out.push(b'<');
            out.extend_from_slice(hex::encode(bytes).as_bytes());
            out.push(b'>');
        }
        Object::String(bytes, StringFormat::Literal) => write_literal(out, bytes),
        Object::Name(name) => {
            out.push(b'/');
            out.extend_from_slice(name);
        }
        Object::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                write_object(out, item);
            }
            out.push(b']');
        }
        Object::Dictionary(dict) => write_dictionary(out, dict),
        Object::Stream(stream) => {
            let mut dict = stream.dict.clone();
            dict.set("Length", Object::Integer(stream.data.len() as i64));
            write_dictionary(out, &dict);
            out.extend_from_slice(b"\nstream\n");
            out.extend_from_slice(&stream.data);
            out.extend_from_slice(b"\nendstream");
        }
        Object::Reference(n, g) => {
            let _ = write!(out, "{} {} R", n, g);
        }
    }
}

fn write_dictionary(out: &mut Vec<u8>, dict: &Dictionary) {
    out.extend_from_slice(b"<<");
    for (key, value) in dict.iter() {
        out.push(b'/');
        out.extend_from_slice(key);
        out.push(b' ');
        write_object(out, value);
        out.push(b' ');
    }
    out.extend_from_slice(b">>");
}

fn write_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'(');
    for &b in bytes {
        match b {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(b);
            }
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\n' => out.extend_from_slice(b"\\n"),
            other => out.push(other),
        }
    }
    out.push(b')');
}

/// Serialize a whole document: header, objects in number order, xref, trailer
pub fn write_document(document: &Document) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = write!(out, "%PDF-{}\n", document.version);
    out.extend_from_slice(b"%\xE2\xE3\xCF\xD3\n");

    let size = document.objects.keys().next_back().map(|n| n + 1).unwrap_or(1);
    let mut offsets: Vec<Option<(usize, u16)>> = vec![None; size as usize];

    for (number, indirect) in &document.objects {
        offsets[*number as usize] = Some((out.len(), indirect.generation));
        let _ = write!(out, "{} {} obj\n", number, indirect.generation);
        write_object(&mut out, &indirect.object);
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_offset = out.len();
    let _ = write!(out, "xref\n0 {}\n", size);
    out.extend_from_slice(b"0000000000 65535 f \n");
    for entry in offsets.iter().skip(1) {
        match entry {
            Some((offset, generation)) => {
                let _ = write!(out, "{:010} {:05} n \n", offset, generation);
            }
            None => out.extend_from_slice(b"0000000000 65535 f \n"),
        }
    }

    let mut trailer = Dictionary::new();
    trailer.set("Size", Object::Integer(i64::from(size)));
    for key in ["Root", "Info", "ID"] {
        if let Some(value) = document.trailer.get(key) {
            trailer.set(key, value.clone());
        }
    }

    out.extend_from_slice(b"trailer\n");
    write_dictionary(&mut out, &trailer);
    let _ = write!(out, "\nstartxref\n{}\n%%EOF\n", xref_offset);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::object::{IndirectObject, Stream};
    use crate::pdf::parser::{parse_document, Lexer};

    #[test]
    fn test_literal_escaping_reparses() {
        let original = Object::String(b"a(b)\\c\r\nd".to_vec(), StringFormat::Literal);
        let mut out = Vec::new();
        write_object(&mut out, &original);
        assert_eq!(Lexer::new(&out, 0).parse_object().unwrap(), original);
    }

    #[test]
    fn test_document_reparses_with_xref() {
        let mut doc = Document {
            version: "1.6".to_string(),
            ..Default::default()
        };
        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::name("Catalog"));
        doc.objects.insert(1, IndirectObject { generation: 0, object: Object::Dictionary(catalog) });
        doc.objects.insert(
            3,
            IndirectObject {
                generation: 0,
                object: Object::Stream(Stream { dict: Dictionary::new(), data: b"BT ET".to_vec() }),
            },
        );
        doc.trailer.set("Root", Object::Reference(1, 0));
        doc.trailer.set("Encrypt", Object::Reference(9, 0));

        let bytes = write_document(&doc);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("xref\n0 4\n"));
        assert!(!text.contains("/Encrypt"));

        let reparsed = parse_document(&bytes).unwrap();
        assert_eq!(reparsed.trailer.get("Root"), Some(&Object::Reference(1, 0)));
        match reparsed.get(3).unwrap() {
            Object::Stream(s) => {
                assert_eq!(s.data, b"BT ET");
                assert_eq!(s.dict.get_i64("Length"), Some(5));
            }
            other => panic!("{:?}", other),
        }
    }
}
