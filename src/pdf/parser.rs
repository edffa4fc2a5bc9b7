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


//! Tolerant PDF reader
//!
//! The cross-reference table is not trusted. Instead the whole file is
//! scanned for `N G obj` headers, each object is parsed in place and the
//! scan resumes after its `endobj`, so stream bodies are never mistaken for
//! object headers. Later definitions of an object number replace earlier
//! ones (incremental updates append).
//!
//! Stream length: a direct `/Length` is used when `endstream` follows it;
//! otherwise the body runs to the next `endstream` keyword.
//!
//! The trailer is merged from every `trailer` dictionary and every
//! `/Type /XRef` stream dictionary, in file order.

use crate::error::{LoaderError, Result};
use crate::pdf::object::{Dictionary, Document, IndirectObject, Object, Stream, StringFormat};
use lazy_static::lazy_static;
use regex::bytes::Regex;
use tracing::debug;

lazy_static! {
    static ref OBJ_HEADER: Regex =
        Regex::new(r"(?-u)([0-9]{1,10})[ \t\r\n\x0C\x00]+([0-9]{1,5})[ \t\r\n\x0C\x00]+obj").unwrap();
}

/// Trailer keys carried into the rewritten file
const TRAILER_KEYS: [&str; 4] = ["Root", "Info", "Encrypt", "ID"];

fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'\x0C' | b'\0')
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

fn is_regular(b: u8) -> bool {
    !is_whitespace(b) && !is_delimiter(b)
}

/// Position of `needle` in `haystack` at or after `from`
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Byte-level object parser
pub struct Lexer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.data.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &[u8]) -> bool {
        self.data[self.pos.min(self.data.len())..].starts_with(s)
    }

    fn error(&self, message: &str) -> LoaderError {
        LoaderError::InvalidDrmFormat(format!("PDF syntax error at byte {}: {}", self.pos, message))
    }

    pub fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if is_whitespace(b) {
                self.pos += 1;
            } else if b == b'%' {
                while let Some(c) = self.peek() {
                    if c == b'\r' || c == b'\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn read_regular(&mut self) -> &'a [u8] {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if is_regular(b)) {
            self.pos += 1;
        }
        let data = self.data;
        &data[start..self.pos]
    }

    /// Parse one direct object
    pub fn parse_object(&mut self) -> Result<Object> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(self.error("unexpected end of data")),
            Some(b'<') if self.peek_at(1) == Some(b'<') => self.parse_dictionary().map(Object::Dictionary),
            Some(b'<') => self.parse_hex_string(),
            Some(b'(') => self.parse_literal_string(),
            Some(b'[') => self.parse_array(),
            Some(b'/') => {
                self.pos += 1;
                Ok(Object::Name(self.read_regular().to_vec()))
            }
            Some(b) if b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.') => self.parse_number(),
            Some(_) => {
                let token = self.read_regular();
                match token {
                    b"true" => Ok(Object::Bool(true)),
                    b"false" => Ok(Object::Bool(false)),
                    b"null" => Ok(Object::Null),
                    b"" => {
                        let unexpected = self.peek().unwrap_or_default();
                        Err(self.error(&format!("unexpected character '{}'", unexpected as char)))
                    }
                    other => Err(self.error(&format!(
                        "unexpected token '{}'",
                        String::from_utf8_lossy(other)
                    ))),
                }
            }
        }
    }

    fn parse_dictionary(&mut self) -> Result<Dictionary> {
        self.pos += 2;
        let mut dict = Dictionary::new();
        loop {
            self.skip_whitespace();
            if self.starts_with(b">>") {
                self.pos += 2;
                return Ok(dict);
            }
            match self.peek() {
                Some(b'/') => {
                    self.pos += 1;
                    let key = self.read_regular().to_vec();
                    let value = self.parse_object()?;
                    dict.push_raw(key, value);
                }
                Some(_) => return Err(self.error("expected name key in dictionary")),
                None => return Err(self.error("unterminated dictionary")),
            }
        }
    }

    fn parse_array(&mut self) -> Result<Object> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Object::Array(items));
                }
                Some(_) => items.push(self.parse_object()?),
                None => return Err(self.error("unterminated array")),
            }
        }
    }

    fn parse_hex_string(&mut self) -> Result<Object> {
        self.pos += 1;
        let mut digits = Vec::new();
        loop {
            match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b) if b.is_ascii_hexdigit() => {
                    digits.push(b);
                    self.pos += 1;
                }
                Some(b) if is_whitespace(b) => self.pos += 1,
                Some(_) => return Err(self.error("invalid hex string")),
                None => return Err(self.error("unterminated hex string")),
            }
        }
        if digits.len() % 2 == 1 {
            digits.push(b'0');
        }
        let bytes = hex::decode(&digits).map_err(|e| self.error(&e.to_string()))?;
        Ok(Object::String(bytes, StringFormat::Hex))
    }

    fn parse_literal_string(&mut self) -> Result<Object> {
        self.pos += 1;
        let mut out = Vec::new();
        let mut depth = 1;

        loop {
            let Some(b) = self.peek() else {
                return Err(self.error("unterminated string"));
            };
            self.pos += 1;
            match b {
                b'\\' => {
                    let Some(e) = self.peek() else {
                        return Err(self.error("unterminated escape"));
                    };
                    self.pos += 1;
                    match e {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0C),
                        b'0'..=b'7' => {
                            let mut value = u32::from(e - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        value = value * 8 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((value & 0xFF) as u8);
                        }
                        b'\r' => {
                            if self.peek() == Some(b'\n') {
                                self.pos += 1;
                            }
                        }
                        b'\n' => {}
                        other => out.push(other),
                    }
                }
                b'(' => {
                    depth += 1;
                    out.push(b);
                }
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(Object::String(out, StringFormat::Literal));
                    }
                    out.push(b);
                }
                b'\r' => {
                    if self.peek() == Some(b'\n') {
                        self.pos += 1;
                    }
                    out.push(b'\n');
                }
                other => out.push(other),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Object> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.')) {
            self.pos += 1;
        }
        let token = String::from_utf8_lossy(&self.data[start..self.pos]).into_owned();

        if token.contains('.') {
            return Ok(Object::Real(token));
        }
        let Ok(value) = token.parse::<i64>() else {
            return Ok(Object::Real(token));
        };

        if let Some(reference) = self.try_reference(value) {
            return Ok(reference);
        }
        Ok(Object::Integer(value))
    }

    /// `N G R` lookahead after an integer; restores the position on failure
    fn try_reference(&mut self, number: i64) -> Option<Object> {
        let number = u32::try_from(number).ok()?;
        let saved = self.pos;

        self.skip_whitespace();
        let gen_start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        let generation = std::str::from_utf8(&self.data[gen_start..self.pos])
            .ok()
            .and_then(|s| s.parse::<u16>().ok());

        if let Some(generation) = generation {
            self.skip_whitespace();
            if self.peek() == Some(b'R') && !matches!(self.peek_at(1), Some(b) if is_regular(b)) {
                self.pos += 1;
                return Some(Object::Reference(number, generation));
            }
        }

        self.pos = saved;
        None
    }

    /// Parse the body of an indirect object (after `obj`), including a
    /// trailing stream and `endobj`
    pub fn parse_indirect_body(&mut self) -> Result<Object> {
        let object = self.parse_object()?;
        self.skip_whitespace();

        let object = match object {
            Object::Dictionary(dict) if self.starts_with(b"stream") => {
                let data = self.read_stream_data(&dict)?;
                Object::Stream(Stream { dict, data })
            }
            other => other,
        };

        self.skip_whitespace();
        if self.starts_with(b"endobj") {
            self.pos += 6;
        }
        Ok(object)
    }

    fn read_stream_data(&mut self, dict: &Dictionary) -> Result<Vec<u8>> {
        self.pos += b"stream".len();
        if self.peek() == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }
        let start = self.pos;

        if let Some(length) = dict.get_i64("Length").and_then(|l| usize::try_from(l).ok()) {
            let end = start.saturating_add(length);
            if end <= self.data.len() {
                let mut probe = Lexer::new(self.data, end);
                probe.skip_whitespace();
                if probe.starts_with(b"endstream") {
                    self.pos = probe.pos + b"endstream".len();
                    return Ok(self.data[start..end].to_vec());
                }
            }
        }

        let keyword = find_bytes(self.data, b"endstream", start)
            .ok_or_else(|| self.error("stream without endstream"))?;
        let mut end = keyword;
        if end > start && self.data[end - 1] == b'\n' {
            end -= 1;
        }
        if end > start && self.data[end - 1] == b'\r' {
            end -= 1;
        }
        self.pos = keyword + b"endstream".len();
        Ok(self.data[start..end].to_vec())
    }
}

/// Parse a whole file
///
/// # Errors
/// `InvalidDrmFormat` when there is no `%PDF-` header or no object at all.
pub fn parse_document(data: &[u8]) -> Result<Document> {
    let header = find_bytes(&data[..data.len().min(1024)], b"%PDF-", 0)
        .ok_or_else(|| LoaderError::InvalidDrmFormat("missing %PDF- header".to_string()))?;
    let mut version_lexer = Lexer::new(data, header + 5);
    let version = String::from_utf8_lossy(version_lexer.read_regular()).into_owned();

    let mut document = Document {
        version: if version.is_empty() { "1.4".to_string() } else { version },
        ..Default::default()
    };

    let mut trailers: Vec<(usize, Dictionary)> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut cursor = header;

    while let Some(caps) = OBJ_HEADER.captures(&data[cursor..]) {
        let (Some(whole), Some(num), Some(gen)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            break;
        };
        let start = cursor + whole.start();
        let body = cursor + whole.end();

        let number = parse_ascii::<u32>(num.as_bytes());
        let generation = parse_ascii::<u16>(gen.as_bytes());
        let (Some(number), Some(generation)) = (number, generation) else {
            cursor = body;
            continue;
        };

        let mut lexer = Lexer::new(data, body);
        match lexer.parse_indirect_body() {
            Ok(object) => {
                if let Object::Stream(stream) = &object {
                    if stream.dict.is_type("XRef") {
                        trailers.push((start, stream.dict.clone()));
                    }
                }
                document
                    .objects
                    .insert(number, IndirectObject { generation, object });
                spans.push((start, lexer.position()));
                cursor = lexer.position();
            }
            Err(e) => {
                debug!(object = number, error = %e, "skipping unparsable object");
                cursor = body;
            }
        }
    }

    let mut search = 0;
    while let Some(at) = find_bytes(data, b"trailer", search) {
        search = at + 7;
        if spans.iter().any(|(s, e)| at >= *s && at < *e) {
            continue;
        }
        let mut lexer = Lexer::new(data, search);
        lexer.skip_whitespace();
        if lexer.starts_with(b"<<") {
            if let Ok(Object::Dictionary(dict)) = lexer.parse_object() {
                trailers.push((at, dict));
            }
        }
    }

    trailers.sort_by_key(|(offset, _)| *offset);
    for (_, dict) in &trailers {
        for key in TRAILER_KEYS {
            if let Some(value) = dict.get(key) {
                document.trailer.set(key, value.clone());
            }
        }
    }

    if document.objects.is_empty() {
        return Err(LoaderError::InvalidDrmFormat("no PDF objects found".to_string()));
    }
    Ok(document)
}

/// Objects packed in a decoded `/Type /ObjStm` stream
pub fn parse_object_stream(data: &[u8], count: usize, first: usize) -> Result<Vec<(u32, Object)>> {
    if first > data.len() {
        return Err(LoaderError::InvalidDrmFormat(format!(
            "object stream /First {} beyond data length {}",
            first,
            data.len()
        )));
    }

    let mut header = Lexer::new(&data[..first], 0);
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let number = header.parse_object()?.as_i64();
        let offset = header.parse_object()?.as_i64();
        match (number.and_then(|n| u32::try_from(n).ok()), offset.and_then(|o| usize::try_from(o).ok())) {
            (Some(n), Some(o)) => entries.push((n, o)),
            _ => {
                return Err(LoaderError::InvalidDrmFormat(
                    "malformed object stream header".to_string(),
                ))
            }
        }
    }

    let mut objects = Vec::with_capacity(count);
    for (number, offset) in entries {
        let mut lexer = Lexer::new(data, first + offset);
        objects.push((number, lexer.parse_object()?));
    }
    Ok(objects)
}

fn parse_ascii<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
