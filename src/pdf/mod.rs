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


//! Minimal PDF object layer used by the ADEPT PDF decryptor

pub mod object;
pub mod parser;
pub mod writer;

pub use object::{Dictionary, Document, IndirectObject, Object, Stream, StringFormat};
pub use parser::{parse_document, parse_object_stream};
pub use writer::write_document;
