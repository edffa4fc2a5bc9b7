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


//! Output file naming
//!
//! Book titles become file names: characters that are invalid on common
//! filesystems are replaced by look-alikes, the name is truncated to a
//! byte limit on a character boundary, and collisions get ` (n)` appended.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Byte limit for the title part of a file name
pub const MAX_TITLE_BYTES: usize = 200;

/// Replace characters that are invalid in file names
pub fn sanitize_filename(name: &str) -> String {
    let mut result: String = name.chars().map(replace_char).collect();

    result = result.trim().trim_end_matches('.').to_string();

    if cfg!(target_os = "windows") {
        result = handle_windows_reserved_names(&result);
    }

    if result.is_empty() {
        result = "untitled".to_string();
    }
    result
}

fn replace_char(c: char) -> char {
    match c {
        '<' => '＜',
        '>' => '＞',
        ':' => '_',
        '"' => '＂',
        '|' => '⏐',
        '?' => '？',
        '*' => '✱',
        '/' => '∕',
        '\\' => '_',
        c if c.is_control() => '_',
        c => c,
    }
}

fn handle_windows_reserved_names(name: &str) -> String {
    let upper = name.to_uppercase();
    let reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    for reserved_name in &reserved {
        if upper == *reserved_name || upper.starts_with(&format!("{}.", reserved_name)) {
            return format!("_{}", name);
        }
    }
    name.to_string()
}

/// Truncate to at most `max_bytes` on a character boundary
pub fn truncate_component(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut index = max_bytes;
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    text[..index].trim_end().to_string()
}

/// `<sanitized title>.<extension>`
pub fn output_file_name(title: &str, extension: &str) -> String {
    let stem = truncate_component(&sanitize_filename(title), MAX_TITLE_BYTES);
    format!("{}.{}", stem, extension)
}

/// Append ` (1)`, ` (2)`, ... until the path is free
pub fn avoid_collision(path: &Path) -> PathBuf {
    avoid_collision_among(path, &HashSet::new())
}

/// Like [`avoid_collision`], also skipping paths in `reserved`
pub fn avoid_collision_among(path: &Path, reserved: &HashSet<PathBuf>) -> PathBuf {
    let taken = |p: &Path| p.exists() || reserved.contains(p);
    if !taken(path) {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

    let mut counter = 1;
    loop {
        let new_name = if extension.is_empty() {
            format!("{} ({})", stem, counter)
        } else {
            format!("{} ({}).{}", stem, counter, extension)
        };
        let new_path = parent.join(new_name);
        if !taken(&new_path) || counter >= 9999 {
            return new_path;
        }
        counter += 1;
    }
}

/// One free path per name, distinct from each other and from existing files
pub fn reserve_paths<I, S>(dir: &Path, names: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut reserved = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let path = avoid_collision_among(&dir.join(name.as_ref()), &reserved);
            reserved.insert(path.clone());
            path
        })
        .collect()
}
