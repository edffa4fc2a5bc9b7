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


//! Local MAC addresses

use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::debug;

lazy_static! {
    static ref MAC_PATTERN: Regex =
        Regex::new(r"(?i)(?:^|\s)((?:[0-9a-f]{2}[:-]){5}[0-9a-f]{2})(?:\s|$)").unwrap();
}

const SYSFS_NET: &str = "/sys/class/net";

/// Uppercase, colon separated form; `None` for malformed or all-zero input
pub fn normalize_mac(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 || parts.iter().any(|p| p.len() != 2 || !p.chars().all(|c| c.is_ascii_hexdigit())) {
        return None;
    }
    if parts.iter().all(|p| *p == "00") {
        return None;
    }
    Some(parts.join(":").to_ascii_uppercase())
}

/// MAC addresses found in `ifconfig -a` output
pub fn parse_ifconfig(output: &str) -> Vec<String> {
    MAC_PATTERN
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .filter_map(|m| normalize_mac(m.as_str()))
        .collect()
}

fn from_sysfs(root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut interfaces: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    interfaces.sort();

    interfaces
        .iter()
        .filter_map(|dir| fs::read_to_string(dir.join("address")).ok())
        .filter_map(|text| normalize_mac(&text))
        .collect()
}

fn from_ifconfig() -> Vec<String> {
    for program in ["/sbin/ifconfig", "ifconfig"] {
        if let Ok(output) = Command::new(program).arg("-a").output() {
            if output.status.success() {
                return parse_ifconfig(&String::from_utf8_lossy(&output.stdout));
            }
        }
    }
    Vec::new()
}

fn dedup_in_order(addresses: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    addresses.into_iter().filter(|a| seen.insert(a.clone())).collect()
}

/// All non-zero MAC addresses of this machine, in a stable order
///
/// Sysfs interfaces come first (sorted by name), then anything extra
/// `ifconfig -a` reports. Never fails; an empty list means no source
/// answered.
pub fn mac_addresses() -> Vec<String> {
    let addresses = dedup_in_order(from_sysfs(Path::new(SYSFS_NET)).into_iter().chain(from_ifconfig()));
    debug!(count = addresses.len(), "MAC addresses collected");
    addresses
}
