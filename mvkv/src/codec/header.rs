//! The ASCII key=value map codec used by store headers, chunk headers and
//! map configuration strings.
//!
//! Maps render as `key=value` pairs, comma-separated, keys sorted. Values
//! containing a comma, quote, equals sign or newline are double-quoted with
//! backslash escapes. Checked variants append a trailing
//! `fletcher=<hex>` pair covering all preceding bytes.

use std::collections::BTreeMap;

use crate::codec::fletcher::fletcher32;
use crate::error::{CResult, Error};

pub type HeaderMap = BTreeMap<String, String>;

fn needs_quoting(v: &str) -> bool {
    v.is_empty() || v.bytes().any(|b| matches!(b, b',' | b'"' | b'=' | b'\n' | b'\\'))
}

/// Renders a header map as one ASCII line (no trailing newline).
pub fn format_map(map: &HeaderMap) -> String {
    let mut out = String::new();
    for (k, v) in map {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(k);
        out.push('=');
        if needs_quoting(v) {
            out.push('"');
            for c in v.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        } else {
            out.push_str(v);
        }
    }
    out
}

/// Parses one ASCII header line into a map.
pub fn parse_map(line: &str) -> CResult<HeaderMap> {
    let mut map = HeaderMap::new();
    let mut chars = line.chars().peekable();
    while chars.peek().is_some() {
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if key.is_empty() {
            return Err(Error::FileCorrupt(format!("bad header line: {:?}", line)));
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => {
                            return Err(Error::FileCorrupt(format!(
                                "unterminated quote in header: {:?}",
                                line
                            )))
                        }
                    },
                    Some(c) => value.push(c),
                    None => {
                        return Err(Error::FileCorrupt(format!(
                            "unterminated quote in header: {:?}",
                            line
                        )))
                    }
                }
            }
            // consume the separator after a quoted value
            if let Some(c) = chars.next() {
                if c != ',' {
                    return Err(Error::FileCorrupt(format!("bad header line: {:?}", line)));
                }
            }
        } else {
            for c in chars.by_ref() {
                if c == ',' {
                    break;
                }
                value.push(c);
            }
        }
        map.insert(key, value);
    }
    Ok(map)
}

/// Renders a map with a trailing `fletcher` pair covering the bytes before it.
pub fn format_checked(map: &HeaderMap) -> String {
    let body = format_map(map);
    let check = fletcher32(body.as_bytes());
    format!("{},fletcher={:08x}", body, check)
}

/// Parses a checked header line, verifying the trailing `fletcher` pair.
pub fn parse_checked(line: &str) -> CResult<HeaderMap> {
    let at = line
        .rfind(",fletcher=")
        .ok_or_else(|| Error::FileCorrupt("header missing checksum".to_string()))?;
    let body = &line[..at];
    let hex = &line[at + ",fletcher=".len()..];
    let stored = u32::from_str_radix(hex.trim(), 16)
        .map_err(|_| Error::FileCorrupt(format!("bad header checksum field: {:?}", hex)))?;
    let actual = fletcher32(body.as_bytes());
    if stored != actual {
        return Err(Error::FileCorrupt(format!(
            "header checksum mismatch: stored {:08x}, actual {:08x}",
            stored, actual
        )));
    }
    parse_map(body)
}

/// Reads a required u64 field stored as lowercase hex.
pub fn get_hex(map: &HeaderMap, key: &str) -> CResult<u64> {
    let v = map
        .get(key)
        .ok_or_else(|| Error::FileCorrupt(format!("header missing field {:?}", key)))?;
    u64::from_str_radix(v, 16)
        .map_err(|_| Error::FileCorrupt(format!("bad hex field {}={:?}", key, v)))
}

/// Reads an optional u64 field stored as lowercase hex.
pub fn get_hex_opt(map: &HeaderMap, key: &str) -> CResult<Option<u64>> {
    match map.get(key) {
        None => Ok(None),
        Some(_) => Ok(Some(get_hex(map, key)?)),
    }
}

/// Stores a u64 field as lowercase hex.
pub fn put_hex(map: &mut HeaderMap, key: &str, v: u64) {
    map.insert(key.to_string(), format!("{:x}", v));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut map = HeaderMap::new();
        map.insert("chunk".to_string(), "1f".to_string());
        map.insert("block".to_string(), "2".to_string());
        map.insert("name".to_string(), "data".to_string());
        let line = format_map(&map);
        assert_eq!(parse_map(&line).unwrap(), map);
    }

    #[test]
    fn quoted_values() {
        let mut map = HeaderMap::new();
        map.insert("name".to_string(), "a,b=\"c\"\\d".to_string());
        map.insert("empty".to_string(), "".to_string());
        let line = format_map(&map);
        assert_eq!(parse_map(&line).unwrap(), map);
    }

    #[test]
    fn checked_round_trip() {
        let mut map = HeaderMap::new();
        put_hex(&mut map, "chunk", 0x1f);
        put_hex(&mut map, "version", 7);
        let line = format_checked(&map);
        let parsed = parse_checked(&line).unwrap();
        assert_eq!(get_hex(&parsed, "chunk").unwrap(), 0x1f);
        assert_eq!(get_hex(&parsed, "version").unwrap(), 7);
    }

    #[test]
    fn checked_detects_flip() {
        let mut map = HeaderMap::new();
        put_hex(&mut map, "chunk", 16);
        let line = format_checked(&map);
        // flip one hex digit inside the checksum
        let at = line.rfind("fletcher=").unwrap() + "fletcher=".len();
        let mut bytes = line.into_bytes();
        bytes[at] = if bytes[at] == b'0' { b'1' } else { b'0' };
        let line = String::from_utf8(bytes).unwrap();
        assert!(matches!(parse_checked(&line), Err(Error::FileCorrupt(_))));
    }

    #[test]
    fn checked_detects_body_change() {
        let mut map = HeaderMap::new();
        put_hex(&mut map, "chunk", 16);
        let line = format_checked(&map);
        let line = line.replacen("chunk=10", "chunk=11", 1);
        assert!(parse_checked(&line).is_err());
    }

    #[test]
    fn missing_field() {
        let map = parse_map("a=1").unwrap();
        assert!(matches!(get_hex(&map, "b"), Err(Error::FileCorrupt(_))));
        assert_eq!(get_hex_opt(&map, "b").unwrap(), None);
    }
}
