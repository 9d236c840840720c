/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! `name#secret` and `name##secret` tripcodes.

use anyhow::{anyhow, Context, Result};
use encoding_rs::SHIFT_JIS;

const SALT_TABLE: &str = concat!(
    "................................",
    ".............../0123456789ABCDEF",
    "GABCDEFGHIJKLMNOPQRSTUVWXYZabcde",
    "fabcdefghijklmnopqrstuvwxyz.....",
    "................................",
    "................................",
    "................................",
    "................................",
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTrip {
    /// Input with the marker and secret removed.
    pub name: String,
    /// `!!xxxxxxxxxx`, `!xxxxxxxxxx`, or empty.
    pub trip: String,
}

/// Splits a poster name into display name and tripcode. `##` wins over `#`;
/// secure trips need the deployment salt.
pub fn name_and_tripcode(input: &str, secure_salt: Option<&str>) -> Result<NameTrip> {
    if let Some((name, secret)) = split_marker(input, "##") {
        let salt = secure_salt
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("secure tripcode requested but no tripcode_salt is configured"))?;
        return Ok(NameTrip {
            name,
            trip: format!("!!{}", secure_trip(secret, salt)?),
        });
    }
    if let Some((name, secret)) = split_marker(input, "#") {
        return Ok(NameTrip {
            name,
            trip: format!("!{}", plain_trip(secret)?),
        });
    }
    Ok(NameTrip {
        name: input.to_string(),
        trip: String::new(),
    })
}

/// Secret after the first `marker`, up to the end of its line. The returned name has
/// every `marker` occurrence removed together with the rest of its line.
fn split_marker<'a>(input: &'a str, marker: &str) -> Option<(String, &'a str)> {
    let start = input.find(marker)?;
    let rest = &input[start + marker.len()..];
    let secret = &rest[..rest.find('\n').unwrap_or(rest.len())];

    let mut name = String::with_capacity(input.len());
    let mut tail = input;
    while let Some(at) = tail.find(marker) {
        name.push_str(&tail[..at]);
        let cut = &tail[at..];
        tail = &cut[cut.find('\n').unwrap_or(cut.len())..];
    }
    name.push_str(tail);
    Some((name, secret))
}

pub fn plain_trip(secret: &str) -> Result<String> {
    let pass = convert(secret);
    let salt = plain_salt(&pass);
    md5_tail(&pass, &salt)
}

pub fn secure_trip(secret: &str, salt: &str) -> Result<String> {
    md5_tail(&convert(secret), salt)
}

/// Shift_JIS bytes (lossy) with `& " < >` escaped as HTML entities.
fn convert(secret: &str) -> Vec<u8> {
    let (bytes, _, _) = SHIFT_JIS.encode(secret);
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes.iter() {
        match b {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'"' => out.extend_from_slice(b"&quot;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            _ => out.push(b),
        }
    }
    out
}

/// Characters 1..3 of `pass + "H.."`, each mapped through the salt table.
fn plain_salt(pass: &[u8]) -> String {
    let mut padded = pass.to_vec();
    padded.extend_from_slice(b"H..");
    decode_chars(&padded)
        .into_iter()
        .skip(1)
        .take(2)
        .map(|c| SALT_TABLE.as_bytes()[(c as u32 % 256) as usize] as char)
        .collect()
}

/// UTF-8 decode where every invalid byte becomes its own U+FFFD, so a Shift_JIS
/// double byte counts as two characters.
fn decode_chars(bytes: &[u8]) -> Vec<char> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.extend(valid.chars());
                return out;
            }
            Err(e) => {
                let (valid, bad) = rest.split_at(e.valid_up_to());
                out.extend(String::from_utf8_lossy(valid).chars());
                out.push(char::REPLACEMENT_CHARACTER);
                rest = &bad[1..];
            }
        }
    }
}

fn md5_tail(pass: &[u8], salt: &str) -> Result<String> {
    let hash = pwhash::md5_crypt::hash_with(format!("$1${salt}").as_str(), pass)
        .with_context(|| format!("md5-crypt with salt {salt:?}"))?;
    let tail = hash
        .len()
        .checked_sub(10)
        .and_then(|at| hash.get(at..))
        .ok_or_else(|| anyhow!("md5-crypt output too short"))?;
    Ok(tail.to_string())
}
