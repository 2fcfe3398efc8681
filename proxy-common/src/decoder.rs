//! Encoding, decoding and hashing kernels.
//!
//! Pure functions behind the decoder API surface. Every supported
//! encoding round-trips: `decode(encode(x, e), e) == x` for valid input.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha1::Digest;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("invalid {encoding} input: {reason}")]
    InvalidInput { encoding: String, reason: String },
    #[error("compression failed: {0}")]
    Compression(String),
}

type Result<T> = std::result::Result<T, DecoderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingType {
    Url,
    Base64,
    Html,
    Hex,
    Unicode,
    Gzip,
}

impl EncodingType {
    pub const ALL: [EncodingType; 6] = [
        EncodingType::Url,
        EncodingType::Base64,
        EncodingType::Html,
        EncodingType::Hex,
        EncodingType::Unicode,
        EncodingType::Gzip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingType::Url => "url",
            EncodingType::Base64 => "base64",
            EncodingType::Html => "html",
            EncodingType::Hex => "hex",
            EncodingType::Unicode => "unicode",
            EncodingType::Gzip => "gzip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

fn invalid(encoding: EncodingType, reason: impl std::fmt::Display) -> DecoderError {
    DecoderError::InvalidInput {
        encoding: encoding.as_str().to_string(),
        reason: reason.to_string(),
    }
}

pub fn encode(input: &str, encoding: EncodingType) -> Result<String> {
    match encoding {
        EncodingType::Url => Ok(utf8_percent_encode(input, NON_ALPHANUMERIC).to_string()),
        EncodingType::Base64 => Ok(BASE64.encode(input.as_bytes())),
        EncodingType::Html => Ok(html_escape(input)),
        EncodingType::Hex => Ok(hex::encode(input.as_bytes())),
        EncodingType::Unicode => Ok(unicode_escape(input)),
        EncodingType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(input.as_bytes())
                .map_err(|e| DecoderError::Compression(e.to_string()))?;
            let compressed = encoder
                .finish()
                .map_err(|e| DecoderError::Compression(e.to_string()))?;
            Ok(BASE64.encode(compressed))
        }
    }
}

pub fn decode(input: &str, encoding: EncodingType) -> Result<String> {
    match encoding {
        EncodingType::Url => percent_decode_str(input)
            .decode_utf8()
            .map(|s| s.to_string())
            .map_err(|e| invalid(encoding, e)),
        EncodingType::Base64 => {
            let bytes = BASE64.decode(input.trim()).map_err(|e| invalid(encoding, e))?;
            String::from_utf8(bytes).map_err(|e| invalid(encoding, e))
        }
        EncodingType::Html => html_unescape(input).map_err(|e| invalid(encoding, e)),
        EncodingType::Hex => {
            let bytes = hex::decode(input.trim()).map_err(|e| invalid(encoding, e))?;
            String::from_utf8(bytes).map_err(|e| invalid(encoding, e))
        }
        EncodingType::Unicode => unicode_unescape(input).map_err(|e| invalid(encoding, e)),
        EncodingType::Gzip => {
            let compressed = BASE64.decode(input.trim()).map_err(|e| invalid(encoding, e))?;
            let mut decoder = GzDecoder::new(compressed.as_slice());
            let mut out = String::new();
            decoder
                .read_to_string(&mut out)
                .map_err(|e| invalid(encoding, e))?;
            Ok(out)
        }
    }
}

pub fn hash(input: &str, algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::Md5 => format!("{:x}", md5::compute(input.as_bytes())),
        HashAlgorithm::Sha1 => hex::encode(sha1::Sha1::digest(input.as_bytes())),
        HashAlgorithm::Sha256 => hex::encode(sha2::Sha256::digest(input.as_bytes())),
        HashAlgorithm::Sha512 => hex::encode(sha2::Sha512::digest(input.as_bytes())),
    }
}

/// One round of smart decode: which encoding applied and what it yielded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodingStep {
    pub encoding: String,
    pub input: String,
    pub output: String,
}

/// Iteratively undo recognizable encodings, recording each step, until the
/// value stops changing or `max_iterations` is hit.
pub fn smart_decode(input: &str, max_iterations: usize) -> (String, Vec<DecodingStep>) {
    let mut current = input.to_string();
    let mut steps = Vec::new();

    for _ in 0..max_iterations {
        let Some((encoding, output)) = guess_and_decode(&current) else {
            break;
        };
        if output == current {
            break;
        }
        steps.push(DecodingStep {
            encoding: encoding.as_str().to_string(),
            input: current.clone(),
            output: output.clone(),
        });
        current = output;
    }

    (current, steps)
}

fn guess_and_decode(input: &str) -> Option<(EncodingType, String)> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.contains('%') {
        if let Ok(out) = decode(trimmed, EncodingType::Url) {
            if out != trimmed {
                return Some((EncodingType::Url, out));
            }
        }
    }
    if trimmed.contains('&') && trimmed.contains(';') {
        if let Ok(out) = decode(trimmed, EncodingType::Html) {
            if out != trimmed {
                return Some((EncodingType::Html, out));
            }
        }
    }
    if trimmed.contains("\\u") {
        if let Ok(out) = decode(trimmed, EncodingType::Unicode) {
            if out != trimmed {
                return Some((EncodingType::Unicode, out));
            }
        }
    }
    if trimmed.len() >= 4
        && trimmed.len() % 2 == 0
        && trimmed.chars().all(|c| c.is_ascii_hexdigit())
    {
        if let Ok(out) = decode(trimmed, EncodingType::Hex) {
            if is_mostly_printable(&out) {
                return Some((EncodingType::Hex, out));
            }
        }
    }
    if trimmed.len() >= 4 && looks_like_base64(trimmed) {
        if let Ok(out) = decode(trimmed, EncodingType::Base64) {
            if is_mostly_printable(&out) && out != trimmed {
                return Some((EncodingType::Base64, out));
            }
        }
    }
    None
}

fn looks_like_base64(s: &str) -> bool {
    s.len() % 4 == 0
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

fn is_mostly_printable(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let printable = s
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\r' || *c == '\t')
        .count();
    printable * 10 >= s.chars().count() * 9
}

fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn html_unescape(input: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let rest = &input[i..];
        let Some(end) = rest.find(';') else {
            out.push(c);
            continue;
        };
        let entity = &rest[1..end];
        let replacement = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                u32::from_str_radix(&entity[2..], 16)
                    .ok()
                    .and_then(char::from_u32)
            }
            _ if entity.starts_with('#') => {
                entity[1..].parse::<u32>().ok().and_then(char::from_u32)
            }
            _ => None,
        };
        match replacement {
            Some(r) => {
                out.push(r);
                for _ in 0..end {
                    chars.next();
                }
            }
            None => out.push(c),
        }
    }
    Ok(out)
}

fn unicode_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii() && !c.is_ascii_control() {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

fn unicode_unescape(input: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut units: Vec<u16> = Vec::new();
    let mut chars = input.chars().peekable();

    let flush = |units: &mut Vec<u16>, out: &mut String| -> std::result::Result<(), String> {
        if !units.is_empty() {
            let decoded = String::from_utf16(units).map_err(|e| e.to_string())?;
            out.push_str(&decoded);
            units.clear();
        }
        Ok(())
    };

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'u') {
            chars.next();
            let digits: String = (0..4).filter_map(|_| chars.next()).collect();
            if digits.len() != 4 {
                return Err("truncated \\u escape".to_string());
            }
            let unit =
                u16::from_str_radix(&digits, 16).map_err(|_| "bad \\u escape".to_string())?;
            units.push(unit);
        } else {
            flush(&mut units, &mut out)?;
            out.push(c);
        }
    }
    flush(&mut units, &mut out)?;
    Ok(out)
}
