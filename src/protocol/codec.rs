//! FlatKV codec
//!
//! Turns a [`Frame`] into a single printable-ASCII token and back. Values
//! are escaped first, pairs are joined with two control separators, and the
//! joined string is then escaped again as a whole, so neither separator nor
//! any non-ASCII byte ever reaches the wire raw.

use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

use super::frame::{is_valid_key, Frame, InvalidKey};
use super::{KV_SEPARATOR, PAIR_SEPARATOR};

/// Wire text that could not be turned back into a frame or array
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated percent escape at byte {offset}")]
    TruncatedEscape { offset: usize },

    #[error("Invalid percent escape at byte {offset}")]
    InvalidEscape { offset: usize },

    #[error("Decoded bytes are not valid UTF-8")]
    InvalidUtf8,

    #[error("Pair without key/value separator: {0:?}")]
    MissingSeparator(String),

    #[error(transparent)]
    InvalidKey(#[from] InvalidKey),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Not a bracketed array: {0:?}")]
    NotAnArray(String),

    #[error("Array has {found} elements, expected {expected}")]
    ArrayLength { expected: usize, found: usize },

    #[error("Array element {index} is not valid: {value:?}")]
    InvalidArrayElement { index: usize, value: String },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

fn needs_escape(byte: u8) -> bool {
    !(0x20..=0x7E).contains(&byte)
        || byte == b'%'
        || byte == PAIR_SEPARATOR as u8
        || byte == KV_SEPARATOR as u8
}

/// Value-level escaping: printable ASCII passes through, everything else
/// (and `%` itself) becomes `%XX` with uppercase hex.
pub fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        if needs_escape(byte) {
            out.push('%');
            out.push(HEX_UPPER[(byte >> 4) as usize] as char);
            out.push(HEX_UPPER[(byte & 0x0F) as usize] as char);
        } else {
            out.push(byte as char);
        }
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Strict inverse of [`percent_encode`] (and of URI-component escaping).
///
/// Accepts either hex case. Truncated or non-hex escapes fail.
pub fn percent_decode(text: &str) -> DecodeResult<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        if i + 2 >= bytes.len() {
            return Err(DecodeError::TruncatedEscape { offset: i });
        }
        match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
            _ => return Err(DecodeError::InvalidEscape { offset: i }),
        }
        i += 3;
    }

    String::from_utf8(out).map_err(|_| DecodeError::InvalidUtf8)
}

/// Best-effort decoding: malformed escapes are kept literally and invalid
/// UTF-8 is replaced.
fn percent_decode_lossy(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Encode a frame into its wire token
pub fn encode_frame(frame: &Frame) -> String {
    let mut joined = String::new();
    for (index, (key, value)) in frame.iter().enumerate() {
        if index > 0 {
            joined.push(PAIR_SEPARATOR);
        }
        joined.push_str(key);
        joined.push(KV_SEPARATOR);
        joined.push_str(&percent_encode(value));
    }
    urlencoding::encode(&joined).into_owned()
}

/// Decode a wire token into a frame.
///
/// Empty text is an empty frame. Malformed escapes, pairs without a
/// key/value separator, bad keys and repeated keys are all rejected.
pub fn decode_frame(text: &str) -> DecodeResult<Frame> {
    let mut frame = Frame::new();
    if text.is_empty() {
        return Ok(frame);
    }

    let joined = percent_decode(text)?;
    if joined.is_empty() {
        return Ok(frame);
    }

    for pair in joined.split(PAIR_SEPARATOR) {
        let (key, raw_value) = pair
            .split_once(KV_SEPARATOR)
            .ok_or_else(|| DecodeError::MissingSeparator(pair.to_string()))?;

        if !is_valid_key(key) {
            return Err(InvalidKey(key.to_string()).into());
        }
        if frame.contains_key(key) {
            return Err(DecodeError::DuplicateKey(key.to_string()));
        }

        frame.push_unchecked(key.to_string(), percent_decode(raw_value)?);
    }

    Ok(frame)
}

/// [`decode_frame`] with an upper bound on the wire length
pub fn decode_frame_limited(text: &str, max_bytes: usize) -> DecodeResult<Frame> {
    if text.len() > max_bytes {
        return Err(DecodeError::TooLarge {
            size: text.len(),
            max: max_bytes,
        });
    }
    decode_frame(text)
}

/// Envelope fields recovered from a frame that failed strict decoding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SniffedEnvelope {
    pub kind: Option<String>,
    pub id: Option<String>,
}

impl SniffedEnvelope {
    pub fn is_request(&self) -> bool {
        self.kind.as_deref() == Some(super::TYPE_REQUEST)
    }
}

/// Pull `type` and `id` out of possibly-malformed wire text.
///
/// Used only to address an error reply to a broken request; never use the
/// result for anything else.
pub fn sniff_envelope(text: &str) -> SniffedEnvelope {
    let joined = percent_decode_lossy(text);
    let mut sniffed = SniffedEnvelope::default();

    for pair in joined.split(PAIR_SEPARATOR) {
        let Some((key, raw_value)) = pair.split_once(KV_SEPARATOR) else {
            continue;
        };
        match key {
            super::KEY_TYPE if sniffed.kind.is_none() => {
                sniffed.kind = Some(percent_decode_lossy(raw_value));
            }
            super::KEY_ID if sniffed.id.is_none() => {
                sniffed.id = Some(percent_decode_lossy(raw_value));
            }
            _ => {}
        }
    }

    sniffed
}

/// Encode an ordered list as `[v0;v1;...;vn]`.
///
/// Meant for numbers and other `;`-free tokens. Elements are not escaped:
/// an element containing `;` reads back as several, and a list holding a
/// single empty element reads back as an empty list.
pub fn encode_array<I, T>(values: I) -> String
where
    I: IntoIterator<Item = T>,
    T: Display,
{
    let items: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(";"))
}

/// Decode `[v0;v1;...;vn]` into its elements. `[]` is an empty list.
///
/// Splits on every `;`, so elements never contain one.
pub fn decode_array(text: &str) -> DecodeResult<Vec<String>> {
    let interior = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| DecodeError::NotAnArray(text.to_string()))?;

    if interior.is_empty() {
        return Ok(Vec::new());
    }
    Ok(interior.split(';').map(str::to_string).collect())
}

/// Decode an array and parse every element
pub fn decode_array_as<T: FromStr>(text: &str) -> DecodeResult<Vec<T>> {
    decode_array(text)?
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| DecodeError::InvalidArrayElement { index, value })
        })
        .collect()
}

/// Decode a 3-component numeric vector such as a position
pub fn decode_vec3(text: &str) -> DecodeResult<[f64; 3]> {
    let values = decode_array_as::<f64>(text)?;
    let found = values.len();
    <[f64; 3]>::try_from(values).map_err(|_| DecodeError::ArrayLength { expected: 3, found })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pairs: &[(&str, &str)]) -> Frame {
        Frame::from_pairs(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn test_roundtrip_awkward_values() {
        let original = frame(&[
            ("type", "request"),
            ("percent", "100% sure, %41 is not A"),
            ("separators", "a\u{1E}b\u{1F}c"),
            ("unicode", "héllo wörld ✓ 🦀"),
            ("empty", ""),
            ("newline", "line1\nline2\r\n"),
        ]);

        let wire = encode_frame(&original);
        assert_eq!(decode_frame(&wire).unwrap(), original);
    }

    #[test]
    fn test_wire_is_printable_ascii() {
        let wire = encode_frame(&frame(&[("k", "a\u{1E}b\u{1F} ü%")]));
        assert!(wire.bytes().all(|b| (0x21..=0x7E).contains(&b)), "{wire}");
    }

    #[test]
    fn test_value_escaping_uses_uppercase_hex() {
        assert_eq!(percent_encode("a b"), "a b");
        assert_eq!(percent_encode("%"), "%25");
        assert_eq!(percent_encode("\u{1E}\u{1F}"), "%1E%1F");
        assert_eq!(percent_encode("é"), "%C3%A9");
        assert_eq!(percent_encode("\u{7F}"), "%7F");
    }

    #[test]
    fn test_order_is_preserved() {
        let original = frame(&[("z", "1"), ("a", "2"), ("m", "3")]);
        let decoded = decode_frame(&encode_frame(&original)).unwrap();
        assert_eq!(decoded.keys().collect::<Vec<_>>(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_empty_text_is_empty_frame() {
        assert!(decode_frame("").unwrap().is_empty());
        assert_eq!(encode_frame(&Frame::new()), "");
    }

    #[test]
    fn test_truncated_escape_fails() {
        assert_eq!(
            decode_frame("type%1"),
            Err(DecodeError::TruncatedEscape { offset: 4 })
        );
        assert_eq!(
            decode_frame("abc%"),
            Err(DecodeError::TruncatedEscape { offset: 3 })
        );
    }

    #[test]
    fn test_non_hex_escape_fails() {
        assert_eq!(
            decode_frame("%ZZtype"),
            Err(DecodeError::InvalidEscape { offset: 0 })
        );
    }

    #[test]
    fn test_inner_escape_errors_surface() {
        // outer layer is fine, value layer holds a bad escape
        let joined = "text\u{1F}50%GZ";
        let wire = urlencoding::encode(joined).into_owned();
        assert_eq!(
            decode_frame(&wire),
            Err(DecodeError::InvalidEscape { offset: 2 })
        );
    }

    #[test]
    fn test_pair_without_separator_fails() {
        let wire = urlencoding::encode("type\u{1F}request\u{1E}dangling").into_owned();
        assert_eq!(
            decode_frame(&wire),
            Err(DecodeError::MissingSeparator("dangling".to_string()))
        );
    }

    #[test]
    fn test_duplicate_and_bad_keys_fail() {
        let dup = urlencoding::encode("a\u{1F}1\u{1E}a\u{1F}2").into_owned();
        assert_eq!(
            decode_frame(&dup),
            Err(DecodeError::DuplicateKey("a".to_string()))
        );

        let bad = urlencoding::encode("a b\u{1F}1").into_owned();
        assert!(matches!(
            decode_frame(&bad),
            Err(DecodeError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_value_keeps_later_kv_separators() {
        // only the first separator splits; escaped values never contain one,
        // but a raw one after it is kept as value text
        let wire = urlencoding::encode("k\u{1F}a\u{1F}b").into_owned();
        let decoded = decode_frame(&wire).unwrap();
        assert_eq!(decoded.get("k"), Some("a\u{1F}b"));
    }

    #[test]
    fn test_limited_decode() {
        let blob = "x".repeat(100);
        let wire = encode_frame(&frame(&[("blob", blob.as_str())]));
        assert!(decode_frame_limited(&wire, 4096).is_ok());
        assert!(matches!(
            decode_frame_limited(&wire, 10),
            Err(DecodeError::TooLarge { max: 10, .. })
        ));
    }

    #[test]
    fn test_sniff_broken_request() {
        let joined = "type\u{1F}request\u{1E}id\u{1F}abc123\u{1E}junk%Z";
        let wire = urlencoding::encode(joined).into_owned() + "%G";
        assert!(decode_frame(&wire).is_err());

        let sniffed = sniff_envelope(&wire);
        assert!(sniffed.is_request());
        assert_eq!(sniffed.id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_sniff_garbage() {
        let sniffed = sniff_envelope("%%%not a frame");
        assert!(!sniffed.is_request());
        assert_eq!(sniffed.id, None);
    }

    #[test]
    fn test_array_roundtrip() {
        let values = vec!["1.5", "-2", "0"];
        let text = encode_array(&values);
        assert_eq!(text, "[1.5;-2;0]");
        assert_eq!(decode_array(&text).unwrap(), values);
    }

    #[test]
    fn test_empty_array() {
        let empty: Vec<f64> = Vec::new();
        assert_eq!(encode_array(&empty), "[]");
        assert!(decode_array("[]").unwrap().is_empty());
    }

    #[test]
    fn test_array_elements_are_not_escaped() {
        assert_eq!(encode_array([""]), "[]");
        assert!(decode_array(&encode_array([""])).unwrap().is_empty());

        assert_eq!(decode_array(&encode_array(["", ""])).unwrap(), vec!["", ""]);
        assert_eq!(decode_array(&encode_array(["a;b"])).unwrap(), vec!["a", "b"]);
        assert_eq!(decode_array(&encode_array(["x]y"])).unwrap(), vec!["x]y"]);
    }

    #[test]
    fn test_array_requires_brackets() {
        assert!(matches!(decode_array("1;2;3"), Err(DecodeError::NotAnArray(_))));
        assert!(matches!(decode_array("[1;2"), Err(DecodeError::NotAnArray(_))));
        assert!(matches!(decode_array(""), Err(DecodeError::NotAnArray(_))));
    }

    #[test]
    fn test_vec3() {
        assert_eq!(decode_vec3("[0.1;2;-3.5]").unwrap(), [0.1, 2.0, -3.5]);
        assert_eq!(
            decode_vec3("[1;2]"),
            Err(DecodeError::ArrayLength { expected: 3, found: 2 })
        );
        assert_eq!(
            decode_vec3("[1;x;3]"),
            Err(DecodeError::InvalidArrayElement {
                index: 1,
                value: "x".to_string()
            })
        );
    }

    #[test]
    fn test_array_survives_frame_encoding() {
        let position = encode_array([1.0, 2.5, -3.0]);
        let original = frame(&[("position", position.as_str())]);
        let decoded = decode_frame(&encode_frame(&original)).unwrap();
        assert_eq!(decode_vec3(decoded.get("position").unwrap()).unwrap(), [1.0, 2.5, -3.0]);
    }
}
