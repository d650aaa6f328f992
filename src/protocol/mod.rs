//! Protocol module - Defines the FlatKV wire format and RPC envelopes
//!
//! A message is a flat, ordered key/value record. On the wire it is one
//! printable-ASCII token:
//! - each value is percent-escaped
//! - pairs are joined as `key US value` with `RS` between pairs
//! - the joined string is URI-component escaped as a whole
//!
//! Requests and responses reserve a handful of top-level keys; everything
//! else is method arguments or result fields.

mod codec;
mod frame;
mod message;

pub use codec::*;
pub use frame::*;
pub use message::*;

/// Separator between pairs (ASCII record separator)
pub const PAIR_SEPARATOR: char = '\u{1E}';

/// Separator between a key and its value (ASCII unit separator)
pub const KV_SEPARATOR: char = '\u{1F}';

/// Recommended upper bound for one encoded frame
pub const MAX_FRAME_BYTES: usize = 4 * 1024;

/// Longest accepted correlation id
pub const MAX_ID_LEN: usize = 64;

pub const KEY_TYPE: &str = "type";
pub const KEY_ID: &str = "id";
pub const KEY_METHOD: &str = "method";
pub const KEY_STATUS: &str = "status";
pub const KEY_MESSAGE: &str = "message";

/// Keys that carry envelope meaning and never appear as arguments or results
pub const RESERVED_KEYS: [&str; 5] = [KEY_TYPE, KEY_ID, KEY_METHOD, KEY_STATUS, KEY_MESSAGE];

pub const TYPE_REQUEST: &str = "request";
pub const TYPE_RESPONSE: &str = "response";
pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// Message used when an error response carries none
pub const DEFAULT_ERROR_MESSAGE: &str = "unknown error";

/// Default port for the TCP host
pub const DEFAULT_PORT: u16 = 24810;
