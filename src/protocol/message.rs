//! Request/response envelopes
//!
//! A request or response is just a [`Frame`] with a few reserved keys.
//! Everything else at the top level is a method argument or a result field.

use thiserror::Error;

use super::frame::Frame;
use super::{
    DEFAULT_ERROR_MESSAGE, KEY_ID, KEY_MESSAGE, KEY_METHOD, KEY_STATUS, KEY_TYPE, MAX_ID_LEN,
    RESERVED_KEYS, STATUS_ERROR, STATUS_OK, TYPE_REQUEST, TYPE_RESPONSE,
};

/// A well-formed frame that is not a valid request or response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Invalid envelope: expected type={expected}, found {found:?}")]
    WrongType {
        expected: &'static str,
        found: Option<String>,
    },

    #[error("Invalid envelope: missing or malformed id {0:?}")]
    InvalidId(Option<String>),

    #[error("Invalid envelope: missing method")]
    MissingMethod,

    #[error("Invalid envelope: status must be ok or error, found {0:?}")]
    InvalidStatus(Option<String>),

    #[error("Invalid envelope: reserved key {0:?} used as a field")]
    ReservedKey(String),
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Check a correlation id: 1 to 64 printable ASCII characters
/// (0x20 to 0x7E, space included). Control characters are refused.
pub fn is_valid_id(id: &str) -> bool {
    (1..=MAX_ID_LEN).contains(&id.len()) && id.bytes().all(|b| b == b' ' || b.is_ascii_graphic())
}

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// An inbound or outbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub args: Frame,
}

/// Outcome carried by a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok(Frame),
    Error(String),
}

/// A reply correlated to a request by id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: String,
    pub outcome: Outcome,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok(_))
    }
}

fn expect_type(frame: &Frame, expected: &'static str) -> EnvelopeResult<()> {
    match frame.get(KEY_TYPE) {
        Some(found) if found == expected => Ok(()),
        found => Err(EnvelopeError::WrongType {
            expected,
            found: found.map(str::to_string),
        }),
    }
}

fn expect_id(frame: &Frame) -> EnvelopeResult<String> {
    match frame.get(KEY_ID) {
        Some(id) if is_valid_id(id) => Ok(id.to_string()),
        other => Err(EnvelopeError::InvalidId(other.map(str::to_string))),
    }
}

fn unreserved_fields(frame: &Frame) -> Frame {
    let mut fields = Frame::new();
    for (key, value) in frame.iter().filter(|(key, _)| !is_reserved_key(key)) {
        fields.push_unchecked(key.to_string(), value.to_string());
    }
    fields
}

fn reject_reserved(fields: &Frame) -> EnvelopeResult<()> {
    match fields.keys().find(|key| is_reserved_key(key)) {
        Some(key) => Err(EnvelopeError::ReservedKey(key.to_string())),
        None => Ok(()),
    }
}

fn append_fields(frame: &mut Frame, fields: Frame) {
    for (key, value) in fields {
        frame.push_unchecked(key, value);
    }
}

/// Interpret a frame as a request. Unknown keys become arguments.
pub fn parse_request(frame: &Frame) -> EnvelopeResult<Request> {
    expect_type(frame, TYPE_REQUEST)?;
    let id = expect_id(frame)?;
    let method = match frame.get(KEY_METHOD) {
        Some(method) if !method.is_empty() => method.to_string(),
        _ => return Err(EnvelopeError::MissingMethod),
    };

    Ok(Request {
        id,
        method,
        args: unreserved_fields(frame),
    })
}

/// Interpret a frame as a response.
///
/// Error responses without a `message` get a generic one.
pub fn parse_response(frame: &Frame) -> EnvelopeResult<Response> {
    expect_type(frame, TYPE_RESPONSE)?;
    let id = expect_id(frame)?;

    let outcome = match frame.get(KEY_STATUS) {
        Some(STATUS_OK) => Outcome::Ok(unreserved_fields(frame)),
        Some(STATUS_ERROR) => Outcome::Error(
            frame
                .get(KEY_MESSAGE)
                .unwrap_or(DEFAULT_ERROR_MESSAGE)
                .to_string(),
        ),
        other => return Err(EnvelopeError::InvalidStatus(other.map(str::to_string))),
    };

    Ok(Response { id, outcome })
}

/// Build a request frame: `type`, `id`, `method`, then the arguments
pub fn build_request(id: &str, method: &str, args: Frame) -> EnvelopeResult<Frame> {
    if !is_valid_id(id) {
        return Err(EnvelopeError::InvalidId(Some(id.to_string())));
    }
    if method.is_empty() {
        return Err(EnvelopeError::MissingMethod);
    }
    reject_reserved(&args)?;

    let mut frame = Frame::new();
    frame.push_unchecked(KEY_TYPE.to_string(), TYPE_REQUEST.to_string());
    frame.push_unchecked(KEY_ID.to_string(), id.to_string());
    frame.push_unchecked(KEY_METHOD.to_string(), method.to_string());
    append_fields(&mut frame, args);
    Ok(frame)
}

/// Build a success response: `type`, `id`, `status=ok`, then the result
pub fn build_response_ok(id: &str, result: Frame) -> EnvelopeResult<Frame> {
    reject_reserved(&result)?;

    let mut frame = response_head(id, STATUS_OK);
    append_fields(&mut frame, result);
    Ok(frame)
}

/// Build an error response.
///
/// The id is echoed as given, even when it is empty or malformed, so that a
/// best-effort reply can still be addressed to a broken request.
pub fn build_response_error(id: &str, message: &str) -> Frame {
    let mut frame = response_head(id, STATUS_ERROR);
    frame.push_unchecked(KEY_MESSAGE.to_string(), message.to_string());
    frame
}

fn response_head(id: &str, status: &str) -> Frame {
    let mut frame = Frame::new();
    frame.push_unchecked(KEY_TYPE.to_string(), TYPE_RESPONSE.to_string());
    frame.push_unchecked(KEY_ID.to_string(), id.to_string());
    frame.push_unchecked(KEY_STATUS.to_string(), status.to_string());
    frame
}
