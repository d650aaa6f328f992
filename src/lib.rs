//! flatlink - Correlated request/response RPC over one message-oriented
//! connection, carried in the FlatKV text format.
//!
//! - [`protocol`]: FlatKV frames, escaping and the request/response envelopes
//! - [`transport`]: the coordinator that correlates calls and dispatches
//!   inbound requests to handlers
//! - [`network`]: TCP server, client and link framing feeding a coordinator
//! - [`config`]: TOML configuration

pub mod config;
pub mod network;
pub mod protocol;
pub mod transport;
