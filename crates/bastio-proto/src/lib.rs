//! # Bastio Wire Protocol
//!
//! The protocol spoken between a Bastio agent and the backend over the
//! `bastio-agent` SSH subsystem channel. Each logical message is a netstring
//! (`len:bytes,`) whose payload is a UTF-8 JSON object. The wire is
//! symmetric: both directions use the same framing and schema.
//!
//! Two layers live here:
//!
//! - [`netstring`]: the framing codec, usable both as pure
//!   `compose`/`parse` functions and as a streaming
//!   [`tokio_util::codec`] decoder/encoder.
//! - [`message`]: the typed message model (`action` requests and
//!   `feedback` replies) with a routed, validating parser.

pub mod message;
pub mod netstring;

pub use message::{
    ActionKind, ActionMessage, FeedbackMessage, FeedbackStatus, MessageError, ProtocolMessage,
};
pub use netstring::{compose, parse, FramingError, NetstringCodec, DEFAULT_FRAME_LIMIT};
