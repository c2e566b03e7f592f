//! JSON-RPC 2.0 messages framed as concatenated JSON objects.
//!
//! Messages are written back to back with no length prefix and no delimiter.
//! Boundaries are recovered from JSON structure alone:
//! - [`JsonRpcCodec`] decodes a byte stream into typed messages and encodes
//!   messages back to bytes, with a per-message byte budget
//! - [`read_head`] reads only the first message of a stream and returns the
//!   unread bytes, for calls whose payload is not JSON
//! - the `parse_*` functions narrow arbitrary JSON values into typed messages

pub mod codec;
pub mod error;
pub mod head;
pub mod message;

pub use codec::{JsonRpcCodec, DEFAULT_MAX_MESSAGE_BYTES};
pub use error::{FrameError, Result};
pub use head::{read_head, Remainder};
pub use message::{
    parse_input, parse_message, parse_notification, parse_request, parse_response,
    parse_response_error, parse_response_result, JsonRpcError, JsonRpcInput, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseError,
    JsonRpcResponseResult, ParseMessage, RequestId, Version, JSONRPC_VERSION,
};
