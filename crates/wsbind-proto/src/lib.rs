//! Wire envelopes for the RPC layer.
//!
//! A single WebSocket text frame carries exactly one envelope:
//!
//! Request:            `{"functionName": "echo", "arguments": ["hi"], "callId": "1"}`
//! Response (success): `{"callId": "1", "returnValue": "hi"}`
//! Response (failure): `{"callId": "1", "error": "echo blew up"}`
//!
//! Frames that parse as neither are not RPC traffic and pass through
//! to the application untouched.

pub mod envelope;

pub use envelope::{CallId, Request, Response, is_rpc_message, parse_request, parse_response};
