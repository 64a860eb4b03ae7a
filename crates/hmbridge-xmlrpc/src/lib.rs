//! XML-RPC envelope codec used by the CCU callback listener and the
//! registration client.
//!
//! The CCU speaks XML-RPC over HTTP in both directions: it calls our
//! listener with `methodCall` documents and answers our `init` registration
//! with a `methodResponse`. This crate decodes and encodes both shapes.
//!
//! Decoding is two-staged. The document is first read into a small element
//! tree with `quick-xml`, then the tree is interpreted according to the
//! XML-RPC value grammar. Untyped `<value>text</value>` is read as a string,
//! as the protocol requires.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{parse_method_call, parse_method_response, MethodCall};
pub use encode::{encode_fault, encode_method_call, encode_response};
pub use error::RpcError;
pub use value::{Fault, Value};

/// Fault code for a document that is not well-formed XML-RPC.
pub const FAULT_PARSE_ERROR: i64 = -32700;
/// Fault code for a method the listener does not implement.
pub const FAULT_METHOD_NOT_FOUND: i64 = -32601;
/// Fault code for a structurally invalid request (e.g. bad multicall entry).
pub const FAULT_INVALID_REQUEST: i64 = -32600;
