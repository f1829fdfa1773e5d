//! RESP protocol support
//!
//! The scripting core does not parse client input itself (that is the
//! server front-end's job); it only builds reply frames and, in the
//! debugger child, serializes the final reply directly to the client
//! socket.

pub mod resp;
pub mod serializer;

pub use resp::{Bytes, RespFrame};
pub use serializer::{serialize_resp_frame, serialize_to_vec};
