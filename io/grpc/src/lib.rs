//! grpc - gRPC call semantics shared by the transport and the layers above it.
//!
//! - [`Code`] and [`Status`], including the tables that convert between
//!   gRPC status codes, HTTP/2 error codes and HTTP/1 status codes
//! - [`Metadata`] batches and the `grpc-timeout` wire format
//! - length-prefixed message framing
//!
//! Like `http2`, this crate is sans-io and does not use async/await or tokio.

mod frame;
mod metadata;
mod status;

pub use frame::{HEADER_SIZE, MAX_MESSAGE_SIZE, MessageDecoder, MessageError, encode_message};
pub use metadata::{Metadata, Timeout};
pub use status::{Code, Status};
