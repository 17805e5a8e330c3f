//! Wire layer shared by the client-facing and backend-facing channels.
//!
//! - `codec`: [`FrameCodec`](codec::FrameCodec), `Content-Length` (or NDJSON)
//!   framing for [`tokio_util::codec`].
//! - `envelope`: JSON-RPC 2.0 [`Message`](envelope::Message) classification
//!   and serialisation.

pub mod codec;
pub mod envelope;

pub use codec::{FrameCodec, Framing};
pub use envelope::{Message, RequestId, RpcError};
