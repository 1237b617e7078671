//! Wire protocol: frame model and the two-stage framing pipeline.

mod codec;
mod frame;

pub use codec::{FrameCodec, MAX_FRAME_LEN};
pub use frame::{
    ErrorCode, Frame, FrameBody, Payload, WireError, FLAG_COMPLETE, FLAG_METADATA, FLAG_RESPOND,
    HEADER_LEN, PROTOCOL_VERSION,
};
