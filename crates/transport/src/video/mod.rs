//! Video media path (§4.6, §4.8, §4.9): frame reassembly, packetization,
//! and the receive-side RTCP feedback (PLI/NACK) generation.

pub mod frame_assembler;
pub mod receive_stream;
pub mod send_stream;

pub use frame_assembler::{FrameAssembler, InsertResult, VideoPacket};
pub use receive_stream::VideoReceiveStream;
pub use send_stream::{VideoFrame, VideoSendStream};
