//! chainrelay-ipc: duplex local-socket medium.
//!
//! Nodes speak newline-free, back-to-back JSON over IPC, so inbound bytes
//! are split into messages by bracket depth ([`JsonFrameCodec`]) rather
//! than by a delimiter.

pub mod codec;
pub mod link;

pub use codec::JsonFrameCodec;
pub use link::IpcLink;
