//! Agentgate Protocol Definitions
//!
//! This crate defines the wire types shared by the control plane and agents:
//! logical stream kinds, signaling messages, statistics reports and the
//! frame format used to multiplex streams over a single tunnel.

pub mod codec;
pub mod messages;
pub mod mux;
pub mod signal;
pub mod stream;

pub use codec::{read_json, write_json, CodecError};
pub use messages::*;
pub use mux::{Frame, FrameCodec, FrameType, MuxError, StreamId};
pub use signal::{
    BusDirection, BusEnvelope, Candidate, CandidateKind, IceServer, SelectedPath,
    SessionDescription, SignalMessage,
};
pub use stream::{DialScheme, ProtoError, StreamKind};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum size of a single length-prefixed JSON message (1MB)
pub const MAX_JSON_MESSAGE_SIZE: u32 = 1024 * 1024;
