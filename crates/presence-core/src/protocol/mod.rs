//! Protocol module containing the wearable-link framing codec.

pub mod frame;

pub use frame::{encode_frames, FrameBuffer, FrameError};
