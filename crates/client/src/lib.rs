//! Overlook stream client.
//!
//! Negotiates a WebRTC session with a KVM-over-IP device through the Janus
//! gateway it runs, keeps the session alive and watches the inbound video
//! for silent stalls. [`StreamManager`] is the entry point.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod h264;
pub mod health;
pub mod manager;
pub mod peer;
pub mod signaling;
pub mod stats;
pub mod transaction;
pub mod video;

pub use error::WebRtcError;
pub use manager::{DeviceControl, MicrophoneAccess, StreamManager, StreamStatus, Wake};
pub use video::{FrameRenderer, VideoFrame};
