//! pcm-sink
//!
//! PCM playback device driver: format and channel map negotiation,
//! an explicit session state machine, and a blocking writer with
//! underrun recovery, behind a pluggable device backend.

pub mod audio;
pub mod decode;
pub mod engine;
