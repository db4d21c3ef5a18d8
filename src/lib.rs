//! Playthrough Library
//!
//! Real-time audio relay between a capture callback and a render callback
//! driven by independent device clocks.

pub mod audio;
pub mod engine;
pub mod sim;
