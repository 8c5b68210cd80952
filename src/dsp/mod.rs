//! DSP building blocks — filters, dynamics, delay, reverb and the chain
//! that strings them together.
//!
//! Everything here processes one frame (all channels of one sample
//! instant) at a time, so the offline renderer and the live session run
//! exactly the same code.

pub mod chain;
pub mod compressor;
pub mod convolver;
pub mod delay;
pub mod distortion;
pub mod envelope;
pub mod filter;
pub mod reverb;
pub mod smoothing;
