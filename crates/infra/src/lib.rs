//! Infrastructure for audiomirror
//!
//! Device backends and the real-time pipeline built on the core domain.

pub mod audio;

pub use audio::*;
