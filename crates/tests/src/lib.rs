//! Cross-crate integration tests for audiomirror
//!
//! Everything runs against the in-memory backend, so the suite needs no
//! audio hardware.

#[cfg(test)]
mod engine_integration;
#[cfg(test)]
mod pipeline_integration;
