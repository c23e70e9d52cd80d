//! Core domain for audiomirror
//!
//! Platform-agnostic types and rules for mirroring one captured stream to a
//! "main" and an "aux" output. Device access lives behind the traits in
//! [`domain::device`]; concrete backends and the real-time pipeline live in the
//! `audiomirror-infra` crate.

pub mod domain;

pub use domain::*;
