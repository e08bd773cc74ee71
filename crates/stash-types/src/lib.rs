//! Foundation types for Stash.
//!
//! This crate provides the small set of value types shared by the storage
//! backends and the cache adapter. Every other Stash crate depends on
//! `stash-types`.
//!
//! # Key Types
//!
//! - [`Timestamp`] -- wall-clock milliseconds since the UNIX epoch, used for
//!   entry expiration and sweep bookkeeping
//! - [`estimate_size`] / [`estimate_entry_size`] -- deterministic byte-size
//!   estimates for JSON payloads

pub mod size;
pub mod timestamp;

pub use size::{estimate_entry_size, estimate_size, estimate_str};
pub use timestamp::Timestamp;
