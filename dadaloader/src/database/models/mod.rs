//! Database models for dadaloader.
//!
//! These models map directly to the database schema.

pub mod download;

pub use download::*;
