//! Core data models for the media ingestion service.
//!
//! These entities describe merged artifacts and the derived media facts
//! reported back to clients. They serialize naturally as JSON via `serde`;
//! the filesystem layout is the only persisted state.

pub mod artifact;
