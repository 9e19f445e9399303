//! tusgate - resumable tus uploads onto multipart object storage
//!
//! This library provides the protocol core, the object store adapters and the
//! HTTP surface for the tusgate server.

pub mod api;
pub mod config;
pub mod metrics;
pub mod storage;
pub mod tus;
pub mod types;
