//! Resumable upload protocol core

mod assembler;
mod engine;
mod error;
pub mod info_store;
mod listing;
mod registry;

pub use assembler::{Assembled, PartAssembler};
pub use engine::{
    AppendOutcome, AppendRequest, BodyStream, Concat, CreateRequest, EngineOptions, UploadEngine,
};
pub use error::UploadError;
pub use info_store::MetadataStore;
pub use listing::{list_files, FileEntry};
pub use registry::{SessionGuard, SessionRegistry};
