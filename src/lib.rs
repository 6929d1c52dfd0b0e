//! # proctrack: processing-state tracking for uploads
//!
//! Models the progress of a two-level job pipeline: an [`UploadJob`] owns
//! many [`CalcJob`]s, and both are executed by an external task backend.
//! The jobs are plain serializable values; reconciliation pulls the latest
//! backend state into them through a [`ResultBackend`].
//!
//! ```rust,no_run
//! use proctrack::{MemoryBackend, UploadJob};
//! use std::time::Duration;
//!
//! # async fn run() -> proctrack::Result<()> {
//! let backend = MemoryBackend::new();
//! let mut upload = UploadJob::new("upload-1")?;
//! upload.set_handle_chain(backend.submit_chain(4)?);
//!
//! upload
//!     .get(&backend, Duration::from_secs(1), Some(Duration::from_secs(30)))
//!     .await?;
//! println!("{}", upload.to_document()?);
//! # Ok(())
//! # }
//! ```

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod hash;
    pub mod logging;
}

pub mod backend; // Backend adapter contract
pub mod proc; // Upload and calc processing state

// Re-exports for convenience
pub use crate::core::config::TrackerConfig;
pub use crate::core::errors::{ProcError, Result};
pub use backend::{
    BackendResult, BackendState, HandleChain, HandleNode, MemoryBackend, ResultBackend, TaskHandle,
};
pub use proc::*;
