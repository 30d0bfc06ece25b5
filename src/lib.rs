//! Heimdall-ASIS Ingestion Core
//!
//! Exposes the ingestion-and-cleaning pipeline modules for the `heimdall`
//! binary and for integration tests.

pub mod adapters;
pub mod cleaners;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod store;

pub use error::{FetchError, PipelineError};
pub use fetch::{FetchClient, FetchClientConfig};
pub use models::{CatalogEntry, SourceFamily, UpdateFrequency};
pub use store::Store;
