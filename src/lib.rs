// ABOUTME: Library root for ct-replicator
// ABOUTME: Exposes configuration, adapters, and the change-tracking sync engine

pub mod config;
pub mod error;
pub mod postgres;
pub mod preflight;
pub mod shutdown;
pub mod tracking;
pub mod utils;
pub mod value;

pub use error::{Result, SyncError};
