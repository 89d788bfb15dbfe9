// ABOUTME: Destination store connectivity over the PostgreSQL wire protocol
// ABOUTME: Re-exports connection settings, bootstrapping, and error classification

pub mod connection;

pub use connection::{classify_error, connect, resolve_addresses, DestinationConfig};
