// ABOUTME: Library root for the query gateway
// ABOUTME: Exposes the router and server so integration tests can drive them

pub mod server;

pub use server::{router, serve, DestinationExecutor, GatewayConfig, QueryExecutor, QueryRequest};
