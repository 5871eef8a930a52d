/// Persistence gateway contract and backends.
pub mod gateway;
/// Durable entity definitions.
pub mod models;
/// Backend-agnostic storage errors.
pub mod storage;
