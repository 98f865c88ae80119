//! Boundary adapters: the REST API and the binary RPC endpoint

pub mod hrpc;
pub mod rest;
pub mod types;

pub use hrpc::HrpcServer;
pub use rest::{ApiState, router};
pub use types::{ApiError, ServerInfo};
