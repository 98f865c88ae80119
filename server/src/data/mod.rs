//! Storage layer: the span model, codec, and the sharded datastore

pub mod error;
pub mod store;
pub mod types;

pub use error::DataError;
pub use store::{DataStore, DataStoreConfig};
