//! File persistence

pub mod persistence;

pub use persistence::{JsonFile, StorageError};
