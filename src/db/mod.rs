//! MongoDB persistence layer
//!
//! Connection handling and the typed collection wrapper live in `mongo`;
//! document layouts and their indexes live in `schemas`.

pub mod mongo;
pub mod schemas;

pub use mongo::{without_deleted, IntoIndexes, MongoClient, MongoCollection, MutMetadata};
