//! Physical storage: segment files plus the index files describing them.

pub mod index_file;
pub mod segment_store;
