//! Disk-backed columnar table engine.
//!
//! Columns are immutable segmented arrays on disk ([`array::Sarray`]);
//! tables are column collections sharing handles copy-on-write
//! ([`table::Sframe`]). Queries build an immutable plan DAG and run
//! through the optimizer before materializing ([`plan`]). [`sort`] and
//! [`groupby`] provide the external-memory bulk operations.

pub mod array;
pub mod config;
pub mod groupby;
pub mod plan;
pub mod sort;
pub mod storage;
pub mod table;
pub mod util;
pub mod values;
