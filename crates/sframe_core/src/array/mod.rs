//! `Sarray`: a single immutable on-disk column.
//!
//! An `Sarray` is a lightweight shared handle to a sealed segment file
//! set. Open any number of concurrent readers; writing happens through a
//! separate single-use [`writer::SarrayWriter`] lifecycle.

pub mod reader;
pub mod writer;

use std::path::Path;
use std::sync::Arc;

use sframe_error::Result;

use crate::storage::index_file::SegmentIndex;
use crate::storage::segment_store::SegmentReader;
use crate::values::{Value, ValueType};
use reader::SarrayReader;
use writer::SarrayWriter;

/// Shared handle to a sealed column.
#[derive(Debug, Clone)]
pub struct Sarray {
    index: Arc<SegmentIndex>,
}

impl Sarray {
    /// Open a column from its `.sidx` index file.
    pub fn open(index_path: impl AsRef<Path>) -> Result<Sarray> {
        let index = SegmentIndex::open(index_path)?;
        Ok(Sarray {
            index: Arc::new(index),
        })
    }

    pub fn from_index(index: Arc<SegmentIndex>) -> Sarray {
        Sarray { index }
    }

    /// Write `values` as a new column under `prefix`, split into
    /// `num_segments` roughly equal segments.
    pub fn from_values(
        prefix: impl AsRef<Path>,
        value_type: ValueType,
        values: &[Value],
        num_segments: usize,
    ) -> Result<Sarray> {
        debug_assert!(num_segments > 0);
        let mut writer = SarrayWriter::open(prefix.as_ref(), value_type, num_segments)?;
        let per_segment = values.len().div_ceil(num_segments).max(1);
        for (segment_id, chunk) in values.chunks(per_segment).enumerate() {
            let mut seg = writer.segment_writer(segment_id)?;
            seg.write_values(chunk)?;
            writer.return_segment_writer(segment_id, seg)?;
        }
        writer.close()
    }

    pub fn value_type(&self) -> ValueType {
        self.index.content_type
    }

    pub fn num_rows(&self) -> u64 {
        self.index.num_rows()
    }

    pub fn num_segments(&self) -> usize {
        self.index.num_segments()
    }

    pub fn index(&self) -> &Arc<SegmentIndex> {
        &self.index
    }

    /// Two handles are the same column iff they share the same index.
    pub fn same_column(&self, other: &Sarray) -> bool {
        Arc::ptr_eq(&self.index, &other.index)
    }

    pub fn reader(&self) -> SarrayReader {
        SarrayReader::new(SegmentReader::open(self.index.clone()))
    }

    /// Read the entire column into memory. Intended for key columns and
    /// tests; value payloads should stream through a reader instead.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        let reader = self.reader();
        let mut out = Vec::new();
        reader.read_rows(0, self.num_rows(), &mut out)?;
        Ok(out)
    }
}
