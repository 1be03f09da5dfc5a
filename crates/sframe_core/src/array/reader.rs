//! Read side of a column.

use sframe_error::Result;

use crate::storage::segment_store::{SegmentReader, SegmentValueIter};
use crate::values::Value;

/// Reader over a sealed column.
///
/// Cheap to clone; every clone (and every thread) may read concurrently.
#[derive(Debug, Clone)]
pub struct SarrayReader {
    segments: SegmentReader,
}

impl SarrayReader {
    pub(crate) fn new(segments: SegmentReader) -> SarrayReader {
        SarrayReader { segments }
    }

    pub fn num_segments(&self) -> usize {
        self.segments.num_segments()
    }

    pub fn num_rows(&self) -> u64 {
        self.segments.num_rows()
    }

    pub fn segment_size(&self, segment_id: usize) -> Result<u64> {
        self.segments.segment_size(segment_id)
    }

    /// Global row range `[start, end)` covered by a segment.
    pub fn segment_row_range(&self, segment_id: usize) -> (u64, u64) {
        self.segments.segment_row_range(segment_id)
    }

    /// Read rows `[start, end)` into `out`, returning rows actually read.
    /// Ranges past the end of the column truncate without error.
    pub fn read_rows(&self, start: u64, end: u64, out: &mut Vec<Value>) -> Result<usize> {
        self.segments.read_rows(start, end, out)
    }

    /// Forward iterator over one segment.
    pub fn segment_iter(&self, segment_id: usize) -> Result<SegmentValueIter> {
        self.segments.segment_iter(segment_id)
    }
}
