//! Write side of a column.
//!
//! One writer lifecycle per column: open, fill segments (possibly from
//! multiple threads, one thread per segment), close. Closing seals the
//! column; a closed writer cannot be reused.

use std::path::Path;

use sframe_error::Result;

use crate::storage::segment_store::{SegmentStoreWriter, SegmentWriter};
use crate::values::{Value, ValueType};

use super::Sarray;

/// Single-use writer producing a new [`Sarray`].
#[derive(Debug)]
pub struct SarrayWriter {
    store: SegmentStoreWriter,
}

impl SarrayWriter {
    /// Segment count is typically chosen to match desired read/write
    /// parallelism.
    pub fn open(
        prefix: impl AsRef<Path>,
        value_type: ValueType,
        num_segments: usize,
    ) -> Result<SarrayWriter> {
        let store = SegmentStoreWriter::open(prefix.as_ref(), value_type, num_segments)?;
        Ok(SarrayWriter { store })
    }

    pub fn num_segments(&self) -> usize {
        self.store.num_segments()
    }

    /// Take exclusive ownership of one segment's writer. Each segment may
    /// be taken exactly once; hand the handle to the worker that owns the
    /// segment.
    pub fn segment_writer(&mut self, segment_id: usize) -> Result<SegmentWriter> {
        self.store.segment_writer(segment_id)
    }

    /// Return a finished segment writer.
    pub fn return_segment_writer(
        &mut self,
        segment_id: usize,
        writer: SegmentWriter,
    ) -> Result<()> {
        self.store.return_segment_writer(segment_id, writer)
    }

    /// Write a full segment from a slice in one call.
    pub fn write_segment(&mut self, segment_id: usize, values: &[Value]) -> Result<()> {
        self.store.write_segment(segment_id, values)
    }

    /// Seal the column. Consumes the writer; the returned handle is
    /// read-only from here on.
    pub fn close(self) -> Result<Sarray> {
        let index = self.store.finalize()?;
        Ok(Sarray::from_index(std::sync::Arc::new(index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_segment_fill() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            SarrayWriter::open(dir.path().join("col"), ValueType::Integer, 4).unwrap();

        let handles: Vec<_> = (0..4).map(|id| writer.segment_writer(id).unwrap()).collect();
        let finished: Vec<_> = std::thread::scope(|scope| {
            let joins: Vec<_> = handles
                .into_iter()
                .enumerate()
                .map(|(id, mut seg)| {
                    scope.spawn(move || {
                        for v in 0..100 {
                            seg.write_value(&Value::Integer((id * 100 + v) as i64)).unwrap();
                        }
                        (id, seg)
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });
        for (id, seg) in finished {
            writer.return_segment_writer(id, seg).unwrap();
        }

        let arr = writer.close().unwrap();
        assert_eq!(400, arr.num_rows());
        let expected: Vec<Value> = (0..400).map(Value::Integer).collect();
        assert_eq!(expected, arr.to_vec().unwrap());
    }
}
