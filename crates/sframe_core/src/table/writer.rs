//! Aligned multi-column table writing.
//!
//! Mirrors the column writer lifecycle across all columns at once: every
//! column gets the same segment boundaries, so the finished table is
//! aligned by construction.

use std::path::Path;

use sframe_error::{Result, SframeError};

use crate::array::writer::SarrayWriter;
use crate::storage::segment_store::SegmentWriter;
use crate::values::{Value, ValueType};

use super::Sframe;

/// Single-use writer producing a new [`Sframe`].
#[derive(Debug)]
pub struct SframeWriter {
    names: Vec<String>,
    writers: Vec<SarrayWriter>,
    num_segments: usize,
}

impl SframeWriter {
    pub fn open(
        column_names: &[String],
        column_types: &[ValueType],
        prefix: impl AsRef<Path>,
        num_segments: usize,
    ) -> Result<SframeWriter> {
        if column_names.len() != column_types.len() {
            return Err(SframeError::new(format!(
                "Got {} column names but {} types",
                column_names.len(),
                column_types.len()
            )));
        }
        let mut sorted = column_names.to_vec();
        sorted.sort();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(SframeError::new("Duplicate column names in table writer"));
        }

        let prefix = prefix.as_ref();
        let mut writers = Vec::with_capacity(column_names.len());
        for (col_idx, value_type) in column_types.iter().enumerate() {
            let name = format!(
                "{}.col{col_idx:03}",
                prefix
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            );
            let col_prefix = prefix.with_file_name(name);
            writers.push(SarrayWriter::open(col_prefix, *value_type, num_segments)?);
        }

        Ok(SframeWriter {
            names: column_names.to_vec(),
            writers,
            num_segments,
        })
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn num_columns(&self) -> usize {
        self.writers.len()
    }

    /// Take the row-output handle for one segment. Each segment may be
    /// taken once; hand it to the worker that owns the segment.
    pub fn segment_output(&mut self, segment_id: usize) -> Result<SframeSegmentOutput> {
        let mut columns = Vec::with_capacity(self.writers.len());
        for writer in &mut self.writers {
            columns.push(writer.segment_writer(segment_id)?);
        }
        Ok(SframeSegmentOutput {
            segment_id,
            columns,
        })
    }

    /// Return a finished segment output.
    pub fn return_segment_output(&mut self, output: SframeSegmentOutput) -> Result<()> {
        let SframeSegmentOutput {
            segment_id,
            columns,
        } = output;
        for (writer, seg) in self.writers.iter_mut().zip(columns) {
            writer.return_segment_writer(segment_id, seg)?;
        }
        Ok(())
    }

    /// Seal all columns and assemble the table.
    pub fn close(self) -> Result<Sframe> {
        let mut pairs = Vec::with_capacity(self.writers.len());
        for (name, writer) in self.names.into_iter().zip(self.writers) {
            pairs.push((name, writer.close()?));
        }
        let frame = Sframe::new(pairs)?;
        frame.assert_aligned();
        Ok(frame)
    }
}

/// Row-oriented output for one segment across all columns.
#[derive(Debug)]
pub struct SframeSegmentOutput {
    segment_id: usize,
    columns: Vec<SegmentWriter>,
}

impl SframeSegmentOutput {
    pub fn segment_id(&self) -> usize {
        self.segment_id
    }

    /// Append one row. The row length must equal the column count.
    pub fn write_row(&mut self, row: &[Value]) -> Result<()> {
        debug_assert_eq!(self.columns.len(), row.len());
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.write_value(value)?;
        }
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.columns.first().map(|c| c.rows_written()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_rows_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SframeWriter::open(
            &["x".to_string(), "y".to_string()],
            &[ValueType::Integer, ValueType::String],
            dir.path().join("frame"),
            2,
        )
        .unwrap();

        let mut seg0 = writer.segment_output(0).unwrap();
        seg0.write_row(&[Value::Integer(1), Value::from("a")]).unwrap();
        seg0.write_row(&[Value::Integer(2), Value::from("b")]).unwrap();
        writer.return_segment_output(seg0).unwrap();

        let mut seg1 = writer.segment_output(1).unwrap();
        seg1.write_row(&[Value::Integer(3), Value::from("c")]).unwrap();
        writer.return_segment_output(seg1).unwrap();

        let frame = writer.close().unwrap();
        assert_eq!(3, frame.num_rows());
        assert_eq!(
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)],
            frame.column("x").unwrap().to_vec().unwrap()
        );
        assert_eq!(
            vec![Value::from("a"), Value::from("b"), Value::from("c")],
            frame.column("y").unwrap().to_vec().unwrap()
        );
    }

    #[test]
    fn duplicate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let res = SframeWriter::open(
            &["x".to_string(), "x".to_string()],
            &[ValueType::Integer, ValueType::Integer],
            dir.path().join("frame"),
            1,
        );
        assert!(res.is_err());
    }
}
