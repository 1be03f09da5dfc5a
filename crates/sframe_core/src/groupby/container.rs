//! Partitioned hash aggregation with disk spilling.
//!
//! Rows are routed to a partition by key hash, then to one of the
//! partition's lock stripes, so concurrent writers rarely contend on
//! the same map. When a partition holds more keys than the configured
//! buffer size, its groups are sorted by key and flushed to a spill
//! file as one sorted chunk; finalization merges the chunks per
//! partition and writes each partition into its own output segment.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::hash::{BuildHasher, Hash, Hasher};
use std::io::{BufReader, BufWriter, Seek as _, SeekFrom, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use ahash::AHashMap;
use parking_lot::Mutex;
use sframe_error::{Result, ResultExt, SframeError};
use tracing::{debug, warn};

use crate::config::EngineContext;
use crate::groupby::aggregate::AggregateValue;
use crate::table::writer::SframeSegmentOutput;
use crate::values::encoding::{decode_value, encode_value};
use crate::values::Value;

/// Lock stripes per partition. Must be a power of two.
const NUM_STRIPES: usize = 64;

/// One aggregation output: the operator template plus the row positions
/// it consumes.
pub struct AggregatorSpec {
    pub template: Box<dyn AggregateValue>,
    pub input_columns: Vec<usize>,
}

/// A fully aggregated group: key values plus one aggregator state per
/// output column. Ordered by key so sorted chunks merge cheaply.
struct GroupbyElement {
    key: Vec<Value>,
    aggs: Vec<Box<dyn AggregateValue>>,
}

impl GroupbyElement {
    fn write(&self, out: &mut impl std::io::Write) -> Result<()> {
        for value in &self.key {
            encode_value(out, value)?;
        }
        for agg in &self.aggs {
            agg.save(out)?;
        }
        Ok(())
    }

    fn read(input: &mut impl std::io::Read, specs: &[AggregatorSpec], num_keys: usize) -> Result<GroupbyElement> {
        let mut key = Vec::with_capacity(num_keys);
        for _ in 0..num_keys {
            key.push(decode_value(input)?);
        }
        let mut aggs = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut agg = spec.template.new_instance();
            agg.load(input)?;
            aggs.push(agg);
        }
        Ok(GroupbyElement { key, aggs })
    }

    fn combine(&mut self, other: GroupbyElement) -> Result<()> {
        debug_assert_eq!(self.aggs.len(), other.aggs.len());
        for (mine, theirs) in self.aggs.iter_mut().zip(&other.aggs) {
            mine.combine(theirs.as_ref())?;
        }
        Ok(())
    }
}

fn key_hash(key: &[Value]) -> u64 {
    let mut hasher = ahash::RandomState::with_seeds(
        0x452b_f08a_e98b_c1d4,
        0x9c30_d539_2af2_6013,
        0xc5d1_b023_2860_85f0,
        0xca41_7918_b8db_38ef,
    )
    .build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

struct SpillState {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    bytes_written: u64,
    /// (byte offset, element count) per sorted chunk.
    chunks: Vec<(u64, u64)>,
}

struct Partition {
    stripes: Vec<Mutex<AHashMap<Vec<Value>, Vec<Box<dyn AggregateValue>>>>>,
    num_keys: AtomicUsize,
    spill: Mutex<SpillState>,
}

impl Partition {
    fn new(spill_path: PathBuf) -> Partition {
        Partition {
            stripes: (0..NUM_STRIPES)
                .map(|_| Mutex::new(AHashMap::with_hasher(crate::values::map_state())))
                .collect(),
            num_keys: AtomicUsize::new(0),
            spill: Mutex::new(SpillState {
                path: spill_path,
                file: None,
                bytes_written: 0,
                chunks: Vec::new(),
            }),
        }
    }
}

pub struct GroupbyContainer {
    num_keys: usize,
    specs: Vec<AggregatorSpec>,
    partitions: Vec<Partition>,
    max_buffer_size: usize,
}

impl GroupbyContainer {
    pub fn new(
        ctx: &EngineContext,
        num_keys: usize,
        specs: Vec<AggregatorSpec>,
        num_partitions: usize,
    ) -> GroupbyContainer {
        let partitions = (0..num_partitions)
            .map(|p| Partition::new(ctx.scratch_prefix(&format!("groupby-p{p:04}"))))
            .collect();
        GroupbyContainer {
            num_keys,
            specs,
            partitions,
            max_buffer_size: ctx.config().groupby_max_buffer_size,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Fold one row. The first `num_keys` values are the group key; the
    /// rest are addressed by each aggregator's input column positions.
    pub fn add(&self, row: &[Value]) -> Result<()> {
        let key = &row[..self.num_keys];
        let hash = key_hash(key);
        let partition_id =
            ((hash as u128 * self.partitions.len() as u128) >> 64) as usize;
        let partition = &self.partitions[partition_id];
        let stripe = &partition.stripes[(hash as usize) & (NUM_STRIPES - 1)];

        let mut new_key = false;
        {
            let mut groups = stripe.lock();
            if !groups.contains_key(key) {
                new_key = true;
                groups.insert(
                    key.to_vec(),
                    self.specs.iter().map(|s| s.template.new_instance()).collect(),
                );
            }
            let aggs = groups
                .get_mut(key)
                .ok_or_else(|| SframeError::new("Group vanished from stripe"))?;
            for (agg, spec) in aggs.iter_mut().zip(&self.specs) {
                let inputs: Vec<&Value> =
                    spec.input_columns.iter().map(|&idx| &row[idx]).collect();
                agg.add_element(&inputs)?;
            }
        }

        if new_key {
            let total = partition.num_keys.fetch_add(1, AtomicOrdering::Relaxed) + 1;
            if total > self.max_buffer_size {
                self.flush_partition(partition_id)?;
            }
        }
        Ok(())
    }

    /// Drain a partition's in-memory groups into a sorted spill chunk.
    fn flush_partition(&self, partition_id: usize) -> Result<()> {
        let partition = &self.partitions[partition_id];
        let mut spill = partition.spill.lock();

        // Another thread may have flushed while we waited on the lock.
        if partition.num_keys.load(AtomicOrdering::Relaxed) <= self.max_buffer_size {
            return Ok(());
        }

        let elements = drain_partition(partition);
        if elements.is_empty() {
            return Ok(());
        }
        debug!(partition_id, keys = elements.len(), "spilling groupby partition");

        if spill.file.is_none() {
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&spill.path)
                .context_fn(|| format!("Creating groupby spill file '{}'", spill.path.display()))?;
            spill.file = Some(BufWriter::new(file));
        }
        let chunk_offset = spill.bytes_written;
        let out = spill.file.as_mut().ok_or_else(|| SframeError::new("Missing spill file"))?;
        let mut buf = Vec::new();
        let mut written = 0u64;
        for element in &elements {
            buf.clear();
            element.write(&mut buf)?;
            out.write_all(&buf)?;
            written += buf.len() as u64;
        }
        spill.bytes_written += written;
        spill.chunks.push((chunk_offset, elements.len() as u64));
        Ok(())
    }

    /// Merge every partition's chunks and write each partition into its
    /// matching output segment, in parallel across partitions. `outputs`
    /// must have one entry per partition; emitted rows are key values
    /// followed by one value per aggregator, sorted by key within the
    /// segment. The outputs come back for returning to the writer.
    pub fn finalize(
        self,
        outputs: Vec<SframeSegmentOutput>,
    ) -> Result<Vec<SframeSegmentOutput>> {
        debug_assert_eq!(self.partitions.len(), outputs.len());
        let GroupbyContainer {
            num_keys,
            specs,
            partitions,
            ..
        } = self;

        let parts: Vec<Mutex<Option<Partition>>> =
            partitions.into_iter().map(|p| Mutex::new(Some(p))).collect();
        let outs: Vec<Mutex<Option<SframeSegmentOutput>>> =
            outputs.into_iter().map(|o| Mutex::new(Some(o))).collect();

        crate::util::parallel_for(parts.len(), |p| {
            let partition = parts[p]
                .lock()
                .take()
                .ok_or_else(|| SframeError::new("Partition taken twice"))?;
            let mut output = outs[p]
                .lock()
                .take()
                .ok_or_else(|| SframeError::new("Segment output taken twice"))?;
            merge_partition(partition, &specs, num_keys, &mut output)?;
            *outs[p].lock() = Some(output);
            Ok(())
        })?;

        outs.into_iter()
            .map(|slot| {
                slot.into_inner()
                    .ok_or_else(|| SframeError::new("Segment output missing after merge"))
            })
            .collect()
    }
}

fn drain_partition(partition: &Partition) -> Vec<GroupbyElement> {
    let mut elements = Vec::new();
    for stripe in &partition.stripes {
        let mut groups = stripe.lock();
        for (key, aggs) in groups.drain() {
            elements.push(GroupbyElement { key, aggs });
        }
    }
    partition.num_keys.store(0, AtomicOrdering::Relaxed);
    elements.sort_by(|a, b| a.key.cmp(&b.key));
    elements
}

struct HeapEntry {
    element: GroupbyElement,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> Ordering {
        self.element
            .key
            .cmp(&other.element.key)
            .then(self.source.cmp(&other.source))
    }
}

/// A source of key-sorted elements for the k-way merge: either a spilled
/// chunk read back from disk, or the final in-memory batch.
enum ChunkSource {
    Memory(std::vec::IntoIter<GroupbyElement>),
    Disk { remaining: u64 },
}

fn merge_partition(
    partition: Partition,
    specs: &[AggregatorSpec],
    num_keys: usize,
    output: &mut SframeSegmentOutput,
) -> Result<()> {
    let resident = drain_partition(&partition);
    let spill = partition.spill.into_inner();

    if let Some(file) = spill.file {
        file.into_inner()
            .map_err(|e| SframeError::new(format!("Flushing groupby spill file: {e}")))?
            .sync_all()
            .ok();
    }

    // One reader per spilled chunk, each positioned at its chunk start.
    let mut readers = Vec::with_capacity(spill.chunks.len());
    for &(offset, _) in &spill.chunks {
        let mut file = File::open(&spill.path)
            .context_fn(|| format!("Opening groupby spill file '{}'", spill.path.display()))?;
        file.seek(SeekFrom::Start(offset))?;
        readers.push(BufReader::new(file));
    }

    let mut sources: Vec<ChunkSource> = spill
        .chunks
        .iter()
        .map(|&(_, count)| ChunkSource::Disk { remaining: count })
        .collect();
    sources.push(ChunkSource::Memory(resident.into_iter()));

    let next_from = |source_idx: usize,
                         sources: &mut Vec<ChunkSource>,
                         readers: &mut Vec<BufReader<File>>|
     -> Result<Option<GroupbyElement>> {
        match &mut sources[source_idx] {
            ChunkSource::Memory(iter) => Ok(iter.next()),
            ChunkSource::Disk { remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                *remaining -= 1;
                GroupbyElement::read(&mut readers[source_idx], specs, num_keys).map(Some)
            }
        }
    };

    let mut heap = BinaryHeap::with_capacity(sources.len());
    for source_idx in 0..sources.len() {
        if let Some(element) = next_from(source_idx, &mut sources, &mut readers)? {
            heap.push(Reverse(HeapEntry {
                element,
                source: source_idx,
            }));
        }
    }

    while let Some(Reverse(HeapEntry { mut element, source })) = heap.pop() {
        if let Some(next) = next_from(source, &mut sources, &mut readers)? {
            heap.push(Reverse(HeapEntry {
                element: next,
                source,
            }));
        }

        // Fold every equal-keyed element from the other chunks in.
        while let Some(Reverse(top)) = heap.peek() {
            if top.element.key != element.key {
                break;
            }
            let Reverse(HeapEntry {
                element: equal,
                source: equal_source,
            }) = heap.pop().ok_or_else(|| SframeError::new("Merge heap emptied unexpectedly"))?;
            element.combine(equal)?;
            if let Some(next) = next_from(equal_source, &mut sources, &mut readers)? {
                heap.push(Reverse(HeapEntry {
                    element: next,
                    source: equal_source,
                }));
            }
        }

        let mut row = element.key;
        for agg in &element.aggs {
            row.push(agg.emit());
        }
        output.write_row(&row)?;
    }

    if !spill.chunks.is_empty() {
        if let Err(e) = std::fs::remove_file(&spill.path) {
            warn!(path = %spill.path.display(), "failed to remove spill file: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::groupby::aggregate::aggregator_for;
    use crate::table::writer::SframeWriter;
    use crate::values::ValueType;

    fn context(dir: &std::path::Path, max_buffer: usize) -> EngineContext {
        let config = EngineConfig {
            groupby_max_buffer_size: max_buffer,
            ..EngineConfig::default()
        };
        EngineContext::new(config, dir.join("scratch")).unwrap()
    }

    fn sum_container(ctx: &EngineContext, num_partitions: usize) -> GroupbyContainer {
        let mut template = aggregator_for("sum").unwrap();
        template.set_input_types(&[ValueType::Integer]).unwrap();
        GroupbyContainer::new(
            ctx,
            1,
            vec![AggregatorSpec {
                template,
                input_columns: vec![1],
            }],
            num_partitions,
        )
    }

    fn run_and_collect(
        dir: &std::path::Path,
        container: GroupbyContainer,
    ) -> Vec<(Value, Value)> {
        let num_partitions = container.num_partitions();
        let mut writer = SframeWriter::open(
            &["g".to_string(), "s".to_string()],
            &[ValueType::Integer, ValueType::Integer],
            dir.join("out"),
            num_partitions,
        )
        .unwrap();
        let outputs: Vec<SframeSegmentOutput> = (0..num_partitions)
            .map(|p| writer.segment_output(p).unwrap())
            .collect();
        let outputs = container.finalize(outputs).unwrap();
        for output in outputs {
            writer.return_segment_output(output).unwrap();
        }
        let frame = writer.close().unwrap();

        let g = frame.column("g").unwrap().to_vec().unwrap();
        let s = frame.column("s").unwrap().to_vec().unwrap();
        let mut rows: Vec<(Value, Value)> = g.into_iter().zip(s).collect();
        rows.sort();
        rows
    }

    #[test]
    fn aggregates_without_spilling() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 1024);
        let container = sum_container(&ctx, 4);
        for (g, v) in [(1, 10), (1, 20), (2, 1), (2, 2), (2, 3)] {
            container.add(&[Value::Integer(g), Value::Integer(v)]).unwrap();
        }
        assert_eq!(
            vec![
                (Value::Integer(1), Value::Integer(30)),
                (Value::Integer(2), Value::Integer(6)),
            ],
            run_and_collect(dir.path(), container)
        );
    }

    #[test]
    fn spilling_matches_in_memory_result() {
        let expected: Vec<(Value, Value)> = (0..50)
            .map(|g| {
                let sum: i64 = (0..20).map(|i| g * 20 + i).sum();
                (Value::Integer(g), Value::Integer(sum))
            })
            .collect();

        // A one-key buffer forces a spill on almost every new key; the
        // result must not depend on it.
        for max_buffer in [1, 2, 100] {
            let dir = tempfile::tempdir().unwrap();
            let ctx = context(dir.path(), max_buffer);
            let container = sum_container(&ctx, 3);
            for g in 0..50i64 {
                for i in 0..20i64 {
                    container
                        .add(&[Value::Integer(g), Value::Integer(g * 20 + i)])
                        .unwrap();
                }
            }
            assert_eq!(
                expected,
                run_and_collect(dir.path(), container),
                "max_buffer={max_buffer}"
            );
        }
    }

    #[test]
    fn concurrent_adds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 8);
        let container = sum_container(&ctx, 4);

        std::thread::scope(|scope| {
            for worker in 0..4i64 {
                let container = &container;
                scope.spawn(move || {
                    for i in 0..250i64 {
                        let row = worker * 250 + i;
                        container
                            .add(&[Value::Integer(row % 10), Value::Integer(1)])
                            .unwrap();
                    }
                });
            }
        });

        let rows = run_and_collect(dir.path(), container);
        assert_eq!(10, rows.len());
        for (_, count) in rows {
            assert_eq!(Value::Integer(100), count);
        }
    }
}
