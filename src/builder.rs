use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fs::File;
use std::hash::BuildHasher;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use foldhash::fast::FixedState;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::codec;
use crate::meta::store_checksum;
use crate::{
    MassIndex, MassIndexDirectory, MassIndexError, MassIndexHeader, MassIndexInfo, MassIndexMeta,
    MassIndexReader, MassIndexTrailer, MassIndexWriter, Result,
};

/// Entries between two cancellation checks while grouping.
const GROUPING_BATCH: usize = 1 << 16;
/// Groups between two cancellation checks while writing.
const WRITING_BATCH: usize = 1 << 12;
/// Buffer size used when writing and reading back spilled runs.
const RUN_BUFFER_SIZE: usize = 1 << 20;
/// Approximate bookkeeping cost of one buffered entry.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<Entry>();

/// Cooperative cancellation flag for long builds and merges.
///
/// Clones share the same flag. Once cancelled, the next check inside
/// [`MassIndexBuilder::finalize`] or [`MassIndexMerger::merge`] aborts with
/// [`MassIndexError::Cancelled`] before the header is written.
#[derive(Debug, Clone, Default)]
pub struct MassIndexCancel(Arc<AtomicBool>);

impl MassIndexCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MassIndexError::Cancelled)
        } else {
            Ok(())
        }
    }
}

type Entry = (Vec<u8>, Option<Vec<u8>>);
type Group = (Vec<u8>, Vec<Vec<u8>>);

/// Builder type for emitting massindex files from `(key, value)` pairs.
///
/// Entries are buffered by [`add`](Self::add) in any order, with repeated
/// keys allowed anywhere. [`finalize`](Self::finalize) consumes the builder,
/// groups the values of each key in insertion order (duplicates preserved),
/// sorts the keys and streams the store to a [`MassIndexWriter`].
///
/// With [`with_spill_dir`](Self::with_spill_dir), buffered entries are sorted
/// and written to temporary runs whenever they exceed the spill threshold, so
/// inputs larger than memory can be indexed. The runs are merged while
/// writing the store.
///
/// ```
/// use massindex::{MassIndex, MassIndexBuilder};
///
/// # fn main() -> massindex::Result<()> {
/// let mut builder = MassIndexBuilder::default();
/// builder.add("a", "1");
/// builder.add("b", "x");
/// builder.add("a", "2");
/// let index = MassIndex::load(builder.finalize_to_vec()?)?;
/// assert_eq!(index.get(b"a").unwrap().to_vec()?, vec![b"1".to_vec(), b"2".to_vec()]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MassIndexBuilder {
    entries: Vec<Entry>,
    writer_buffer_size: usize,
    shard_count: usize,
    hash_seed: u64,
    group_size_limit: u64,
    cancel: MassIndexCancel,
    spill_dir: Option<PathBuf>,
    spill_threshold: usize,
    buffered_bytes: usize,
    runs: Vec<File>,
    spilled_entries: usize,
    spill_error: Option<MassIndexError>,
}

impl Default for MassIndexBuilder {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            writer_buffer_size: 16 << 20, // 16 MiB
            shard_count: 1,
            hash_seed: 0,
            group_size_limit: u64::MAX,
            cancel: MassIndexCancel::default(),
            spill_dir: None,
            spill_threshold: 256 << 20, // 256 MiB
            buffered_bytes: 0,
            runs: Vec::new(),
            spilled_entries: 0,
            spill_error: None,
        }
    }
}

impl MassIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjusts the capacity of the buffered writer used while streaming data.
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.writer_buffer_size = size;
        self
    }

    /// Number of key-hash shards grouped in parallel during finalize.
    ///
    /// The output does not depend on the shard count.
    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count.max(1);
        self
    }

    /// Overrides the seed of the hash distributing keys across shards.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }

    /// Sets a hard cap on the serialized size of any single key group.
    ///
    /// Groups that exceed this limit cause [`finalize`](Self::finalize) to
    /// abort with [`MassIndexError::GroupTooLarge`].
    pub fn with_group_size_limit(mut self, limit: u64) -> Self {
        self.group_size_limit = limit;
        self
    }

    pub fn with_cancellation(mut self, cancel: MassIndexCancel) -> Self {
        self.cancel = cancel;
        self
    }

    /// Spills sorted runs of buffered entries to unnamed temporary files in
    /// `dir` once the buffer exceeds the spill threshold.
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Approximate number of buffered bytes that triggers a spill.
    pub fn with_spill_threshold(mut self, bytes: usize) -> Self {
        self.spill_threshold = bytes.max(1);
        self
    }

    /// Buffers one entry. Keys may repeat and arrive in any order.
    ///
    /// A failed spill is reported by [`finalize`](Self::finalize).
    pub fn add(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.push((key.into(), Some(value.into())));
    }

    /// Registers `key` without adding a value to its group.
    pub fn add_key(&mut self, key: impl Into<Vec<u8>>) {
        self.push((key.into(), None));
    }

    fn push(&mut self, entry: Entry) {
        self.buffered_bytes +=
            entry.0.len() + entry.1.as_ref().map_or(0, |v| v.len()) + ENTRY_OVERHEAD;
        self.entries.push(entry);
        if self.spill_dir.is_some()
            && self.spill_error.is_none()
            && self.buffered_bytes >= self.spill_threshold
        {
            if let Err(e) = self.spill() {
                warn!(error = %e, "failed to spill sorted run");
                self.spill_error = Some(e);
            }
        }
    }

    /// Sorts the buffered entries by key and writes them as one run.
    ///
    /// The sort is stable, so values of a key keep their insertion order.
    fn spill(&mut self) -> Result<()> {
        let Some(dir) = self.spill_dir.clone() else {
            return Ok(());
        };
        let mut entries = std::mem::take(&mut self.entries);
        self.buffered_bytes = 0;
        entries.par_sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = BufWriter::with_capacity(RUN_BUFFER_SIZE, tempfile::tempfile_in(&dir)?);
        for (i, (key, value)) in entries.iter().enumerate() {
            if i % GROUPING_BATCH == 0 {
                self.cancel.check()?;
            }
            codec::write_framed(&mut out, key)?;
            match value {
                Some(value) => {
                    out.write_all(&[1])?;
                    codec::write_framed(&mut out, value)?;
                }
                None => out.write_all(&[0])?,
            }
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        self.spilled_entries += entries.len();
        debug!(
            run = self.runs.len(),
            entries = entries.len(),
            dir = %dir.display(),
            "spilled sorted run"
        );
        self.runs.push(file);
        Ok(())
    }

    /// Number of added entries, including bare keys and spilled entries.
    pub fn len(&self) -> usize {
        self.spilled_entries + self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the builder and writes the store to `writer`.
    ///
    /// # Errors
    ///
    /// [`MassIndexError::Io`] when the writer fails,
    /// [`MassIndexError::Cancelled`] when the cancellation flag is raised and
    /// [`MassIndexError::GroupTooLarge`] when a group exceeds the configured
    /// limit. On error the header is never written, so the output does not
    /// load as a valid store.
    pub fn finalize<W: MassIndexWriter>(mut self, writer: &W) -> Result<MassIndexInfo> {
        if let Some(e) = self.spill_error.take() {
            return Err(e);
        }
        if !self.runs.is_empty() {
            return self.finalize_runs(writer);
        }

        let start = Instant::now();
        let entry_count = self.entries.len();
        let shard_count = self.shard_count;
        let groups = group_entries(self.entries, shard_count, self.hash_seed, &self.cancel)?;
        debug!(
            keys = groups.len(),
            entries = entry_count,
            shards = shard_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "grouped entries"
        );

        let mut store = StoreWriter::new(writer, self.writer_buffer_size, self.group_size_limit);
        for (i, (key, values)) in groups.iter().enumerate() {
            if i % WRITING_BATCH == 0 {
                self.cancel.check()?;
            }
            let begin = store.position();
            for value in values {
                store.write_value(value)?;
            }
            store.end_group(key, begin, values.len() as u64)?;
        }
        self.cancel.check()?;

        let info = store.finish(shard_count as u64)?;
        info!(
            keys = info.meta.key_count,
            entries = info.meta.entry_count,
            bytes = info.file_length,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "finalized massindex"
        );
        Ok(info)
    }

    /// Merges the spilled runs, in spill order, into the store.
    fn finalize_runs<W: MassIndexWriter>(mut self, writer: &W) -> Result<MassIndexInfo> {
        let start = Instant::now();
        if !self.entries.is_empty() {
            self.spill()?;
        }
        let entry_count = self.spilled_entries;
        let mut runs = std::mem::take(&mut self.runs)
            .into_iter()
            .map(SortedRun::open)
            .collect::<Result<Vec<_>>>()?;
        let run_count = runs.len();

        // equal keys pop in increasing run order, which is insertion order
        let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::new();
        for (i, run) in runs.iter().enumerate() {
            if let Some((key, _)) = &run.head {
                heap.push(Reverse((key.clone(), i)));
            }
        }

        let mut store = StoreWriter::new(writer, self.writer_buffer_size, self.group_size_limit);
        let mut written_groups = 0usize;
        while let Some(Reverse((key, first))) = heap.pop() {
            if written_groups % WRITING_BATCH == 0 {
                self.cancel.check()?;
            }
            written_groups += 1;

            let mut sources = vec![first];
            while let Some(Reverse((next_key, next_run))) = heap.peek() {
                if *next_key != key {
                    break;
                }
                sources.push(*next_run);
                heap.pop();
            }

            let begin = store.position();
            let mut count = 0;
            for i in sources {
                let run = &mut runs[i];
                loop {
                    match &run.head {
                        Some((head_key, value)) if *head_key == key => {
                            if let Some(value) = value {
                                store.write_value(value)?;
                                count += 1;
                            }
                        }
                        _ => break,
                    }
                    run.advance()?;
                }
                if let Some((next, _)) = &run.head {
                    heap.push(Reverse((next.clone(), i)));
                }
            }
            store.end_group(&key, begin, count)?;
        }
        self.cancel.check()?;

        let info = store.finish(0)?;
        info!(
            keys = info.meta.key_count,
            entries = entry_count,
            runs = run_count,
            bytes = info.file_length,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "finalized massindex from spilled runs"
        );
        Ok(info)
    }

    /// Consumes the builder and returns the store as an in-memory buffer.
    pub fn finalize_to_vec(self) -> Result<Vec<u8>> {
        let writer = Mutex::new(Vec::new());
        self.finalize(&writer)?;
        writer
            .into_inner()
            .map_err(|_| std::io::Error::other("memory writer lock poisoned").into())
    }

    /// Adds every entry of `entries`, then finalizes into `writer`.
    pub fn build<W, K, V>(
        mut self,
        writer: &W,
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Result<MassIndexInfo>
    where
        W: MassIndexWriter,
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        self.extend(entries);
        self.finalize(writer)
    }
}

impl<K: Into<Vec<u8>>, V: Into<Vec<u8>>> Extend<(K, V)> for MassIndexBuilder {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, entries: I) {
        for (key, value) in entries {
            self.add(key, value);
        }
    }
}

/// Groups entries by key, keeping insertion order inside each group, and
/// returns the groups sorted by key.
fn group_entries(
    entries: Vec<Entry>,
    shard_count: usize,
    hash_seed: u64,
    cancel: &MassIndexCancel,
) -> Result<Vec<Group>> {
    let mut groups = if shard_count <= 1 {
        group_shard(entries, hash_seed, cancel)?
    } else {
        let build_hasher = FixedState::with_seed(hash_seed);
        let mut shards: Vec<Vec<Entry>> = vec![Vec::new(); shard_count];
        for (i, entry) in entries.into_iter().enumerate() {
            if i % GROUPING_BATCH == 0 {
                cancel.check()?;
            }
            let shard = build_hasher.hash_one(&entry.0) % shard_count as u64;
            shards[shard as usize].push(entry);
        }
        let grouped = shards
            .into_par_iter()
            .map(|shard| group_shard(shard, hash_seed, cancel))
            .collect::<Result<Vec<_>>>()?;
        grouped.into_iter().flatten().collect()
    };
    cancel.check()?;
    groups.par_sort_unstable_by(|a, b| a.0.cmp(&b.0));
    Ok(groups)
}

fn group_shard(entries: Vec<Entry>, hash_seed: u64, cancel: &MassIndexCancel) -> Result<Vec<Group>> {
    let mut grouped: HashMap<Vec<u8>, Vec<Vec<u8>>, FixedState> =
        HashMap::with_hasher(FixedState::with_seed(hash_seed));
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i % GROUPING_BATCH == 0 {
            cancel.check()?;
        }
        let values = grouped.entry(key).or_default();
        if let Some(value) = value {
            values.push(value);
        }
    }
    Ok(grouped.into_iter().collect())
}

/// Spilled run of key-sorted entries, read back sequentially.
///
/// Each entry is a framed key, a tag byte (`1` when a framed value follows,
/// `0` for a bare key).
struct SortedRun {
    input: BufReader<File>,
    head: Option<Entry>,
}

impl SortedRun {
    fn open(mut file: File) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let mut run = Self {
            input: BufReader::with_capacity(RUN_BUFFER_SIZE, file),
            head: None,
        };
        run.advance()?;
        Ok(run)
    }

    fn advance(&mut self) -> Result<()> {
        let Some(key) = codec::read_framed(&mut self.input)? else {
            self.head = None;
            return Ok(());
        };
        let mut tag = [0u8; 1];
        std::io::Read::read_exact(&mut self.input, &mut tag)?;
        let value = match tag[0] {
            0 => None,
            1 => Some(
                codec::read_framed(&mut self.input)?
                    .ok_or_else(|| MassIndexError::corrupt("spilled run ends before a value"))?,
            ),
            other => {
                return Err(MassIndexError::corrupt(format!(
                    "invalid entry tag {} in spilled run",
                    other
                )));
            }
        };
        self.head = Some((key, value));
        Ok(())
    }
}

/// Thin wrapper implementing [`std::io::Write`] in terms of [`MassIndexWriter`].
///
/// Each write lands at the next consecutive offset.
struct MassIndexWriterWrapper<'a, W: MassIndexWriter> {
    inner: &'a W,
    offset: u64,
}

impl<W: MassIndexWriter> std::io::Write for MassIndexWriterWrapper<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write_all_at(buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sequential store serializer shared by the builder and the merger.
///
/// Value groups are appended after the header slot; the directory is
/// accumulated in memory and written with the metadata and trailer by
/// [`finish`](Self::finish), which writes the header last.
struct StoreWriter<'a, W: MassIndexWriter> {
    out: BufWriter<MassIndexWriterWrapper<'a, W>>,
    directory: Vec<u8>,
    meta: MassIndexMeta,
    group_size_limit: u64,
}

impl<'a, W: MassIndexWriter> StoreWriter<'a, W> {
    fn new(writer: &'a W, buffer_size: usize, group_size_limit: u64) -> Self {
        Self {
            out: BufWriter::with_capacity(
                buffer_size,
                MassIndexWriterWrapper {
                    inner: writer,
                    offset: MassIndexHeader::SIZE as u64,
                },
            ),
            directory: Vec::new(),
            meta: MassIndexMeta {
                writer: MassIndexMeta::writer_name(),
                ..Default::default()
            },
            group_size_limit,
        }
    }

    /// Absolute offset of the next byte to be written.
    fn position(&self) -> u64 {
        self.out.get_ref().offset + self.out.buffer().len() as u64
    }

    fn write_value(&mut self, value: &[u8]) -> Result<()> {
        codec::write_framed(&mut self.out, value)?;
        Ok(())
    }

    /// Appends already framed values.
    fn write_framed_values(&mut self, data: &[u8]) -> Result<()> {
        self.out.write_all(data)?;
        Ok(())
    }

    fn end_group(&mut self, key: &[u8], begin: u64, count: u64) -> Result<()> {
        let length = self.position() - begin;
        if length > self.group_size_limit {
            return Err(MassIndexError::GroupTooLarge {
                key: String::from_utf8_lossy(key).into_owned(),
                length,
                limit: self.group_size_limit,
            });
        }
        MassIndexDirectory::encode_entry(&mut self.directory, key, count, begin);

        self.meta.key_count += 1;
        self.meta.entry_count += count;
        self.meta.largest_group = self.meta.largest_group.max(count);
        if count == 0 {
            self.meta.empty_groups += 1;
        }
        Ok(())
    }

    fn finish(mut self, shard_count: u64) -> Result<MassIndexInfo> {
        let directory_offset = self.position();
        self.meta.value_length = directory_offset - MassIndexHeader::SIZE as u64;
        self.meta.shard_count = shard_count;

        let meta_data = rmp_serde::to_vec(&self.meta)
            .map_err(|e| std::io::Error::other(format!("Fail to serialize meta: {}", e)))?;
        let header = MassIndexHeader::new(directory_offset, self.directory.len() as u64);
        let meta_length = meta_data.len() as u64;
        let trailer = MassIndexTrailer {
            meta_length,
            checksum: store_checksum(&header, &self.directory, &meta_data, meta_length),
        };

        self.out.write_all(&self.directory)?;
        self.out.write_all(&meta_data)?;
        self.out.write_all(&trailer.serialize())?;
        self.out.flush()?;

        let file_length = self.out.get_ref().offset;
        self.out.get_ref().inner.write_all_at(&header.serialize(), 0)?;

        Ok(MassIndexInfo {
            header,
            meta: self.meta,
            file_length,
            checksum: trailer.checksum,
        })
    }
}

/// Merges finalized stores into one.
///
/// This is the merge step for ingestion that was partitioned across several
/// builders. Keys present in several inputs get the concatenation of their
/// groups, in input order. Groups are copied as raw framed bytes.
#[derive(Debug)]
pub struct MassIndexMerger {
    writer_buffer_size: usize,
    group_size_limit: u64,
    cancel: MassIndexCancel,
}

impl Default for MassIndexMerger {
    fn default() -> Self {
        Self {
            writer_buffer_size: 16 << 20, // 16 MiB
            group_size_limit: u64::MAX,
            cancel: MassIndexCancel::default(),
        }
    }
}

impl MassIndexMerger {
    /// Adjusts the capacity of the buffered writer, which is also the chunk
    /// size used when copying groups.
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.writer_buffer_size = size;
        self
    }

    pub fn with_group_size_limit(mut self, limit: u64) -> Self {
        self.group_size_limit = limit;
        self
    }

    pub fn with_cancellation(mut self, cancel: MassIndexCancel) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn merge<W, R>(self, writer: &W, indexes: &[MassIndex<R>]) -> Result<MassIndexInfo>
    where
        W: MassIndexWriter,
        R: MassIndexReader,
    {
        if indexes.is_empty() {
            return Err(MassIndexError::InvalidInput(
                "no massindex files provided for merging".to_string(),
            ));
        }

        let start = Instant::now();
        let chunk_size = self.writer_buffer_size.max(1) as u64;
        let mut positions = vec![0usize; indexes.len()];
        let mut heap: BinaryHeap<Reverse<(&[u8], usize)>> = BinaryHeap::new();
        for (source, index) in indexes.iter().enumerate() {
            if !index.is_empty() {
                heap.push(Reverse((index.directory().group(0).key.as_ref(), source)));
            }
        }

        let mut store = StoreWriter::new(writer, self.writer_buffer_size, self.group_size_limit);
        let mut sources = Vec::with_capacity(indexes.len());
        let mut written_groups = 0usize;
        while let Some(Reverse((key, source))) = heap.pop() {
            if written_groups % WRITING_BATCH == 0 {
                self.cancel.check()?;
            }
            written_groups += 1;

            // equal keys pop in increasing source order
            sources.clear();
            sources.push(source);
            while let Some(Reverse((next_key, next_source))) = heap.peek() {
                if *next_key != key {
                    break;
                }
                sources.push(*next_source);
                heap.pop();
            }

            let begin = store.position();
            let mut count = 0;
            for &source in &sources {
                let index = &indexes[source];
                let position = positions[source];
                let group = index.directory().group(position);
                let end = group.offset + index.directory().group_length(position);
                let mut offset = group.offset;
                while offset < end {
                    let chunk = (end - offset).min(chunk_size);
                    index
                        .reader()
                        .read_exact_at(offset, chunk, |data| store.write_framed_values(data))?;
                    offset += chunk;
                }
                count += group.count;

                positions[source] += 1;
                if positions[source] < index.len() {
                    let next = index.directory().group(positions[source]).key.as_ref();
                    heap.push(Reverse((next, source)));
                }
            }
            store.end_group(key, begin, count)?;
        }
        self.cancel.check()?;

        let info = store.finish(0)?;
        info!(
            inputs = indexes.len(),
            keys = info.meta.key_count,
            entries = info.meta.entry_count,
            bytes = info.file_length,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "merged massindex files"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::*;

    #[derive(Debug)]
    struct LimitedWriter {
        data: Mutex<Vec<u8>>,
        limit: u64,
    }

    impl LimitedWriter {
        fn new(limit: u64) -> Self {
            Self {
                data: Mutex::new(Vec::new()),
                limit,
            }
        }
    }

    impl MassIndexWriter for LimitedWriter {
        fn write_all_at(&self, data: &[u8], offset: u64) -> std::io::Result<()> {
            if offset + data.len() as u64 > self.limit {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "Write exceeds limit",
                ));
            }
            self.data.write_all_at(data, offset)
        }
    }

    fn load(store: Vec<u8>) -> MassIndex<Vec<u8>> {
        MassIndex::load(store).unwrap()
    }

    fn group(index: &MassIndex<Vec<u8>>, key: &[u8]) -> Vec<Vec<u8>> {
        index.get(key).unwrap().to_vec().unwrap()
    }

    #[test]
    fn test_shorter_write() {
        const N: u64 = 1000;

        let writer = LimitedWriter::new(1 << 20);
        let info = MassIndexBuilder::default()
            .build(&writer, (0..N).map(|i| (i.to_be_bytes(), (i * 7).to_be_bytes())))
            .unwrap();
        let store = writer.data.into_inner().unwrap();
        assert_eq!(store.len() as u64, info.file_length);
        let index = load(store);
        for i in 0..N {
            assert_eq!(group(&index, &i.to_be_bytes()), vec![(i * 7).to_be_bytes()]);
        }

        let writer = LimitedWriter::new(info.file_length - 1);
        let err = MassIndexBuilder::default()
            .build(&writer, (0..N).map(|i| (i.to_be_bytes(), (i * 7).to_be_bytes())))
            .unwrap_err();
        assert!(matches!(err, MassIndexError::Io(_)));
        // the header is written last, so nothing loadable was produced
        let partial = writer.data.into_inner().unwrap();
        assert!(MassIndex::load(partial).is_err());
    }

    #[test]
    fn test_sharded_grouping_matches_single_shard() {
        let entries: Vec<(String, String)> = (0..20_000u32)
            .map(|i| (format!("key{}", (i * 7919) % 1237), i.to_string()))
            .collect();

        let single = MassIndexBuilder::default()
            .with_shard_count(1)
            .build(&Mutex::new(Vec::new()), entries.clone())
            .unwrap();

        let mut sharded = MassIndexBuilder::default()
            .with_shard_count(8)
            .with_hash_seed(42);
        sharded.extend(entries.clone());
        let single_store = {
            let mut builder = MassIndexBuilder::default();
            builder.extend(entries.clone());
            builder.finalize_to_vec().unwrap()
        };
        let sharded_store = sharded.finalize_to_vec().unwrap();

        assert_eq!(single.meta.key_count, 1237);
        let a = load(single_store);
        let b = load(sharded_store);
        assert_eq!(b.meta.shard_count, 8);
        assert!(a.keys().eq(b.keys()));
        for key in a.keys() {
            assert_eq!(group(&a, key), group(&b, key));
        }
    }

    #[test]
    fn test_group_size_limit() {
        let mut builder = MassIndexBuilder::default().with_group_size_limit(16);
        builder.add("ok", "0123456789");
        builder.add("big", "0123456789");
        builder.add("big", "0123456789");
        match builder.finalize_to_vec() {
            Err(MassIndexError::GroupTooLarge { key, length, limit }) => {
                assert_eq!(key, "big");
                assert_eq!(length, 22);
                assert_eq!(limit, 16);
            }
            other => panic!("unexpected result: {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_spilled_runs_match_in_memory() {
        let entries: Vec<(String, String)> = (0..20_000u32)
            .map(|i| (format!("key{}", (i * 7919) % 1237), i.to_string()))
            .collect();
        let spill_dir = tempfile::tempdir().unwrap();

        let mut memory = MassIndexBuilder::default();
        memory.extend(entries.clone());
        memory.add_key("bare");
        let mut spilled = MassIndexBuilder::default()
            .with_spill_dir(spill_dir.path())
            .with_spill_threshold(4096);
        spilled.extend(entries.clone());
        spilled.add_key("bare");
        assert_eq!(spilled.len(), 20_001);

        let a = load(memory.finalize_to_vec().unwrap());
        let b = load(spilled.finalize_to_vec().unwrap());
        assert_eq!(a.meta.key_count, b.meta.key_count);
        assert_eq!(a.meta.entry_count, b.meta.entry_count);
        assert_eq!(b.meta.empty_groups, 1);
        assert!(a.keys().eq(b.keys()));
        for key in a.keys() {
            assert_eq!(group(&a, key), group(&b, key));
        }
        assert_eq!(std::fs::read_dir(spill_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_spill_every_entry() {
        let spill_dir = tempfile::tempdir().unwrap();
        let mut builder = MassIndexBuilder::default()
            .with_spill_dir(spill_dir.path())
            .with_spill_threshold(1);
        builder.add("a", "1");
        builder.add("b", "x");
        builder.add_key("c");
        builder.add("a", "2");
        builder.add("c", "3");
        builder.add("a", "");
        builder.add_key("e");
        assert_eq!(builder.len(), 7);

        let index = load(builder.finalize_to_vec().unwrap());
        assert_eq!(group(&index, b"a"), vec![b"1".to_vec(), b"2".to_vec(), vec![]]);
        assert_eq!(group(&index, b"b"), vec![b"x".to_vec()]);
        assert_eq!(group(&index, b"c"), vec![b"3".to_vec()]);
        assert!(index.get(b"e").unwrap().is_empty());
        assert_eq!(index.meta.shard_count, 0);
    }

    #[test]
    fn test_spill_failure() {
        let spill_dir = tempfile::tempdir().unwrap();
        let mut builder = MassIndexBuilder::default()
            .with_spill_dir(spill_dir.path().join("missing"))
            .with_spill_threshold(1);
        builder.add("a", "1");
        builder.add("b", "2");
        assert!(matches!(
            builder.finalize_to_vec(),
            Err(MassIndexError::Io(_))
        ));
    }

    #[test]
    fn test_cancellation() {
        let cancel = MassIndexCancel::new();
        let mut builder = MassIndexBuilder::default().with_cancellation(cancel.clone());
        for i in 0..100u32 {
            builder.add(i.to_string(), "v");
        }
        assert_eq!(builder.len(), 100);
        cancel.cancel();
        assert!(cancel.is_cancelled());

        let writer = Mutex::new(Vec::new());
        let err = builder.finalize(&writer).unwrap_err();
        assert!(matches!(err, MassIndexError::Cancelled));
        assert!(MassIndex::load(writer.into_inner().unwrap()).is_err());

        let cancel = MassIndexCancel::new();
        cancel.cancel();
        let mut builder = MassIndexBuilder::default()
            .with_shard_count(4)
            .with_cancellation(cancel);
        builder.add("a", "b");
        assert!(matches!(
            builder.finalize_to_vec(),
            Err(MassIndexError::Cancelled)
        ));
    }

    #[test]
    fn test_normal_merge() {
        const P: u64 = 4;
        let threads: Vec<_> = (0..P)
            .map(|part| {
                std::thread::spawn(move || {
                    let mut builder = MassIndexBuilder::default();
                    for i in 0..1000u64 {
                        // keys overlap between parts
                        builder.add(format!("k{:04}", (i * (part + 1)) % 1500), format!("{}:{}", part, i));
                    }
                    load(builder.finalize_to_vec().unwrap())
                })
            })
            .collect();
        let mut parts: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        parts.push(load(MassIndexBuilder::default().finalize_to_vec().unwrap()));

        let writer = Mutex::new(Vec::new());
        let info = MassIndexMerger::default()
            .with_writer_buffer_size(7)
            .merge(&writer, &parts)
            .unwrap();
        let merged = load(writer.into_inner().unwrap());
        assert_eq!(info.meta.entry_count, P * 1000);
        assert_eq!(merged.entry_count(), P * 1000);
        assert_eq!(merged.meta.shard_count, 0);

        let mut expected_keys: Vec<&[u8]> = parts.iter().flat_map(|p| p.keys()).collect();
        expected_keys.sort();
        expected_keys.dedup();
        assert!(merged.keys().eq(expected_keys.iter().copied()));

        for key in merged.keys() {
            let expected: Vec<Vec<u8>> = parts
                .iter()
                .filter(|p| p.contains(key))
                .flat_map(|p| group(p, key))
                .collect();
            assert_eq!(group(&merged, key), expected);
        }
    }

    #[test]
    fn test_merge_keeps_empty_groups() {
        let mut a = MassIndexBuilder::default();
        a.add_key("x");
        a.add("y", "1");
        let mut b = MassIndexBuilder::default();
        b.add("x", "2");
        b.add_key("z");
        let parts = vec![
            load(a.finalize_to_vec().unwrap()),
            load(b.finalize_to_vec().unwrap()),
        ];

        let writer = Mutex::new(Vec::new());
        MassIndexMerger::default().merge(&writer, &parts).unwrap();
        let merged = load(writer.into_inner().unwrap());
        assert_eq!(group(&merged, b"x"), vec![b"2".to_vec()]);
        assert_eq!(group(&merged, b"y"), vec![b"1".to_vec()]);
        assert!(merged.get(b"z").unwrap().is_empty());
        assert_eq!(merged.meta.empty_groups, 1);
    }

    #[test]
    fn test_invalid_merge() {
        let writer = Mutex::new(Vec::new());
        let err = MassIndexMerger::default()
            .merge::<_, Vec<u8>>(&writer, &[])
            .unwrap_err();
        assert!(matches!(err, MassIndexError::InvalidInput(_)));

        let cancel = MassIndexCancel::new();
        cancel.cancel();
        let parts = vec![load(MassIndexBuilder::default().finalize_to_vec().unwrap())];
        let err = MassIndexMerger::default()
            .with_cancellation(cancel)
            .merge(&writer, &parts)
            .unwrap_err();
        assert!(matches!(err, MassIndexError::Cancelled));
    }
}
