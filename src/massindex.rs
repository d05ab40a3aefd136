use std::fs::File;
use std::ops::{Bound, Range, RangeBounds};
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;

use crate::codec::{self, MAX_VARINT_LEN};
use crate::meta::store_checksum;
use crate::{
    MassIndexDirectory, MassIndexError, MassIndexHeader, MassIndexInfo, MassIndexMeta,
    MassIndexReader, MassIndexTrailer, Result,
};

/// Immutable multi-valued index backed by a serialized massindex file.
///
/// A `MassIndex` is created from a [`MassIndexReader`] (a file, a memory map or
/// an in-memory buffer). Loading reads only the header, the directory and the
/// metadata; value groups are read lazily, one value at a time, when a
/// [`MassIndexValues`] handle is iterated. A loaded index holds no mutable
/// state and can be shared between threads.
#[derive(Debug)]
pub struct MassIndex<R: MassIndexReader> {
    /// Fixed header of the backing file.
    pub header: MassIndexHeader,
    /// Metadata block written by the builder.
    pub meta: MassIndexMeta,
    /// Fixed trailer of the backing file.
    pub trailer: MassIndexTrailer,
    directory: MassIndexDirectory,
    reader: R,
}

impl MassIndex<File> {
    /// Opens a store for positional reads through the file handle.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(File::open(path)?)
    }
}

impl MassIndex<Mmap> {
    /// Opens a store through a read-only memory map.
    ///
    /// The file must not be truncated or rewritten while the index is alive.
    pub fn open_mmap(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::load(mmap)
    }
}

impl<R: MassIndexReader> MassIndex<R> {
    /// Constructs an index from a [`MassIndexReader`] implementation.
    ///
    /// Validates the header (magic number and format version), the trailer,
    /// the region bounds and the checksum, then parses the directory.
    ///
    /// # Errors
    ///
    /// [`MassIndexError::CorruptData`] for malformed, truncated or damaged
    /// stores, [`MassIndexError::UnsupportedVersion`] for a different format
    /// version and [`MassIndexError::Io`] when the reader fails.
    pub fn load(reader: R) -> Result<Self> {
        let size = reader.size()?;
        const MIN_SIZE: u64 = (MassIndexHeader::SIZE + MassIndexTrailer::SIZE) as u64;
        if size < MIN_SIZE {
            return Err(MassIndexError::corrupt(format!(
                "file of {} bytes is smaller than the minimum {}",
                size, MIN_SIZE
            )));
        }

        let header = reader.read_exact_at(0, MassIndexHeader::SIZE as u64, |data| {
            MassIndexHeader::deserialize(data)
        })?;
        let trailer_offset = size - MassIndexTrailer::SIZE as u64;
        let trailer = reader.read_exact_at(
            trailer_offset,
            MassIndexTrailer::SIZE as u64,
            MassIndexTrailer::deserialize,
        )?;

        let value_start = MassIndexHeader::SIZE as u64;
        let meta_end = header
            .directory_end()
            .and_then(|end| end.checked_add(trailer.meta_length));
        if header.directory_offset < value_start || meta_end != Some(trailer_offset) {
            return Err(MassIndexError::corrupt(format!(
                "regions (directory {}+{}, meta {}) do not match file size {}",
                header.directory_offset, header.directory_length, trailer.meta_length, size
            )));
        }

        let (meta, directory) = reader.read_exact_at(
            header.directory_offset,
            trailer_offset - header.directory_offset,
            |data| {
                let (directory_data, meta_data) = data.split_at(header.directory_length as usize);
                let checksum =
                    store_checksum(&header, directory_data, meta_data, trailer.meta_length);
                if checksum != trailer.checksum {
                    return Err(MassIndexError::corrupt(format!(
                        "checksum mismatch: stored {:#010x}, computed {:#010x}",
                        trailer.checksum, checksum
                    )));
                }
                let meta: MassIndexMeta = rmp_serde::from_slice(meta_data).map_err(|e| {
                    MassIndexError::corrupt(format!("failed to deserialize meta: {}", e))
                })?;
                let directory =
                    MassIndexDirectory::parse(directory_data, value_start, header.directory_offset)?;
                Ok((meta, directory))
            },
        )?;

        let entry_count: u64 = directory.groups().iter().map(|g| g.count).sum();
        if meta.key_count != directory.len() as u64
            || meta.entry_count != entry_count
            || meta.value_length != header.directory_offset - value_start
        {
            return Err(MassIndexError::corrupt(
                "metadata disagrees with directory contents",
            ));
        }

        debug!(
            keys = meta.key_count,
            entries = meta.entry_count,
            size,
            "loaded massindex"
        );
        Ok(MassIndex {
            header,
            meta,
            trailer,
            directory,
            reader,
        })
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Total number of values across all keys.
    pub fn entry_count(&self) -> u64 {
        self.meta.entry_count
    }

    pub fn directory(&self) -> &MassIndexDirectory {
        &self.directory
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Summary of the loaded store, as returned by the builder.
    pub fn info(&self) -> MassIndexInfo {
        MassIndexInfo {
            header: self.header,
            meta: self.meta.clone(),
            file_length: self.header.directory_offset
                + self.header.directory_length
                + self.trailer.meta_length
                + MassIndexTrailer::SIZE as u64,
            checksum: self.trailer.checksum,
        }
    }

    /// Looks up the value group of `key`.
    ///
    /// Returns `None` when the key is absent. Only the directory is consulted;
    /// values are read when the returned handle is iterated.
    pub fn get(&self, key: &[u8]) -> Option<MassIndexValues<'_, R>> {
        self.directory.find(key).map(|index| self.values_at(index))
    }

    /// Whether `key` is present, with or without values.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.directory.find(key).is_some()
    }

    /// All keys in directory (byte-lexicographic) order.
    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &[u8]> + ExactSizeIterator + '_ {
        self.directory.groups().iter().map(|group| group.key.as_ref())
    }

    /// Iterates over every key together with its value group.
    ///
    /// ```
    /// use massindex::{MassIndex, MassIndexBuilder};
    ///
    /// # fn main() -> massindex::Result<()> {
    /// let mut builder = MassIndexBuilder::default();
    /// builder.add("b", "2");
    /// builder.add("a", "1");
    /// let store = builder.finalize_to_vec()?;
    ///
    /// let index = MassIndex::load(store)?;
    /// let keys: Vec<_> = index.iter().map(|(key, _)| key.to_vec()).collect();
    /// assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn iter(&self) -> MassIndexIter<'_, R> {
        MassIndexIter {
            index: self,
            positions: 0..self.directory.len(),
        }
    }

    /// Iterates over the keys within `range`, in order.
    pub fn range<'k>(&self, range: impl RangeBounds<&'k [u8]>) -> MassIndexIter<'_, R> {
        MassIndexIter {
            index: self,
            positions: self
                .directory
                .range_indices(range.start_bound().cloned(), range.end_bound().cloned()),
        }
    }

    /// Iterates over the keys starting with `prefix`, in order.
    pub fn prefix(&self, prefix: &[u8]) -> MassIndexIter<'_, R> {
        let start = self
            .directory
            .range_indices(Bound::Included(prefix), Bound::Unbounded)
            .start;
        let matching = self.directory.groups()[start..]
            .partition_point(|group| group.key.starts_with(prefix));
        MassIndexIter {
            index: self,
            positions: start..start + matching,
        }
    }

    fn values_at(&self, index: usize) -> MassIndexValues<'_, R> {
        let group = self.directory.group(index);
        MassIndexValues {
            reader: &self.reader,
            offset: group.offset,
            length: self.directory.group_length(index),
            count: group.count,
        }
    }
}

/// Handle over one key group.
///
/// The handle is a plain locator; every call to [`iter`](Self::iter) starts a
/// fresh pass over the group from its first value.
#[derive(Debug)]
pub struct MassIndexValues<'a, R: MassIndexReader> {
    reader: &'a R,
    offset: u64,
    length: u64,
    count: u64,
}

impl<R: MassIndexReader> Clone for MassIndexValues<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: MassIndexReader> Copy for MassIndexValues<'_, R> {}

impl<'a, R: MassIndexReader> MassIndexValues<'a, R> {
    /// Number of values in the group.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Serialized size of the group in bytes.
    pub fn byte_length(&self) -> u64 {
        self.length
    }

    pub fn iter(&self) -> MassIndexValueIter<'a, R> {
        MassIndexValueIter {
            reader: self.reader,
            offset: self.offset,
            end: self.offset + self.length,
            remaining: self.count,
        }
    }

    /// Reads only the first value of the group.
    pub fn first(&self) -> Result<Option<Vec<u8>>> {
        self.iter().next().transpose()
    }

    /// Reads the whole group into memory.
    pub fn to_vec(&self) -> Result<Vec<Vec<u8>>> {
        self.iter().collect()
    }
}

impl<'a, R: MassIndexReader> IntoIterator for MassIndexValues<'a, R> {
    type Item = Result<Vec<u8>>;
    type IntoIter = MassIndexValueIter<'a, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Cursor over the values of one group: an offset and a remaining count.
///
/// Each step reads the length prefix and then exactly one value. The iterator
/// stops after the first error.
#[derive(Debug)]
pub struct MassIndexValueIter<'a, R: MassIndexReader> {
    reader: &'a R,
    offset: u64,
    end: u64,
    remaining: u64,
}

impl<R: MassIndexReader> MassIndexValueIter<'_, R> {
    fn read_next(&mut self) -> Result<Vec<u8>> {
        let prefix_length = (self.end - self.offset).min(MAX_VARINT_LEN as u64);
        let (length, prefix_end) = self
            .reader
            .read_exact_at(self.offset, prefix_length, |data| {
                codec::decode_varint(data, 0)
            })?;

        let value_offset = self.offset + prefix_end as u64;
        if length > self.end - value_offset {
            return Err(MassIndexError::corrupt(format!(
                "value of {} bytes at offset {} overruns its group ending at {}",
                length, value_offset, self.end
            )));
        }
        let value = self
            .reader
            .read_exact_at(value_offset, length, |data| Ok(data.to_vec()))?;
        self.offset = value_offset + length;
        Ok(value)
    }
}

impl<R: MassIndexReader> Iterator for MassIndexValueIter<'_, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.read_next() {
            Ok(value) => {
                self.remaining -= 1;
                Some(Ok(value))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

/// Iterator over `(key, values)` pairs of a [`MassIndex`] in directory order.
#[derive(Debug)]
pub struct MassIndexIter<'a, R: MassIndexReader> {
    index: &'a MassIndex<R>,
    positions: Range<usize>,
}

impl<'a, R: MassIndexReader> Iterator for MassIndexIter<'a, R> {
    type Item = (&'a [u8], MassIndexValues<'a, R>);

    fn next(&mut self) -> Option<Self::Item> {
        let position = self.positions.next()?;
        let index = self.index;
        Some((
            index.directory.group(position).key.as_ref(),
            index.values_at(position),
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.positions.size_hint()
    }
}

impl<R: MassIndexReader> DoubleEndedIterator for MassIndexIter<'_, R> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let position = self.positions.next_back()?;
        let index = self.index;
        Some((
            index.directory.group(position).key.as_ref(),
            index.values_at(position),
        ))
    }
}

impl<R: MassIndexReader> ExactSizeIterator for MassIndexIter<'_, R> {}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use rand::Rng;

    use crate::*;

    fn build(entries: &[(&str, &str)]) -> MassIndex<Vec<u8>> {
        let mut builder = MassIndexBuilder::default();
        for (key, value) in entries {
            builder.add(*key, *value);
        }
        MassIndex::load(builder.finalize_to_vec().unwrap()).unwrap()
    }

    fn values<R: MassIndexReader>(index: &MassIndex<R>, key: &str) -> Option<Vec<String>> {
        index.get(key.as_bytes()).map(|group| {
            group
                .iter()
                .map(|value| String::from_utf8(value.unwrap()).unwrap())
                .collect()
        })
    }

    #[test]
    fn test_basic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basic.massindex");
        let writer = std::fs::File::create(&path).unwrap();

        let mut builder = MassIndexBuilder::default().with_writer_buffer_size(64);
        builder.extend([
            ("apple", "red"),
            ("banana", "yellow"),
            ("apple", "green"),
            ("cherry", "red"),
        ]);
        let info = builder.finalize(&writer).unwrap();
        assert_eq!(info.meta.key_count, 3);
        assert_eq!(info.meta.entry_count, 4);
        assert_eq!(info.meta.largest_group, 2);

        let file = std::fs::File::open(&path).unwrap();
        assert_eq!(info.file_length, file.metadata().unwrap().len());
        let index = MassIndex::load(file).unwrap();
        assert_eq!(index.info(), info);
        assert_eq!(index.len(), 3);
        assert_eq!(index.entry_count(), 4);
        assert_eq!(values(&index, "apple").unwrap(), ["red", "green"]);
        assert_eq!(values(&index, "banana").unwrap(), ["yellow"]);
        assert_eq!(values(&index, "durian"), None);
        assert!(index.contains(b"cherry"));
        assert!(!index.contains(b"cherr"));
        assert_eq!(
            index.get(b"cherry").unwrap().first().unwrap(),
            Some(b"red".to_vec())
        );
    }

    #[test]
    fn test_interleaved_duplicates() {
        let index = build(&[("a", "1"), ("b", "x"), ("a", "2"), ("c", "y"), ("a", "1")]);
        // duplicates are kept, in insertion order
        assert_eq!(values(&index, "a").unwrap(), ["1", "2", "1"]);
        assert_eq!(values(&index, "b").unwrap(), ["x"]);
        assert_eq!(index.get(b"a").unwrap().len(), 3);
    }

    #[test]
    fn test_empty_store() {
        let index = build(&[]);
        assert!(index.is_empty());
        assert_eq!(index.keys().count(), 0);
        assert!(index.get(b"").is_none());
        assert!(index.get(b"anything").is_none());
        assert_eq!(index.iter().count(), 0);
    }

    #[test]
    fn test_zero_length_keys_and_values() {
        let index = build(&[("", ""), ("", "v"), ("k", "")]);
        assert_eq!(values(&index, "").unwrap(), ["", "v"]);
        assert_eq!(values(&index, "k").unwrap(), [""]);
        assert_eq!(index.keys().collect::<Vec<_>>(), vec![&b""[..], &b"k"[..]]);
    }

    #[test]
    fn test_keys_sorted_and_restartable() {
        let index = build(&[("pear", "1"), ("apple", "2"), ("fig", "3"), ("apple", "4")]);
        let first: Vec<_> = index.keys().collect();
        let second: Vec<_> = index.keys().collect();
        assert_eq!(first, vec![&b"apple"[..], &b"fig"[..], &b"pear"[..]]);
        assert_eq!(first, second);
        assert_eq!(index.keys().rev().next(), Some(&b"pear"[..]));

        let group = index.get(b"apple").unwrap();
        let mut iter = group.iter();
        assert_eq!(iter.next().unwrap().unwrap(), b"2");
        // a fresh iterator restarts from the first value
        assert_eq!(group.to_vec().unwrap(), vec![b"2".to_vec(), b"4".to_vec()]);
        assert_eq!(iter.next().unwrap().unwrap(), b"4");
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_idempotent_load() {
        let mut builder = MassIndexBuilder::default();
        for i in 0..500u32 {
            builder.add(format!("key-{}", i % 97), i.to_string());
        }
        let store = builder.finalize_to_vec().unwrap();
        let first = MassIndex::load(store.clone()).unwrap();
        let second = MassIndex::load(store).unwrap();
        assert!(first.keys().eq(second.keys()));
        assert_eq!(first.meta, second.meta);
    }

    #[test]
    fn test_range_and_prefix() {
        let index = build(&[
            ("user:1", "a"),
            ("user:2", "b"),
            ("user:10", "c"),
            ("group:1", "d"),
            ("video:1", "e"),
        ]);
        fn keys(iter: MassIndexIter<'_, Vec<u8>>) -> Vec<String> {
            iter.map(|(key, _)| String::from_utf8(key.to_vec()).unwrap())
                .collect()
        }
        assert_eq!(keys(index.prefix(b"user:")), ["user:1", "user:10", "user:2"]);
        assert_eq!(keys(index.prefix(b"zzz")), Vec::<String>::new());
        assert_eq!(keys(index.prefix(b"")).len(), 5);

        let from: &[u8] = b"group";
        let to: &[u8] = b"user:10";
        assert_eq!(keys(index.range(from..to)), ["group:1", "user:1"]);
        assert_eq!(keys(index.range(from..=to)), ["group:1", "user:1", "user:10"]);
        assert_eq!(keys(index.range(to..)), ["user:10", "user:2", "video:1"]);
        assert_eq!(index.range(..).len(), 5);

        let (key, group) = index.range(to..).next_back().unwrap();
        assert_eq!(key, b"video:1");
        assert_eq!(group.first().unwrap().unwrap(), b"e");
    }

    #[test]
    fn test_large_value() {
        let large: Vec<u8> = (0..5_000_000u32).map(|i| (i % 251) as u8).collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.massindex");
        let writer = std::fs::File::create(&path).unwrap();

        let mut builder = MassIndexBuilder::default().with_writer_buffer_size(4096);
        builder.add("small", "x");
        builder.add("large", large.clone());
        builder.add("large", "tail");
        builder.finalize(&writer).unwrap();

        let index = MassIndex::open(&path).unwrap();
        let group = index.get(b"large").unwrap();
        let all = group.to_vec().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0] == large);
        assert_eq!(all[1], b"tail");

        let mapped = MassIndex::open_mmap(&path).unwrap();
        assert!(mapped.get(b"large").unwrap().first().unwrap().unwrap() == large);
        assert_eq!(mapped.get(b"small").unwrap().first().unwrap().unwrap(), b"x");
    }

    #[test]
    fn test_random_round_trip() {
        let mut rng = rand::rng();
        let mut expected: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
        let mut builder = MassIndexBuilder::default().with_shard_count(4);
        for _ in 0..5000 {
            let key = format!("k{}", rng.random_range(0..300)).into_bytes();
            let length = rng.random_range(0..40);
            let value: Vec<u8> = (0..length).map(|_| rng.random()).collect();
            expected.entry(key.clone()).or_default().push(value.clone());
            builder.add(key, value);
        }

        let index = MassIndex::load(builder.finalize_to_vec().unwrap()).unwrap();
        assert_eq!(index.len(), expected.len());
        assert_eq!(index.entry_count(), 5000);
        for (key, values) in &expected {
            assert_eq!(&index.get(key).unwrap().to_vec().unwrap(), values);
        }
        for _ in 0..10 {
            let absent = format!("absent{}", rng.random::<u32>());
            assert!(index.get(absent.as_bytes()).is_none());
        }
    }

    #[test]
    fn test_concurrent_readers() {
        let mut builder = MassIndexBuilder::default();
        for i in 0..1000u64 {
            builder.add(i.to_be_bytes(), (i * 2).to_be_bytes());
            builder.add(i.to_be_bytes(), (i * 3).to_be_bytes());
        }
        let index = Arc::new(MassIndex::load(builder.finalize_to_vec().unwrap()).unwrap());

        let threads: Vec<_> = (0..4u64)
            .map(|t| {
                let index = index.clone();
                std::thread::spawn(move || {
                    for i in (t * 250)..((t + 1) * 250) {
                        let group = index.get(&i.to_be_bytes()).unwrap();
                        let values = group.to_vec().unwrap();
                        assert_eq!(values, vec![(i * 2).to_be_bytes(), (i * 3).to_be_bytes()]);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn test_truncated_store() {
        let mut builder = MassIndexBuilder::default();
        for i in 0..100u32 {
            builder.add(format!("key{}", i), format!("value{}", i));
        }
        let store = builder.finalize_to_vec().unwrap();
        for cut in [1, 4, 11, 12, 13, 100, store.len() - 1, store.len()] {
            let truncated = store[..store.len() - cut].to_vec();
            let err = MassIndex::load(truncated).unwrap_err();
            assert!(err.is_corrupt(), "cut {}: {}", cut, err);
        }
    }

    #[test]
    fn test_corrupted_store() {
        let mut builder = MassIndexBuilder::default();
        builder.extend([("a", "1"), ("b", "2"), ("c", "3")]);
        let info_store = builder.finalize_to_vec().unwrap();
        let index = MassIndex::load(info_store.clone()).unwrap();
        let directory_offset = index.header.directory_offset as usize;

        // version byte
        let mut store = info_store.clone();
        store[4] = 2;
        assert!(matches!(
            MassIndex::load(store),
            Err(MassIndexError::UnsupportedVersion { found: 2, supported: 1 })
        ));

        // magic number
        let mut store = info_store.clone();
        store[0] = b'X';
        assert!(MassIndex::load(store).unwrap_err().is_corrupt());

        // directory byte, caught by the checksum
        let mut store = info_store.clone();
        store[directory_offset + 1] ^= 0xFF;
        assert!(MassIndex::load(store).unwrap_err().is_corrupt());

        // trailing checksum
        let mut store = info_store.clone();
        let last = store.len() - 1;
        store[last] ^= 0x01;
        assert!(MassIndex::load(store).unwrap_err().is_corrupt());

        // garbage
        assert!(MassIndex::load(b"not a store at all, really".to_vec()).unwrap_err().is_corrupt());
        assert!(MassIndex::load(Vec::new()).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_corrupted_value_blob() {
        let mut builder = MassIndexBuilder::default();
        builder.extend([("a", "first"), ("a", "second")]);
        let mut store = builder.finalize_to_vec().unwrap();

        // The value blob is not covered by the checksum: damage shows up when
        // the group is read, never as a wrong answer past the group boundary.
        store[MassIndexHeader::SIZE] = 0x7F;
        let index = MassIndex::load(store).unwrap();
        let mut iter = index.get(b"a").unwrap().iter();
        assert!(iter.next().unwrap().unwrap_err().is_corrupt());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_empty_group() {
        let mut builder = MassIndexBuilder::default();
        builder.add_key("lonely");
        builder.add("other", "v");
        let index = MassIndex::load(builder.finalize_to_vec().unwrap()).unwrap();
        assert_eq!(index.meta.empty_groups, 1);
        assert!(index.contains(b"lonely"));
        let group = index.get(b"lonely").unwrap();
        assert!(group.is_empty());
        assert_eq!(group.first().unwrap(), None);
        assert_eq!(values(&index, "other").unwrap(), ["v"]);
    }
}
