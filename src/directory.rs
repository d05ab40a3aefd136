//! Sorted key directory.
//!
//! The directory maps every key to the location of its value group. It is
//! serialized as a sequence of `(varint key_len, key, varint count, u64 offset)`
//! records in strictly increasing key order, and held fully in memory once a
//! store is loaded. Lookups binary search the sorted keys.

use std::ops::{Bound, Range};

use crate::codec;
use crate::{MassIndexError, Result};

/// Locator of one key group inside the value blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MassIndexGroup {
    pub key: Box<[u8]>,
    /// Number of values in the group.
    pub count: u64,
    /// Absolute offset of the first framed value.
    pub offset: u64,
}

#[derive(Debug, Default)]
pub struct MassIndexDirectory {
    groups: Vec<MassIndexGroup>,
    value_end: u64,
}

impl MassIndexDirectory {
    /// Appends one serialized directory record to `buf`.
    pub(crate) fn encode_entry(buf: &mut Vec<u8>, key: &[u8], count: u64, offset: u64) {
        codec::encode_into(buf, key);
        codec::encode_varint(count, buf);
        buf.extend_from_slice(&offset.to_be_bytes());
    }

    /// Parses a serialized directory whose groups must lie in
    /// `value_start..value_end`.
    ///
    /// # Errors
    ///
    /// Returns [`MassIndexError::CorruptData`] on malformed records, keys out
    /// of order or duplicated, or offsets outside the value blob or going
    /// backwards.
    pub fn parse(data: &[u8], value_start: u64, value_end: u64) -> Result<Self> {
        let mut groups: Vec<MassIndexGroup> = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let (key, next) = codec::decode(data, pos)?;
            let (count, next) = codec::decode_varint(data, next)?;
            let Some(raw_offset) = data.get(next..next + 8) else {
                return Err(MassIndexError::corrupt(format!(
                    "truncated directory record at {}",
                    pos
                )));
            };
            let offset = u64::from_be_bytes(raw_offset.try_into().unwrap());
            pos = next + 8;

            if let Some(prev) = groups.last() {
                if prev.key.as_ref() >= key {
                    return Err(MassIndexError::corrupt(format!(
                        "directory keys out of order at record {}",
                        groups.len()
                    )));
                }
                if offset < prev.offset {
                    return Err(MassIndexError::corrupt(format!(
                        "directory offsets decrease at record {}",
                        groups.len()
                    )));
                }
            } else if offset != value_start {
                return Err(MassIndexError::corrupt(format!(
                    "first group starts at {} instead of {}",
                    offset, value_start
                )));
            }
            if offset < value_start || offset > value_end {
                return Err(MassIndexError::corrupt(format!(
                    "group offset {} outside value blob {}..{}",
                    offset, value_start, value_end
                )));
            }

            groups.push(MassIndexGroup {
                key: key.into(),
                count,
                offset,
            });
        }

        let directory = Self { groups, value_end };
        for index in 0..directory.groups.len() {
            let count = directory.groups[index].count;
            let length = directory.group_length(index);
            // Each framed value takes at least its one-byte length prefix.
            if (count == 0) != (length == 0) || length < count {
                return Err(MassIndexError::corrupt(format!(
                    "group {} holds {} values in {} bytes",
                    index, count, length
                )));
            }
        }
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[MassIndexGroup] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> &MassIndexGroup {
        &self.groups[index]
    }

    /// Position of `key` in the directory.
    pub fn find(&self, key: &[u8]) -> Option<usize> {
        self.groups
            .binary_search_by(|group| group.key.as_ref().cmp(key))
            .ok()
    }

    /// Byte length of the group at `index`, derived from the next group's offset.
    pub fn group_length(&self, index: usize) -> u64 {
        let end = match self.groups.get(index + 1) {
            Some(next) => next.offset,
            None => self.value_end,
        };
        end - self.groups[index].offset
    }

    /// Directory positions of the keys within the given bounds.
    pub fn range_indices(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Range<usize> {
        let lower = match start {
            Bound::Included(key) => self.groups.partition_point(|g| g.key.as_ref() < key),
            Bound::Excluded(key) => self.groups.partition_point(|g| g.key.as_ref() <= key),
            Bound::Unbounded => 0,
        };
        let upper = match end {
            Bound::Included(key) => self.groups.partition_point(|g| g.key.as_ref() <= key),
            Bound::Excluded(key) => self.groups.partition_point(|g| g.key.as_ref() < key),
            Bound::Unbounded => self.groups.len(),
        };
        lower..upper.max(lower)
    }
}
