use serde::{Deserialize, Serialize};

use crate::{FORMAT_VERSION, MAGIC, MassIndexError, Result};

/// Fixed header at offset zero of every massindex file.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"MIDX"
/// 4       1     version
/// 5       8     directory_offset: u64 BE
/// 13      8     directory_length: u64 BE
/// ```
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MassIndexHeader {
    /// Format version the file was written with.
    pub version: u8,
    /// Offset of the serialized directory; also the end of the value blob.
    pub directory_offset: u64,
    /// Length in bytes of the serialized directory.
    pub directory_length: u64,
}

impl MassIndexHeader {
    pub const SIZE: usize = 4 + 1 + 8 + 8;

    pub fn new(directory_offset: u64, directory_length: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            directory_offset,
            directory_length,
        }
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[..4].copy_from_slice(&MAGIC);
        data[4] = self.version;
        data[5..13].copy_from_slice(&self.directory_offset.to_be_bytes());
        data[13..21].copy_from_slice(&self.directory_length.to_be_bytes());
        data
    }

    /// Parses and validates a header.
    ///
    /// # Errors
    ///
    /// [`MassIndexError::CorruptData`] for a short buffer or a bad magic
    /// number, [`MassIndexError::UnsupportedVersion`] for any version other
    /// than [`FORMAT_VERSION`].
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(MassIndexError::corrupt(format!(
                "header needs {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }
        if data[..4] != MAGIC {
            return Err(MassIndexError::corrupt(format!(
                "invalid magic number: {:?}",
                &data[..4]
            )));
        }
        let version = data[4];
        if version != FORMAT_VERSION {
            return Err(MassIndexError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        Ok(Self {
            version,
            directory_offset: u64::from_be_bytes(data[5..13].try_into().unwrap()),
            directory_length: u64::from_be_bytes(data[13..21].try_into().unwrap()),
        })
    }

    /// End offset of the directory region.
    pub fn directory_end(&self) -> Option<u64> {
        self.directory_offset.checked_add(self.directory_length)
    }
}

/// Fixed trailer closing every massindex file.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MassIndexTrailer {
    /// Length in bytes of the MessagePack [`MassIndexMeta`] block.
    pub meta_length: u64,
    /// CRC-32 over header, directory, metadata and `meta_length`.
    pub checksum: u32,
}

impl MassIndexTrailer {
    pub const SIZE: usize = 8 + 4;

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[..8].copy_from_slice(&self.meta_length.to_be_bytes());
        data[8..].copy_from_slice(&self.checksum.to_be_bytes());
        data
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(MassIndexError::corrupt("truncated trailer"));
        }
        Ok(Self {
            meta_length: u64::from_be_bytes(data[..8].try_into().unwrap()),
            checksum: u32::from_be_bytes(data[8..12].try_into().unwrap()),
        })
    }
}

/// Computes the store checksum. The header is hashed last because it is
/// only known once everything else has been written.
pub(crate) fn store_checksum(
    header: &MassIndexHeader,
    directory: &[u8],
    meta: &[u8],
    meta_length: u64,
) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(directory);
    hasher.update(meta);
    hasher.update(&meta_length.to_be_bytes());
    hasher.update(&header.serialize());
    hasher.finalize()
}

/// Metadata serialized after the directory of every massindex file.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct MassIndexMeta {
    /// Number of distinct keys in the directory.
    pub key_count: u64,
    /// Total number of values across all groups.
    pub entry_count: u64,
    /// Length in bytes of the value blob.
    pub value_length: u64,
    /// Value count of the largest group.
    pub largest_group: u64,
    /// Number of keys registered without any value.
    pub empty_groups: u64,
    /// Number of hash shards used while grouping; zero for stores merged from
    /// other stores or from spilled runs.
    pub shard_count: u64,
    /// Crate name and version that produced the file.
    pub writer: String,
}

impl MassIndexMeta {
    pub(crate) fn writer_name() -> String {
        format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

/// Summary returned by [`MassIndexBuilder::finalize`](crate::MassIndexBuilder::finalize)
/// and [`MassIndex::info`](crate::MassIndex::info).
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct MassIndexInfo {
    pub header: MassIndexHeader,
    pub meta: MassIndexMeta,
    /// Final size of the store in bytes.
    pub file_length: u64,
    pub checksum: u32,
}
