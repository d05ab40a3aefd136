//! Immutable, disk-backed indexes mapping byte-string keys to lists of values.
//!
//! The `massindex` crate builds a single self-describing file from a stream of
//! `(key, value)` pairs and serves lookups from it with bounded memory. All
//! values of one key form a contiguous *group* in the file; a sorted directory
//! maps every key to its group, so a lookup is one binary search followed by a
//! single sequential read. Values are read lazily, one at a time, which keeps
//! arbitrarily large groups streamable.
//!
//! Typical usage collects entries with [`MassIndexBuilder`], writes them to a
//! file and opens the result with [`MassIndex`]:
//!
//! ```
//! use massindex::{MassIndex, MassIndexBuilder};
//!
//! # fn main() -> massindex::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("fruits.midx");
//!
//! let file = std::fs::File::create(&path)?;
//! MassIndexBuilder::default().build(
//!     &file,
//!     [("apple", "red"), ("banana", "yellow"), ("apple", "green")],
//! )?;
//!
//! let index = MassIndex::open(&path)?;
//! let apples = index.get(b"apple").unwrap().to_vec()?;
//! assert_eq!(apples, vec![b"red".to_vec(), b"green".to_vec()]);
//! assert!(index.get(b"cherry").is_none());
//! # Ok(())
//! # }
//! ```

/// Magic number at the start of every massindex file.
pub const MAGIC: [u8; 4] = *b"MIDX";
/// Layout version written by this crate and the only version it loads.
pub const FORMAT_VERSION: u8 = 1;

pub mod codec;

mod error;
pub use error::{MassIndexError, Result};

mod meta;
pub use meta::{MassIndexHeader, MassIndexInfo, MassIndexMeta, MassIndexTrailer};

mod directory;
pub use directory::{MassIndexDirectory, MassIndexGroup};

mod reader;
pub use reader::MassIndexReader;

mod writer;
pub use writer::MassIndexWriter;

mod massindex;
pub use massindex::{MassIndex, MassIndexIter, MassIndexValueIter, MassIndexValues};

mod builder;
pub use builder::{MassIndexBuilder, MassIndexCancel, MassIndexMerger};

mod shared;
pub use shared::{MassIndexState, SharedMassIndex};

mod tsv;
pub use tsv::TsvEntries;
