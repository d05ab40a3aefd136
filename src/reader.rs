use std::io::ErrorKind;
use std::sync::Arc;

use crate::{MassIndexError, Result};

/// Trait abstracting read access to massindex files.
///
/// Implementations must support positional reads without mutating shared
/// state, so a single reader can serve any number of threads. Implemented for
/// files (positional IO), memory maps and in-memory byte buffers.
pub trait MassIndexReader {
    /// Total size of the underlying store in bytes.
    fn size(&self) -> Result<u64>;

    /// Reads `length` bytes starting at `offset` and forwards them to `f`.
    ///
    /// A range that cannot be satisfied in full is reported as
    /// [`MassIndexError::CorruptData`].
    fn read_exact_at<F, T>(&self, offset: u64, length: u64, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>;
}

fn short_read(offset: u64, length: u64) -> MassIndexError {
    MassIndexError::corrupt(format!(
        "short read of {} bytes at offset {}",
        length, offset
    ))
}

fn read_slice<F, T>(data: &[u8], offset: u64, length: u64, f: F) -> Result<T>
where
    F: FnOnce(&[u8]) -> Result<T>,
{
    let end = offset
        .checked_add(length)
        .filter(|&end| end <= data.len() as u64)
        .ok_or_else(|| short_read(offset, length))?;
    f(&data[offset as usize..end as usize])
}

impl MassIndexReader for [u8] {
    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_exact_at<F, T>(&self, offset: u64, length: u64, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        read_slice(self, offset, length, f)
    }
}

impl MassIndexReader for Vec<u8> {
    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_exact_at<F, T>(&self, offset: u64, length: u64, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        read_slice(self, offset, length, f)
    }
}

impl MassIndexReader for memmap2::Mmap {
    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_exact_at<F, T>(&self, offset: u64, length: u64, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        read_slice(self, offset, length, f)
    }
}

impl MassIndexReader for std::fs::File {
    fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    #[cfg(unix)]
    fn read_exact_at<F, T>(&self, offset: u64, length: u64, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        use std::os::unix::fs::FileExt;

        let mut buffer = vec![0u8; length as usize];
        match FileExt::read_exact_at(self, &mut buffer, offset) {
            Ok(()) => f(&buffer),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(short_read(offset, length)),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(windows)]
    fn read_exact_at<F, T>(&self, offset: u64, length: u64, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        use std::os::windows::fs::FileExt;

        let mut buffer = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.seek_read(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => return Err(short_read(offset, length)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        f(&buffer)
    }
}

impl<R: MassIndexReader + ?Sized> MassIndexReader for &R {
    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn read_exact_at<F, T>(&self, offset: u64, length: u64, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        (**self).read_exact_at(offset, length, f)
    }
}

impl<R: MassIndexReader + ?Sized> MassIndexReader for Arc<R> {
    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn read_exact_at<F, T>(&self, offset: u64, length: u64, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        (**self).read_exact_at(offset, length, f)
    }
}
