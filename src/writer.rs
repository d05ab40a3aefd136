use std::io::Result;
use std::sync::Mutex;

/// Trait representing positional writers suitable for massindex serialization.
///
/// Writers must support writing arbitrary byte slices at fixed offsets through
/// a shared reference. The header is written at offset zero only after
/// everything else, so an interrupted build never leaves a loadable store.
pub trait MassIndexWriter {
    /// Writes all of `data` at the given absolute `offset`.
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()>;
}

#[cfg(unix)]
impl MassIndexWriter for std::fs::File {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, data, offset)
    }
}

#[cfg(windows)]
impl MassIndexWriter for std::fs::File {
    fn write_all_at(&self, mut data: &[u8], mut offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;

        while !data.is_empty() {
            match self.seek_write(data, offset) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ));
                }
                Ok(n) => {
                    data = &data[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// In-memory sink, used by [`MassIndexBuilder::finalize_to_vec`](crate::MassIndexBuilder::finalize_to_vec).
impl MassIndexWriter for Mutex<Vec<u8>> {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut buffer = self
            .lock()
            .map_err(|_| std::io::Error::other("memory writer lock poisoned"))?;
        let end = offset as usize + data.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[offset as usize..end].copy_from_slice(data);
        Ok(())
    }
}

impl<W: MassIndexWriter + ?Sized> MassIndexWriter for &W {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        (**self).write_all_at(data, offset)
    }
}
