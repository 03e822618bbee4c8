mod local;

pub use local::LocalFileReader;

use async_trait::async_trait;
use std::io;

/// Trait for random access reading from a data source
///
/// Implementations must not share a seek cursor between calls, so any number
/// of tasks can read different offsets at once.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Fill the whole buffer starting at `offset`, or fail with `UnexpectedEof`.
    async fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.read_at(offset, buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("unexpected end of data at offset {}", offset),
                ));
            }
            offset += n as u64;
            let rest = buf;
            buf = &mut rest[n..];
        }
        Ok(())
    }
}
