//! Block storage consumed by the cache.
//!
//! A [Disk] transfers whole blocks between memory and one or more devices. Both operations block
//! the calling thread until the transfer completes (or fails). Implementations are responsible for
//! their own synchronization: the cache may issue transfers for different blocks from many threads
//! at once, but never two concurrent transfers for the same block.
//!
//! # Implementations
//!
//! - [memory::Disk]: blocks kept in a map, with fault injection for tests.
//! - [file::Disk]: one fixed-size image file per device.
//! - [metered::Disk]: wraps another [Disk] and counts transfers.

use thiserror::Error;

#[cfg(unix)]
pub mod file;
pub mod memory;
pub mod metered;

/// Errors that can occur when transferring a block.
#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer size mismatch: expected {expected} got {actual}")]
    BufferSize { expected: usize, actual: usize },
    #[error("block out of range: {0}/{1}")]
    OutOfRange(u32, u64),
    #[error("injected fault: {0}/{1}")]
    Injected(u32, u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous, block-granular storage.
pub trait Disk: Send + Sync + 'static {
    /// The size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Fill `buf` with the content of block `block` on device `dev`.
    ///
    /// `buf` must be exactly [Disk::block_size] bytes long.
    fn read_block(&self, dev: u32, block: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Persist `buf` as the content of block `block` on device `dev`.
    ///
    /// `buf` must be exactly [Disk::block_size] bytes long.
    fn write_block(&self, dev: u32, block: u64, buf: &[u8]) -> Result<(), Error>;
}

/// Ensure `len` matches the block size of a disk.
pub(crate) fn check_len(block_size: usize, len: usize) -> Result<(), Error> {
    if len != block_size {
        return Err(Error::BufferSize {
            expected: block_size,
            actual: len,
        });
    }
    Ok(())
}
