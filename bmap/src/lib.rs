//! The device abstraction consumed by the block-mapping backends.
//!
//! A backend never touches files or sockets directly; it's handed something implementing
//! [`DeviceRo`], which only has to know how to read an exact range of bytes at an absolute
//! offset. How that read is carried out (a regular file, a raw block device, a memory buffer in
//! tests) is entirely up to the frontend.

use std::{
    fmt,
    io::{self, prelude::*},
    sync::Mutex,
};

/// A trait which allows device I/O errors to get some kind of abstraction.
pub trait IoError: fmt::Debug + fmt::Display + std::error::Error + 'static {
    /// Returns whether the operation that failed because of this error should retry. This
    /// corresponds to something like EINTR, not EAGAIN or EWOULDBLOCK.
    fn should_retry(&self) -> bool;
}

/// A type-erased device I/O error, as produced by whatever implements [`DeviceRo`].
pub struct DeviceError {
    inner: Box<dyn IoError>,
}
impl DeviceError {
    pub fn inner(&self) -> &dyn IoError {
        &*self.inner
    }
}
impl fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}
impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}
impl std::error::Error for DeviceError {}

impl<E: IoError> From<E> for DeviceError {
    fn from(err: E) -> Self {
        Self {
            inner: Box::new(err),
        }
    }
}

impl IoError for io::Error {
    fn should_retry(&self) -> bool {
        self.kind() == io::ErrorKind::Interrupted
    }
}

/// Information about a physical disk.
#[derive(Clone, Copy, Debug)]
pub struct DiskInfo {
    pub block_size: u64,
    pub block_count: u64,
}

/// A readonly block device, such as the file /dev/sda, typically implemented by the frontend.
///
/// This trait doesn't require a seeking method, since all reads are supposed to be atomic (as in
/// that the seek and read call cannot be divided).
///
/// This trait only uses shared references to self, so it's up to the implementer to use locking,
/// atomic I/O if possible, or single-threaded interior mutability.
pub trait DeviceRo: fmt::Debug {
    /// Read bytes from the device at a specific offset, blocking. All bytes have to be read,
    /// unlike _read(2)_; a short read is an error, not a partial success.
    fn read_blocking(&self, offset: u64, buffer: &mut [u8]) -> Result<(), DeviceError>;

    /// Retrieve miscellaneous information about the disk, such as block size and the number of
    /// blocks. This method is blocking and may not return immediately.
    fn disk_info_blocking(&self) -> Result<DiskInfo, DeviceError>;
}

/// A device backed by anything `Read + Seek`, mainly intended for testing and for mounting plain
/// image files.
pub struct BasicDevice<D> {
    device: Mutex<D>,
}
impl<D> BasicDevice<D> {
    const BLOCK_SIZE: u64 = 512;

    pub fn new(inner: D) -> Self {
        Self {
            device: Mutex::new(inner),
        }
    }
    pub fn into_inner(self) -> D {
        self.device.into_inner().unwrap()
    }
}

impl<D> fmt::Debug for BasicDevice<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(device)")
    }
}

impl<D: Read + Seek> DeviceRo for BasicDevice<D> {
    fn read_blocking(&self, offset: u64, buffer: &mut [u8]) -> Result<(), DeviceError> {
        let mut guard = self.device.lock().unwrap();

        let _ = guard.seek(io::SeekFrom::Start(offset))?;
        guard.read_exact(buffer)?;

        Ok(())
    }

    fn disk_info_blocking(&self) -> Result<DiskInfo, DeviceError> {
        let size = self.device.lock().unwrap().seek(io::SeekFrom::End(0))?;

        Ok(DiskInfo {
            block_size: Self::BLOCK_SIZE,
            block_count: size / Self::BLOCK_SIZE,
        })
    }
}
