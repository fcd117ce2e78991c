//! The boot storage device, as seen by the mirror reader.

use core::fmt;

use log::debug;

use crate::memory::{Length, StorageAddress, StorageExtent};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceReadError {
    /// The requested range is not on the device.
    OutOfRange { offset: StorageAddress, len: Length },
    NotReady,
    /// The device reported a media or transport error.
    Media,
}

impl fmt::Display for DeviceReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceReadError::OutOfRange { offset, len } => write!(
                f,
                "read of {len} bytes at {:#x} is past the end of the device",
                offset.as_raw()
            ),
            DeviceReadError::NotReady => write!(f, "device not ready"),
            DeviceReadError::Media => write!(f, "media error"),
        }
    }
}

impl core::error::Error for DeviceReadError {}

/// Byte-range reads from an absolute offset. Retries, if any, belong to the
/// implementation.
pub trait BlockDevice {
    /// Fills `buf` from `offset`. On error the contents of `buf` are
    /// unspecified.
    fn read_at(&mut self, offset: StorageAddress, buf: &mut [u8]) -> Result<(), DeviceReadError>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn read_at(&mut self, offset: StorageAddress, buf: &mut [u8]) -> Result<(), DeviceReadError> {
        (**self).read_at(offset, buf)
    }
}

/// Reads `buf.len()` bytes of one mirror at `offset`.
pub fn read_mirror<D: BlockDevice + ?Sized>(
    device: &mut D,
    offset: StorageAddress,
    buf: &mut [u8],
) -> Result<(), DeviceReadError> {
    debug!("read {:#x} bytes at {:#x}", buf.len(), offset.as_raw());
    device.read_at(offset, buf)
}

/// A whole disk image held in memory.
#[derive(Debug)]
pub struct ImageDevice<B> {
    image: B,
}

impl<B: AsRef<[u8]>> ImageDevice<B> {
    pub fn new(image: B) -> Self {
        ImageDevice { image }
    }

    pub fn into_inner(self) -> B {
        self.image
    }
}

impl<B: AsRef<[u8]>> BlockDevice for ImageDevice<B> {
    fn read_at(&mut self, offset: StorageAddress, buf: &mut [u8]) -> Result<(), DeviceReadError> {
        let len = Length::from_raw(buf.len() as u64);
        if buf.is_empty() {
            return Ok(());
        }
        let image = self.image.as_ref();
        let device = StorageExtent::new_checked(StorageAddress::zero(), Length::from_raw(image.len() as u64));
        let request = StorageExtent::new_checked(offset, len);
        match (device, request) {
            (Some(device), Some(request)) if device.contains(request) => {
                let start = offset.as_raw() as usize;
                buf.copy_from_slice(&image[start..start + buf.len()]);
                Ok(())
            }
            _ => Err(DeviceReadError::OutOfRange { offset, len }),
        }
    }
}
