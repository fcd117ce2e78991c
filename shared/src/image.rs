//! Builds disk images in the triple-mirror layout: three identical mirror
//! partitions, each holding the Info blob, image, dtb and initrd together
//! with their hash records.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{self, Write};

use arrayvec::ArrayString;

use crate::digest::hash_record;
use crate::layout::{Artifact, Layout, Mirror, INFO_FIELD_COUNT};
use crate::memory::Length;

/// Longest decimal rendering of a `u64`.
const MAX_DECIMAL_DIGITS: usize = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageError {
    TooLarge {
        artifact: Artifact,
        size: Length,
        capacity: Length,
    },
    /// A size does not fit in an Info field.
    FieldTooWide { size: u64, width: usize },
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::TooLarge {
                artifact,
                size,
                capacity,
            } => write!(
                f,
                "{artifact} is {size} bytes but only {capacity} are reserved"
            ),
            ImageError::FieldTooWide { size, width } => {
                write!(f, "size {size} does not fit a {width} byte info field")
            }
        }
    }
}

impl core::error::Error for ImageError {}

/// Encodes the Info blob: image, dtb, initrd and rootfs sizes as NUL padded
/// decimal fields of `width` bytes each.
pub fn encode_info(sizes: [u64; INFO_FIELD_COUNT], width: usize) -> Result<Vec<u8>, ImageError> {
    let mut info = Vec::with_capacity(width * INFO_FIELD_COUNT);
    for size in sizes {
        let mut field = ArrayString::<MAX_DECIMAL_DIGITS>::new();
        // Cannot fail: every u64 fits.
        let _ = write!(field, "{size}");
        if field.len() > width {
            return Err(ImageError::FieldTooWide { size, width });
        }
        let start = info.len();
        info.extend_from_slice(field.as_bytes());
        info.resize(start + width, 0);
    }
    Ok(info)
}

pub struct MirrorImageBuilder<'a> {
    layout: &'a Layout,
    image: &'a [u8],
    dtb: &'a [u8],
    initrd: &'a [u8],
    rootfs_size: u64,
}

impl<'a> MirrorImageBuilder<'a> {
    pub fn new(layout: &'a Layout, image: &'a [u8], dtb: &'a [u8], initrd: &'a [u8]) -> Self {
        MirrorImageBuilder {
            layout,
            image,
            dtb,
            initrd,
            rootfs_size: 0,
        }
    }

    /// Size recorded in the fourth Info field.
    pub fn rootfs_size(mut self, size: u64) -> Self {
        self.rootfs_size = size;
        self
    }

    pub fn info(&self) -> Result<Vec<u8>, ImageError> {
        encode_info(
            [
                self.image.len() as u64,
                self.dtb.len() as u64,
                self.initrd.len() as u64,
                self.rootfs_size,
            ],
            self.layout.config().info_field_width,
        )
    }

    /// A zeroed disk covering all three mirrors, with every mirror written.
    pub fn build(&self) -> Result<Vec<u8>, ImageError> {
        let mut disk = vec![0u8; Length::from_raw(self.layout.storage_end().as_raw()).as_usize()];
        for mirror in Mirror::ALL {
            self.write_mirror(&mut disk, mirror)?;
        }
        Ok(disk)
    }

    /// Writes one mirror's artifacts and hash records into `disk`, which must
    /// reach at least to the end of that mirror.
    pub fn write_mirror(&self, disk: &mut [u8], mirror: Mirror) -> Result<(), ImageError> {
        let info = self.info()?;
        let record_len = self.layout.block_size().as_usize();

        for artifact in Artifact::ALL {
            let data: &[u8] = match artifact {
                Artifact::Info => &info,
                Artifact::Image => self.image,
                Artifact::Dtb => self.dtb,
                Artifact::Initrd => self.initrd,
            };
            let size = Length::from_raw(data.len() as u64);
            let capacity = self.layout.capacity(artifact);
            if size > capacity {
                return Err(ImageError::TooLarge {
                    artifact,
                    size,
                    capacity,
                });
            }

            let at = self.layout.data_address(artifact, mirror).as_raw() as usize;
            disk[at..at + data.len()].copy_from_slice(data);
            let at = self.layout.hash_address(artifact, mirror).as_raw() as usize;
            disk[at..at + record_len].copy_from_slice(&hash_record(data, record_len));
        }
        Ok(())
    }
}

/// Flips the first data byte of `artifact` in `mirror`, so that copy no
/// longer matches its hash record.
pub fn corrupt_data(disk: &mut [u8], layout: &Layout, mirror: Mirror, artifact: Artifact) {
    let at = layout.data_address(artifact, mirror).as_raw() as usize;
    disk[at] ^= 0xff;
}
