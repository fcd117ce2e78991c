//! Board layout and the extent arithmetic derived from it.
//!
//! Storage holds three identical mirror partitions back to back. Each mirror
//! carries the same four artifacts at the same block offsets, every artifact
//! followed somewhere by a one-block hash record. Only the partition base
//! differs between mirrors.
//!
//! A [`BoardConfig`] is plain data. It must be turned into a [`Layout`] by
//! [`BoardConfig::validate`] before anything can be computed from it, so an
//! inconsistent layout fails at startup instead of overlapping memory later.

use core::fmt;

use arrayvec::ArrayVec;
use static_assertions::const_assert;

use crate::digest::HASH_RECORD_LEN;
use crate::memory::{
    is_sorted_and_nonoverlapping, Length, PhysAddress, PhysExtent, StagingMap, StorageAddress,
    StorageExtent,
};

pub const MIRROR_COUNT: usize = 3;
pub const ARTIFACT_COUNT: usize = 4;

/// Decimal fields in the Info blob: image, dtb, initrd and rootfs sizes. The
/// rootfs field is not used at this stage.
pub const INFO_FIELD_COUNT: usize = 4;

/// Smallest block size. A block holds one hash record plus its terminator.
pub const MIN_BLOCK_SIZE: u64 = 128;

const_assert!(HASH_RECORD_LEN < MIN_BLOCK_SIZE as usize);

/// Upper bound on the width of one Info field.
pub const MAX_INFO_FIELD_WIDTH: usize = 128;

/// One of the four payloads staged before handoff, in staging order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Artifact {
    Info,
    Image,
    Dtb,
    Initrd,
}

impl Artifact {
    pub const ALL: [Artifact; ARTIFACT_COUNT] =
        [Artifact::Info, Artifact::Image, Artifact::Dtb, Artifact::Initrd];

    /// The artifacts whose sizes are read out of the Info blob.
    pub const SIZED: [Artifact; 3] = [Artifact::Image, Artifact::Dtb, Artifact::Initrd];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Artifact::Info => "info",
            Artifact::Image => "image",
            Artifact::Dtb => "dtb",
            Artifact::Initrd => "initrd",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index of one of the three mirror partitions.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Mirror(u8);

impl Mirror {
    pub const ALL: [Mirror; MIRROR_COUNT] = [Mirror(0), Mirror(1), Mirror(2)];

    /// The mirror used when verification is disabled.
    pub const PRIMARY: Mirror = Mirror(0);

    pub const fn new(index: usize) -> Option<Mirror> {
        if index < MIRROR_COUNT {
            Some(Mirror(index as u8))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mirror {}", self.0)
    }
}

/// What to do when every mirror of an artifact fails verification.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IntegrityPolicy {
    /// Any failed artifact aborts the boot.
    #[default]
    Strict,
    /// A failed initrd is dropped and the kernel boots without one. Info,
    /// image and dtb failures still abort.
    TolerateInitrd,
}

/// Where one artifact lives inside each mirror partition, in blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArtifactPlacement {
    pub data_block: u64,
    pub hash_block: u64,
    /// Blocks reserved for the data, both on storage and in staging memory.
    pub max_blocks: u64,
}

/// Static board constants, as provided by the environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BoardConfig {
    pub block_size: u64,
    /// First block of mirror 0.
    pub partition_base: u64,
    /// Blocks per mirror partition.
    pub partition_blocks: u64,
    /// Indexed by [`Artifact::index`].
    pub placements: [ArtifactPlacement; ARTIFACT_COUNT],
    pub staging_base: PhysAddress,
    pub info_field_width: usize,
    /// Triple-mirror verification. When off, artifacts are copied from
    /// mirror 0 without any hash checks.
    pub verify: bool,
    pub policy: IntegrityPolicy,
}

impl BoardConfig {
    /// Constants of the reference board: 512 byte blocks, 64 MiB mirror
    /// partitions starting at 1 MiB, staging at `0xa500_0000`.
    pub const fn reference() -> BoardConfig {
        BoardConfig {
            block_size: 512,
            partition_base: 2048,
            partition_blocks: 131_072,
            placements: [
                ArtifactPlacement {
                    data_block: 0,
                    hash_block: 1,
                    max_blocks: 1,
                },
                ArtifactPlacement {
                    data_block: 2,
                    hash_block: 81_922,
                    max_blocks: 81_920,
                },
                ArtifactPlacement {
                    data_block: 81_923,
                    hash_block: 82_179,
                    max_blocks: 256,
                },
                ArtifactPlacement {
                    data_block: 82_180,
                    hash_block: 123_140,
                    max_blocks: 40_960,
                },
            ],
            staging_base: PhysAddress::from_raw(0xa500_0000),
            info_field_width: 128,
            verify: true,
            policy: IntegrityPolicy::Strict,
        }
    }

    pub fn placement(&self, artifact: Artifact) -> ArtifactPlacement {
        self.placements[artifact.index()]
    }

    /// Checks every invariant the extent arithmetic relies on.
    pub fn validate(self) -> Result<Layout, ConfigurationError> {
        let block_size = self.block_size;
        if !block_size.is_power_of_two() || block_size < MIN_BLOCK_SIZE {
            return Err(ConfigurationError::BadBlockSize(block_size));
        }
        if self.partition_blocks == 0 {
            return Err(ConfigurationError::EmptyPartition);
        }
        if self.info_field_width == 0 || self.info_field_width > MAX_INFO_FIELD_WIDTH {
            return Err(ConfigurationError::BadInfoFieldWidth(self.info_field_width));
        }

        // All three partitions must be addressable.
        let storage_blocks = self
            .partition_blocks
            .checked_mul(MIRROR_COUNT as u64)
            .and_then(|blocks| blocks.checked_add(self.partition_base))
            .ok_or(ConfigurationError::AddressOverflow)?;
        Length::blocks(storage_blocks, block_size).ok_or(ConfigurationError::AddressOverflow)?;

        // Extents relative to the start of a partition.
        let partition = StorageExtent::new(
            StorageAddress::zero(),
            Length::blocks(self.partition_blocks, block_size)
                .ok_or(ConfigurationError::AddressOverflow)?,
        );
        let mut extents: ArrayVec<StorageExtent, { 2 * ARTIFACT_COUNT }> = ArrayVec::new();
        for artifact in Artifact::ALL {
            let placement = self.placement(artifact);
            if placement.max_blocks == 0 {
                return Err(ConfigurationError::EmptyArtifact(artifact));
            }
            let data = block_extent(placement.data_block, placement.max_blocks, block_size)?;
            let hash = block_extent(placement.hash_block, 1, block_size)?;
            if !partition.contains(data) || !partition.contains(hash) {
                return Err(ConfigurationError::OutsidePartition(artifact));
            }
            extents.push(data);
            extents.push(hash);
        }
        extents.sort_unstable_by_key(|e| e.address());
        if !is_sorted_and_nonoverlapping(extents.iter().copied()) {
            return Err(ConfigurationError::OverlappingExtents);
        }

        let info_len = (self.info_field_width * INFO_FIELD_COUNT) as u64;
        let info_capacity = self.placement(Artifact::Info).max_blocks * block_size;
        if info_len > info_capacity {
            return Err(ConfigurationError::InfoDoesNotFit {
                info_len,
                capacity: info_capacity,
            });
        }

        let mut capacities = [Length::from_raw(0); ARTIFACT_COUNT];
        for artifact in Artifact::ALL {
            capacities[artifact.index()] =
                Length::from_raw(self.placement(artifact).max_blocks * block_size);
        }
        let staging = StagingMap::new(self.staging_base, capacities)
            .ok_or(ConfigurationError::AddressOverflow)?;

        Ok(Layout {
            config: self,
            staging,
        })
    }
}

fn block_extent(
    first_block: u64,
    blocks: u64,
    block_size: u64,
) -> Result<StorageExtent, ConfigurationError> {
    let address = Length::blocks(first_block, block_size).ok_or(ConfigurationError::AddressOverflow)?;
    let length = Length::blocks(blocks, block_size).ok_or(ConfigurationError::AddressOverflow)?;
    StorageExtent::new_checked(StorageAddress::from_zero(address), length)
        .ok_or(ConfigurationError::AddressOverflow)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigurationError {
    /// Not a power of two, or too small to hold a hash record.
    BadBlockSize(u64),
    EmptyPartition,
    BadInfoFieldWidth(usize),
    InfoDoesNotFit { info_len: u64, capacity: u64 },
    EmptyArtifact(Artifact),
    /// An artifact's data or hash extends past the end of its partition.
    OutsidePartition(Artifact),
    /// Two artifact data or hash extents share storage.
    OverlappingExtents,
    /// Some storage offset or staging address does not fit in 64 bits.
    AddressOverflow,
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ConfigurationError::*;

        match self {
            BadBlockSize(size) => write!(f, "invalid block size {size}"),
            EmptyPartition => write!(f, "mirror partitions are empty"),
            BadInfoFieldWidth(width) => write!(
                f,
                "info field width {width} not in 1..={MAX_INFO_FIELD_WIDTH}"
            ),
            InfoDoesNotFit { info_len, capacity } => write!(
                f,
                "info blob of {info_len} bytes does not fit its {capacity} byte extent"
            ),
            EmptyArtifact(artifact) => write!(f, "{artifact} has no blocks reserved"),
            OutsidePartition(artifact) => write!(f, "{artifact} extends past its partition"),
            OverlappingExtents => write!(f, "artifact extents overlap"),
            AddressOverflow => write!(f, "layout overflows the address space"),
        }
    }
}

impl core::error::Error for ConfigurationError {}

/// The six storage locations holding one artifact: data and hash record in
/// each mirror.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MirrorSet {
    pub data: [StorageAddress; MIRROR_COUNT],
    pub hash: [StorageAddress; MIRROR_COUNT],
}

impl MirrorSet {
    pub fn data(&self, mirror: Mirror) -> StorageAddress {
        self.data[mirror.index()]
    }

    pub fn hash(&self, mirror: Mirror) -> StorageAddress {
        self.hash[mirror.index()]
    }
}

/// A validated [`BoardConfig`]. The block extent calculator.
#[derive(Clone, Debug)]
pub struct Layout {
    config: BoardConfig,
    staging: StagingMap,
}

impl Layout {
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn block_size(&self) -> Length {
        Length::from_raw(self.config.block_size)
    }

    fn blocks(&self, count: u64) -> Length {
        Length::from_raw(count * self.config.block_size)
    }

    pub fn partition(&self, mirror: Mirror) -> StorageExtent {
        let first = self.config.partition_base + mirror.index() as u64 * self.config.partition_blocks;
        StorageExtent::new(
            StorageAddress::from_zero(self.blocks(first)),
            self.blocks(self.config.partition_blocks),
        )
    }

    /// One past the last byte of mirror 2.
    pub fn storage_end(&self) -> StorageAddress {
        self.partition(Mirror::ALL[MIRROR_COUNT - 1]).end_address()
    }

    pub fn data_address(&self, artifact: Artifact, mirror: Mirror) -> StorageAddress {
        let placement = self.config.placement(artifact);
        self.partition(mirror)
            .address()
            .offset_by(self.blocks(placement.data_block))
    }

    pub fn hash_address(&self, artifact: Artifact, mirror: Mirror) -> StorageAddress {
        let placement = self.config.placement(artifact);
        self.partition(mirror)
            .address()
            .offset_by(self.blocks(placement.hash_block))
    }

    pub fn mirror_set(&self, artifact: Artifact) -> MirrorSet {
        MirrorSet {
            data: Mirror::ALL.map(|m| self.data_address(artifact, m)),
            hash: Mirror::ALL.map(|m| self.hash_address(artifact, m)),
        }
    }

    /// Bytes reserved for `artifact`, on storage and in staging memory alike.
    pub fn capacity(&self, artifact: Artifact) -> Length {
        self.blocks(self.config.placement(artifact).max_blocks)
    }

    /// Fixed size of the Info blob.
    pub fn info_len(&self) -> Length {
        Length::from_raw((self.config.info_field_width * INFO_FIELD_COUNT) as u64)
    }

    /// Staging address of `artifact`: the staging base plus the capacities of
    /// every artifact before it.
    pub fn destination(&self, artifact: Artifact) -> PhysAddress {
        self.staging.extent(artifact).address()
    }

    /// The whole staging window.
    pub fn staging_window(&self) -> PhysExtent {
        self.staging.window()
    }

    /// A fresh set of staging regions for one boot attempt.
    pub fn staging_map(&self) -> StagingMap {
        self.staging.clone()
    }
}
