//! Staging memory: the regions verified artifacts are copied into before the
//! next boot stage takes over.

use core::fmt;
use core::ops::Range;

use super::addr::*;
use crate::layout::{Artifact, ARTIFACT_COUNT};

/// Byte-addressed memory that artifacts are staged into.
pub trait PhysMemory {
    /// Copies `bytes` to `at`. The whole range must lie inside the memory
    /// this object manages.
    fn write(&mut self, at: PhysAddress, bytes: &[u8]);

    /// The bytes currently in `extent`.
    fn read(&self, extent: PhysExtent) -> &[u8];
}

impl<M: PhysMemory + ?Sized> PhysMemory for &mut M {
    fn write(&mut self, at: PhysAddress, bytes: &[u8]) {
        (**self).write(at, bytes)
    }

    fn read(&self, extent: PhysExtent) -> &[u8] {
        (**self).read(extent)
    }
}

/// A buffer standing in for physical memory starting at `base`.
#[derive(Debug)]
pub struct SliceMemory<B> {
    base: PhysAddress,
    buf: B,
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SliceMemory<B> {
    pub fn new(base: PhysAddress, buf: B) -> Self {
        SliceMemory { base, buf }
    }

    pub fn window(&self) -> Option<PhysExtent> {
        PhysExtent::new_checked(self.base, Length::from_raw(self.buf.as_ref().len() as u64))
    }

    pub fn into_inner(self) -> B {
        self.buf
    }

    fn range(&self, at: PhysAddress, len: usize) -> Range<usize> {
        let start = at.distance_from(self.base).as_usize();
        let end = start.checked_add(len).unwrap();
        assert!(
            end <= self.buf.as_ref().len(),
            "{at:?}+{len:#x} is outside memory at {:?}",
            self.base
        );
        start..end
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PhysMemory for SliceMemory<B> {
    fn write(&mut self, at: PhysAddress, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let range = self.range(at, bytes.len());
        self.buf.as_mut()[range].copy_from_slice(bytes);
    }

    fn read(&self, extent: PhysExtent) -> &[u8] {
        let range = self.range(extent.address(), extent.length().as_usize());
        &self.buf.as_ref()[range]
    }
}

/// Identity-mapped RAM, accessed through raw pointers.
#[derive(Debug)]
pub struct RawPhysMemory {
    window: PhysExtent,
}

impl RawPhysMemory {
    /// # Safety
    ///
    /// `window` must be identity mapped, writable RAM that nothing else reads
    /// or writes while this object exists.
    pub unsafe fn new(window: PhysExtent) -> Self {
        RawPhysMemory { window }
    }

    fn check(&self, extent: PhysExtent) {
        assert!(
            self.window.contains(extent),
            "{extent:?} is outside staging window {:?}",
            self.window
        );
    }
}

impl PhysMemory for RawPhysMemory {
    fn write(&mut self, at: PhysAddress, bytes: &[u8]) {
        let Some(extent) = PhysExtent::new_checked(at, Length::from_raw(bytes.len() as u64)) else {
            return;
        };
        self.check(extent);
        let dst = at.as_raw() as usize as *mut u8;
        // SAFETY: `extent` is inside the window the caller of `new` vouched
        // for, and `bytes` cannot alias it since we hold `&mut self`.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) }
    }

    fn read(&self, extent: PhysExtent) -> &[u8] {
        self.check(extent);
        let src = extent.address().as_raw() as usize as *const u8;
        // SAFETY: as in `write`; no writes can happen while the borrow lives.
        unsafe { core::slice::from_raw_parts(src, extent.length().as_usize()) }
    }
}

/// Destination memory map: one region per artifact, back to back in artifact
/// order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagingMap {
    regions: [PhysExtent; ARTIFACT_COUNT],
}

impl StagingMap {
    /// Lays out regions of the given capacities starting at `base`. Returns
    /// `None` if a capacity is zero or the map runs off the address space.
    pub fn new(base: PhysAddress, capacities: [Length; ARTIFACT_COUNT]) -> Option<StagingMap> {
        let mut regions = [PhysExtent::from_raw(0, 1); ARTIFACT_COUNT];
        let mut next = base;
        for (region, capacity) in regions.iter_mut().zip(capacities) {
            *region = PhysExtent::new_checked(next, capacity)?;
            next = next.offset_by_checked(capacity)?;
        }

        Some(StagingMap { regions })
    }

    pub fn extent(&self, artifact: Artifact) -> PhysExtent {
        self.regions[artifact.index()]
    }

    pub fn window(&self) -> PhysExtent {
        let first = self.regions[0];
        let last = self.regions[ARTIFACT_COUNT - 1];
        PhysExtent::new(first.address(), first.address().distance_to(last.end_address()))
    }

    /// Hands out each region exactly once.
    pub fn split(self) -> StagingRegions {
        let region = |artifact: Artifact| StagingRegion {
            artifact,
            extent: self.extent(artifact),
        };
        StagingRegions {
            info: region(Artifact::Info),
            image: region(Artifact::Image),
            dtb: region(Artifact::Dtb),
            initrd: region(Artifact::Initrd),
        }
    }
}

#[derive(Debug)]
pub struct StagingRegions {
    pub info: StagingRegion,
    pub image: StagingRegion,
    pub dtb: StagingRegion,
    pub initrd: StagingRegion,
}

impl StagingRegions {
    pub fn get(&self, artifact: Artifact) -> &StagingRegion {
        match artifact {
            Artifact::Info => &self.info,
            Artifact::Image => &self.image,
            Artifact::Dtb => &self.dtb,
            Artifact::Initrd => &self.initrd,
        }
    }
}

/// Exclusive handle on one artifact's staging region. Not `Clone`: the only
/// way to get one is [`StagingMap::split`].
#[derive(Debug, Eq, PartialEq)]
pub struct StagingRegion {
    artifact: Artifact,
    extent: PhysExtent,
}

impl StagingRegion {
    pub fn artifact(&self) -> Artifact {
        self.artifact
    }

    pub fn address(&self) -> PhysAddress {
        self.extent.address()
    }

    pub fn capacity(&self) -> Length {
        self.extent.length()
    }

    pub fn extent(&self) -> PhysExtent {
        self.extent
    }

    pub fn check_fits(&self, size: Length) -> Result<(), RegionTooSmall> {
        if size > self.capacity() {
            return Err(RegionTooSmall {
                artifact: self.artifact,
                size,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionTooSmall {
    pub artifact: Artifact,
    pub size: Length,
    pub capacity: Length,
}

impl fmt::Display for RegionTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} bytes exceeds its {} byte region",
            self.artifact, self.size, self.capacity
        )
    }
}

impl core::error::Error for RegionTooSmall {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::is_sorted_and_nonoverlapping;

    use proptest::prelude::*;
    use std::vec;

    fn capacities(raw: [u64; ARTIFACT_COUNT]) -> [Length; ARTIFACT_COUNT] {
        raw.map(Length::from_raw)
    }

    #[test]
    fn regions_are_back_to_back() {
        let map = StagingMap::new(
            PhysAddress::from_raw(0xa500_0000),
            capacities([0x200, 0x10_0000, 0x8000, 0x40_0000]),
        )
        .unwrap();

        assert_eq!(map.extent(Artifact::Info), PhysExtent::from_raw(0xa500_0000, 0x200));
        assert_eq!(map.extent(Artifact::Image), PhysExtent::from_raw(0xa500_0200, 0x10_0000));
        assert_eq!(map.extent(Artifact::Dtb), PhysExtent::from_raw(0xa510_0200, 0x8000));
        assert_eq!(map.extent(Artifact::Initrd), PhysExtent::from_raw(0xa510_8200, 0x40_0000));
        assert_eq!(map.window(), PhysExtent::from_raw(0xa500_0000, 0x50_8200));
    }

    #[test]
    fn map_rejects_zero_capacity_and_overflow() {
        assert_eq!(
            StagingMap::new(PhysAddress::from_raw(0), capacities([1, 0, 1, 1])),
            None
        );
        assert_eq!(
            StagingMap::new(PhysAddress::from_raw(u64::MAX - 2), capacities([1, 1, 1, 1])),
            None
        );
    }

    #[test]
    fn split_regions_keep_their_extents() {
        let map = StagingMap::new(PhysAddress::from_raw(0x1000), capacities([16, 32, 16, 64])).unwrap();
        let regions = map.clone().split();

        for artifact in Artifact::ALL {
            let region = regions.get(artifact);
            assert_eq!(region.artifact(), artifact);
            assert_eq!(region.extent(), map.extent(artifact));
        }
        assert_eq!(regions.dtb.check_fits(Length::from_raw(16)), Ok(()));
        assert_eq!(
            regions.dtb.check_fits(Length::from_raw(17)),
            Err(RegionTooSmall {
                artifact: Artifact::Dtb,
                size: Length::from_raw(17),
                capacity: Length::from_raw(16),
            })
        );
    }

    #[test]
    fn slice_memory_reads_back_writes() {
        let mut memory = SliceMemory::new(PhysAddress::from_raw(0x4000), vec![0u8; 64]);
        memory.write(PhysAddress::from_raw(0x4010), b"hello");
        memory.write(PhysAddress::from_raw(0x4040), b"");

        assert_eq!(memory.read(PhysExtent::from_raw(0x4010, 5)), b"hello");
        assert_eq!(memory.read(PhysExtent::from_raw(0x400f, 1)), &[0]);
        assert_eq!(memory.window(), Some(PhysExtent::from_raw(0x4000, 64)));
    }

    #[test]
    #[should_panic]
    fn slice_memory_rejects_writes_past_window() {
        let mut memory = SliceMemory::new(PhysAddress::from_raw(0x4000), vec![0u8; 64]);
        memory.write(PhysAddress::from_raw(0x403e), b"abc");
    }

    #[test]
    fn raw_memory_copies_into_window() {
        let mut backing = vec![0u8; 32];
        let base = backing.as_mut_ptr() as u64;
        let mut memory = unsafe { RawPhysMemory::new(PhysExtent::from_raw(base, 32)) };

        memory.write(PhysAddress::from_raw(base + 4), &[1, 2, 3]);
        assert_eq!(memory.read(PhysExtent::from_raw(base + 3, 5)), &[0, 1, 2, 3, 0]);
        drop(memory);
        assert_eq!(&backing[4..7], &[1, 2, 3]);
    }

    proptest! {
        #[test]
        fn regions_never_overlap(
            base in 0u64..(1 << 40),
            raw in prop::array::uniform4(1u64..(1 << 32)),
        ) {
            let map = StagingMap::new(PhysAddress::from_raw(base), capacities(raw)).unwrap();
            let regions = Artifact::ALL.map(|a| map.extent(a));

            prop_assert!(is_sorted_and_nonoverlapping(regions));
            for pair in regions.windows(2) {
                prop_assert_eq!(pair[0].end_address(), pair[1].address());
            }
        }
    }
}
