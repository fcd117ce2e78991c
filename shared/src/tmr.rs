//! Triple-mirror verification and reconstruction.
//!
//! Each artifact is stored three times, each copy with its own hash record.
//! A copy is intact if its SHA-256 matches its record. The lowest-indexed
//! intact copy is written to the destination; if no copy is intact, the
//! destination is not touched at all.
//!
//! Classifying by digest rather than by majority vote means a single intact
//! copy is enough, and two tampered copies that agree with each other still
//! lose to one that matches its hash.

use alloc::vec;
use core::fmt;

use bitflags::bitflags;
use log::{debug, error, info, warn};

use crate::digest::{digest, parse_hash_record, HASH_RECORD_LEN};
use crate::layout::{Mirror, MirrorSet, MIRROR_COUNT};
use crate::memory::{Length, PhysAddress, PhysMemory};
use crate::storage::{read_mirror, BlockDevice, DeviceReadError};

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct IntactMirrors: u8 {
        const MIRROR_0 = 1 << 0;
        const MIRROR_1 = 1 << 1;
        const MIRROR_2 = 1 << 2;
    }
}

impl IntactMirrors {
    pub fn of(mirror: Mirror) -> IntactMirrors {
        IntactMirrors::from_bits_truncate(1 << mirror.index())
    }

    pub fn contains_mirror(self, mirror: Mirror) -> bool {
        self.contains(IntactMirrors::of(mirror))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MirrorStatus {
    Intact,
    /// Data and hash record were read but do not agree.
    DigestMismatch,
    /// The hash record is not a hex SHA-256.
    BadHashRecord,
    Unreadable(DeviceReadError),
}

impl MirrorStatus {
    pub fn is_intact(self) -> bool {
        self == MirrorStatus::Intact
    }
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorStatus::Intact => write!(f, "intact"),
            MirrorStatus::DigestMismatch => write!(f, "digest mismatch"),
            MirrorStatus::BadHashRecord => write!(f, "malformed hash record"),
            MirrorStatus::Unreadable(e) => write!(f, "unreadable: {e}"),
        }
    }
}

/// Outcome of one [`verify_and_reconstruct`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TmrReport {
    statuses: [MirrorStatus; MIRROR_COUNT],
    selected: Option<Mirror>,
}

impl TmrReport {
    /// True iff some mirror was intact and its data was written.
    pub fn succeeded(&self) -> bool {
        self.selected.is_some()
    }

    /// The mirror whose data was written.
    pub fn selected(&self) -> Option<Mirror> {
        self.selected
    }

    pub fn status(&self, mirror: Mirror) -> MirrorStatus {
        self.statuses[mirror.index()]
    }

    pub fn intact(&self) -> IntactMirrors {
        Mirror::ALL
            .into_iter()
            .filter(|&m| self.status(m).is_intact())
            .fold(IntactMirrors::empty(), |set, m| set | IntactMirrors::of(m))
    }
}

/// Verifies the three copies of a `size` byte blob at `mirrors` and writes
/// the lowest-indexed intact copy to `dest`.
///
/// Never fails: read errors and mismatches only mark a mirror corrupt. The
/// caller decides what a failed report means.
pub fn verify_and_reconstruct<D, M>(
    device: &mut D,
    memory: &mut M,
    mirrors: &MirrorSet,
    size: Length,
    dest: PhysAddress,
) -> TmrReport
where
    D: BlockDevice + ?Sized,
    M: PhysMemory + ?Sized,
{
    let mut scratch = vec![0u8; size.as_usize()];
    let mut selected = None;

    let statuses = Mirror::ALL.map(|mirror| {
        let status = classify(device, mirrors, mirror, &mut scratch);
        if status.is_intact() {
            debug!("{mirror} intact");
            if selected.is_none() {
                memory.write(dest, &scratch);
                selected = Some(mirror);
            }
        } else {
            warn!("{mirror} corrupt: {status}");
        }
        status
    });

    match selected {
        Some(mirror) => info!(
            "reconstructed {size} bytes at {:#x} from {mirror}",
            dest.as_raw()
        ),
        None => error!("no intact mirror, {:#x} left untouched", dest.as_raw()),
    }

    TmrReport { statuses, selected }
}

/// Reads one mirror's data into `scratch` and checks it against its record.
fn classify<D: BlockDevice + ?Sized>(
    device: &mut D,
    mirrors: &MirrorSet,
    mirror: Mirror,
    scratch: &mut [u8],
) -> MirrorStatus {
    let mut record = [0u8; HASH_RECORD_LEN + 1];
    if let Err(e) = read_mirror(device, mirrors.hash(mirror), &mut record) {
        return MirrorStatus::Unreadable(e);
    }
    let Some(expected) = parse_hash_record(&record) else {
        return MirrorStatus::BadHashRecord;
    };

    if let Err(e) = read_mirror(device, mirrors.data(mirror), scratch) {
        return MirrorStatus::Unreadable(e);
    }
    if digest(scratch) != expected {
        return MirrorStatus::DigestMismatch;
    }

    MirrorStatus::Intact
}
