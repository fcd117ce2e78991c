//! Boot assembly: stages Info, image, dtb and initrd in dependency order.
//!
//! Info comes first because it carries the sizes of everything else. Every
//! discovered size is checked against its staging region before any of the
//! remaining artifacts is read.
//!
//! Failure policy: a failed Info, image or dtb always aborts the boot. A
//! failed initrd aborts under [`IntegrityPolicy::Strict`]; under
//! [`IntegrityPolicy::TolerateInitrd`] the kernel boots without an initrd and
//! the failure shows up in the outcome flags on the kernel command line.

use alloc::vec;
use core::fmt;

use log::{error, info, warn};

use shared::info::{discover_sizes, ArtifactSizes, MalformedSizeField};
use shared::layout::{Artifact, ConfigurationError, IntegrityPolicy, Layout, Mirror, ARTIFACT_COUNT};
use shared::memory::{Length, PhysAddress, PhysExtent, PhysMemory, RegionTooSmall, StagingRegion};
use shared::storage::{read_mirror, BlockDevice, DeviceReadError};
use shared::tmr::verify_and_reconstruct;

/// What happened to one artifact.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Reconstructed from an intact mirror.
    Verified,
    /// No mirror was intact. Nothing was staged.
    Failed,
    /// Copied from mirror 0 with verification disabled.
    Unverified,
}

impl Outcome {
    fn marker(self) -> char {
        match self {
            Outcome::Verified => 'v',
            Outcome::Failed => 'x',
            Outcome::Unverified => '-',
        }
    }
}

/// Per-artifact outcomes of one boot attempt, in artifact order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Outcomes(pub(crate) [Outcome; ARTIFACT_COUNT]);

impl Outcomes {
    pub fn get(&self, artifact: Artifact) -> Outcome {
        self.0[artifact.index()]
    }

    pub fn all_verified(&self) -> bool {
        self.0.iter().all(|&o| o == Outcome::Verified)
    }
}

/// Renders as a kernel parameter, e.g. `tmr=vvvx` when only the initrd
/// failed.
impl fmt::Display for Outcomes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tmr=")?;
        self.0.iter().try_for_each(|o| fmt::Write::write_char(f, o.marker()))
    }
}

/// One staged artifact.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Staged {
    pub address: PhysAddress,
    pub size: Length,
}

impl Staged {
    /// `None` for an empty artifact.
    pub fn extent(&self) -> Option<PhysExtent> {
        PhysExtent::new_checked(self.address, self.size)
    }
}

/// Everything the handoff needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootPlan {
    pub info: Staged,
    pub image: Staged,
    pub dtb: Staged,
    /// `None` if the initrd failed and the policy let the boot continue.
    pub initrd: Option<Staged>,
    pub sizes: ArtifactSizes,
    pub outcomes: Outcomes,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootError {
    Configuration(ConfigurationError),
    /// No mirror of the artifact was intact.
    IntegrityFailure(Artifact),
    MalformedSizeField(MalformedSizeField),
    ArtifactTooLarge(RegionTooSmall),
    /// The initrd was dropped and the environment names no other root
    /// device.
    NoRootDevice,
    /// Only from unverified copies, which have no other mirror to fall back
    /// on.
    DeviceRead {
        artifact: Artifact,
        error: DeviceReadError,
    },
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Configuration(e) => write!(f, "bad board configuration: {e}"),
            BootError::IntegrityFailure(artifact) => {
                write!(f, "no intact copy of {artifact} on any mirror")
            }
            BootError::MalformedSizeField(e) => fmt::Display::fmt(e, f),
            BootError::ArtifactTooLarge(e) => fmt::Display::fmt(e, f),
            BootError::NoRootDevice => {
                write!(f, "no initrd and no root= device in bootargs")
            }
            BootError::DeviceRead { artifact, error } => {
                write!(f, "reading {artifact} from {}: {error}", Mirror::PRIMARY)
            }
        }
    }
}

impl core::error::Error for BootError {}

impl From<ConfigurationError> for BootError {
    fn from(e: ConfigurationError) -> Self {
        BootError::Configuration(e)
    }
}

impl From<MalformedSizeField> for BootError {
    fn from(e: MalformedSizeField) -> Self {
        BootError::MalformedSizeField(e)
    }
}

impl From<RegionTooSmall> for BootError {
    fn from(e: RegionTooSmall) -> Self {
        BootError::ArtifactTooLarge(e)
    }
}

/// Stages all four artifacts into the regions of `layout`'s staging map.
pub fn assemble<D, M>(layout: &Layout, device: &mut D, memory: &mut M) -> Result<BootPlan, BootError>
where
    D: BlockDevice + ?Sized,
    M: PhysMemory + ?Sized,
{
    let config = layout.config();
    let regions = layout.staging_map().split();
    if !config.verify {
        warn!("triple-mirror verification disabled, no hash checks");
    }

    let (info, info_outcome) = stage(layout, device, memory, &regions.info, layout.info_len())?;
    if info_outcome == Outcome::Failed {
        return Err(BootError::IntegrityFailure(Artifact::Info));
    }

    let info_extent = PhysExtent::new(info.address, info.size);
    let sizes = discover_sizes(memory.read(info_extent), config.info_field_width)?;
    info!(
        "sizes from info: image {} dtb {} initrd {}",
        sizes.image, sizes.dtb, sizes.initrd
    );
    for (artifact, size) in sizes.by_artifact() {
        regions.get(artifact).check_fits(size)?;
    }

    let (image, image_outcome) = stage(layout, device, memory, &regions.image, sizes.image)?;
    if image_outcome == Outcome::Failed {
        return Err(BootError::IntegrityFailure(Artifact::Image));
    }
    let (dtb, dtb_outcome) = stage(layout, device, memory, &regions.dtb, sizes.dtb)?;
    if dtb_outcome == Outcome::Failed {
        return Err(BootError::IntegrityFailure(Artifact::Dtb));
    }
    let (initrd, initrd_outcome) = stage(layout, device, memory, &regions.initrd, sizes.initrd)?;
    let initrd = match (initrd_outcome, config.policy) {
        (Outcome::Failed, IntegrityPolicy::Strict) => {
            return Err(BootError::IntegrityFailure(Artifact::Initrd));
        }
        (Outcome::Failed, IntegrityPolicy::TolerateInitrd) => {
            warn!("initrd failed verification, booting without it");
            None
        }
        _ => Some(initrd),
    };

    let outcomes = Outcomes([info_outcome, image_outcome, dtb_outcome, initrd_outcome]);
    info!("staged all artifacts: {outcomes}");

    Ok(BootPlan {
        info,
        image,
        dtb,
        initrd,
        sizes,
        outcomes,
    })
}

/// Stages one artifact of `size` bytes into `region`, verified or not as the
/// layout says.
fn stage<D, M>(
    layout: &Layout,
    device: &mut D,
    memory: &mut M,
    region: &StagingRegion,
    size: Length,
) -> Result<(Staged, Outcome), BootError>
where
    D: BlockDevice + ?Sized,
    M: PhysMemory + ?Sized,
{
    let artifact = region.artifact();
    region.check_fits(size)?;
    let staged = Staged {
        address: region.address(),
        size,
    };

    if !layout.config().verify {
        let mut buf = vec![0u8; size.as_usize()];
        read_mirror(device, layout.data_address(artifact, Mirror::PRIMARY), &mut buf)
            .map_err(|error| BootError::DeviceRead { artifact, error })?;
        memory.write(staged.address, &buf);
        info!("copied {artifact} ({size} bytes) unverified");
        return Ok((staged, Outcome::Unverified));
    }

    info!("verifying {artifact} ({size} bytes) across mirrors");
    let report = verify_and_reconstruct(
        device,
        memory,
        &layout.mirror_set(artifact),
        size,
        staged.address,
    );
    if report.succeeded() {
        Ok((staged, Outcome::Verified))
    } else {
        error!("{artifact} failed verification on every mirror");
        Ok((staged, Outcome::Failed))
    }
}
