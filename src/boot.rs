use core::fmt;

use log::{error, info, warn};

use shared::layout::Layout;
use shared::memory::PhysMemory;
use shared::storage::BlockDevice;

use crate::assembly::{assemble, BootError, BootPlan};
use crate::cmdline::{kernel_cmdline, BootCommand, Environment};

/// Everything around the boot stage that belongs to the firmware: the
/// environment, the autoboot countdown, the `booti` handoff and the recovery
/// shell.
pub trait BootEnv: Environment {
    /// Runs the autoboot countdown. True if the user interrupted it.
    fn abort_requested(&mut self) -> bool;

    /// Hands over to the kernel. Only returns if the handoff failed.
    fn booti(&mut self, command: &BootCommand, plan: &BootPlan, memory: &dyn PhysMemory);

    /// Enters the interactive recovery shell.
    fn recovery(&mut self, reason: &RecoveryReason);
}

/// Why the boot stage fell back to recovery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryReason {
    Failed(BootError),
    /// The autoboot countdown was interrupted.
    Interrupted,
    /// `booti` came back.
    HandoffReturned,
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryReason::Failed(e) => write!(f, "boot failed: {e}"),
            RecoveryReason::Interrupted => write!(f, "autoboot interrupted"),
            RecoveryReason::HandoffReturned => write!(f, "booti returned"),
        }
    }
}

/// Stages the artifacts, sets `bootargs`, and boots. Everything that keeps
/// the kernel from running ends in [`BootEnv::recovery`], and the reason is
/// returned once the recovery shell exits.
pub fn main_loop<D, M, E>(layout: &Layout, device: &mut D, memory: &mut M, env: &mut E) -> RecoveryReason
where
    D: BlockDevice + ?Sized,
    M: PhysMemory,
    E: BootEnv + ?Sized,
{
    info!("tmrboot {}", env!("CARGO_PKG_VERSION"));

    let reason = boot(layout, device, memory, env);
    match &reason {
        RecoveryReason::Failed(e) => error!("{e}, entering recovery"),
        reason => warn!("{reason}, entering recovery"),
    }
    env.recovery(&reason);
    reason
}

fn boot<D, M, E>(layout: &Layout, device: &mut D, memory: &mut M, env: &mut E) -> RecoveryReason
where
    D: BlockDevice + ?Sized,
    M: PhysMemory,
    E: BootEnv + ?Sized,
{
    let plan = match assemble(layout, device, memory) {
        Ok(plan) => plan,
        Err(e) => return RecoveryReason::Failed(e),
    };

    let cmdline = match kernel_cmdline(&*env, &plan) {
        Ok(cmdline) => cmdline,
        Err(e) => return RecoveryReason::Failed(e),
    };
    info!("bootargs: {cmdline}");
    env.set("bootargs", &cmdline);

    if env.abort_requested() {
        return RecoveryReason::Interrupted;
    }

    let command = BootCommand::new(&plan);
    info!("{command}");
    env.booti(&command, &plan, &*memory);
    RecoveryReason::HandoffReturned
}

#[cfg(test)]
mod tests {
    use super::*;

    use shared::image::{corrupt_data, MirrorImageBuilder};
    use shared::layout::{Artifact, ArtifactPlacement, BoardConfig, IntegrityPolicy, Mirror};
    use shared::memory::{PhysAddress, SliceMemory};
    use shared::storage::ImageDevice;

    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::string::String;
    use std::vec;
    use std::vec::Vec;
    use test_log::test;

    #[derive(Default)]
    struct MockEnv {
        vars: BTreeMap<String, String>,
        abort: bool,
        booted: Option<(BootCommand, Vec<u8>)>,
        recovered: Vec<RecoveryReason>,
    }

    impl Environment for MockEnv {
        fn get(&self, name: &str) -> Option<&str> {
            self.vars.get(name).map(String::as_str)
        }

        fn set(&mut self, name: &str, value: &str) {
            self.vars.insert(name.into(), value.into());
        }
    }

    impl BootEnv for MockEnv {
        fn abort_requested(&mut self) -> bool {
            self.abort
        }

        fn booti(&mut self, command: &BootCommand, plan: &BootPlan, memory: &dyn PhysMemory) {
            let image = plan.image.extent().map_or(Vec::new(), |e| memory.read(e).to_vec());
            self.booted = Some((*command, image));
        }

        fn recovery(&mut self, reason: &RecoveryReason) {
            self.recovered.push(*reason);
        }
    }

    fn layout(policy: IntegrityPolicy) -> Layout {
        let placement = |data_block, hash_block, max_blocks| ArtifactPlacement {
            data_block,
            hash_block,
            max_blocks,
        };
        BoardConfig {
            block_size: 128,
            partition_base: 0,
            partition_blocks: 12,
            placements: [
                placement(0, 1, 1),
                placement(2, 4, 2),
                placement(5, 6, 1),
                placement(7, 10, 3),
            ],
            staging_base: PhysAddress::from_raw(0x2000),
            info_field_width: 32,
            verify: true,
            policy,
        }
        .validate()
        .unwrap()
    }

    fn run(layout: &Layout, disk: &[u8], env: &mut MockEnv) -> RecoveryReason {
        let mut device = ImageDevice::new(disk);
        let window = layout.staging_window();
        let mut memory = SliceMemory::new(window.address(), vec![0u8; window.length().as_usize()]);
        main_loop(layout, &mut device, &mut memory, env)
    }

    #[test]
    fn boots_and_sets_bootargs() {
        let layout = layout(IntegrityPolicy::Strict);
        let disk = MirrorImageBuilder::new(&layout, b"kernel image", b"dtb", b"initrd")
            .build()
            .unwrap();
        let mut env = MockEnv::default();
        env.set("cbootargs", "console=ttyS0");

        let reason = run(&layout, &disk, &mut env);

        assert_eq!(reason, RecoveryReason::HandoffReturned);
        assert_eq!(
            env.get("bootargs"),
            Some("console=ttyS0 root=/dev/ram0 rw rootwait tmr=vvvv")
        );
        let (command, image) = env.booted.unwrap();
        assert_eq!(command.image, layout.destination(Artifact::Image));
        assert_eq!(image, b"kernel image");
        assert_eq!(env.recovered, [RecoveryReason::HandoffReturned]);
    }

    #[test]
    fn interrupted_countdown_skips_booti() {
        let layout = layout(IntegrityPolicy::Strict);
        let disk = MirrorImageBuilder::new(&layout, b"kernel", b"dtb", b"initrd")
            .build()
            .unwrap();
        let mut env = MockEnv {
            abort: true,
            ..MockEnv::default()
        };

        assert_eq!(run(&layout, &disk, &mut env), RecoveryReason::Interrupted);
        assert!(env.booted.is_none());
        assert!(env.get("bootargs").is_some());
    }

    #[test]
    fn integrity_failure_enters_recovery() {
        let layout = layout(IntegrityPolicy::Strict);
        let mut disk = MirrorImageBuilder::new(&layout, b"kernel", b"dtb", b"initrd")
            .build()
            .unwrap();
        for mirror in Mirror::ALL {
            corrupt_data(&mut disk, &layout, mirror, Artifact::Dtb);
        }
        let mut env = MockEnv::default();

        let reason = run(&layout, &disk, &mut env);
        assert_eq!(
            reason,
            RecoveryReason::Failed(BootError::IntegrityFailure(Artifact::Dtb))
        );
        assert!(env.booted.is_none());
        assert_eq!(env.get("bootargs"), None);
        assert_eq!(env.recovered, [reason]);
    }

    fn disk_without_initrd(layout: &Layout) -> Vec<u8> {
        let mut disk = MirrorImageBuilder::new(layout, b"kernel", b"dtb", b"initrd")
            .build()
            .unwrap();
        for mirror in Mirror::ALL {
            corrupt_data(&mut disk, layout, mirror, Artifact::Initrd);
        }
        disk
    }

    #[test]
    fn tolerated_initrd_failure_boots_from_named_root() {
        let layout = layout(IntegrityPolicy::TolerateInitrd);
        let disk = disk_without_initrd(&layout);
        let mut env = MockEnv::default();
        env.set("bootargs", "root=/dev/mmcblk0p4");

        assert_eq!(run(&layout, &disk, &mut env), RecoveryReason::HandoffReturned);
        assert_eq!(
            env.get("bootargs"),
            Some("rw rootwait root=/dev/mmcblk0p4 tmr=vvvx")
        );
        let (command, _) = env.booted.unwrap();
        assert_eq!(command.initrd, None);
    }

    #[test]
    fn tolerated_initrd_failure_without_root_enters_recovery() {
        let layout = layout(IntegrityPolicy::TolerateInitrd);
        let disk = disk_without_initrd(&layout);
        let mut env = MockEnv::default();

        let reason = run(&layout, &disk, &mut env);
        assert_eq!(reason, RecoveryReason::Failed(BootError::NoRootDevice));
        assert!(env.booted.is_none());
        assert_eq!(env.get("bootargs"), None);
        assert_eq!(env.recovered, [reason]);
    }
}
