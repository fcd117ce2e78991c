//! Runs the boot stage against a disk image file, with a buffer standing in
//! for the staging memory. `booti` prints what the kernel would be started
//! with and exits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, ValueEnum};
use eyre::{eyre, Result, WrapErr};
use env_logger::Env;

use shared::layout::{Artifact, BoardConfig, IntegrityPolicy};
use shared::memory::{PhysMemory, SliceMemory};
use shared::storage::ImageDevice;
use tmrboot::{main_loop, BootCommand, BootEnv, BootPlan, Environment, RecoveryReason, Staged};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    /// Any unverifiable artifact aborts the boot.
    Strict,
    /// Boot without the initrd if it cannot be verified.
    TolerateInitrd,
}

impl From<Policy> for IntegrityPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Strict => IntegrityPolicy::Strict,
            Policy::TolerateInitrd => IntegrityPolicy::TolerateInitrd,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Boot from a triple-mirrored disk image")]
struct Args {
    /// Disk image laid out like the reference board's storage.
    disk: PathBuf,

    /// Copy every artifact from mirror 0 without checking hashes.
    #[arg(long, env = "TMRBOOT_NO_VERIFY")]
    no_verify: bool,

    #[arg(long, env = "TMRBOOT_POLICY", value_enum, default_value_t = Policy::Strict)]
    policy: Policy,

    #[arg(long, env = "TMRBOOT_CBOOTARGS", default_value = "")]
    cbootargs: String,

    #[arg(long, env = "TMRBOOT_BOOTARGS", default_value = "")]
    bootargs: String,

    /// Interrupt the autoboot countdown.
    #[arg(long)]
    stop_autoboot: bool,

    /// Write the staged artifacts here before handing off.
    #[arg(long, env = "TMRBOOT_DUMP_DIR")]
    dump_dir: Option<PathBuf>,
}

struct SimEnv {
    vars: BTreeMap<String, String>,
    stop_autoboot: bool,
    dump_dir: Option<PathBuf>,
    dump_error: Option<eyre::Report>,
}

impl Environment for SimEnv {
    fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_owned(), value.to_owned());
    }
}

impl BootEnv for SimEnv {
    fn abort_requested(&mut self) -> bool {
        self.stop_autoboot
    }

    fn booti(&mut self, command: &BootCommand, plan: &BootPlan, memory: &dyn PhysMemory) {
        println!("bootargs={}", self.get("bootargs").unwrap_or_default());
        println!("{command}");

        if let Some(dir) = &self.dump_dir {
            if let Err(e) = dump(dir, plan, memory) {
                self.dump_error = Some(e);
                return;
            }
        }
        process::exit(0);
    }

    fn recovery(&mut self, reason: &RecoveryReason) {
        eprintln!("recovery: {reason}");
    }
}

fn dump(dir: &Path, plan: &BootPlan, memory: &dyn PhysMemory) -> Result<()> {
    fs::create_dir_all(dir).wrap_err_with(|| format!("creating {}", dir.display()))?;

    let staged = [
        (Artifact::Info, Some(plan.info)),
        (Artifact::Image, Some(plan.image)),
        (Artifact::Dtb, Some(plan.dtb)),
        (Artifact::Initrd, plan.initrd),
    ];
    for (artifact, blob) in staged {
        let Some(blob) = blob else { continue };
        let path = dir.join(format!("{artifact}.bin"));
        fs::write(&path, contents(&blob, memory))
            .wrap_err_with(|| format!("writing {}", path.display()))?;
        log::info!("dumped {artifact} to {}", path.display());
    }
    Ok(())
}

fn contents<'m>(blob: &Staged, memory: &'m dyn PhysMemory) -> &'m [u8] {
    blob.extent().map_or(&[][..], |extent| memory.read(extent))
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = BoardConfig::reference();
    config.verify = !args.no_verify;
    config.policy = args.policy.into();
    let layout = config.validate()?;

    let disk = fs::read(&args.disk).wrap_err_with(|| format!("reading {}", args.disk.display()))?;
    let mut device = ImageDevice::new(disk);

    let window = layout.staging_window();
    let mut memory = SliceMemory::new(window.address(), vec![0u8; window.length().as_usize()]);

    let mut env = SimEnv {
        vars: BTreeMap::from([
            ("cbootargs".to_owned(), args.cbootargs),
            ("bootargs".to_owned(), args.bootargs),
        ]),
        stop_autoboot: args.stop_autoboot,
        dump_dir: args.dump_dir,
        dump_error: None,
    };

    let reason = main_loop(&layout, &mut device, &mut memory, &mut env);
    if let Some(e) = env.dump_error.take() {
        return Err(e);
    }
    Err(eyre!(reason))
}
