use std::fs;
use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use log::info;

use shared::image::{corrupt_data, MirrorImageBuilder};
use shared::layout::{Artifact, BoardConfig, Mirror};

/// Lays out a kernel, device tree and initrd on three mirrored partitions,
/// each artifact followed by its SHA-256 record.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    image: PathBuf,

    #[arg(long)]
    dtb: PathBuf,

    #[arg(long)]
    initrd: PathBuf,

    /// Root filesystem size recorded in the Info blob.
    #[arg(long, default_value_t = 0)]
    rootfs_size: u64,

    /// Flip a byte of one mirror's copy, e.g. `0:image`. May be repeated.
    #[arg(long, value_parser = parse_corruption)]
    corrupt: Vec<(Mirror, Artifact)>,

    #[arg(short, long, env = "MKIMAGE_OUT", default_value = "disk.img")]
    output: PathBuf,
}

fn parse_corruption(arg: &str) -> Result<(Mirror, Artifact), String> {
    let (mirror, artifact) = arg
        .split_once(':')
        .ok_or_else(|| format!("expected MIRROR:ARTIFACT, got {arg:?}"))?;
    let mirror = mirror
        .parse()
        .ok()
        .and_then(Mirror::new)
        .ok_or_else(|| format!("no mirror {mirror:?}, expected 0, 1 or 2"))?;
    let artifact = Artifact::ALL
        .into_iter()
        .find(|a| a.name() == artifact)
        .ok_or_else(|| format!("no artifact {artifact:?}, expected info, image, dtb or initrd"))?;
    Ok((mirror, artifact))
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let layout = BoardConfig::reference().validate()?;
    let read = |path: &PathBuf| fs::read(path).wrap_err_with(|| format!("reading {}", path.display()));
    let image = read(&args.image)?;
    let dtb = read(&args.dtb)?;
    let initrd = read(&args.initrd)?;

    info!(
        "building {} from {}, {} and {}",
        args.output.display(),
        args.image.display(),
        args.dtb.display(),
        args.initrd.display()
    );

    let mut disk = MirrorImageBuilder::new(&layout, &image, &dtb, &initrd)
        .rootfs_size(args.rootfs_size)
        .build()?;
    for (mirror, artifact) in args.corrupt {
        info!("corrupting {artifact} on {mirror}");
        corrupt_data(&mut disk, &layout, mirror, artifact);
    }

    fs::write(&args.output, &disk).wrap_err_with(|| format!("writing {}", args.output.display()))?;
    info!("wrote {} bytes", disk.len());
    Ok(())
}
