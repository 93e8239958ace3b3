//! Load static UBI volumes out of a NAND flash (or an image of one) and write them to files.
//!
//! This runs the same loader a boot stage would, so it is handy for checking that an image will
//! actually boot: `ubi_load --sim-path nand.bin --sim-layout 2048x64x2048 --volume u-boot=u-boot.bin`

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;

#[cfg(target_os = "linux")]
use ubi_loader::nand::mtd::MtdNand;
use ubi_loader::{
    nand::{Nand, NandLayout, SimNand},
    ubi::{load_volumes, Error, Geometry, LoadRequest, LoadedVolume, VolumeSelector},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to a raw NAND image
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND image, as BLOCKSxPAGESxBYTES
    #[clap(long)]
    sim_layout: Option<NandLayout>,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                let mut file =
                    File::open(path).with_context(|| format!("opening {}", path.display()))?;
                sim.load(&mut file)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = if let Some(name) = &self.mtd_name {
                    MtdNand::open_named(name)?
                } else if let Some(dev) = &self.mtd_dev {
                    MtdNand::open(dev)?
                } else {
                    bail!("no NAND given");
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            bail!("no NAND given")
        };

        Ok(nandimpl)
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl NandImpl {
    fn layout(&self) -> NandLayout {
        match self {
            Self::Sim(nand) => nand.get_layout(),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.get_layout(),
        }
    }

    fn load(
        &mut self,
        geometry: &Geometry,
        requests: &mut [LoadRequest],
    ) -> Result<Vec<LoadedVolume>, Error> {
        match self {
            Self::Sim(nand) => load_volumes(geometry, nand, requests),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => load_volumes(geometry, nand, requests),
        }
    }
}

/// Where the UBI image lives and how it is laid out; anything not given is derived from the NAND
#[derive(Args, Debug)]
struct GeometryOptions {
    /// Offset of the VID header in each PEB [default: one page]
    #[clap(long)]
    vid_offset: Option<u32>,

    /// Offset of the LEB data in each PEB [default: two pages]
    #[clap(long)]
    leb_start: Option<u32>,

    /// First PEB of the UBI image
    #[clap(long, default_value_t = 0)]
    peb_offset: u32,

    /// Number of PEBs in the UBI image [default: the rest of the NAND]
    #[clap(long)]
    peb_count: Option<u32>,

    /// Don't use the fastmap, even if there is one
    #[clap(long)]
    no_fastmap: bool,

    /// Highest volume ID (plus one) that can be loaded
    #[clap(long, default_value_t = Geometry::DEFAULT_MAX_VOL_IDS)]
    max_vol_ids: u32,

    /// Most LEBs a loadable volume may have
    #[clap(long, default_value_t = Geometry::DEFAULT_MAX_VOL_LEBS)]
    max_vol_lebs: u32,
}

impl GeometryOptions {
    fn apply(&self, layout: NandLayout) -> Result<Geometry> {
        let mut geometry = Geometry::for_layout(layout);
        if let Some(vid_offset) = self.vid_offset {
            geometry.vid_offset = vid_offset;
        }
        if let Some(leb_start) = self.leb_start {
            geometry.leb_start = leb_start;
        }

        let peb_count = match self.peb_count {
            Some(count) => count,
            None => layout
                .blocks
                .checked_sub(self.peb_offset)
                .ok_or_else(|| anyhow!("PEB offset {} is past the end of the NAND", self.peb_offset))?,
        };
        geometry.max_vol_ids = self.max_vol_ids;
        geometry.max_vol_lebs = self.max_vol_lebs;

        Ok(geometry
            .peb_range(self.peb_offset, peb_count)
            .fastmap(!self.no_fastmap))
    }
}

/// A volume to load, and where to put it
#[derive(Debug, Clone)]
struct VolumeArg {
    volume: VolumeSelector,
    path: PathBuf,
}

impl FromStr for VolumeArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((volume, path)) = s.split_once('=') else {
            bail!("expected ID=PATH or NAME=PATH");
        };
        if volume.is_empty() || path.is_empty() {
            bail!("expected ID=PATH or NAME=PATH");
        }

        let volume = match volume.parse() {
            Ok(vol_id) => VolumeSelector::Id(vol_id),
            Err(_) => VolumeSelector::Name(volume.into()),
        };

        Ok(Self {
            volume,
            path: path.into(),
        })
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    geometry: GeometryOptions,

    /// A volume to load, by ID or name, and the file to write it to
    #[clap(long = "volume", short, value_name = "VOLUME=PATH", required = true)]
    volumes: Vec<VolumeArg>,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logger: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut nand = cli.nand.open()?;
    let geometry = cli.geometry.apply(nand.layout())?;
    geometry.validate()?;

    // Every volume gets room for the largest volume the loader accepts, or the whole image
    let max_lebs = geometry.max_vol_lebs.min(geometry.peb_count);
    let capacity = max_lebs as usize * geometry.leb_size() as usize;
    let mut buffers: Vec<Vec<u8>> = cli.volumes.iter().map(|_| vec![0u8; capacity]).collect();

    let mut requests: Vec<LoadRequest> = cli
        .volumes
        .iter()
        .zip(buffers.iter_mut())
        .map(|(arg, dest)| LoadRequest {
            volume: arg.volume.clone(),
            dest,
        })
        .collect();
    let loaded = nand.load(&geometry, &mut requests)?;
    drop(requests);

    for ((arg, buffer), volume) in cli.volumes.iter().zip(&buffers).zip(&loaded) {
        std::fs::write(&arg.path, &buffer[..volume.len])
            .with_context(|| format!("writing {}", arg.path.display()))?;
        info!(
            vol_id = volume.vol_id,
            lebs = volume.leb_count,
            bytes = volume.len,
            path = %arg.path.display(),
            "volume written"
        );
    }

    howudoin::disable();
    Ok(())
}
