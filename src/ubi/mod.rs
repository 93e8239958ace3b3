//! This module implements loading of static UBI volumes into memory, as done by a boot stage that
//! has nothing but a raw NAND read routine at its disposal.
//!
//! UBI keeps no fixed logical-to-physical map on flash. Every PEB in use starts with an "erase
//! counter" ("EC") header and a "volume ID" ("VID") header that names the volume and LEB it holds,
//! plus a sequence number. Rebuilding the map therefore means reading the VID header of every
//! PEB:
//!
//! ```text
//!  PEB 0        PEB 1        PEB 2        PEB 3              PEB n
//! +----------+ +----------+ +----------+ +----------+       +----------+
//! | EC       | | EC       | | EC       | | EC       |       | EC       |
//! | VID 0:0  | | VID FM-SB| | (erased) | | VID 0:0  |  ...  | VID 0:1  |
//! | data ... | | fastmap  | |          | | data ... |       | data ... |
//! +----------+ +----------+ +----------+ +----------+       +----------+
//! ```
//!
//! When the same LEB shows up twice (PEB 0 and PEB 3 above), the higher sequence number wins,
//! unless that copy turns out to be corrupt.
//!
//! A fastmap, when present within the first [UBI_FM_MAX_START](fastmap::UBI_FM_MAX_START) PEBs,
//! records the whole map (as of the time it was written) and saves most of that scan. It is
//! only trusted after passing all of its structural and CRC checks; if it fails any of them, or
//! if a volume cannot be loaded with the map it produced, the loader starts over with a full scan.

mod bitmap;
mod error;
mod fastmap;
mod headers;
mod load;
mod scan;
mod volume;
mod vtbl;

#[cfg(test)]
mod testimg;

pub use error::Error;
pub use headers::{VolType, Vid, UBI_CRC};

use crate::nand::{Nand, NandLayout};

use bitmap::Bitmap;
use headers::UBI_VID_HDR_SIZE;
use scan::ScanInfo;
use tracing::{info, warn};

/// Where UBI lives on the flash, and how the loader may go about finding it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    /// Bytes per PEB
    pub peb_size: u32,

    /// Offset of the LEB data within each PEB
    pub leb_start: u32,

    /// Offset of the VID header within each PEB
    pub vid_offset: u32,

    /// Number of PEBs in the UBI device
    pub peb_count: u32,

    /// Index of the device's first PEB on the flash
    pub peb_offset: u32,

    /// Whether a fastmap may be used, if one is found
    pub fastmap: bool,

    /// Volume IDs `0..max_vol_ids` can be loaded
    pub max_vol_ids: u32,

    /// The largest number of LEBs a loadable volume may have
    pub max_vol_lebs: u32,
}

impl Geometry {
    pub const DEFAULT_MAX_VOL_IDS: u32 = 8;
    pub const DEFAULT_MAX_VOL_LEBS: u32 = 256;

    /// Upper bound for `max_vol_lebs`
    pub const MAX_VOL_LEBS_LIMIT: u32 = 16384;

    /// The usual layout of UBI on NAND: the whole device, EC header in page 0, VID header in
    /// page 1, and data from page 2 onward.
    pub fn for_layout(layout: NandLayout) -> Self {
        let page = layout.bytes_per_page as u32;
        Self {
            peb_size: layout.block_size() as u32,
            leb_start: page * 2,
            vid_offset: page,
            peb_count: layout.blocks,
            peb_offset: 0,
            fastmap: true,
            max_vol_ids: Self::DEFAULT_MAX_VOL_IDS,
            max_vol_lebs: Self::DEFAULT_MAX_VOL_LEBS,
        }
    }

    /// Enable or disable use of the fastmap
    pub fn fastmap(mut self, fastmap: bool) -> Self {
        self.fastmap = fastmap;
        self
    }

    /// Restrict the UBI device to `count` PEBs, starting at PEB `offset` of the flash
    pub fn peb_range(mut self, offset: u32, count: u32) -> Self {
        self.peb_offset = offset;
        self.peb_count = count;
        self
    }

    /// Bytes of data per LEB
    pub fn leb_size(&self) -> u32 {
        self.peb_size.saturating_sub(self.leb_start)
    }

    /// Check that the geometry is usable; [load_volumes] does this first thing
    pub fn validate(&self) -> Result<(), Error> {
        if self.peb_count == 0 {
            return Err(Error::Geometry("no PEBs"));
        }
        if self.leb_start >= self.peb_size {
            return Err(Error::Geometry("LEB data starts beyond the end of the PEB"));
        }
        if self.vid_offset as usize + UBI_VID_HDR_SIZE > self.peb_size as usize {
            return Err(Error::Geometry("VID header does not fit in the PEB"));
        }
        if self.peb_offset.checked_add(self.peb_count).is_none() {
            return Err(Error::Geometry("PEB range overflows"));
        }
        if self.max_vol_ids == 0 || self.max_vol_lebs == 0 {
            return Err(Error::Geometry("volume limits must be nonzero"));
        }
        if self.max_vol_ids as usize > fastmap::UBI_MAX_VOLUMES {
            return Err(Error::Geometry("more volume IDs than UBI supports"));
        }
        if self.max_vol_lebs > Self::MAX_VOL_LEBS_LIMIT {
            return Err(Error::Geometry("volume LEB limit too large"));
        }
        Ok(())
    }
}

/// How a volume to load is identified
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum VolumeSelector {
    Id(u32),

    /// Looked up in the volume table (the layout volume)
    Name(String),
}

/// One volume to load, and the memory to load it into
#[derive(Debug)]
pub struct LoadRequest<'a> {
    pub volume: VolumeSelector,
    pub dest: &'a mut [u8],
}

impl<'a> LoadRequest<'a> {
    pub fn by_id(vol_id: u32, dest: &'a mut [u8]) -> Self {
        Self {
            volume: VolumeSelector::Id(vol_id),
            dest,
        }
    }

    pub fn by_name<S: Into<String>>(name: S, dest: &'a mut [u8]) -> Self {
        Self {
            volume: VolumeSelector::Name(name.into()),
            dest,
        }
    }
}

/// The outcome of loading one [LoadRequest]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoadedVolume {
    /// The ID of the loaded volume (resolved from the name, if requested by name)
    pub vol_id: u32,

    /// Bytes written to the start of the destination
    pub len: usize,

    /// Number of LEBs the volume consists of
    pub leb_count: u32,
}

/// Load every requested static volume into its destination, in order.
///
/// A fastmap is used if `geometry` allows it and one is found; any failure to load with it
/// causes a single retry with a full scan. On error, the contents of the destinations are
/// undefined.
pub fn load_volumes<N: Nand>(
    geometry: &Geometry,
    nand: &mut N,
    requests: &mut [LoadRequest<'_>],
) -> Result<Vec<LoadedVolume>, Error> {
    geometry.validate()?;

    let mut fastmap = geometry.fastmap;
    loop {
        match try_load_volumes(geometry, nand, requests, fastmap) {
            Ok(loaded) => return Ok(loaded),
            Err(err) if fastmap => {
                warn!(%err, "loading with fastmap failed, retrying with a full scan");
                fastmap = false;
            }
            Err(err) => {
                warn!(%err, "loading failed");
                return Err(err);
            }
        }
    }
}

/// A single attempt at [load_volumes], with all state built from scratch
fn try_load_volumes<N: Nand>(
    geometry: &Geometry,
    nand: &mut N,
    requests: &mut [LoadRequest<'_>],
    fastmap: bool,
) -> Result<Vec<LoadedVolume>, Error> {
    // Volumes requested by name could be any ID until the volume table is read, so track them all
    let by_name = requests
        .iter()
        .any(|req| matches!(req.volume, VolumeSelector::Name(_)));
    let toload = match by_name {
        true => Bitmap::full(geometry.max_vol_ids as usize),
        false => {
            let mut toload = Bitmap::new(geometry.max_vol_ids as usize);
            for req in requests.iter() {
                if let VolumeSelector::Id(vol_id) = req.volume {
                    toload.set(vol_id);
                }
            }
            toload
        }
    };

    let mut ubi = ScanInfo::new(geometry, nand, fastmap, toload, by_name);
    ubi.attach();

    let mut loaded = Vec::with_capacity(requests.len());
    for req in requests.iter_mut() {
        let vol_id = match &req.volume {
            VolumeSelector::Id(vol_id) => {
                info!(vol_id, "loading volume");
                *vol_id
            }
            VolumeSelector::Name(name) => {
                let vol_id = ubi
                    .vtbl()
                    .and_then(|vtbl| vtbl.lookup(name))
                    .ok_or_else(|| Error::VolumeNotFound(name.clone()))?;
                info!(name = %name, vol_id, "loading volume");
                vol_id
            }
        };

        loaded.push(ubi.load_volume(vol_id, req.dest)?);
    }

    Ok(loaded)
}

#[cfg(test)]
mod test {
    use super::testimg::{ImageBuilder, FmVolume};
    use super::*;
    use crate::nand::{SimFault, SimNand};

    /// Four LEBs of volume 0, each stored once, and no fastmap
    fn four_leb_image() -> anyhow::Result<(ImageBuilder, Vec<u8>)> {
        let mut img = ImageBuilder::new();
        let data = img.pattern(4 * img.leb_size() - 100, 0x10);
        img.write_volume(0, &[5, 9, 20, 33], &data)?;
        Ok((img, data))
    }

    fn load_one(geo: &Geometry, nand: &mut SimNand, vol_id: u32) -> Result<Vec<u8>, Error> {
        let mut dest = vec![0u8; 8 * geo.leb_size() as usize];
        let loaded = load_volumes(geo, nand, &mut [LoadRequest::by_id(vol_id, &mut dest)])?;
        dest.truncate(loaded[0].len);
        Ok(dest)
    }

    #[test]
    fn test_full_scan_concatenates_lebs() -> anyhow::Result<()> {
        let (img, data) = four_leb_image()?;
        let geo = img.geometry().fastmap(false);
        let mut nand = img.into_nand();

        let mut dest = vec![0u8; data.len() + 7];
        let loaded = load_volumes(&geo, &mut nand, &mut [LoadRequest::by_id(0, &mut dest)])?;
        assert_eq!(
            loaded,
            [LoadedVolume {
                vol_id: 0,
                len: data.len(),
                leb_count: 4
            }]
        );
        assert_eq!(&dest[..data.len()], &data[..]);
        Ok(())
    }

    #[test]
    fn test_prefers_older_valid_copy() -> anyhow::Result<()> {
        let (mut img, data) = four_leb_image()?;
        let leb_size = img.leb_size();

        // An older copy of LEB 2 with the same contents, then damage the newer one's payload
        let leb2 = &data[2 * leb_size..3 * leb_size];
        img.write_leb_sqnum(50, 0, 2, 4, leb2, 1)?;
        img.flip_payload_byte(20, 17)?;

        let geo = img.geometry().fastmap(false);
        let mut nand = img.into_nand();
        assert_eq!(load_one(&geo, &mut nand, 0)?, data);
        Ok(())
    }

    #[test]
    fn test_fastmap_attach() -> anyhow::Result<()> {
        let (mut img, data) = four_leb_image()?;
        img.write_fastmap(
            2,
            &[3, 4],
            &[FmVolume::new(0, 4, &[5, 9, 20, 33])],
            &[5, 9, 20, 33],
            &[],
        )?;

        let geo = img.geometry();
        let mut nand = img.into_nand();
        assert_eq!(load_one(&geo, &mut nand, 0)?, data);

        // Window up to the anchor, the superblock and fastmap blocks, then one VID + payload
        // read per LEB: far fewer reads than scanning all 64 PEBs.
        assert!(nand.read_count() < 30, "{} reads", nand.read_count());
        Ok(())
    }

    #[test]
    fn test_bad_fastmap_crc_falls_back() -> anyhow::Result<()> {
        let (mut img, data) = four_leb_image()?;
        img.write_fastmap(
            2,
            &[3, 4],
            &[FmVolume::new(0, 4, &[5, 9, 20, 33])],
            &[5, 9, 20, 33],
            &[],
        )?;
        let geo = img.geometry();
        let mut good = img.nand().clone();

        // Damage a byte deep inside the fastmap payload
        img.flip_payload_byte(4, 100)?;
        let mut bad = img.into_nand();

        let with_fastmap = load_one(&geo, &mut good, 0)?;
        let fallback = load_one(&geo, &mut bad, 0)?;
        let full_scan = load_one(&geo.fastmap(false), &mut bad, 0)?;

        assert_eq!(with_fastmap, data);
        assert_eq!(fallback, with_fastmap);
        assert_eq!(full_scan, with_fastmap);
        Ok(())
    }

    #[test]
    fn test_stale_fastmap_retries_full_scan() -> anyhow::Result<()> {
        let (mut img, data) = four_leb_image()?;

        // The fastmap is valid, but LEB 3 moved to PEB 40 after it was written and PEB 33 was
        // erased. The fastmap-driven load fails, and the full-scan retry finds the new copy.
        img.write_fastmap(
            2,
            &[3, 4],
            &[FmVolume::new(0, 4, &[5, 9, 20, 33])],
            &[5, 9, 20, 33],
            &[],
        )?;
        let leb3 = data[3 * img.leb_size()..].to_vec();
        img.write_leb_sqnum(40, 0, 3, 4, &leb3, 1000)?;
        img.nand_mut().erase(33)?;

        let geo = img.geometry();
        let mut nand = img.into_nand();
        assert_eq!(load_one(&geo, &mut nand, 0)?, data);
        Ok(())
    }

    #[test]
    fn test_pool_blocks_are_scanned() -> anyhow::Result<()> {
        let (mut img, data) = four_leb_image()?;
        img.write_fastmap(
            2,
            &[3, 4],
            &[FmVolume::new(0, 4, &[5, 9, 20, 33])],
            &[5, 9, 20, 33],
            &[40],
        )?;

        // Newer copy of LEB 1 written into a pool block after the fastmap was written
        let mut leb1 = data[img.leb_size()..2 * img.leb_size()].to_vec();
        leb1[0] = !leb1[0];
        img.write_leb_sqnum(40, 0, 1, 4, &leb1, 1000)?;

        let mut expected = data.clone();
        expected[img.leb_size()] = leb1[0];

        let geo = img.geometry();
        let mut nand = img.into_nand();
        assert_eq!(load_one(&geo, &mut nand, 0)?, expected);
        Ok(())
    }

    #[test]
    fn test_fastmap_tolerates_blank_last_leb() -> anyhow::Result<()> {
        let (mut img, data) = four_leb_image()?;

        // The fastmap claims a fifth LEB in (erased) PEB 50
        img.write_fastmap(
            2,
            &[3, 4],
            &[FmVolume::new(0, 5, &[5, 9, 20, 33, 50])],
            &[5, 9, 20, 33, 50],
            &[],
        )?;

        let geo = img.geometry();
        let mut nand = img.into_nand();
        assert_eq!(load_one(&geo, &mut nand, 0)?, data);
        Ok(())
    }

    #[test]
    fn test_fastmap_tolerates_half_written_last_leb() -> anyhow::Result<()> {
        let (mut img, data) = four_leb_image()?;
        img.write_fastmap(
            2,
            &[3, 4],
            &[FmVolume::new(0, 5, &[5, 9, 20, 33, 50])],
            &[5, 9, 20, 33, 50],
            &[],
        )?;

        // The fifth LEB's header write never got as far as the magic
        let mut hdr = [0xFF; UBI_VID_HDR_SIZE];
        hdr[8] = 0;
        let vid_offset = img.geometry().vid_offset as usize;
        img.nand_mut().program(50, vid_offset, &hdr)?;

        let geo = img.geometry();
        let mut nand = img.into_nand();
        let mut ubi = ScanInfo::new(&geo, &mut nand, true, Bitmap::full(8), false);
        let anchor = ubi.scan_range(0, fastmap::UBI_FM_MAX_START);
        assert_eq!(anchor, Some(2));
        ubi.scan_fastmap(2)?;
        drop(ubi);

        assert_eq!(load_one(&geo, &mut nand, 0)?, data);
        Ok(())
    }

    #[test]
    fn test_by_name() -> anyhow::Result<()> {
        let mut img = ImageBuilder::new();
        let kernel = img.pattern(2 * img.leb_size(), 0x21);
        let dtb = img.pattern(300, 0x77);
        img.write_volume(1, &[10, 11], &kernel)?;
        img.write_volume(4, &[12], &dtb)?;
        img.write_vtbl(&[60, 61], &[(1, "kernel", 2), (4, "dtb", 1)])?;

        let geo = img.geometry().fastmap(false);
        let mut nand = img.into_nand();

        let mut kernel_dest = vec![0u8; kernel.len()];
        let mut dtb_dest = vec![0u8; 4096];
        let loaded = load_volumes(
            &geo,
            &mut nand,
            &mut [
                LoadRequest::by_name("dtb", &mut dtb_dest),
                LoadRequest::by_name("kernel", &mut kernel_dest),
            ],
        )?;

        assert_eq!(loaded[0].vol_id, 4);
        assert_eq!(loaded[0].len, dtb.len());
        assert_eq!(loaded[1].vol_id, 1);
        assert_eq!(&dtb_dest[..dtb.len()], &dtb[..]);
        assert_eq!(kernel_dest, kernel);

        let mut dest = vec![0u8; 16];
        assert!(matches!(
            load_volumes(&geo, &mut nand, &mut [LoadRequest::by_name("rootfs", &mut dest)]),
            Err(Error::VolumeNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_by_name_through_fastmap() -> anyhow::Result<()> {
        let mut img = ImageBuilder::new();
        let kernel = img.pattern(2 * img.leb_size(), 0x31);
        let dtb = img.pattern(500, 0x42);
        img.write_volume(1, &[10, 11], &kernel)?;
        img.write_volume(4, &[12], &dtb)?;
        img.write_vtbl(&[20, 21], &[(1, "kernel", 2), (4, "dtb", 1)])?;

        let layout = FmVolume {
            vol_id: headers::UBI_LAYOUT_VOLUME_ID,
            vol_type: fastmap::UBI_DYNAMIC_VOLUME,
            used_ebs: 2,
            pebs: vec![20, 21],
        };
        img.write_fastmap(
            2,
            &[3, 4],
            &[
                FmVolume::new(1, 2, &[10, 11]),
                FmVolume::new(4, 1, &[12]),
                layout,
            ],
            &[10, 11, 12, 20, 21],
            &[],
        )?;

        let geo = img.geometry();
        let mut nand = img.into_nand();

        // The volume table is only reachable through the fastmap: it lies past the anchor
        let mut ubi = ScanInfo::new(&geo, &mut nand, true, Bitmap::full(8), true);
        ubi.attach();
        assert!(ubi.fm_enabled);
        assert!(!ubi.is_scanned(40));
        assert_eq!(ubi.vtbl().and_then(|vtbl| vtbl.lookup("dtb")), Some(4));
        drop(ubi);

        let mut kernel_dest = vec![0u8; kernel.len()];
        let mut dtb_dest = vec![0u8; dtb.len()];
        let loaded = load_volumes(
            &geo,
            &mut nand,
            &mut [
                LoadRequest::by_name("kernel", &mut kernel_dest),
                LoadRequest::by_name("dtb", &mut dtb_dest),
            ],
        )?;
        assert_eq!((loaded[0].vol_id, loaded[1].vol_id), (1, 4));
        assert_eq!(kernel_dest, kernel);
        assert_eq!(dtb_dest, dtb);
        Ok(())
    }

    #[test]
    fn test_missing_volume() -> anyhow::Result<()> {
        let (img, _) = four_leb_image()?;
        let geo = img.geometry();
        let mut nand = img.into_nand();

        assert!(matches!(
            load_one(&geo, &mut nand, 3),
            Err(Error::UnrecoverableVolume { vol_id: 3, lnum: 0 })
        ));
        assert!(matches!(
            load_one(&geo, &mut nand, 8),
            Err(Error::InvalidVolume { vol_id: 8, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unreadable_peb_is_skipped() -> anyhow::Result<()> {
        let (mut img, data) = four_leb_image()?;
        let leb0 = data[..img.leb_size()].to_vec();
        img.write_leb_sqnum(45, 0, 0, 4, &leb0, 1)?;
        img.nand_mut().set_fault(5, SimFault::Ecc)?;
        img.nand_mut().mark_bad(6)?;

        let geo = img.geometry().fastmap(false);
        let mut nand = img.into_nand();
        assert_eq!(load_one(&geo, &mut nand, 0)?, data);
        Ok(())
    }

    #[test]
    fn test_buffer_too_small() -> anyhow::Result<()> {
        let (img, data) = four_leb_image()?;
        let geo = img.geometry().fastmap(false);
        let mut nand = img.into_nand();

        let mut dest = vec![0u8; data.len() - 1];
        assert!(matches!(
            load_volumes(&geo, &mut nand, &mut [LoadRequest::by_id(0, &mut dest)]),
            Err(Error::BufferTooSmall { vol_id: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_peb_offset() -> anyhow::Result<()> {
        let (img, data) = four_leb_image()?;
        let layout = img.nand().get_layout();
        let mut nand = SimNand::new(NandLayout {
            blocks: layout.blocks + 3,
            ..layout
        });

        // Shift the whole UBI device up by 3 PEBs
        let mut src = img.into_nand();
        let mut block = vec![0u8; layout.block_size()];
        for peb in 0..layout.blocks {
            src.read(peb, 0, &mut block)?;
            nand.program(peb + 3, 0, &block)?;
        }

        let geo = Geometry::for_layout(layout)
            .peb_range(3, layout.blocks)
            .fastmap(false);
        assert_eq!(load_one(&geo, &mut nand, 0)?, data);
        Ok(())
    }

    #[test]
    fn test_geometry_validation() {
        let mut nand = SimNand::new(testimg::TEST_LAYOUT);
        let good = Geometry::for_layout(testimg::TEST_LAYOUT);

        for geo in [
            good.peb_range(0, 0),
            Geometry {
                leb_start: good.peb_size,
                ..good
            },
            Geometry {
                vid_offset: good.peb_size - 10,
                ..good
            },
            Geometry {
                max_vol_lebs: 0,
                ..good
            },
            Geometry {
                max_vol_lebs: u32::MAX,
                ..good
            },
            Geometry {
                max_vol_ids: 129,
                ..good
            },
        ] {
            assert!(matches!(
                load_volumes(&geo, &mut nand, &mut []),
                Err(Error::Geometry(_))
            ));
        }

        assert!(load_volumes(&good, &mut nand, &mut []).unwrap().is_empty());

        let widest = Geometry {
            max_vol_ids: 128,
            max_vol_lebs: Geometry::MAX_VOL_LEBS_LIMIT,
            ..good
        };
        assert!(widest.validate().is_ok());
    }
}
