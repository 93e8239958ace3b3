//! This module reads a UBI fastmap: a snapshot of the PEB-to-LEB mapping, written by UBI so that
//! attaching does not require reading every VID header.
//!
//! The fastmap is found through its "anchor" PEB (within the first [UBI_FM_MAX_START] PEBs),
//! whose LEB data starts with a superblock listing the PEBs that hold the rest. The payload, the
//! concatenation of those PEBs' LEB data, is a sequence of records:
//!
//! ```text
//! +----+-----+--------+--------+---------+---------+---------+---------+--------+-----+--
//! | SB | HDR | POOL 1 | POOL 2 | free EC | used EC | scrub EC| erase EC| VOLHDR | EBA | ...
//! +----+-----+--------+--------+---------+---------+---------+---------+--------+-----+--
//! ```
//!
//! Nothing in it is trusted until the whole payload passes its CRC, and every record still gets
//! bounds- and magic-checked.

use deku::prelude::*;
use tracing::debug;

use super::error::{FastmapError, PebError};
use super::headers::*;
use super::scan::ScanInfo;
use crate::nand::{Nand, ReadStatus};

/// The fastmap anchor must be within this many PEBs of the start of the device
pub const UBI_FM_MAX_START: u32 = 64;

/// The most PEBs one fastmap may occupy
pub const UBI_FM_MAX_BLOCKS: usize = 32;

/// The most PEBs one pool may hold
pub const UBI_FM_MAX_POOL_SIZE: usize = 256;

/// The size of the volume table UBI sizes the fastmap for
pub const UBI_MAX_VOLUMES: usize = 128;

pub const UBI_FM_FMT_VERSION: u8 = 2;

pub const UBI_FM_SB_MAGIC: u32 = 0x7B11_D69F;
pub const UBI_FM_HDR_MAGIC: u32 = 0xD4B8_2EF7;
pub const UBI_FM_POOL_MAGIC: u32 = 0x67AF_4D08;
pub const UBI_FM_VHDR_MAGIC: u32 = 0xFA37_0ED1;
pub const UBI_FM_EBA_MAGIC: u32 = 0xF0C0_40A8;

/// Fastmap volume headers number volume types differently than VID headers do
pub const UBI_DYNAMIC_VOLUME: u8 = 3;
pub const UBI_STATIC_VOLUME: u8 = 4;

/// Where `data_crc` lives within the superblock
pub const FM_SB_CRC_OFFSET: usize = 8;

/// A fixed-size record of the fastmap payload
pub trait FmRecord: Sized {
    const SIZE: usize;
    const NAME: &'static str;
}

/// The superblock, at the start of the anchor's LEB data
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmSb {
    pub magic: u32,
    pub version: u8,
    pub padding1: [u8; 3],
    pub data_crc: u32,
    pub used_blocks: u32,
    pub block_loc: [u32; UBI_FM_MAX_BLOCKS],
    pub block_ec: [u32; UBI_FM_MAX_BLOCKS],
    pub sqnum: u64,
    pub padding2: [u8; 32],
}

impl FmRecord for FmSb {
    const SIZE: usize = 312;
    const NAME: &'static str = "superblock";
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmHdr {
    pub magic: u32,
    pub free_peb_count: u32,
    pub used_peb_count: u32,
    pub scrub_peb_count: u32,
    pub bad_peb_count: u32,
    pub erase_peb_count: u32,
    pub vol_count: u32,
    pub padding: [u8; 4],
}

impl FmRecord for FmHdr {
    const SIZE: usize = 32;
    const NAME: &'static str = "header";
}

/// PEBs that UBI may have written since the fastmap was, and so must be scanned
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmScanPool {
    pub magic: u32,
    pub size: u16,
    pub max_size: u16,
    pub pebs: [u32; UBI_FM_MAX_POOL_SIZE],
    pub padding: [u8; 4],
}

impl FmRecord for FmScanPool {
    const SIZE: usize = 1036;
    const NAME: &'static str = "pool";
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmEc {
    pub pnum: u32,
    pub ec: u32,
}

impl FmRecord for FmEc {
    const SIZE: usize = 8;
    const NAME: &'static str = "EC";
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmVolHdr {
    pub magic: u32,
    pub vol_id: u32,
    pub vol_type: u8,
    pub padding1: [u8; 3],
    pub data_pad: u32,
    pub used_ebs: u32,
    pub last_eb_bytes: u32,
    pub padding2: [u8; 8],
}

impl FmRecord for FmVolHdr {
    const SIZE: usize = 32;
    const NAME: &'static str = "volume header";
}

/// Start of a volume's EBA table; `reserved_pebs` big-endian PEB numbers follow
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmEba {
    pub magic: u32,
    pub reserved_pebs: u32,
}

impl FmRecord for FmEba {
    const SIZE: usize = 8;
    const NAME: &'static str = "EBA";
}

/// The size of the fastmap payload UBI writes for a device of `peb_count` PEBs
pub fn calc_fm_size(peb_count: u32, leb_size: usize) -> usize {
    let peb_count = peb_count as usize;
    let size = FmSb::SIZE
        + FmHdr::SIZE
        + FmScanPool::SIZE * 2
        + peb_count * FmEc::SIZE
        + FmEba::SIZE
        + peb_count * std::mem::size_of::<u32>()
        + FmVolHdr::SIZE * UBI_MAX_VOLUMES;
    size.div_ceil(leb_size) * leb_size
}

fn check_magic(record: &'static str, found: u32, expected: u32) -> Result<(), FastmapError> {
    match found == expected {
        true => Ok(()),
        false => Err(FastmapError::BadMagic {
            record,
            found,
            expected,
        }),
    }
}

/// Walks the records of a fastmap payload. A record is refused if the position after it would
/// reach the end of the payload.
struct FmCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FmCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FastmapError> {
        let overrun = FastmapError::Overrun {
            offset: self.pos,
            size: self.buf.len(),
        };
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end < self.buf.len())
            .ok_or(overrun)?;

        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn record<T: FmRecord + DekuContainerRead<'a>>(&mut self) -> Result<T, FastmapError> {
        let bytes = self.take(T::SIZE)?;
        let (_, record) = T::from_bytes((bytes, 0)).map_err(|_| FastmapError::Malformed(T::NAME))?;
        Ok(record)
    }
}

impl<N: Nand> ScanInfo<'_, N> {
    /// Read and verify the fastmap anchored at `anchor`, then attach with it
    pub fn scan_fastmap(&mut self, anchor: u32) -> Result<(), FastmapError> {
        let leb_start = self.geo.leb_start as usize;

        let mut sb_bytes = [0u8; FmSb::SIZE];
        match self.read(anchor, leb_start, &mut sb_bytes) {
            Ok(ReadStatus::Clean) => (),
            Ok(ReadStatus::Bitflips) => debug!(peb = anchor, "bitflips in fastmap superblock"),
            Err(err) => {
                return Err(FastmapError::BlockUnreadable {
                    index: 0,
                    peb: anchor,
                    source: err.into(),
                })
            }
        }

        let (_, sb) = FmSb::from_bytes((&sb_bytes[..], 0))
            .map_err(|_| FastmapError::Malformed(FmSb::NAME))?;
        check_magic(FmSb::NAME, sb.magic, UBI_FM_SB_MAGIC)?;

        if sb.version != UBI_FM_FMT_VERSION {
            return Err(FastmapError::BadVersion {
                found: sb.version,
                expected: UBI_FM_FMT_VERSION,
            });
        }

        let used_blocks = sb.used_blocks as usize;
        if !(1..=UBI_FM_MAX_BLOCKS).contains(&used_blocks) {
            return Err(FastmapError::BadBlockCount(sb.used_blocks));
        }

        let expected = calc_fm_size(self.geo.peb_count, self.leb_size);
        let found = self.leb_size * used_blocks;
        if found != expected {
            return Err(FastmapError::BadSize { found, expected });
        }

        let mut payload = vec![0u8; found];
        let mut sqnum = 0;
        for (index, (&pnum, chunk)) in sb
            .block_loc
            .iter()
            .zip(payload.chunks_exact_mut(self.leb_size))
            .enumerate()
        {
            if pnum >= self.geo.peb_count {
                return Err(FastmapError::PebOutOfRange(pnum));
            }

            let vid = self
                .read_vid_hdr(pnum)
                .map_err(|source| FastmapError::BlockUnreadable {
                    index,
                    peb: pnum,
                    source,
                })?;

            let expected = match index {
                0 => UBI_FM_SB_VOLUME_ID,
                _ => UBI_FM_DATA_VOLUME_ID,
            };
            if vid.vol_id != expected {
                return Err(FastmapError::BadVolId {
                    index,
                    found: vid.vol_id,
                    expected,
                });
            }
            sqnum = sqnum.max(vid.sqnum);

            match self.read(pnum, leb_start, chunk) {
                Ok(ReadStatus::Clean) => (),
                Ok(ReadStatus::Bitflips) => debug!(peb = pnum, index, "bitflips in fastmap block"),
                Err(err) => {
                    return Err(FastmapError::BlockUnreadable {
                        index,
                        peb: pnum,
                        source: PebError::Io(err),
                    })
                }
            }
        }

        let crc_bytes = &mut payload[FM_SB_CRC_OFFSET..FM_SB_CRC_OFFSET + 4];
        let stored = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        crc_bytes.fill(0);
        let computed = UBI_CRC.checksum(&payload);
        if computed != stored {
            return Err(FastmapError::BadCrc { stored, computed });
        }

        debug!(anchor, used_blocks, sqnum, "fastmap payload verified");
        self.attach_fastmap(&payload)
    }

    /// Build the volume table from a verified fastmap payload
    fn attach_fastmap(&mut self, payload: &[u8]) -> Result<(), FastmapError> {
        self.fm_used.clear_all();

        let mut cur = FmCursor::new(payload);
        cur.take(FmSb::SIZE)?;

        let hdr: FmHdr = cur.record()?;
        check_magic(FmHdr::NAME, hdr.magic, UBI_FM_HDR_MAGIC)?;

        let pool: FmScanPool = cur.record()?;
        check_magic(FmScanPool::NAME, pool.magic, UBI_FM_POOL_MAGIC)?;
        let wl_pool: FmScanPool = cur.record()?;
        check_magic("WL pool", wl_pool.magic, UBI_FM_POOL_MAGIC)?;

        for (name, size) in [
            ("pool", pool.size),
            ("WL pool", wl_pool.size),
            ("maximal pool", pool.max_size),
            ("maximal WL pool", wl_pool.max_size),
        ] {
            if size as usize > UBI_FM_MAX_POOL_SIZE {
                return Err(FastmapError::BadPoolSize { pool: name, size });
            }
        }

        for _ in 0..hdr.free_peb_count {
            cur.take(FmEc::SIZE)?;
        }

        for _ in 0..hdr.used_peb_count {
            let ec: FmEc = cur.record()?;
            if !self.fm_used.set(ec.pnum) {
                return Err(FastmapError::PebOutOfRange(ec.pnum));
            }
        }

        for _ in 0..u64::from(hdr.scrub_peb_count) + u64::from(hdr.erase_peb_count) {
            cur.take(FmEc::SIZE)?;
        }

        for _ in 0..hdr.vol_count {
            let volhdr: FmVolHdr = cur.record()?;
            check_magic(FmVolHdr::NAME, volhdr.magic, UBI_FM_VHDR_MAGIC)?;

            let eba: FmEba = cur.record()?;
            let table_len = (eba.reserved_pebs as usize)
                .checked_mul(std::mem::size_of::<u32>())
                .ok_or(FastmapError::Malformed(FmEba::NAME))?;
            let table = cur.take(table_len)?;
            check_magic(FmEba::NAME, eba.magic, UBI_FM_EBA_MAGIC)?;

            let used = volhdr.used_ebs as usize;
            debug!(
                vol_id = volhdr.vol_id,
                used,
                reserved = eba.reserved_pebs,
                "fastmap volume"
            );

            for (lnum, entry) in table.chunks_exact(4).enumerate() {
                let pnum = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);

                // Unmapped
                if (pnum as i32) < 0 {
                    continue;
                }

                if !self.fm_used.test_and_clear(pnum) {
                    continue;
                }

                // Reserved, but not (yet) part of the static volume's contents
                if lnum >= used {
                    continue;
                }

                match self.assign_aeb_to_av(&volhdr, pnum) {
                    Ok(()) => (),

                    // UBI's fastmap may count one more LEB than the volume has, in which case
                    // that last block is still erased.
                    Err(PebError::Blank) if lnum == used - 1 => {
                        debug!(vol_id = volhdr.vol_id, lnum, used, "ignoring empty LEB");
                    }

                    Err(source) => {
                        return Err(FastmapError::BadLeb {
                            vol_id: volhdr.vol_id,
                            lnum: lnum as u32,
                            peb: pnum,
                            source,
                        })
                    }
                }
            }
        }

        self.scan_pool(&pool.pebs[..pool.size as usize])?;
        self.scan_pool(&wl_pool.pebs[..wl_pool.size as usize])?;

        Ok(())
    }

    /// Fold one PEB listed by a fastmap EBA table into the volume table
    fn assign_aeb_to_av(&mut self, volhdr: &FmVolHdr, pnum: u32) -> Result<(), PebError> {
        if pnum >= self.geo.peb_count {
            return Err(PebError::OutOfRange(pnum));
        }

        // Until the volume table is read, any volume could be the one asked for by name
        if !self.want_vtbl
            && (volhdr.vol_type != UBI_STATIC_VOLUME || !self.toload.test(volhdr.vol_id))
        {
            return Ok(());
        }

        self.scan_vid_hdr(pnum).map(|_| ())
    }

    /// Scan PEBs that may have been written after the fastmap. Only PEBs out of range make the
    /// fastmap unusable; anything wrong with the blocks themselves is for the loader to find.
    fn scan_pool(&mut self, pebs: &[u32]) -> Result<(), FastmapError> {
        debug!(size = pebs.len(), "scanning fastmap pool");
        for &pnum in pebs {
            if pnum >= self.geo.peb_count {
                return Err(FastmapError::PebOutOfRange(pnum));
            }
            if let Err(err) = self.scan_vid_hdr(pnum) {
                debug!(peb = pnum, %err, "pool PEB skipped");
            }
        }
        Ok(())
    }
}
