//! This module contains the state of a single load attempt, and the code that fills in its
//! volume table by reading VID headers: either linearly, or guided by a fastmap.

use tracing::{debug, error, info, trace, warn};

use super::bitmap::Bitmap;
use super::error::PebError;
use super::fastmap::UBI_FM_MAX_START;
use super::headers::*;
use super::volume::VolumeTable;
use super::vtbl::Vtbl;
use super::Geometry;
use crate::nand::{Nand, ReadError, ReadStatus};

const ERASED_MAGIC: u32 = 0xFFFF_FFFF;

/// What [ScanInfo::scan_vid_hdr] made of a PEB with a valid VID header
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Scanned {
    /// The PEB is the first block of a fastmap
    Anchor,

    /// The PEB was offered to the volume table
    Added,

    /// The PEB belongs to nothing we are loading
    Skipped,
}

/// Everything known about the UBI device during one load attempt
pub struct ScanInfo<'a, N: Nand> {
    nand: &'a mut N,
    pub(super) geo: Geometry,
    pub(super) leb_size: usize,

    /// Whether a fastmap may still be used
    pub(super) fm_enabled: bool,

    /// PEBs whose VID header has been read; `headers` holds the result
    scanned: Bitmap,

    /// PEBs known to be unusable
    pub(super) corrupt: Bitmap,

    /// PEBs that the fastmap lists as in use, not yet claimed by a volume's EBA table
    pub(super) fm_used: Bitmap,

    /// Cached VID headers; `None` for blank PEBs (and ones not yet scanned)
    headers: Box<[Option<Vid>]>,

    pub(super) volumes: VolumeTable,

    /// Volume IDs of interest
    pub(super) toload: Bitmap,

    /// Whether the volume table must be read, to resolve volume names
    pub(super) want_vtbl: bool,
    pub(super) vtbl: Option<Vtbl>,

    /// Passes of [ScanInfo::find_replacement] so far
    #[cfg(test)]
    pub(super) replacement_searches: usize,
}

impl<'a, N: Nand> ScanInfo<'a, N> {
    /// Fresh state for one load attempt; `geo` must already be validated
    pub fn new(
        geo: &Geometry,
        nand: &'a mut N,
        fm_enabled: bool,
        toload: Bitmap,
        want_vtbl: bool,
    ) -> Self {
        let peb_count = geo.peb_count as usize;
        Self {
            nand,
            geo: *geo,
            leb_size: geo.leb_size() as usize,
            fm_enabled,
            scanned: Bitmap::new(peb_count),
            corrupt: Bitmap::new(peb_count),
            fm_used: Bitmap::new(peb_count),
            headers: vec![None; peb_count].into_boxed_slice(),
            volumes: VolumeTable::new(geo.max_vol_ids, geo.max_vol_lebs),
            toload,
            want_vtbl,
            vtbl: None,
            #[cfg(test)]
            replacement_searches: 0,
        }
    }

    /// The volume table, if one has been read and found valid
    pub fn vtbl(&self) -> Option<&Vtbl> {
        self.vtbl.as_ref()
    }

    #[cfg(test)]
    pub(super) fn nand_mut(&mut self) -> &mut N {
        &mut *self.nand
    }

    pub(super) fn is_scanned(&self, pnum: u32) -> bool {
        self.scanned.test(pnum)
    }

    /// Read from a PEB of the UBI device
    pub(super) fn read(
        &mut self,
        pnum: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<ReadStatus, ReadError> {
        if pnum >= self.geo.peb_count {
            return Err(ReadError::OutOfRange {
                block: pnum,
                offset,
                len: buf.len(),
            });
        }
        self.nand.read(self.geo.peb_offset + pnum, offset, buf)
    }

    /// Read and validate the VID header of `pnum`.
    ///
    /// Only the first call for a PEB touches the flash; the outcome is remembered.
    pub fn read_vid_hdr(&mut self, pnum: u32) -> Result<Vid, PebError> {
        if pnum >= self.geo.peb_count {
            return Err(PebError::OutOfRange(pnum));
        }

        // No point in rescanning a corrupt block
        if self.corrupt.test(pnum) {
            return Err(PebError::BadHdr);
        }

        if self.scanned.test_and_set(pnum) {
            return self.headers[pnum as usize].ok_or(PebError::Blank);
        }

        let mut buf = [0u8; UBI_VID_HDR_SIZE];
        match self.read(pnum, self.geo.vid_offset as usize, &mut buf) {
            Ok(ReadStatus::Clean) => (),
            Ok(ReadStatus::Bitflips) => debug!(peb = pnum, "bitflips in VID header"),
            Err(err) => {
                debug!(peb = pnum, %err, "skipping unreadable PEB");
                self.corrupt.set(pnum);
                return Err(err.into());
            }
        }

        // An erased magic means the PEB is unused, even if a write of the rest was interrupted
        if peek_magic(&buf) == Some(ERASED_MAGIC) {
            return Err(PebError::Blank);
        }

        match Vid::decode(&buf) {
            Some(vid) => {
                trace!(peb = pnum, vol_id = vid.vol_id, lnum = vid.lnum, sqnum = vid.sqnum);
                self.headers[pnum as usize] = Some(vid);
                Ok(vid)
            }
            None => {
                debug!(peb = pnum, magic = ?peek_magic(&buf), "bad VID header");
                self.corrupt.set(pnum);
                Err(PebError::BadHdr)
            }
        }
    }

    /// Make sure `pnum` really holds `vol_id:lnum` of a static volume, as something (the
    /// fastmap, usually) claimed.
    pub fn rescan_fm_vid_hdr(&mut self, pnum: u32, vol_id: u32, lnum: u32) -> Result<Vid, PebError> {
        let vid = self.read_vid_hdr(pnum)?;
        match vid.is_static_leb(vol_id, lnum) {
            true => Ok(vid),
            false => {
                debug!(
                    peb = pnum,
                    vol_id,
                    lnum,
                    found_vol_id = vid.vol_id,
                    found_lnum = vid.lnum,
                    "PEB does not hold the expected LEB"
                );
                Err(PebError::Mismatch)
            }
        }
    }

    fn wants(&self, vid: &Vid) -> bool {
        vid.vol_type == VolType::Static && self.toload.test(vid.vol_id)
    }

    /// Read the VID header of `pnum` and, if it belongs to a volume of interest, offer the PEB
    /// to the volume table.
    pub fn scan_vid_hdr(&mut self, pnum: u32) -> Result<Scanned, PebError> {
        let vid = self.read_vid_hdr(pnum)?;

        match vid.vol_id {
            UBI_FM_SB_VOLUME_ID => return Ok(Scanned::Anchor),
            UBI_LAYOUT_VOLUME_ID => {
                if self.want_vtbl && self.vtbl.is_none() {
                    self.read_volume_table(pnum);
                }
                return Ok(Scanned::Skipped);
            }
            _ => (),
        }

        if !self.wants(&vid) {
            return Ok(Scanned::Skipped);
        }

        self.add_peb_to_vol(&vid, pnum)?;
        Ok(Scanned::Added)
    }

    /// The header of the PEB currently mapped to `vol_id:lnum`, if it still checks out
    fn current_owner_hdr(&mut self, cur: u32, vol_id: u32, lnum: u32) -> Option<Vid> {
        if self.corrupt.test(cur) {
            return None;
        }
        self.rescan_fm_vid_hdr(cur, vol_id, lnum).ok()
    }

    /// Offer `pnum` (with header `vid`) as the owner of its LEB
    pub fn add_peb_to_vol(&mut self, vid: &Vid, pnum: u32) -> Result<(), PebError> {
        let (vol_id, lnum) = (vid.vol_id, vid.lnum);

        let max = self.volumes.max_lebs();
        if lnum >= max {
            warn!(vol_id, lnum, max, "LEB beyond the supported volume size");
            return Err(PebError::LebOutOfRange { lnum, max });
        }

        let Some(vol) = self.volumes.get(vol_id) else {
            return Ok(());
        };

        if let Some(cur) = vol.owner(lnum) {
            if cur == pnum {
                return Ok(());
            }

            if let Some(cur_vid) = self.current_owner_hdr(cur, vol_id, lnum) {
                debug!(
                    vol_id,
                    lnum,
                    peb = cur,
                    sqnum = cur_vid.sqnum,
                    new_peb = pnum,
                    new_sqnum = vid.sqnum,
                    "LEB found twice"
                );
                if cur_vid.sqnum >= vid.sqnum {
                    return Ok(());
                }
            }
        }

        debug!(vol_id, lnum, peb = pnum, "adding PEB to volume");
        if let Some(vol) = self.volumes.get_mut(vol_id) {
            vol.assign(lnum, pnum);
        }
        Ok(())
    }

    /// Scan the PEBs in `start..end`, returning early with the fastmap anchor if fastmap is
    /// enabled and one is found.
    pub fn scan_range(&mut self, start: u32, end: u32) -> Option<u32> {
        let rpt = howudoin::new()
            .label("Scanning PEBs")
            .set_len(u64::from(end.saturating_sub(start)));

        let mut anchor = None;
        for pnum in start..end {
            rpt.inc();
            match self.scan_vid_hdr(pnum) {
                Ok(Scanned::Anchor) if self.fm_enabled => {
                    anchor = Some(pnum);
                    break;
                }
                Ok(_) => (),
                Err(err) => trace!(peb = pnum, %err, "PEB skipped"),
            }
        }

        rpt.close();
        anchor
    }

    /// Forget everything learned from a fastmap; the header cache stays valid.
    fn discard_fastmap(&mut self) {
        self.volumes.clear();
        self.fm_used.clear_all();
        self.vtbl = None;
        self.fm_enabled = false;
    }

    /// Build the volume table: from a fastmap if one is enabled and usable, else by reading every
    /// PEB's VID header.
    pub fn attach(&mut self) {
        let window = self.geo.peb_count.min(UBI_FM_MAX_START);

        let mut start = window;
        if let Some(anchor) = self.scan_range(0, window) {
            match self.scan_fastmap(anchor) {
                Ok(()) => {
                    info!(
                        peb_count = self.geo.peb_count,
                        anchor, "attached by fastmap"
                    );
                    return;
                }
                Err(err) => {
                    error!(anchor, %err, "attach by fastmap failed, doing a full scan");
                    self.discard_fastmap();
                    start = 0;
                }
            }
        }

        self.scan_range(start, self.geo.peb_count);
    }
}
