//! This module copies the LEBs of an attached static volume into memory, verifying each against
//! the CRC in its VID header and falling back to other copies of the LEB when one fails.

use tracing::{debug, warn};

use super::error::Error;
use super::headers::UBI_CRC;
use super::scan::ScanInfo;
use super::LoadedVolume;
use crate::nand::{Nand, ReadError, ReadStatus};

impl<N: Nand> ScanInfo<'_, N> {
    fn owner(&self, vol_id: u32, lnum: u32) -> Option<u32> {
        self.volumes.get(vol_id).and_then(|vol| vol.owner(lnum))
    }

    /// Load every LEB of `vol_id`, back to back, into the start of `dest`
    pub fn load_volume(&mut self, vol_id: u32, dest: &mut [u8]) -> Result<LoadedVolume, Error> {
        let vol = self.volumes.get(vol_id).ok_or(Error::InvalidVolume {
            vol_id,
            max: self.geo.max_vol_ids,
        })?;

        let Some(leb_count) = vol.leb_count() else {
            warn!(vol_id, "volume not found");
            return Err(Error::UnrecoverableVolume { vol_id, lnum: 0 });
        };

        let mut len = 0;
        for lnum in 0..leb_count {
            len += self.load_block(vol_id, lnum, leb_count, dest, len)?;
        }

        debug!(vol_id, len, leb_count, "volume loaded");
        Ok(LoadedVolume {
            vol_id,
            len,
            leb_count,
        })
    }

    /// Load one LEB to `dest[offset..]`, returning its length. Every PEB that fails is marked
    /// corrupt before the next-best copy is tried, so this gives up after at most `peb_count`
    /// attempts.
    fn load_block(
        &mut self,
        vol_id: u32,
        lnum: u32,
        leb_count: u32,
        dest: &mut [u8],
        offset: usize,
    ) -> Result<usize, Error> {
        if self.owner(vol_id, lnum).is_none() {
            warn!(vol_id, lnum, leb_count, "LEB is missing");
            self.find_replacement(vol_id, lnum);
        }

        for _ in 0..=self.geo.peb_count {
            let Some(pnum) = self.owner(vol_id, lnum) else {
                break;
            };

            debug!(vol_id, lnum, peb = pnum, "loading LEB");
            if let Some(len) = self.try_load_peb(vol_id, lnum, leb_count, pnum, dest, offset)? {
                return Ok(len);
            }

            if let Some(vol) = self.volumes.get_mut(vol_id) {
                vol.release(lnum);
            }
            self.find_replacement(vol_id, lnum);
        }

        warn!(vol_id, lnum, "no valid copy of LEB");
        Err(Error::UnrecoverableVolume { vol_id, lnum })
    }

    /// Verify `pnum` as `vol_id:lnum` and load its data, or return `None` if it's no good
    fn try_load_peb(
        &mut self,
        vol_id: u32,
        lnum: u32,
        leb_count: u32,
        pnum: u32,
        dest: &mut [u8],
        offset: usize,
    ) -> Result<Option<usize>, Error> {
        // The fastmap may have pointed at a PEB that was since reused
        let vid = match self.rescan_fm_vid_hdr(pnum, vol_id, lnum) {
            Ok(vid) => vid,
            Err(err) => {
                debug!(vol_id, lnum, peb = pnum, %err, "mapped PEB unusable");
                return Ok(None);
            }
        };

        if vid.used_ebs != leb_count {
            debug!(
                vol_id,
                lnum,
                peb = pnum,
                used_ebs = vid.used_ebs,
                leb_count,
                "block count mismatch"
            );
            self.corrupt.set(pnum);
            return Ok(None);
        }

        let data_size = vid.data_size as usize;
        if data_size > self.leb_size {
            warn!(vol_id, lnum, peb = pnum, data_size, "data size exceeds LEB size");
            self.corrupt.set(pnum);
            return Ok(None);
        }

        let available = dest.len();
        let buf = offset
            .checked_add(data_size)
            .and_then(|end| dest.get_mut(offset..end))
            .ok_or(Error::BufferTooSmall {
                vol_id,
                needed: offset.saturating_add(data_size),
                available,
            })?;

        match self.read(pnum, self.geo.leb_start as usize, buf) {
            Ok(ReadStatus::Clean) => (),
            Ok(ReadStatus::Bitflips) => debug!(vol_id, lnum, peb = pnum, "bitflips in LEB data"),
            Err(ReadError::Device(err)) => {
                return Err(Error::Io {
                    peb: pnum,
                    source: ReadError::Device(err),
                })
            }
            Err(err) => {
                warn!(vol_id, lnum, peb = pnum, %err, "LEB data unreadable");
                self.corrupt.set(pnum);
                return Ok(None);
            }
        }

        if UBI_CRC.checksum(buf) != vid.data_crc {
            warn!(vol_id, lnum, peb = pnum, "data CRC failure");
            self.corrupt.set(pnum);
            return Ok(None);
        }

        Ok(Some(data_size))
    }

    /// Search the whole device for the newest copy of `vol_id:lnum` not known to be corrupt,
    /// reading any VID headers not yet read. Returns whether one was found.
    fn find_replacement(&mut self, vol_id: u32, lnum: u32) -> bool {
        debug!(vol_id, lnum, "looking for a replacement");
        #[cfg(test)]
        {
            self.replacement_searches += 1;
        }

        let mut best: Option<(u32, u64)> = None;
        for pnum in 0..self.geo.peb_count {
            if self.corrupt.test(pnum) {
                continue;
            }
            if !self.is_scanned(pnum) {
                debug!(vol_id, lnum, peb = pnum, "PEB not yet scanned");
            }

            let Ok(vid) = self.read_vid_hdr(pnum) else {
                continue;
            };
            if !vid.is_static_leb(vol_id, lnum) {
                continue;
            }
            if best.map_or(true, |(_, sqnum)| sqnum < vid.sqnum) {
                best = Some((pnum, vid.sqnum));
            }
        }

        let Some((pnum, sqnum)) = best else {
            return false;
        };

        debug!(vol_id, lnum, peb = pnum, sqnum, "trying replacement");
        self.volumes
            .get_mut(vol_id)
            .map_or(false, |vol| vol.assign(lnum, pnum))
    }
}
