//! The per-volume LEB-to-PEB translation tables built up while scanning.

use super::bitmap::Bitmap;

/// What is known about one static volume
#[derive(Debug, Clone)]
pub struct VolInfo {
    /// PEB currently believed to hold each LEB; only meaningful where `found` is set
    lebs_to_pebs: Box<[u32]>,

    /// Which LEBs have an owner
    found: Bitmap,

    /// The highest LEB number ever assigned
    last_block: Option<u32>,
}

impl VolInfo {
    fn new(max_lebs: u32) -> Self {
        Self {
            lebs_to_pebs: vec![0; max_lebs as usize].into_boxed_slice(),
            found: Bitmap::new(max_lebs as usize),
            last_block: None,
        }
    }

    /// The PEB that currently owns `lnum`, if any
    pub fn owner(&self, lnum: u32) -> Option<u32> {
        self.found
            .test(lnum)
            .then(|| self.lebs_to_pebs[lnum as usize])
    }

    /// Make `pnum` the owner of `lnum`, raising the high-water mark as needed.
    ///
    /// Returns `false` if `lnum` is beyond what this table can hold.
    pub fn assign(&mut self, lnum: u32, pnum: u32) -> bool {
        let Some(slot) = self.lebs_to_pebs.get_mut(lnum as usize) else {
            return false;
        };
        *slot = pnum;
        self.found.set(lnum);
        self.last_block = self.last_block.max(Some(lnum));
        true
    }

    /// Forget the owner of `lnum`; the high-water mark stays.
    pub fn release(&mut self, lnum: u32) {
        self.found.clear(lnum);
    }

    /// The number of LEBs the volume is expected to have, judged by the highest LEB seen
    pub fn leb_count(&self) -> Option<u32> {
        self.last_block.map(|last| last + 1)
    }

    /// How many LEBs currently have an owner
    #[cfg(test)]
    pub fn found_count(&self) -> usize {
        self.found.count()
    }
}

/// The translation tables of every loadable volume ID
#[derive(Debug, Clone)]
pub struct VolumeTable {
    volumes: Box<[VolInfo]>,
    max_lebs: u32,
}

impl VolumeTable {
    /// An empty table for volume IDs `0..max_vol_ids`, each with up to `max_lebs` LEBs
    pub fn new(max_vol_ids: u32, max_lebs: u32) -> Self {
        let volumes = (0..max_vol_ids).map(|_| VolInfo::new(max_lebs)).collect();
        Self { volumes, max_lebs }
    }

    pub fn max_lebs(&self) -> u32 {
        self.max_lebs
    }

    pub fn get(&self, vol_id: u32) -> Option<&VolInfo> {
        self.volumes.get(vol_id as usize)
    }

    pub fn get_mut(&mut self, vol_id: u32) -> Option<&mut VolInfo> {
        self.volumes.get_mut(vol_id as usize)
    }

    /// Drop every mapping, as when a fastmap turns out to be untrustworthy
    pub fn clear(&mut self) {
        *self = Self::new(self.volumes.len() as u32, self.max_lebs);
    }
}
