//! Builds UBI images in a [SimNand] for tests: static volumes, volume tables and fastmaps.

use anyhow::ensure;
use deku::DekuContainerWrite;

use super::fastmap::*;
use super::headers::*;
use super::Geometry;
use crate::nand::{Nand, NandLayout, SimNand};

/// 64 PEBs of 4 KiB, so each LEB holds 3 KiB (VID header in page 1, data from page 2)
pub const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 64,
    pages_per_block: 8,
    bytes_per_page: 512,
};

/// How a fastmap describes one volume
#[derive(Debug, Clone)]
pub struct FmVolume {
    pub vol_id: u32,
    pub vol_type: u8,
    pub used_ebs: u32,

    /// The EBA table: the PEB of each LEB
    pub pebs: Vec<u32>,
}

impl FmVolume {
    pub fn new(vol_id: u32, used_ebs: u32, pebs: &[u32]) -> Self {
        Self {
            vol_id,
            vol_type: UBI_STATIC_VOLUME,
            used_ebs,
            pebs: pebs.to_vec(),
        }
    }
}

pub struct ImageBuilder {
    nand: SimNand,
    geo: Geometry,
    sqnum: u64,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            nand: SimNand::new(TEST_LAYOUT),
            geo: Geometry::for_layout(TEST_LAYOUT),
            sqnum: 0,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    pub fn leb_size(&self) -> usize {
        self.geo.leb_size() as usize
    }

    pub fn nand(&self) -> &SimNand {
        &self.nand
    }

    pub fn nand_mut(&mut self) -> &mut SimNand {
        &mut self.nand
    }

    pub fn into_nand(self) -> SimNand {
        self.nand
    }

    /// Some recognizable data, different for each `seed`
    pub fn pattern(&self, len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
            .collect()
    }

    fn next_sqnum(&mut self) -> u64 {
        self.sqnum += 1;
        self.sqnum
    }

    /// Erase `pnum`, then write a VID header and LEB data to it
    fn write_peb(&mut self, pnum: u32, vid: Vid, data: &[u8]) -> anyhow::Result<()> {
        ensure!(data.len() <= self.leb_size(), "{} bytes won't fit in a LEB", data.len());

        let mut hdr = [0u8; UBI_VID_HDR_SIZE];
        vid.encode(&mut hdr)?;

        self.nand.erase(pnum)?;
        self.nand.program(pnum, self.geo.vid_offset as usize, &hdr)?;
        self.nand.program(pnum, self.geo.leb_start as usize, data)
    }

    /// Write one LEB of a static volume with the given sequence number
    pub fn write_leb_sqnum(
        &mut self,
        pnum: u32,
        vol_id: u32,
        lnum: u32,
        used_ebs: u32,
        data: &[u8],
        sqnum: u64,
    ) -> anyhow::Result<()> {
        let vid = Vid {
            vol_type: VolType::Static,
            vol_id,
            lnum,
            data_size: data.len() as u32,
            used_ebs,
            data_crc: UBI_CRC.checksum(data),
            sqnum,
            ..Default::default()
        };
        self.write_peb(pnum, vid, data)
    }

    /// Write one LEB of a static volume, newer than anything written so far
    pub fn write_leb(
        &mut self,
        pnum: u32,
        vol_id: u32,
        lnum: u32,
        used_ebs: u32,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let sqnum = self.next_sqnum();
        self.write_leb_sqnum(pnum, vol_id, lnum, used_ebs, data, sqnum)
    }

    /// Write a whole static volume, one PEB of `pebs` per LEB
    pub fn write_volume(&mut self, vol_id: u32, pebs: &[u32], data: &[u8]) -> anyhow::Result<()> {
        let lebs: Vec<&[u8]> = data.chunks(self.leb_size()).collect();
        ensure!(lebs.len() == pebs.len(), "{} LEBs in {} PEBs", lebs.len(), pebs.len());

        for (lnum, (&pnum, leb)) in pebs.iter().zip(lebs).enumerate() {
            self.write_leb(pnum, vol_id, lnum as u32, pebs.len() as u32, leb)?;
        }
        Ok(())
    }

    /// Write a LEB of a dynamic volume
    pub fn write_dynamic_leb(&mut self, pnum: u32, vol_id: u32, lnum: u32) -> anyhow::Result<()> {
        let vid = Vid {
            vol_type: VolType::Dynamic,
            vol_id,
            lnum,
            sqnum: self.next_sqnum(),
            ..Default::default()
        };
        let data = self.pattern(64, 0xD0);
        self.write_peb(pnum, vid, &data)
    }

    /// Write the layout volume (one copy of the volume table per PEB in `pebs`), given
    /// `(vol_id, name, reserved_pebs)` of each static volume.
    pub fn write_vtbl(&mut self, pebs: &[u32], volumes: &[(u32, &str, u32)]) -> anyhow::Result<()> {
        let count = self.leb_size() / UBI_VTBL_RECORD_SIZE;
        let mut table = empty_vtbl_record().repeat(count);
        for &(vol_id, name, reserved_pebs) in volumes {
            ensure!((vol_id as usize) < count, "volume {vol_id} not in the table");
            let record = encode_vtbl_record(name, reserved_pebs, 1, 0, VolType::Static);
            table[vol_id as usize * UBI_VTBL_RECORD_SIZE..][..UBI_VTBL_RECORD_SIZE]
                .copy_from_slice(&record);
        }

        for (lnum, &pnum) in pebs.iter().enumerate() {
            let vid = Vid {
                vol_type: VolType::Dynamic,
                vol_id: UBI_LAYOUT_VOLUME_ID,
                lnum: lnum as u32,
                sqnum: self.next_sqnum(),
                ..Default::default()
            };
            self.write_peb(pnum, vid, &table)?;
        }
        Ok(())
    }

    /// The payload of a fastmap stored in `blocks`, with a zero CRC
    pub fn fastmap_payload(
        &self,
        blocks: &[u32],
        volumes: &[FmVolume],
        used: &[u32],
        pool: &[u32],
    ) -> anyhow::Result<Vec<u8>> {
        let mut block_loc = [0u32; UBI_FM_MAX_BLOCKS];
        block_loc[..blocks.len()].copy_from_slice(blocks);
        let mut pool_pebs = [0u32; UBI_FM_MAX_POOL_SIZE];
        pool_pebs[..pool.len()].copy_from_slice(pool);

        let mut payload = FmSb {
            magic: UBI_FM_SB_MAGIC,
            version: UBI_FM_FMT_VERSION,
            padding1: [0; 3],
            data_crc: 0,
            used_blocks: blocks.len() as u32,
            block_loc,
            block_ec: [1; UBI_FM_MAX_BLOCKS],
            sqnum: 0,
            padding2: [0; 32],
        }
        .to_bytes()?;

        let hdr = FmHdr {
            magic: UBI_FM_HDR_MAGIC,
            free_peb_count: 0,
            used_peb_count: used.len() as u32,
            scrub_peb_count: 0,
            bad_peb_count: 0,
            erase_peb_count: 0,
            vol_count: volumes.len() as u32,
            padding: [0; 4],
        };
        payload.extend(hdr.to_bytes()?);

        for (pebs, size) in [(pool_pebs, pool.len()), ([0; UBI_FM_MAX_POOL_SIZE], 0)] {
            let record = FmScanPool {
                magic: UBI_FM_POOL_MAGIC,
                size: size as u16,
                max_size: 16.max(size) as u16,
                pebs,
                padding: [0; 4],
            };
            payload.extend(record.to_bytes()?);
        }

        for &pnum in used {
            payload.extend(FmEc { pnum, ec: 1 }.to_bytes()?);
        }

        for vol in volumes {
            let volhdr = FmVolHdr {
                magic: UBI_FM_VHDR_MAGIC,
                vol_id: vol.vol_id,
                vol_type: vol.vol_type,
                padding1: [0; 3],
                data_pad: 0,
                used_ebs: vol.used_ebs,
                last_eb_bytes: self.leb_size() as u32,
                padding2: [0; 8],
            };
            payload.extend(volhdr.to_bytes()?);

            let eba = FmEba {
                magic: UBI_FM_EBA_MAGIC,
                reserved_pebs: vol.pebs.len() as u32,
            };
            payload.extend(eba.to_bytes()?);
            for pnum in &vol.pebs {
                payload.extend(pnum.to_be_bytes());
            }
        }

        let fm_size = calc_fm_size(self.geo.peb_count, self.leb_size());
        ensure!(payload.len() < fm_size, "fastmap too large");
        payload.resize(fm_size, 0);
        Ok(payload)
    }

    /// Fix up the CRC of `payload` and write it to `blocks`, the first being the anchor
    pub fn write_fastmap_payload(&mut self, blocks: &[u32], mut payload: Vec<u8>) -> anyhow::Result<()> {
        let leb_size = self.leb_size();
        ensure!(blocks.len() * leb_size == payload.len(), "wrong number of fastmap blocks");

        let crc_at = FM_SB_CRC_OFFSET..FM_SB_CRC_OFFSET + 4;
        payload[crc_at.clone()].fill(0);
        let crc = UBI_CRC.checksum(&payload);
        payload[crc_at].copy_from_slice(&crc.to_be_bytes());

        for (lnum, (&pnum, data)) in blocks.iter().zip(payload.chunks(leb_size)).enumerate() {
            let vid = Vid {
                vol_type: VolType::Dynamic,
                vol_id: match lnum {
                    0 => UBI_FM_SB_VOLUME_ID,
                    _ => UBI_FM_DATA_VOLUME_ID,
                },
                lnum: lnum as u32,
                sqnum: self.next_sqnum(),
                ..Default::default()
            };
            self.write_peb(pnum, vid, data)?;
        }
        Ok(())
    }

    /// Write a fastmap to `anchor` and `data_blocks`, listing `volumes`, the `used` PEBs and a
    /// `pool` of PEBs to scan
    pub fn write_fastmap(
        &mut self,
        anchor: u32,
        data_blocks: &[u32],
        volumes: &[FmVolume],
        used: &[u32],
        pool: &[u32],
    ) -> anyhow::Result<()> {
        let blocks: Vec<u32> = std::iter::once(anchor).chain(data_blocks.iter().copied()).collect();
        let payload = self.fastmap_payload(&blocks, volumes, used, pool)?;
        self.write_fastmap_payload(&blocks, payload)
    }

    /// Flip the low bit of byte `offset` of the LEB data in `pnum`
    pub fn flip_payload_byte(&mut self, pnum: u32, offset: usize) -> anyhow::Result<()> {
        let offset = self.geo.leb_start as usize + offset;
        let mut byte = [0u8];
        self.nand.read(pnum, offset, &mut byte)?;
        byte[0] ^= 0x01;
        self.nand.program(pnum, offset, &byte)
    }
}

#[test]
fn test_builder() -> anyhow::Result<()> {
    let mut img = ImageBuilder::new();
    assert_eq!(img.leb_size(), 3072);

    let data = img.pattern(img.leb_size() + 5, 0);
    img.write_volume(3, &[10, 11], &data)?;
    assert!(img.write_volume(3, &[12], &data).is_err());

    let mut hdr = [0u8; UBI_VID_HDR_SIZE];
    img.nand_mut().read(11, 512, &mut hdr)?;
    let vid = Vid::decode(&hdr).unwrap();
    assert!(vid.is_static_leb(3, 1));
    assert_eq!((vid.data_size, vid.used_ebs, vid.sqnum), (5, 2, 2));

    let mut payload = vec![0u8; 5];
    img.nand_mut().read(11, 1024, &mut payload)?;
    assert_eq!(vid.data_crc, UBI_CRC.checksum(&payload));
    Ok(())
}
