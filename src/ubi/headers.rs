//! VID headers and volume table records: the on-flash structures from `income`, plus the CRC
//! handling and field checks the loader needs on top of them.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{VidHdr, VtblRecord, UBI_VID_HDR_MAGIC};

/// UBI's CRC-32: seeded with all-ones, no final inversion
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;

/// Volume IDs from here up belong to UBI itself
const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_FFFF - 4096;

/// Holds the volume table
pub const UBI_LAYOUT_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START;

/// The fastmap anchor, whose payload starts with the fastmap superblock
pub const UBI_FM_SB_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 1;

/// Fastmap blocks after the anchor
pub const UBI_FM_DATA_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 2;

/// A record protected by a trailing big-endian CRC-32 of everything before it
pub trait RecordCrc: DekuContainerWrite {
    fn stored_crc(&self) -> u32;
    fn store_crc(&mut self, crc: u32);

    fn compute_crc(&self) -> u32 {
        match self.to_bytes() {
            Ok(bytes) => UBI_CRC.checksum(&bytes[..bytes.len() - std::mem::size_of::<u32>()]),
            // Can't match anything that came off the flash
            Err(_) => !self.stored_crc(),
        }
    }

    fn check_crc(&self) -> bool {
        self.stored_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.store_crc(self.compute_crc())
    }
}

impl RecordCrc for VidHdr {
    fn stored_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn store_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

impl RecordCrc for VtblRecord {
    fn stored_crc(&self) -> u32 {
        self.crc
    }
    fn store_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// The first four bytes of a header, interpreted as a big-endian magic number
pub fn peek_magic(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))
}

#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    #[default]
    Dynamic,

    /// Written once as a whole, with a size and data CRC in every LEB. Only these can be loaded.
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// A verified VID header, trimmed to what loading cares about
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    pub vol_type: VolType,
    pub vol_id: u32,
    pub lnum: u32,

    /// Bytes of payload covered by `data_crc` (static volumes only)
    pub data_size: u32,

    /// LEBs in the whole volume (static volumes only)
    pub used_ebs: u32,

    pub data_crc: u32,

    /// Global write counter; the higher of two copies of a LEB is the newer
    pub sqnum: u64,
}

impl Vid {
    /// Parse the header at the start of `bytes`, checking magic, version and CRC
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, hdr) = VidHdr::from_bytes((bytes, 0)).ok()?;
        if hdr.magic[..] != UBI_VID_HDR_MAGIC[..] || hdr.version != UBI_VERSION || !hdr.check_crc()
        {
            return None;
        }

        Some(Self {
            vol_type: hdr.vol_type.try_into().ok()?,
            vol_id: hdr.vol_id,
            lnum: hdr.lnum,
            data_size: hdr.data_size,
            used_ebs: hdr.used_ebs,
            data_crc: hdr.data_crc,
            sqnum: hdr.sqnum,
        })
    }

    /// Serialize, with a correct CRC, into the start of `out`. Internal volumes are written
    /// with the "reject" compatibility flag, as UBI does for its layout volume.
    #[cfg(test)]
    pub fn encode(self, out: &mut [u8]) -> anyhow::Result<()> {
        let mut hdr = VidHdr {
            magic: UBI_VID_HDR_MAGIC.try_into()?,
            version: UBI_VERSION,
            vol_type: self.vol_type.into(),
            copy_flag: 0,
            compat: match self.vol_id >= UBI_INTERNAL_VOL_START {
                true => 5,
                false => 0,
            },
            vol_id: self.vol_id,
            lnum: self.lnum,
            data_size: self.data_size,
            used_ebs: self.used_ebs,
            data_pad: 0,
            data_crc: self.data_crc,
            sqnum: self.sqnum,
            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };
        hdr.fix_crc();

        let bytes = hdr.to_bytes()?;
        let out_len = out.len();
        out.get_mut(..bytes.len())
            .ok_or_else(|| anyhow::anyhow!("{out_len} bytes is too small for a VID header"))?
            .copy_from_slice(&bytes);
        Ok(())
    }

    /// Does this header describe `vol_id:lnum` of a static volume?
    pub fn is_static_leb(&self, vol_id: u32, lnum: u32) -> bool {
        self.vol_type == VolType::Static && self.vol_id == vol_id && self.lnum == lnum
    }
}

/// The bytes of an unused volume table slot: all zeroes, apart from the CRC of those zeroes
pub fn empty_vtbl_record() -> [u8; UBI_VTBL_RECORD_SIZE] {
    let mut record = [0u8; UBI_VTBL_RECORD_SIZE];
    let crc_at = UBI_VTBL_RECORD_SIZE - std::mem::size_of::<u32>();
    let crc = UBI_CRC.checksum(&record[..crc_at]);
    record[crc_at..].copy_from_slice(&crc.to_be_bytes());
    record
}

/// Build the bytes of a volume table record, for writing test images
#[cfg(test)]
pub fn encode_vtbl_record(
    name: &str,
    reserved_pebs: u32,
    alignment: u32,
    data_pad: u32,
    vol_type: VolType,
) -> Vec<u8> {
    let mut name_buf = [0u8; 128];
    name_buf[..name.len()].copy_from_slice(name.as_bytes());

    let mut record = VtblRecord {
        reserved_pebs,
        alignment,
        data_pad,
        vol_type: vol_type.into(),
        upd_marker: 0,
        name: name_buf,
        name_len: name.len() as _,
        flags: 0,
        crc: 0,
        padding: Default::default(),
    };
    record.fix_crc();
    record.to_bytes().unwrap()
}

#[test]
fn test_vid_hdr() -> anyhow::Result<()> {
    let vid = Vid {
        vol_type: VolType::Static,
        vol_id: 3,
        lnum: 7,
        data_size: 100,
        used_ebs: 9,
        data_crc: 0x1234_5678,
        sqnum: 42,
        ..Default::default()
    };

    let mut buf = vec![0u8; 1024];
    vid.encode(&mut buf)?;
    assert_eq!(peek_magic(&buf), Some(0x5542_4921));
    assert_eq!(Vid::decode(&buf), Some(vid));
    assert!(vid.is_static_leb(3, 7));
    assert!(!vid.is_static_leb(3, 8));

    // Any damage to the protected prefix must be caught by the header CRC
    buf[12] ^= 0x01;
    assert_eq!(Vid::decode(&buf), None);

    assert!(vid.encode(&mut [0u8; 63]).is_err());
    assert_eq!(Vid::decode(&[0xFF; UBI_VID_HDR_SIZE]), None);
    Ok(())
}

#[test]
fn test_vtbl_record() -> anyhow::Result<()> {
    let empty = empty_vtbl_record();
    assert_eq!(&empty[UBI_VTBL_RECORD_SIZE - 4..], &0xF116_C36Bu32.to_be_bytes());
    let (_, record) = VtblRecord::from_bytes((&empty[..], 0))?;
    assert!(record.check_crc());

    let mut bytes = encode_vtbl_record("kernel", 4, 1, 0, VolType::Static);
    assert_eq!(bytes.len(), UBI_VTBL_RECORD_SIZE);
    let (_, record) = VtblRecord::from_bytes((&bytes[..], 0))?;
    assert!(record.check_crc());
    assert_eq!(record.reserved_pebs, 4);
    assert_eq!(&record.name[..6], b"kernel");

    bytes[20] ^= 0x80;
    let (_, record) = VtblRecord::from_bytes((&bytes[..], 0))?;
    assert!(!record.check_crc());
    Ok(())
}
