//! The volume table, read from the layout volume so that volumes can be requested by name.

use income::VtblRecord;
use tracing::{debug, warn};

use super::error::VtblError;
use super::headers::*;
use super::scan::ScanInfo;
use crate::nand::{Nand, ReadStatus};

/// The longest volume name UBI allows
const UBI_VOL_NAME_MAX: usize = 127;

/// The names in a verified volume table, indexed by volume ID
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Vtbl {
    names: Vec<Option<Box<[u8]>>>,
}

impl Vtbl {
    /// Verify the raw records in `bytes`; `leb_size` and `min_io_size` are what volume
    /// alignment is checked against.
    pub fn parse(bytes: &[u8], leb_size: u32, min_io_size: u32) -> Result<Self, VtblError> {
        let empty = empty_vtbl_record();

        let mut names = Vec::new();
        for (index, raw) in bytes.chunks_exact(UBI_VTBL_RECORD_SIZE).enumerate() {
            let bad = |reason| VtblError::BadRecord { index, reason };

            let (_, record) =
                VtblRecord::from_bytes((raw, 0)).map_err(|_| bad("unparseable"))?;
            let computed = record.compute_crc();
            if computed != record.crc {
                return Err(VtblError::BadCrc {
                    index,
                    stored: record.crc,
                    computed,
                });
            }

            if record.reserved_pebs == 0 {
                if raw != empty {
                    return Err(bad("unused record is not empty"));
                }
                names.push(None);
                continue;
            }

            names.push(Some(check_record(&record, leb_size, min_io_size).map_err(bad)?));
        }

        for (first, name) in names.iter().enumerate() {
            let Some(name) = name else { continue };
            if let Some(second) = names[first + 1..]
                .iter()
                .position(|other| other.as_ref() == Some(name))
            {
                return Err(VtblError::DuplicateName {
                    first,
                    second: first + 1 + second,
                });
            }
        }

        Ok(Self { names })
    }

    /// The ID of the volume called `name`
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| n.as_deref() == Some(name.as_bytes()))
            .map(|id| id as u32)
    }
}

/// Sanity-check a record in use, returning the volume's name
fn check_record(
    record: &VtblRecord,
    leb_size: u32,
    min_io_size: u32,
) -> Result<Box<[u8]>, &'static str> {
    let alignment = record.alignment;
    if [record.reserved_pebs, alignment, record.data_pad]
        .iter()
        .any(|&x| (x as i32) < 0)
    {
        return Err("negative size");
    }

    if alignment == 0 || alignment > leb_size {
        return Err("bad alignment");
    }
    if alignment != 1 && alignment.checked_rem(min_io_size).unwrap_or(0) != 0 {
        return Err("alignment not a multiple of the minimal I/O unit");
    }
    if record.data_pad != leb_size % alignment {
        return Err("bad data_pad");
    }

    if VolType::try_from(record.vol_type).is_err() {
        return Err("bad volume type");
    }
    if record.upd_marker > 1 {
        return Err("bad update marker");
    }

    let name_len = record.name_len as usize;
    if name_len > UBI_VOL_NAME_MAX {
        return Err("name too long");
    }
    if record.name[0] == 0 {
        return Err("empty name");
    }

    // Exactly `name_len` characters, then a terminator
    let name = &record.name[..name_len];
    if name.contains(&0) || record.name[name_len] != 0 {
        return Err("name length mismatch");
    }

    Ok(name.into())
}

impl<N: Nand> ScanInfo<'_, N> {
    /// Read the volume table from layout volume PEB `pnum`. A table that can't be read or
    /// doesn't check out is ignored; the other copy may be better.
    pub fn read_volume_table(&mut self, pnum: u32) {
        let count = (self.geo.max_vol_ids as usize).min(self.leb_size / UBI_VTBL_RECORD_SIZE);
        let mut buf = vec![0u8; count * UBI_VTBL_RECORD_SIZE];

        let result = match self.read(pnum, self.geo.leb_start as usize, &mut buf) {
            Ok(ReadStatus::Clean) => Vtbl::parse(&buf, self.leb_size as u32, self.geo.vid_offset),
            Ok(ReadStatus::Bitflips) => {
                debug!(peb = pnum, "bitflips in volume table");
                Vtbl::parse(&buf, self.leb_size as u32, self.geo.vid_offset)
            }
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(vtbl) => {
                debug!(peb = pnum, "volume table read");
                self.vtbl = Some(vtbl);
            }
            Err(err) => warn!(peb = pnum, %err, "unable to use volume table"),
        }
    }
}
