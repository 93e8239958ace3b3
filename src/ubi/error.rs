//! Errors of the UBI loader.
//!
//! Only [Error] is ever returned to callers of [load_volumes](super::load_volumes). Problems with
//! a single PEB ([PebError]) or with the fastmap ([FastmapError]) are absorbed inside the loader:
//! the former by marking the PEB corrupt and looking for another copy, the latter by falling back
//! to a full scan.

use thiserror::Error;

use crate::nand::ReadError;

/// The ways a call to [load_volumes](super::load_volumes) can fail
#[derive(Debug, Error)]
pub enum Error {
    /// The geometry handed in cannot describe a UBI device
    #[error("invalid geometry: {0}")]
    Geometry(&'static str),

    /// A numeric volume ID outside of the range this loader tracks
    #[error("volume ID {vol_id} out of range (max {max})")]
    InvalidVolume { vol_id: u32, max: u32 },

    /// No volume table record carries the requested name
    #[error("no volume named {0:?}")]
    VolumeNotFound(String),

    /// A LEB has no valid copy anywhere on the device
    #[error("volume {vol_id}: LEB {lnum} has no valid copy")]
    UnrecoverableVolume { vol_id: u32, lnum: u32 },

    /// The volume does not fit in the destination buffer
    #[error("volume {vol_id} does not fit: needs at least {needed} bytes, have {available}")]
    BufferTooSmall {
        vol_id: u32,
        needed: usize,
        available: usize,
    },

    /// The storage driver failed as a whole (rather than on one block)
    #[error("read of PEB {peb} failed: {source}")]
    Io {
        peb: u32,
        #[source]
        source: ReadError,
    },
}

/// Why a single PEB could not be used
#[derive(Debug, Error)]
pub enum PebError {
    #[error("PEB {0} out of range")]
    OutOfRange(u32),

    /// Fully erased VID header; the PEB is free, not corrupt
    #[error("no VID header (erased)")]
    Blank,

    #[error("bad VID header")]
    BadHdr,

    #[error("read failed: {0}")]
    Io(#[from] ReadError),

    /// The VID header is valid but describes some other LEB than expected
    #[error("VID header describes another LEB")]
    Mismatch,

    #[error("LEB {lnum} exceeds the maximum of {max}")]
    LebOutOfRange { lnum: u32, max: u32 },
}

/// Why a fastmap was rejected
#[derive(Debug, Error)]
pub enum FastmapError {
    #[error("bad {record} magic: {found:#x}, expected {expected:#x}")]
    BadMagic {
        record: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("bad fastmap version: {found}, expected {expected}")]
    BadVersion { found: u8, expected: u8 },

    #[error("number of fastmap blocks is invalid: {0}")]
    BadBlockCount(u32),

    #[error("bad fastmap size: {found}, expected {expected}")]
    BadSize { found: usize, expected: usize },

    #[error("bad {pool} size: {size}")]
    BadPoolSize { pool: &'static str, size: u16 },

    #[error("fastmap references PEB {0}, which is out of range")]
    PebOutOfRange(u32),

    #[error("unable to read fastmap block #{index} (PEB {peb}): {source}")]
    BlockUnreadable {
        index: usize,
        peb: u32,
        #[source]
        source: PebError,
    },

    #[error("fastmap block #{index} has vol_id {found:#x}, expected {expected:#x}")]
    BadVolId {
        index: usize,
        found: u32,
        expected: u32,
    },

    #[error("fastmap data CRC is invalid: stored {stored:#x}, computed {computed:#x}")]
    BadCrc { stored: u32, computed: u32 },

    #[error("fastmap record at offset {offset} runs past the end ({size} bytes)")]
    Overrun { offset: usize, size: usize },

    #[error("unparseable {0} record")]
    Malformed(&'static str),

    #[error("vol {vol_id} LEB {lnum} (PEB {peb}) unusable: {source}")]
    BadLeb {
        vol_id: u32,
        lnum: u32,
        peb: u32,
        #[source]
        source: PebError,
    },
}

/// Why a volume table was rejected
#[derive(Debug, Error)]
pub enum VtblError {
    #[error("read failed: {0}")]
    Read(#[from] ReadError),

    #[error("bad CRC at record {index}: {computed:#x}, not {stored:#x}")]
    BadCrc {
        index: usize,
        stored: u32,
        computed: u32,
    },

    #[error("record {index}: {reason}")]
    BadRecord { index: usize, reason: &'static str },

    #[error("records {first} and {second} have the same name")]
    DuplicateName { first: usize, second: usize },
}
