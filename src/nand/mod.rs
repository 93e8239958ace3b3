//! Abstractions and code to read NAND flash

use std::io::{self, Read};
use std::str::FromStr;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// The number of bytes in one eraseblock
    pub fn block_size(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// How a successful read went
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ReadStatus {
    /// The data came back without any correction
    Clean,

    /// The data is good, but ECC had to correct bitflips to produce it
    Bitflips,
}

/// Why a read produced no usable data
#[derive(Debug, Error)]
pub enum ReadError {
    /// ECC could not correct the page(s); the data must not be trusted
    #[error("uncorrectable ECC error")]
    Ecc,

    /// The block is marked bad
    #[error("block is marked bad")]
    BadBlock,

    /// The requested range lies outside of the device
    #[error("block {block}, range {offset}+{len} out of bounds")]
    OutOfRange {
        block: u32,
        offset: usize,
        len: usize,
    },

    /// The device (or its driver) failed as a whole
    #[error("device error: {0}")]
    Device(#[from] io::Error),
}

/// Represents a (read-only) NAND flash device
///
/// This is the only thing the UBI loader needs from the storage driver: it must hand back exactly
/// the requested bytes, or an explicit error. Silently truncated or zero-filled data is not
/// acceptable.
pub trait Nand {
    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Read `content.len()` bytes from `block`, starting at byte `offset` within the block
    fn read(&mut self, block: u32, offset: usize, content: &mut [u8])
        -> Result<ReadStatus, ReadError>;
}

impl<N: Nand + ?Sized> Nand for &mut N {
    fn get_layout(&self) -> NandLayout {
        (**self).get_layout()
    }

    fn read(
        &mut self,
        block: u32,
        offset: usize,
        content: &mut [u8],
    ) -> Result<ReadStatus, ReadError> {
        (**self).read(block, offset, content)
    }
}

/// Fault to report when a given block of a [SimNand] is read
#[derive(Debug, Eq, PartialEq, Copy, Clone, Default)]
pub enum SimFault {
    /// Reads behave normally
    #[default]
    None,

    /// Reads succeed, but report corrected bitflips
    Bitflips,

    /// Reads fail with an uncorrectable ECC error
    Ecc,
}

/// A simulated in-memory NAND flash, for testing purposes and for working with image files
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    reads: u64,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes of the block; erased bytes are 0xFF
    data: Vec<u8>,

    /// Is this block marked bad?
    marked_bad: bool,

    /// What happens when the block is read
    fault: SimFault,
}

impl SimNand {
    /// Create an empty (fully erased) SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let block = SimBlock {
            data: vec![0xFF; layout.block_size()],
            marked_bad: false,
            fault: SimFault::None,
        };
        let blocks = vec![block; layout.blocks as usize].into_boxed_slice();

        Self {
            blocks,
            layout,
            reads: 0,
        }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        for block in self.blocks.iter_mut() {
            block.marked_bad = false;
            read.read_exact(&mut block.data)?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    ///
    /// Bad blocks are written as a recognizable 0xBD fill pattern.
    #[cfg(test)]
    pub fn save<W: std::io::Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let bad = vec![0xBD; self.layout.block_size()];
        for block in self.blocks.iter() {
            match block.marked_bad {
                true => write.write_all(&bad)?,
                false => write.write_all(&block.data)?,
            }
        }

        Ok(())
    }

    fn block_mut(&mut self, index: u32) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
    }

    /// Overwrite bytes of a block, starting at `offset`
    ///
    /// Unlike real NAND, this may flip bits in either direction; tests use this to plant
    /// corruption.
    pub fn program(&mut self, index: u32, offset: usize, content: &[u8]) -> anyhow::Result<()> {
        let block = self.block_mut(index)?;
        let target = block
            .data
            .get_mut(offset..offset + content.len())
            .ok_or(anyhow::anyhow!("write beyond end of block {index}"))?;
        target.copy_from_slice(content);
        Ok(())
    }

    /// Return a block to the all-0xFF state
    pub fn erase(&mut self, index: u32) -> anyhow::Result<()> {
        self.block_mut(index)?.data.fill(0xFF);
        Ok(())
    }

    /// Mark a block bad; it can no longer be read
    pub fn mark_bad(&mut self, index: u32) -> anyhow::Result<()> {
        self.block_mut(index)?.marked_bad = true;
        Ok(())
    }

    /// Make future reads of the block misbehave
    pub fn set_fault(&mut self, index: u32, fault: SimFault) -> anyhow::Result<()> {
        self.block_mut(index)?.fault = fault;
        Ok(())
    }

    /// How many `read` calls have been served so far
    pub fn read_count(&self) -> u64 {
        self.reads
    }
}

impl Nand for SimNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read(
        &mut self,
        index: u32,
        offset: usize,
        content: &mut [u8],
    ) -> Result<ReadStatus, ReadError> {
        self.reads += 1;

        let len = content.len();
        let out_of_range = || ReadError::OutOfRange {
            block: index,
            offset,
            len,
        };
        let block = self.blocks.get(index as usize).ok_or_else(out_of_range)?;
        if block.marked_bad {
            return Err(ReadError::BadBlock);
        }

        let data = offset
            .checked_add(len)
            .and_then(|end| block.data.get(offset..end))
            .ok_or_else(out_of_range)?;

        match block.fault {
            SimFault::Ecc => Err(ReadError::Ecc),
            SimFault::Bitflips => {
                content.copy_from_slice(data);
                Ok(ReadStatus::Bitflips)
            }
            SimFault::None => {
                content.copy_from_slice(data);
                Ok(ReadStatus::Clean)
            }
        }
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: NandLayout = "64x16x256".parse()?;
    assert_eq!(
        layout,
        NandLayout {
            blocks: 64,
            pages_per_block: 16,
            bytes_per_page: 256,
        }
    );
    assert_eq!(layout.block_size(), 4096);
    assert!("64x16".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_sim_bounds() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut buf = [0u8; 16];
    assert!(nand.read(0, 0, &mut buf).is_ok());
    assert!(nand.read(TEST_LAYOUT.blocks - 1, 0, &mut buf).is_ok());
    assert!(matches!(
        nand.read(TEST_LAYOUT.blocks, 0, &mut buf),
        Err(ReadError::OutOfRange { .. })
    ));
    assert!(matches!(
        nand.read(0, TEST_LAYOUT.block_size() - 8, &mut buf),
        Err(ReadError::OutOfRange { .. })
    ));
}

#[test]
fn test_sim_mark_bad() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut buf = [0u8; 16];
    nand.mark_bad(0)?;
    assert!(matches!(nand.read(0, 0, &mut buf), Err(ReadError::BadBlock)));
    assert!(nand.read(1, 0, &mut buf).is_ok());
    Ok(())
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = [0xA5u8; 32];
    let mut data_out = [0u8; 32];

    nand.program(2, 64, &data_in)?;

    nand.read(2, 32, &mut data_out)?;
    assert_eq!(data_out, [0xFF; 32]);

    assert_eq!(nand.read(2, 64, &mut data_out)?, ReadStatus::Clean);
    assert_eq!(data_out, data_in);

    nand.set_fault(2, SimFault::Bitflips)?;
    assert_eq!(nand.read(2, 64, &mut data_out)?, ReadStatus::Bitflips);
    assert_eq!(data_out, data_in);

    nand.set_fault(2, SimFault::Ecc)?;
    assert!(matches!(
        nand.read(2, 64, &mut data_out),
        Err(ReadError::Ecc)
    ));

    assert_eq!(nand.read_count(), 4);
    Ok(())
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut io::repeat(0x55u8))?;

    let mut buf = vec![0u8; TEST_LAYOUT.block_size()];
    nand.read(0, 0, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0x55u8));

    nand.mark_bad(1)?;
    let mut image = Vec::new();
    nand.save(&mut image)?;
    assert_eq!(image.len(), TEST_LAYOUT.block_size() * TEST_LAYOUT.blocks as usize);
    assert!(image[TEST_LAYOUT.block_size()..][..16].iter().all(|&x| x == 0xBD));
    Ok(())
}
