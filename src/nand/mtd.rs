//! NAND abstraction layer implementation over the Linux MTD subsystem (read-only)

use super::{Nand, NandLayout, ReadError, ReadStatus};

use anyhow::bail;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open the `mtd` partition called `name`, as listed in `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        let quoted = format!("\"{name}\"");

        for line in BufReader::new(File::open("/proc/mtd")?).lines() {
            let line = line?;
            // e.g. `mtd2: 00400000 00020000 "u-boot"`
            let Some((dev, rest)) = line.split_once(':') else {
                continue;
            };
            if rest.trim_end().ends_with(&quoted) {
                return Self::open(Path::new("/dev").join(dev));
            }
        }

        bail!("no MTD partition named {name}");
    }

    /// Snapshot the driver's running ECC statistics
    fn ecc_stats(&self) -> io::Result<ioctl::mtd_ecc_stats> {
        let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
        unsafe {
            ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr())?;
            Ok(stats.assume_init())
        }
    }
}

impl Nand for MtdNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read(
        &mut self,
        block: u32,
        offset: usize,
        content: &mut [u8],
    ) -> Result<ReadStatus, ReadError> {
        let block_size = self.layout.block_size();
        if block >= self.layout.blocks || offset + content.len() > block_size {
            return Err(ReadError::OutOfRange {
                block,
                offset,
                len: content.len(),
            });
        }

        let block_base = block_size as u64 * u64::from(block);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base) }
            .map_err(io::Error::from)?;
        if bad != 0 {
            return Err(ReadError::BadBlock);
        }

        // mtdchar hands back data even on ECC failure, so the only way to learn what happened
        // is to compare the ECC counters around the read.
        let before = self.ecc_stats()?;
        self.file
            .read_exact_at(content, block_base + offset as u64)?;
        let after = self.ecc_stats()?;

        if after.failed != before.failed {
            Err(ReadError::Ecc)
        } else if after.corrected != before.corrected {
            Ok(ReadStatus::Bitflips)
        } else {
            Ok(ReadStatus::Clean)
        }
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<NandLayout> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
            })
        }
    }

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
}
