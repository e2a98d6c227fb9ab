//! SPI-NOR flash access over the Linux MTD subsystem

use super::{FlashDevice, FlashError};

use anyhow::bail;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NOR flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdFlash {
    file: File,
    name: String,
    size: u32,
    sector_size: u32,
}

impl MtdFlash {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let name = path.as_ref().display().to_string();
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };

        anyhow::ensure!(
            info.erasesize > 0 && info.size % info.erasesize == 0,
            "MTD size not multiple of erasesize"
        );

        Ok(Self {
            file,
            name,
            size: info.size,
            sector_size: info.erasesize,
        })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        bail!("MTD device {name} could not be found");
    }

    fn check_range(&self, offset: u32, length: usize) -> Result<(), FlashError> {
        let end = (offset as usize)
            .checked_add(length)
            .ok_or(FlashError::OutOfRange)?;
        if end > self.size as usize {
            return Err(FlashError::OutOfRange);
        }
        Ok(())
    }
}

impl FlashDevice for MtdFlash {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(offset, buf.len())?;
        self.file.read_exact_at(buf, offset as u64)?;
        Ok(())
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), FlashError> {
        if offset % self.sector_size != 0 || length % self.sector_size != 0 {
            return Err(FlashError::Unaligned);
        }
        self.check_range(offset, length as usize)?;

        let erase_info = ioctl::erase_info_user {
            start: offset,
            length,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), FlashError> {
        self.check_range(offset, buf.len())?;
        self.file.write_all_at(buf, offset as u64)?;
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

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

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);
}
