//! Firmware install tool for SPI-NOR flash.
//!
//! Runs the same diff/erase/write/verify pipeline the on-device installer
//! uses, against either a real MTD device or a simulated flash image, plus
//! small helpers to inspect firmware image headers and SPL boot signatures.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use retry::{delay::Fixed, retry};

use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use opi_installer::flash::mtd::MtdFlash;
use opi_installer::{
    board::{decode_boot_device, BootDevice, SPL_SIGNATURE_LEN},
    flash::{FlashDevice, FlashError, SimFlash, SimLayout},
    install::{
        ConsoleStatus, Installer, JobOutcome, FILE_UBOOT_SPI, FILE_UIMAGE, OFFSET_UBOOT_SPI,
        OFFSET_UIMAGE,
    },
    uimage::{UImage, HEADER_SIZE},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct FlashOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the flash image to simulate against
    #[clap(long, group = "flash-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Geometry of the simulated flash, as SECTORSxBYTES
    #[clap(long)]
    sim_layout: Option<SimLayout>,

    /// Write the simulated flash back to the file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

enum FlashImpl {
    #[cfg(target_os = "linux")]
    Mtd(MtdFlash),
    Sim(SimFlash),
}

impl FlashOptions {
    fn open(&self) -> Result<FlashImpl> {
        let flashimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimFlash::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&fs::read(path)?)?;
            }

            FlashImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = if let Some(name) = &self.mtd_name {
                    MtdFlash::open_named(name)?
                } else if let Some(dev) = &self.mtd_dev {
                    MtdFlash::open(dev)?
                } else {
                    unreachable!()
                };

                FlashImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(flashimpl)
    }

    fn close(&self, flash: FlashImpl) -> Result<()> {
        if let (FlashImpl::Sim(sim), Some(path), true) =
            (&flash, &self.sim_path, self.sim_write)
        {
            fs::write(path, sim.contents())?;
        }
        Ok(())
    }
}

impl FlashDevice for FlashImpl {
    fn name(&self) -> &str {
        match self {
            #[cfg(target_os = "linux")]
            FlashImpl::Mtd(x) => x.name(),
            FlashImpl::Sim(x) => x.name(),
        }
    }

    fn size(&self) -> u32 {
        match self {
            #[cfg(target_os = "linux")]
            FlashImpl::Mtd(x) => x.size(),
            FlashImpl::Sim(x) => x.size(),
        }
    }

    fn sector_size(&self) -> u32 {
        match self {
            #[cfg(target_os = "linux")]
            FlashImpl::Mtd(x) => x.sector_size(),
            FlashImpl::Sim(x) => x.sector_size(),
        }
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        match self {
            #[cfg(target_os = "linux")]
            FlashImpl::Mtd(x) => x.read(offset, buf),
            FlashImpl::Sim(x) => x.read(offset, buf),
        }
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), FlashError> {
        match self {
            #[cfg(target_os = "linux")]
            FlashImpl::Mtd(x) => x.erase(offset, length),
            FlashImpl::Sim(x) => x.erase(offset, length),
        }
    }

    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), FlashError> {
        match self {
            #[cfg(target_os = "linux")]
            FlashImpl::Mtd(x) => x.write(offset, buf),
            FlashImpl::Sim(x) => x.write(offset, buf),
        }
    }
}

#[derive(Args, Debug)]
struct InstallArgs {
    #[command(flatten)]
    flash: FlashOptions,

    /// Directory holding the firmware files (uboot.spi, uImage)
    #[clap(long, default_value = ".")]
    dir: PathBuf,

    /// Dump of the SPL signature block; the install only proceeds after an
    /// MMC boot, and without a dump the check is skipped
    #[clap(long)]
    spl_dump: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "SPI-NOR firmware install tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Diff and (re)write the firmware set onto the flash
    Install(InstallArgs),

    /// Parse and dump a firmware image header
    Header { file: PathBuf },

    /// Decode a SPL boot-signature dump
    Bootdev { file: PathBuf },
}

fn cmd_install(args: InstallArgs) -> Result<()> {
    if let Some(dump) = &args.spl_dump {
        let block = fs::read(dump).context("reading SPL dump")?;
        let boot_device = decode_boot_device(&block);
        anyhow::ensure!(
            boot_device == BootDevice::Mmc0,
            "not booted from MMC (decoded {boot_device:?}); refusing to install"
        );
    }

    let mut flash = args.flash.open()?;
    eprintln!(
        "Detected {} with sector size {} total {} bytes",
        flash.name(),
        flash.sector_size(),
        flash.size()
    );

    let jobs = [
        (FILE_UBOOT_SPI, OFFSET_UBOOT_SPI),
        (FILE_UIMAGE, OFFSET_UIMAGE),
    ];

    let mut status = ConsoleStatus;
    let mut installer = Installer::new(&mut flash, &mut status)?;

    howudoin::init(howudoin::consumers::TermLine::default());
    let rpt = howudoin::new()
        .label("Installing firmware")
        .set_len(u64::try_from(jobs.len()).ok());

    let mut failures = 0;
    for (file_name, offset) in jobs {
        rpt.desc(file_name);
        rpt.inc();

        let path = args.dir.join(file_name);

        // The uImage carries a validatable header; report on it, but an
        // invalid header does not block the install.
        if file_name == FILE_UIMAGE {
            if let Err(warning) = check_image_header(&path) {
                rpt.add_info(format!("{file_name}: {warning}"));
            }
        }

        if let JobOutcome::Failed(error) = installer.process_file(&path, offset) {
            rpt.add_info(format!("{file_name}: {error}"));
            failures += 1;
        }
    }

    rpt.finish();
    howudoin::disable();

    args.flash.close(flash)?;

    anyhow::ensure!(failures == 0, "{failures} job(s) failed");
    Ok(())
}

/// Open the image (with a few retries, the volume may still be settling) and
/// judge its header.
fn check_image_header(path: &std::path::Path) -> Result<()> {
    let mut file = retry(Fixed::from_millis(100).take(10), || File::open(path))
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut head = [0u8; HEADER_SIZE];
    file.read_exact(&mut head)?;

    let image = UImage::parse(&head)?;
    anyhow::ensure!(image.is_valid(), "image header is not valid");
    Ok(())
}

fn cmd_header(file: PathBuf) -> Result<()> {
    let mut head = [0u8; HEADER_SIZE];
    File::open(&file)?.read_exact(&mut head)?;

    let image = UImage::parse(&head)?;
    image.dump();

    anyhow::ensure!(image.is_valid(), "image header is not valid");
    Ok(())
}

fn cmd_bootdev(file: PathBuf) -> Result<()> {
    let block = fs::read(&file)?;
    anyhow::ensure!(
        block.len() >= SPL_SIGNATURE_LEN,
        "dump too short: need at least {SPL_SIGNATURE_LEN} bytes"
    );

    println!("{:?}", decode_boot_device(&block));
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Install(args) => cmd_install(args),
        Command::Header { file } => cmd_header(file),
        Command::Bootdev { file } => cmd_bootdev(file),
    }
}
