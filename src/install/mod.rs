//! The firmware install pipeline.
//!
//! Each configured firmware file is one job: open it, diff the first KiB
//! against the flash contents at the target offset, and only when they
//! differ, run the sector loop — erase, pad, write, read back, verify —
//! until the file runs out. A job that fails mid-loop leaves the flash
//! partially updated; there is no rollback, the next job still runs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

use crate::flash::FlashDevice;
use crate::util::ReadExt;

/// How many bytes `diff` compares. Deliberately only the head of the image:
/// version bumps always touch the header, so this is the fast path. A file
/// differing only past this point is treated as identical.
pub const COMPARE_BYTES: usize = 1024;

/// Smallest flash chip the installer will touch.
pub const FLASH_SIZE_MINIMUM: u32 = 0x20_0000;

pub const FILE_UBOOT_SPI: &str = "uboot.spi";
pub const FILE_UIMAGE: &str = "uImage";

pub const OFFSET_UBOOT_SPI: u32 = 0x0;
pub const OFFSET_UIMAGE: u32 = 0x18_0000;

const STATUS_CHECK_DIFFERENCE: &str = "Check difference";
const STATUS_WRITING: &str = "Writing";
const STATUS_NO_DIFFERENCE: &str = "No difference";
const STATUS_DONE: &str = "Done";

/// Why a job failed. Matches the operator-visible error strings; flash I/O
/// failures abort only the current job's write loop.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("error: flash erase")]
    Erase,

    #[error("error: flash write")]
    Write,

    #[error("error: flash read")]
    Read,

    #[error("error: flash verify")]
    Verify,

    #[error("error: file read: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("error: end of flash before end of file")]
    FlashFull,
}

/// The outcome of one job, start to finish.
#[derive(Debug)]
pub enum JobOutcome {
    /// The file could not be opened; the job was skipped entirely.
    Skipped,

    /// Flash already matches the file head; nothing written.
    NoDifference,

    /// The write loop completed; this many bytes came out of the file.
    Written(u64),

    /// The job aborted. Flash may be partially updated.
    Failed(InstallError),
}

/// Where human-visible progress goes: the on-device display rows and the
/// one-line status area. No control flow depends on it.
pub trait StatusSink {
    fn write_line(&mut self, row: u8, text: &str);
    fn text_status(&mut self, text: &str);
}

/// Status sink that mirrors everything to the process console.
#[derive(Debug, Default)]
pub struct ConsoleStatus;

impl StatusSink for ConsoleStatus {
    fn write_line(&mut self, _row: u8, text: &str) {
        eprintln!("{text}");
    }

    fn text_status(&mut self, text: &str) {
        eprintln!("{text}");
    }
}

/// One install session over one flash device.
///
/// The two sector-sized buffers are allocated once and reused by every job
/// in the session; they go away with the installer.
pub struct Installer<'a, F: FlashDevice, S: StatusSink> {
    flash: &'a mut F,
    status: &'a mut S,
    flash_size: u32,
    sector_size: u32,
    file_buffer: Vec<u8>,
    flash_buffer: Vec<u8>,
}

impl<'a, F: FlashDevice, S: StatusSink> Installer<'a, F, S> {
    /// Start a session. Fails when the chip is too small to hold the
    /// firmware set.
    pub fn new(flash: &'a mut F, status: &'a mut S) -> anyhow::Result<Self> {
        let flash_size = flash.size();
        let sector_size = flash.sector_size();

        anyhow::ensure!(
            flash_size >= FLASH_SIZE_MINIMUM,
            "flash too small: {flash_size} bytes"
        );
        anyhow::ensure!(
            sector_size > 0 && flash_size % sector_size == 0,
            "sector size {sector_size} does not divide {flash_size}"
        );

        status.write_line(1, flash.name());

        Ok(Self {
            flash,
            status,
            flash_size,
            sector_size,
            file_buffer: vec![0; sector_size as usize],
            flash_buffer: vec![0; sector_size as usize],
        })
    }

    /// Run one job against a file on disk. An unopenable file skips the job;
    /// everything else is reported through the returned outcome.
    pub fn process_file(&mut self, path: &Path, offset: u32) -> JobOutcome {
        let name = path.display().to_string();
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(_) => {
                self.status.text_status(&format!("Could not open file: {name}"));
                return JobOutcome::Skipped;
            }
        };

        self.process(&name, &mut file, offset)
    }

    /// Run one job against an already-open byte stream.
    pub fn process<R: Read + Seek>(
        &mut self,
        name: &str,
        reader: &mut R,
        offset: u32,
    ) -> JobOutcome {
        assert!(offset < self.flash_size);
        self.status.write_line(2, name);

        self.status.text_status(STATUS_CHECK_DIFFERENCE);
        let outcome = if self.diff(reader, offset) {
            self.status.text_status(STATUS_WRITING);
            match self.write(reader, offset) {
                Ok(total) => {
                    self.status.write_line(3, &format!("{total} bytes written"));
                    JobOutcome::Written(total)
                }
                Err(error) => {
                    self.status.text_status(&error.to_string());
                    JobOutcome::Failed(error)
                }
            }
        } else {
            self.status.text_status(STATUS_NO_DIFFERENCE);
            JobOutcome::NoDifference
        };

        self.status.text_status(STATUS_DONE);
        outcome
    }

    /// Compare the first [`COMPARE_BYTES`] of the file against the flash
    /// contents at `offset`. Returns true iff they differ. Fails closed: any
    /// read problem reads as "no difference", so nothing gets written.
    fn diff<R: Read + Seek>(&mut self, reader: &mut R, offset: u32) -> bool {
        if reader.seek(SeekFrom::Start(0)).is_err() {
            return false;
        }

        if reader.read_exact(&mut self.file_buffer[..COMPARE_BYTES]).is_err() {
            return false;
        }

        if self
            .flash
            .read(offset, &mut self.flash_buffer[..COMPARE_BYTES])
            .is_err()
        {
            return false;
        }

        !self.buffers_compare(COMPARE_BYTES)
    }

    /// The sector loop. Walks the file from the start, one sector per turn,
    /// until a short read signals end-of-file. Any flash primitive error or
    /// verify mismatch aborts immediately; the sectors already written stay.
    fn write<R: Read + Seek>(&mut self, reader: &mut R, offset: u32) -> Result<u64, InstallError> {
        reader.seek(SeekFrom::Start(0))?;

        let sector_size = self.sector_size as usize;
        let mut address = offset;
        let mut total_bytes: u64 = 0;

        while address < self.flash_size {
            let bytes = reader.read_full(&mut self.file_buffer[..sector_size])?;
            total_bytes += bytes as u64;

            if self.flash.erase(address, self.sector_size).is_err() {
                return Err(InstallError::Erase);
            }

            // Pad the short tail out to a full sector
            self.file_buffer[bytes..sector_size].fill(0xFF);

            if self.flash.write(address, &self.file_buffer[..sector_size]).is_err() {
                return Err(InstallError::Write);
            }

            if self
                .flash
                .read(address, &mut self.flash_buffer[..bytes])
                .is_err()
            {
                return Err(InstallError::Read);
            }

            if !self.buffers_compare(bytes) {
                return Err(InstallError::Verify);
            }

            if bytes < sector_size {
                // End of file: the only successful exit
                return Ok(total_bytes);
            }

            address += self.sector_size;
        }

        Err(InstallError::FlashFull)
    }

    /// Compare the two session buffers over the first `size` bytes,
    /// word-at-a-time with a byte tail. `size` never exceeds the sector size.
    fn buffers_compare(&self, size: usize) -> bool {
        debug_assert!(size <= self.sector_size as usize);

        let words = size / 4;
        let (file_words, file_tail) = self.file_buffer[..size].split_at(words * 4);
        let (flash_words, flash_tail) = self.flash_buffer[..size].split_at(words * 4);

        let word_eq = file_words
            .chunks_exact(4)
            .zip(flash_words.chunks_exact(4))
            .all(|(a, b)| {
                u32::from_ne_bytes(a.try_into().unwrap()) == u32::from_ne_bytes(b.try_into().unwrap())
            });

        word_eq && file_tail == flash_tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FaultOp, SimFlash, SimLayout};
    use std::io::Cursor;

    const LAYOUT: SimLayout = SimLayout {
        sectors: 2048,
        sector_size: 4096,
    };

    /// Sink that remembers the status strings, for asserting the flow.
    #[derive(Debug, Default)]
    struct RecordingStatus(Vec<String>);

    impl StatusSink for RecordingStatus {
        fn write_line(&mut self, _row: u8, text: &str) {
            self.0.push(text.to_string());
        }
        fn text_status(&mut self, text: &str) {
            self.0.push(text.to_string());
        }
    }

    fn test_image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + i / 257) as u8).collect()
    }

    #[test]
    fn buffers_compare_agrees_with_naive() {
        let mut flash = SimFlash::new(LAYOUT);
        let mut status = RecordingStatus::default();
        let mut installer = Installer::new(&mut flash, &mut status).unwrap();

        for size in [0usize, 1, 2, 3, 4, 5, 7, 8, 63, 64, 1023, 1024, 4096] {
            let a = test_image(4096);
            installer.file_buffer[..].copy_from_slice(&a);
            installer.flash_buffer[..].copy_from_slice(&a);
            assert!(installer.buffers_compare(size), "equal, size {size}");

            if size > 0 {
                // Flip the last byte in range: word path and tail path both
                // have to notice.
                installer.flash_buffer[size - 1] ^= 0x80;
                assert!(!installer.buffers_compare(size), "unequal, size {size}");
                // A difference just outside the range must not count.
                assert!(installer.buffers_compare(size - 1));
            }
        }
    }

    #[test]
    fn round_trip_then_no_difference() {
        let mut flash = SimFlash::new(LAYOUT);
        let image = test_image(3 * 4096);

        let mut status = RecordingStatus::default();
        let mut installer = Installer::new(&mut flash, &mut status).unwrap();
        let outcome = installer.process("uboot.spi", &mut Cursor::new(&image), 0);
        assert!(matches!(outcome, JobOutcome::Written(n) if n == image.len() as u64));

        // File content landed verbatim...
        assert_eq!(&flash.contents()[..image.len()], &image[..]);
        // ...padded with 0xFF to the sector boundary (file ends exactly on a
        // boundary here, so the loop wrote one extra fully-padded sector).
        assert!(flash.contents()[image.len()..4 * 4096]
            .iter()
            .all(|&b| b == 0xFF));

        // Second run: identical head, nothing to do.
        let before = flash.contents().to_vec();
        let mut status = RecordingStatus::default();
        let mut installer = Installer::new(&mut flash, &mut status).unwrap();
        let outcome = installer.process("uboot.spi", &mut Cursor::new(&image), 0);
        assert!(matches!(outcome, JobOutcome::NoDifference));
        assert_eq!(flash.contents(), &before[..]);
    }

    #[test]
    fn unaligned_tail_padded_with_ff() {
        let mut flash = SimFlash::new(LAYOUT);
        let image = test_image(4096 + 100);

        let mut status = RecordingStatus::default();
        let mut installer = Installer::new(&mut flash, &mut status).unwrap();
        let outcome = installer.process("uImage", &mut Cursor::new(&image), OFFSET_UIMAGE);
        assert!(matches!(outcome, JobOutcome::Written(n) if n == image.len() as u64));

        let base = OFFSET_UIMAGE as usize;
        assert_eq!(&flash.contents()[base..base + image.len()], &image[..]);
        assert!(flash.contents()[base + image.len()..base + 2 * 4096]
            .iter()
            .all(|&b| b == 0xFF));
    }

    #[test]
    fn interrupted_write_leaves_earlier_sectors() {
        let mut flash = SimFlash::new(LAYOUT);

        // Pre-existing flash content, so we can check later sectors survive
        let old = test_image(8 * 4096);
        flash.erase(0, 8 * 4096).unwrap();
        flash.write(0, &old).unwrap();

        let image: Vec<u8> = test_image(5 * 4096).iter().map(|b| b ^ 0xA5).collect();

        // Fail the erase of sector 2
        flash.inject_fault(FaultOp::Erase, 2 * 4096);

        let mut status = RecordingStatus::default();
        let mut installer = Installer::new(&mut flash, &mut status).unwrap();
        let outcome = installer.process("uboot.spi", &mut Cursor::new(&image), 0);
        assert!(matches!(outcome, JobOutcome::Failed(InstallError::Erase)));

        // Sectors [0, 2): new content
        assert_eq!(&flash.contents()[..2 * 4096], &image[..2 * 4096]);
        // Sectors (2, ..): untouched prior content
        assert_eq!(&flash.contents()[3 * 4096..8 * 4096], &old[3 * 4096..]);
    }

    #[test]
    fn diff_fails_closed_on_short_file() {
        let mut flash = SimFlash::new(LAYOUT);
        // Make flash differ from the file so a write would happen if diff ran
        flash.erase(0, 4096).unwrap();
        flash.write(0, &[0u8; 512]).unwrap();

        let short = test_image(COMPARE_BYTES - 1);
        let mut status = RecordingStatus::default();
        let mut installer = Installer::new(&mut flash, &mut status).unwrap();
        let outcome = installer.process("uboot.spi", &mut Cursor::new(&short), 0);
        assert!(matches!(outcome, JobOutcome::NoDifference));
    }

    #[test]
    fn file_longer_than_flash_is_a_failure() {
        let small = SimLayout {
            sectors: 4,
            sector_size: 4096,
        };
        // Below FLASH_SIZE_MINIMUM: the session must refuse outright
        let mut flash = SimFlash::new(small);
        let mut status = RecordingStatus::default();
        assert!(Installer::new(&mut flash, &mut status).is_err());

        // A file that fills flash to the end never takes the short-read exit
        let mut flash = SimFlash::new(LAYOUT);
        let image: Vec<u8> = test_image(LAYOUT.sectors as usize * 4096)
            .iter()
            .map(|b| !b)
            .collect();
        let mut status = RecordingStatus::default();
        let mut installer = Installer::new(&mut flash, &mut status).unwrap();
        let outcome = installer.process("uImage", &mut Cursor::new(&image), 0);
        assert!(matches!(outcome, JobOutcome::Failed(InstallError::FlashFull)));
    }

    #[test]
    fn skipped_file_does_not_stop_session() {
        let mut flash = SimFlash::new(LAYOUT);
        let mut status = RecordingStatus::default();
        let mut installer = Installer::new(&mut flash, &mut status).unwrap();

        let outcome = installer.process_file(Path::new("/nonexistent/uboot.spi"), 0);
        assert!(matches!(outcome, JobOutcome::Skipped));

        // The session keeps going with the next job
        let image = test_image(2 * 4096);
        let outcome = installer.process("uImage", &mut Cursor::new(&image), OFFSET_UIMAGE);
        assert!(matches!(outcome, JobOutcome::Written(_)));
    }
}
