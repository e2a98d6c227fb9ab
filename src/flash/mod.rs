//! Abstractions and code to access SPI-NOR flash

use std::str::FromStr;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// The one failure type flash primitives report. Callers treat any error as
/// fatal for the operation in progress; there is no partial-success signal.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("offset/length out of device range")]
    OutOfRange,

    #[error("erase not aligned to the sector size")]
    Unaligned,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("injected fault")]
    Injected,
}

/// Represents a sector-addressed NOR flash device.
///
/// Writes within a sector require a prior erase; erase granularity is the
/// sector. Alignment is the caller's duty, the device only reports it.
pub trait FlashDevice {
    /// The chip name, for operator display.
    fn name(&self) -> &str;

    /// Total size in bytes. Always a multiple of the sector size.
    fn size(&self) -> u32;

    /// The minimum erasable unit, in bytes.
    fn sector_size(&self) -> u32;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erase `length` bytes starting at `offset`; both sector-aligned.
    fn erase(&mut self, offset: u32, length: u32) -> Result<(), FlashError>;

    /// Program `buf` starting at `offset`. The range must have been erased.
    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), FlashError>;
}

/// A pub-fields struct describing the geometry of a simulated flash device
#[derive(Debug, Copy, Clone)]
pub struct SimLayout {
    pub sectors: u32,
    pub sector_size: u32,
}

/// Parse strings like "SECTORSxBYTES"
impl FromStr for SimLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [sectors, sector_size]: [&str; 2] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#"))?;

        Ok(SimLayout {
            sectors: sectors.parse()?,
            sector_size: sector_size.parse()?,
        })
    }
}

/// Which primitive a [`SimFlash`] fault should fire on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOp {
    Read,
    Erase,
    Write,
}

/// A simulated in-memory NOR flash, for testing purposes.
///
/// Follows NOR semantics: an erased sector reads 0xFF, and programming can
/// only clear bits (`stored &= data`).
#[derive(Debug, Clone)]
pub struct SimFlash {
    data: Vec<u8>,
    sector_size: u32,
    fault: Option<(FaultOp, u32)>,
}

impl SimFlash {
    /// Create a fully-erased simulated chip with the specified layout.
    pub fn new(layout: SimLayout) -> Self {
        Self {
            data: vec![0xFF; (layout.sectors * layout.sector_size) as usize],
            sector_size: layout.sector_size,
            fault: None,
        }
    }

    /// Arrange for the next matching primitive at `offset` to fail.
    pub fn inject_fault(&mut self, op: FaultOp, offset: u32) {
        self.fault = Some((op, offset));
    }

    /// Direct access to the simulated contents, for test assertions.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Replace the simulated contents wholesale (e.g. loaded from a file).
    pub fn load(&mut self, image: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(image.len() == self.data.len(), "image size mismatch");
        self.data.copy_from_slice(image);
        Ok(())
    }

    fn check_fault(&mut self, op: FaultOp, offset: u32) -> Result<(), FlashError> {
        if self.fault == Some((op, offset)) {
            self.fault = None;
            return Err(FlashError::Injected);
        }
        Ok(())
    }

    fn range(&self, offset: u32, length: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = offset as usize;
        let end = start.checked_add(length).ok_or(FlashError::OutOfRange)?;
        if end > self.data.len() {
            return Err(FlashError::OutOfRange);
        }
        Ok(start..end)
    }
}

impl FlashDevice for SimFlash {
    fn name(&self) -> &str {
        "W25Q32 (simulated)"
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_fault(FaultOp::Read, offset)?;
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), FlashError> {
        self.check_fault(FaultOp::Erase, offset)?;
        if offset % self.sector_size != 0 || length % self.sector_size != 0 {
            return Err(FlashError::Unaligned);
        }
        let range = self.range(offset, length as usize)?;
        self.data[range].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), FlashError> {
        self.check_fault(FaultOp::Write, offset)?;
        let range = self.range(offset, buf.len())?;
        for (stored, &incoming) in self.data[range].iter_mut().zip(buf) {
            *stored &= incoming;
        }
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: SimLayout = SimLayout {
    sectors: 8,
    sector_size: 256,
};

#[test]
fn test_sim_layout_parse() {
    let layout: SimLayout = "512x4096".parse().unwrap();
    assert_eq!(layout.sectors, 512);
    assert_eq!(layout.sector_size, 4096);
    assert!("512".parse::<SimLayout>().is_err());
    assert!("ax4096".parse::<SimLayout>().is_err());
}

#[test]
fn test_sim_erase_write_read() {
    let mut flash = SimFlash::new(TEST_LAYOUT);

    let mut buf = [0u8; 256];
    flash.read(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));

    flash.erase(256, 256).unwrap();
    flash.write(256, &[0x12, 0x34]).unwrap();
    flash.read(256, &mut buf[..2]).unwrap();
    assert_eq!(&buf[..2], &[0x12, 0x34]);

    // NOR: programming without erase can only clear bits
    flash.write(256, &[0xF0, 0x0F]).unwrap();
    flash.read(256, &mut buf[..2]).unwrap();
    assert_eq!(&buf[..2], &[0x10, 0x04]);

    // Erase restores the all-1s state
    flash.erase(256, 256).unwrap();
    flash.read(256, &mut buf[..2]).unwrap();
    assert_eq!(&buf[..2], &[0xFF, 0xFF]);
}

#[test]
fn test_sim_bounds_and_alignment() {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    let mut buf = [0u8; 16];

    assert!(matches!(
        flash.read(flash.size() - 8, &mut buf),
        Err(FlashError::OutOfRange)
    ));
    assert!(matches!(flash.erase(128, 256), Err(FlashError::Unaligned)));
    assert!(matches!(flash.erase(0, 100), Err(FlashError::Unaligned)));
}

#[test]
fn test_sim_fault_injection() {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    flash.inject_fault(FaultOp::Erase, 512);

    flash.erase(0, 256).unwrap();
    assert!(matches!(flash.erase(512, 256), Err(FlashError::Injected)));

    // Single-shot: the same op succeeds afterwards
    flash.erase(512, 256).unwrap();
}
