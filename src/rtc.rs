//! I2C hardware real-time clock driver.
//!
//! Three chip variants are supported and probed in a fixed order: MCP7941X
//! (with its oscillator-start and battery-enable control bits), DS3231, and
//! PCF8563 (whose time integrity is reported through the seconds VL bit).
//! All of them keep time in BCD registers; they differ in register layout
//! and control bits.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context};
use i2c_linux::{I2c, Message};

const I2C_BUS_PATH: &str = "/dev/i2c-0";

const ADDRESS_MCP7941X: u16 = 0x6F;
const ADDRESS_DS3231: u16 = 0x68;
const ADDRESS_PCF8563: u16 = 0x51;

// MCP7941X control bits
const MCP7941X_BIT_ST: u8 = 0x80;
const MCP7941X_BIT_VBATEN: u8 = 0x08;

// PCF8563: seconds register carries the voltage-low (time invalid) flag
const PCF8563_BIT_VL: u8 = 0x80;
const PCF8563_REG_SECONDS: u8 = 0x02;

const REG_SECONDS: u8 = 0x00;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RtcType {
    Mcp7941x,
    Ds3231,
    Pcf8563,
}

/// Broken-down clock time, always in 24-hour form.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RtcTime {
    pub sec: u8,
    pub min: u8,
    pub hour: u8,
    /// Day of month, 1-31.
    pub mday: u8,
    /// Month, 1-12.
    pub mon: u8,
    /// Full year, e.g. 2026.
    pub year: u16,
    /// Day of week, 0-6.
    pub wday: u8,
}

/// An attached hardware clock on the I2C bus.
pub struct HwClock {
    i2c: I2c<File>,
    rtc_type: RtcType,
    address: u16,
}

impl HwClock {
    /// Probe the default bus for any of the supported chips.
    pub fn probe() -> anyhow::Result<Self> {
        Self::probe_path(I2C_BUS_PATH)
    }

    /// Probe a specific I2C bus device node.
    pub fn probe_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut i2c = I2c::from_path(path).context("opening i2c bus")?;

        for (address, rtc_type) in [
            (ADDRESS_MCP7941X, RtcType::Mcp7941x),
            (ADDRESS_DS3231, RtcType::Ds3231),
            (ADDRESS_PCF8563, RtcType::Pcf8563),
        ] {
            if !ping(&mut i2c, address) {
                continue;
            }

            let mut clock = Self {
                i2c,
                rtc_type,
                address,
            };

            if rtc_type == RtcType::Mcp7941x {
                clock.mcp7941x_start_oscillator()?;
            }

            return Ok(clock);
        }

        bail!("no supported RTC found on the bus");
    }

    pub fn rtc_type(&self) -> RtcType {
        self.rtc_type
    }

    /// Read the current time from the chip.
    pub fn get(&mut self) -> anyhow::Result<RtcTime> {
        let mut block = [0u8; 7];
        self.read_regs(self.seconds_reg(), &mut block)?;

        if self.rtc_type == RtcType::Pcf8563 && block[0] & PCF8563_BIT_VL != 0 {
            bail!("PCF8563 reports low voltage; time integrity not guaranteed");
        }

        Ok(decode_time(&block, self.rtc_type))
    }

    /// Set the chip to the given time.
    pub fn set(&mut self, time: &RtcTime) -> anyhow::Result<()> {
        let block = encode_time(time, self.rtc_type);
        self.write_regs(self.seconds_reg(), &block)
    }

    fn seconds_reg(&self) -> u8 {
        match self.rtc_type {
            RtcType::Pcf8563 => PCF8563_REG_SECONDS,
            _ => REG_SECONDS,
        }
    }

    /// The MCP7941X ships with its oscillator halted; setting the ST bit in
    /// the seconds register starts it. VBATEN keeps it running on battery.
    fn mcp7941x_start_oscillator(&mut self) -> anyhow::Result<()> {
        let mut regs = [0u8; 4];
        self.read_regs(REG_SECONDS, &mut regs)?;

        if regs[0] & MCP7941X_BIT_ST == 0 {
            self.write_regs(REG_SECONDS, &[regs[0] | MCP7941X_BIT_ST])?;
        }
        if regs[3] & MCP7941X_BIT_VBATEN == 0 {
            self.write_regs(0x03, &[regs[3] | MCP7941X_BIT_VBATEN])?;
        }
        Ok(())
    }

    fn read_regs(&mut self, reg: u8, buf: &mut [u8]) -> anyhow::Result<()> {
        self.i2c.i2c_transfer(&mut [
            Message::Write {
                address: self.address,
                data: &[reg],
                flags: Default::default(),
            },
            Message::Read {
                address: self.address,
                data: buf,
                flags: Default::default(),
            },
        ])?;
        Ok(())
    }

    fn write_regs(&mut self, reg: u8, values: &[u8]) -> anyhow::Result<()> {
        let mut data = vec![reg];
        data.extend_from_slice(values);
        self.i2c.i2c_transfer(&mut [Message::Write {
            address: self.address,
            data: &data,
            flags: Default::default(),
        }])?;
        Ok(())
    }
}

/// A zero-length write: ack means a chip answers at `address`.
fn ping(i2c: &mut I2c<File>, address: u16) -> bool {
    i2c.i2c_transfer(&mut [Message::Write {
        address,
        data: &[],
        flags: Default::default(),
    }])
    .is_ok()
}

fn bcd2dec(value: u8) -> u8 {
    (value & 0x0F) + (value >> 4) * 10
}

fn dec2bcd(value: u8) -> u8 {
    ((value / 10) << 4) + value % 10
}

/// Decode a 7-register block starting at the chip's seconds register.
fn decode_time(block: &[u8; 7], rtc_type: RtcType) -> RtcTime {
    match rtc_type {
        // Register order: sec, min, hour, wday, mday, month, year
        RtcType::Mcp7941x | RtcType::Ds3231 => RtcTime {
            sec: bcd2dec(block[0] & 0x7F),
            min: bcd2dec(block[1] & 0x7F),
            hour: bcd2dec(block[2] & 0x3F),
            wday: bcd2dec(block[3] & 0x07),
            mday: bcd2dec(block[4] & 0x3F),
            mon: bcd2dec(block[5] & 0x1F),
            year: 2000 + u16::from(bcd2dec(block[6])),
        },
        // Register order: sec, min, hour, mday, wday, month, year
        RtcType::Pcf8563 => RtcTime {
            sec: bcd2dec(block[0] & 0x7F),
            min: bcd2dec(block[1] & 0x7F),
            hour: bcd2dec(block[2] & 0x3F),
            mday: bcd2dec(block[3] & 0x3F),
            wday: block[4] & 0x07,
            mon: bcd2dec(block[5] & 0x1F),
            year: 2000 + u16::from(bcd2dec(block[6])),
        },
    }
}

/// Encode a time into the 7-register block for the chip variant.
fn encode_time(time: &RtcTime, rtc_type: RtcType) -> [u8; 7] {
    let year = dec2bcd((time.year % 100) as u8);
    match rtc_type {
        RtcType::Mcp7941x => [
            // ST must stay set or the oscillator stops
            dec2bcd(time.sec) | MCP7941X_BIT_ST,
            dec2bcd(time.min),
            dec2bcd(time.hour),
            dec2bcd(time.wday) | MCP7941X_BIT_VBATEN,
            dec2bcd(time.mday),
            dec2bcd(time.mon),
            year,
        ],
        RtcType::Ds3231 => [
            dec2bcd(time.sec),
            dec2bcd(time.min),
            dec2bcd(time.hour),
            dec2bcd(time.wday),
            dec2bcd(time.mday),
            dec2bcd(time.mon),
            year,
        ],
        RtcType::Pcf8563 => [
            dec2bcd(time.sec), // also clears VL
            dec2bcd(time.min),
            dec2bcd(time.hour),
            dec2bcd(time.mday),
            time.wday & 0x07,
            dec2bcd(time.mon),
            year,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_round_trip() {
        for value in 0u8..=99 {
            assert_eq!(bcd2dec(dec2bcd(value)), value);
        }
        assert_eq!(dec2bcd(59), 0x59);
        assert_eq!(bcd2dec(0x23), 23);
    }

    const SAMPLE: RtcTime = RtcTime {
        sec: 42,
        min: 7,
        hour: 23,
        mday: 29,
        mon: 2,
        year: 2024,
        wday: 4,
    };

    #[test]
    fn encode_decode_all_variants() {
        for rtc_type in [RtcType::Mcp7941x, RtcType::Ds3231, RtcType::Pcf8563] {
            let block = encode_time(&SAMPLE, rtc_type);
            assert_eq!(decode_time(&block, rtc_type), SAMPLE, "{rtc_type:?}");
        }
    }

    #[test]
    fn mcp7941x_control_bits_kept_set() {
        let block = encode_time(&SAMPLE, RtcType::Mcp7941x);
        assert_ne!(block[0] & MCP7941X_BIT_ST, 0);
        assert_ne!(block[3] & MCP7941X_BIT_VBATEN, 0);
    }

    #[test]
    fn pcf8563_layout_swaps_mday_and_wday() {
        let block = encode_time(&SAMPLE, RtcType::Pcf8563);
        assert_eq!(bcd2dec(block[3]), SAMPLE.mday);
        assert_eq!(block[4], SAMPLE.wday);
        // Freshly encoded seconds never carry the VL flag
        assert_eq!(block[0] & PCF8563_BIT_VL, 0);
    }
}
