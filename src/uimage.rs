//! Parsing and validation of the U-Boot-style firmware image header.
//!
//! The header is a fixed 60-byte big-endian structure placed at the front of
//! every firmware file. It must be preserved byte-for-byte: there is no
//! version field, and already-flashed bootloaders expect exactly this layout.

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

/// zlib-style CRC32, the algorithm the bootloader uses for `hcrc`/`dcrc`.
pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const HEADER_SIZE: usize = 60;
pub const NAME_LEN: usize = 28;

const IH_MAGIC: u32 = 0x27051956;
const IH_LOAD: u32 = 0x40000000;
const IH_EP: u32 = 0x40000000;
const IH_OS_U_BOOT: u8 = 17;
const IH_ARCH_ARM: u8 = 2;
const IH_TYPE_STANDALONE: u8 = 1;
const IH_COMP_NONE: u8 = 0;
const IH_COMP_GZIP: u8 = 1;

/// The product identifier every trusted image carries in its name field.
pub const PRODUCT_ID: &str = "http://www.orangepi-dmx.org";

/// The raw on-flash header layout. All multi-byte fields are big-endian.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct ImageHeader {
    pub magic: u32,
    pub hcrc: u32,
    pub time: u32,
    pub size: u32,
    pub load: u32,
    pub ep: u32,
    pub dcrc: u32,
    pub os: u8,
    pub arch: u8,
    pub typ: u8,
    pub comp: u8,
    pub name: [u8; NAME_LEN],
}

/// A parsed header plus the validity verdict over it.
///
/// Both flags are computed once at construction; this type never touches the
/// file again.
#[derive(Debug, Clone)]
pub struct UImage {
    header: ImageHeader,
    is_valid: bool,
    is_compressed: bool,
}

impl UImage {
    /// Decode `buf` (at least [`HEADER_SIZE`] bytes) and judge it.
    ///
    /// Decoding only fails on a short buffer; a well-sized buffer full of
    /// garbage decodes fine and comes back with `is_valid() == false`.
    pub fn parse(buf: &[u8]) -> anyhow::Result<Self> {
        let (_, header) = ImageHeader::from_bytes((buf, 0))?;

        let mut is_valid = header.magic == IH_MAGIC;
        is_valid &= header.load == IH_LOAD;
        is_valid &= header.ep == IH_EP;
        is_valid &= header.os == IH_OS_U_BOOT;
        is_valid &= header.arch == IH_ARCH_ARM;
        is_valid &= header.typ == IH_TYPE_STANDALONE;
        is_valid &= name_matches(&header.name);
        is_valid &= header.hcrc == compute_hcrc(&buf[..HEADER_SIZE]);

        let is_compressed = header.comp == IH_COMP_GZIP;

        Ok(Self {
            header,
            is_valid,
            is_compressed,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// gzip-compressed payload? Independent of validity.
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Print all decoded fields. Diagnostic only; prints garbage fields as-is
    /// when the header is invalid.
    pub fn dump(&self) {
        if !self.is_valid {
            println!("* Not a valid header! *");
        }

        let h = &self.header;
        println!("Magic Number        : {:08x}", h.magic);
        println!("Header CRC Checksum : {:08x}", h.hcrc);
        println!(
            "Creation Timestamp  : {:08x} - {}",
            h.time,
            format_timestamp(h.time)
        );
        println!(
            "Data Size           : {:08x} - {} kBytes",
            h.size,
            h.size / 1024
        );
        println!("Data Load Address   : {:08x}", h.load);
        println!("Entry Point Address : {:08x}", h.ep);
        println!("Image CRC Checksum  : {:08x}", h.dcrc);
        println!(
            "Operating System    : {} - {}",
            h.os,
            if h.os == IH_OS_U_BOOT {
                "Firmware"
            } else {
                "Not supported"
            }
        );
        println!(
            "CPU architecture    : {} - {}",
            h.arch,
            if h.arch == IH_ARCH_ARM {
                "Arm"
            } else {
                "Not supported"
            }
        );
        println!(
            "Image type          : {} - {}",
            h.typ,
            if h.typ == IH_TYPE_STANDALONE {
                "Standalone Program"
            } else {
                "Not supported"
            }
        );
        println!(
            "Compression         : {} - {}",
            h.comp,
            match h.comp {
                IH_COMP_NONE => "none",
                IH_COMP_GZIP => "gzip",
                _ => "Not supported",
            }
        );
        println!("Image Name          : {}", name_str(&h.name));
    }
}

/// Recompute the header CRC: checksum of the raw header with the stored
/// `hcrc` field (bytes 4..8) zeroed.
pub fn compute_hcrc(raw: &[u8]) -> u32 {
    let mut copy = [0u8; HEADER_SIZE];
    copy.copy_from_slice(&raw[..HEADER_SIZE]);
    copy[4..8].fill(0);
    IMAGE_CRC.checksum(&copy)
}

/// The name field matches when it equals [`PRODUCT_ID`] NUL-padded out to the
/// full field width.
fn name_matches(name: &[u8; NAME_LEN]) -> bool {
    let id = PRODUCT_ID.as_bytes();
    name[..id.len()] == *id && name[id.len()..].iter().all(|&b| b == 0)
}

/// Render the creation timestamp the way `asctime` would, in UTC.
fn format_timestamp(time: u32) -> String {
    match DateTime::<Utc>::from_timestamp(i64::from(time), 0) {
        Some(date) => date.format("%a %b %e %H:%M:%S %Y").to_string(),
        None => String::from("<invalid>"),
    }
}

fn name_str(name: &[u8; NAME_LEN]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    std::str::from_utf8(&name[..end]).unwrap_or("<non-utf8>")
}

#[cfg(test)]
fn test_header_bytes() -> Vec<u8> {
    let mut name = [0u8; NAME_LEN];
    name[..PRODUCT_ID.len()].copy_from_slice(PRODUCT_ID.as_bytes());

    let mut header = ImageHeader {
        magic: IH_MAGIC,
        hcrc: 0,
        time: 0x5E0C_2A00,
        size: 0x0002_0000,
        load: IH_LOAD,
        ep: IH_EP,
        dcrc: 0xDEAD_BEEF,
        os: IH_OS_U_BOOT,
        arch: IH_ARCH_ARM,
        typ: IH_TYPE_STANDALONE,
        comp: IH_COMP_NONE,
        name,
    };

    let raw = header.to_bytes().unwrap();
    header.hcrc = IMAGE_CRC.checksum(&raw);
    header.to_bytes().unwrap()
}

#[test]
fn test_valid_header() -> anyhow::Result<()> {
    let raw = test_header_bytes();
    assert_eq!(raw.len(), HEADER_SIZE);

    let image = UImage::parse(&raw)?;
    assert!(image.is_valid());
    assert!(!image.is_compressed());
    Ok(())
}

#[test]
fn test_compressed_flag_is_independent() -> anyhow::Result<()> {
    let mut raw = test_header_bytes();
    raw[31] = IH_COMP_GZIP; // comp byte
    // hcrc no longer matches, so validity drops, but the flag still reads.
    let image = UImage::parse(&raw)?;
    assert!(image.is_compressed());
    assert!(!image.is_valid());

    // Re-seal the CRC: compressed and valid at the same time.
    let hcrc = compute_hcrc(&raw);
    raw[4..8].copy_from_slice(&hcrc.to_be_bytes());
    let image = UImage::parse(&raw)?;
    assert!(image.is_compressed());
    assert!(image.is_valid());
    Ok(())
}

#[test]
fn test_single_field_flips_invalidate() -> anyhow::Result<()> {
    // Flip one byte in each validated field; every flip must break validity.
    let field_offsets = [
        0,  // magic
        4,  // hcrc
        16, // load
        20, // ep
        28, // os
        29, // arch
        30, // typ
        32, // name
    ];

    for offset in field_offsets {
        let mut raw = test_header_bytes();
        raw[offset] ^= 0x01;
        let image = UImage::parse(&raw)?;
        assert!(!image.is_valid(), "flip at offset {offset} still valid");
    }
    Ok(())
}

#[test]
fn test_timestamp_renders_as_utc_date() {
    // The value test_header_bytes() carries.
    assert_eq!(format_timestamp(0x5E0C_2A00), "Wed Jan  1 05:11:28 2020");
    assert_eq!(format_timestamp(0), "Thu Jan  1 00:00:00 1970");
}

#[test]
fn test_short_buffer_rejected() {
    let raw = test_header_bytes();
    assert!(UImage::parse(&raw[..HEADER_SIZE - 1]).is_err());
}
