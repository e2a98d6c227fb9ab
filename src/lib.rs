//! Board-support and firmware-install library for the Allwinner H3 family of
//! boards (Orange Pi Zero and friends).
//!
//! The interesting parts live in two places:
//!
//! - [`install`], the SPI-NOR firmware install pipeline: diff a U-Boot-style
//!   image against the flash contents, then erase/write/verify sector by
//!   sector, with per-job recovery.
//! - [`emac`], the EMAC MAC/PHY bring-up and DMA descriptor ring management,
//!   including the CRC-based multicast hash filter.
//!
//! Everything else (flash device backends, image header validation, boot
//! device discovery, the I2C hardware clock) supports those two.

pub mod board;
pub mod emac;
pub mod flash;
pub mod install;
pub mod rtc;
pub mod uimage;
pub mod util;
