//! Boot-device discovery and board identity strings.
//!
//! The boot ROM's SPL leaves a signature block in low memory (starting at
//! physical address 0x4). Decoding it tells us which device the board booted
//! from; the installer only runs after an MMC boot. The probe is read-only
//! and only meaningful before that memory region gets reused.

use bytes::Buf;

pub const BOARD_NAME: &str = "Orange Pi Zero";
pub const SOC_NAME: &str = "H2+/H3";
pub const CPU_NAME: &str = "Cortex-A7";
pub const SYS_NAME: &str = "Baremetal";

/// "eGON" / ".BT0", the SPL header magic as two little-endian words.
const SPL_MAGIC: [u32; 2] = [0x4E4F_4765, 0x3054_422E];

/// Offset of the boot-device byte within the signature block (SPL offset
/// 0x28, and the block starts at 0x4).
const BOOT_DEV_OFFSET: usize = 36;

/// The minimum block length `decode_boot_device` needs.
pub const SPL_SIGNATURE_LEN: usize = BOOT_DEV_OFFSET + 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BootDevice {
    /// USB recovery mode; no SPL signature present at all.
    Fel,
    Mmc0,
    Spi,
    Unknown,
}

/// Decode the SPL signature block.
///
/// `block` holds memory contents starting at physical 0x4, at least
/// [`SPL_SIGNATURE_LEN`] bytes. Without the two magic words this is a FEL
/// boot regardless of anything else; otherwise the boot-device byte maps
/// 0 to MMC0 and 3 to SPI.
pub fn decode_boot_device(block: &[u8]) -> BootDevice {
    if block.len() < SPL_SIGNATURE_LEN {
        return BootDevice::Fel;
    }

    let mut words = &block[..8];
    if [words.get_u32_le(), words.get_u32_le()] != SPL_MAGIC {
        return BootDevice::Fel;
    }

    match block[BOOT_DEV_OFFSET] {
        0 => BootDevice::Mmc0,
        3 => BootDevice::Spi,
        _ => BootDevice::Unknown,
    }
}

/// Read the live signature block and decode it.
///
/// # Safety
/// Only valid on the SoC itself, with low memory identity-mapped, and only
/// before later initialization has overwritten the SPL area.
#[cfg(target_arch = "arm")]
pub unsafe fn probe_boot_device() -> BootDevice {
    let mut block = [0u8; SPL_SIGNATURE_LEN];
    core::ptr::copy_nonoverlapping(0x4 as *const u8, block.as_mut_ptr(), block.len());
    decode_boot_device(&block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature_block(boot_dev: u8) -> Vec<u8> {
        let mut block = vec![0u8; SPL_SIGNATURE_LEN];
        block[0..4].copy_from_slice(b"eGON");
        block[4..8].copy_from_slice(b".BT0");
        block[BOOT_DEV_OFFSET] = boot_dev;
        block
    }

    #[test]
    fn boot_device_decode_table() {
        assert_eq!(decode_boot_device(&signature_block(0)), BootDevice::Mmc0);
        assert_eq!(decode_boot_device(&signature_block(3)), BootDevice::Spi);
        assert_eq!(decode_boot_device(&signature_block(1)), BootDevice::Unknown);
        assert_eq!(
            decode_boot_device(&signature_block(0xFF)),
            BootDevice::Unknown
        );
    }

    #[test]
    fn missing_magic_means_fel() {
        // Magic absent: FEL regardless of the boot-device byte
        let mut block = signature_block(0);
        block[0] ^= 0xFF;
        assert_eq!(decode_boot_device(&block), BootDevice::Fel);

        let mut block = signature_block(3);
        block[7] = 0;
        assert_eq!(decode_boot_device(&block), BootDevice::Fel);

        assert_eq!(decode_boot_device(&[]), BootDevice::Fel);
    }
}
