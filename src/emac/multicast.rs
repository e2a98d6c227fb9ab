//! Multicast receive filtering via the EMAC's 64-bit hash table.
//!
//! The table is an approximate set: a MAC address maps to one of 64 bits
//! through the top six bits of its CRC32, so unrelated addresses can collide
//! on the same bit. There is no removal by address; dropping an entry means
//! clearing the whole table and re-adding what should remain.

use crc::{Crc, CRC_32_ISO_HDLC};

use super::{EmacBus, Reg, RX_FRM_FLT_HASH_MULTICAST, RX_FRM_FLT_RX_ALL_MULTICAST};

const HASH_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Switch the receive filter from accept-all-multicast to hash-filtered
/// multicast. The table starts empty.
pub fn enable_hash_filter(bus: &mut impl EmacBus) {
    let mut filter = bus.read(Reg::RxFrmFlt);
    filter &= !RX_FRM_FLT_RX_ALL_MULTICAST;
    filter |= RX_FRM_FLT_HASH_MULTICAST;
    bus.write(Reg::RxFrmFlt, filter);

    bus.write(Reg::RxHash0, 0);
    bus.write(Reg::RxHash1, 0);
}

/// Back to accept-all-multicast; the table is cleared on the way out.
pub fn disable_hash_filter(bus: &mut impl EmacBus) {
    let mut filter = bus.read(Reg::RxFrmFlt);
    filter &= !RX_FRM_FLT_HASH_MULTICAST;
    filter |= RX_FRM_FLT_RX_ALL_MULTICAST;
    bus.write(Reg::RxFrmFlt, filter);

    bus.write(Reg::RxHash0, 0);
    bus.write(Reg::RxHash1, 0);
}

/// The 6-bit table index for a MAC address: the top six bits of its CRC32.
pub fn hash_index(mac_addr: &[u8; 6]) -> u32 {
    (HASH_CRC.checksum(mac_addr) >> 26) & 0x3F
}

/// Set the table bit for `mac_addr`. Indexes 32..64 land in HASH_0,
/// 0..32 in HASH_1.
pub fn set_hash(bus: &mut impl EmacBus, mac_addr: &[u8; 6]) {
    let hash = hash_index(mac_addr);

    if hash > 31 {
        let value = bus.read(Reg::RxHash0);
        bus.write(Reg::RxHash0, value | (1 << (hash - 32)));
    } else {
        let value = bus.read(Reg::RxHash1);
        bus.write(Reg::RxHash1, value | (1 << hash));
    }
}

/// Clear the whole table.
pub fn reset_hash(bus: &mut impl EmacBus) {
    bus.write(Reg::RxHash0, 0);
    bus.write(Reg::RxHash1, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emac::SimBus;

    /// Scan locally-administered addresses until two distinct ones share a
    /// table index. 65 candidates into 64 buckets always yields a pair.
    fn colliding_pair() -> ([u8; 6], [u8; 6]) {
        let mut seen: [Option<[u8; 6]>; 64] = [None; 64];
        for i in 0u8..=64 {
            let candidate = [0x02, 0, 0, 0, 0, i];
            let bucket = hash_index(&candidate) as usize;
            match seen[bucket] {
                Some(earlier) => return (earlier, candidate),
                None => seen[bucket] = Some(candidate),
            }
        }
        unreachable!("pigeonhole");
    }

    fn table(bus: &SimBus) -> (u32, u32) {
        (bus.read(Reg::RxHash0), bus.read(Reg::RxHash1))
    }

    #[test]
    fn filter_mode_toggles_and_clears_table() {
        let mut bus = SimBus::new();
        bus.write(Reg::RxFrmFlt, RX_FRM_FLT_RX_ALL_MULTICAST);

        enable_hash_filter(&mut bus);
        let filter = bus.read(Reg::RxFrmFlt);
        assert_eq!(filter & RX_FRM_FLT_RX_ALL_MULTICAST, 0);
        assert_ne!(filter & RX_FRM_FLT_HASH_MULTICAST, 0);
        assert_eq!(table(&bus), (0, 0));

        set_hash(&mut bus, &[0x01, 0x00, 0x5E, 0x00, 0x00, 0x01]);
        assert_ne!(table(&bus), (0, 0));

        disable_hash_filter(&mut bus);
        let filter = bus.read(Reg::RxFrmFlt);
        assert_ne!(filter & RX_FRM_FLT_RX_ALL_MULTICAST, 0);
        assert_eq!(filter & RX_FRM_FLT_HASH_MULTICAST, 0);
        assert_eq!(table(&bus), (0, 0));
    }

    #[test]
    fn colliding_addresses_share_a_bit() {
        let (a, b) = colliding_pair();
        assert_ne!(a, b);
        assert_eq!(hash_index(&a), hash_index(&b));

        let mut bus = SimBus::new();
        enable_hash_filter(&mut bus);

        set_hash(&mut bus, &a);
        let after_a = table(&bus);

        // The second address adds nothing: its bit is already set
        set_hash(&mut bus, &b);
        assert_eq!(table(&bus), after_a);

        // And the whole-table reset takes both out at once
        reset_hash(&mut bus);
        assert_eq!(table(&bus), (0, 0));
    }

    #[test]
    fn index_maps_to_the_right_register() {
        let mut seen_hi = false;
        let mut seen_lo = false;

        for i in 0u8..=63 {
            let mac = [0x01, 0x00, 0x5E, 0x7F, 0x00, i];
            let hash = hash_index(&mac);
            assert!(hash < 64);

            let mut bus = SimBus::new();
            set_hash(&mut bus, &mac);
            let (hash0, hash1) = table(&bus);
            if hash > 31 {
                assert_eq!(hash0, 1 << (hash - 32));
                assert_eq!(hash1, 0);
                seen_hi = true;
            } else {
                assert_eq!(hash1, 1 << hash);
                assert_eq!(hash0, 0);
                seen_lo = true;
            }
        }

        // 64 addresses should exercise both halves of the table
        assert!(seen_hi && seen_lo);
    }
}
