//! The PHY collaborator contract.
//!
//! The PHY is negotiated separately from the MAC; the MAC driver only
//! consumes the resulting status, at start and again on every link change.

/// Link state as last reported by the PHY.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Link {
    Up,
    Down,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Speed {
    Speed10,
    Speed100,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Duplex {
    Half,
    Full,
}

/// The transient value handed to `adjust_link` on every link event. Nothing
/// stores it beyond the call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PhyStatus {
    pub link: Link,
    pub speed: Speed,
    pub duplex: Duplex,
}

impl PhyStatus {
    /// The safe pre-negotiation default the MAC starts with.
    pub fn safe_default() -> Self {
        Self {
            link: Link::Down,
            speed: Speed::Speed10,
            duplex: Duplex::Half,
        }
    }
}

/// An Ethernet PHY transceiver driver.
pub trait Phy {
    /// One-time PHY configuration, run from the MAC's cold path.
    fn config(&mut self, address: u8) -> anyhow::Result<()>;

    /// Start the PHY. `status` carries the caller's safe default in and the
    /// negotiated (or still-negotiating) state out.
    fn start(&mut self, address: u8, status: &mut PhyStatus) -> anyhow::Result<()>;
}

/// Source of the board's burned-in hardware address.
pub trait MacAddressSource {
    fn mac_address(&self) -> [u8; 6];
}
