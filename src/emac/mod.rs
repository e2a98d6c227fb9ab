//! The H3 EMAC: MAC bring-up and DMA descriptor ring management.
//!
//! All register traffic goes through [`EmacBus`], so the same driver code
//! runs against the memory-mapped peripheral on the SoC and against a plain
//! register file in tests. The RX/TX descriptor rings and their packet
//! buffers live in one coherent memory region owned exclusively by [`Emac`]
//! after `start`; the region is built once and never reallocated.

pub mod multicast;
pub mod phy;

use self::phy::{Link, MacAddressSource, Phy, PhyStatus};

/// The internal PHY sits at MDIO address 1.
pub const PHY_ADDRESS: u8 = 1;

/// Nominal physical base of the cache-coherent DMA region.
pub const MEM_COHERENT_REGION: u32 = 0x4BE0_0000;

pub const RX_DESC_COUNT: usize = 32;
pub const TX_DESC_COUNT: usize = 32;
pub const ETH_BUFSIZE: u32 = 2048;
pub const ETH_RXSIZE: u32 = 2044;

const DESC_SIZE: u32 = 16;

/// DMA descriptor ownership bit: set means the hardware owns it.
pub const DESC_STATUS_OWN: u32 = 1 << 31;

pub const CTL0_DUPLEX_FULL: u32 = 1 << 0;
pub const CTL0_SPEED_MASK: u32 = 0x3 << 2;
pub const CTL0_SPEED_10M: u32 = 0x2 << 2;
pub const CTL0_SPEED_100M: u32 = 0x3 << 2;

pub const RX_CTL0_RX_EN: u32 = 1 << 31;
pub const RX_CTL1_RX_DMA_EN: u32 = 1 << 30;
pub const TX_CTL0_TX_EN: u32 = 1 << 31;
pub const TX_CTL1_TX_DMA_EN: u32 = 1 << 30;

pub const RX_FRM_FLT_RX_ALL_MULTICAST: u32 = 1 << 16;
pub const RX_FRM_FLT_HASH_MULTICAST: u32 = 1 << 9;

const BUS_SOFT_RESET2_EPHY_RST: u32 = 1 << 2;
const BUS_CLK_GATING4_EPHY_GATING: u32 = 1 << 0;

const EPHY_DEFAULT_VALUE: u32 = 0x0005_8000;
const EPHY_DEFAULT_MASK: u32 = 0xFFFF_8000;
const EPHY_ADDR_SHIFT: u32 = 20;
const EPHY_SHUTDOWN: u32 = 1 << 16;
const EPHY_SELECT: u32 = 1 << 15;

/// Every register the driver touches, EMAC block plus the CCU/SYSCON words
/// used during cold configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(usize)]
pub enum Reg {
    Ctl0,
    TxCtl0,
    TxCtl1,
    TxDmaDesc,
    RxCtl0,
    RxCtl1,
    RxDmaDesc,
    RxFrmFlt,
    RxHash0,
    RxHash1,
    IntSta,
    // CCU / system control
    BusSoftReset2,
    BusClkGating4,
    EmacClk,
}

const REG_COUNT: usize = Reg::EmacClk as usize + 1;

/// Register access seam. Implementations must not reorder or cache accesses;
/// the MMIO implementation uses volatile reads/writes for that reason.
pub trait EmacBus {
    fn read(&self, reg: Reg) -> u32;
    fn write(&mut self, reg: Reg, value: u32);

    /// Busy-wait used by the cold configuration path.
    fn delay_us(&mut self, _us: u32) {}
}

/// A plain register file standing in for the hardware, for tests.
#[derive(Debug, Default)]
pub struct SimBus {
    regs: [u32; REG_COUNT],
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmacBus for SimBus {
    fn read(&self, reg: Reg) -> u32 {
        self.regs[reg as usize]
    }

    fn write(&mut self, reg: Reg, value: u32) {
        self.regs[reg as usize] = value;
    }
}

/// Volatile MMIO access to the live peripherals.
///
/// # Safety
/// Only meaningful on the SoC itself, with the EMAC/CCU/SYSCON blocks mapped
/// at the supplied bases.
pub struct MmioBus {
    emac_base: usize,
    ccu_base: usize,
    syscon_base: usize,
}

impl MmioBus {
    /// H3 physical bases: EMAC 0x01C30000, CCU 0x01C20000, SYSCON 0x01C00000.
    ///
    /// # Safety
    /// The caller must guarantee the addresses are valid MMIO mappings.
    pub unsafe fn new(emac_base: usize, ccu_base: usize, syscon_base: usize) -> Self {
        Self {
            emac_base,
            ccu_base,
            syscon_base,
        }
    }

    fn addr(&self, reg: Reg) -> usize {
        match reg {
            Reg::Ctl0 => self.emac_base + 0x00,
            Reg::TxCtl0 => self.emac_base + 0x10,
            Reg::TxCtl1 => self.emac_base + 0x14,
            Reg::TxDmaDesc => self.emac_base + 0x20,
            Reg::RxCtl0 => self.emac_base + 0x24,
            Reg::RxCtl1 => self.emac_base + 0x28,
            Reg::RxDmaDesc => self.emac_base + 0x34,
            Reg::RxFrmFlt => self.emac_base + 0x38,
            Reg::RxHash0 => self.emac_base + 0x40,
            Reg::RxHash1 => self.emac_base + 0x44,
            Reg::IntSta => self.emac_base + 0x08,
            Reg::BusSoftReset2 => self.ccu_base + 0x2C8,
            Reg::BusClkGating4 => self.ccu_base + 0x70,
            Reg::EmacClk => self.syscon_base + 0x30,
        }
    }
}

impl EmacBus for MmioBus {
    fn read(&self, reg: Reg) -> u32 {
        unsafe { std::ptr::read_volatile(self.addr(reg) as *const u32) }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        unsafe { std::ptr::write_volatile(self.addr(reg) as *mut u32, value) }
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(std::time::Duration::from_micros(us.into()));
    }
}

/// One DMA descriptor, hardware field order.
#[derive(Debug, Default, Copy, Clone)]
#[repr(C)]
pub struct DmaDesc {
    pub status: u32,
    pub st: u32,
    pub buf_addr: u32,
    pub next: u32,
}

/// The coherent region: both descriptor chains and their packet buffers,
/// with link addresses computed from a fixed base by index.
#[derive(Debug)]
pub struct CoherentRegion {
    base: u32,
    pub rx_chain: Vec<DmaDesc>,
    pub tx_chain: Vec<DmaDesc>,
    rx_buffers: Vec<u8>,
    tx_buffers: Vec<u8>,
    pub rx_curr: usize,
    pub tx_curr: usize,
}

impl CoherentRegion {
    fn new(base: u32, rx_count: usize, tx_count: usize) -> Self {
        Self {
            base,
            rx_chain: vec![DmaDesc::default(); rx_count],
            tx_chain: vec![DmaDesc::default(); tx_count],
            rx_buffers: vec![0; rx_count * ETH_BUFSIZE as usize],
            tx_buffers: vec![0; tx_count * ETH_BUFSIZE as usize],
            rx_curr: 0,
            tx_curr: 0,
        }
    }

    pub fn rx_desc_addr(&self, index: usize) -> u32 {
        self.base + index as u32 * DESC_SIZE
    }

    pub fn tx_desc_addr(&self, index: usize) -> u32 {
        self.base + (self.rx_chain.len() + index) as u32 * DESC_SIZE
    }

    fn buffers_base(&self) -> u32 {
        self.base + (self.rx_chain.len() + self.tx_chain.len()) as u32 * DESC_SIZE
    }

    pub fn rx_buf_addr(&self, index: usize) -> u32 {
        self.buffers_base() + index as u32 * ETH_BUFSIZE
    }

    pub fn tx_buf_addr(&self, index: usize) -> u32 {
        self.buffers_base() + (self.rx_chain.len() + index) as u32 * ETH_BUFSIZE
    }

    /// Map a descriptor link address back to an RX ring index.
    pub fn rx_index_of(&self, addr: u32) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let index = (offset / DESC_SIZE) as usize;
        (offset % DESC_SIZE == 0 && index < self.rx_chain.len()).then_some(index)
    }

    /// Map a descriptor link address back to a TX ring index.
    pub fn tx_index_of(&self, addr: u32) -> Option<usize> {
        let offset = addr.checked_sub(self.tx_desc_addr(0))?;
        let index = (offset / DESC_SIZE) as usize;
        (offset % DESC_SIZE == 0 && index < self.tx_chain.len()).then_some(index)
    }

    pub fn rx_buffer(&self, index: usize) -> &[u8] {
        let size = ETH_BUFSIZE as usize;
        &self.rx_buffers[index * size..][..size]
    }

    pub fn tx_buffer_mut(&mut self, index: usize) -> &mut [u8] {
        let size = ETH_BUFSIZE as usize;
        &mut self.tx_buffers[index * size..][..size]
    }
}

/// The MAC driver proper.
pub struct Emac<B: EmacBus> {
    bus: B,
    region: Option<CoherentRegion>,
    rx_desc_count: usize,
    tx_desc_count: usize,
}

impl<B: EmacBus> Emac<B> {
    pub fn new(bus: B) -> Self {
        Self::with_ring_sizes(bus, RX_DESC_COUNT, TX_DESC_COUNT)
    }

    pub fn with_ring_sizes(bus: B, rx_desc_count: usize, tx_desc_count: usize) -> Self {
        assert!(rx_desc_count > 0 && tx_desc_count > 0);
        Self {
            bus,
            region: None,
            rx_desc_count,
            tx_desc_count,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn region(&self) -> Option<&CoherentRegion> {
        self.region.as_ref()
    }

    /// One-time cold path: pulse the EPHY reset and clock gate, program the
    /// internal PHY's address/power/select bits, then hand over to the PHY
    /// driver's own configuration.
    pub fn config<P: Phy>(&mut self, phy: &mut P) -> anyhow::Result<()> {
        let reset = self.bus.read(Reg::BusSoftReset2);
        self.bus.write(Reg::BusSoftReset2, reset | BUS_SOFT_RESET2_EPHY_RST);
        self.bus.delay_us(1000);

        let gating = self.bus.read(Reg::BusClkGating4);
        self.bus
            .write(Reg::BusClkGating4, gating & !BUS_CLK_GATING4_EPHY_GATING);
        self.bus.delay_us(1000);

        let gating = self.bus.read(Reg::BusClkGating4);
        self.bus
            .write(Reg::BusClkGating4, gating | BUS_CLK_GATING4_EPHY_GATING);

        // The internal 100 Mbit PHY must be selected and powered up before use
        let mut value = self.bus.read(Reg::EmacClk);
        value &= !EPHY_DEFAULT_MASK;
        value |= EPHY_DEFAULT_VALUE;
        value |= u32::from(PHY_ADDRESS) << EPHY_ADDR_SHIFT;
        value &= !EPHY_SHUTDOWN;
        value |= EPHY_SELECT;
        self.bus.write(Reg::EmacClk, value);

        phy.config(PHY_ADDRESS)
    }

    /// Bring the MAC up: fetch the burned-in address, start the PHY from the
    /// safe Half/10 default, apply the resulting status, build both
    /// descriptor rings and enable DMA and MAC engines.
    ///
    /// Calling this twice is a programming error and panics: the coherent
    /// region must not be rebuilt while hardware may still reference it.
    pub fn start<P: Phy, M: MacAddressSource>(
        &mut self,
        phy: &mut P,
        mac_source: &M,
    ) -> anyhow::Result<([u8; 6], Link)> {
        assert!(
            self.region.is_none(),
            "EMAC started twice; coherent region already initialized"
        );

        let mac_address = mac_source.mac_address();

        let mut phy_status = PhyStatus::safe_default();
        phy.start(PHY_ADDRESS, &mut phy_status)?;
        let link = phy_status.link;

        self.adjust_link(phy_status);

        self.region = Some(CoherentRegion::new(
            MEM_COHERENT_REGION,
            self.rx_desc_count,
            self.tx_desc_count,
        ));

        // Quiesce both engines before touching the descriptor chains
        let value = self.bus.read(Reg::RxCtl0);
        self.bus.write(Reg::RxCtl0, value & !RX_CTL0_RX_EN);
        let value = self.bus.read(Reg::TxCtl0);
        self.bus.write(Reg::TxCtl0, value & !TX_CTL0_TX_EN);
        let value = self.bus.read(Reg::TxCtl1);
        self.bus.write(Reg::TxCtl1, value & !TX_CTL1_TX_DMA_EN);
        let value = self.bus.read(Reg::RxCtl1);
        self.bus.write(Reg::RxCtl1, value & !RX_CTL1_RX_DMA_EN);

        self.rx_descs_init();
        self.tx_descs_init();

        self.bus.write(Reg::RxFrmFlt, RX_FRM_FLT_RX_ALL_MULTICAST);

        // Re-enable in order: RX DMA, TX DMA, RX MAC, TX MAC
        let value = self.bus.read(Reg::RxCtl1);
        self.bus.write(Reg::RxCtl1, value | RX_CTL1_RX_DMA_EN);
        let value = self.bus.read(Reg::TxCtl1);
        self.bus.write(Reg::TxCtl1, value | TX_CTL1_TX_DMA_EN);
        let value = self.bus.read(Reg::RxCtl0);
        self.bus.write(Reg::RxCtl0, value | RX_CTL0_RX_EN);
        let value = self.bus.read(Reg::TxCtl0);
        self.bus.write(Reg::TxCtl0, value | TX_CTL0_TX_EN);

        Ok((mac_address, link))
    }

    /// Reprogram the MAC control register for the PHY's current duplex and
    /// speed. Idempotent; called at start and again on every link event.
    pub fn adjust_link(&mut self, status: PhyStatus) {
        eprintln!(
            "Link {}, {}, {}",
            match status.link {
                Link::Up => "Up",
                Link::Down => "Down",
            },
            match status.speed {
                phy::Speed::Speed10 => 10,
                phy::Speed::Speed100 => 100,
            },
            match status.duplex {
                phy::Duplex::Half => "HALF",
                phy::Duplex::Full => "FULL",
            }
        );

        let mut value = self.bus.read(Reg::Ctl0);

        if status.duplex == phy::Duplex::Full {
            value |= CTL0_DUPLEX_FULL;
        } else {
            value &= !CTL0_DUPLEX_FULL;
        }

        value &= !CTL0_SPEED_MASK;
        value |= match status.speed {
            phy::Speed::Speed10 => CTL0_SPEED_10M,
            phy::Speed::Speed100 => CTL0_SPEED_100M,
        };

        self.bus.write(Reg::Ctl0, value);
    }

    fn rx_descs_init(&mut self) {
        let region = self.region.as_mut().unwrap();

        let count = region.rx_chain.len();
        for index in 0..count {
            let buf_addr = region.rx_buf_addr(index);
            let next = region.rx_desc_addr((index + 1) % count);
            region.rx_chain[index] = DmaDesc {
                status: DESC_STATUS_OWN,
                st: ETH_RXSIZE,
                buf_addr,
                next,
            };
        }
        region.rx_curr = 0;

        let base = region.rx_desc_addr(0);
        self.bus.write(Reg::RxDmaDesc, base);
    }

    fn tx_descs_init(&mut self) {
        let region = self.region.as_mut().unwrap();

        let count = region.tx_chain.len();
        for index in 0..count {
            let buf_addr = region.tx_buf_addr(index);
            let next = region.tx_desc_addr((index + 1) % count);
            region.tx_chain[index] = DmaDesc {
                status: DESC_STATUS_OWN,
                st: 0,
                buf_addr,
                next,
            };
        }
        region.tx_curr = 0;

        let base = region.tx_desc_addr(0);
        self.bus.write(Reg::TxDmaDesc, base);
    }
}


#[cfg(test)]
mod tests {
    use super::phy::{Duplex, Link, PhyStatus, Speed};
    use super::testutil::{FixedMac, SimPhy};
    use super::*;

    const TEST_MAC: [u8; 6] = [0x02, 0x00, 0x1A, 0x2B, 0x3C, 0x4D];

    fn started_emac(rx: usize, tx: usize) -> Emac<SimBus> {
        let mut emac = Emac::with_ring_sizes(SimBus::new(), rx, tx);
        let (mac, link) = emac
            .start(&mut SimPhy::default(), &FixedMac(TEST_MAC))
            .unwrap();
        assert_eq!(mac, TEST_MAC);
        assert_eq!(link, Link::Up);
        emac
    }

    #[test]
    fn rings_are_circular() {
        // Different N per ring on purpose
        let emac = started_emac(8, 4);
        let region = emac.region().unwrap();

        // RX: the descriptor-base register points at index 0; following
        // `next` exactly N times returns to the start.
        let start = emac.bus().read(Reg::RxDmaDesc);
        assert_eq!(region.rx_index_of(start), Some(0));
        let mut addr = start;
        for _ in 0..8 {
            let index = region.rx_index_of(addr).unwrap();
            addr = region.rx_chain[index].next;
        }
        assert_eq!(addr, start);

        let start = emac.bus().read(Reg::TxDmaDesc);
        assert_eq!(region.tx_index_of(start), Some(0));
        let mut addr = start;
        for _ in 0..4 {
            let index = region.tx_index_of(addr).unwrap();
            addr = region.tx_chain[index].next;
        }
        assert_eq!(addr, start);
    }

    #[test]
    fn descriptors_carry_buffer_addresses_and_ownership() {
        let emac = started_emac(8, 4);
        let region = emac.region().unwrap();

        for (index, desc) in region.rx_chain.iter().enumerate() {
            assert_eq!(desc.buf_addr, region.rx_buf_addr(index));
            // Literal on purpose: the advertised RX frame size must be 2044.
            assert_eq!(desc.st, 2044);
            assert_ne!(desc.status & DESC_STATUS_OWN, 0);
        }
        for (index, desc) in region.tx_chain.iter().enumerate() {
            assert_eq!(desc.buf_addr, region.tx_buf_addr(index));
            assert_eq!(desc.st, 0);
        }
        assert_eq!(region.rx_curr, 0);
        assert_eq!(region.tx_curr, 0);
    }

    #[test]
    fn start_enables_engines_and_multicast_accept() {
        let emac = started_emac(8, 4);
        let bus = emac.bus();

        assert_ne!(bus.read(Reg::RxCtl0) & RX_CTL0_RX_EN, 0);
        assert_ne!(bus.read(Reg::TxCtl0) & TX_CTL0_TX_EN, 0);
        assert_ne!(bus.read(Reg::RxCtl1) & RX_CTL1_RX_DMA_EN, 0);
        assert_ne!(bus.read(Reg::TxCtl1) & TX_CTL1_TX_DMA_EN, 0);
        assert_eq!(bus.read(Reg::RxFrmFlt), RX_FRM_FLT_RX_ALL_MULTICAST);
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn double_start_is_fatal() {
        let mut emac = started_emac(4, 4);
        let _ = emac.start(&mut SimPhy::default(), &FixedMac(TEST_MAC));
    }

    #[test]
    fn adjust_link_is_idempotent() {
        let mut emac = Emac::new(SimBus::new());

        let full100 = PhyStatus {
            link: Link::Up,
            speed: Speed::Speed100,
            duplex: Duplex::Full,
        };
        emac.adjust_link(full100);
        let once = emac.bus().read(Reg::Ctl0);
        emac.adjust_link(full100);
        assert_eq!(emac.bus().read(Reg::Ctl0), once);

        assert_ne!(once & CTL0_DUPLEX_FULL, 0);
        assert_eq!(once & CTL0_SPEED_MASK, CTL0_SPEED_100M);

        emac.adjust_link(PhyStatus {
            link: Link::Up,
            speed: Speed::Speed10,
            duplex: Duplex::Half,
        });
        let value = emac.bus().read(Reg::Ctl0);
        assert_eq!(value & CTL0_DUPLEX_FULL, 0);
        assert_eq!(value & CTL0_SPEED_MASK, CTL0_SPEED_10M);
    }

    #[test]
    fn config_programs_the_internal_phy() {
        let mut emac = Emac::new(SimBus::new());
        let mut phy = SimPhy::default();
        emac.config(&mut phy).unwrap();
        assert!(phy.configured);

        let clk = emac.bus().read(Reg::EmacClk);
        assert_ne!(clk & EPHY_SELECT, 0);
        assert_eq!(clk & EPHY_SHUTDOWN, 0);
        assert_eq!(
            (clk >> EPHY_ADDR_SHIFT) & 0x1F,
            u32::from(PHY_ADDRESS),
            "PHY address field"
        );
        // Clock gate ends up enabled after the reset pulse
        assert_ne!(
            emac.bus().read(Reg::BusClkGating4) & BUS_CLK_GATING4_EPHY_GATING,
            0
        );
    }
}
