//! Test support: an in-memory register window that plays the hardware side
//! of the command handshakes.

use bit_field::BitField;

use crate::regs::{self, RegisterBus};

/// Covers the whole register window (`0x0000..0xd000`).
pub(crate) const FAKE_WINDOW: usize = 0xd000;

pub(crate) struct FakeBus {
    pub mem: Vec<u32>,
    /// Every write issued through the bus, in order.
    pub writes: Vec<(usize, u32)>,
    /// Complete endpoint commands by clearing CMDACT on write.
    pub auto_clear_cmdact: bool,
    /// Status the fake "hardware" reports for endpoint commands.
    pub cmd_status: u8,
    pub auto_clear_dgcmd: bool,
    pub dgcmd_status: u8,
    /// Let DCTL.CSFTRST self-clear.
    pub auto_clear_csftrst: bool,
    /// Mirror RUN_STOP into DSTS.DEVCTRLHLT.
    pub halt_on_stop: bool,
    /// Reflect DCTL.ULSTCHNGREQ into DSTS.USBLNKST.
    pub link_follow_request: bool,
    /// Resource index handed out by completed start-transfer commands.
    pub resource_index: u8,
}

fn is_depcmd(offset: usize) -> bool {
    (0xc800..0xca00).contains(&offset) && offset % 0x10 == 0x0c
}

impl FakeBus {
    pub fn new() -> Self {
        let mut bus = Self {
            mem: vec![0; FAKE_WINDOW / 4],
            writes: Vec::new(),
            auto_clear_cmdact: true,
            cmd_status: 0,
            auto_clear_dgcmd: true,
            dgcmd_status: 0,
            auto_clear_csftrst: true,
            halt_on_stop: true,
            link_follow_request: true,
            resource_index: 0x11,
        };
        // A plausible dual-role usb3 core: 3.00a, 8 endpoints (4 IN),
        // halted device controller.
        bus.seed(regs::GSNPSID, 0x5533_300a);
        bus.seed(regs::ghwparams(0), 2);
        bus.seed(regs::ghwparams(3), (4 << 18) | (8 << 12));
        bus.seed(regs::DSTS, 1 << 22);
        bus
    }

    pub fn seed(&mut self, offset: usize, value: u32) {
        self.mem[offset / 4] = value;
    }

    /// Last value written to `offset`, if any.
    pub fn last_write(&self, offset: usize) -> Option<u32> {
        self.writes
            .iter()
            .rev()
            .find(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
    }

    pub fn write_count(&self, offset: usize) -> usize {
        self.writes.iter().filter(|(o, _)| *o == offset).count()
    }
}

impl RegisterBus for FakeBus {
    fn read(&self, offset: usize) -> u32 {
        self.mem[offset / 4]
    }

    fn write(&mut self, offset: usize, value: u32) {
        self.writes.push((offset, value));
        let mut store = value;

        if is_depcmd(offset) && self.auto_clear_cmdact && value.get_bit(10) {
            store.set_bit(10, false);
            store.set_bits(12..=15, u32::from(self.cmd_status));
            // Start-transfer hands back a transfer resource index.
            if value.get_bits(0..=3) == 6 && self.cmd_status == 0 {
                store.set_bits(16..=22, u32::from(self.resource_index));
            }
        } else if offset == regs::DGCMD && self.auto_clear_dgcmd && value.get_bit(10) {
            store.set_bit(10, false);
            store.set_bits(12..=15, u32::from(self.dgcmd_status));
        } else if offset == regs::DCTL {
            if value.get_bit(30) && self.auto_clear_csftrst {
                store.set_bit(30, false);
            }
            if self.halt_on_stop {
                let mut dsts = self.mem[regs::DSTS / 4];
                dsts.set_bit(22, !value.get_bit(31));
                self.mem[regs::DSTS / 4] = dsts;
            }
            if self.link_follow_request {
                let req = value.get_bits(5..=8);
                if req != 0 {
                    let mut dsts = self.mem[regs::DSTS / 4];
                    dsts.set_bits(18..=21, req);
                    self.mem[regs::DSTS / 4] = dsts;
                }
            }
        } else if offset == regs::gevntcount(0) {
            // Writing N tells hardware N bytes were consumed.
            let cur = self.mem[offset / 4];
            self.mem[offset / 4] = cur.saturating_sub(value);
            return;
        } else if offset == regs::OEVT {
            // Write-1-to-clear.
            self.mem[offset / 4] &= !value;
            return;
        }

        self.mem[offset / 4] = store;
    }
}
