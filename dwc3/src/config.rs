//! Immutable controller configuration and the hardware parameter snapshot.
//!
//! Everything the platform decides up front lives in [`Config`]; everything
//! the silicon reports about itself lives in [`HwParams`]. Runtime state
//! belongs to the controller, not here.

use crate::regs::{RegisterBus, Regs};

/// Requested mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrMode {
    Host,
    Peripheral,
    /// Dual-role; the arbiter picks host or device from the id/session pins.
    Otg,
}

auto_repr_tryfrom! {
    /// Bus speed, in the encoding shared by DCFG.SPEED and DSTS.CONNECTSPD.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Speed: u8 {
        High = 0,
        Full = 1,
        Low = 2,
        Super = 4,
        SuperPlus = 5,
    }
}

impl Speed {
    /// Control-endpoint max packet size mandated for this speed.
    pub fn ep0_max_packet_size(self) -> u16 {
        match self {
            Speed::Super | Speed::SuperPlus => 512,
            Speed::High | Speed::Full => 64,
            Speed::Low => 8,
        }
    }

    pub fn is_superspeed(self) -> bool {
        matches!(self, Speed::Super | Speed::SuperPlus)
    }
}

/// Configuration assembled once by the platform before bring-up.
///
/// Quirk toggles are named after the erratum behavior they switch; the core
/// logic only ever consults them, it never mutates them.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub dr_mode: DrMode,
    pub maximum_speed: Speed,
    /// Interrupt moderation interval in 250 ns units, 0 to disable.
    pub imod_interval: u16,
    /// Advertise Link Power Management capability.
    pub lpm_capable: bool,
    /// HIRD threshold programmed on high-speed connect when LPM is on.
    pub hird_threshold: u8,
    /// Set up hibernation scratchpad buffers when the core supports them.
    pub hibernation: bool,
    /// Keep U1/U2 low-power entry disabled in SuperSpeed mode.
    pub u1u2_disable: bool,
    pub disable_scramble_quirk: bool,
    pub u2exit_lfps_quirk: bool,
    pub disable_clk_gating: bool,
    /// Skip the metastability workaround that forces SuperSpeed enumeration
    /// on affected core revisions.
    pub dis_metastability_quirk: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dr_mode: DrMode::Otg,
            maximum_speed: Speed::Super,
            imod_interval: 0,
            lpm_capable: false,
            hird_threshold: 0,
            hibernation: false,
            u1u2_disable: false,
            disable_scramble_quirk: false,
            u2exit_lfps_quirk: false,
            disable_clk_gating: false,
            dis_metastability_quirk: false,
        }
    }
}

/// Copy of the GHWPARAMS registers, taken once at probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct HwParams {
    pub hwparams0: u32,
    pub hwparams1: u32,
    pub hwparams2: u32,
    pub hwparams3: u32,
    pub hwparams4: u32,
    pub hwparams5: u32,
    pub hwparams6: u32,
    pub hwparams7: u32,
    pub hwparams8: u32,
}

impl HwParams {
    pub fn read<B: RegisterBus>(regs: &Regs<B>) -> Self {
        Self {
            hwparams0: regs.ghwparams(0),
            hwparams1: regs.ghwparams(1),
            hwparams2: regs.ghwparams(2),
            hwparams3: regs.ghwparams(3),
            hwparams4: regs.ghwparams(4),
            hwparams5: regs.ghwparams(5),
            hwparams6: regs.ghwparams(6),
            hwparams7: regs.ghwparams(7),
            hwparams8: regs.ghwparams(8),
        }
    }

    /// Synthesis-time operating mode: 0 device-only, 1 host-only, 2 dual-role.
    pub fn mode(&self) -> u8 {
        (self.hwparams0 & 0x7) as u8
    }

    /// Master bus data width in bits.
    pub fn mdwidth(&self) -> u8 {
        ((self.hwparams0 >> 8) & 0xff) as u8
    }

    /// Power optimization level: 0 none, 1 clock gating, 2 hibernation.
    pub fn en_pwropt(&self) -> u8 {
        ((self.hwparams1 >> 24) & 0x3) as u8
    }

    pub fn has_hibernation(&self) -> bool {
        self.en_pwropt() == 2
    }

    /// Number of device-mode endpoints, both directions included.
    pub fn num_eps(&self) -> u8 {
        ((self.hwparams3 >> 12) & 0x3f) as u8
    }

    pub fn num_in_eps(&self) -> u8 {
        ((self.hwparams3 >> 18) & 0x1f) as u8
    }

    /// Number of hibernation scratchpad buffers the core expects.
    pub fn num_scratch_buffers(&self) -> u8 {
        ((self.hwparams4 >> 13) & 0xf) as u8
    }

    /// RAM1 depth, the basis for TX FIFO sizing.
    pub fn ram1_depth(&self) -> u16 {
        (self.hwparams7 & 0xffff) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwparams_field_extraction() {
        let p = HwParams {
            hwparams0: 0x0000_2a02, // mode 2 (dual-role), mdwidth 42
            hwparams1: 0x02 << 24,  // hibernation power optimization
            hwparams3: (9 << 18) | (18 << 12),
            hwparams4: 4 << 13,
            hwparams7: 0x1234_8086,
            ..Default::default()
        };
        assert_eq!(p.mode(), 2);
        assert_eq!(p.mdwidth(), 42);
        assert!(p.has_hibernation());
        assert_eq!(p.num_eps(), 18);
        assert_eq!(p.num_in_eps(), 9);
        assert_eq!(p.num_scratch_buffers(), 4);
        assert_eq!(p.ram1_depth(), 0x8086);
    }

    #[test]
    fn speed_ep0_packet_sizes() {
        assert_eq!(Speed::Super.ep0_max_packet_size(), 512);
        assert_eq!(Speed::SuperPlus.ep0_max_packet_size(), 512);
        assert_eq!(Speed::High.ep0_max_packet_size(), 64);
        assert_eq!(Speed::Low.ep0_max_packet_size(), 8);
        assert_eq!(Speed::try_from(4u8), Ok(Speed::Super));
        assert_eq!(Speed::try_from(7u8), Err(7));
    }
}
