//! Register interface of the DRD core.
//!
//! The controller exposes one flat window of 32-bit little-endian registers,
//! partitioned into global (`0xc100..`), device (`0xc700..`), per-endpoint
//! command (`0xc800..`) and OTG (`0xcc00..`) blocks. All offsets here are
//! byte offsets from the controller base.
//!
//! Multi-bit fields are only ever touched through the typed wrappers below;
//! raw `u32` reads/writes exist for snapshot registers (GHWPARAMS, GSNPSID)
//! and the event-buffer address pair.

use core::ptr::NonNull;

use crate::error::{Error, Result};

/* Global registers */
pub const GSBUSCFG0: usize = 0xc100;
pub const GSBUSCFG1: usize = 0xc104;
pub const GTXTHRCFG: usize = 0xc108;
pub const GRXTHRCFG: usize = 0xc10c;
pub const GCTL: usize = 0xc110;
pub const GEVTEN: usize = 0xc114;
pub const GSTS: usize = 0xc118;
pub const GSNPSID: usize = 0xc120;
pub const GGPIO: usize = 0xc124;
pub const GUID: usize = 0xc128;
pub const GUCTL: usize = 0xc12c;
pub const GBUSERRADDR0: usize = 0xc130;
pub const GBUSERRADDR1: usize = 0xc134;

pub const fn ghwparams(n: usize) -> usize {
    // GHWPARAMS0..7 are contiguous; GHWPARAMS8 sits apart.
    if n < 8 {
        0xc140 + n * 0x04
    } else {
        0xc600
    }
}

pub const fn gevntadrlo(n: usize) -> usize {
    0xc400 + n * 0x10
}
pub const fn gevntadrhi(n: usize) -> usize {
    0xc404 + n * 0x10
}
pub const fn gevntsiz(n: usize) -> usize {
    0xc408 + n * 0x10
}
pub const fn gevntcount(n: usize) -> usize {
    0xc40c + n * 0x10
}

/* Device registers */
pub const DCFG: usize = 0xc700;
pub const DCTL: usize = 0xc704;
pub const DEVTEN: usize = 0xc708;
pub const DSTS: usize = 0xc70c;
pub const DGCMDPAR: usize = 0xc710;
pub const DGCMD: usize = 0xc714;
pub const DALEPENA: usize = 0xc720;

pub const fn dev_imod(n: usize) -> usize {
    0xca00 + n * 0x04
}

/* Per-endpoint command block: three parameter words plus the command word */
pub const fn dep_base(ep: u8) -> usize {
    0xc800 + (ep as usize) * 0x10
}
pub const DEPCMDPAR2: usize = 0x00;
pub const DEPCMDPAR1: usize = 0x04;
pub const DEPCMDPAR0: usize = 0x08;
pub const DEPCMD: usize = 0x0c;

/* OTG registers */
pub const OCFG: usize = 0xcc00;
pub const OCTL: usize = 0xcc04;
pub const OEVT: usize = 0xcc08;
pub const OEVTEN: usize = 0xcc0c;
pub const OSTS: usize = 0xcc10;

/// Raw access to the register window.
///
/// The production implementation is [`Mmio`]; tests substitute an in-memory
/// fake that emulates the command handshakes.
pub trait RegisterBus {
    fn read(&self, offset: usize) -> u32;
    fn write(&mut self, offset: usize, value: u32);
}

/// Volatile accessor over the memory-mapped window.
#[derive(Debug)]
pub struct Mmio {
    base: NonNull<u8>,
}

impl Mmio {
    /// # Safety
    /// `base` must point at the controller's register window, mapped
    /// uncached for at least `0xcd00` bytes, and this must be the only
    /// access path to it.
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }
}

// The raw pointer is the only non-Send member and access is serialized by
// the controller lock.
unsafe impl Send for Mmio {}

impl RegisterBus for Mmio {
    fn read(&self, offset: usize) -> u32 {
        unsafe { (self.base.as_ptr().add(offset) as *const u32).read_volatile() }
    }

    fn write(&mut self, offset: usize, value: u32) {
        unsafe { (self.base.as_ptr().add(offset) as *mut u32).write_volatile(value) }
    }
}

auto_unit_from! {
    /// Global Core Control Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gctl(u32)
}
impl Gctl {
    pub const PRTCAP_HOST: u8 = 1;
    pub const PRTCAP_DEVICE: u8 = 2;
    pub const PRTCAP_OTG: u8 = 3;

    rw_bit!(0, dsblclkgtng, "Disable clock gating.");
    rw_bit!(1, gblhibernationen, "Global hibernation enable.");
    rw_bit!(2, u2exit_lfps, "Exit U2 by LFPS only.");
    rw_bit!(3, disscramble, "Disable SuperSpeed scrambling.");
    rw_bits!(4..=5, scaledown, u8, "Simulation scale-down mode.");
    rw_bits!(6..=7, ramclksel, u8, "RAM clock select.");
    rw_bit!(10, sofitpsync, "Synchronize ITP to the reference clock.");
    rw_bit!(11, coresoftreset, "Core soft reset (PHY domain).");
    rw_bits!(12..=13, prtcapdir, u8, "Port capability direction: 1 host, 2 device, 3 OTG.");
    rw_bit!(16, u2rstecn, "U2 reset exit workaround for older cores.");
    rw_bits!(19..=31, pwrdnscale, u16, "Power-down scale for the suspend clock.");
}

auto_unit_from! {
    /// Global Status Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gsts(u32)
}
impl Gsts {
    get_bits!(0..=1, curmod, u8, "Current operating mode.");
    get_bit!(4, buserraddrvld, "Bus error address valid.");
    get_bit!(5, csrtimeout, "Register access timed out.");
    get_bit!(6, device_ip, "Device interrupt pending.");
    get_bit!(7, host_ip, "Host interrupt pending.");
    get_bit!(10, otg_ip, "OTG interrupt pending.");
}

auto_unit_from! {
    /// Per-buffer Global Event Buffer Size Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gevntsiz(u32)
}
impl Gevntsiz {
    rw_bits!(0..=15, size, u16, "Event buffer size in bytes.");
    rw_bit!(31, intmask, "Mask the event interrupt for this buffer.");
}

auto_unit_from! {
    /// Device Configuration Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dcfg(u32)
}
impl Dcfg {
    rw_bits!(0..=2, devspeed, u8, "Maximum device speed (DSTS encoding).");
    rw_bits!(3..=9, devaddr, u8, "USB device address.");
    rw_bits!(12..=16, intrnum, u8, "Interrupter for device events.");
    rw_bits!(17..=21, nump, u8, "Number of receive buffers reported to the host.");
    rw_bit!(22, lpm_cap, "Advertise LPM capability.");
}

auto_unit_from! {
    /// Device Control Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dctl(u32)
}
impl Dctl {
    rw_bits!(1..=4, tstctrl, u8, "USB test mode selector.");
    rw_bits!(5..=8, ulstchngreq, u8, "Link state change request.");
    rw_bit!(9, acceptu1ena, "Accept U1 entry requests.");
    rw_bit!(10, initu1ena, "Initiate U1 entry.");
    rw_bit!(11, acceptu2ena, "Accept U2 entry requests.");
    rw_bit!(12, initu2ena, "Initiate U2 entry.");
    rw_bit!(16, css, "Controller save state.");
    rw_bit!(17, crs, "Controller restore state.");
    rw_bit!(19, keep_connect, "Keep connection on hibernation entry.");
    rw_bits!(24..=28, hird_thres, u8, "HIRD threshold for LPM.");
    rw_bit!(29, lsftrst, "Link soft reset.");
    rw_bit!(30, csftrst, "Core soft reset; self-clearing.");
    rw_bit!(31, run_stop, "Start/stop the device controller.");
}

auto_unit_from! {
    /// Device Event Enable Register. Bit positions match the device event
    /// sub-type ids, except the erratic-error enable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Devten(u32)
}
impl Devten {
    rw_bit!(0, disconnevten);
    rw_bit!(1, usbrsten);
    rw_bit!(2, connectdoneen);
    rw_bit!(3, ulstcngen);
    rw_bit!(4, wkupevten);
    rw_bit!(5, hibernationreqevten);
    rw_bit!(6, eopfen, "End-of-periodic-frame / suspend event enable.");
    rw_bit!(7, sofen);
    rw_bit!(9, errticerren);
    rw_bit!(10, cmdcmplten);
    rw_bit!(11, evntoverflowen);
    rw_bit!(12, vndrdevtstrcveden);
}

auto_unit_from! {
    /// Device Status Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dsts(u32)
}
impl Dsts {
    get_bits!(0..=2, connectspd, u8, "Negotiated connection speed (DCFG encoding).");
    get_bits!(3..=16, soffn, u16, "Current (micro)frame number.");
    get_bit!(17, rxfifoempty, "Receive FIFO is empty.");
    rw_bits!(18..=21, usblnkst, u8, "Current link state.");
    get_bit!(22, devctrlhlt, "Device controller halted.");
    get_bit!(23, coreidle, "Core idle.");
    get_bit!(24, sss, "Save state in progress.");
    get_bit!(25, rss, "Restore state in progress.");
    get_bit!(29, dcnrd, "Device controller not ready.");
}

auto_unit_from! {
    /// Device Generic Command Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dgcmd(u32)
}
impl Dgcmd {
    rw_bits!(0..=7, cmdtyp, u8, "Generic command id.");
    rw_bit!(8, cmdioc, "Interrupt on command completion.");
    rw_bit!(10, cmdact, "Command active; set by software, cleared by hardware.");
    get_bits!(12..=15, cmdstatus, u8, "Completion status, valid once cmdact clears.");
}

auto_unit_from! {
    /// Device Endpoint Command Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Depcmd(u32)
}
impl Depcmd {
    rw_bits!(0..=3, cmdtyp, u8, "Endpoint command id.");
    rw_bit!(8, cmdioc, "Interrupt on command completion.");
    rw_bit!(10, cmdact, "Command active; set by software, cleared by hardware.");
    rw_bit!(11, hipri_forcerm, "High priority / forced removal (end transfer).");
    rw_bit!(11, clearpendin, "Clear pending input (clear stall on newer cores).");
    get_bits!(12..=15, cmdstatus, u8, "Completion status, valid once cmdact clears.");
    rw_bits!(16..=31, param, u16, "Command parameter field.");
    get_bits!(
        16..=22,
        resource_index,
        u8,
        "Transfer resource index returned by a completed start-transfer."
    );
}

auto_unit_from! {
    /// Device interrupt moderation register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DevImod(u32)
}
impl DevImod {
    rw_bits!(0..=15, interval, u16, "Moderation interval in 250 ns units.");
    rw_bits!(16..=31, count, u16, "Moderation down-counter.");
}

auto_unit_from! {
    /// OTG Control Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Octl(u32)
}
impl Octl {
    rw_bit!(0, hstsethnpen);
    rw_bit!(1, devsethnpen);
    rw_bit!(2, termselidpulse);
    rw_bit!(3, sesreq, "Session request.");
    rw_bit!(4, hnpreq, "HNP request.");
    rw_bit!(5, prtpwrctl, "Port power control.");
    rw_bit!(6, perimode, "Peripheral mode select.");
}

auto_unit_from! {
    /// OTG Event Register; write-1-to-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Oevt(u32)
}
impl Oevt {
    rw_bit!(8, bdevvbuschng, "B-device VBUS change detected.");
    rw_bit!(9, bdevsessvlddet, "B-device session valid detected.");
    rw_bit!(24, conidstschng, "Connector id status change detected.");
    get_bit!(31, devicemode, "Core currently in device mode.");
}

auto_unit_from! {
    /// OTG Event Enable Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Oevten(u32)
}
impl Oevten {
    rw_bit!(8, bdevvbuschngen);
    rw_bit!(9, bdevsessvlddeten);
    rw_bit!(24, conidstschngen);
}

auto_unit_from! {
    /// OTG Status Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Osts(u32)
}
impl Osts {
    get_bit!(0, conidsts, "Connector id: false A-plug (host), true B-plug (device).");
    get_bit!(1, vbusvld, "VBUS valid.");
    get_bit!(2, bsesvld, "B-session valid.");
    get_bit!(3, xhciprtpower, "Host port power asserted.");
    get_bit!(4, peripheralstate, "Peripheral state of the OTG block.");
    get_bit!(12, xhcirunstp, "Host run/stop mirrored.");
    get_bit!(13, devrunstp, "Device run/stop mirrored.");
}

/// Identity read from GSNPSID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    raw: u32,
    is_usb31: bool,
}

impl Revision {
    const ID_MASK: u32 = 0xffff_0000;
    const ID_USB3: u32 = 0x5533_0000;
    const ID_USB31: u32 = 0x3331_0000;

    pub fn from_gsnpsid(id: u32) -> Result<Self> {
        match id & Self::ID_MASK {
            Self::ID_USB3 => Ok(Self {
                raw: id,
                is_usb31: false,
            }),
            Self::ID_USB31 => Ok(Self {
                raw: id,
                is_usb31: true,
            }),
            _ => Err(Error::UnknownCoreId(id)),
        }
    }

    pub fn is_usb31(&self) -> bool {
        self.is_usb31
    }

    /// Release number, e.g. `0x190a` for 1.90a.
    pub fn release(&self) -> u16 {
        (self.raw & 0xffff) as u16
    }

    /// True on usb3 cores at or past the given release (usb31 cores number
    /// their releases independently and are always "newer" here).
    pub fn usb3_at_least(&self, release: u16) -> bool {
        self.is_usb31 || self.release() >= release
    }

    /// Cores with interrupt moderation support.
    pub fn has_imod(&self) -> bool {
        if self.is_usb31 {
            self.release() >= 0x120a
        } else {
            self.release() >= 0x300a
        }
    }

    /// Cores whose clear-stall must also clear pending input.
    pub fn needs_clearpendin(&self) -> bool {
        self.usb3_at_least(0x310a)
    }
}

/// Typed access layer over a [`RegisterBus`].
#[derive(Debug)]
pub struct Regs<B> {
    bus: B,
}

macro_rules! reg_rw {
    ($name:ident, $ty:ty, $offset:expr) => {
        paste::paste! {
            pub fn $name(&self) -> $ty {
                self.bus.read($offset).into()
            }
            pub fn [<set_ $name>](&mut self, value: $ty) {
                self.bus.write($offset, value.into())
            }
            pub fn [<update_ $name>]<F>(&mut self, f: F)
            where
                F: FnOnce(&mut $ty),
            {
                let mut value = self.$name();
                f(&mut value);
                self.[<set_ $name>](value);
            }
        }
    };
}

impl<B: RegisterBus> Regs<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    reg_rw!(gctl, Gctl, GCTL);
    reg_rw!(gsts, Gsts, GSTS);
    reg_rw!(dcfg, Dcfg, DCFG);
    reg_rw!(dctl, Dctl, DCTL);
    reg_rw!(devten, Devten, DEVTEN);
    reg_rw!(dsts, Dsts, DSTS);
    reg_rw!(dgcmd, Dgcmd, DGCMD);
    reg_rw!(octl, Octl, OCTL);
    reg_rw!(oevt, Oevt, OEVT);
    reg_rw!(oevten, Oevten, OEVTEN);
    reg_rw!(osts, Osts, OSTS);

    pub fn gsnpsid(&self) -> u32 {
        self.bus.read(GSNPSID)
    }

    pub fn ghwparams(&self, n: usize) -> u32 {
        self.bus.read(ghwparams(n))
    }

    pub fn dgcmdpar(&self) -> u32 {
        self.bus.read(DGCMDPAR)
    }
    pub fn set_dgcmdpar(&mut self, value: u32) {
        self.bus.write(DGCMDPAR, value)
    }

    pub fn dalepena(&self) -> u32 {
        self.bus.read(DALEPENA)
    }
    pub fn set_dalepena(&mut self, value: u32) {
        self.bus.write(DALEPENA, value)
    }

    pub fn set_dev_imod(&mut self, n: usize, value: DevImod) {
        self.bus.write(dev_imod(n), value.into())
    }

    pub fn depcmd(&self, ep: u8) -> Depcmd {
        self.bus.read(dep_base(ep) + DEPCMD).into()
    }
    pub fn set_depcmd(&mut self, ep: u8, cmd: Depcmd) {
        self.bus.write(dep_base(ep) + DEPCMD, cmd.into())
    }
    pub fn set_depcmdpar0(&mut self, ep: u8, value: u32) {
        self.bus.write(dep_base(ep) + DEPCMDPAR0, value)
    }
    pub fn set_depcmdpar1(&mut self, ep: u8, value: u32) {
        self.bus.write(dep_base(ep) + DEPCMDPAR1, value)
    }
    pub fn set_depcmdpar2(&mut self, ep: u8, value: u32) {
        self.bus.write(dep_base(ep) + DEPCMDPAR2, value)
    }

    pub fn set_gevntadr(&mut self, n: usize, addr: u64) {
        self.bus.write(gevntadrlo(n), addr as u32);
        self.bus.write(gevntadrhi(n), (addr >> 32) as u32);
    }
    pub fn gevntsiz(&self, n: usize) -> Gevntsiz {
        self.bus.read(gevntsiz(n)).into()
    }
    pub fn set_gevntsiz(&mut self, n: usize, value: Gevntsiz) {
        self.bus.write(gevntsiz(n), value.into())
    }
    pub fn update_gevntsiz<F>(&mut self, n: usize, f: F)
    where
        F: FnOnce(&mut Gevntsiz),
    {
        let mut value = self.gevntsiz(n);
        f(&mut value);
        self.set_gevntsiz(n, value);
    }

    /// Pending event bytes; the low two bits of the counter never carry.
    pub fn gevntcount(&self, n: usize) -> u32 {
        self.bus.read(gevntcount(n)) & 0xfffc
    }
    /// Acknowledge `bytes` consumed event bytes back to hardware.
    pub fn ack_evntcount(&mut self, n: usize, bytes: u32) {
        self.bus.write(gevntcount(n), bytes)
    }

    pub fn read_raw(&self, offset: usize) -> u32 {
        self.bus.read(offset)
    }
    pub fn write_raw(&mut self, offset: usize, value: u32) {
        self.bus.write(offset, value)
    }

    #[cfg(test)]
    pub(crate) fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prtcapdir_field_position() {
        let mut gctl = Gctl(0);
        gctl.set_prtcapdir(Gctl::PRTCAP_OTG);
        assert_eq!(u32::from(gctl), 3 << 12);
        gctl.set_prtcapdir(Gctl::PRTCAP_DEVICE);
        assert_eq!(gctl.get_prtcapdir(), 2);
    }

    #[test]
    fn depcmd_resource_index_excludes_high_param_bits() {
        // Bits 22:16 carry the resource index; 31:23 are other parameter
        // bits and must not leak into it.
        let cmd = Depcmd(0xdead_0000 | (0x55 << 16));
        assert_eq!(cmd.get_resource_index(), 0x55);
    }

    #[test]
    fn revision_identifies_core_generations() {
        let usb3 = Revision::from_gsnpsid(0x5533_290a).unwrap();
        assert!(!usb3.is_usb31());
        assert_eq!(usb3.release(), 0x290a);
        assert!(usb3.usb3_at_least(0x190a));
        assert!(!usb3.has_imod());

        let usb31 = Revision::from_gsnpsid(0x3331_170a).unwrap();
        assert!(usb31.is_usb31());
        assert!(usb31.has_imod());

        assert_eq!(
            Revision::from_gsnpsid(0xffff_ffff),
            Err(Error::UnknownCoreId(0xffff_ffff))
        );
    }

    #[test]
    fn endpoint_command_block_stride() {
        assert_eq!(dep_base(0) + DEPCMD, 0xc80c);
        assert_eq!(dep_base(3) + DEPCMDPAR0, 0xc838);
        assert_eq!(dep_base(31) + DEPCMD, 0xc9fc);
    }
}
