//! The controller core.
//!
//! [`Dwc3`] is the public handle: one coarse lock around [`Controller`],
//! which owns the register window, the event buffer, the endpoint arena and
//! the layered state machines. The platform feeds it from two contexts: the
//! interrupt top half calls [`Dwc3::interrupt`], a single-threaded deferred
//! context calls [`Dwc3::process_events`] / [`Dwc3::process_role_switch`].
//! Completions and bus notifications are returned from `process_events`
//! rather than called back under the lock.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::pin::Pin;

use spin::Mutex;

use crate::command::{self, ConfigAction, EpCmdParams, EpCommandKind};
use crate::config::{Config, DrMode, HwParams, Speed};
use crate::drd::{DrdState, HostResources, HostRole, Role};
use crate::ep::{Endpoint, EndpointConfig};
use crate::ep0::{Ep0, Ep0State};
use crate::error::{Error, Result};
use crate::event::{
    DevEvent, DevEventKind, EpEvent, EpEventKind, Event, EventBuffer, EVENT_SIZE,
};
use crate::link::{LinkState, LinkTracker};
use crate::regs::{Depcmd, Gctl, RegisterBus, Regs, Revision};
use crate::request::{EpNumber, Request, SetupData, TransferStatus};

/// Fixed endpoint arena capacity; physical numbers 0 and 1 are the control
/// pipe.
pub const ENDPOINTS_NUM: usize = 32;

const SOFT_RESET_TIMEOUT: u32 = 1000;
const RUN_STOP_TIMEOUT: u32 = 1000;
/// Each hibernation scratchpad buffer is one 4 KiB page.
const SCRATCHBUF_SIZE: usize = 4096;

/// Asynchronous notification drained from [`Dwc3::process_events`].
#[derive(Debug)]
pub enum Notification {
    Connect { speed: Speed },
    Disconnect,
    Reset,
    Suspend,
    Resume,
    SetupPacket(SetupData),
    Complete {
        ep: EpNumber,
        request: Request,
        status: TransferStatus,
    },
    Sof { frame: u16 },
}

pub type Notifications = Vec<Notification>;

/// The dual-role controller core.
pub struct Dwc3<B: RegisterBus> {
    inner: Mutex<Controller<B>>,
}

impl<B: RegisterBus> Dwc3<B> {
    /// Probe and reset the core. No role is started until [`Self::start`].
    pub fn new(bus: B, config: Config) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Controller::new(Regs::new(bus), config)?),
        })
    }

    /// Register the host-mode child; required before the arbiter may enter
    /// the host role.
    pub fn register_host(&self, child: Box<dyn HostRole>) {
        self.inner.lock().host = Some(child);
    }

    /// Enter operation in the configured mode. In dual-role mode this reads
    /// the id/session status and runs the first role switch.
    pub fn start(&self) -> Result<()> {
        self.inner.lock().start()
    }

    /// Interrupt top half: mask the event interrupt and flag pending work.
    /// Returns whether the bottom half needs to run.
    pub fn interrupt(&self) -> bool {
        self.inner.lock().interrupt()
    }

    /// Bottom half: drain and dispatch the event buffer.
    pub fn process_events(&self) -> Result<Notifications> {
        self.inner.lock().process_events()
    }

    /// OTG interrupt: fold id/session changes into the arbiter.
    pub fn process_otg_events(&self) {
        self.inner.lock().process_otg_events()
    }

    /// External id-pin / session-valid notification.
    pub fn set_role_inputs(&self, id_pin: bool, session_valid: bool) {
        self.inner
            .lock()
            .schedule_role(DrdState::role_from_inputs(id_pin, session_valid))
    }

    /// Run the single role-switch task if one is scheduled.
    pub fn process_role_switch(&self) -> Result<()> {
        self.inner.lock().process_role_switch()
    }

    pub fn current_role(&self) -> Role {
        self.inner.lock().drd.current()
    }

    pub fn enable_endpoint(&self, config: EndpointConfig) -> Result<()> {
        self.inner.lock().enable_endpoint(config)
    }

    pub fn disable_endpoint(&self, ep: EpNumber) -> Result<()> {
        self.inner.lock().disable_endpoint(ep)
    }

    pub fn submit(&self, ep: EpNumber, request: Request) -> Result<()> {
        self.inner.lock().submit(ep, request)
    }

    pub fn cancel(&self, ep: EpNumber, tag: u32) -> Result<()> {
        self.inner.lock().cancel(ep, tag)
    }

    pub fn set_halt(&self, ep: EpNumber, halted: bool) -> Result<()> {
        self.inner.lock().set_halt(ep, halted)
    }

    pub fn set_wedge(&self, ep: EpNumber) -> Result<()> {
        self.inner.lock().set_wedge(ep)
    }

    /// Pull-up control: make the device visible on the bus.
    pub fn connect(&self) -> Result<()> {
        self.inner.lock().run_stop(true)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.inner.lock().run_stop(false)
    }

    pub fn set_address(&self, address: u8) -> Result<()> {
        self.inner.lock().set_address(address)
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.lock().link.state()
    }

    pub fn set_link_state(&self, target: LinkState) -> Result<()> {
        let mut inner = self.inner.lock();
        let Controller { regs, link, .. } = &mut *inner;
        link.request_transition(regs, target)
    }

    /// Current (micro)frame number; isochronous submitters need it.
    pub fn current_frame(&self) -> u16 {
        self.inner.lock().regs.dsts().get_soffn()
    }

    pub fn ep0_state(&self) -> Ep0State {
        self.inner.lock().ep0.state()
    }

    /// Queue the data stage of the current control transfer.
    pub fn ep0_queue(&self, request: Request) -> Result<()> {
        self.inner.lock().ep0_queue(request)
    }

    /// Ask for the status stage to be held until [`Self::ep0_accept_status`].
    pub fn ep0_delayed_status(&self) {
        self.inner.lock().ep0.set_delayed_status()
    }

    pub fn ep0_accept_status(&self) -> Result<()> {
        self.inner.lock().ep0_accept_status()
    }

    /// Speed negotiated at the last connect-done, if connected.
    pub fn speed(&self) -> Option<Speed> {
        self.inner.lock().speed
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn revision(&self) -> Revision {
        self.inner.lock().revision
    }

    #[cfg(test)]
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, Controller<B>> {
        self.inner.lock()
    }
}

pub(crate) struct Controller<B: RegisterBus> {
    pub(crate) regs: Regs<B>,
    config: Config,
    pub(crate) revision: Revision,
    hwparams: HwParams,
    pub(crate) evt_buf: EventBuffer,
    eps: [Option<Endpoint>; ENDPOINTS_NUM],
    pub(crate) ep0: Ep0,
    pub(crate) link: LinkTracker,
    pub(crate) drd: DrdState,
    pub(crate) host: Option<Box<dyn HostRole>>,
    /// Keeps the hibernation scratchpad block alive; hardware holds its
    /// address.
    #[allow(dead_code)]
    scratch: Option<Pin<Box<[u8]>>>,
    num_eps: usize,
    speed: Option<Speed>,
    connected: bool,
    pullups_connected: bool,
    device_active: bool,
    /// Endpoint transfer resources allocated for the current configuration
    /// epoch (start-new-configuration issued).
    resources_allocated: bool,
    notifications: Notifications,
}

impl<B: RegisterBus> Controller<B> {
    fn new(regs: Regs<B>, config: Config) -> Result<Self> {
        let mut this = Self {
            revision: Revision::from_gsnpsid(regs.gsnpsid())?,
            regs,
            config,
            hwparams: HwParams::default(),
            evt_buf: EventBuffer::new(),
            eps: core::array::from_fn(|_| None),
            ep0: Ep0::new(),
            link: LinkTracker::new(),
            drd: DrdState::new(),
            host: None,
            scratch: None,
            num_eps: 0,
            speed: None,
            connected: false,
            pullups_connected: false,
            device_active: false,
            resources_allocated: false,
            notifications: Vec::new(),
        };
        this.core_init()?;
        Ok(this)
    }

    fn core_init(&mut self) -> Result<()> {
        self.core_soft_reset()?;
        self.hwparams = HwParams::read(&self.regs);
        self.num_eps = usize::from(self.hwparams.num_eps()).clamp(2, ENDPOINTS_NUM);

        let config = self.config;
        let revision = self.revision;
        self.regs.update_gctl(|r| {
            r.set_scaledown(0);
            if config.disable_scramble_quirk {
                r.set_disscramble();
            } else {
                r.clear_disscramble();
            }
            if config.u2exit_lfps_quirk {
                r.set_u2exit_lfps();
            }
            if config.disable_clk_gating {
                r.set_dsblclkgtng();
            }
            // Older cores need the U2 exit workaround.
            if !revision.is_usb31() && revision.release() < 0x190a {
                r.set_u2rstecn();
            }
        });

        self.setup_scratch_buffers()?;

        log::info!(
            "drd core {}.{:02x}a ({}), {} endpoints, event buffer at {:#x}",
            if self.revision.is_usb31() { "usb31" } else { "usb3" },
            self.revision.release() >> 4,
            self.hwparams.mode(),
            self.num_eps,
            self.evt_buf.dma_addr(),
        );
        Ok(())
    }

    fn core_soft_reset(&mut self) -> Result<()> {
        self.regs.update_dctl(|r| {
            r.set_csftrst();
        });
        for _ in 0..SOFT_RESET_TIMEOUT {
            if !self.regs.dctl().get_csftrst() {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Error::CoreSoftResetTimedOut)
    }

    fn setup_scratch_buffers(&mut self) -> Result<()> {
        if !self.config.hibernation || !self.hwparams.has_hibernation() {
            return Ok(());
        }
        let n = usize::from(self.hwparams.num_scratch_buffers());
        if n == 0 {
            return Ok(());
        }
        let block = Pin::new(vec![0u8; n * SCRATCHBUF_SIZE].into_boxed_slice());
        let addr = block.as_ptr() as u64;
        command::issue_generic(&mut self.regs, command::DGCMD_SET_SCRATCHPAD_ADDR_LO, addr as u32)?;
        command::issue_generic(
            &mut self.regs,
            command::DGCMD_SET_SCRATCHPAD_ADDR_HI,
            (addr >> 32) as u32,
        )?;
        self.scratch = Some(block);
        log::debug!("{n} scratchpad buffers at {addr:#x}");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        match self.config.dr_mode {
            DrMode::Peripheral => {
                self.schedule_role(Role::Device);
            }
            DrMode::Host => {
                self.schedule_role(Role::Host);
            }
            DrMode::Otg => {
                self.set_prtcap(Gctl::PRTCAP_OTG);
                self.regs.update_oevten(|r| {
                    r.set_conidstschngen().set_bdevvbuschngen();
                });
                let osts = self.regs.osts();
                self.schedule_role(DrdState::role_from_inputs(
                    osts.get_conidsts(),
                    osts.get_bsesvld(),
                ));
            }
        }
        self.process_role_switch()
    }

    /* ---------------- dual-role arbitration ---------------- */

    fn schedule_role(&mut self, desired: Role) {
        if self.drd.schedule(desired) {
            log::debug!("role switch scheduled: {:?} -> {desired:?}", self.drd.current());
        }
    }

    fn process_otg_events(&mut self) {
        let oevt = self.regs.oevt();
        if !(oevt.get_conidstschng() || oevt.get_bdevvbuschng() || oevt.get_bdevsessvlddet()) {
            return;
        }
        self.regs.set_oevt(oevt);
        let osts = self.regs.osts();
        self.schedule_role(DrdState::role_from_inputs(
            osts.get_conidsts(),
            osts.get_bsesvld(),
        ));
    }

    /// The single-threaded role-switch task. Tears the outgoing role fully
    /// down (event buffer included) before the incoming role touches the
    /// registers.
    fn process_role_switch(&mut self) -> Result<()> {
        if !self.drd.switch_pending() {
            return Ok(());
        }
        loop {
            let desired = self.drd.desired();
            if self.drd.current() == desired {
                break;
            }
            match self.drd.current() {
                Role::Device => self.device_stop()?,
                Role::Host => {
                    if let Some(host) = self.host.as_mut() {
                        host.stop();
                    }
                }
                Role::Idle => {}
            }
            self.drd.set_current(Role::Idle);

            match desired {
                Role::Idle => {}
                Role::Device => {
                    self.set_prtcap(Gctl::PRTCAP_DEVICE);
                    match self.device_start() {
                        Ok(()) => self.drd.set_current(Role::Device),
                        Err(e) => {
                            // Fatal for this attempt; the controller stays
                            // idle and the error surfaces to the platform.
                            log::error!("device start failed: {e:?}");
                            self.drd.finish_switch();
                            return Err(e);
                        }
                    }
                }
                Role::Host => {
                    self.set_prtcap(Gctl::PRTCAP_HOST);
                    let resources = HostResources::new(u32::from(self.config.imod_interval));
                    match self.host.as_mut() {
                        Some(host) => match host.start(&resources) {
                            Ok(()) => self.drd.set_current(Role::Host),
                            Err(e) => {
                                // Recoverable: retried on the next signal.
                                log::warn!("host start failed: {e:?}");
                                break;
                            }
                        },
                        None => {
                            log::warn!("host role requested but no host child registered");
                            break;
                        }
                    }
                }
            }
        }
        self.drd.finish_switch();
        Ok(())
    }

    fn set_prtcap(&mut self, mode: u8) {
        self.regs.update_gctl(|r| {
            r.set_prtcapdir(mode);
        });
    }

    /* ---------------- device core ---------------- */

    fn device_start(&mut self) -> Result<()> {
        self.event_buffers_setup();
        self.program_speed();
        self.regs.update_dcfg(|r| {
            r.set_devaddr(0);
            r.set_intrnum(0);
            if self.config.lpm_capable {
                r.set_lpm_cap();
            }
        });
        self.enable_device_events();
        if self.revision.has_imod() && self.config.imod_interval != 0 {
            let mut imod = crate::regs::DevImod::from(0);
            imod.set_interval(self.config.imod_interval);
            self.regs.set_dev_imod(0, imod);
        }

        let mps = self.config.maximum_speed.ep0_max_packet_size();
        self.eps[0] = Some(Endpoint::new(
            EndpointConfig::control(EpNumber::EP0_OUT, mps),
            self.ep0.bounce_addr(),
        ));
        self.eps[1] = Some(Endpoint::new(
            EndpointConfig::control(EpNumber::EP0_IN, mps),
            self.ep0.bounce_addr(),
        ));
        self.start_new_config(0)?;
        self.resources_allocated = false;
        {
            let [out_slot, in_slot, ..] = &mut self.eps;
            out_slot
                .as_mut()
                .unwrap()
                .enable(&mut self.regs, ConfigAction::Init)?;
            in_slot
                .as_mut()
                .unwrap()
                .enable(&mut self.regs, ConfigAction::Init)?;
            self.ep0.arm_setup(&mut self.regs, out_slot.as_mut().unwrap())?;
        }
        self.device_active = true;
        if self.pullups_connected {
            self.run_stop(true)?;
        }
        log::info!("device core started, ep0 mps {mps}");
        Ok(())
    }

    fn device_stop(&mut self) -> Result<()> {
        if !self.device_active {
            return Ok(());
        }
        if self.regs.dctl().get_run_stop() {
            self.run_stop_raw(false)?;
        }
        for slot in self.eps.iter_mut() {
            if let Some(mut ep) = slot.take() {
                for request in ep.disable(&mut self.regs) {
                    self.notifications.push(Notification::Complete {
                        ep: ep.number(),
                        request,
                        status: TransferStatus::Cancelled,
                    });
                }
            }
        }
        if let Some(stale) = self.ep0.reset() {
            self.notifications.push(Notification::Complete {
                ep: EpNumber::EP0_OUT,
                request: stale,
                status: TransferStatus::Cancelled,
            });
        }
        self.event_buffers_cleanup();
        self.device_active = false;
        self.connected = false;
        self.speed = None;
        log::info!("device core stopped");
        Ok(())
    }

    fn event_buffers_setup(&mut self) {
        // Single interrupter. TODO: spread endpoints over the other event
        // buffers the hardware parameters advertise.
        self.regs.set_gevntadr(0, self.evt_buf.dma_addr());
        self.regs.set_gevntsiz(0, {
            let mut siz = crate::regs::Gevntsiz::from(0);
            siz.set_size(self.evt_buf.length() as u16);
            siz
        });
        self.regs.ack_evntcount(0, self.regs.gevntcount(0));
    }

    fn event_buffers_cleanup(&mut self) {
        self.regs.ack_evntcount(0, self.regs.gevntcount(0));
        self.regs.set_gevntadr(0, 0);
        self.regs.set_gevntsiz(0, {
            let mut siz = crate::regs::Gevntsiz::from(0);
            siz.set_intmask();
            siz
        });
    }

    fn program_speed(&mut self) {
        let mut speed = self.config.maximum_speed;
        // Affected cores may enumerate erratically below SuperSpeed unless
        // the metastability workaround keeps DCFG at SuperSpeed.
        if !self.config.dis_metastability_quirk
            && !self.revision.is_usb31()
            && self.revision.release() < 0x220a
            && matches!(speed, Speed::High | Speed::Full)
        {
            log::debug!("metastability workaround: programming superspeed");
            speed = Speed::Super;
        }
        self.regs.update_dcfg(|r| {
            r.set_devspeed(speed.into());
        });
    }

    fn enable_device_events(&mut self) {
        let config = self.config;
        self.regs.update_devten(|r| {
            r.set_disconnevten()
                .set_usbrsten()
                .set_connectdoneen()
                .set_ulstcngen()
                .set_wkupevten()
                .set_errticerren()
                .set_cmdcmplten()
                .set_evntoverflowen();
            if config.imod_interval == 0 {
                // Without moderation, suspend tracking rides on EOPF.
                r.set_eopfen();
            }
        });
    }

    fn start_new_config(&mut self, resource_index: u16) -> Result<()> {
        let mut flags = Depcmd::from(0);
        flags.set_param(resource_index);
        command::issue(
            &mut self.regs,
            EpNumber::EP0_OUT,
            EpCommandKind::StartNewConfig,
            flags,
            &EpCmdParams::zeroed(),
        )?;
        Ok(())
    }

    fn run_stop(&mut self, on: bool) -> Result<()> {
        self.pullups_connected = on;
        if !self.device_active {
            // Applied when the device role starts.
            return Ok(());
        }
        self.run_stop_raw(on)
    }

    fn run_stop_raw(&mut self, on: bool) -> Result<()> {
        self.regs.update_dctl(|r| {
            if on {
                r.set_run_stop();
            } else {
                r.clear_run_stop();
            }
        });
        for _ in 0..RUN_STOP_TIMEOUT {
            let halted = self.regs.dsts().get_devctrlhlt();
            if halted != on {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Error::RunStopTimedOut)
    }

    fn set_address(&mut self, address: u8) -> Result<()> {
        self.regs.update_dcfg(|r| {
            r.set_devaddr(address);
        });
        Ok(())
    }

    /* ---------------- endpoint surface ---------------- */

    fn enable_endpoint(&mut self, config: EndpointConfig) -> Result<()> {
        let ep = config.ep;
        assert!(
            !ep.is_control(),
            "the control pipe is managed by the core itself"
        );
        if usize::from(ep.number()) >= self.num_eps {
            return Err(Error::InvalidEndpointNumber(ep.number()));
        }
        if self.eps[ep.index()].as_ref().is_some_and(|e| e.is_enabled()) {
            return Err(Error::EndpointAlreadyEnabled(ep.number()));
        }
        // The first endpoint of a configuration epoch (re)allocates the
        // hardware transfer resources for everything but the control pipe.
        if !self.resources_allocated {
            self.start_new_config(2)?;
            self.resources_allocated = true;
        }
        let mut endpoint = Endpoint::new(config, self.ep0.bounce_addr());
        endpoint.enable(&mut self.regs, ConfigAction::Init)?;
        self.eps[ep.index()] = Some(endpoint);
        Ok(())
    }

    fn disable_endpoint(&mut self, ep: EpNumber) -> Result<()> {
        let mut endpoint = self.eps[ep.index()]
            .take()
            .ok_or(Error::EndpointNotEnabled(ep.number()))?;
        for request in endpoint.disable(&mut self.regs) {
            self.notifications.push(Notification::Complete {
                ep,
                request,
                status: TransferStatus::Cancelled,
            });
        }
        Ok(())
    }

    fn submit(&mut self, ep: EpNumber, request: Request) -> Result<()> {
        if ep.is_control() {
            return self.ep0_queue(request);
        }
        let Controller { regs, eps, .. } = self;
        let endpoint = eps[ep.index()]
            .as_mut()
            .ok_or(Error::EndpointNotEnabled(ep.number()))?;
        endpoint.queue(regs, request)
    }

    fn cancel(&mut self, ep: EpNumber, tag: u32) -> Result<()> {
        let Controller {
            regs,
            eps,
            notifications,
            ..
        } = self;
        let endpoint = eps[ep.index()]
            .as_mut()
            .ok_or(Error::EndpointNotEnabled(ep.number()))?;
        if let Some(request) = endpoint.cancel(regs, tag)? {
            // Hardware never saw it; cancelled completion is immediate.
            notifications.push(Notification::Complete {
                ep,
                request,
                status: TransferStatus::Cancelled,
            });
        }
        Ok(())
    }

    fn set_halt(&mut self, ep: EpNumber, halted: bool) -> Result<()> {
        let clearpendin = self.revision.needs_clearpendin();
        let Controller { regs, eps, .. } = self;
        let endpoint = eps[ep.index()]
            .as_mut()
            .ok_or(Error::EndpointNotEnabled(ep.number()))?;
        endpoint.set_halt(regs, halted, clearpendin)
    }

    fn set_wedge(&mut self, ep: EpNumber) -> Result<()> {
        let Controller { regs, eps, .. } = self;
        let endpoint = eps[ep.index()]
            .as_mut()
            .ok_or(Error::EndpointNotEnabled(ep.number()))?;
        endpoint.set_wedge(regs)
    }

    fn ep0_queue(&mut self, request: Request) -> Result<()> {
        let Controller {
            regs, eps, ep0, ..
        } = self;
        let [out_slot, in_slot, ..] = eps;
        let (Some(ep0_out), Some(ep0_in)) = (out_slot.as_mut(), in_slot.as_mut()) else {
            return Err(Error::EndpointNotEnabled(0));
        };
        ep0.queue_data(regs, ep0_out, ep0_in, request)
    }

    fn ep0_accept_status(&mut self) -> Result<()> {
        let Controller {
            regs, eps, ep0, ..
        } = self;
        let [out_slot, in_slot, ..] = eps;
        let (Some(ep0_out), Some(ep0_in)) = (out_slot.as_mut(), in_slot.as_mut()) else {
            return Err(Error::EndpointNotEnabled(0));
        };
        ep0.accept_status(regs, ep0_out, ep0_in)
    }

    /* ---------------- event processing ---------------- */

    fn interrupt(&mut self) -> bool {
        if !self.device_active {
            return false;
        }
        let count = self.regs.gevntcount(0);
        if count == 0 {
            return false;
        }
        self.regs.update_gevntsiz(0, |r| {
            r.set_intmask();
        });
        self.evt_buf.cache_count(count);
        self.evt_buf.set_pending(true);
        true
    }

    fn process_events(&mut self) -> Result<Notifications> {
        let mut out = core::mem::take(&mut self.notifications);
        if !self.device_active {
            return Ok(out);
        }
        if !self.evt_buf.is_pending() {
            // Direct call without a top half; read the count here.
            let count = self.regs.gevntcount(0);
            self.evt_buf.cache_count(count);
        }

        let count = self.evt_buf.cached_count();
        if count as usize > self.evt_buf.length() {
            // More bytes than the buffer holds: events were lost. Adopt the
            // hardware position wholesale and report upward.
            log::warn!("event buffer overflow ({count} bytes reported)");
            self.regs.ack_evntcount(0, count);
            self.evt_buf.resync(count);
            self.evt_buf.set_pending(false);
            self.regs.update_gevntsiz(0, |r| {
                r.clear_intmask();
            });
            self.notifications = out;
            return Err(Error::EventBufferOverflow);
        }

        while self.evt_buf.cached_count() > 0 {
            let raw = self.evt_buf.word_at_lpos();
            match Event::decode(raw) {
                Ok(event) => {
                    if let Err(e) = self.dispatch(event) {
                        log::error!("event {raw:#010x} dispatch failed: {e:?}");
                    }
                }
                Err(e) => log::warn!("skipping undecodable event {raw:#010x}: {e:?}"),
            }
            self.evt_buf.advance();
            self.evt_buf.consume_one();
            self.regs.ack_evntcount(0, EVENT_SIZE as u32);
        }
        self.evt_buf.set_pending(false);
        self.regs.update_gevntsiz(0, |r| {
            r.clear_intmask();
        });

        out.append(&mut self.notifications);
        Ok(out)
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Endpoint(e) if e.get_endpoint_number() <= 1 => self.on_control_event(e),
            Event::Endpoint(e) => self.on_endpoint_event(e),
            Event::Device(e) => self.on_device_event(e),
            Event::Carkit(e) | Event::I2c(e) => {
                log::debug!("ignoring auxiliary event on phy port {}", e.get_phy_port_number());
                Ok(())
            }
        }
    }

    fn on_device_event(&mut self, event: DevEvent) -> Result<()> {
        match event.kind()? {
            DevEventKind::Disconnect => {
                log::info!("disconnect");
                self.connected = false;
                self.speed = None;
                if let Some(stale) = self.ep0.reset() {
                    self.notifications.push(Notification::Complete {
                        ep: EpNumber::EP0_OUT,
                        request: stale,
                        status: TransferStatus::Cancelled,
                    });
                }
                self.notifications.push(Notification::Disconnect);
            }
            DevEventKind::Reset => {
                log::info!("bus reset");
                self.set_address(0)?;
                let Controller { regs, eps, .. } = self;
                let clearpendin = self.revision.needs_clearpendin();
                for slot in eps.iter_mut().skip(2) {
                    if let Some(ep) = slot.as_mut() {
                        if ep.is_stalled() {
                            let _ = ep.set_halt(regs, false, clearpendin);
                        }
                    }
                }
                self.resources_allocated = false;
                self.notifications.push(Notification::Reset);
            }
            DevEventKind::ConnectDone => self.on_connect_done()?,
            DevEventKind::LinkStatusChange => {
                let old = self.link.state();
                if let Some(new) = self.link.update_from_event(event.link_state_raw()) {
                    if new == LinkState::U3 {
                        self.notifications.push(Notification::Suspend);
                    } else if old == LinkState::U3
                        && matches!(new, LinkState::U0 | LinkState::Resume | LinkState::Recovery)
                    {
                        self.notifications.push(Notification::Resume);
                    }
                }
            }
            DevEventKind::Wakeup => self.notifications.push(Notification::Resume),
            DevEventKind::Suspend => {
                // Covered by the U3 link transition; EOPF alone is not a
                // reliable suspend signal on every speed.
                log::debug!("eopf/suspend event");
            }
            DevEventKind::Sof => {
                let frame = self.regs.dsts().get_soffn();
                self.notifications.push(Notification::Sof { frame });
            }
            DevEventKind::ErraticError => {
                log::error!("erratic error reported by the core");
            }
            DevEventKind::CommandComplete => {
                log::debug!("generic command complete event");
            }
            DevEventKind::Overflow => {
                // The count-based resync in process_events does the actual
                // recovery.
                log::warn!("event overflow reported by the core");
            }
            DevEventKind::HibernationRequest | DevEventKind::VendorDeviceTest => {
                log::debug!("unhandled device event {:?}", event.kind());
            }
        }
        Ok(())
    }

    fn on_connect_done(&mut self) -> Result<()> {
        let speed = Speed::try_from(self.regs.dsts().get_connectspd())
            .map_err(Error::UnknownDeviceEvent)?;
        self.speed = Some(speed);
        self.connected = true;
        self.link.refresh(&self.regs);

        let mps = speed.ep0_max_packet_size();
        {
            let Controller { regs, eps, .. } = self;
            let [out_slot, in_slot, ..] = eps;
            for slot in [out_slot, in_slot] {
                if let Some(ep) = slot.as_mut() {
                    ep.set_max_packet_size(mps);
                    ep.enable(regs, ConfigAction::Modify)?;
                }
            }
        }

        let config = self.config;
        if speed.is_superspeed() && !config.u1u2_disable {
            self.regs.update_dctl(|r| {
                r.set_acceptu1ena().set_acceptu2ena();
            });
        }
        if speed == Speed::High && config.lpm_capable {
            self.regs.update_dctl(|r| {
                r.set_hird_thres(config.hird_threshold);
            });
        }

        log::info!("connected at {speed:?}, ep0 mps {mps}");
        self.notifications.push(Notification::Connect { speed });
        Ok(())
    }

    fn on_control_event(&mut self, event: EpEvent) -> Result<()> {
        let Controller {
            regs,
            eps,
            ep0,
            notifications,
            ..
        } = self;
        let [out_slot, in_slot, ..] = eps;
        let (Some(ep0_out), Some(ep0_in)) = (out_slot.as_mut(), in_slot.as_mut()) else {
            log::warn!("control event before the control pipe exists");
            return Ok(());
        };

        match event.kind()? {
            EpEventKind::XferComplete => match ep0.state() {
                Ep0State::SetupPhase => {
                    let (setup, stale) = ep0.on_setup_complete(ep0_out);
                    if let Some(request) = stale {
                        notifications.push(Notification::Complete {
                            ep: EpNumber::EP0_OUT,
                            request,
                            status: TransferStatus::Cancelled,
                        });
                    }
                    notifications.push(Notification::SetupPacket(setup));
                    Ok(())
                }
                Ep0State::DataPhase => {
                    let (request, status) = ep0.on_data_complete::<B>(ep0_out, ep0_in, event)?;
                    let ep = if event.get_endpoint_number() == 0 {
                        EpNumber::EP0_OUT
                    } else {
                        EpNumber::EP0_IN
                    };
                    notifications.push(Notification::Complete {
                        ep,
                        request,
                        status,
                    });
                    Ok(())
                }
                Ep0State::StatusPhase => ep0.on_status_complete(regs, ep0_out, ep0_in),
                Ep0State::Unconnected => {
                    log::warn!("control completion while unconnected");
                    Ok(())
                }
            },
            EpEventKind::XferNotReady => ep0.on_xfer_not_ready(regs, ep0_out, ep0_in, event),
            EpEventKind::EpCmdComplete | EpEventKind::XferInProgress => Ok(()),
            kind => {
                log::debug!("ignoring {kind:?} on the control pipe");
                Ok(())
            }
        }
    }

    fn on_endpoint_event(&mut self, event: EpEvent) -> Result<()> {
        let phys = event.get_endpoint_number();
        let Controller {
            regs,
            eps,
            notifications,
            ..
        } = self;
        let Some(ep) = eps[usize::from(phys)].as_mut() else {
            log::warn!("event for missing ep{phys}");
            return Ok(());
        };
        let number = ep.number();

        match event.kind()? {
            EpEventKind::XferComplete | EpEventKind::XferInProgress => {
                while let Some((request, status)) = ep.complete_head(event) {
                    notifications.push(Notification::Complete {
                        ep: number,
                        request,
                        status,
                    });
                }
                ep.kick(regs)
            }
            EpEventKind::XferNotReady => {
                if ep.config().ty == crate::ep::TransferType::Isochronous {
                    ep.set_frame_number(event.get_parameters());
                }
                ep.kick(regs)
            }
            EpEventKind::EpCmdComplete => {
                let cmd = event.completed_command();
                if cmd == u8::from(EpCommandKind::EndTransfer) && ep.end_transfer_pending() {
                    for request in ep.on_end_transfer_complete(regs)? {
                        notifications.push(Notification::Complete {
                            ep: number,
                            request,
                            status: TransferStatus::Cancelled,
                        });
                    }
                }
                Ok(())
            }
            EpEventKind::RxTxFifo => {
                log::warn!("fifo over/underrun on ep{phys}");
                Ok(())
            }
            EpEventKind::Stream => {
                log::debug!("stream event on ep{phys}");
                Ok(())
            }
        }
    }

}

#[cfg(test)]
impl Controller<crate::testing::FakeBus> {
    /// Place a raw event word at the hardware write position and bump the
    /// pending byte count, as hardware would.
    pub(crate) fn inject_event(&mut self, raw: u32) {
        let pending = self.regs.read_raw(crate::regs::gevntcount(0));
        let pos = (self.evt_buf.lpos() + pending as usize) % self.evt_buf.length();
        self.evt_buf.write_word(pos, raw);
        self.regs
            .bus_mut()
            .seed(crate::regs::gevntcount(0), pending + EVENT_SIZE as u32);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::ep::TransferType;
    use crate::event::EVENT_BUFFER_LENGTH;
    use crate::regs as regmap;
    use crate::request::Direction;
    use crate::testing::FakeBus;

    fn peripheral() -> Dwc3<FakeBus> {
        let config = Config {
            dr_mode: DrMode::Peripheral,
            ..Config::default()
        };
        let dwc = Dwc3::new(FakeBus::new(), config).unwrap();
        dwc.start().unwrap();
        dwc
    }

    fn ep_event(ep: u8, kind: EpEventKind, status: u8, parameters: u16) -> u32 {
        let mut e = EpEvent::new(ep, kind);
        e.set_status(status).set_parameters(parameters);
        e.into()
    }

    fn dev_event(kind: DevEventKind, info: u16) -> u32 {
        let mut e = DevEvent::new(kind);
        e.set_event_info(info);
        e.into()
    }

    fn bulk_in(ep_num: u8) -> EndpointConfig {
        EndpointConfig {
            ep: EpNumber::new(ep_num, Direction::In),
            ty: TransferType::Bulk,
            max_packet_size: 512,
            fifo_number: ep_num,
            burst_size: 0,
            interval_m1: 0,
        }
    }

    struct StubHost {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    impl HostRole for StubHost {
        fn start(&mut self, _resources: &HostResources) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::HostStartFailed);
            }
            self.starts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stub_host() -> (Box<StubHost>, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(false));
        let host = Box::new(StubHost {
            starts: starts.clone(),
            stops: stops.clone(),
            fail: fail.clone(),
        });
        (host, starts, stops, fail)
    }

    #[test]
    fn bring_up_programs_event_buffer_and_control_pipe() {
        let dwc = peripheral();
        assert_eq!(dwc.current_role(), Role::Device);
        let mut c = dwc.lock();
        assert_eq!(c.regs.gctl().get_prtcapdir(), Gctl::PRTCAP_DEVICE);
        assert_eq!(c.regs.gevntsiz(0).get_size(), EVENT_BUFFER_LENGTH as u16);
        assert!(c.regs.devten().get_usbrsten());
        assert!(c.regs.devten().get_connectdoneen());
        // Both control endpoints live, setup descriptor in flight.
        assert_eq!(c.regs.dalepena(), 0b11);
        assert!(c.eps[0].as_ref().unwrap().transfer_started());
        assert_eq!(c.ep0.state(), Ep0State::SetupPhase);
        let addr = c.evt_buf.dma_addr();
        let bus = c.regs.bus_mut();
        assert_eq!(bus.last_write(regmap::gevntadrlo(0)), Some(addr as u32));
        assert_eq!(bus.last_write(regmap::gevntadrhi(0)), Some((addr >> 32) as u32));
    }

    #[test]
    fn zero_pending_events_is_a_noop() {
        let dwc = peripheral();
        let notes = dwc.process_events().unwrap();
        assert!(notes.is_empty());
    }

    #[test]
    fn two_stage_control_transfer_walks_the_documented_states() {
        let dwc = peripheral();
        {
            let mut c = dwc.lock();
            // SET_CONFIGURATION(1) arrives.
            c.ep0.setup_buf_mut()[..8]
                .copy_from_slice(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
            let ep0_out = c.eps[0].as_mut().unwrap();
            let dq = ep0_out.ring.dequeue_index();
            ep0_out.ring.fake_completion(dq, 0, 0);
            c.inject_event(ep_event(0, EpEventKind::XferComplete, 0, 0));
        }
        let notes = dwc.process_events().unwrap();
        assert!(matches!(notes.as_slice(), [Notification::SetupPacket(s)] if s.request == 0x09));
        assert_eq!(dwc.ep0_state(), Ep0State::StatusPhase);

        {
            let mut c = dwc.lock();
            c.inject_event(ep_event(
                1,
                EpEventKind::XferNotReady,
                EpEvent::CONTROL_PHASE_STATUS,
                0,
            ));
        }
        dwc.process_events().unwrap();
        {
            let mut c = dwc.lock();
            let ep0_in = c.eps[1].as_mut().unwrap();
            assert!(ep0_in.transfer_started());
            let dq = ep0_in.ring.dequeue_index();
            ep0_in.ring.fake_completion(dq, 0, 0);
            c.inject_event(ep_event(1, EpEventKind::XferComplete, 0, 0));
        }
        dwc.process_events().unwrap();
        // Status retired: back in the setup phase with a fresh setup armed.
        assert_eq!(dwc.ep0_state(), Ep0State::SetupPhase);
        let mut c = dwc.lock();
        assert!(c.eps[0].as_mut().unwrap().transfer_started());
    }

    #[test]
    fn cancellation_reports_only_after_the_acknowledgment_event() {
        let dwc = peripheral();
        dwc.enable_endpoint(bulk_in(2)).unwrap();
        let ep = EpNumber::new(2, Direction::In);
        let mut req = Request::new(42);
        req.add_segment(0x4_0000, 512).unwrap();
        dwc.submit(ep, req).unwrap();

        dwc.cancel(ep, 42).unwrap();
        let notes = dwc.process_events().unwrap();
        assert!(
            notes.is_empty(),
            "cancelled completion before hardware acknowledged: {notes:?}"
        );

        {
            let mut c = dwc.lock();
            c.inject_event(ep_event(
                ep.number(),
                EpEventKind::EpCmdComplete,
                0,
                u16::from(u8::from(EpCommandKind::EndTransfer)) << 8,
            ));
        }
        let notes = dwc.process_events().unwrap();
        match notes.as_slice() {
            [Notification::Complete {
                request, status, ..
            }] => {
                assert_eq!(request.tag, 42);
                assert_eq!(*status, TransferStatus::Cancelled);
            }
            other => panic!("expected one cancelled completion, got {other:?}"),
        }
    }

    #[test]
    fn rapid_toggling_runs_exactly_one_switch_to_the_latest_target() {
        let config = Config {
            dr_mode: DrMode::Otg,
            ..Config::default()
        };
        let dwc = Dwc3::new(FakeBus::new(), config).unwrap();
        let (host, starts, stops, _fail) = stub_host();
        dwc.register_host(host);
        // OSTS reads 0: id grounded, we start as host.
        dwc.start().unwrap();
        assert_eq!(dwc.current_role(), Role::Host);
        assert_eq!(starts.load(Ordering::Relaxed), 1);

        // The cable bounces twice before the switch task runs.
        dwc.set_role_inputs(true, true); // device
        dwc.set_role_inputs(true, false); // idle
        dwc.process_role_switch().unwrap();

        assert_eq!(dwc.current_role(), Role::Idle);
        assert_eq!(stops.load(Ordering::Relaxed), 1);
        // The intermediate device target never started.
        let mut c = dwc.lock();
        assert!(c.eps[0].is_none());
        assert_eq!(starts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn host_start_failure_leaves_idle_and_is_retried_on_the_next_signal() {
        let config = Config {
            dr_mode: DrMode::Otg,
            ..Config::default()
        };
        let dwc = Dwc3::new(FakeBus::new(), config).unwrap();
        let (host, starts, _stops, fail) = stub_host();
        fail.store(true, Ordering::Relaxed);
        dwc.register_host(host);
        // Non-fatal: start() succeeds, the controller just stays idle.
        dwc.start().unwrap();
        assert_eq!(dwc.current_role(), Role::Idle);
        assert_eq!(starts.load(Ordering::Relaxed), 0);

        fail.store(false, Ordering::Relaxed);
        dwc.set_role_inputs(false, false);
        dwc.process_role_switch().unwrap();
        assert_eq!(dwc.current_role(), Role::Host);
        assert_eq!(starts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn device_start_failure_is_fatal_for_the_attempt() {
        let config = Config {
            dr_mode: DrMode::Peripheral,
            ..Config::default()
        };
        let mut bus = FakeBus::new();
        bus.auto_clear_cmdact = false;
        let dwc = Dwc3::new(bus, config).unwrap();
        let err = dwc.start().unwrap_err();
        assert_eq!(
            err,
            Error::EpCommandTimedOut(EpCommandKind::StartNewConfig)
        );
        assert_eq!(dwc.current_role(), Role::Idle);
    }

    #[test]
    fn oversized_event_count_resyncs_and_surfaces_overflow() {
        let dwc = peripheral();
        {
            let mut c = dwc.lock();
            c.regs
                .bus_mut()
                .seed(regmap::gevntcount(0), (EVENT_BUFFER_LENGTH + 904) as u32);
        }
        assert_eq!(dwc.process_events().unwrap_err(), Error::EventBufferOverflow);
        {
            let c = dwc.lock();
            assert_eq!(c.evt_buf.lpos(), 904);
        }
        // Stream continues normally afterwards.
        {
            let mut c = dwc.lock();
            c.inject_event(dev_event(DevEventKind::Wakeup, 0));
        }
        let notes = dwc.process_events().unwrap();
        assert!(matches!(notes.as_slice(), [Notification::Resume]));
    }

    #[test]
    fn interrupt_masks_the_event_buffer_until_drained() {
        let dwc = peripheral();
        {
            let mut c = dwc.lock();
            c.inject_event(dev_event(DevEventKind::Wakeup, 0));
        }
        assert!(dwc.interrupt());
        {
            let c = dwc.lock();
            assert!(c.regs.gevntsiz(0).get_intmask());
        }
        let notes = dwc.process_events().unwrap();
        assert!(matches!(notes.as_slice(), [Notification::Resume]));
        let c = dwc.lock();
        assert!(!c.regs.gevntsiz(0).get_intmask());
        assert_eq!(c.regs.gevntcount(0), 0);
    }

    #[test]
    fn connect_done_takes_the_negotiated_speed() {
        let dwc = peripheral();
        {
            let mut c = dwc.lock();
            // Halted bit stays, connect speed reads SuperSpeed.
            c.regs.bus_mut().seed(regmap::DSTS, (1 << 22) | 4);
            c.inject_event(dev_event(DevEventKind::ConnectDone, 0));
        }
        let notes = dwc.process_events().unwrap();
        assert!(
            matches!(notes.as_slice(), [Notification::Connect { speed }] if *speed == Speed::Super)
        );
        let c = dwc.lock();
        // U1/U2 acceptance switched on for SuperSpeed.
        assert!(c.regs.dctl().get_acceptu1ena());
        assert!(c.regs.dctl().get_acceptu2ena());
    }

    #[test]
    fn link_suspend_and_resume_notifications() {
        let dwc = peripheral();
        {
            let mut c = dwc.lock();
            c.inject_event(dev_event(DevEventKind::LinkStatusChange, 0x0)); // U0
            c.inject_event(dev_event(DevEventKind::LinkStatusChange, 0x3)); // U3
            c.inject_event(dev_event(DevEventKind::LinkStatusChange, 0x0)); // back
        }
        let notes = dwc.process_events().unwrap();
        assert!(matches!(
            notes.as_slice(),
            [Notification::Suspend, Notification::Resume]
        ));
        assert_eq!(dwc.link_state(), LinkState::U0);
    }
}
