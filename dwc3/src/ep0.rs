//! Control-endpoint (EP0) transfer state machine.
//!
//! EP0 cycles `SetupPhase -> DataPhase -> StatusPhase -> SetupPhase`, with
//! the data phase skipped for zero-length setups. Descriptor posting is
//! gated on the hardware's transfer-not-ready events: a data-stage request
//! queued by the upper layer is parked until hardware asks for the data
//! phase, and the status descriptor is posted when hardware asks for the
//! status phase (or, with a delayed status, once the upper layer releases
//! it).

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use core::pin::Pin;

use crate::ep::Endpoint;
use crate::error::{Error, Result};
use crate::event::EpEvent;
use crate::regs::{RegisterBus, Regs};
use crate::request::{Direction, Request, SetupData, TransferStatus};
use crate::trb::TrbKind;

/// Setup/scratch buffer for standard request handling.
pub const EP0_SETUP_SIZE: usize = 512;
/// Bounce buffer; sized for one SuperSpeed bulk packet so it can also pad
/// unaligned OUT transfers on other endpoints.
pub const EP0_BOUNCE_SIZE: usize = 1024;

auto_repr_tryfrom! {
    /// Control transfer phase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Ep0State: u8 {
        Unconnected = 0,
        SetupPhase = 1,
        DataPhase = 2,
        StatusPhase = 3,
    }
}

/// The next transfer-not-ready phase we expect from hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ep0Next {
    Unknown,
    NrdyData,
    NrdyStatus,
    Complete,
}

#[derive(Debug)]
pub(crate) struct Ep0 {
    state: Ep0State,
    next_event: Ep0Next,
    /// The data stage moves device-to-host.
    expect_in: bool,
    three_stage: bool,
    /// The active data stage runs through the bounce buffer.
    bounced: bool,
    delayed_status: bool,
    /// Hardware already asked for the data phase but no request was queued.
    data_nrdy_pending: bool,
    /// Hardware already asked for the status phase but it is held back.
    status_nrdy_pending: bool,
    /// Data-stage request parked until hardware asks for the data phase.
    parked: Option<Request>,
    /// Data-stage request whose descriptor is posted.
    in_flight: Option<Request>,
    /// Length the in-flight data descriptor was posted with.
    posted_len: u32,
    setup_buf: Pin<Box<[u8]>>,
    bounce: Pin<Box<[u8]>>,
}

impl Ep0 {
    pub fn new() -> Self {
        Self {
            state: Ep0State::Unconnected,
            next_event: Ep0Next::Unknown,
            expect_in: false,
            three_stage: false,
            bounced: false,
            delayed_status: false,
            data_nrdy_pending: false,
            status_nrdy_pending: false,
            parked: None,
            in_flight: None,
            posted_len: 0,
            setup_buf: Pin::new(vec![0u8; EP0_SETUP_SIZE].into_boxed_slice()),
            bounce: Pin::new(vec![0u8; EP0_BOUNCE_SIZE].into_boxed_slice()),
        }
    }

    pub fn state(&self) -> Ep0State {
        self.state
    }
    pub fn set_delayed_status(&mut self) {
        self.delayed_status = true;
    }

    pub fn setup_buf_addr(&self) -> u64 {
        self.setup_buf.as_ptr() as u64
    }
    pub fn bounce_addr(&self) -> u64 {
        self.bounce.as_ptr() as u64
    }

    /// Drop all per-transfer state; used on disconnect/reset. Returns the
    /// data-stage request the teardown orphaned, if any.
    pub fn reset(&mut self) -> Option<Request> {
        self.state = Ep0State::Unconnected;
        self.next_event = Ep0Next::Unknown;
        self.three_stage = false;
        self.bounced = false;
        self.delayed_status = false;
        self.data_nrdy_pending = false;
        self.status_nrdy_pending = false;
        let in_flight = self.in_flight.take();
        in_flight.or_else(|| self.parked.take())
    }

    /// Post the setup descriptor and enter the setup phase.
    pub fn arm_setup<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep0_out: &mut Endpoint,
    ) -> Result<()> {
        self.state = Ep0State::SetupPhase;
        self.next_event = Ep0Next::Complete;
        self.data_nrdy_pending = false;
        self.status_nrdy_pending = false;
        self.post_trb(regs, ep0_out, TrbKind::ControlSetup, self.setup_buf_addr(), 8)
    }

    fn post_trb<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep: &mut Endpoint,
        kind: TrbKind,
        addr: u64,
        len: u32,
    ) -> Result<()> {
        let index = ep.ring.enqueue_index();
        ep.ring.enqueue_with(|trb| {
            trb.set_buffer(addr)
                .set_length(len)
                .set_kind(kind)
                .set_isp_imi(true)
                .set_ioc(true)
                .set_lst(true);
        });
        let td_addr = ep.ring.addr_of(index);
        ep.start_transfer(regs, td_addr)
    }

    /// Setup descriptor retired: capture the packet and pick the next phase.
    ///
    /// A setup completion while a previous transfer is still open means the
    /// host started over; the stale request is returned for a cancelled
    /// completion.
    pub fn on_setup_complete(
        &mut self,
        ep0_out: &mut Endpoint,
    ) -> (SetupData, Option<Request>) {
        ep0_out.finish_control_stage();
        let stale = self.in_flight.take().or_else(|| self.parked.take());

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.setup_buf[..8]);
        let setup = SetupData::from_bytes(&raw);

        self.state = Ep0State::SetupPhase;
        self.bounced = false;
        self.delayed_status = false;
        self.data_nrdy_pending = false;
        self.status_nrdy_pending = false;
        if setup.has_data_stage() {
            self.three_stage = true;
            self.expect_in = setup.direction() == Direction::In;
            self.state = Ep0State::DataPhase;
            self.next_event = Ep0Next::NrdyData;
        } else {
            self.three_stage = false;
            self.expect_in = false;
            self.state = Ep0State::StatusPhase;
            self.next_event = Ep0Next::NrdyStatus;
        }
        (setup, stale)
    }

    /// Upper layer supplies the data-stage request.
    pub fn queue_data<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep0_out: &mut Endpoint,
        ep0_in: &mut Endpoint,
        request: Request,
    ) -> Result<()> {
        if self.state != Ep0State::DataPhase {
            return Err(Error::InvalidControlPhase(self.state));
        }
        if self.data_nrdy_pending {
            self.data_nrdy_pending = false;
            self.next_event = Ep0Next::Complete;
            self.post_data(regs, ep0_out, ep0_in, request)
        } else {
            self.parked = Some(request);
            Ok(())
        }
    }

    fn post_data<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep0_out: &mut Endpoint,
        ep0_in: &mut Endpoint,
        request: Request,
    ) -> Result<()> {
        let (ep, mps) = if self.expect_in {
            let mps = u32::from(ep_mps(ep0_in));
            (ep0_in, mps)
        } else {
            let mps = u32::from(ep_mps(ep0_out));
            (ep0_out, mps)
        };
        let seg = request.segments().first().copied();
        let length = request.length();

        // Undersized or unaligned OUT data lands in the bounce buffer and
        // is copied back on completion.
        let (addr, len) = match seg {
            Some(seg) if self.expect_in => (seg.addr, seg.len),
            Some(seg) if length % mps == 0 => (seg.addr, seg.len),
            _ => {
                assert!(
                    length as usize <= EP0_BOUNCE_SIZE,
                    "bounced control data exceeds the bounce buffer"
                );
                self.bounced = true;
                let rounded = length.div_ceil(mps).max(1) * mps;
                (self.bounce_addr(), rounded)
            }
        };

        self.in_flight = Some(request);
        self.posted_len = len;
        self.post_trb(regs, ep, TrbKind::ControlData, addr, len)
    }

    /// Transfer-not-ready on a control endpoint.
    pub fn on_xfer_not_ready<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep0_out: &mut Endpoint,
        ep0_in: &mut Endpoint,
        event: EpEvent,
    ) -> Result<()> {
        match event.control_phase() {
            EpEvent::CONTROL_PHASE_DATA => {
                if self.next_event != Ep0Next::NrdyData {
                    log::warn!("unexpected data-phase request in {:?}", self.state);
                    return self.stall_and_restart(regs, ep0_out);
                }
                match self.parked.take() {
                    Some(request) => {
                        self.next_event = Ep0Next::Complete;
                        self.post_data(regs, ep0_out, ep0_in, request)
                    }
                    None => {
                        self.data_nrdy_pending = true;
                        Ok(())
                    }
                }
            }
            EpEvent::CONTROL_PHASE_STATUS => {
                if self.next_event != Ep0Next::NrdyStatus {
                    log::warn!("unexpected status-phase request in {:?}", self.state);
                    return self.stall_and_restart(regs, ep0_out);
                }
                if self.delayed_status {
                    self.status_nrdy_pending = true;
                    return Ok(());
                }
                self.post_status(regs, ep0_out, ep0_in)
            }
            _ => Ok(()),
        }
    }

    /// Data descriptor retired; returns the completed request. The state
    /// machine moves to the status phase unless the upper layer asked for a
    /// delayed status.
    pub fn on_data_complete<B: RegisterBus>(
        &mut self,
        ep0_out: &mut Endpoint,
        ep0_in: &mut Endpoint,
        event: EpEvent,
    ) -> Result<(Request, TransferStatus)> {
        let ep = if self.expect_in { ep0_in } else { ep0_out };
        let trb = *ep.ring.peek_dequeue();
        ep.finish_control_stage();
        let mut request = self
            .in_flight
            .take()
            .ok_or(Error::InvalidControlPhase(self.state))?;

        let expected = request.length();
        // Hardware leaves the residual in the descriptor's size field.
        let written = self.posted_len.saturating_sub(trb.length());
        request.actual = written.min(expected);

        if self.bounced {
            self.bounced = false;
            if let Some(seg) = request.segments().first() {
                let n = request.actual.min(seg.len) as usize;
                // The segment address is the caller's identity-mapped
                // buffer; it stays alive until the completion we are about
                // to report.
                unsafe {
                    core::ptr::copy_nonoverlapping(self.bounce.as_ptr(), seg.addr as *mut u8, n);
                }
            }
        }

        let status = if event.bus_error() {
            TransferStatus::BusError
        } else if request.actual < expected {
            TransferStatus::ShortPacket
        } else {
            TransferStatus::Completed
        };

        self.state = Ep0State::StatusPhase;
        self.next_event = Ep0Next::NrdyStatus;
        Ok((request, status))
    }

    /// Release a delayed status stage.
    pub fn accept_status<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep0_out: &mut Endpoint,
        ep0_in: &mut Endpoint,
    ) -> Result<()> {
        if !self.delayed_status {
            return Err(Error::DelayedStatusNotPending);
        }
        self.delayed_status = false;
        if self.status_nrdy_pending {
            self.status_nrdy_pending = false;
            self.post_status(regs, ep0_out, ep0_in)?;
        }
        Ok(())
    }

    fn post_status<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep0_out: &mut Endpoint,
        ep0_in: &mut Endpoint,
    ) -> Result<()> {
        self.next_event = Ep0Next::Complete;
        // Status always runs opposite the data stage; with no data stage it
        // is an IN handshake.
        let (ep, kind) = if self.three_stage {
            let ep = if self.expect_in { ep0_out } else { ep0_in };
            (ep, TrbKind::ControlStatus3)
        } else {
            (ep0_in, TrbKind::ControlStatus2)
        };
        let addr = self.bounce_addr();
        self.post_trb(regs, ep, kind, addr, 0)
    }

    /// Status descriptor retired: re-arm for the next setup packet.
    pub fn on_status_complete<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep0_out: &mut Endpoint,
        ep0_in: &mut Endpoint,
    ) -> Result<()> {
        // The status stage ran opposite the data stage (IN when there was
        // no data stage).
        let ep = if self.three_stage && self.expect_in {
            &mut *ep0_out
        } else {
            &mut *ep0_in
        };
        ep.finish_control_stage();
        self.arm_setup(regs, ep0_out)
    }

    /// Protocol error: stall the control pipe and wait for a fresh setup.
    pub fn stall_and_restart<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        ep0_out: &mut Endpoint,
    ) -> Result<()> {
        if let Some(stale) = self.in_flight.take().or_else(|| self.parked.take()) {
            log::debug!("ep0 stall drops request tag {}", stale.tag);
        }
        ep0_out.set_halt(regs, true, false)?;
        self.arm_setup(regs, ep0_out)
    }

    #[cfg(test)]
    pub(crate) fn setup_buf_mut(&mut self) -> &mut [u8] {
        &mut self.setup_buf
    }

    #[cfg(test)]
    pub(crate) fn bounce_mut(&mut self) -> &mut [u8] {
        &mut self.bounce
    }
}

fn ep_mps(ep: &Endpoint) -> u16 {
    ep.config().max_packet_size
}
