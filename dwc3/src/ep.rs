//! Device-side endpoints.
//!
//! An endpoint owns its descriptor ring and three ordered request queues:
//! *pending* (not yet given to hardware), *started* (descriptors posted)
//! and *cancelled* (end-transfer issued, acknowledgment outstanding). At
//! most one start-transfer may be outstanding per endpoint; the head of the
//! started queue always corresponds to the oldest unretired descriptor
//! chain.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::command::{
    self, ConfigAction, EpCmdParams, EpCommandKind,
};
use crate::error::{Error, Result};
use crate::event::EpEvent;
use crate::regs::{Depcmd, RegisterBus, Regs};
use crate::request::{Direction, EpNumber, Request, TransferStatus};
use crate::trb::{TrbKind, TrbRing};

auto_repr_tryfrom! {
    /// Transfer type, in the hardware's endpoint-command encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TransferType: u8 {
        Control = 0,
        Isochronous = 1,
        Bulk = 2,
        Interrupt = 3,
    }
}

/// Static shape of one endpoint, as configured by the upper layer.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    pub ep: EpNumber,
    pub ty: TransferType,
    pub max_packet_size: u16,
    /// TX FIFO number; meaningful for IN endpoints only.
    pub fifo_number: u8,
    pub burst_size: u8,
    /// bInterval - 1 for periodic endpoints.
    pub interval_m1: u8,
}

impl EndpointConfig {
    /// Control endpoint shape for the given max packet size.
    pub fn control(ep: EpNumber, max_packet_size: u16) -> Self {
        Self {
            ep,
            ty: TransferType::Control,
            max_packet_size,
            fifo_number: 0,
            burst_size: 0,
            interval_m1: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Endpoint {
    config: EndpointConfig,
    /// Hardware-allocated transfer resource, valid while a transfer is
    /// started.
    resource_index: u8,
    enabled: bool,
    stalled: bool,
    wedged: bool,
    transfer_started: bool,
    end_transfer_pending: bool,
    /// Frame hint from the last transfer-not-ready event; seeds the first
    /// isochronous descriptor.
    frame_number: u16,
    pub(crate) ring: TrbRing,
    pending: VecDeque<Request>,
    started: VecDeque<Request>,
    cancelled: VecDeque<Request>,
    /// Bus address descriptors may use for padding and zero-length slots.
    bounce_addr: u64,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, bounce_addr: u64) -> Self {
        Self {
            config,
            resource_index: 0,
            enabled: false,
            stalled: false,
            wedged: false,
            transfer_started: false,
            end_transfer_pending: false,
            frame_number: 0,
            ring: TrbRing::new(),
            pending: VecDeque::new(),
            started: VecDeque::new(),
            cancelled: VecDeque::new(),
            bounce_addr,
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }
    pub fn number(&self) -> EpNumber {
        self.config.ep
    }
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
    pub fn transfer_started(&self) -> bool {
        self.transfer_started
    }
    pub fn end_transfer_pending(&self) -> bool {
        self.end_transfer_pending
    }
    pub fn resource_index(&self) -> u8 {
        self.resource_index
    }
    pub fn set_max_packet_size(&mut self, mps: u16) {
        self.config.max_packet_size = mps;
    }
    pub fn set_frame_number(&mut self, frame: u16) {
        self.frame_number = frame;
    }

    /// Program the endpoint into hardware and mark it usable.
    pub fn enable<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        action: ConfigAction,
    ) -> Result<()> {
        let ep = self.config.ep;
        let params = command::ep_config_params(&self.config, action);
        command::issue_with_retries(regs, ep, EpCommandKind::SetEpConfig, Depcmd::from(0), &params)?;
        // The transfer resource is allocated once; a later Modify only
        // reshapes the endpoint.
        if action == ConfigAction::Init {
            command::issue_with_retries(
                regs,
                ep,
                EpCommandKind::SetTransferResource,
                Depcmd::from(0),
                &command::transfer_resource_params(),
            )?;
        }
        regs.set_dalepena(regs.dalepena() | 1 << ep.number());
        self.enabled = true;
        log::debug!(
            "ep{} enabled: {:?} mps {}",
            ep.number(),
            self.config.ty,
            self.config.max_packet_size
        );
        Ok(())
    }

    /// Drop the endpoint from hardware and take back every queued request.
    pub fn disable<B: RegisterBus>(&mut self, regs: &mut Regs<B>) -> Vec<Request> {
        regs.set_dalepena(regs.dalepena() & !(1 << self.config.ep.number()));
        self.enabled = false;
        self.stalled = false;
        self.wedged = false;
        self.transfer_started = false;
        self.end_transfer_pending = false;
        self.resource_index = 0;
        self.take_all_requests()
    }

    pub fn take_all_requests(&mut self) -> Vec<Request> {
        let mut all = Vec::new();
        all.extend(self.started.drain(..));
        all.extend(self.cancelled.drain(..));
        all.extend(self.pending.drain(..));
        all
    }

    /// Queue one request and hand as much pending work to hardware as the
    /// ring allows.
    pub fn queue<B: RegisterBus>(&mut self, regs: &mut Regs<B>, request: Request) -> Result<()> {
        if !self.enabled {
            return Err(Error::EndpointNotEnabled(self.config.ep.number()));
        }
        self.pending.push_back(request);
        self.kick(regs)
    }

    /// Move pending requests into the ring. A request that does not fit in
    /// the free slots stays pending in order; that is not an error.
    pub fn kick<B: RegisterBus>(&mut self, regs: &mut Regs<B>) -> Result<()> {
        if self.end_transfer_pending {
            // Descriptors may not be reused until hardware acknowledges
            // the end-transfer.
            return Ok(());
        }
        let start_index = self.ring.enqueue_index();
        let mut queued_any = false;
        while let Some(front) = self.pending.front() {
            if Self::trbs_needed(front, &self.config) > self.ring.num_free() {
                break;
            }
            let mut request = self.pending.pop_front().unwrap();
            self.prepare_trbs(&mut request);
            self.started.push_back(request);
            queued_any = true;
        }
        if !queued_any {
            return Ok(());
        }
        if self.transfer_started {
            self.update_transfer(regs)
        } else {
            let td_addr = self.ring.addr_of(start_index);
            self.start_transfer(regs, td_addr)
        }
    }

    fn trbs_needed(request: &Request, config: &EndpointConfig) -> usize {
        let segs = request.segments().len().max(1);
        segs + usize::from(Self::wants_extra_trb(request, config))
    }

    fn wants_extra_trb(request: &Request, config: &EndpointConfig) -> bool {
        let mps = u32::from(config.max_packet_size);
        let length = request.length();
        match config.ep.direction() {
            // Explicit zero-length packet after a max-packet-multiple.
            Direction::In => request.zero && length != 0 && length % mps == 0,
            // OUT transfers must be received in max-packet multiples; pad
            // odd tails into the bounce slot.
            Direction::Out => length % mps != 0,
        }
    }

    fn prepare_trbs(&mut self, request: &mut Request) {
        let config = self.config;
        let mps = u32::from(config.max_packet_size);
        request.first_trb = self.ring.enqueue_index();
        request.needs_extra_trb = Self::wants_extra_trb(request, &config);

        let segments = request.segments();
        let data_trbs = segments.len().max(1);
        let total = data_trbs + usize::from(request.needs_extra_trb);
        let is_out = config.ep.direction() == Direction::Out;
        let frame = self.frame_number;

        let mut enqueue_data =
            |i: usize, addr: u64, len: u32, ring: &mut TrbRing| {
                let last = i + 1 == total;
                ring.enqueue_with(|trb| {
                    trb.set_buffer(addr).set_length(len);
                    trb.set_kind(match (config.ty, i) {
                        (TransferType::Isochronous, 0) => TrbKind::IsocFirst,
                        (TransferType::Isochronous, _) => TrbKind::Isoc,
                        _ => TrbKind::Normal,
                    });
                    if config.ty == TransferType::Isochronous && i == 0 {
                        trb.set_sid_sofn(frame);
                    }
                    if last {
                        trb.set_ioc(true);
                        if config.ty != TransferType::Isochronous {
                            trb.set_lst(true);
                        }
                    } else {
                        trb.set_chn(true);
                        if is_out {
                            trb.set_csp(true);
                        }
                    }
                });
            };

        if segments.is_empty() {
            enqueue_data(0, self.bounce_addr, 0, &mut self.ring);
        } else {
            for (i, seg) in segments.iter().enumerate() {
                enqueue_data(i, seg.addr, seg.len, &mut self.ring);
            }
        }
        if request.needs_extra_trb {
            let pad = match config.ep.direction() {
                Direction::In => 0,
                Direction::Out => mps - request.length() % mps,
            };
            enqueue_data(total - 1, self.bounce_addr, pad, &mut self.ring);
        }
        request.num_trbs = total as u8;
    }

    pub(crate) fn start_transfer<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        td_addr: u64,
    ) -> Result<()> {
        let params = command::start_transfer_params(td_addr);
        let done = command::issue_with_retries(
            regs,
            self.config.ep,
            EpCommandKind::StartTransfer,
            Depcmd::from(0),
            &params,
        )?;
        self.resource_index = done.get_resource_index();
        self.transfer_started = true;
        Ok(())
    }

    fn update_transfer<B: RegisterBus>(&mut self, regs: &mut Regs<B>) -> Result<()> {
        let mut flags = Depcmd::from(0);
        flags.set_param(u16::from(self.resource_index));
        command::issue_with_retries(
            regs,
            self.config.ep,
            EpCommandKind::UpdateTransfer,
            flags,
            &EpCmdParams::zeroed(),
        )?;
        Ok(())
    }

    /// Abort the running transfer. Completion of cancelled requests waits
    /// for the command-complete event this requests via CMDIOC.
    fn end_transfer<B: RegisterBus>(&mut self, regs: &mut Regs<B>) -> Result<()> {
        if !self.transfer_started || self.end_transfer_pending {
            return Ok(());
        }
        let mut flags = Depcmd::from(0);
        flags.set_param(u16::from(self.resource_index));
        flags.set_hipri_forcerm().set_cmdioc();
        command::issue(
            regs,
            self.config.ep,
            EpCommandKind::EndTransfer,
            flags,
            &EpCmdParams::zeroed(),
        )?;
        self.end_transfer_pending = true;
        Ok(())
    }

    /// Remove `tag` from this endpoint.
    ///
    /// A request hardware never saw is returned immediately. A started
    /// request moves to the cancelled queue until the end-transfer
    /// acknowledgment; started requests queued behind it go back to the
    /// head of the pending queue and restart after the acknowledgment.
    pub fn cancel<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        tag: u32,
    ) -> Result<Option<Request>> {
        if let Some(pos) = self.pending.iter().position(|r| r.tag == tag) {
            return Ok(self.pending.remove(pos));
        }
        let Some(pos) = self.started.iter().position(|r| r.tag == tag) else {
            return Err(Error::NoSuchRequest {
                ep: self.config.ep.number(),
                tag,
            });
        };
        for follower in self.started.drain(pos + 1..).rev() {
            self.pending.push_front(follower);
        }
        let request = self.started.remove(pos).unwrap();
        self.cancelled.push_back(request);
        self.end_transfer(regs)?;
        Ok(None)
    }

    /// End-transfer acknowledgment: reclaim the ring, surface cancelled
    /// requests, restart whatever is pending.
    pub fn on_end_transfer_complete<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
    ) -> Result<Vec<Request>> {
        while self.ring.outstanding() > 0 {
            self.ring.retire();
        }
        // Anything that was mid-flight when the transfer was torn down is
        // reported cancelled together with the explicitly cancelled ones.
        let mut done: Vec<Request> = self.cancelled.drain(..).collect();
        done.extend(self.started.drain(..));
        self.transfer_started = false;
        self.end_transfer_pending = false;
        self.resource_index = 0;
        self.kick(regs)?;
        Ok(done)
    }

    /// Retire the oldest started request against a completion event.
    /// Returns `None` when the head descriptor chain is still in flight.
    pub fn complete_head(&mut self, event: EpEvent) -> Option<(Request, TransferStatus)> {
        let head = self.started.front()?;
        let data_trbs = usize::from(head.num_trbs) - usize::from(head.needs_extra_trb);

        // The chain may still be in progress (e.g. in-progress event for an
        // earlier descriptor).
        if self.ring.peek_dequeue().hwo() && !event.missed_isoc() {
            return None;
        }

        let mut request = self.started.pop_front().unwrap();
        let mut residual = 0u32;
        let mut missed_isoc = false;
        for i in 0..usize::from(request.num_trbs) {
            let trb = self.ring.retire();
            if i < data_trbs {
                residual += trb.length();
            }
            missed_isoc |= trb.status() == crate::trb::TrbStatus::MissedIsoc;
        }
        request.actual = request.length().saturating_sub(residual);

        let status = if event.bus_error() {
            TransferStatus::BusError
        } else if missed_isoc {
            TransferStatus::MissedIsoc
        } else if event.short_packet() || request.actual < request.length() {
            TransferStatus::ShortPacket
        } else {
            TransferStatus::Completed
        };

        if self.config.ty != TransferType::Isochronous && event.last_of_transfer() {
            self.transfer_started = false;
            self.resource_index = 0;
        }
        Some((request, status))
    }

    /// Retire the single posted control-stage descriptor. Every control
    /// stage is its own start-transfer, so the resource is gone with it.
    pub(crate) fn finish_control_stage(&mut self) {
        while self.ring.outstanding() > 0 {
            self.ring.retire();
        }
        self.transfer_started = false;
        self.resource_index = 0;
    }

    pub fn set_halt<B: RegisterBus>(
        &mut self,
        regs: &mut Regs<B>,
        halted: bool,
        clearpendin: bool,
    ) -> Result<()> {
        if halted {
            command::issue_with_retries(
                regs,
                self.config.ep,
                EpCommandKind::SetStall,
                Depcmd::from(0),
                &EpCmdParams::zeroed(),
            )?;
            self.stalled = true;
        } else {
            if self.wedged {
                // A wedged endpoint stays halted until the wedge is
                // dropped by disable/reset.
                return Ok(());
            }
            let mut flags = Depcmd::from(0);
            if clearpendin {
                flags.set_clearpendin();
            }
            command::issue_with_retries(
                regs,
                self.config.ep,
                EpCommandKind::ClearStall,
                flags,
                &EpCmdParams::zeroed(),
            )?;
            self.stalled = false;
            self.kick(regs)?;
        }
        Ok(())
    }

    pub fn set_wedge<B: RegisterBus>(&mut self, regs: &mut Regs<B>) -> Result<()> {
        self.wedged = true;
        self.set_halt(regs, true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::MAX_SEGMENTS;
    use crate::testing::FakeBus;
    use crate::trb::USABLE_TRBS;

    fn bulk_in_ep() -> Endpoint {
        Endpoint::new(
            EndpointConfig {
                ep: EpNumber::new(1, Direction::In),
                ty: TransferType::Bulk,
                max_packet_size: 512,
                fifo_number: 1,
                burst_size: 0,
                interval_m1: 0,
            },
            0xb000,
        )
    }

    fn enabled_bulk_in(regs: &mut Regs<FakeBus>) -> Endpoint {
        let mut ep = bulk_in_ep();
        ep.enable(regs, ConfigAction::Init).unwrap();
        ep
    }

    fn request(tag: u32, len: u32) -> Request {
        let mut req = Request::new(tag);
        req.add_segment(0x1_0000, len).unwrap();
        req
    }

    #[test]
    fn enable_sets_dalepena_bit() {
        let mut regs = Regs::new(FakeBus::new());
        let _ep = enabled_bulk_in(&mut regs);
        assert_eq!(regs.dalepena(), 1 << 3);
    }

    #[test]
    fn queue_starts_transfer_and_caches_resource_index() {
        let mut regs = Regs::new(FakeBus::new());
        let mut ep = enabled_bulk_in(&mut regs);
        ep.queue(&mut regs, request(1, 512)).unwrap();
        assert!(ep.transfer_started());
        assert_eq!(ep.resource_index(), 0x11);
        assert_eq!(ep.ring.outstanding(), 1);
        let trb = ep.ring.trb(0);
        assert!(trb.hwo());
        assert!(trb.lst());
        assert!(trb.ioc());
    }

    #[test]
    fn in_zlp_consumes_an_extra_descriptor() {
        let mut regs = Regs::new(FakeBus::new());
        let mut ep = enabled_bulk_in(&mut regs);
        let mut req = request(2, 1024);
        req.zero = true;
        ep.queue(&mut regs, req).unwrap();
        assert_eq!(ep.ring.outstanding(), 2);
        // Data descriptor chains into the zero-length terminator.
        assert!(ep.ring.trb(0).chn());
        assert_eq!(ep.ring.trb(1).length(), 0);
        assert!(ep.ring.trb(1).lst());
    }

    #[test]
    fn ring_exhaustion_keeps_request_pending() {
        let mut regs = Regs::new(FakeBus::new());
        let mut ep = enabled_bulk_in(&mut regs);
        // 31 full-width requests consume 248 slots; the next one needs 8
        // but only 7 remain.
        for tag in 0..31 {
            let mut req = Request::new(tag);
            for s in 0..MAX_SEGMENTS {
                req.add_segment(0x1_0000 + s as u64 * 512, 512).unwrap();
            }
            ep.queue(&mut regs, req).unwrap();
        }
        assert_eq!(ep.ring.num_free(), USABLE_TRBS - 31 * 8);
        let mut big = Request::new(99);
        for s in 0..MAX_SEGMENTS {
            big.add_segment(0x9_0000 + s as u64 * 512, 512).unwrap();
        }
        ep.queue(&mut regs, big).unwrap();
        // Not enqueued, not lost, not an error.
        assert_eq!(ep.ring.num_free(), USABLE_TRBS - 31 * 8);
        assert_eq!(ep.pending.len(), 1);
        assert_eq!(ep.started.len(), 31);
    }

    #[test]
    fn completion_reports_short_packets_with_actual_length() {
        let mut regs = Regs::new(FakeBus::new());
        let mut ep = enabled_bulk_in(&mut regs);
        ep.queue(&mut regs, request(5, 512)).unwrap();
        // Hardware moved 500 of 512 bytes.
        ep.ring.fake_completion(0, 12, 0);
        let mut event = crate::event::EpEvent::new(3, crate::event::EpEventKind::XferComplete);
        event.set_status(0x2 | 0x8); // short | last
        let (req, status) = ep.complete_head(event).unwrap();
        assert_eq!(req.tag, 5);
        assert_eq!(req.actual(), 500);
        assert_eq!(status, TransferStatus::ShortPacket);
        assert!(!ep.transfer_started());
        assert_eq!(ep.ring.num_free(), USABLE_TRBS);
    }

    #[test]
    fn cancel_of_started_request_waits_for_acknowledgment() {
        let mut regs = Regs::new(FakeBus::new());
        let mut ep = enabled_bulk_in(&mut regs);
        ep.queue(&mut regs, request(1, 512)).unwrap();
        ep.queue(&mut regs, request(2, 512)).unwrap();

        let immediate = ep.cancel(&mut regs, 1).unwrap();
        assert!(immediate.is_none());
        assert!(ep.end_transfer_pending());
        assert_eq!(ep.cancelled.len(), 1);
        // The follower went back to pending and must not be re-enqueued
        // while the acknowledgment is outstanding.
        assert_eq!(ep.pending.len(), 1);
        let outstanding = ep.ring.outstanding();
        ep.kick(&mut regs).unwrap();
        assert_eq!(ep.ring.outstanding(), outstanding);

        let done = ep.on_end_transfer_complete(&mut regs).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].tag, 1);
        // The follower restarted on a clean ring.
        assert!(ep.transfer_started());
        assert_eq!(ep.started.len(), 1);
        assert_eq!(ep.started[0].tag, 2);
    }

    #[test]
    fn cancel_of_pending_request_completes_immediately() {
        let mut regs = Regs::new(FakeBus::new());
        let mut ep = bulk_in_ep();
        ep.enable(&mut regs, ConfigAction::Init).unwrap();
        // Block the ring so the second request stays pending.
        for tag in 0..31 {
            let mut req = Request::new(tag);
            for s in 0..MAX_SEGMENTS {
                req.add_segment(0x1_0000 + s as u64 * 512, 512).unwrap();
            }
            ep.queue(&mut regs, req).unwrap();
        }
        let mut parked = Request::new(77);
        for s in 0..MAX_SEGMENTS {
            parked.add_segment(0x9_0000 + s as u64 * 512, 512).unwrap();
        }
        ep.queue(&mut regs, parked).unwrap();
        let got = ep.cancel(&mut regs, 77).unwrap();
        assert_eq!(got.unwrap().tag, 77);
        assert!(!ep.end_transfer_pending());
    }

    #[test]
    fn wedged_endpoint_ignores_clear_halt() {
        let mut regs = Regs::new(FakeBus::new());
        let mut ep = enabled_bulk_in(&mut regs);
        ep.set_wedge(&mut regs).unwrap();
        assert!(ep.is_stalled());
        ep.set_halt(&mut regs, false, false).unwrap();
        assert!(ep.is_stalled());
    }
}
