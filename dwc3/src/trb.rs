//! Transfer descriptors and the per-endpoint descriptor ring.
//!
//! A descriptor is four 32-bit words in hardware layout: buffer address
//! low/high, transfer size plus hardware-written status, and a control word
//! carrying the descriptor kind and the ownership handoff bit. The ring is
//! a fixed circle of 256 descriptors whose last slot permanently holds a
//! link descriptor back to slot 0.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use core::pin::Pin;
use core::sync::atomic::{compiler_fence, Ordering};

use bit_field::BitField;

/// Ring capacity including the reserved link slot.
pub const TRBS_PER_RING: usize = 256;
/// Slots usable for transfer descriptors.
pub const USABLE_TRBS: usize = TRBS_PER_RING - 1;
const LINK_INDEX: u8 = (TRBS_PER_RING - 1) as u8;

auto_repr_tryfrom! {
    /// Descriptor kind, control word bits 9:4.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TrbKind: u8 {
        Normal = 1,
        ControlSetup = 2,
        ControlStatus2 = 3,
        ControlStatus3 = 4,
        ControlData = 5,
        IsocFirst = 6,
        Isoc = 7,
        Link = 8,
    }
}

/// Hardware-written completion status, size word bits 31:28.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrbStatus {
    Ok,
    MissedIsoc,
    SetupPending,
    InProgress,
}

impl TrbStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::MissedIsoc,
            2 => Self::SetupPending,
            4 => Self::InProgress,
            _ => Self::Ok,
        }
    }
}

/// One transfer descriptor in hardware format.
///
/// Hardware fetches descriptors by bus address; 16-byte alignment keeps a
/// descriptor from straddling a burst boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct Trb {
    bpl: u32,
    bph: u32,
    size: u32,
    ctrl: u32,
}

impl Trb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_buffer(&mut self, addr: u64) -> &mut Self {
        self.bpl = addr as u32;
        self.bph = (addr >> 32) as u32;
        self
    }
    pub fn buffer(&self) -> u64 {
        (u64::from(self.bph) << 32) | u64::from(self.bpl)
    }

    /// Transfer size; hardware rewrites this with the residual count on
    /// retirement.
    pub fn set_length(&mut self, len: u32) -> &mut Self {
        self.size.set_bits(0..=23, len & 0xff_ffff);
        self
    }
    pub fn length(&self) -> u32 {
        self.size.get_bits(0..=23)
    }

    pub fn status(&self) -> TrbStatus {
        TrbStatus::from_raw(self.size.get_bits(28..=31) as u8)
    }
    pub fn set_status_raw(&mut self, raw: u8) -> &mut Self {
        self.size.set_bits(28..=31, u32::from(raw) & 0xf);
        self
    }

    /// Hardware-owned bit; the ownership handoff point.
    pub fn hwo(&self) -> bool {
        self.ctrl.get_bit(0)
    }
    pub fn set_hwo(&mut self, owned: bool) -> &mut Self {
        self.ctrl.set_bit(0, owned);
        self
    }

    /// Last descriptor of the transfer.
    pub fn set_lst(&mut self, last: bool) -> &mut Self {
        self.ctrl.set_bit(1, last);
        self
    }
    pub fn lst(&self) -> bool {
        self.ctrl.get_bit(1)
    }

    /// More descriptors follow in this logical transfer.
    pub fn set_chn(&mut self, chain: bool) -> &mut Self {
        self.ctrl.set_bit(2, chain);
        self
    }
    pub fn chn(&self) -> bool {
        self.ctrl.get_bit(2)
    }

    /// Continue on short packet.
    pub fn set_csp(&mut self, csp: bool) -> &mut Self {
        self.ctrl.set_bit(3, csp);
        self
    }
    pub fn csp(&self) -> bool {
        self.ctrl.get_bit(3)
    }

    pub fn set_kind(&mut self, kind: TrbKind) -> &mut Self {
        self.ctrl.set_bits(4..=9, u32::from(u8::from(kind)));
        self
    }
    pub fn kind(&self) -> Result<TrbKind, u8> {
        TrbKind::try_from(self.ctrl.get_bits(4..=9) as u8)
    }

    /// Interrupt on short packet / immediate.
    pub fn set_isp_imi(&mut self, isp: bool) -> &mut Self {
        self.ctrl.set_bit(10, isp);
        self
    }

    pub fn set_ioc(&mut self, ioc: bool) -> &mut Self {
        self.ctrl.set_bit(11, ioc);
        self
    }
    pub fn ioc(&self) -> bool {
        self.ctrl.get_bit(11)
    }

    /// Stream id, or the target (micro)frame for the first isochronous
    /// descriptor.
    pub fn set_sid_sofn(&mut self, value: u16) -> &mut Self {
        self.ctrl.set_bits(14..=29, u32::from(value));
        self
    }
    pub fn sid_sofn(&self) -> u16 {
        self.ctrl.get_bits(14..=29) as u16
    }
}

/// Circular descriptor ring with one enqueue and one dequeue index.
///
/// The indices are `u8` and the ring holds 256 slots, so wraparound is
/// free; the skip over the reserved link slot is still written out
/// explicitly so the arithmetic survives a different ring size or index
/// width. Full and empty both look like `enqueue == dequeue` and are told
/// apart by the ownership bit of the slot under the index.
#[derive(Debug)]
pub struct TrbRing {
    trbs: Pin<Box<[Trb]>>,
    enqueue: u8,
    dequeue: u8,
}

impl TrbRing {
    pub fn new() -> Self {
        let mut ring = Self {
            trbs: Pin::new(vec![Trb::new(); TRBS_PER_RING].into_boxed_slice()),
            enqueue: 0,
            dequeue: 0,
        };
        let head = ring.head_addr();
        let link = &mut ring.trbs[LINK_INDEX as usize];
        link.set_buffer(head).set_kind(TrbKind::Link).set_hwo(true);
        ring
    }

    pub fn head_addr(&self) -> u64 {
        self.trbs.as_ptr() as u64
    }

    pub fn addr_of(&self, index: u8) -> u64 {
        self.head_addr() + u64::from(index) * core::mem::size_of::<Trb>() as u64
    }

    fn next_index(index: u8) -> u8 {
        let next = (index as usize + 1) % TRBS_PER_RING;
        if next == LINK_INDEX as usize {
            0
        } else {
            next as u8
        }
    }

    pub fn enqueue_index(&self) -> u8 {
        self.enqueue
    }
    pub fn dequeue_index(&self) -> u8 {
        self.dequeue
    }

    pub fn num_free(&self) -> usize {
        if self.enqueue == self.dequeue {
            if self.trbs[self.enqueue as usize].hwo() {
                0
            } else {
                USABLE_TRBS
            }
        } else if self.dequeue > self.enqueue {
            usize::from(self.dequeue - self.enqueue)
        } else {
            USABLE_TRBS - usize::from(self.enqueue - self.dequeue)
        }
    }

    /// Descriptors currently handed to hardware.
    pub fn outstanding(&self) -> usize {
        USABLE_TRBS - self.num_free()
    }

    /// Write one descriptor at the enqueue index and hand it to hardware.
    ///
    /// `build` fills every field except the ownership bit; that bit is set
    /// here, after the other words are committed, because it is the point
    /// where hardware may start fetching. Returns the slot index used.
    pub fn enqueue_with<F>(&mut self, build: F) -> u8
    where
        F: FnOnce(&mut Trb),
    {
        let index = self.enqueue;
        let trb = &mut self.trbs[index as usize];
        assert!(
            !trb.hwo(),
            "enqueue would overwrite a hardware-owned descriptor"
        );
        *trb = Trb::new();
        build(trb);
        compiler_fence(Ordering::Release);
        trb.set_hwo(true);
        self.enqueue = Self::next_index(index);
        index
    }

    pub fn peek_dequeue(&self) -> &Trb {
        &self.trbs[self.dequeue as usize]
    }

    /// Retire the descriptor under the dequeue index and advance past it.
    pub fn retire(&mut self) -> Trb {
        let trb = self.trbs[self.dequeue as usize];
        self.trbs[self.dequeue as usize].set_hwo(false);
        self.dequeue = Self::next_index(self.dequeue);
        trb
    }

    #[cfg(test)]
    pub(crate) fn trb(&self, index: u8) -> &Trb {
        &self.trbs[index as usize]
    }

    #[cfg(test)]
    pub(crate) fn fake_completion(&mut self, index: u8, residual: u32, status_raw: u8) {
        let trb = &mut self.trbs[index as usize];
        trb.set_length(residual);
        trb.set_status_raw(status_raw);
        trb.set_hwo(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue_one(ring: &mut TrbRing) -> u8 {
        ring.enqueue_with(|trb| {
            trb.set_buffer(0x1000)
                .set_length(64)
                .set_kind(TrbKind::Normal)
                .set_ioc(true);
        })
    }

    #[test]
    fn fresh_ring_is_empty_with_link_in_place() {
        let ring = TrbRing::new();
        assert_eq!(ring.num_free(), USABLE_TRBS);
        assert_eq!(ring.outstanding(), 0);
        let link = ring.trb(255);
        assert_eq!(link.kind(), Ok(TrbKind::Link));
        assert!(link.hwo());
        assert_eq!(link.buffer(), ring.head_addr());
    }

    #[test]
    fn enqueue_sets_fields_and_ownership() {
        let mut ring = TrbRing::new();
        let index = enqueue_one(&mut ring);
        assert_eq!(index, 0);
        let trb = ring.trb(0);
        assert!(trb.hwo());
        assert!(trb.ioc());
        assert_eq!(trb.buffer(), 0x1000);
        assert_eq!(trb.length(), 64);
        assert_eq!(ring.num_free(), USABLE_TRBS - 1);
    }

    #[test]
    fn outstanding_matches_enqueue_minus_dequeue() {
        let mut ring = TrbRing::new();
        for _ in 0..100 {
            enqueue_one(&mut ring);
        }
        assert_eq!(ring.outstanding(), 100);
        for i in 0..40u8 {
            ring.fake_completion(i, 0, 0);
            ring.retire();
        }
        assert_eq!(ring.outstanding(), 60);
        assert_eq!(ring.num_free(), USABLE_TRBS - 60);
    }

    #[test]
    fn enqueue_skips_the_link_slot_on_wrap() {
        let mut ring = TrbRing::new();
        // Fill every usable slot, then drain, twice around the ring.
        for round in 0..2 {
            for _ in 0..USABLE_TRBS {
                enqueue_one(&mut ring);
            }
            assert_eq!(ring.num_free(), 0, "round {round}");
            let mut index = ring.dequeue_index();
            for _ in 0..USABLE_TRBS {
                assert_ne!(index, 255, "transfer descriptor landed in the link slot");
                ring.fake_completion(index, 0, 0);
                ring.retire();
                index = ring.dequeue_index();
            }
            assert_eq!(ring.num_free(), USABLE_TRBS);
        }
        // The link descriptor never moved.
        assert_eq!(ring.trb(255).kind(), Ok(TrbKind::Link));
    }

    #[test]
    fn full_ring_reports_zero_free() {
        let mut ring = TrbRing::new();
        for _ in 0..USABLE_TRBS {
            enqueue_one(&mut ring);
        }
        assert_eq!(ring.num_free(), 0);
        assert_eq!(ring.enqueue_index(), ring.dequeue_index());
    }

    #[test]
    #[should_panic(expected = "hardware-owned")]
    fn overwriting_hardware_owned_descriptor_panics() {
        let mut ring = TrbRing::new();
        for _ in 0..=USABLE_TRBS {
            enqueue_one(&mut ring);
        }
    }

    #[test]
    fn completion_status_decodes() {
        let mut trb = Trb::new();
        trb.set_status_raw(1);
        assert_eq!(trb.status(), TrbStatus::MissedIsoc);
        trb.set_status_raw(4);
        assert_eq!(trb.status(), TrbStatus::InProgress);
        trb.set_status_raw(0);
        assert_eq!(trb.status(), TrbStatus::Ok);
    }
}
