//! Hardware event stream.
//!
//! The core reports everything through per-interrupter circular event
//! buffers of 32-bit words. A word is either an endpoint event (bit 0
//! clear) or a device/auxiliary event (bit 0 set, discriminated by bits
//! 7:1). Layouts are fixed by hardware and accessed with masked shifts
//! only.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use core::pin::Pin;

use bit_field::BitField;

use crate::error::{Error, Result};

/// Size of one hardware-filled event buffer in bytes.
pub const EVENT_BUFFER_LENGTH: usize = 4096;
/// Every event is exactly one 32-bit word.
pub const EVENT_SIZE: usize = 4;

auto_repr_tryfrom! {
    /// Endpoint event sub-types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EpEventKind: u8 {
        XferComplete = 1,
        XferInProgress = 2,
        XferNotReady = 3,
        RxTxFifo = 4,
        Stream = 6,
        EpCmdComplete = 7,
    }
}

auto_repr_tryfrom! {
    /// Device event sub-types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DevEventKind: u8 {
        Disconnect = 0,
        Reset = 1,
        ConnectDone = 2,
        LinkStatusChange = 3,
        Wakeup = 4,
        HibernationRequest = 5,
        /// End of periodic frame; doubles as the suspend notification.
        Suspend = 6,
        Sof = 7,
        ErraticError = 9,
        CommandComplete = 10,
        Overflow = 11,
        VendorDeviceTest = 12,
    }
}

auto_unit_from! {
    /// Device endpoint event word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EpEvent(u32)
}
impl EpEvent {
    /* status bits within XferComplete / XferInProgress */
    const STATUS_BUSERR: u8 = 1 << 0;
    const STATUS_SHORT: u8 = 1 << 1;
    const STATUS_IOC: u8 = 1 << 2;
    const STATUS_LST: u8 = 1 << 3;
    const STATUS_MISSED_ISOC: u8 = 1 << 3;
    /* status bits within XferNotReady */
    const STATUS_TRANSFER_ACTIVE: u8 = 1 << 3;
    const STATUS_CONTROL_PHASE_MASK: u8 = 0x3;
    pub const CONTROL_PHASE_DATA: u8 = 1;
    pub const CONTROL_PHASE_STATUS: u8 = 2;

    pub fn new(ep: u8, kind: EpEventKind) -> Self {
        let mut raw = 0u32;
        raw.set_bits(1..=5, ep.into());
        raw.set_bits(6..=9, u8::from(kind).into());
        Self(raw)
    }

    get_bits!(1..=5, endpoint_number, u8, "Physical endpoint number.");
    rw_bits!(12..=15, status, u8, "Event status; meaning depends on the sub-type.");
    rw_bits!(16..=31, parameters, u16, "Event parameters.");

    pub fn kind(&self) -> Result<EpEventKind> {
        let raw = self.0.get_bits(6..=9) as u8;
        raw.try_into().map_err(|kind| Error::UnknownEndpointEvent {
            ep: self.get_endpoint_number(),
            kind,
        })
    }

    pub fn bus_error(&self) -> bool {
        self.get_status() & Self::STATUS_BUSERR != 0
    }
    pub fn short_packet(&self) -> bool {
        self.get_status() & Self::STATUS_SHORT != 0
    }
    pub fn interrupt_on_completion(&self) -> bool {
        self.get_status() & Self::STATUS_IOC != 0
    }
    pub fn last_of_transfer(&self) -> bool {
        self.get_status() & Self::STATUS_LST != 0
    }
    /// Only meaningful on XferInProgress.
    pub fn missed_isoc(&self) -> bool {
        self.get_status() & Self::STATUS_MISSED_ISOC != 0
    }
    /// Only meaningful on XferNotReady.
    pub fn transfer_active(&self) -> bool {
        self.get_status() & Self::STATUS_TRANSFER_ACTIVE != 0
    }
    /// Control phase the hardware is waiting on; only meaningful on
    /// XferNotReady for the control endpoints.
    pub fn control_phase(&self) -> u8 {
        self.get_status() & Self::STATUS_CONTROL_PHASE_MASK
    }
    /// Command id carried by an EpCmdComplete event.
    pub fn completed_command(&self) -> u8 {
        (self.get_parameters() >> 8) as u8 & 0xf
    }
}

auto_unit_from! {
    /// Non-endpoint device event word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DevEvent(u32)
}
impl DevEvent {
    pub fn new(kind: DevEventKind) -> Self {
        let mut raw = 0u32;
        raw.set_bit(0, true);
        raw.set_bits(8..=11, u8::from(kind).into());
        Self(raw)
    }

    rw_bits!(16..=24, event_info, u16, "Event information; 9 bits.");

    pub fn kind(&self) -> Result<DevEventKind> {
        let raw = self.0.get_bits(8..=11) as u8;
        raw.try_into().map_err(Error::UnknownDeviceEvent)
    }

    /// New link state carried by a link-status-change event.
    pub fn link_state_raw(&self) -> u8 {
        (self.get_event_info() & 0xf) as u8
    }

    /// Link event happened on the SuperSpeed side of the bus.
    pub fn link_is_ss(&self) -> bool {
        self.get_event_info().get_bit(4)
    }
}

auto_unit_from! {
    /// Carkit / I2C auxiliary event word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuxEvent(u32)
}
impl AuxEvent {
    get_bits!(8..=11, phy_port_number, u8);
}

const EVENT_TYPE_DEV: u8 = 0;
const EVENT_TYPE_CARKIT: u8 = 3;
const EVENT_TYPE_I2C: u8 = 4;

/// One decoded event word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Endpoint(EpEvent),
    Device(DevEvent),
    Carkit(AuxEvent),
    I2c(AuxEvent),
}

impl Event {
    pub fn decode(raw: u32) -> Result<Event> {
        if !raw.get_bit(0) {
            return Ok(Event::Endpoint(EpEvent(raw)));
        }
        match raw.get_bits(1..=7) as u8 {
            EVENT_TYPE_DEV => Ok(Event::Device(DevEvent(raw))),
            EVENT_TYPE_CARKIT => Ok(Event::Carkit(AuxEvent(raw))),
            EVENT_TYPE_I2C => Ok(Event::I2c(AuxEvent(raw))),
            ty => Err(Error::UnknownEventType(ty)),
        }
    }

    pub fn into_raw(self) -> u32 {
        match self {
            Event::Endpoint(e) => e.into(),
            Event::Device(e) => e.into(),
            Event::Carkit(e) | Event::I2c(e) => e.into(),
        }
    }
}

/// Software side of one hardware event buffer.
///
/// Owns the DMA-visible word array and the read offset. `lpos` is always
/// smaller than the buffer length and advances modulo it; how far we may
/// read is bounded by the count hardware reported, never by `lpos` itself.
#[derive(Debug)]
pub struct EventBuffer {
    // Fixed once allocated; hardware holds its address.
    buf: Pin<Box<[u32]>>,
    lpos: usize,
    count: u32,
    pending: bool,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self {
            buf: Pin::new(vec![0u32; EVENT_BUFFER_LENGTH / EVENT_SIZE].into_boxed_slice()),
            lpos: 0,
            count: 0,
            pending: false,
        }
    }

    /// Bus address of the buffer (identity mapping assumed, as for the
    /// descriptor rings).
    pub fn dma_addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn length(&self) -> usize {
        EVENT_BUFFER_LENGTH
    }

    pub(crate) fn word_at_lpos(&self) -> u32 {
        self.buf[self.lpos / EVENT_SIZE]
    }

    pub(crate) fn advance(&mut self) {
        self.lpos = (self.lpos + EVENT_SIZE) % EVENT_BUFFER_LENGTH;
    }

    /// Adopt the position hardware reports after an overflow: everything it
    /// counted is treated as consumed.
    pub(crate) fn resync(&mut self, reported_bytes: u32) {
        self.lpos = (self.lpos + reported_bytes as usize) % EVENT_BUFFER_LENGTH;
        self.count = 0;
    }

    pub(crate) fn cache_count(&mut self, count: u32) {
        self.count = count;
    }
    pub(crate) fn cached_count(&self) -> u32 {
        self.count
    }
    pub(crate) fn consume_one(&mut self) {
        self.count = self.count.saturating_sub(EVENT_SIZE as u32);
    }

    pub(crate) fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }
    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    #[cfg(test)]
    pub(crate) fn write_word(&mut self, byte_offset: usize, raw: u32) {
        self.buf[(byte_offset % EVENT_BUFFER_LENGTH) / EVENT_SIZE] = raw;
    }

    #[cfg(test)]
    pub(crate) fn lpos(&self) -> usize {
        self.lpos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_event_layout_round_trip() {
        // ep 5, XferComplete, status = short | last, parameters 0x1234
        let raw = (5 << 1) | (1 << 6) | (0xa << 12) | (0x1234 << 16);
        let event = match Event::decode(raw).unwrap() {
            Event::Endpoint(e) => e,
            other => panic!("decoded {other:?}"),
        };
        assert_eq!(event.get_endpoint_number(), 5);
        assert_eq!(event.kind().unwrap(), EpEventKind::XferComplete);
        assert!(event.short_packet());
        assert!(event.last_of_transfer());
        assert!(!event.bus_error());
        assert_eq!(event.get_parameters(), 0x1234);

        let mut rebuilt = EpEvent::new(5, EpEventKind::XferComplete);
        rebuilt.set_status(0xa).set_parameters(0x1234);
        assert_eq!(u32::from(rebuilt), raw);
    }

    #[test]
    fn command_complete_event_carries_command_id() {
        let mut event = EpEvent::new(3, EpEventKind::EpCmdComplete);
        event.set_parameters(0x8 << 8); // EndTransfer
        assert_eq!(event.completed_command(), 0x8);
    }

    #[test]
    fn device_event_layout_round_trip() {
        // link change to U3, SuperSpeed side
        let raw = 1 | (3 << 8) | (0x13 << 16);
        let event = match Event::decode(raw).unwrap() {
            Event::Device(e) => e,
            other => panic!("decoded {other:?}"),
        };
        assert_eq!(event.kind().unwrap(), DevEventKind::LinkStatusChange);
        assert_eq!(event.link_state_raw(), 0x3);
        assert!(event.link_is_ss());

        let mut rebuilt = DevEvent::new(DevEventKind::LinkStatusChange);
        rebuilt.set_event_info(0x13);
        assert_eq!(u32::from(rebuilt), raw);
    }

    #[test]
    fn shared_type_field_discriminates() {
        assert!(matches!(Event::decode(0x40), Ok(Event::Endpoint(_))));
        assert!(matches!(Event::decode(0x1), Ok(Event::Device(_))));
        assert!(matches!(Event::decode(0x7), Ok(Event::Carkit(_))));
        assert!(matches!(Event::decode(0x9), Ok(Event::I2c(_))));
        assert_eq!(Event::decode(0xff), Err(Error::UnknownEventType(0x7f)));
    }

    #[test]
    fn lpos_wraps_at_buffer_length() {
        let mut eb = EventBuffer::new();
        for _ in 0..(EVENT_BUFFER_LENGTH / EVENT_SIZE - 1) {
            eb.advance();
        }
        assert_eq!(eb.lpos(), EVENT_BUFFER_LENGTH - EVENT_SIZE);
        eb.advance();
        assert_eq!(eb.lpos(), 0);
    }
}
