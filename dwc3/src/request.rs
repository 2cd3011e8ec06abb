//! Software-level transfer requests and the control setup packet.

use bit_field::BitField;

use crate::error::{Error, Result};

/// Transfer direction, seen from the host: OUT moves data to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl From<bool> for Direction {
    fn from(is_in: bool) -> Self {
        if is_in {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl From<Direction> for bool {
    fn from(value: Direction) -> Self {
        matches!(value, Direction::In)
    }
}

/// Physical endpoint number, 0..=31. Even numbers are OUT endpoints, odd
/// numbers IN; 0 and 1 form the control pipe.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpNumber(u8);

impl EpNumber {
    pub const EP0_OUT: Self = Self(0);
    pub const EP0_IN: Self = Self(1);

    pub fn new(usb_ep: u8, direction: Direction) -> Self {
        assert!(usb_ep < 16, "USB endpoint numbers are 4 bits");
        Self(usb_ep << 1 | u8::from(bool::from(direction)))
    }

    pub fn direction(&self) -> Direction {
        self.0.get_bit(0).into()
    }

    /// The logical USB endpoint number (wire-level, without direction).
    pub fn usb_endpoint(&self) -> u8 {
        self.0 >> 1
    }

    pub fn number(&self) -> u8 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn is_control(&self) -> bool {
        self.0 < 2
    }
}

impl TryFrom<u8> for EpNumber {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self> {
        if value >= 32 {
            Err(Error::InvalidEndpointNumber(value))
        } else {
            Ok(Self(value))
        }
    }
}

impl From<EpNumber> for u8 {
    fn from(value: EpNumber) -> Self {
        value.0
    }
}

impl core::fmt::Debug for EpNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EpNumber")
            .field("ep", &self.usb_endpoint())
            .field("direction", &self.direction())
            .finish()
    }
}

auto_repr_tryfrom! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RequestKind: u8 {
        Standard = 0,
        Class = 1,
        Vendor = 2,
    }
}

auto_repr_tryfrom! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Recipient: u8 {
        Device = 0,
        Interface = 1,
        Endpoint = 2,
        Other = 3,
        VendorSpecific = 31,
    }
}

auto_unit_from! {
    /// bmRequestType
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct RequestType(u8)
}
impl RequestType {
    pub fn direction(&self) -> Direction {
        self.0.get_bit(7).into()
    }

    pub fn kind(&self) -> core::result::Result<RequestKind, u8> {
        RequestKind::try_from(self.0.get_bits(5..=6))
    }

    pub fn recipient(&self) -> core::result::Result<Recipient, u8> {
        Recipient::try_from(self.0.get_bits(0..=4))
    }
}

/// The 8-byte control setup packet.
///
/// `request` stays a raw byte: class and vendor requests are forwarded to
/// the upper layer undecoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupData {
    pub request_type: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupData {
    pub fn direction(&self) -> Direction {
        self.request_type.direction()
    }

    /// A non-zero wLength announces a data stage (three-stage transfer).
    pub fn has_data_stage(&self) -> bool {
        self.length > 0
    }

    pub fn from_bytes(raw: &[u8; 8]) -> Self {
        let lo = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let hi = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Self::from([lo, hi])
    }
}

impl From<[u32; 2]> for SetupData {
    fn from(raw: [u32; 2]) -> Self {
        Self {
            request_type: (raw[0].get_bits(0..=7) as u8).into(),
            request: raw[0].get_bits(8..=15) as u8,
            value: raw[0].get_bits(16..=31) as u16,
            index: raw[1].get_bits(0..=15) as u16,
            length: raw[1].get_bits(16..=31) as u16,
        }
    }
}

impl From<SetupData> for [u32; 2] {
    fn from(setup: SetupData) -> Self {
        let mut lo = 0u32;
        let mut hi = 0u32;
        lo.set_bits(0..=7, u32::from(u8::from(setup.request_type)));
        lo.set_bits(8..=15, u32::from(setup.request));
        lo.set_bits(16..=31, u32::from(setup.value));
        hi.set_bits(0..=15, u32::from(setup.index));
        hi.set_bits(16..=31, u32::from(setup.length));
        [lo, hi]
    }
}

/// Upper bound on scatter-gather segments per request.
pub const MAX_SEGMENTS: usize = 8;

/// One scatter-gather piece: bus address and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
}

/// Completion status reported with a retired request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    ShortPacket,
    Cancelled,
    BusError,
    MissedIsoc,
}

/// One logical transfer as submitted by the upper layer.
#[derive(Debug, Clone)]
pub struct Request {
    /// Caller-chosen cookie; names the request in `cancel` and completions.
    pub tag: u32,
    /// Terminate an IN transfer that is a multiple of max packet size with
    /// an explicit zero-length packet.
    pub zero: bool,
    segs: heapless::Vec<Segment, MAX_SEGMENTS>,

    pub(crate) first_trb: u8,
    pub(crate) num_trbs: u8,
    pub(crate) needs_extra_trb: bool,
    pub(crate) actual: u32,
}

impl Request {
    pub fn new(tag: u32) -> Self {
        Self {
            tag,
            zero: false,
            segs: heapless::Vec::new(),
            first_trb: 0,
            num_trbs: 0,
            needs_extra_trb: false,
            actual: 0,
        }
    }

    pub fn add_segment(&mut self, addr: u64, len: u32) -> Result<()> {
        self.segs
            .push(Segment { addr, len })
            .map_err(|_| Error::TooManySegments)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }

    pub fn length(&self) -> u32 {
        self.segs.iter().map(|s| s.len).sum()
    }

    /// Bytes actually moved, valid once the request completes.
    pub fn actual(&self) -> u32 {
        self.actual
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_byte_layout() {
        // GET_DESCRIPTOR(Device), device-to-host, wLength 18
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupData::from_bytes(&bytes);
        assert_eq!(setup.request, 0x06);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0);
        assert_eq!(setup.length, 18);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.request_type.kind(), Ok(RequestKind::Standard));
        assert_eq!(setup.request_type.recipient(), Ok(Recipient::Device));
        assert!(setup.has_data_stage());

        let words: [u32; 2] = setup.into();
        assert_eq!(SetupData::from(words), setup);
    }

    #[test]
    fn zero_data_setup_has_no_data_stage() {
        // SET_CONFIGURATION(1)
        let bytes = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        let setup = SetupData::from_bytes(&bytes);
        assert!(!setup.has_data_stage());
        assert_eq!(setup.direction(), Direction::Out);
    }

    #[test]
    fn phys_ep_numbering() {
        let ep = EpNumber::new(2, Direction::In);
        assert_eq!(ep.number(), 5);
        assert_eq!(ep.usb_endpoint(), 2);
        assert_eq!(ep.direction(), Direction::In);
        assert!(!ep.is_control());
        assert!(EpNumber::EP0_OUT.is_control());
        assert_eq!(EpNumber::try_from(31).unwrap().usb_endpoint(), 15);
        assert_eq!(
            EpNumber::try_from(32),
            Err(Error::InvalidEndpointNumber(32))
        );
    }

    #[test]
    fn request_length_sums_segments() {
        let mut req = Request::new(7);
        req.add_segment(0x1000, 512).unwrap();
        req.add_segment(0x2000, 13).unwrap();
        assert_eq!(req.length(), 525);
        assert_eq!(req.segments().len(), 2);
    }
}
