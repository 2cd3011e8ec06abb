use crate::command::EpCommandKind;
use crate::ep0::Ep0State;
use crate::link::LinkState;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// GSNPSID does not identify a core this driver knows how to drive.
    UnknownCoreId(u32),
    CoreSoftResetTimedOut,
    /// The RUN_STOP handshake with DSTS.DEVCTRLHLT never settled.
    RunStopTimedOut,
    UnknownEventType(u8),
    UnknownEndpointEvent { ep: u8, kind: u8 },
    UnknownDeviceEvent(u8),
    EpCommandFailed { cmd: EpCommandKind, status: u8 },
    EpCommandTimedOut(EpCommandKind),
    GenericCommandFailed { cmd: u8, status: u8 },
    GenericCommandTimedOut(u8),
    /// Hardware reported more pending event bytes than the buffer holds.
    EventBufferOverflow,
    InvalidEndpointNumber(u8),
    EndpointNotEnabled(u8),
    EndpointAlreadyEnabled(u8),
    NoSuchRequest { ep: u8, tag: u32 },
    TooManySegments,
    InvalidSetupPacket([u32; 2]),
    InvalidControlPhase(Ep0State),
    DelayedStatusNotPending,
    InvalidLinkTransition(LinkState),
    LinkTransitionTimedOut {
        target: LinkState,
        observed: LinkState,
    },
    HostStartFailed,
}

impl From<Error> for anyhow::Error {
    fn from(e: Error) -> Self {
        anyhow::anyhow!("usb drd core error: {e:?}")
    }
}
