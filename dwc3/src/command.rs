//! Endpoint command engine and the device generic command mirror.
//!
//! Commands are issued by writing up to three parameter words and then the
//! command word with the active bit set; hardware clears the active bit and
//! leaves a 4-bit status. The caller serializes commands through the
//! controller lock — in particular the start-new-configuration command must
//! never overlap a command on any other endpoint.

use bit_field::BitField;

use crate::ep::{EndpointConfig, TransferType};
use crate::error::{Error, Result};
use crate::regs::{Depcmd, Dgcmd, RegisterBus, Regs};
use crate::request::EpNumber;

auto_repr_tryfrom! {
    /// Endpoint command ids.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EpCommandKind: u8 {
        SetEpConfig = 1,
        SetTransferResource = 2,
        GetEpState = 3,
        SetStall = 4,
        ClearStall = 5,
        StartTransfer = 6,
        UpdateTransfer = 7,
        EndTransfer = 8,
        StartNewConfig = 9,
    }
}

/* Device generic command ids */
pub const DGCMD_SET_LMP: u8 = 0x01;
pub const DGCMD_SET_PERIODIC_PAR: u8 = 0x02;
pub const DGCMD_XMIT_FUNCTION: u8 = 0x03;
pub const DGCMD_SET_SCRATCHPAD_ADDR_LO: u8 = 0x04;
pub const DGCMD_SET_SCRATCHPAD_ADDR_HI: u8 = 0x05;
pub const DGCMD_SELECTED_FIFO_FLUSH: u8 = 0x09;
pub const DGCMD_ALL_FIFO_FLUSH: u8 = 0x0a;
pub const DGCMD_SET_ENDPOINT_NRDY: u8 = 0x0c;
pub const DGCMD_RUN_SOC_BUS_LOOPBACK: u8 = 0x10;

/// Poll bound for the active bit. The handshake finishes within a few
/// microseconds on silicon; a command still active after this many polls
/// is reported as timed out, never waited on indefinitely.
pub const COMMAND_TIMEOUT: u32 = 1000;
/// Bound on retries for transient command failures.
pub const COMMAND_RETRIES: u32 = 3;

/// The three parameter words of an endpoint command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpCmdParams {
    pub param0: u32,
    pub param1: u32,
    pub param2: u32,
}

impl EpCmdParams {
    pub const fn zeroed() -> Self {
        Self {
            param0: 0,
            param1: 0,
            param2: 0,
        }
    }
}

/// What a set-endpoint-config command should do to the endpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    Init = 0,
    Restore = 1,
    Modify = 2,
}

/// Parameter words for set-endpoint-config.
pub fn ep_config_params(cfg: &EndpointConfig, action: ConfigAction) -> EpCmdParams {
    let mut param0 = 0u32;
    param0.set_bits(1..=2, u32::from(u8::from(cfg.ty)));
    param0.set_bits(3..=13, u32::from(cfg.max_packet_size));
    param0.set_bits(17..=21, u32::from(cfg.fifo_number));
    param0.set_bits(22..=25, u32::from(cfg.burst_size));
    param0.set_bits(30..=31, action as u32);

    let mut param1 = 0u32;
    param1.set_bit(8, true); // transfer-complete events
    match cfg.ty {
        TransferType::Control => {
            param1.set_bit(10, true); // transfer-not-ready drives the EP0 phases
        }
        TransferType::Isochronous => {
            param1.set_bit(9, true); // in-progress events per interval
            param1.set_bit(10, true);
            param1.set_bits(16..=23, u32::from(cfg.interval_m1));
        }
        TransferType::Interrupt => {
            param1.set_bits(16..=23, u32::from(cfg.interval_m1));
        }
        TransferType::Bulk => {}
    }
    param1.set_bits(25..=29, u32::from(cfg.ep.number()));

    EpCmdParams {
        param0,
        param1,
        param2: 0,
    }
}

/// Parameter words for set-transfer-resource: one resource per endpoint.
pub fn transfer_resource_params() -> EpCmdParams {
    EpCmdParams {
        param0: 1,
        ..EpCmdParams::zeroed()
    }
}

/// Parameter words for start-transfer: descriptor chain bus address.
pub fn start_transfer_params(td_addr: u64) -> EpCmdParams {
    EpCmdParams {
        param0: (td_addr >> 32) as u32,
        param1: td_addr as u32,
        param2: 0,
    }
}

/// Issue one endpoint command and await its completion.
///
/// `flags` carries any extra command-word bits (parameter field, forced
/// removal, clear-pending); the command id and active bit are set here.
/// Returns the read-back command word so callers can pull out the
/// transfer-resource index.
pub fn issue<B: RegisterBus>(
    regs: &mut Regs<B>,
    ep: EpNumber,
    kind: EpCommandKind,
    flags: Depcmd,
    params: &EpCmdParams,
) -> Result<Depcmd> {
    let phys = ep.number();
    regs.set_depcmdpar0(phys, params.param0);
    regs.set_depcmdpar1(phys, params.param1);
    regs.set_depcmdpar2(phys, params.param2);

    let mut cmd = flags;
    cmd.set_cmdtyp(kind.into()).set_cmdact();
    regs.set_depcmd(phys, cmd);

    for _ in 0..COMMAND_TIMEOUT {
        let read = regs.depcmd(phys);
        if !read.get_cmdact() {
            let status = read.get_cmdstatus();
            log::debug!("ep{phys} cmd {kind:?} done, status {status}");
            if status == 0 {
                return Ok(read);
            }
            return Err(Error::EpCommandFailed { cmd: kind, status });
        }
        core::hint::spin_loop();
    }
    log::warn!("ep{phys} cmd {kind:?} timed out");
    Err(Error::EpCommandTimedOut(kind))
}

/// [`issue`] with bounded retries on transient failures. Timeouts are never
/// blindly retried; the caller decides between retry and endpoint reset.
pub fn issue_with_retries<B: RegisterBus>(
    regs: &mut Regs<B>,
    ep: EpNumber,
    kind: EpCommandKind,
    flags: Depcmd,
    params: &EpCmdParams,
) -> Result<Depcmd> {
    let mut attempt = 0;
    loop {
        match issue(regs, ep, kind, flags, params) {
            Err(Error::EpCommandFailed { cmd, status }) => {
                attempt += 1;
                if attempt >= COMMAND_RETRIES {
                    return Err(Error::EpCommandFailed { cmd, status });
                }
                log::debug!("ep{} cmd {kind:?} failed ({status}), retrying", ep.number());
            }
            other => return other,
        }
    }
}

/// Issue one device generic command.
pub fn issue_generic<B: RegisterBus>(regs: &mut Regs<B>, cmd_id: u8, param: u32) -> Result<()> {
    regs.set_dgcmdpar(param);
    let mut cmd = Dgcmd::from(0);
    cmd.set_cmdtyp(cmd_id).set_cmdact();
    regs.set_dgcmd(cmd);

    for _ in 0..COMMAND_TIMEOUT {
        let read = regs.dgcmd();
        if !read.get_cmdact() {
            let status = read.get_cmdstatus();
            if status == 0 {
                return Ok(());
            }
            return Err(Error::GenericCommandFailed {
                cmd: cmd_id,
                status,
            });
        }
        core::hint::spin_loop();
    }
    log::warn!("generic cmd {cmd_id:#x} timed out");
    Err(Error::GenericCommandTimedOut(cmd_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBus;

    fn regs() -> Regs<FakeBus> {
        Regs::new(FakeBus::new())
    }

    #[test]
    fn command_success_reads_back_status_and_resource_index() {
        let mut regs = regs();
        let ep = EpNumber::EP0_OUT;
        let params = start_transfer_params(0x1234_5678_9abc_def0);
        let done = issue(
            &mut regs,
            ep,
            EpCommandKind::StartTransfer,
            Depcmd::from(0),
            &params,
        )
        .unwrap();
        assert_eq!(done.get_resource_index(), 0x11);
        // Parameter words land in the endpoint's command block.
        let bus = regs.bus_mut();
        assert_eq!(bus.last_write(crate::regs::dep_base(0) + crate::regs::DEPCMDPAR0), Some(0x1234_5678));
        assert_eq!(bus.last_write(crate::regs::dep_base(0) + crate::regs::DEPCMDPAR1), Some(0x9abc_def0));
    }

    #[test]
    fn never_clearing_active_bit_times_out() {
        let mut regs = regs();
        regs.bus_mut().auto_clear_cmdact = false;
        let err = issue(
            &mut regs,
            EpNumber::EP0_OUT,
            EpCommandKind::SetStall,
            Depcmd::from(0),
            &EpCmdParams::zeroed(),
        )
        .unwrap_err();
        assert_eq!(err, Error::EpCommandTimedOut(EpCommandKind::SetStall));
    }

    #[test]
    fn transient_failure_is_retried_a_bounded_number_of_times() {
        let mut regs = regs();
        regs.bus_mut().cmd_status = 2;
        let err = issue_with_retries(
            &mut regs,
            EpNumber::EP0_IN,
            EpCommandKind::SetEpConfig,
            Depcmd::from(0),
            &EpCmdParams::zeroed(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            Error::EpCommandFailed {
                cmd: EpCommandKind::SetEpConfig,
                status: 2
            }
        );
        let cmd_offset = crate::regs::dep_base(1) + crate::regs::DEPCMD;
        assert_eq!(
            regs.bus_mut().write_count(cmd_offset),
            COMMAND_RETRIES as usize
        );
    }

    #[test]
    fn generic_command_handshake() {
        let mut regs = regs();
        issue_generic(&mut regs, DGCMD_SET_SCRATCHPAD_ADDR_LO, 0xdead_b000).unwrap();
        assert_eq!(regs.bus_mut().last_write(crate::regs::DGCMDPAR), Some(0xdead_b000));

        regs.bus_mut().dgcmd_status = 1;
        let err = issue_generic(&mut regs, DGCMD_ALL_FIFO_FLUSH, 0).unwrap_err();
        assert_eq!(
            err,
            Error::GenericCommandFailed {
                cmd: DGCMD_ALL_FIFO_FLUSH,
                status: 1
            }
        );
    }

    #[test]
    fn ep_config_params_encode_type_and_packet_size() {
        let cfg = EndpointConfig {
            ep: EpNumber::new(2, crate::request::Direction::In),
            ty: TransferType::Bulk,
            max_packet_size: 512,
            fifo_number: 2,
            burst_size: 3,
            interval_m1: 0,
        };
        let params = ep_config_params(&cfg, ConfigAction::Init);
        assert_eq!(params.param0 >> 1 & 0x3, 2); // bulk
        assert_eq!(params.param0 >> 3 & 0x7ff, 512);
        assert_eq!(params.param0 >> 17 & 0x1f, 2);
        assert_eq!(params.param0 >> 22 & 0xf, 3);
        assert_eq!(params.param1 >> 25 & 0x1f, 5); // physical ep 5
        assert!(params.param1 & (1 << 8) != 0); // completion events on
    }
}
