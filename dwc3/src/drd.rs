//! Dual-role arbitration state.
//!
//! The arbiter tracks the role the silicon currently plays and the role the
//! id/session signals ask for. Only one role switch is ever in flight; a
//! request arriving mid-switch replaces the desired target and is picked up
//! by the same switch task.

use crate::error::Result;

auto_repr_tryfrom! {
    /// Operating role; values match the GCTL port capability encoding for
    /// the active roles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Role: u8 {
        Idle = 0,
        Host = 1,
        Device = 2,
    }
}

/// Register window span of the embedded host controller.
pub const XHCI_REGS_START: usize = 0x0;
pub const XHCI_REGS_END: usize = 0x7fff;

/// What the host-mode child needs to take over.
#[derive(Debug, Clone, Copy)]
pub struct HostResources {
    /// Byte span of the host controller registers inside the window.
    pub xhci_regs: (usize, usize),
    /// Interrupt moderation value to program, 0 to leave moderation off.
    pub imod_value: u32,
}

impl HostResources {
    pub fn new(imod_value: u32) -> Self {
        Self {
            xhci_regs: (XHCI_REGS_START, XHCI_REGS_END),
            imod_value,
        }
    }
}

/// The host-mode child controller. The core only starts and stops it; the
/// transfer scheduler behind it is its own driver.
pub trait HostRole: Send {
    fn start(&mut self, resources: &HostResources) -> Result<()>;
    fn stop(&mut self);
}

#[derive(Debug)]
pub(crate) struct DrdState {
    current: Role,
    desired: Role,
    switch_pending: bool,
}

impl DrdState {
    pub fn new() -> Self {
        Self {
            current: Role::Idle,
            desired: Role::Idle,
            switch_pending: false,
        }
    }

    pub fn current(&self) -> Role {
        self.current
    }
    pub fn desired(&self) -> Role {
        self.desired
    }
    pub fn set_current(&mut self, role: Role) {
        self.current = role;
    }

    /// Role asked for by the identity pin and session-valid signal.
    pub fn role_from_inputs(id_pin: bool, session_valid: bool) -> Role {
        if !id_pin {
            // A-plug grounds the id pin: we supply power and host the bus.
            Role::Host
        } else if session_valid {
            Role::Device
        } else {
            Role::Idle
        }
    }

    /// Record a new desired role. Returns true when a switch task must be
    /// scheduled; false when one is already in flight and merely retargeted.
    pub fn schedule(&mut self, desired: Role) -> bool {
        self.desired = desired;
        if self.switch_pending {
            return false;
        }
        if self.current == desired {
            return false;
        }
        self.switch_pending = true;
        true
    }

    pub fn switch_pending(&self) -> bool {
        self.switch_pending
    }

    pub fn finish_switch(&mut self) {
        self.switch_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_map_to_roles() {
        assert_eq!(DrdState::role_from_inputs(false, false), Role::Host);
        assert_eq!(DrdState::role_from_inputs(false, true), Role::Host);
        assert_eq!(DrdState::role_from_inputs(true, true), Role::Device);
        assert_eq!(DrdState::role_from_inputs(true, false), Role::Idle);
    }

    #[test]
    fn second_schedule_retargets_without_second_task() {
        let mut drd = DrdState::new();
        assert!(drd.schedule(Role::Device));
        // Toggled again before the switch task ran: no second task.
        assert!(!drd.schedule(Role::Host));
        assert_eq!(drd.desired(), Role::Host);
        assert!(drd.switch_pending());
        drd.finish_switch();
        assert!(!drd.switch_pending());
    }

    #[test]
    fn schedule_to_current_role_is_a_no_op() {
        let mut drd = DrdState::new();
        assert!(!drd.schedule(Role::Idle));
        assert!(!drd.switch_pending());
    }
}
