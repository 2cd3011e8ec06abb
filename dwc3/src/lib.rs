//! Control core for a DesignWare-style USB3 dual-role (DRD) controller.
//!
//! This crate owns the register-level protocol of the controller: the
//! hardware event stream, the per-endpoint command handshake, the transfer
//! descriptor rings, the EP0 control state machine, link-state tracking and
//! the arbitration between host and device roles. It does not touch PHYs,
//! clocks or resets, does not contain the host-mode transfer scheduler
//! (that is the [`HostRole`] child), and does not speak any USB class
//! protocol.
//!
//! The platform provides a [`RegisterBus`] over the memory-mapped window
//! ([`Mmio`] for real hardware), builds a [`Config`], and drives the core
//! from two contexts: the interrupt top half calls [`Dwc3::interrupt`], a
//! single-threaded deferred context calls [`Dwc3::process_events`] and acts
//! on the returned [`Notification`]s. DMA-visible buffers are allocated
//! from the global allocator and assumed identity-mapped.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod utils;

pub mod command;
mod config;
mod controller;
mod drd;
mod ep;
mod ep0;
mod error;
mod event;
mod link;
pub mod regs;
mod request;
#[cfg(test)]
mod testing;
mod trb;

pub use command::EpCommandKind;
pub use config::{Config, DrMode, Speed};
pub use controller::{Dwc3, Notification, Notifications, ENDPOINTS_NUM};
pub use drd::{HostResources, HostRole, Role};
pub use ep::{EndpointConfig, TransferType};
pub use ep0::Ep0State;
pub use error::{Error, Result};
pub use event::{DevEvent, DevEventKind, EpEvent, EpEventKind, Event, EVENT_BUFFER_LENGTH};
pub use link::LinkState;
pub use regs::{Mmio, RegisterBus, Regs, Revision};
pub use request::{
    Direction, EpNumber, Request, Segment, SetupData, TransferStatus, MAX_SEGMENTS,
};
pub use trb::{Trb, TrbKind, TrbRing, TrbStatus, TRBS_PER_RING};
