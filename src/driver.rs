//! Class driver interface
//!
//! The stack owns no class state. It finds a driver for every interface of
//! the active configuration and forwards bus events, class requests and
//! transfer completions to it. Drivers keep their per-device sessions in
//! fixed pools of their own, allocated in [connect] and released in
//! [disconnect].
//!
//! Driver callbacks take `&self`: one driver instance is shared by reference
//! across all devices of a [Stack], so mutable driver state lives behind a
//! `critical_section::Mutex`.
//!
//! [connect]: ClassDriver::connect
//! [disconnect]: ClassDriver::disconnect
//! [Stack]: crate::stack::Stack

use crate::descriptor::{InterfaceDescriptor, SetupPacket};
use crate::error::{Error, Result};
use crate::hal::FunctionController;
use crate::irp::{Completion, Pipe};
use crate::stack::DeviceContext;

/// Identity of a registered driver. Stays valid until the driver is
/// deregistered, regardless of other registrations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverId(pub(crate) u8);

/// Bus event delivered through [Stack::notify](crate::stack::Stack::notify)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    Connect,
    Disconnect,
    Reset,
    Suspend,
    Resume,
    /// The host cleared the halt feature of an endpoint
    ClearHaltEndpoint(u8),
    /// USB 3.0 function suspend of the function starting at `interface`
    FunctionSuspend {
        interface: u8,
        suspend: bool,
        remote_wakeup: bool,
    },
}

impl Event {
    /// Events that return the device to the Default state
    pub fn resets_device(&self) -> bool {
        matches!(self, Event::Connect | Event::Disconnect | Event::Reset)
    }
}

/// USB function class driver.
///
/// Every callback receives a [DeviceContext] for the device concerned, which
/// provides pipe discovery, interface claiming and the endpoint services.
pub trait ClassDriver<H: FunctionController> {
    /// Whether the driver can serve an interface with this descriptor
    fn examine_interface(&self, descriptor: &InterfaceDescriptor) -> bool;

    /// Offers an interface that passed [examine_interface]. The driver takes
    /// it by calling [DeviceContext::claim_interface].
    ///
    /// [examine_interface]: ClassDriver::examine_interface
    fn connect(&self, ctx: &mut DeviceContext<'_, H>, interface: u8) -> Result<()>;

    /// Tears down everything the driver holds on the device
    fn disconnect(&self, ctx: &mut DeviceContext<'_, H>) -> Result<()>;

    /// The host selected another alternate setting of a claimed interface
    fn set_interface(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        interface: u8,
        alternate_setting: u8,
    ) -> Result<()>;

    /// A token arrived on an endpoint with no transfer queued
    fn new_transfer(&self, _ctx: &mut DeviceContext<'_, H>, _pipe: &Pipe) -> Result<()> {
        Ok(())
    }

    fn notify(&self, ctx: &mut DeviceContext<'_, H>, event: Event) -> Result<()>;

    /// Class or vendor request addressed to the driver
    fn class_specific(&self, _ctx: &mut DeviceContext<'_, H>, _setup: &SetupPacket) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// A transfer the driver submitted has finished
    fn transfer_complete(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        pipe: &Pipe,
        completion: &Completion<'_>,
    ) -> Result<()>;
}
