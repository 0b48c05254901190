//! Function stack core
//!
//! A [Stack] owns a fixed table of attached devices, one per controller,
//! and an ordered list of registered class drivers. The controller driver
//! feeds it SETUP packets, transfer tokens, completions and bus events;
//! the stack answers standard requests itself and forwards everything else
//! to the class driver owning the interface concerned.
//!
//! Every entry point takes `&mut self`. Sharing a stack between interrupt
//! and task context is up to the embedder, e.g. behind a
//! `critical_section::Mutex<RefCell<Stack<..>>>`.

mod context;
mod request;

pub use context::DeviceContext;

use crate::descriptor::{DeviceDescriptors, SetupPacket, DEVICE, DEVICE_LEN, MAX_INTERFACES};
use crate::device::{ControlOwner, Device, DeviceHandle, DeviceState, ExitLatency, OtgStatus};
use crate::driver::{ClassDriver, DriverId, Event};
use crate::error::{Error, Result};
use crate::fmt::{debug, info, trace, warn};
use crate::hal::{Capabilities, FunctionController, Role, Speed};
use crate::irp::{Completion, Pipe};
use usb_device::endpoint::EndpointAddress;

#[cfg(feature = "superspeed")]
use crate::hal::LinkState;

struct Slot<'a, H> {
    device: Device<H>,
    descriptors: DeviceDescriptors<'a>,
}

struct Registration<'a, H> {
    id: DriverId,
    driver: &'a dyn ClassDriver<H>,
}

// derive would require `H: Copy`
impl<H> Clone for Registration<'_, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for Registration<'_, H> {}

/// USB function stack
///
/// # Type parameters
/// * `H` - controller driver, one instance per attached device
/// * `DEVICES` - max number of attached devices
/// * `DRIVERS` - max number of registered class drivers
pub struct Stack<'a, H, const DEVICES: usize, const DRIVERS: usize> {
    slots: [Option<Slot<'a, H>>; DEVICES],
    drivers: [Option<Registration<'a, H>>; DRIVERS],
    num_drivers: usize,
}

impl<'a, H, const DEVICES: usize, const DRIVERS: usize> Default for Stack<'a, H, DEVICES, DRIVERS>
where
    H: FunctionController,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, H, const DEVICES: usize, const DRIVERS: usize> Stack<'a, H, DEVICES, DRIVERS>
where
    H: FunctionController,
{
    pub fn new() -> Self {
        Stack {
            slots: core::array::from_fn(|_| None),
            drivers: [None; DRIVERS],
            num_drivers: 0,
        }
    }

    /// Attaches a controller with the descriptor set it enumerates with.
    ///
    /// Without a device qualifier the device is full speed only and its
    /// configurations are parsed right away; otherwise that waits for
    /// [speed_change]. Interrupts of the controller are enabled last.
    ///
    /// # Errors
    /// * [Error::InvalidArgument] - malformed device descriptor, no
    ///   full-speed configuration or a configuration that does not parse
    /// * [Error::ResourceExhausted] - the device table is full
    ///
    /// The controller is dropped on failure.
    ///
    /// [speed_change]: Stack::speed_change
    pub fn attach_device(
        &mut self,
        controller: H,
        descriptors: DeviceDescriptors<'a>,
    ) -> Result<DeviceHandle> {
        if descriptors.device[0] as usize != DEVICE_LEN
            || descriptors.device[1] != DEVICE
            || descriptors.full_speed.is_empty()
        {
            return Err(Error::InvalidArgument);
        }

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted)?;

        let mut device = Device::new(controller, descriptors.device);
        if descriptors.qualifier.is_none() {
            device.speed = Speed::Full;
            device.set_bcd_usb(Speed::Full.bcd_usb());
            device.load_configurations(descriptors.full_speed)?;
        }
        device.controller.enable_interrupts()?;

        self.slots[index] = Some(Slot {
            device,
            descriptors,
        });
        info!("usb: stack: Attach device: {}", index);
        Ok(DeviceHandle(index as u8))
    }

    /// Disables the device and gives its controller back.
    ///
    /// The device stays attached when a class driver fails to let go of it.
    pub fn detach_device(&mut self, handle: DeviceHandle) -> Result<H> {
        let index = self.index(handle)?;
        self.disable_device(index)?;

        let slot = self.slots[index].take().ok_or(Error::NotFound)?;
        let mut controller = slot.device.controller;
        controller.disable_interrupts()?;
        info!("usb: stack: Detach device: {}", index);
        Ok(controller)
    }

    /// Brings the controller hardware up. Interrupts stay disabled.
    pub fn add_hw(&mut self, handle: DeviceHandle) -> Result<()> {
        let device = self.device_mut(handle)?;
        device.controller.initialize()?;
        Ok(())
    }

    /// Takes the controller hardware down, leaving the device Powered
    pub fn remove_hw(&mut self, handle: DeviceHandle) -> Result<()> {
        let device = self.device_mut(handle)?;
        device.controller.disable_interrupts()?;
        device.controller.uninitialize()?;
        device.deactivate();
        device.state = DeviceState::Powered;
        Ok(())
    }

    /// The controller detected the bus speed. Selects `bcdUSB` and the
    /// configuration descriptors for it.
    pub fn speed_change(&mut self, handle: DeviceHandle, speed: Speed) -> Result<()> {
        let index = self.index(handle)?;
        let slot = self.slot_mut(index)?;
        debug!("usb: stack: Speed change: {}", speed);

        slot.device.speed = speed;
        slot.device.set_bcd_usb(speed.bcd_usb());
        slot.device
            .load_configurations(slot.descriptors.configurations(speed))
    }

    /// SETUP packet received on the control endpoint.
    ///
    /// Any error means the request is refused; the controller driver stalls
    /// the control endpoint.
    pub fn new_setup(&mut self, handle: DeviceHandle, setup: &SetupPacket) -> Result<()> {
        let index = self.index(handle)?;
        trace!("usb: stack: Recv setup: {}", setup);

        if request::is_standard(setup) {
            self.standard_request(index, setup)
        } else {
            self.class_request(index, setup)
        }
    }

    /// A token arrived on an endpoint with no transfer queued
    pub fn new_transfer(&mut self, handle: DeviceHandle, ep: EndpointAddress) -> Result<()> {
        let index = self.index(handle)?;
        let (id, pipe) = self
            .resolve_endpoint(index, u8::from(ep))
            .ok_or(Error::InvalidArgument)?;
        self.call_driver(index, id, |driver, ctx| driver.new_transfer(ctx, &pipe))
    }

    /// A transfer queued on `ep` has finished
    pub fn transfer_complete(
        &mut self,
        handle: DeviceHandle,
        ep: EndpointAddress,
        completion: Completion<'_>,
    ) -> Result<()> {
        let index = self.index(handle)?;
        let address = u8::from(ep);

        if address & 0x7F != 0 {
            let (id, pipe) = self
                .resolve_endpoint(index, address)
                .ok_or(Error::InvalidArgument)?;
            return self.call_driver(index, id, |driver, ctx| {
                driver.transfer_complete(ctx, &pipe, &completion)
            });
        }

        let device = &mut self.slot_mut(index)?.device;
        device.ctrl_irp.complete(&completion);
        let owner = device.ctrl_owner;
        match owner {
            ControlOwner::Stack => Ok(()),
            ControlOwner::ExitLatency => {
                device.ctrl_owner = ControlOwner::Stack;
                completion.status?;
                device.power.exit_latency = ExitLatency::parse(completion.data)?;
                debug!("usb: stack: Exit latency: {}", device.power.exit_latency);
                Ok(())
            }
            ControlOwner::Driver(id) => self.call_driver(index, id, |driver, ctx| {
                driver.transfer_complete(ctx, &Pipe::control(handle), &completion)
            }),
        }
    }

    /// Bus event reported by the controller.
    ///
    /// On Reset a controller that answers SET_ADDRESS (and
    /// SET_CONFIGURATION) by itself moves the device straight to Addressed
    /// (Configured with the first configuration). Every registered driver is
    /// then notified in registration order, stopping at the first failure.
    /// Connect, Disconnect and a plain Reset leave the device in Default
    /// with no active configuration whatever the drivers answered.
    pub fn notify(&mut self, handle: DeviceHandle, event: Event) -> Result<()> {
        let index = self.index(handle)?;
        info!("usb: stack: Notify: {}", event);

        let mut advanced = None;
        if event == Event::Reset {
            let device = &mut self.slot_mut(index)?.device;
            let capabilities = device.controller.capabilities();
            if capabilities.contains(Capabilities::AUTO_SET_ADDRESS) {
                device.deactivate();
                device.state = DeviceState::Addressed;
                if capabilities.contains(Capabilities::AUTO_SET_CONFIGURATION) {
                    device.activate(0);
                    device.state = DeviceState::Configured;
                }
                advanced = Some(device.state);
            }
        }

        let result = self.fan_out(index, event);

        match advanced {
            Some(DeviceState::Configured) => self.enable_device(index),
            Some(_) => {}
            None if event.resets_device() => {
                let device = &mut self.slot_mut(index)?.device;
                device.deactivate();
                device.state = DeviceState::Default;
                device.address = 0;
            }
            None => {}
        }
        result
    }

    /// Adds a class driver at the end of the driver list.
    ///
    /// Devices already configured get their unclaimed interfaces offered to
    /// the new driver.
    pub fn register_driver(&mut self, driver: &'a dyn ClassDriver<H>) -> Result<DriverId> {
        if self.num_drivers == DRIVERS {
            return Err(Error::ResourceExhausted);
        }
        let id = (0..=u8::MAX)
            .map(DriverId)
            .find(|id| self.registration(*id).is_none())
            .ok_or(Error::ResourceExhausted)?;

        self.drivers[self.num_drivers] = Some(Registration { id, driver });
        self.num_drivers += 1;
        info!("usb: stack: Register driver: {}", id);

        for index in 0..DEVICES {
            let configured = self.slots[index]
                .as_ref()
                .map_or(false, |slot| slot.device.state == DeviceState::Configured);
            if configured {
                self.enable_device(index);
            }
        }
        Ok(id)
    }

    /// Removes a class driver, keeping the order of the others.
    ///
    /// # Errors
    /// * [Error::NotFound] - no such driver
    /// * [Error::InvalidArgument] - an interface of some device is still
    ///   claimed by the driver
    pub fn deregister_driver(&mut self, id: DriverId) -> Result<()> {
        let position = self.drivers[..self.num_drivers]
            .iter()
            .position(|reg| reg.map(|reg| reg.id) == Some(id))
            .ok_or(Error::NotFound)?;
        self.disable_driver(id)?;

        self.drivers[position..self.num_drivers].rotate_left(1);
        self.num_drivers -= 1;
        self.drivers[self.num_drivers] = None;
        info!("usb: stack: Deregister driver: {}", id);
        Ok(())
    }

    /// Context for a client acting on the device outside of a driver
    /// callback
    pub fn context(&mut self, handle: DeviceHandle) -> Result<DeviceContext<'_, H>> {
        let device = self.device_mut(handle)?;
        Ok(DeviceContext::new(handle, None, device))
    }

    pub fn device(&self, handle: DeviceHandle) -> Result<&Device<H>> {
        self.slots
            .get(handle.index())
            .and_then(Option::as_ref)
            .map(|slot| &slot.device)
            .ok_or(Error::NotFound)
    }

    /// Session request on an OTG port. Refused while the port acts as host.
    pub fn start_session(&mut self, handle: DeviceHandle, port: u8, delay: u16) -> Result<()> {
        let device = self.device_mut(handle)?;
        if device.controller.role(port)?.contains(Role::HOST) {
            return Err(Error::InvalidArgument);
        }
        device
            .controller
            .start_session(port, delay)
            .map_err(|_| Error::TransitionFailed)
    }

    /// Ends the session of a B-device in peripheral role
    pub fn end_session(&mut self, handle: DeviceHandle, port: u8) -> Result<()> {
        let device = self.device_mut(handle)?;
        if !device.otg.contains(OtgStatus::SRP_SUPPORT) {
            return Err(Error::NotSupported);
        }
        let role = device.controller.role(port)?;
        if role & (Role::B_DEVICE | Role::HOST | Role::SWITCHING) != Role::B_DEVICE {
            return Err(Error::InvalidArgument);
        }
        device
            .controller
            .end_session(port)
            .map_err(|_| Error::TransitionFailed)
    }

    /// Suspends or resumes the function starting at `interface`. Only the
    /// driver of that interface is notified.
    #[cfg(feature = "superspeed")]
    pub fn function_suspend(
        &mut self,
        handle: DeviceHandle,
        interface: u8,
        suspend: bool,
        remote_wakeup: bool,
    ) -> Result<()> {
        let index = self.index(handle)?;
        self.suspend_function(index, interface, suspend, remote_wakeup)
    }

    /// Moves the link to a low power state after `idle` microseconds of
    /// inactivity: U2 when the idle time exceeds the U2 exit latency and U2
    /// is enabled, U1 otherwise.
    ///
    /// # Errors
    /// * [Error::NotSupported] - the host enabled neither U1 nor U2 (or only
    ///   U2 with too short an idle time)
    /// * [Error::TransitionFailed] - the controller refused the power mode
    #[cfg(feature = "superspeed")]
    pub fn start_link_transition(&mut self, handle: DeviceHandle, idle: u16) -> Result<()> {
        let device = self.device_mut(handle)?;
        let power = device.power;

        let state = if power.u2_enable && idle > power.exit_latency.u2_pel {
            LinkState::U2
        } else if power.u1_enable {
            LinkState::U1
        } else {
            return Err(Error::NotSupported);
        };
        debug!("usb: stack: Link transition: {}", state);

        if power.ltm_enable {
            device.controller.generate_ltm(state)?;
        }
        device
            .controller
            .update_power_mode(state)
            .map_err(|_| Error::TransitionFailed)
    }

    #[cfg(feature = "superspeed")]
    fn suspend_function(
        &mut self,
        index: usize,
        interface: u8,
        suspend: bool,
        remote_wakeup: bool,
    ) -> Result<()> {
        let id = self
            .slot_mut(index)?
            .device
            .interface(interface)
            .and_then(|intf| intf.driver())
            .ok_or(Error::InvalidArgument)?;
        let event = Event::FunctionSuspend {
            interface,
            suspend,
            remote_wakeup,
        };
        self.call_driver(index, id, |driver, ctx| driver.notify(ctx, event))
    }

    /// Class and vendor requests, routed by recipient
    fn class_request(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        use usb_device::control::Recipient;

        let device = &self.slot_mut(index)?.device;
        let id = match setup.recipient() {
            Recipient::Device => device.interface(0).and_then(|intf| intf.driver()),
            Recipient::Interface => device
                .interface(setup.index as u8)
                .and_then(|intf| intf.driver()),
            Recipient::Endpoint => self
                .resolve_endpoint(index, setup.index as u8)
                .map(|(id, _)| id),
            _ => None,
        }
        .ok_or(Error::InvalidArgument)?;

        self.call_driver(index, id, |driver, ctx| driver.class_specific(ctx, setup))
    }

    /// Offers every unclaimed interface of the active configuration to the
    /// drivers, in registration order, until one claims it
    fn enable_device(&mut self, index: usize) {
        let mut numbers = [0u8; MAX_INTERFACES];
        let mut count = 0;
        if let Some(cfg) = self.slots[index]
            .as_ref()
            .and_then(|slot| slot.device.active_configuration())
        {
            for (number, intf) in numbers.iter_mut().zip(cfg.interfaces()) {
                *number = intf.number;
                count += 1;
            }
        }

        let drivers = self.drivers;
        for &number in &numbers[..count] {
            for reg in drivers.iter().flatten() {
                let Some(slot) = self.slots[index].as_mut() else {
                    return;
                };
                let Some(intf) = slot.device.interface(number) else {
                    break;
                };
                if intf.driver().is_some() {
                    break;
                }
                if !reg.driver.examine_interface(&intf.current().descriptor) {
                    continue;
                }

                let handle = DeviceHandle(index as u8);
                let mut ctx = DeviceContext::new(handle, Some(reg.id), &mut slot.device);
                match reg.driver.connect(&mut ctx, number) {
                    Ok(()) => debug!("usb: stack: Offered interface {} to {}", number, reg.id),
                    Err(err) => warn!("usb: stack: Driver {} failed to connect: {}", reg.id, err),
                }
            }
        }
    }

    /// Disconnects every driver holding an interface of the device and
    /// drops the active configuration. All drivers are disconnected even if
    /// one fails; the first error is returned.
    fn disable_device(&mut self, index: usize) -> Result<()> {
        let mut owners = [None; MAX_INTERFACES];
        let slot = self.slot_mut(index)?;
        slot.device.state = DeviceState::Default;
        if let Some(cfg) = slot.device.active_configuration() {
            for (owner, intf) in owners.iter_mut().zip(cfg.interfaces()) {
                *owner = intf.driver();
            }
        }

        let mut result = Ok(());
        for (position, id) in owners.iter().enumerate() {
            let Some(id) = *id else { continue };
            if owners[..position].contains(&Some(id)) {
                continue;
            }
            if let Err(err) = self.call_driver(index, id, |driver, ctx| driver.disconnect(ctx)) {
                warn!("usb: stack: Driver {} failed to disconnect: {}", id, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        self.slot_mut(index)?.device.deactivate();
        result
    }

    /// Fails while any device holds an interface claimed by the driver
    fn disable_driver(&self, id: DriverId) -> Result<()> {
        let claimed = self
            .slots
            .iter()
            .flatten()
            .filter_map(|slot| slot.device.active_configuration())
            .flat_map(|cfg| cfg.interfaces())
            .any(|intf| intf.driver() == Some(id));
        if claimed {
            Err(Error::InvalidArgument)
        } else {
            Ok(())
        }
    }

    fn fan_out(&mut self, index: usize, event: Event) -> Result<()> {
        let drivers = self.drivers;
        for reg in drivers.iter().flatten() {
            let result = self.call_driver(index, reg.id, |driver, ctx| driver.notify(ctx, event));
            if let Err(err) = result {
                warn!("usb: stack: Driver {} failed on {}: {}", reg.id, event, err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Finds the driver owning an endpoint of the active configuration
    fn resolve_endpoint(&self, index: usize, address: u8) -> Option<(DriverId, Pipe)> {
        let device = &self.slots.get(index)?.as_ref()?.device;
        let cfg = device.active_configuration()?;
        let (number, ep) = cfg.find_endpoint(address)?;
        let id = cfg.interface(number)?.driver()?;
        Some((id, Pipe::new(DeviceHandle(index as u8), ep)))
    }

    fn call_driver<R>(
        &mut self,
        index: usize,
        id: DriverId,
        f: impl FnOnce(&'a dyn ClassDriver<H>, &mut DeviceContext<'_, H>) -> Result<R>,
    ) -> Result<R> {
        let driver = self.registration(id).ok_or(Error::NotFound)?.driver;
        let device = &mut self.slot_mut(index)?.device;
        let mut ctx = DeviceContext::new(DeviceHandle(index as u8), Some(id), device);
        f(driver, &mut ctx)
    }

    fn registration(&self, id: DriverId) -> Option<Registration<'a, H>> {
        self.drivers[..self.num_drivers]
            .iter()
            .flatten()
            .find(|reg| reg.id == id)
            .copied()
    }

    fn index(&self, handle: DeviceHandle) -> Result<usize> {
        match self.slots.get(handle.index()) {
            Some(Some(_)) => Ok(handle.index()),
            _ => Err(Error::NotFound),
        }
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot<'a, H>> {
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(Error::NotFound)
    }

    fn device_mut(&mut self, handle: DeviceHandle) -> Result<&mut Device<H>> {
        self.slot_mut(handle.index()).map(|slot| &mut slot.device)
    }
}
