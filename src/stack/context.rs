use crate::descriptor::{Interface, TransferType};
use crate::device::{ControlOwner, Device, DeviceHandle, DeviceState};
use crate::driver::DriverId;
use crate::error::{Error, Result};
use crate::fmt::trace;
use crate::hal::{Capabilities, FunctionController, Speed};
use crate::irp::{Irp, Pipe};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// Access to one attached device, handed to class drivers and clients.
///
/// Carries the endpoint services: every pipe is resolved to its physical
/// endpoint address (`0` for the control pipe) and the call is forwarded to
/// the controller.
pub struct DeviceContext<'s, H> {
    handle: DeviceHandle,
    driver: Option<DriverId>,
    device: &'s mut Device<H>,
}

impl<'s, H: FunctionController> DeviceContext<'s, H> {
    pub(crate) fn new(
        handle: DeviceHandle,
        driver: Option<DriverId>,
        device: &'s mut Device<H>,
    ) -> Self {
        DeviceContext {
            handle,
            driver,
            device,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn state(&self) -> DeviceState {
        self.device.state()
    }

    pub fn speed(&self) -> Speed {
        self.device.speed()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.device.controller.capabilities()
    }

    pub fn controller(&self) -> &H {
        &self.device.controller
    }

    /// Interface of the active configuration
    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.device
            .active_configuration()
            .and_then(|cfg| cfg.interface(number))
    }

    pub fn control_pipe(&self) -> Pipe {
        Pipe::control(self.handle)
    }

    /// First endpoint of the interface's selected setting matching the
    /// transfer type and direction
    pub fn find_pipe(
        &self,
        interface: u8,
        kind: TransferType,
        direction: UsbDirection,
    ) -> Option<Pipe> {
        self.interface(interface)?
            .current()
            .endpoints()
            .iter()
            .find(|ep| ep.transfer_type() == kind && ep.direction() == direction)
            .map(|ep| Pipe::new(self.handle, *ep))
    }

    /// Takes an interface for the calling driver
    pub fn claim_interface(&mut self, number: u8) -> Result<()> {
        let driver = self.driver.ok_or(Error::InvalidArgument)?;
        let intf = self
            .device
            .active_configuration_mut()
            .and_then(|cfg| cfg.interface_mut(number))
            .ok_or(Error::NotFound)?;
        match intf.driver {
            Some(owner) if owner != driver => Err(Error::InvalidArgument),
            _ => {
                intf.driver = Some(driver);
                Ok(())
            }
        }
    }

    pub fn release_interface(&mut self, number: u8) -> Result<()> {
        let driver = self.driver.ok_or(Error::InvalidArgument)?;
        let intf = self
            .device
            .active_configuration_mut()
            .and_then(|cfg| cfg.interface_mut(number))
            .ok_or(Error::NotFound)?;
        if intf.driver != Some(driver) {
            return Err(Error::InvalidArgument);
        }
        intf.driver = None;
        Ok(())
    }

    pub fn is_claimed(&self, number: u8) -> bool {
        self.interface(number)
            .map(|intf| intf.driver().is_some())
            .unwrap_or(false)
    }

    fn resolve(&self, pipe: &Pipe) -> Result<EndpointAddress> {
        if pipe.device() != self.handle {
            return Err(Error::InvalidArgument);
        }
        Ok(pipe.address())
    }

    pub fn stall_endpoint(&mut self, pipe: &Pipe) -> Result<()> {
        let ep = self.resolve(pipe)?;
        self.device.controller.stall_endpoint(ep)?;
        Ok(())
    }

    pub fn unstall_endpoint(&mut self, pipe: &Pipe) -> Result<()> {
        let ep = self.resolve(pipe)?;
        self.device.controller.unstall_endpoint(ep)?;
        Ok(())
    }

    pub fn is_endpoint_stalled(&self, pipe: &Pipe) -> Result<bool> {
        Ok(self.endpoint_status(pipe)? & 0x0001 != 0)
    }

    pub fn endpoint_status(&self, pipe: &Pipe) -> Result<u16> {
        let ep = self.resolve(pipe)?;
        Ok(self.device.controller.endpoint_status(ep)?)
    }

    pub fn device_status(&self) -> Result<u16> {
        Ok(self.device.controller.device_status()?)
    }

    /// Queues `irp` on the pipe. For device-to-host transfers `data` holds
    /// the bytes to send and must cover `irp.length()`.
    pub fn submit_irp(&mut self, pipe: &Pipe, irp: &Irp, data: &[u8]) -> Result<()> {
        let ep = self.resolve(pipe)?;
        let data = match irp.direction() {
            UsbDirection::In => data
                .get(..irp.length() as usize)
                .ok_or(Error::InvalidArgument)?,
            UsbDirection::Out => &[],
        };
        if pipe.is_control() {
            self.device.ctrl_owner = match self.driver {
                Some(id) => ControlOwner::Driver(id),
                None => ControlOwner::Stack,
            };
        }
        trace!(
            "usb: stack: Submit IRP ep: {}, len: {}",
            u8::from(ep),
            irp.length()
        );
        self.device.controller.submit_transfer(ep, irp, data)?;
        Ok(())
    }

    pub fn cancel_irp(&mut self, pipe: &Pipe) -> Result<()> {
        self.flush_pipe(pipe)
    }

    pub fn flush_pipe(&mut self, pipe: &Pipe) -> Result<()> {
        let ep = self.resolve(pipe)?;
        self.device.controller.flush_pipe(ep)?;
        Ok(())
    }
}
