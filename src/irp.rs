//! I/O request packets and pipes
//!
//! An [Irp] describes one transfer. It belongs to whoever submitted it: the
//! controller only reads it while queueing the transfer and reports the
//! outcome as a [Completion], which the stack routes back to the owner of the
//! pipe (a class driver, or the stack itself for its own control data
//! stages). The owner then folds the completion into its IRP with
//! [Irp::complete].

use crate::descriptor::EndpointDescriptor;
use crate::device::DeviceHandle;
use usb_device::endpoint::EndpointAddress;
use usb_device::{UsbDirection, UsbError};

/// Logical channel to one endpoint of one device.
///
/// The control pipe carries no endpoint descriptor; it always resolves to
/// address `0`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Pipe {
    device: DeviceHandle,
    endpoint: Option<EndpointDescriptor>,
}

impl Pipe {
    pub(crate) fn control(device: DeviceHandle) -> Self {
        Pipe {
            device,
            endpoint: None,
        }
    }

    pub(crate) fn new(device: DeviceHandle, endpoint: EndpointDescriptor) -> Self {
        Pipe {
            device,
            endpoint: Some(endpoint),
        }
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn endpoint(&self) -> Option<&EndpointDescriptor> {
        self.endpoint.as_ref()
    }

    pub fn is_control(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Physical endpoint address
    pub fn address(&self) -> EndpointAddress {
        match &self.endpoint {
            Some(ep) => ep.address(),
            None => EndpointAddress::from(0),
        }
    }

    pub fn max_packet_size(&self) -> u16 {
        self.endpoint.map(|ep| ep.max_packet_size).unwrap_or(0)
    }
}

/// I/O request packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Irp {
    length: u32,
    direction: UsbDirection,
    zero_packet: bool,
    context: u32,
    status: Option<Result<(), UsbError>>,
    actual_length: u32,
}

impl Irp {
    pub const fn new(direction: UsbDirection) -> Self {
        Irp {
            length: 0,
            direction,
            zero_packet: false,
            context: 0,
            status: None,
            actual_length: 0,
        }
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    /// Opaque value echoed back in the [Completion]
    pub fn with_context(mut self, context: u32) -> Self {
        self.context = context;
        self
    }

    /// Terminate the transfer with a zero-length packet
    pub fn with_zero_packet(mut self, zero_packet: bool) -> Self {
        self.zero_packet = zero_packet;
        self
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn direction(&self) -> UsbDirection {
        self.direction
    }

    pub fn zero_packet(&self) -> bool {
        self.zero_packet
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    /// `None` while the transfer is in flight
    pub fn status(&self) -> Option<Result<(), UsbError>> {
        self.status
    }

    pub fn actual_length(&self) -> u32 {
        self.actual_length
    }

    pub(crate) fn reset(&mut self) {
        *self = Irp::new(self.direction);
    }

    pub(crate) fn set_length(&mut self, length: u32) {
        self.length = length;
    }

    pub(crate) fn set_direction(&mut self, direction: UsbDirection) {
        self.direction = direction;
    }

    pub(crate) fn set_zero_packet(&mut self, zero_packet: bool) {
        self.zero_packet = zero_packet;
    }

    pub(crate) fn complete(&mut self, completion: &Completion<'_>) {
        self.status = Some(completion.status);
        self.actual_length = completion.actual_length;
    }
}

/// Outcome of a transfer, reported by the controller
#[derive(Debug, Copy, Clone)]
pub struct Completion<'d> {
    pub status: Result<(), UsbError>,
    pub actual_length: u32,
    pub context: u32,
    /// Bytes received on a host-to-device transfer. Empty otherwise.
    pub data: &'d [u8],
}

impl<'d> Completion<'d> {
    /// Successful device-to-host transfer of `actual_length` bytes
    pub fn sent(irp: &Irp, actual_length: u32) -> Self {
        Completion {
            status: Ok(()),
            actual_length,
            context: irp.context(),
            data: &[],
        }
    }

    /// Successful host-to-device transfer
    pub fn received(irp: &Irp, data: &'d [u8]) -> Self {
        Completion {
            status: Ok(()),
            actual_length: data.len() as u32,
            context: irp.context(),
            data,
        }
    }

    pub fn failed(irp: &Irp, err: UsbError) -> Self {
        Completion {
            status: Err(err),
            actual_length: 0,
            context: irp.context(),
            data: &[],
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_pipe_resolves_to_address_zero() {
        let pipe = Pipe::control(DeviceHandle(1));
        assert!(pipe.is_control());
        assert_eq!(0u8, u8::from(pipe.address()));
        assert_eq!(0, pipe.max_packet_size());
    }

    #[test]
    fn bulk_pipe_resolves_to_endpoint_address() {
        let ep = EndpointDescriptor::parse(&[7, 0x05, 0x81, 0x02, 0x00, 0x02, 0]).unwrap();
        let pipe = Pipe::new(DeviceHandle(0), ep);
        assert!(!pipe.is_control());
        assert_eq!(0x81u8, u8::from(pipe.address()));
        assert_eq!(512, pipe.max_packet_size());
    }

    #[test]
    fn completion_is_folded_into_irp() {
        let mut irp = Irp::new(UsbDirection::Out)
            .with_length(31)
            .with_context(3);
        assert_eq!(None, irp.status());

        let data = [0u8; 13];
        let completion = Completion::received(&irp, &data);
        assert_eq!(3, completion.context);
        irp.complete(&completion);
        assert_eq!(Some(Ok(())), irp.status());
        assert_eq!(13, irp.actual_length());

        irp.reset();
        assert_eq!(0, irp.length());
        assert_eq!(UsbDirection::Out, irp.direction());
    }
}
