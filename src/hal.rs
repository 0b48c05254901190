//! Hardware adaptation interface
//!
//! The stack never touches controller registers. Everything it needs from a
//! device controller goes through [FunctionController], which a board driver
//! implements. Endpoints are always identified by their physical address;
//! address `0` is the control endpoint.
//!
//! Transfers are asynchronous: [submit_transfer] only queues the transfer and
//! the controller reports the outcome later through
//! [Stack::transfer_complete].
//!
//! [submit_transfer]: FunctionController::submit_transfer
//! [Stack::transfer_complete]: crate::stack::Stack::transfer_complete

use crate::descriptor::EndpointDescriptor;
use crate::irp::Irp;
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use usb_device::endpoint::EndpointAddress;
use usb_device::{Result, UsbError};

bitflags! {
    /// Standard requests the controller answers by itself.
    ///
    /// Bit positions are the request codes.
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
    pub struct Capabilities: u32 {
        const AUTO_SET_ADDRESS = 1 << 5;
        const AUTO_SET_CONFIGURATION = 1 << 9;
    }
}

bitflags! {
    /// OTG role of a port
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
    pub struct Role: u8 {
        /// The ID pin identifies a B-device
        const B_DEVICE = 0x01;
        /// The port currently acts as host
        const HOST = 0x02;
        /// A role swap is in progress
        const SWITCHING = 0x04;
    }
}

/// Bus speed
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
}

impl Speed {
    /// `bcdUSB` reported in the device descriptor at this speed
    pub fn bcd_usb(self) -> u16 {
        match self {
            Speed::Super => 0x0300,
            Speed::High => 0x0210,
            Speed::Full | Speed::Low => 0x0110,
            Speed::Unknown => 0x0200,
        }
    }
}

/// USB 3.0 link state
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    U0 = 0,
    U1 = 1,
    U2 = 2,
    U3 = 3,
}

/// Device controller operations consumed by the stack.
///
/// Operations a controller may lack have a default body returning
/// [UsbError::Unsupported].
pub trait FunctionController {
    /// Brings the controller up. Interrupts stay disabled.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn enable_interrupts(&mut self) -> Result<()>;

    fn disable_interrupts(&mut self) -> Result<()>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Programs the function address assigned by the host
    fn set_address(&mut self, address: u8) -> Result<()>;

    /// `GET_STATUS` payload for the device recipient
    fn device_status(&self) -> Result<u16>;

    /// `GET_STATUS` payload for an endpoint. Bit 0 is the halt feature.
    fn endpoint_status(&self, ep: EndpointAddress) -> Result<u16>;

    fn stall_endpoint(&mut self, ep: EndpointAddress) -> Result<()>;

    fn unstall_endpoint(&mut self, ep: EndpointAddress) -> Result<()>;

    /// Configures an endpoint of a newly selected configuration or setting
    fn open_pipe(&mut self, _endpoint: &EndpointDescriptor) -> Result<()> {
        Ok(())
    }

    fn close_pipe(&mut self, _ep: EndpointAddress) -> Result<()> {
        Ok(())
    }

    /// Queues a transfer.
    ///
    /// For device-to-host transfers `data` holds the `irp.length()` bytes to
    /// send. For host-to-device transfers `data` is empty and the received
    /// bytes are reported on completion. The controller must not keep the
    /// IRP or the data past this call; it copies what it needs.
    fn submit_transfer(&mut self, ep: EndpointAddress, irp: &Irp, data: &[u8]) -> Result<()>;

    /// Drops any transfer queued on the endpoint. No transfer queued is not
    /// an error.
    fn flush_pipe(&mut self, ep: EndpointAddress) -> Result<()>;

    fn role(&self, _port: u8) -> Result<Role> {
        Err(UsbError::Unsupported)
    }

    /// Session request protocol: asks the A-device to power the bus
    fn start_session(&mut self, _port: u8, _delay: u16) -> Result<()> {
        Err(UsbError::Unsupported)
    }

    fn end_session(&mut self, _port: u8) -> Result<()> {
        Err(UsbError::Unsupported)
    }

    fn start_hnp(&mut self, _port: u8) -> Result<()> {
        Err(UsbError::Unsupported)
    }

    fn set_test_mode(&mut self, _selector: u8) -> Result<()> {
        Err(UsbError::Unsupported)
    }

    fn set_link_state_enable(&mut self, _state: LinkState, _enable: bool) -> Result<()> {
        Err(UsbError::Unsupported)
    }

    fn set_ltm_enable(&mut self, _enable: bool) -> Result<()> {
        Err(UsbError::Unsupported)
    }

    /// Sends a latency tolerance message for the link state about to be entered
    fn generate_ltm(&mut self, _state: LinkState) -> Result<()> {
        Err(UsbError::Unsupported)
    }

    fn update_power_mode(&mut self, _state: LinkState) -> Result<()> {
        Err(UsbError::Unsupported)
    }
}
