#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use usb_device::endpoint::EndpointAddress;
use usb_device::{UsbDirection, UsbError};
use usbf_stack::descriptor::{
    DeviceDescriptors, EndpointDescriptor, SetupPacket, StringDescriptor, CONFIGURATION, ENDPOINT,
    INTERFACE,
};
use usbf_stack::device::DeviceHandle;
use usbf_stack::hal::{Capabilities, FunctionController, LinkState, Role};
use usbf_stack::irp::Irp;
use usbf_stack::stack::Stack;

#[cfg(feature = "msc")]
pub mod bbb;

pub type TestStack = Stack<'static, DummyController, 2, 4>;

pub const MAX_PACKET_SIZE_0: u8 = 64;
pub const BULK_IN: u8 = 0x81;
pub const BULK_OUT: u8 = 0x02;
pub const INTERRUPT_IN: u8 = 0x83;

/// A transfer queued by the stack or a driver
#[derive(Debug, Clone)]
pub struct Submission {
    pub ep: u8,
    pub irp: Irp,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct Inner {
    pub capabilities: Capabilities,
    pub initialized: bool,
    pub interrupts: bool,
    pub address: Option<u8>,
    pub device_status: u16,
    pub stalled: HashSet<u8>,
    pub submissions: VecDeque<Submission>,
    pub flushed: Vec<u8>,
    pub opened: Vec<u8>,
    pub closed: Vec<u8>,
    /// Fail `open_pipe` for this endpoint
    pub refuse_open: Option<u8>,
    pub role: Option<Role>,
    pub sessions: Vec<(u8, u16)>,
    pub hnp_started: bool,
    pub test_mode: Option<u8>,
    pub link_enables: Vec<(LinkState, bool)>,
    pub ltm_enable: Option<bool>,
    pub ltm_messages: Vec<LinkState>,
    pub power_modes: Vec<LinkState>,
    pub refuse_power_mode: bool,
}

/// Controller recording every call of the stack
#[derive(Clone, Default)]
pub struct DummyController {
    inner: Arc<Mutex<Inner>>,
}

impl DummyController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        let controller = Self::new();
        controller.lock().capabilities = capabilities;
        controller
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Pops the oldest transfer queued on `ep`
    pub fn take_submission(&self, ep: u8) -> Option<Submission> {
        let mut lock = self.lock();
        let position = lock.submissions.iter().position(|s| s.ep == ep)?;
        lock.submissions.remove(position)
    }

    pub fn pending(&self, ep: u8) -> usize {
        self.lock().submissions.iter().filter(|s| s.ep == ep).count()
    }

    pub fn clear_submissions(&self) {
        self.lock().submissions.clear();
    }

    pub fn is_stalled(&self, ep: u8) -> bool {
        self.lock().stalled.contains(&ep)
    }
}

impl FunctionController for DummyController {
    fn initialize(&mut self) -> usb_device::Result<()> {
        self.lock().initialized = true;
        Ok(())
    }

    fn uninitialize(&mut self) -> usb_device::Result<()> {
        self.lock().initialized = false;
        Ok(())
    }

    fn enable_interrupts(&mut self) -> usb_device::Result<()> {
        self.lock().interrupts = true;
        Ok(())
    }

    fn disable_interrupts(&mut self) -> usb_device::Result<()> {
        self.lock().interrupts = false;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.lock().capabilities
    }

    fn set_address(&mut self, address: u8) -> usb_device::Result<()> {
        self.lock().address = Some(address);
        Ok(())
    }

    fn device_status(&self) -> usb_device::Result<u16> {
        Ok(self.lock().device_status)
    }

    fn endpoint_status(&self, ep: EndpointAddress) -> usb_device::Result<u16> {
        Ok(self.is_stalled(u8::from(ep)) as u16)
    }

    fn stall_endpoint(&mut self, ep: EndpointAddress) -> usb_device::Result<()> {
        self.lock().stalled.insert(u8::from(ep));
        Ok(())
    }

    fn unstall_endpoint(&mut self, ep: EndpointAddress) -> usb_device::Result<()> {
        self.lock().stalled.remove(&u8::from(ep));
        Ok(())
    }

    fn open_pipe(&mut self, endpoint: &EndpointDescriptor) -> usb_device::Result<()> {
        let mut lock = self.lock();
        if lock.refuse_open == Some(endpoint.address) {
            return Err(UsbError::EndpointOverflow);
        }
        lock.opened.push(endpoint.address);
        Ok(())
    }

    fn close_pipe(&mut self, ep: EndpointAddress) -> usb_device::Result<()> {
        self.lock().closed.push(u8::from(ep));
        Ok(())
    }

    fn submit_transfer(
        &mut self,
        ep: EndpointAddress,
        irp: &Irp,
        data: &[u8],
    ) -> usb_device::Result<()> {
        if irp.direction() == UsbDirection::In {
            assert_eq!(irp.length() as usize, data.len());
        }
        self.lock().submissions.push_back(Submission {
            ep: u8::from(ep),
            irp: *irp,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn flush_pipe(&mut self, ep: EndpointAddress) -> usb_device::Result<()> {
        let ep = u8::from(ep);
        let mut lock = self.lock();
        lock.flushed.push(ep);
        lock.submissions.retain(|s| s.ep != ep);
        Ok(())
    }

    fn role(&self, _port: u8) -> usb_device::Result<Role> {
        self.lock().role.ok_or(UsbError::Unsupported)
    }

    fn start_session(&mut self, port: u8, delay: u16) -> usb_device::Result<()> {
        self.lock().sessions.push((port, delay));
        Ok(())
    }

    fn end_session(&mut self, _port: u8) -> usb_device::Result<()> {
        Ok(())
    }

    fn start_hnp(&mut self, _port: u8) -> usb_device::Result<()> {
        self.lock().hnp_started = true;
        Ok(())
    }

    fn set_test_mode(&mut self, selector: u8) -> usb_device::Result<()> {
        self.lock().test_mode = Some(selector);
        Ok(())
    }

    fn set_link_state_enable(&mut self, state: LinkState, enable: bool) -> usb_device::Result<()> {
        self.lock().link_enables.push((state, enable));
        Ok(())
    }

    fn set_ltm_enable(&mut self, enable: bool) -> usb_device::Result<()> {
        self.lock().ltm_enable = Some(enable);
        Ok(())
    }

    fn generate_ltm(&mut self, state: LinkState) -> usb_device::Result<()> {
        self.lock().ltm_messages.push(state);
        Ok(())
    }

    fn update_power_mode(&mut self, state: LinkState) -> usb_device::Result<()> {
        let mut lock = self.lock();
        if lock.refuse_power_mode {
            return Err(UsbError::InvalidState);
        }
        lock.power_modes.push(state);
        Ok(())
    }
}

pub fn device_descriptor() -> [u8; 18] {
    [
        18, 0x01, 0x00, 0x02, 0, 0, 0, MAX_PACKET_SIZE_0, 0xcd, 0xab, 0xcd, 0xab, 0x00, 0x01, 1,
        2, 3, 1,
    ]
}

pub fn interface(number: u8, alternate: u8, endpoints: u8, class: [u8; 3]) -> Vec<u8> {
    vec![
        9, INTERFACE, number, alternate, endpoints, class[0], class[1], class[2], 0,
    ]
}

pub fn endpoint(address: u8, attributes: u8, max_packet_size: u16) -> Vec<u8> {
    let mps = max_packet_size.to_le_bytes();
    vec![7, ENDPOINT, address, attributes, mps[0], mps[1], 1]
}

/// Configuration descriptor around `body`, leaked for the lifetime of the
/// test
pub fn configuration(value: u8, num_interfaces: u8, body: &[Vec<u8>]) -> &'static [u8] {
    let body: Vec<u8> = body.concat();
    let total = (9 + body.len()) as u16;
    let mut raw = vec![
        9,
        CONFIGURATION,
        total.to_le_bytes()[0],
        total.to_le_bytes()[1],
        num_interfaces,
        value,
        0,
        0x80,
        50,
    ];
    raw.extend_from_slice(&body);
    Box::leak(raw.into_boxed_slice())
}

/// A Bulk Only SCSI interface (0) and a vendor interface (1) with two
/// alternate settings
pub fn msc_configuration(value: u8) -> &'static [u8] {
    configuration(
        value,
        2,
        &[
            interface(0, 0, 2, [0x08, 0x06, 0x50]),
            endpoint(BULK_IN, 0x02, 64),
            endpoint(BULK_OUT, 0x02, 64),
            interface(1, 0, 0, [0xFF, 0x00, 0x00]),
            interface(1, 1, 1, [0xFF, 0x00, 0x00]),
            endpoint(INTERRUPT_IN, 0x03, 8),
        ],
    )
}

/// RNDIS communication interface (0) and its data interface (1)
pub fn rndis_configuration(value: u8) -> &'static [u8] {
    configuration(
        value,
        2,
        &[
            interface(0, 0, 1, [0x02, 0x02, 0xFF]),
            endpoint(INTERRUPT_IN, 0x03, 8),
            interface(1, 0, 2, [0x0A, 0x00, 0x00]),
            endpoint(BULK_IN, 0x02, 64),
            endpoint(BULK_OUT, 0x02, 64),
        ],
    )
}

pub fn strings() -> &'static [StringDescriptor<'static>] {
    let strings = vec![
        StringDescriptor {
            index: 0,
            lang_id: 0,
            bytes: &[4, 0x03, 0x09, 0x04],
        },
        StringDescriptor {
            index: 1,
            lang_id: 0x0409,
            bytes: &[8, 0x03, b'u', 0, b's', 0, b'b', 0],
        },
    ];
    Box::leak(strings.into_boxed_slice())
}

/// Full speed only descriptor set
pub fn full_speed(configurations: &[&'static [u8]]) -> DeviceDescriptors<'static> {
    DeviceDescriptors {
        device: device_descriptor(),
        qualifier: None,
        full_speed: Box::leak(configurations.to_vec().into_boxed_slice()),
        high_speed: &[],
        super_speed: &[],
        strings: strings(),
        bos: None,
    }
}

pub fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
}

/// SET_ADDRESS then SET_CONFIGURATION, dropping the control transfers
/// queued along the way
pub fn enumerate(stack: &mut TestStack, controller: &DummyController, handle: DeviceHandle) {
    stack.new_setup(handle, &setup(0x00, 0x05, 7, 0, 0)).unwrap();
    stack.new_setup(handle, &setup(0x00, 0x09, 1, 0, 0)).unwrap();
    while controller.take_submission(0).is_some() {}
}
