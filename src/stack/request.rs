//! Standard device requests (USB 2.0 chapter 9, USB 3.0 chapter 9)

use super::Stack;
use crate::descriptor::{
    SetupPacket, BOS, CONFIGURATION, DEVICE, DEVICE_LEN, DEVICE_QUALIFIER,
    OTHER_SPEED_CONFIGURATION, STRING,
};
use crate::device::{ControlOwner, Device, DeviceState, ExitLatency, OtgStatus};
use crate::driver::Event;
use crate::error::{Error, Result};
use crate::fmt::{debug, info, trace};
use crate::hal::{Capabilities, FunctionController};
use usb_device::control::{Recipient, Request};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

#[cfg(feature = "superspeed")]
use crate::hal::LinkState;

#[cfg(feature = "superspeed")]
const SET_SEL: u8 = 0x30;
#[cfg(feature = "superspeed")]
const SET_ISOCH_DELAY: u8 = 0x31;

const FEATURE_TEST_MODE: u16 = 2;
const FEATURE_B_HNP_ENABLE: u16 = 3;
const FEATURE_A_HNP_SUPPORT: u16 = 4;
const FEATURE_A_ALT_HNP_SUPPORT: u16 = 5;
#[cfg(feature = "superspeed")]
const FEATURE_FUNCTION_SUSPEND: u16 = 0;
#[cfg(feature = "superspeed")]
const FEATURE_U1_ENABLE: u16 = 48;
#[cfg(feature = "superspeed")]
const FEATURE_U2_ENABLE: u16 = 49;
#[cfg(feature = "superspeed")]
const FEATURE_LTM_ENABLE: u16 = 50;

const OTG_FEATURES: core::ops::RangeInclusive<u16> = FEATURE_B_HNP_ENABLE..=FEATURE_A_ALT_HNP_SUPPORT;

/// `GET_STATUS` device bit
const STATUS_REMOTE_WAKEUP: u16 = 1 << 1;

/// Entries in the request table: codes 0..=12 plus SET_SEL and
/// SET_ISOCH_DELAY
const REQUEST_COUNT: usize = 15;

/// Whether the stack answers the request itself. Class and vendor requests
/// and descriptor requests for class descriptors (type >= 0x20) go to the
/// drivers.
pub fn is_standard(setup: &SetupPacket) -> bool {
    let class_descriptor = matches!(setup.request, Request::GET_DESCRIPTOR | Request::SET_DESCRIPTOR)
        && setup.value & 0xE000 != 0;
    setup.request_type & 0x60 == 0 && !class_descriptor
}

/// Position of a request in the handler table. USB 3.0 codes are folded
/// onto the end of the chapter 9 range.
fn table_index(request: u8) -> Option<usize> {
    match request {
        0..=12 => Some(request as usize),
        #[cfg(feature = "superspeed")]
        SET_SEL | SET_ISOCH_DELAY => Some(request as usize - 35),
        _ => None,
    }
}

/// Requests the device may answer in its current state
fn validate(state: DeviceState, setup: &SetupPacket) -> Result<()> {
    if setup.request == Request::SET_FEATURE && OTG_FEATURES.contains(&setup.value) {
        return Ok(());
    }

    let allowed = match state {
        DeviceState::Powered => false,
        DeviceState::Default => {
            matches!(setup.request, Request::SET_ADDRESS | Request::GET_DESCRIPTOR)
        }
        DeviceState::Addressed => !matches!(
            setup.request,
            Request::GET_INTERFACE | Request::SET_INTERFACE | Request::SYNCH_FRAME
        ),
        DeviceState::Configured => setup.request != Request::SET_ADDRESS,
    };

    if allowed {
        Ok(())
    } else {
        debug!("usb: stack: Request {} refused in {}", setup.request, state);
        Err(Error::NotSupported)
    }
}

/// Stages `data` as the reply to `setup`, truncated to `wLength`.
///
/// A reply shorter than requested that ends on a packet boundary needs a
/// zero-length packet to terminate the data stage.
fn stage_reply<H: FunctionController>(
    device: &mut Device<H>,
    setup: &SetupPacket,
    data: &[u8],
) -> Result<()> {
    let requested = setup.length as usize;
    let len = data.len().min(requested);
    device
        .buffer
        .get_mut(..len)
        .ok_or(Error::ResourceExhausted)?
        .copy_from_slice(&data[..len]);

    let max_packet_size = device.control_max_packet_size() as usize;
    let zero_packet = len < requested && max_packet_size != 0 && len % max_packet_size == 0;
    device.ctrl_irp.set_length(len as u32);
    device.ctrl_irp.set_zero_packet(zero_packet);
    Ok(())
}

type Handler<S> = fn(&mut S, usize, &SetupPacket) -> Result<()>;

impl<'a, H, const DEVICES: usize, const DRIVERS: usize> Stack<'a, H, DEVICES, DRIVERS>
where
    H: FunctionController,
{
    const REQUESTS: [Handler<Self>; REQUEST_COUNT] = [
        Self::get_status,        // 0x00
        Self::clear_feature,     // 0x01
        Self::reserved,          // 0x02
        Self::set_feature,       // 0x03
        Self::reserved,          // 0x04
        Self::set_address,       // 0x05
        Self::get_descriptor,    // 0x06
        Self::set_descriptor,    // 0x07
        Self::get_configuration, // 0x08
        Self::set_configuration, // 0x09
        Self::get_interface,     // 0x0A
        Self::set_interface,     // 0x0B
        Self::synch_frame,       // 0x0C
        Self::set_sel,           // 0x30
        Self::set_isoch_delay,   // 0x31
    ];

    /// Validates and answers a standard request, then queues its data stage
    pub(super) fn standard_request(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        let device = &mut self.slot_mut(index)?.device;
        validate(device.state, setup)?;
        let handler = table_index(setup.request)
            .and_then(|position| Self::REQUESTS.get(position).copied())
            .ok_or(Error::InvalidArgument)?;

        device.ctrl_irp.reset();
        device.ctrl_irp.set_direction(setup.direction());
        device.ctrl_owner = ControlOwner::Stack;

        handler(self, index, setup)?;

        let device = &mut self.slot_mut(index)?.device;
        let len = device.ctrl_irp.length() as usize;
        if len == 0 {
            return Ok(());
        }
        let data = match device.ctrl_irp.direction() {
            UsbDirection::In => device.buffer.get(..len).ok_or(Error::InvalidArgument)?,
            UsbDirection::Out => &[],
        };
        trace!("usb: stack: Control data stage: {}", len);
        device
            .controller
            .submit_transfer(EndpointAddress::from(0), &device.ctrl_irp, data)?;
        Ok(())
    }

    fn reserved(&mut self, _index: usize, _setup: &SetupPacket) -> Result<()> {
        Err(Error::InvalidArgument)
    }

    fn get_status(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        if setup.value != 0 || setup.length != 2 {
            return Err(Error::InvalidArgument);
        }
        let device = &mut self.slot_mut(index)?.device;
        let configured = device.state == DeviceState::Configured;

        let status = match setup.recipient() {
            Recipient::Device => {
                let mut status = device.controller.device_status()?;
                if device.power.remote_wakeup {
                    status |= STATUS_REMOTE_WAKEUP;
                }
                status
            }
            Recipient::Interface => {
                if !configured || device.interface(setup.index as u8).is_none() {
                    return Err(Error::InvalidArgument);
                }
                0
            }
            Recipient::Endpoint => {
                let ep = setup.index as u8;
                if !configured && ep & 0x7F != 0 {
                    return Err(Error::InvalidArgument);
                }
                device.controller.endpoint_status(EndpointAddress::from(ep))?
            }
            _ => return Err(Error::InvalidArgument),
        };
        stage_reply(device, setup, &status.to_le_bytes())
    }

    fn clear_feature(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        self.feature(index, setup, false)
    }

    fn set_feature(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        self.feature(index, setup, true)
    }

    fn feature(&mut self, index: usize, setup: &SetupPacket, set: bool) -> Result<()> {
        if setup.length != 0 {
            return Err(Error::InvalidArgument);
        }
        let device = &mut self.slot_mut(index)?.device;
        let configured = device.state == DeviceState::Configured;

        match setup.recipient() {
            Recipient::Device => {
                if setup.index & 0xFF != 0
                    || (!configured && !OTG_FEATURES.contains(&setup.value))
                {
                    return Err(Error::InvalidArgument);
                }
                Self::device_feature(device, setup, set)
            }
            Recipient::Interface => {
                if !configured {
                    return Err(Error::InvalidArgument);
                }
                self.interface_feature(index, setup, set)
            }
            Recipient::Endpoint => {
                let ep = setup.index as u8;
                if (!configured && ep & 0x7F != 0) || setup.value != Request::FEATURE_ENDPOINT_HALT {
                    return Err(Error::InvalidArgument);
                }
                if set {
                    info!("usb: stack: Halt ep: {}", ep);
                    device.controller.stall_endpoint(EndpointAddress::from(ep))?;
                    Ok(())
                } else {
                    info!("usb: stack: Clear halt ep: {}", ep);
                    device.controller.unstall_endpoint(EndpointAddress::from(ep))?;
                    self.fan_out(index, Event::ClearHaltEndpoint(ep))
                }
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    fn device_feature(device: &mut Device<H>, setup: &SetupPacket, set: bool) -> Result<()> {
        match (setup.value, set) {
            (Request::FEATURE_DEVICE_REMOTE_WAKEUP, _) => device.power.remote_wakeup = set,
            (FEATURE_TEST_MODE, true) => {
                device.controller.set_test_mode((setup.index >> 8) as u8)?;
            }
            (FEATURE_B_HNP_ENABLE, true) => {
                device.otg |= OtgStatus::B_HNP_ENABLE;
                device.controller.start_hnp(0)?;
            }
            (FEATURE_A_HNP_SUPPORT, true) => device.otg |= OtgStatus::A_HNP_SUPPORT,
            (FEATURE_A_ALT_HNP_SUPPORT, true) => device.otg |= OtgStatus::A_ALT_HNP_SUPPORT,
            #[cfg(feature = "superspeed")]
            (FEATURE_U1_ENABLE, _) => {
                device.controller.set_link_state_enable(LinkState::U1, set)?;
                device.power.u1_enable = set;
            }
            #[cfg(feature = "superspeed")]
            (FEATURE_U2_ENABLE, _) => {
                device.controller.set_link_state_enable(LinkState::U2, set)?;
                device.power.u2_enable = set;
            }
            #[cfg(feature = "superspeed")]
            (FEATURE_LTM_ENABLE, _) => {
                device.controller.set_ltm_enable(set)?;
                device.power.ltm_enable = set;
            }
            _ => return Err(Error::InvalidArgument),
        }
        Ok(())
    }

    #[cfg(feature = "superspeed")]
    fn interface_feature(&mut self, index: usize, setup: &SetupPacket, set: bool) -> Result<()> {
        if setup.value != FEATURE_FUNCTION_SUSPEND || !set {
            return Err(Error::InvalidArgument);
        }
        // suspend options: bit 0 suspend, bit 1 remote wakeup enabled
        let options = (setup.index >> 8) as u8;
        self.suspend_function(
            index,
            setup.index as u8,
            options & 0x01 != 0,
            options & 0x02 != 0,
        )
    }

    #[cfg(not(feature = "superspeed"))]
    fn interface_feature(&mut self, _index: usize, _setup: &SetupPacket, _set: bool) -> Result<()> {
        Err(Error::InvalidArgument)
    }

    fn set_address(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        if setup.value > 127 || setup.index != 0 || setup.length != 0 {
            return Err(Error::InvalidArgument);
        }
        let address = setup.value as u8;

        if address == 0 {
            self.disable_device(index)?;
        } else {
            let device = &mut self.slot_mut(index)?.device;
            let capabilities = device.controller.capabilities();
            device.state = if capabilities.contains(Capabilities::AUTO_SET_CONFIGURATION) {
                DeviceState::Configured
            } else {
                DeviceState::Addressed
            };
        }

        let device = &mut self.slot_mut(index)?.device;
        device.address = address;
        info!("usb: stack: Set address: {}", address);
        device.controller.set_address(address)?;
        Ok(())
    }

    fn get_descriptor(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        let slot = self.slot_mut(index)?;
        let descriptors = slot.descriptors;
        let device = &mut slot.device;
        let speed = device.speed;
        let descriptor_index = setup.descriptor_index();
        trace!(
            "usb: stack: Get descriptor: {}, index: {}",
            setup.descriptor_type(),
            descriptor_index
        );

        match setup.descriptor_type() {
            DEVICE => {
                let raw: [u8; DEVICE_LEN] = device.device_descriptor;
                stage_reply(device, setup, &raw)
            }
            CONFIGURATION => {
                let raw = descriptors
                    .configurations(speed)
                    .get(descriptor_index as usize)
                    .ok_or(Error::InvalidArgument)?;
                stage_reply(device, setup, raw)
            }
            STRING => {
                let raw = descriptors
                    .string(descriptor_index, setup.index)
                    .ok_or(Error::InvalidArgument)?;
                stage_reply(device, setup, raw)
            }
            DEVICE_QUALIFIER => {
                let raw = descriptors.qualifier.ok_or(Error::NotSupported)?;
                stage_reply(device, setup, &raw)
            }
            OTHER_SPEED_CONFIGURATION => {
                let raw = descriptors
                    .other_speed_configurations(speed)
                    .get(descriptor_index as usize)
                    .ok_or(Error::NotSupported)?;
                stage_reply(device, setup, raw)?;
                if let Some(kind) = device.buffer.get_mut(1) {
                    *kind = OTHER_SPEED_CONFIGURATION;
                }
                Ok(())
            }
            BOS => {
                let raw = descriptors.bos.ok_or(Error::NotSupported)?;
                stage_reply(device, setup, raw)
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    fn set_descriptor(&mut self, _index: usize, _setup: &SetupPacket) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn get_configuration(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        if setup.value != 0 || setup.index != 0 || setup.length != 1 {
            return Err(Error::InvalidArgument);
        }
        let device = &mut self.slot_mut(index)?.device;
        let value = device.active_configuration().map_or(0, |cfg| cfg.value);
        stage_reply(device, setup, &[value])
    }

    /// Switches configurations: the old one is closed and its drivers
    /// disconnected, the new one opened with every interface on alternate
    /// setting 0 and offered to the drivers. Value 0 deconfigures.
    fn set_configuration(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        if setup.value > 0xFF || setup.index != 0 || setup.length != 0 {
            return Err(Error::InvalidArgument);
        }
        let value = setup.value as u8;
        let device = &mut self.slot_mut(index)?.device;
        info!("usb: stack: Set configuration: {}", value);

        if value == 0 {
            if device.active_index().is_some() {
                device.close_pipes()?;
                self.disable_device(index)?;
                self.slot_mut(index)?.device.state = DeviceState::Addressed;
            }
            return Ok(());
        }

        let position = device
            .configuration_position(value)
            .ok_or(Error::InvalidArgument)?;
        match device.active_index() {
            Some(active) if active == position => return Ok(()),
            Some(_) => {
                device.close_pipes()?;
                self.disable_device(index)?;
            }
            None => {}
        }

        let device = &mut self.slot_mut(index)?.device;
        device.activate(position);
        if let Err(err) = device.open_pipes() {
            device.deactivate();
            return Err(err);
        }
        device.state = DeviceState::Configured;
        self.enable_device(index);
        Ok(())
    }

    fn get_interface(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        if setup.value != 0 || setup.length != 1 {
            return Err(Error::InvalidArgument);
        }
        let device = &mut self.slot_mut(index)?.device;
        let alternate_setting = device
            .interface(setup.index as u8)
            .ok_or(Error::InvalidArgument)?
            .current()
            .descriptor
            .alternate_setting;
        stage_reply(device, setup, &[alternate_setting])
    }

    /// Selects an alternate setting, reopening the interface's endpoints.
    /// Falls back to the previous setting when the new endpoints cannot be
    /// opened.
    fn set_interface(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        if setup.length != 0 {
            return Err(Error::InvalidArgument);
        }
        let number = setup.index as u8;
        let alternate_setting = setup.value as u8;
        let device = &mut self.slot_mut(index)?.device;

        let intf = device.interface(number).ok_or(Error::InvalidArgument)?;
        let new = intf
            .position_of(alternate_setting)
            .ok_or(Error::InvalidArgument)?;
        let old = intf.current_index();
        if new == old {
            return Ok(());
        }
        let driver = intf.driver();
        let old_setting = *intf.current();
        let new_setting = intf.alt_settings()[new];

        device.close_endpoints(&old_setting)?;
        device.select_setting(number, new);
        if let Err(err) = device.open_endpoints(&new_setting) {
            let _ = device.close_endpoints(&new_setting);
            device.select_setting(number, old);
            let _ = device.open_endpoints(&old_setting);
            return Err(err);
        }
        debug!(
            "usb: stack: Interface {} alternate setting {}",
            number, alternate_setting
        );

        match driver {
            Some(id) => self.call_driver(index, id, |driver, ctx| {
                driver.set_interface(ctx, number, alternate_setting)
            }),
            None => Ok(()),
        }
    }

    fn synch_frame(&mut self, _index: usize, _setup: &SetupPacket) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Arms the 6-byte OUT data stage carrying the system exit latencies
    fn set_sel(&mut self, index: usize, setup: &SetupPacket) -> Result<()> {
        if setup.value != 0 || setup.index != 0 || setup.length as usize != ExitLatency::LEN {
            return Err(Error::InvalidArgument);
        }
        let device = &mut self.slot_mut(index)?.device;
        device.ctrl_irp.set_direction(UsbDirection::Out);
        device.ctrl_irp.set_length(ExitLatency::LEN as u32);
        device.ctrl_owner = ControlOwner::ExitLatency;
        Ok(())
    }

    fn set_isoch_delay(&mut self, _index: usize, _setup: &SetupPacket) -> Result<()> {
        Err(Error::NotSupported)
    }
}
