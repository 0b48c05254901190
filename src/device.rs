//! Per-controller device state

use crate::descriptor::{AltSetting, Configuration, Interface, DEVICE_LEN, MAX_CONFIGURATIONS};
use crate::driver::DriverId;
use crate::error::{Error, Result};
use crate::hal::{FunctionController, Speed};
use crate::irp::Irp;
use bitflags::bitflags;
use usb_device::UsbDirection;

/// Size of the buffer replies to standard requests are staged in
pub const CONTROL_BUFFER_LEN: usize = 256;

/// Index of an attached device in its [Stack](crate::stack::Stack)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceHandle(pub(crate) u8);

impl DeviceHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// USB device state (chapter 9)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// No controller hardware attached
    Powered,
    Default,
    Addressed,
    Configured,
}

bitflags! {
    /// OTG feature state
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
    pub struct OtgStatus: u8 {
        const SRP_SUPPORT = 0x01;
        const HNP_SUPPORT = 0x02;
        const B_HNP_ENABLE = 0x20;
        const A_HNP_SUPPORT = 0x40;
        const A_ALT_HNP_SUPPORT = 0x80;
    }
}

/// System exit latencies delivered by `SET_SEL`
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ExitLatency {
    pub u1_sel: u8,
    pub u1_pel: u8,
    pub u2_sel: u16,
    pub u2_pel: u16,
}

impl ExitLatency {
    pub const LEN: usize = 6;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LEN {
            return Err(Error::InvalidArgument);
        }
        Ok(ExitLatency {
            u1_sel: raw[0],
            u1_pel: raw[1],
            u2_sel: u16::from_le_bytes([raw[2], raw[3]]),
            u2_pel: u16::from_le_bytes([raw[4], raw[5]]),
        })
    }
}

/// Link power management attributes
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerAttributes {
    pub remote_wakeup: bool,
    pub u1_enable: bool,
    pub u2_enable: bool,
    pub ltm_enable: bool,
    pub exit_latency: ExitLatency,
}

/// Who receives the completion of the data stage on the control endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ControlOwner {
    /// A reply of the stack itself; completion needs no processing
    Stack,
    /// `SET_SEL` data awaited by the stack
    ExitLatency,
    Driver(DriverId),
}

pub struct Device<H> {
    pub(crate) controller: H,
    pub(crate) state: DeviceState,
    pub(crate) speed: Speed,
    pub(crate) address: u8,
    pub(crate) device_descriptor: [u8; DEVICE_LEN],
    configurations: [Configuration; MAX_CONFIGURATIONS],
    num_configurations: usize,
    active: Option<usize>,
    pub(crate) buffer: [u8; CONTROL_BUFFER_LEN],
    pub(crate) ctrl_irp: Irp,
    pub(crate) ctrl_owner: ControlOwner,
    pub(crate) otg: OtgStatus,
    pub(crate) power: PowerAttributes,
}

impl<H: FunctionController> Device<H> {
    pub(crate) fn new(controller: H, device_descriptor: [u8; DEVICE_LEN]) -> Self {
        Device {
            controller,
            state: DeviceState::Default,
            speed: Speed::Unknown,
            address: 0,
            device_descriptor,
            configurations: Default::default(),
            num_configurations: 0,
            active: None,
            buffer: [0; CONTROL_BUFFER_LEN],
            ctrl_irp: Irp::new(UsbDirection::In),
            ctrl_owner: ControlOwner::Stack,
            otg: OtgStatus::empty(),
            power: PowerAttributes::default(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Function address assigned by the host, `0` until then
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn power(&self) -> PowerAttributes {
        self.power
    }

    pub fn otg(&self) -> OtgStatus {
        self.otg
    }

    pub fn controller(&self) -> &H {
        &self.controller
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations[..self.num_configurations]
    }

    pub fn active_configuration(&self) -> Option<&Configuration> {
        self.active.map(|index| &self.configurations[index])
    }

    pub(crate) fn active_configuration_mut(&mut self) -> Option<&mut Configuration> {
        match self.active {
            Some(index) => Some(&mut self.configurations[index]),
            None => None,
        }
    }

    pub(crate) fn configuration_position(&self, value: u8) -> Option<usize> {
        self.configurations()
            .iter()
            .position(|cfg| cfg.value == value)
    }

    pub(crate) fn active_index(&self) -> Option<usize> {
        self.active
    }

    /// Makes a configuration active with every interface unclaimed and on
    /// its first alternate setting
    pub(crate) fn activate(&mut self, index: usize) {
        if index < self.num_configurations {
            let cfg = &mut self.configurations[index];
            cfg.select_default_settings();
            for intf in cfg.interfaces_mut() {
                intf.driver = None;
            }
            self.active = Some(index);
        }
    }

    pub(crate) fn deactivate(&mut self) {
        if let Some(cfg) = self.active_configuration_mut() {
            for intf in cfg.interfaces_mut() {
                intf.driver = None;
            }
        }
        self.active = None;
    }

    /// Interface of the active configuration
    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.active_configuration()
            .and_then(|cfg| cfg.interface(number))
    }

    pub(crate) fn select_setting(&mut self, number: u8, index: usize) {
        if let Some(intf) = self
            .active_configuration_mut()
            .and_then(|cfg| cfg.interface_mut(number))
        {
            intf.select(index);
        }
    }

    pub(crate) fn open_endpoints(&mut self, setting: &AltSetting) -> Result<()> {
        for ep in setting.endpoints() {
            self.controller.open_pipe(ep)?;
        }
        Ok(())
    }

    pub(crate) fn close_endpoints(&mut self, setting: &AltSetting) -> Result<()> {
        for ep in setting.endpoints() {
            self.controller.close_pipe(ep.address())?;
        }
        Ok(())
    }

    /// Selected setting of the interface at `position` in the active
    /// configuration
    fn current_setting(&self, position: usize) -> Option<AltSetting> {
        self.active_configuration()
            .and_then(|cfg| cfg.interfaces().get(position))
            .map(|intf| *intf.current())
    }

    /// Opens the endpoints of every selected setting of the active
    /// configuration
    pub(crate) fn open_pipes(&mut self) -> Result<()> {
        let mut position = 0;
        while let Some(setting) = self.current_setting(position) {
            self.open_endpoints(&setting)?;
            position += 1;
        }
        Ok(())
    }

    pub(crate) fn close_pipes(&mut self) -> Result<()> {
        let mut position = 0;
        while let Some(setting) = self.current_setting(position) {
            self.close_endpoints(&setting)?;
            position += 1;
        }
        Ok(())
    }

    /// Parses the configuration descriptors for the current speed
    pub(crate) fn load_configurations(&mut self, raw: &[&[u8]]) -> Result<()> {
        if raw.len() > MAX_CONFIGURATIONS {
            return Err(Error::ResourceExhausted);
        }
        self.num_configurations = 0;
        self.active = None;
        let mut otg = None;
        for (slot, desc) in self.configurations.iter_mut().zip(raw) {
            *slot = Configuration::parse(desc)?;
            otg = otg.or(slot.otg_attributes);
        }
        self.num_configurations = raw.len();

        // bmAttributes of the OTG descriptor: bit 0 SRP, bit 1 HNP
        if let Some(attributes) = otg {
            self.otg |= OtgStatus::from_bits_truncate(attributes & 0x03);
        }
        Ok(())
    }

    pub(crate) fn set_bcd_usb(&mut self, bcd: u16) {
        self.device_descriptor[2..4].copy_from_slice(&bcd.to_le_bytes());
    }

    pub(crate) fn control_max_packet_size(&self) -> u16 {
        self.device_descriptor[7] as u16
    }
}
