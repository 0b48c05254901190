//! Descriptors and SETUP packets
//!
//! Configuration descriptors are supplied raw (as they go on the wire) and
//! parsed into fixed tables when the bus speed is known. Multi-byte fields
//! are little-endian.

use crate::driver::DriverId;
use crate::error::{Error, Result};
use crate::hal::Speed;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use usb_device::control::{Recipient, RequestType};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

pub const DEVICE: u8 = 0x01;
pub const CONFIGURATION: u8 = 0x02;
pub const STRING: u8 = 0x03;
pub const INTERFACE: u8 = 0x04;
pub const ENDPOINT: u8 = 0x05;
pub const DEVICE_QUALIFIER: u8 = 0x06;
pub const OTHER_SPEED_CONFIGURATION: u8 = 0x07;
pub const OTG: u8 = 0x09;
pub const BOS: u8 = 0x0F;
pub const SS_ENDPOINT_COMPANION: u8 = 0x30;

pub const DEVICE_LEN: usize = 18;
pub const QUALIFIER_LEN: usize = 10;
pub const CONFIGURATION_LEN: usize = 9;

pub const MAX_CONFIGURATIONS: usize = 2;
pub const MAX_INTERFACES: usize = 8;
pub const MAX_ALT_SETTINGS: usize = 4;
pub const MAX_ENDPOINTS: usize = 4;

/// Endpoint transfer type (`bmAttributes` bits 1..0)
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
}

impl InterfaceDescriptor {
    pub const LEN: usize = 9;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::LEN || raw[1] != INTERFACE {
            return Err(Error::InvalidArgument);
        }
        Ok(InterfaceDescriptor {
            number: raw[2],
            alternate_setting: raw[3],
            num_endpoints: raw[4],
            class: raw[5],
            subclass: raw[6],
            protocol: raw[7],
            string_index: raw[8],
        })
    }
}

/// USB 3.0 SuperSpeed endpoint companion
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CompanionDescriptor {
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}

impl CompanionDescriptor {
    pub const LEN: usize = 6;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::LEN || raw[1] != SS_ENDPOINT_COMPANION {
            return Err(Error::InvalidArgument);
        }
        Ok(CompanionDescriptor {
            max_burst: raw[2],
            attributes: raw[3],
            bytes_per_interval: u16::from_le_bytes([raw[4], raw[5]]),
        })
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub companion: Option<CompanionDescriptor>,
}

impl EndpointDescriptor {
    pub const LEN: usize = 7;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::LEN || raw[1] != ENDPOINT {
            return Err(Error::InvalidArgument);
        }
        Ok(EndpointDescriptor {
            address: raw[2],
            attributes: raw[3],
            max_packet_size: u16::from_le_bytes([raw[4], raw[5]]),
            interval: raw[6],
            companion: None,
        })
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::from(self.address)
    }

    pub fn direction(&self) -> UsbDirection {
        if self.address & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match TransferType::try_from(self.attributes & 0x03) {
            Ok(kind) => kind,
            Err(_) => TransferType::Control,
        }
    }
}

/// One alternate setting of an interface, with its endpoints
#[derive(Debug, Default, Copy, Clone)]
pub struct AltSetting {
    pub descriptor: InterfaceDescriptor,
    endpoints: [EndpointDescriptor; MAX_ENDPOINTS],
    num_endpoints: usize,
}

impl AltSetting {
    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints[..self.num_endpoints]
    }

    pub fn find_endpoint(&self, address: u8) -> Option<&EndpointDescriptor> {
        self.endpoints().iter().find(|ep| ep.address == address)
    }

    fn push_endpoint(&mut self, endpoint: EndpointDescriptor) -> Result<()> {
        let slot = self
            .endpoints
            .get_mut(self.num_endpoints)
            .ok_or(Error::ResourceExhausted)?;
        *slot = endpoint;
        self.num_endpoints += 1;
        Ok(())
    }

    fn last_endpoint_mut(&mut self) -> Option<&mut EndpointDescriptor> {
        self.num_endpoints
            .checked_sub(1)
            .map(|last| &mut self.endpoints[last])
    }
}

/// An interface of a configuration: its alternate settings, the one
/// currently selected and the class driver that claimed it.
#[derive(Debug, Default, Copy, Clone)]
pub struct Interface {
    pub number: u8,
    alt_settings: [AltSetting; MAX_ALT_SETTINGS],
    num_alt_settings: usize,
    current: usize,
    pub(crate) driver: Option<DriverId>,
}

impl Interface {
    pub fn alt_settings(&self) -> &[AltSetting] {
        &self.alt_settings[..self.num_alt_settings]
    }

    /// The selected alternate setting
    pub fn current(&self) -> &AltSetting {
        &self.alt_settings[self.current]
    }

    pub fn driver(&self) -> Option<DriverId> {
        self.driver
    }

    pub(crate) fn position_of(&self, alternate_setting: u8) -> Option<usize> {
        self.alt_settings()
            .iter()
            .position(|alt| alt.descriptor.alternate_setting == alternate_setting)
    }

    pub(crate) fn current_index(&self) -> usize {
        self.current
    }

    pub(crate) fn select(&mut self, index: usize) {
        if index < self.num_alt_settings {
            self.current = index;
        }
    }
}

/// Parsed configuration descriptor
#[derive(Debug, Default, Copy, Clone)]
pub struct Configuration {
    pub value: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub total_length: u16,
    /// `bmAttributes` of an OTG descriptor, when present
    pub otg_attributes: Option<u8>,
    interfaces: [Interface; MAX_INTERFACES],
    num_interfaces: usize,
}

impl Configuration {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < CONFIGURATION_LEN || raw[1] != CONFIGURATION {
            return Err(Error::InvalidArgument);
        }
        let total_length = u16::from_le_bytes([raw[2], raw[3]]);
        if (total_length as usize) < CONFIGURATION_LEN {
            return Err(Error::InvalidArgument);
        }
        let raw = raw
            .get(..total_length as usize)
            .ok_or(Error::InvalidArgument)?;

        let mut cfg = Configuration {
            value: raw[5],
            attributes: raw[7],
            max_power: raw[8],
            total_length,
            ..Default::default()
        };

        // (interface index, alternate setting index) the next endpoints belong to
        let mut owner: Option<(usize, usize)> = None;
        let mut offset = raw[0] as usize;
        while offset < raw.len() {
            let len = raw[offset] as usize;
            if len < 2 || offset + len > raw.len() {
                return Err(Error::InvalidArgument);
            }
            let desc = &raw[offset..offset + len];
            match desc[1] {
                INTERFACE => {
                    owner = Some(cfg.push_alt_setting(InterfaceDescriptor::parse(desc)?)?);
                }
                ENDPOINT => {
                    let (intf, alt) = owner.ok_or(Error::InvalidArgument)?;
                    cfg.interfaces[intf].alt_settings[alt]
                        .push_endpoint(EndpointDescriptor::parse(desc)?)?;
                }
                SS_ENDPOINT_COMPANION => {
                    let (intf, alt) = owner.ok_or(Error::InvalidArgument)?;
                    let ep = cfg.interfaces[intf].alt_settings[alt]
                        .last_endpoint_mut()
                        .ok_or(Error::InvalidArgument)?;
                    ep.companion = Some(CompanionDescriptor::parse(desc)?);
                }
                OTG => cfg.otg_attributes = desc.get(2).copied(),
                _ => {} // class specific descriptors stay opaque
            }
            offset += len;
        }

        if cfg.num_interfaces != raw[4] as usize {
            return Err(Error::InvalidArgument);
        }
        Ok(cfg)
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces[..self.num_interfaces]
    }

    pub(crate) fn interfaces_mut(&mut self) -> &mut [Interface] {
        &mut self.interfaces[..self.num_interfaces]
    }

    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces().iter().find(|intf| intf.number == number)
    }

    pub(crate) fn interface_mut(&mut self, number: u8) -> Option<&mut Interface> {
        self.interfaces_mut()
            .iter_mut()
            .find(|intf| intf.number == number)
    }

    /// Finds an endpoint among the selected alternate settings, returning
    /// the number of the interface it belongs to
    pub fn find_endpoint(&self, address: u8) -> Option<(u8, EndpointDescriptor)> {
        self.interfaces().iter().find_map(|intf| {
            intf.current()
                .find_endpoint(address)
                .map(|ep| (intf.number, *ep))
        })
    }

    pub(crate) fn select_default_settings(&mut self) {
        for intf in self.interfaces_mut() {
            intf.select(0);
        }
    }

    fn push_alt_setting(&mut self, descriptor: InterfaceDescriptor) -> Result<(usize, usize)> {
        let index = match self
            .interfaces()
            .iter()
            .position(|intf| intf.number == descriptor.number)
        {
            Some(index) => index,
            None => {
                let intf = self
                    .interfaces
                    .get_mut(self.num_interfaces)
                    .ok_or(Error::ResourceExhausted)?;
                intf.number = descriptor.number;
                self.num_interfaces += 1;
                self.num_interfaces - 1
            }
        };

        let intf = &mut self.interfaces[index];
        let alt = intf
            .alt_settings
            .get_mut(intf.num_alt_settings)
            .ok_or(Error::ResourceExhausted)?;
        alt.descriptor = descriptor;
        intf.num_alt_settings += 1;
        Ok((index, intf.num_alt_settings - 1))
    }
}

/// A string descriptor for one language
#[derive(Debug, Copy, Clone)]
pub struct StringDescriptor<'a> {
    pub index: u8,
    /// `0` for the language table at index 0
    pub lang_id: u16,
    pub bytes: &'a [u8],
}

/// Descriptor set a device is attached with
#[derive(Debug, Copy, Clone)]
pub struct DeviceDescriptors<'a> {
    pub device: [u8; DEVICE_LEN],
    /// Present on high-speed capable devices
    pub qualifier: Option<[u8; QUALIFIER_LEN]>,
    pub full_speed: &'a [&'a [u8]],
    pub high_speed: &'a [&'a [u8]],
    pub super_speed: &'a [&'a [u8]],
    pub strings: &'a [StringDescriptor<'a>],
    pub bos: Option<&'a [u8]>,
}

impl<'a> DeviceDescriptors<'a> {
    /// Raw configuration descriptors in use at `speed`
    pub fn configurations(&self, speed: Speed) -> &'a [&'a [u8]] {
        match speed {
            Speed::Super if !self.super_speed.is_empty() => self.super_speed,
            Speed::High if !self.high_speed.is_empty() => self.high_speed,
            _ => self.full_speed,
        }
    }

    /// Raw configuration descriptors of the speed not in use
    pub fn other_speed_configurations(&self, speed: Speed) -> &'a [&'a [u8]] {
        match speed {
            Speed::High => self.full_speed,
            Speed::Full => self.high_speed,
            _ => &[],
        }
    }

    pub fn string(&self, index: u8, lang_id: u16) -> Option<&'a [u8]> {
        self.strings
            .iter()
            .find(|s| s.index == index && (index == 0 || s.lang_id == lang_id))
            .map(|s| s.bytes)
    }

    /// `bMaxPacketSize0`
    pub fn control_max_packet_size(&self) -> u16 {
        self.device[7] as u16
    }
}

/// 8-byte SETUP packet
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LEN {
            return Err(Error::InvalidArgument);
        }
        Ok(SetupPacket {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// High byte of `wValue` on descriptor requests
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    pub fn descriptor_index(&self) -> u8 {
        self.value as u8
    }
}
