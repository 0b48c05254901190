//! RNDIS messages
//!
//! Every message starts with its type and total length as little-endian
//! `u32`. Requests other than HALT and RESET carry a request id echoed in the
//! completion, whose type is the request type with bit 31 set.

use crate::error::{Error, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Size of the buffer completions are built in
pub const RESPONSE_LEN: usize = 256;

/// Largest RNDIS data message: an Ethernet frame behind a packet header
pub const MAX_TRANSFER_SIZE: usize = 1558;

pub(crate) const PACKET_HEADER_LEN: usize = 44;

/// Completion header length of QUERY, its information buffer follows
pub(crate) const QUERY_COMPLETE_LEN: usize = 24;

const INITIALIZE_COMPLETE_LEN: usize = 52;
const SHORT_COMPLETE_LEN: usize = 16;

const COMPLETION: u32 = 0x8000_0000;

const MAJOR_VERSION: u32 = 1;
const MINOR_VERSION: u32 = 0;
const DF_CONNECTIONLESS: u32 = 0x0000_0001;
const MEDIUM_802_3: u32 = 0x0000_0000;
const MAX_PACKETS_PER_MESSAGE: u32 = 1;

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageType {
    Packet = 0x01,
    Initialize = 0x02,
    Halt = 0x03,
    Query = 0x04,
    Set = 0x05,
    Reset = 0x06,
    IndicateStatus = 0x07,
    KeepAlive = 0x08,
}

impl MessageType {
    /// Type of the completion answering this message
    pub fn completion(self) -> u32 {
        u32::from(self) | COMPLETION
    }
}

/// NDIS status carried in completions
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NdisStatus {
    Success = 0x0000_0000,
    Failure = 0xC000_0001,
    NotSupported = 0xC000_00BB,
    InvalidData = 0xC001_0015,
}

/// Control message sent by the host with SEND_ENCAPSULATED_COMMAND
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request<'a> {
    Initialize {
        request_id: u32,
        major_version: u32,
        minor_version: u32,
        max_transfer_size: u32,
    },
    Halt,
    Query {
        request_id: u32,
        oid: u32,
        input: &'a [u8],
    },
    Set {
        request_id: u32,
        oid: u32,
        input: &'a [u8],
    },
    Reset,
    KeepAlive {
        request_id: u32,
    },
}

impl<'a> Request<'a> {
    /// # Errors
    /// * [Error::InvalidArgument] - truncated message or information buffer
    ///   out of the message
    /// * [Error::NotSupported] - not a control request
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        let kind = read(raw, 0)?;
        let length = read(raw, 4)? as usize;
        let raw = raw.get(..length).ok_or(Error::InvalidArgument)?;

        let kind = MessageType::try_from(kind).map_err(|_| Error::NotSupported)?;
        match kind {
            MessageType::Initialize => Ok(Request::Initialize {
                request_id: read(raw, 8)?,
                major_version: read(raw, 12)?,
                minor_version: read(raw, 16)?,
                max_transfer_size: read(raw, 20)?,
            }),
            MessageType::Halt => Ok(Request::Halt),
            MessageType::Query | MessageType::Set => {
                let request_id = read(raw, 8)?;
                let oid = read(raw, 12)?;
                let len = read(raw, 16)? as usize;
                let input = if len == 0 {
                    &[]
                } else {
                    // the offset counts from the request id
                    let start = 8usize.checked_add(read(raw, 20)? as usize);
                    slice(raw, start, len)?
                };
                if kind == MessageType::Query {
                    Ok(Request::Query {
                        request_id,
                        oid,
                        input,
                    })
                } else {
                    Ok(Request::Set {
                        request_id,
                        oid,
                        input,
                    })
                }
            }
            MessageType::Reset => Ok(Request::Reset),
            MessageType::KeepAlive => Ok(Request::KeepAlive {
                request_id: read(raw, 8)?,
            }),
            MessageType::Packet | MessageType::IndicateStatus => Err(Error::NotSupported),
        }
    }
}

fn read(raw: &[u8], offset: usize) -> Result<u32> {
    match raw.get(offset..offset + 4) {
        Some(bytes) => Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => Err(Error::InvalidArgument),
    }
}

fn write(buf: &mut [u8], offset: usize, value: u32) {
    if let Some(bytes) = buf.get_mut(offset..offset + 4) {
        bytes.copy_from_slice(&value.to_le_bytes());
    }
}

fn header(buf: &mut [u8], kind: MessageType, len: usize) {
    write(buf, 0, kind.completion());
    write(buf, 4, len as u32);
}

pub(crate) fn initialize_complete(
    buf: &mut [u8; RESPONSE_LEN],
    request_id: u32,
    status: NdisStatus,
) -> usize {
    header(buf, MessageType::Initialize, INITIALIZE_COMPLETE_LEN);
    write(buf, 8, request_id);
    write(buf, 12, status.into());
    write(buf, 16, MAJOR_VERSION);
    write(buf, 20, MINOR_VERSION);
    write(buf, 24, DF_CONNECTIONLESS);
    write(buf, 28, MEDIUM_802_3);
    write(buf, 32, MAX_PACKETS_PER_MESSAGE);
    write(buf, 36, MAX_TRANSFER_SIZE as u32);
    write(buf, 40, 0); // packet alignment factor
    write(buf, 44, 0); // AF list offset
    write(buf, 48, 0); // AF list size
    INITIALIZE_COMPLETE_LEN
}

/// Completes a QUERY whose `info_len` bytes of information already sit at
/// [QUERY_COMPLETE_LEN]
pub(crate) fn query_complete(
    buf: &mut [u8; RESPONSE_LEN],
    request_id: u32,
    status: NdisStatus,
    info_len: usize,
) -> usize {
    let info_len = info_len.min(RESPONSE_LEN - QUERY_COMPLETE_LEN);
    header(buf, MessageType::Query, QUERY_COMPLETE_LEN + info_len);
    write(buf, 8, request_id);
    write(buf, 12, status.into());
    write(buf, 16, info_len as u32);
    let offset = match info_len {
        0 => 0,
        _ => (QUERY_COMPLETE_LEN - 8) as u32,
    };
    write(buf, 20, offset);
    QUERY_COMPLETE_LEN + info_len
}

pub(crate) fn set_complete(buf: &mut [u8; RESPONSE_LEN], request_id: u32, status: NdisStatus) -> usize {
    header(buf, MessageType::Set, SHORT_COMPLETE_LEN);
    write(buf, 8, request_id);
    write(buf, 12, status.into());
    SHORT_COMPLETE_LEN
}

pub(crate) fn reset_complete(buf: &mut [u8; RESPONSE_LEN], status: NdisStatus) -> usize {
    header(buf, MessageType::Reset, SHORT_COMPLETE_LEN);
    write(buf, 8, status.into());
    write(buf, 12, 0); // addressing reset
    SHORT_COMPLETE_LEN
}

pub(crate) fn keepalive_complete(
    buf: &mut [u8; RESPONSE_LEN],
    request_id: u32,
    status: NdisStatus,
) -> usize {
    header(buf, MessageType::KeepAlive, SHORT_COMPLETE_LEN);
    write(buf, 8, request_id);
    write(buf, 12, status.into());
    SHORT_COMPLETE_LEN
}

/// Wraps a frame in a packet message. Returns the message length.
pub(crate) fn encode_packet(buf: &mut [u8; MAX_TRANSFER_SIZE], frame: &[u8]) -> Result<usize> {
    let len = PACKET_HEADER_LEN + frame.len();
    let payload = buf
        .get_mut(PACKET_HEADER_LEN..len)
        .ok_or(Error::InvalidArgument)?;
    payload.copy_from_slice(frame);

    buf[..PACKET_HEADER_LEN].fill(0);
    write(buf, 0, MessageType::Packet.into());
    write(buf, 4, len as u32);
    write(buf, 8, (PACKET_HEADER_LEN - 8) as u32); // data offset
    write(buf, 12, frame.len() as u32);
    Ok(len)
}

/// Frame carried by a packet message
pub(crate) fn decode_packet(raw: &[u8]) -> Result<&[u8]> {
    if read(raw, 0)? != u32::from(MessageType::Packet) {
        return Err(Error::InvalidArgument);
    }
    let start = 8usize.checked_add(read(raw, 8)? as usize);
    let len = read(raw, 12)? as usize;
    slice(raw, start, len)
}

/// `len` bytes at a host supplied offset
fn slice(raw: &[u8], start: Option<usize>, len: usize) -> Result<&[u8]> {
    let start = start.ok_or(Error::InvalidArgument)?;
    let end = start.checked_add(len).ok_or(Error::InvalidArgument)?;
    raw.get(start..end).ok_or(Error::InvalidArgument)
}
