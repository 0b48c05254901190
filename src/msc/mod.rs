//! USB Mass Storage Class, Bulk Only Transport
//!
//! [BulkOnly] claims mass storage interfaces speaking the Bulk Only
//! protocol and runs the CBW / data / CSW cycle on their bulk pipes. It does
//! not interpret command blocks: every command is handed to the
//! [MassStorageUser] registered for the interface subclass (SCSI, UFI, ...),
//! which answers it from a response buffer or moves the data itself through
//! [BulkOnly::read_write].
//!
//! Protocol errors never escalate. They stall a bulk pipe and are reported
//! in the CSW once the host clears the halt, as the Bulk Only Transport
//! requires.

use crate::driver::Event;
use crate::error::Result;
use crate::irp::Completion;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use usb_device::UsbDirection;

mod bbb;

pub use bbb::{BulkOnly, MAX_USERS, RESPONSE_LEN};

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;

/// Bulk Only Transport interface protocol
pub const TRANSPORT_BBB: u8 = 0x50;

/// SCSI transparent command set subclass
pub const SUBCLASS_SCSI: u8 = 0x06;

/// USB Floppy Interface subclass
pub const SUBCLASS_UFI: u8 = 0x04;

/// Class specific requests
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassRequest {
    GetMaxLun = 0xFE,
    BulkOnlyMassStorageReset = 0xFF,
}

/// Identity of a session (one claimed interface) within a [BulkOnly]
/// driver
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionId(pub(crate) u8);

/// The status of a Mass Storage command.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// Data stage direction announced by a CBW
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    Out,
    In,
    #[default]
    NotExpected,
}

impl DataDirection {
    fn matches(&self, direction: UsbDirection) -> bool {
        matches!(
            (self, direction),
            (DataDirection::In, UsbDirection::In) | (DataDirection::Out, UsbDirection::Out)
        )
    }
}

/// Command block of a CBW with the framing the client needs
///
/// The `bytes` field is a truncated slice
#[derive(Debug, Copy, Clone)]
pub struct CommandBlock<'a> {
    pub bytes: &'a [u8],
    pub lun: u8,
    pub tag: u32,
    /// `dCBWDataTransferLength`
    pub data_transfer_len: u32,
    pub direction: DataDirection,
}

/// Answer of a client to a new command
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandResponse {
    /// The command failed
    Stall,
    /// The command completed without data
    NoData,
    /// The first `len` bytes of the response buffer are the data stage
    /// (device to host), or `len` bytes are expected from the host
    Data { direction: UsbDirection, len: usize },
    /// The client moves the data itself with [BulkOnly::read_write]
    Pending { direction: UsbDirection },
}

/// Answer of a client to a finished data transfer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferStatus {
    /// More data follows through [BulkOnly::read_write]
    Pending,
    /// The command completed
    Complete,
    /// The command failed
    Failed,
}

/// BOT stage of a session
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// No CBW read queued
    #[default]
    Idle,
    /// Waiting for a CBW
    Command,
    Data,
    /// CSW queued
    Status,
}

/// Snapshot of a session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionState {
    pub interface: u8,
    pub stage: Stage,
    /// Bytes of the current command not transferred yet
    pub residue: u32,
    pub invalid_cbw: bool,
    pub phase_error: bool,
    pub cmd_failed: bool,
    pub user_attached: bool,
}

/// Upper client of the Bulk Only driver, typically a command set
/// implementation on top of a block device.
///
/// Callbacks run in the context of the stack entry point that triggered
/// them, possibly an interrupt.
pub trait MassStorageUser: Sync {
    /// Interface subclass the client implements
    fn subclass(&self) -> u8;

    /// A session was opened on an interface with the client's subclass
    fn connect(&self, session: SessionId) -> Result<()>;

    fn disconnect(&self, session: SessionId) -> Result<()>;

    /// A valid CBW arrived.
    ///
    /// Device to host data may be written into `response`; the answer tells
    /// how much of it makes up the data stage.
    fn new_command(
        &self,
        session: SessionId,
        command: &CommandBlock<'_>,
        response: &mut [u8],
    ) -> CommandResponse;

    /// A data transfer finished. `completion.data` holds the bytes received
    /// on host to device transfers.
    fn transfer_done(&self, session: SessionId, completion: &Completion<'_>) -> TransferStatus;

    /// The host issued a Bulk Only Mass Storage Reset
    fn reset(&self, session: SessionId) -> Result<()>;

    /// Index of the last logical unit, at most 15
    fn max_lun(&self, session: SessionId) -> u8;

    fn notify(&self, _session: SessionId, _event: Event) -> Result<()> {
        Ok(())
    }
}
