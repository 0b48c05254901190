use super::{DummyController, TestStack, BULK_IN, BULK_OUT};
use std::collections::VecDeque;
use std::sync::Mutex;
use usb_device::endpoint::EndpointAddress;
use usbf_stack::device::DeviceHandle;
use usbf_stack::driver::Event;
use usbf_stack::irp::Completion;
use usbf_stack::msc::{
    CommandBlock, CommandResponse, MassStorageUser, SessionId, TransferStatus, SUBCLASS_SCSI,
};

const MAX_CB_LEN: u8 = 16;
pub const CSW_LEN: usize = 13;

#[derive(Debug, Eq, PartialEq)]
pub enum CommandStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

#[allow(dead_code)]
pub enum DataDirection {
    Out,
    In,
    NotExpected,
}

pub struct Cbw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    pub block: Vec<u8>,
}

impl Cbw {
    pub fn new(data_transfer_len: u32, direction: DataDirection, block: &[u8]) -> Self {
        Self {
            tag: 0x1234_5678,
            data_transfer_len,
            direction,
            lun: 0,
            block: block.to_vec(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();

        assert!(self.block.len() <= MAX_CB_LEN as usize);

        let mut bytes = vec![];
        bytes.extend_from_slice(CBW_SIGNATURE_LE.as_slice()); // signature
        bytes.extend_from_slice(self.tag.to_le_bytes().as_slice()); // tag
        bytes.extend_from_slice(self.data_transfer_len.to_le_bytes().as_slice()); // data transfer len

        let direction = match self.direction {
            DataDirection::In => 1_u8 << 7,
            DataDirection::Out | DataDirection::NotExpected => 0u8,
        };
        bytes.push(direction); // direction
        bytes.push(self.lun); // lun
        bytes.push(self.block.len() as u8); // block size

        let mut block = vec![0u8; MAX_CB_LEN as usize];
        block.as_mut_slice()[..self.block.len()].copy_from_slice(self.block.as_slice());
        bytes.extend_from_slice(block.as_slice()); // block

        bytes
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(CSW_LEN, bytes.len());
        assert_eq!(b"USBS", &bytes[..4]);

        let tag = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let data_transfer_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let status = match bytes[12] {
            0x00 => CommandStatus::Passed,
            0x01 => CommandStatus::Failed,
            0x02 => CommandStatus::PhaseError,
            _ => panic!("invalid status code"),
        };

        Self {
            tag,
            data_transfer_len,
            status,
        }
    }
}

/// Delivers raw bytes to the queued CBW read, as if written by the host
pub fn write_command(
    stack: &mut TestStack,
    controller: &DummyController,
    handle: DeviceHandle,
    bytes: &[u8],
) -> usbf_stack::Result<()> {
    let read = controller
        .take_submission(BULK_OUT)
        .expect("no CBW read queued");
    assert_eq!(31, read.irp.length());
    stack.transfer_complete(
        handle,
        EndpointAddress::from(BULK_OUT),
        Completion::received(&read.irp, bytes),
    )
}

pub fn write_cbw(stack: &mut TestStack, controller: &DummyController, handle: DeviceHandle, cbw: Cbw) {
    write_command(stack, controller, handle, &cbw.into_bytes()).unwrap();
}

/// Completes the oldest bulk IN transfer, returning its bytes
pub fn read_in(stack: &mut TestStack, controller: &DummyController, handle: DeviceHandle) -> Vec<u8> {
    let write = controller
        .take_submission(BULK_IN)
        .expect("no IN transfer queued");
    stack
        .transfer_complete(
            handle,
            EndpointAddress::from(BULK_IN),
            Completion::sent(&write.irp, write.irp.length()),
        )
        .unwrap();
    write.data
}

/// Completes the queued data read with `data`, as if written by the host
pub fn write_data(
    stack: &mut TestStack,
    controller: &DummyController,
    handle: DeviceHandle,
    data: &[u8],
) {
    let read = controller
        .take_submission(BULK_OUT)
        .expect("no data read queued");
    assert_ne!(31, read.irp.length(), "CBW read instead of data read");
    stack
        .transfer_complete(
            handle,
            EndpointAddress::from(BULK_OUT),
            Completion::received(&read.irp, data),
        )
        .unwrap();
}

pub fn read_csw(stack: &mut TestStack, controller: &DummyController, handle: DeviceHandle) -> Csw {
    Csw::from_bytes(&read_in(stack, controller, handle))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Call {
    Connect(SessionId),
    Disconnect(SessionId),
    Command { lun: u8, tag: u32, len: u32 },
    TransferDone { actual: u32, data: Vec<u8> },
    Reset(SessionId),
    Notify(Event),
}

/// Client answering commands from a script
pub struct ScriptedUser {
    pub subclass: u8,
    pub max_lun: u8,
    /// Byte the response buffer is filled with
    pub fill: u8,
    pub answers: Mutex<VecDeque<CommandResponse>>,
    pub transfers: Mutex<VecDeque<TransferStatus>>,
    pub refuse_disconnect: Mutex<bool>,
    /// Fail every notification after recording it
    pub refuse_notify: Mutex<bool>,
    pub calls: Mutex<Vec<Call>>,
}

impl ScriptedUser {
    pub fn scsi() -> Self {
        Self::new(SUBCLASS_SCSI)
    }

    pub fn new(subclass: u8) -> Self {
        Self {
            subclass,
            max_lun: 0,
            fill: 0xA5,
            answers: Mutex::new(VecDeque::new()),
            transfers: Mutex::new(VecDeque::new()),
            refuse_disconnect: Mutex::new(false),
            refuse_notify: Mutex::new(false),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn answer(&self, response: CommandResponse) {
        self.answers.lock().unwrap().push_back(response);
    }

    pub fn finish_transfer(&self, status: TransferStatus) {
        self.transfers.lock().unwrap().push_back(status);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl MassStorageUser for ScriptedUser {
    fn subclass(&self) -> u8 {
        self.subclass
    }

    fn connect(&self, session: SessionId) -> usbf_stack::Result<()> {
        self.record(Call::Connect(session));
        Ok(())
    }

    fn disconnect(&self, session: SessionId) -> usbf_stack::Result<()> {
        if *self.refuse_disconnect.lock().unwrap() {
            return Err(usbf_stack::Error::InvalidArgument);
        }
        self.record(Call::Disconnect(session));
        Ok(())
    }

    fn new_command(
        &self,
        _session: SessionId,
        command: &CommandBlock<'_>,
        response: &mut [u8],
    ) -> CommandResponse {
        self.record(Call::Command {
            lun: command.lun,
            tag: command.tag,
            len: command.data_transfer_len,
        });
        response.fill(self.fill);
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CommandResponse::NoData)
    }

    fn transfer_done(&self, _session: SessionId, completion: &Completion<'_>) -> TransferStatus {
        self.record(Call::TransferDone {
            actual: completion.actual_length,
            data: completion.data.to_vec(),
        });
        self.transfers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransferStatus::Complete)
    }

    fn reset(&self, session: SessionId) -> usbf_stack::Result<()> {
        self.record(Call::Reset(session));
        Ok(())
    }

    fn max_lun(&self, _session: SessionId) -> u8 {
        self.max_lun
    }

    fn notify(&self, _session: SessionId, event: Event) -> usbf_stack::Result<()> {
        self.record(Call::Notify(event));
        if *self.refuse_notify.lock().unwrap() {
            return Err(usbf_stack::Error::NotSupported);
        }
        Ok(())
    }
}
