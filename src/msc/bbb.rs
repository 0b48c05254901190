//! Bulk Only Transport (BBB/BOT)

use super::{
    ClassRequest, CommandBlock, CommandResponse, CommandStatus, DataDirection, MassStorageUser,
    SessionId, SessionState, Stage, TransferStatus, CLASS_MASS_STORAGE, TRANSPORT_BBB,
};
use crate::descriptor::{InterfaceDescriptor, SetupPacket, TransferType};
use crate::device::DeviceHandle;
use crate::driver::{ClassDriver, Event};
use crate::error::{Error, Result};
use crate::fmt::{debug, info, trace, warn};
use crate::hal::{Capabilities, FunctionController};
use crate::irp::{Completion, Irp, Pipe};
use crate::stack::DeviceContext;
use core::cell::RefCell;
use critical_section::Mutex;
use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

/// Highest LUN index the protocol can address
const MAX_LUN: u8 = 0x0F;

/// Max number of clients registered with a driver
pub const MAX_USERS: usize = 4;

/// Size of the buffer a client answers commands in
pub const RESPONSE_LEN: usize = 256;

/// IRP contexts, telling the three bulk transfers of a command apart
const CONTEXT_COMMAND: u32 = 1;
const CONTEXT_DATA: u32 = 2;
const CONTEXT_STATUS: u32 = 3;

struct InvalidCbwError; // Inner transport-specific error

#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct CommandBlockWrapper {
    tag: u32,
    data_transfer_len: u32,
    direction: DataDirection,
    lun: u8,
    block_len: usize,
    block: [u8; 16],
}

impl CommandBlockWrapper {
    /// Parses a received CBW, checking that it is valid and meaningful.
    /// Spec. 6.2
    fn parse(raw: &[u8], max_lun: u8) -> core::result::Result<Self, InvalidCbwError> {
        const MIN_CB_LEN: u8 = 1;
        const MAX_CB_LEN: u8 = 16;

        if raw.len() != CBW_LEN || !raw.starts_with(&CBW_SIGNATURE_LE) {
            return Err(InvalidCbwError);
        }

        let value = &raw[4..]; // skip signature
        let lun = value[9];
        let block_len = value[10];
        if lun > max_lun.min(MAX_LUN) || !(MIN_CB_LEN..=MAX_CB_LEN).contains(&block_len) {
            return Err(InvalidCbwError);
        }

        let data_transfer_len = le_u32(&value[4..8]);
        let mut block = [0u8; 16];
        block.copy_from_slice(&value[11..]);

        Ok(CommandBlockWrapper {
            tag: le_u32(&value[..4]),
            data_transfer_len,
            direction: if data_transfer_len != 0 {
                if (value[8] & (1 << 7)) > 0 {
                    DataDirection::In
                } else {
                    DataDirection::Out
                }
            } else {
                DataDirection::NotExpected
            },
            lun,
            block_len: block_len as usize,
            block,
        })
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn build_csw(tag: u32, residue: u32, status: CommandStatus) -> [u8; CSW_LEN] {
    let mut csw = [0u8; CSW_LEN];
    csw[..4].copy_from_slice(CSW_SIGNATURE_LE.as_slice());
    csw[4..8].copy_from_slice(tag.to_le_bytes().as_slice());
    csw[8..12].copy_from_slice(residue.to_le_bytes().as_slice());
    csw[12] = status.into();
    csw
}

/// A client attached to a session, with the session generation it was
/// attached in
#[derive(Copy, Clone)]
struct Attachment<'a> {
    user: &'a dyn MassStorageUser,
    generation: u32,
}

#[derive(Default, Copy, Clone)]
struct Session<'a> {
    in_use: bool,
    /// Bumped on every connect. A client attached in an older generation
    /// missed the disconnect of the previous connection.
    generation: u32,
    device: Option<DeviceHandle>,
    interface: u8,
    in_pipe: Option<Pipe>,
    out_pipe: Option<Pipe>,
    user: Option<Attachment<'a>>,
    stage: Stage,
    cbw: CommandBlockWrapper,
    residue: u32,
    /// Length of the data IRP in flight
    data_len: u32,
    max_lun: u8,
    invalid_cbw: bool,
    phase_error: bool,
    cmd_failed: bool,
}

impl<'a> Session<'a> {
    fn owns(&self, device: DeviceHandle, interface: u8) -> bool {
        self.device == Some(device) && self.interface == interface
    }

    fn owns_endpoint(&self, device: DeviceHandle, address: u8) -> bool {
        self.device == Some(device)
            && [self.in_pipe, self.out_pipe]
                .iter()
                .flatten()
                .any(|pipe| u8::from(pipe.address()) == address)
    }

    fn pipes(&self) -> Result<(Pipe, Pipe)> {
        match (self.in_pipe, self.out_pipe) {
            (Some(in_pipe), Some(out_pipe)) => Ok((in_pipe, out_pipe)),
            _ => Err(Error::NotFound),
        }
    }

    /// Pipe of the data stage announced by the current CBW
    fn data_pipe(&self) -> Result<Pipe> {
        let (in_pipe, out_pipe) = self.pipes()?;
        Ok(match self.cbw.direction {
            DataDirection::In => in_pipe,
            _ => out_pipe,
        })
    }

    fn user(&self) -> Result<&'a dyn MassStorageUser> {
        self.user
            .map(|attachment| attachment.user)
            .ok_or(Error::NotFound)
    }

    /// Returns the slot to the pool, keeping its generation
    fn release(&mut self) {
        *self = Session {
            generation: self.generation,
            ..Default::default()
        };
    }

    fn state(&self) -> SessionState {
        SessionState {
            interface: self.interface,
            stage: self.stage,
            residue: self.residue,
            invalid_cbw: self.invalid_cbw,
            phase_error: self.phase_error,
            cmd_failed: self.cmd_failed,
            user_attached: self.user.is_some(),
        }
    }
}

/// Bulk Only Transport class driver
///
/// Serves up to `SESSIONS` interfaces at a time, across all devices of a
/// stack. Session bookkeeping happens in short critical sections; client
/// callbacks and endpoint services are called outside of them.
pub struct BulkOnly<'a, const SESSIONS: usize> {
    users: Mutex<RefCell<[Option<&'a dyn MassStorageUser>; MAX_USERS]>>,
    sessions: Mutex<RefCell<[Session<'a>; SESSIONS]>>,
}

impl<'a, const SESSIONS: usize> Default for BulkOnly<'a, SESSIONS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const SESSIONS: usize> BulkOnly<'a, SESSIONS> {
    pub fn new() -> Self {
        BulkOnly {
            users: Mutex::new(RefCell::new([None; MAX_USERS])),
            sessions: Mutex::new(RefCell::new([Session::default(); SESSIONS])),
        }
    }

    /// Registers a client for the interfaces with its subclass
    ///
    /// # Errors
    /// [Error::ResourceExhausted] if [MAX_USERS] clients are registered
    pub fn register_user(&self, user: &'a dyn MassStorageUser) -> Result<()> {
        critical_section::with(|cs| {
            let mut users = self.users.borrow_ref_mut(cs);
            let slot = users
                .iter_mut()
                .find(|slot| slot.is_none())
                .ok_or(Error::ResourceExhausted)?;
            *slot = Some(user);
            Ok(())
        })
    }

    /// Session serving an interface of a device
    pub fn session(&self, device: DeviceHandle, interface: u8) -> Option<SessionId> {
        critical_section::with(|cs| {
            self.sessions
                .borrow_ref(cs)
                .iter()
                .position(|s| s.in_use && s.owns(device, interface))
                .map(|index| SessionId(index as u8))
        })
    }

    /// Number of sessions in use for an interface of a device, never more
    /// than one
    pub fn session_count(&self, device: DeviceHandle, interface: u8) -> usize {
        critical_section::with(|cs| {
            self.sessions
                .borrow_ref(cs)
                .iter()
                .filter(|s| s.in_use && s.owns(device, interface))
                .count()
        })
    }

    pub fn state(&self, session: SessionId) -> Result<SessionState> {
        self.with_session(session, |s| s.state())
    }

    /// Data stage of the current command (`MS_RW`).
    ///
    /// Moves `len` bytes in the direction announced by the CBW: for device
    /// to host transfers `data` holds them, for host to device transfers
    /// they are delivered to [MassStorageUser::transfer_done].
    ///
    /// Asking for more than the host has left to transfer is a phase error
    /// and asking for nothing fails the command. Both stall the data pipe
    /// instead of queueing a transfer and are reported in the CSW once the
    /// host clears the halt.
    ///
    /// # Errors
    /// [Error::InvalidArgument] if the session is not in its data stage or
    /// `data` is shorter than `len` on a device to host transfer
    pub fn read_write<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        session: SessionId,
        len: u32,
        data: &[u8],
    ) -> Result<()> {
        let handle = ctx.handle();
        let (ready, residue, direction, pipe) = self.with_session(session, |s| {
            let ready = s.device == Some(handle)
                && s.stage == Stage::Data
                && !(s.invalid_cbw || s.phase_error || s.cmd_failed);
            (ready, s.residue, s.cbw.direction, s.data_pipe())
        })?;
        if !ready {
            return Err(Error::InvalidArgument);
        }
        let pipe = pipe?;

        // cases 7 and 13
        if len > residue {
            return self.phase_error(ctx, session, pipe);
        }
        // cases 4 and 9
        if len == 0 {
            return self.fail(ctx, session, pipe);
        }

        let direction = match direction {
            DataDirection::In => UsbDirection::In,
            _ => UsbDirection::Out,
        };
        if direction == UsbDirection::In && data.len() < len as usize {
            return Err(Error::InvalidArgument);
        }

        self.with_session(session, |s| {
            s.residue -= len;
            s.data_len = len;
        })?;
        trace!("usb: bbb: Data transfer: {}, residue: {}", len, residue - len);
        let irp = Irp::new(direction)
            .with_length(len)
            .with_context(CONTEXT_DATA);
        ctx.submit_irp(&pipe, &irp, data)
    }

    fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&mut Session<'a>) -> R) -> Result<R> {
        critical_section::with(|cs| {
            let mut sessions = self.sessions.borrow_ref_mut(cs);
            match sessions.get_mut(id.0 as usize) {
                Some(session) if session.in_use => Ok(f(session)),
                _ => Err(Error::NotFound),
            }
        })
    }

    fn users(&self) -> [Option<&'a dyn MassStorageUser>; MAX_USERS] {
        critical_section::with(|cs| *self.users.borrow_ref(cs))
    }

    /// Session owning an endpoint of the device
    fn session_of_endpoint(&self, device: DeviceHandle, address: u8) -> Option<SessionId> {
        critical_section::with(|cs| {
            self.sessions
                .borrow_ref(cs)
                .iter()
                .position(|s| s.in_use && s.owns_endpoint(device, address))
                .map(|index| SessionId(index as u8))
        })
    }

    /// Takes the slot already serving the interface, or a free one
    fn claim_slot(&self, device: DeviceHandle, interface: u8) -> Result<SessionId> {
        critical_section::with(|cs| {
            let mut sessions = self.sessions.borrow_ref_mut(cs);
            let index = sessions
                .iter()
                .position(|s| s.in_use && s.owns(device, interface))
                .or_else(|| sessions.iter().position(|s| !s.in_use))
                .ok_or(Error::ResourceExhausted)?;

            let session = &mut sessions[index];
            session.in_use = true;
            session.device = Some(device);
            session.interface = interface;
            session.generation = session.generation.wrapping_add(1);
            Ok(SessionId(index as u8))
        })
    }

    /// (Re)initializes a session on the selected setting of its interface:
    /// drops a client left from before, finds the bulk pipes, claims the
    /// interface, attaches a client and arms the command stage.
    fn open<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        interface: u8,
    ) -> Result<()> {
        let (previous, generation) = self.with_session(id, |s| (s.user.take(), s.generation))?;
        if let Some(previous) = previous {
            if previous.generation != generation {
                warn!("usb: bbb: Disconnect stale user of session {}", id);
            }
            if let Err(err) = previous.user.disconnect(id) {
                self.with_session(id, |s| s.user = Some(previous))?;
                return Err(err);
            }
        }

        let descriptor = ctx
            .interface(interface)
            .ok_or(Error::NotFound)?
            .current()
            .descriptor;
        let in_pipe = ctx
            .find_pipe(interface, TransferType::Bulk, UsbDirection::In)
            .ok_or(Error::InvalidArgument)?;
        let out_pipe = ctx
            .find_pipe(interface, TransferType::Bulk, UsbDirection::Out)
            .ok_or(Error::InvalidArgument)?;
        self.with_session(id, |s| {
            s.in_pipe = Some(in_pipe);
            s.out_pipe = Some(out_pipe);
            s.stage = Stage::Idle;
            s.cbw = Default::default();
            s.residue = 0;
            s.data_len = 0;
            s.invalid_cbw = false;
            s.phase_error = false;
            s.cmd_failed = false;
        })?;
        ctx.claim_interface(interface)?;

        let mut attached = None;
        for user in self.users().iter().flatten() {
            if user.subclass() == descriptor.subclass && user.connect(id).is_ok() {
                attached = Some(*user);
                break;
            }
        }
        let user = attached.ok_or(Error::NotFound)?;
        let max_lun = user.max_lun(id);
        self.with_session(id, |s| {
            s.user = Some(Attachment {
                user,
                generation: s.generation,
            });
            s.max_lun = max_lun;
        })?;
        info!("usb: bbb: Session {} on interface {}", id, interface);

        if let Err(err) = self.start(ctx, id, user) {
            // the client connected in this call, nothing else will detach it
            let _ = user.disconnect(id);
            self.with_session(id, |s| s.user = None)?;
            return Err(err);
        }
        Ok(())
    }

    fn start<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        user: &'a dyn MassStorageUser,
    ) -> Result<()> {
        if !ctx
            .capabilities()
            .contains(Capabilities::AUTO_SET_CONFIGURATION)
        {
            user.notify(id, Event::Connect)?;
        }
        self.arm_command(ctx, id)
    }

    /// Tears down every session of the device. A session whose client
    /// refuses to disconnect stays in use.
    fn close_device(&self, device: DeviceHandle) -> Result<()> {
        for index in 0..SESSIONS {
            let id = SessionId(index as u8);
            let Ok((true, user)) = self.with_session(id, |s| (s.device == Some(device), s.user))
            else {
                continue;
            };
            if let Some(attachment) = user {
                attachment.user.disconnect(id)?;
            }
            self.with_session(id, |s| s.release())?;
            info!("usb: bbb: Session {} released", id);
        }
        Ok(())
    }

    /// Queues the read of the next CBW
    fn arm_command<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
    ) -> Result<()> {
        let (_, out_pipe) = self.with_session(id, |s| {
            s.stage = Stage::Command;
            s.pipes()
        })??;
        let irp = Irp::new(UsbDirection::Out)
            .with_length(CBW_LEN as u32)
            .with_context(CONTEXT_COMMAND);
        ctx.submit_irp(&out_pipe, &irp, &[])
    }

    /// Re-arms the command stage and sends the CSW of the current command
    fn send_status<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        status: CommandStatus,
    ) -> Result<()> {
        self.arm_command(ctx, id)?;
        let (csw, pipes) = self.with_session(id, |s| {
            s.stage = Stage::Status;
            (build_csw(s.cbw.tag, s.residue, status), s.pipes())
        })?;
        let (in_pipe, _) = pipes?;
        info!("usb: bbb: Send CSW: {}", status);
        let irp = Irp::new(UsbDirection::In)
            .with_length(CSW_LEN as u32)
            .with_context(CONTEXT_STATUS);
        ctx.submit_irp(&in_pipe, &irp, &csw)
    }

    /// Fails the command, stalling its data pipe
    fn fail<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        pipe: Pipe,
    ) -> Result<()> {
        self.with_session(id, |s| s.cmd_failed = true)?;
        info!("usb: bbb: Command failed, stall ep: {}", u8::from(pipe.address()));
        ctx.stall_endpoint(&pipe)
    }

    fn phase_error<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        pipe: Pipe,
    ) -> Result<()> {
        self.with_session(id, |s| s.phase_error = true)?;
        info!("usb: bbb: Phase error, stall ep: {}", u8::from(pipe.address()));
        ctx.stall_endpoint(&pipe)
    }

    fn stall_pipes<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
    ) -> Result<()> {
        let (in_pipe, out_pipe) = self.with_session(id, |s| s.pipes())??;
        info!("usb: bbb: Stall IN and OUT eps");
        ctx.stall_endpoint(&in_pipe)?;
        ctx.stall_endpoint(&out_pipe)
    }

    fn command_received<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        raw: &[u8],
    ) -> Result<()> {
        let max_lun = self.with_session(id, |s| s.max_lun)?;
        match CommandBlockWrapper::parse(raw, max_lun) {
            Ok(cbw) => {
                info!("usb: bbb: Recv CBW: {}", cbw);
                self.process_cbw(ctx, id, cbw)
            }
            Err(_) => {
                // Spec. 6.6.1
                warn!("usb: bbb: Invalid CBW, len: {}", raw.len());
                self.with_session(id, |s| {
                    s.invalid_cbw = true;
                    s.stage = Stage::Idle;
                })?;
                self.stall_pipes(ctx, id)
            }
        }
    }

    /// Hands a valid CBW to the client and acts on its answer following
    /// the thirteen cases of Bulk-Only Transport, section 6.7
    fn process_cbw<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        cbw: CommandBlockWrapper,
    ) -> Result<()> {
        let (user, data_pipe) = self.with_session(id, |s| {
            s.cbw = cbw;
            s.residue = cbw.data_transfer_len;
            s.data_len = 0;
            (s.user(), s.data_pipe())
        })?;
        let (user, data_pipe) = (user?, data_pipe?);

        let command = CommandBlock {
            bytes: &cbw.block[..cbw.block_len],
            lun: cbw.lun,
            tag: cbw.tag,
            data_transfer_len: cbw.data_transfer_len,
            direction: cbw.direction,
        };
        let mut response = [0u8; RESPONSE_LEN];
        let answer = user.new_command(id, &command, &mut response);
        debug!("usb: bbb: Command answer: {}", answer);
        let expected = cbw.data_transfer_len;

        // (direction, bytes staged in the response) of the data the client has
        let data = match answer {
            CommandResponse::Stall if expected != 0 => return self.fail(ctx, id, data_pipe),
            CommandResponse::Stall => return self.send_status(ctx, id, CommandStatus::Failed),
            CommandResponse::NoData | CommandResponse::Data { len: 0, .. } => None,
            CommandResponse::Data { direction, len } => Some((direction, Some(len))),
            CommandResponse::Pending { direction } => Some((direction, None)),
        };

        // cases 1 to 3
        if expected == 0 {
            let status = match data {
                Some(_) => CommandStatus::PhaseError,
                None => CommandStatus::Passed,
            };
            return self.send_status(ctx, id, status);
        }

        let Some((direction, len)) = data else {
            // cases 4 and 9
            return self.fail(ctx, id, data_pipe);
        };
        if !cbw.direction.matches(direction) {
            // cases 8 and 10
            return self.phase_error(ctx, id, data_pipe);
        }

        self.with_session(id, |s| s.stage = Stage::Data)?;
        match (direction, len) {
            (_, None) => Ok(()),
            (UsbDirection::In, Some(len)) if len > RESPONSE_LEN => {
                warn!("usb: bbb: Response too long: {}", len);
                self.fail(ctx, id, data_pipe)
            }
            (UsbDirection::In, Some(len)) => {
                self.read_write(ctx, id, len as u32, &response[..len])
            }
            (UsbDirection::Out, Some(len)) => {
                let len = u32::try_from(len).unwrap_or(u32::MAX);
                self.read_write(ctx, id, len, &[])
            }
        }
    }

    fn data_done<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        completion: &Completion<'_>,
    ) -> Result<()> {
        let (stage, user, data_pipe) = self.with_session(id, |s| {
            if s.stage == Stage::Data {
                // a short transfer gives back what was not moved
                s.residue += s.data_len.saturating_sub(completion.actual_length);
                s.data_len = 0;
            }
            (s.stage, s.user(), s.data_pipe())
        })?;
        if stage != Stage::Data {
            return Ok(());
        }
        let (user, data_pipe) = (user?, data_pipe?);

        let status = user.transfer_done(id, completion);
        let residue = self.with_session(id, |s| s.residue)?;
        trace!("usb: bbb: Data done: {}, residue: {}", status, residue);
        match status {
            TransferStatus::Pending => Ok(()),
            TransferStatus::Complete if residue == 0 => {
                self.send_status(ctx, id, CommandStatus::Passed)
            }
            TransferStatus::Failed if residue == 0 => {
                self.send_status(ctx, id, CommandStatus::Failed)
            }
            // cases 5 and 11
            _ => self.fail(ctx, id, data_pipe),
        }
    }

    /// The host cleared the halt of one of the session's pipes
    fn clear_halt<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
    ) -> Result<()> {
        let (invalid_cbw, status) = self.with_session(id, |s| {
            let status = if s.invalid_cbw {
                None
            } else if s.phase_error {
                Some(CommandStatus::PhaseError)
            } else if s.cmd_failed {
                Some(CommandStatus::Failed)
            } else {
                None
            };
            if status.is_some() {
                s.phase_error = false;
                s.cmd_failed = false;
            }
            (s.invalid_cbw, status)
        })?;

        if invalid_cbw {
            // only a reset recovers from an invalid CBW
            return self.stall_pipes(ctx, id);
        }
        match status {
            Some(status) => self.send_status(ctx, id, status),
            None => Ok(()),
        }
    }

    /// Bulk Only Mass Storage Reset. Spec. 3.1
    fn reset_recovery<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
    ) -> Result<()> {
        info!("usb: bbb: Recv reset");
        let (user, pipes) = self.with_session(id, |s| {
            s.invalid_cbw = false;
            (s.user(), s.pipes())
        })?;
        let (user, (in_pipe, out_pipe)) = (user?, pipes?);

        for pipe in [in_pipe, out_pipe] {
            if ctx.is_endpoint_stalled(&pipe)? {
                ctx.unstall_endpoint(&pipe)?;
            }
        }
        ctx.flush_pipe(&in_pipe)?;
        ctx.flush_pipe(&out_pipe)?;

        self.with_session(id, |s| {
            s.phase_error = false;
            s.cmd_failed = false;
            s.cbw = Default::default();
            s.residue = 0;
            s.data_len = 0;
            s.stage = Stage::Idle;
        })?;
        user.reset(id)?;
        self.arm_command(ctx, id)
    }
}

impl<'a, H, const SESSIONS: usize> ClassDriver<H> for BulkOnly<'a, SESSIONS>
where
    H: FunctionController,
{
    fn examine_interface(&self, descriptor: &InterfaceDescriptor) -> bool {
        descriptor.class == CLASS_MASS_STORAGE
            && descriptor.protocol == TRANSPORT_BBB
            && self
                .users()
                .iter()
                .flatten()
                .any(|user| user.subclass() == descriptor.subclass)
    }

    /// Opens a session on the interface. A session left over for the same
    /// interface (a disconnect the controller never reported) is reused.
    fn connect(&self, ctx: &mut DeviceContext<'_, H>, interface: u8) -> Result<()> {
        let id = self.claim_slot(ctx.handle(), interface)?;
        if let Err(err) = self.open(ctx, id, interface) {
            warn!("usb: bbb: Connect failed: {}", err);
            self.with_session(id, |s| {
                if s.user.is_none() {
                    s.release();
                }
            })?;
            let _ = ctx.release_interface(interface);
            return Err(err);
        }
        Ok(())
    }

    fn disconnect(&self, ctx: &mut DeviceContext<'_, H>) -> Result<()> {
        self.close_device(ctx.handle())
    }

    fn set_interface(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        interface: u8,
        _alternate_setting: u8,
    ) -> Result<()> {
        let id = self
            .session(ctx.handle(), interface)
            .ok_or(Error::InvalidArgument)?;
        self.open(ctx, id, interface)
    }

    fn notify(&self, ctx: &mut DeviceContext<'_, H>, event: Event) -> Result<()> {
        let handle = ctx.handle();
        for index in 0..SESSIONS {
            let id = SessionId(index as u8);
            let Ok((true, Some(attachment), owns_halted)) = self.with_session(id, |s| {
                let owns_halted = match event {
                    Event::ClearHaltEndpoint(ep) => s.owns_endpoint(handle, ep),
                    _ => false,
                };
                (s.device == Some(handle), s.user, owns_halted)
            }) else {
                continue;
            };

            attachment.user.notify(id, event)?;
            if owns_halted {
                self.clear_halt(ctx, id)?;
            }
        }

        // controllers answering SET_CONFIGURATION by themselves never
        // connect the interface again; their sessions outlive the disconnect
        let auto_configured = ctx
            .capabilities()
            .contains(Capabilities::AUTO_SET_CONFIGURATION);
        if event == Event::Disconnect && !auto_configured {
            self.close_device(handle)?;
        }
        Ok(())
    }

    fn class_specific(&self, ctx: &mut DeviceContext<'_, H>, setup: &SetupPacket) -> Result<()> {
        // not interested in this request
        if !(setup.kind() == RequestType::Class && setup.recipient() == Recipient::Interface) {
            return Err(Error::InvalidArgument);
        }
        let request = ClassRequest::try_from(setup.request).map_err(|_| Error::InvalidArgument)?;
        let expected_len = match request {
            ClassRequest::BulkOnlyMassStorageReset => 0,
            ClassRequest::GetMaxLun => 1,
        };
        if setup.length != expected_len || setup.value != 0 || setup.index > 0xFF {
            return Err(Error::InvalidArgument);
        }

        let id = self
            .session(ctx.handle(), setup.index as u8)
            .ok_or(Error::InvalidArgument)?;
        let user = self
            .with_session(id, |s| s.user())?
            .map_err(|_| Error::InvalidArgument)?;
        info!("usb: bbb: Recv class request: {}", request);

        match request {
            // Spec. section 3.1
            ClassRequest::BulkOnlyMassStorageReset => self.reset_recovery(ctx, id),
            // Spec. section 3.2
            ClassRequest::GetMaxLun => {
                let max_lun = user.max_lun(id);
                if max_lun > MAX_LUN {
                    return Err(Error::InvalidArgument);
                }
                self.with_session(id, |s| s.max_lun = max_lun)?;
                let pipe = ctx.control_pipe();
                let irp = Irp::new(UsbDirection::In).with_length(1);
                ctx.submit_irp(&pipe, &irp, &[max_lun])
            }
        }
    }

    fn transfer_complete(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        pipe: &Pipe,
        completion: &Completion<'_>,
    ) -> Result<()> {
        // GET_MAX_LUN reply
        if pipe.is_control() {
            return Ok(());
        }
        let id = self
            .session_of_endpoint(ctx.handle(), u8::from(pipe.address()))
            .ok_or(Error::InvalidArgument)?;
        if let Err(err) = completion.status {
            warn!("usb: bbb: Transfer failed: {}", err);
            return Ok(());
        }

        match completion.context {
            CONTEXT_COMMAND => self.command_received(ctx, id, completion.data),
            CONTEXT_DATA => self.data_done(ctx, id, completion),
            CONTEXT_STATUS => {
                self.with_session(id, |s| {
                    if s.stage == Stage::Status {
                        s.stage = Stage::Command;
                    }
                })?;
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        }
    }
}
