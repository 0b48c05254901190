//! Remote NDIS function
//!
//! [Rndis] claims a CDC communication interface with the vendor specific
//! RNDIS protocol together with the data interface that follows it. Control
//! messages travel as encapsulated commands on the control pipe: every
//! request except HALT is answered by queueing a completion and signalling
//! RESPONSE_AVAILABLE on the interrupt pipe, the host then fetches the
//! completion with GET_ENCAPSULATED_RESPONSE. Network frames travel as
//! packet messages on the bulk pipes of the data interface.
//!
//! OIDs are not interpreted here; QUERY and SET are handed to the
//! [RndisUser].

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
use num_enum::{IntoPrimitive, TryFromPrimitive};
use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

mod message;

pub use message::{MessageType, NdisStatus, Request, MAX_TRANSFER_SIZE, RESPONSE_LEN};

/// Communications Device Class code
pub const CLASS_COMMUNICATIONS: u8 = 0x02;

/// Abstract Control Model subclass
pub const SUBCLASS_ACM: u8 = 0x02;

/// Vendor specific protocol, RNDIS over ACM
pub const PROTOCOL_RNDIS: u8 = 0xFF;

/// CDC data interface class code
pub const CLASS_DATA: u8 = 0x0A;

const RESPONSE_AVAILABLE: [u8; 8] = [0x01, 0, 0, 0, 0, 0, 0, 0];

// IRP contexts
const CONTEXT_COMMAND: u32 = 1;
const CONTEXT_RESPONSE: u32 = 2;
const CONTEXT_NOTIFICATION: u32 = 3;
const CONTEXT_DATA: u32 = 4;

/// CDC class requests carrying RNDIS control messages
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassRequest {
    SendEncapsulatedCommand = 0x00,
    GetEncapsulatedResponse = 0x01,
}

/// Identity of a session (one communication interface) within an [Rndis]
/// driver
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionId(pub(crate) u8);

/// RNDIS protocol state of a session
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RndisState {
    #[default]
    Uninitialized,
    /// INITIALIZE completed, data may flow
    Initialized,
}

/// Network side of the RNDIS driver
pub trait RndisUser: Sync {
    fn connect(&self, session: SessionId) -> Result<()>;

    fn disconnect(&self, session: SessionId) -> Result<()>;

    /// Answers a QUERY, writing the information of `oid` into `info`.
    /// Returns the information length.
    fn query(
        &self,
        session: SessionId,
        oid: u32,
        input: &[u8],
        info: &mut [u8],
    ) -> core::result::Result<usize, NdisStatus>;

    fn set(&self, session: SessionId, oid: u32, value: &[u8]) -> NdisStatus;

    /// The host sent RESET
    fn reset(&self, _session: SessionId) {}

    /// The host sent HALT, the session is uninitialized
    fn halt(&self, _session: SessionId) {}

    /// Ethernet frame received from the host
    fn receive(&self, session: SessionId, frame: &[u8]);

    /// A frame queued with [Rndis::send] went out
    fn sent(&self, _session: SessionId, _completion: &Completion<'_>) {}

    fn notify(&self, _session: SessionId, _event: Event) -> Result<()> {
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct Session {
    in_use: bool,
    device: Option<DeviceHandle>,
    interface: u8,
    data_interface: Option<u8>,
    notify_pipe: Option<Pipe>,
    in_pipe: Option<Pipe>,
    out_pipe: Option<Pipe>,
    state: RndisState,
    /// SEND_ENCAPSULATED_COMMAND data stage queued
    command_pending: bool,
    max_transfer_size: u32,
    response: [u8; RESPONSE_LEN],
    response_len: usize,
}

impl Session {
    const EMPTY: Session = Session {
        in_use: false,
        device: None,
        interface: 0,
        data_interface: None,
        notify_pipe: None,
        in_pipe: None,
        out_pipe: None,
        state: RndisState::Uninitialized,
        command_pending: false,
        max_transfer_size: 0,
        response: [0; RESPONSE_LEN],
        response_len: 0,
    };

    fn owns_interface(&self, device: DeviceHandle, interface: u8) -> bool {
        self.device == Some(device)
            && (self.interface == interface || self.data_interface == Some(interface))
    }

    fn owns_endpoint(&self, device: DeviceHandle, address: u8) -> bool {
        self.device == Some(device)
            && [self.notify_pipe, self.in_pipe, self.out_pipe]
                .iter()
                .flatten()
                .any(|pipe| u8::from(pipe.address()) == address)
    }
}

/// RNDIS class driver
pub struct Rndis<'a, const SESSIONS: usize> {
    user: &'a dyn RndisUser,
    sessions: Mutex<RefCell<[Session; SESSIONS]>>,
}

impl<'a, const SESSIONS: usize> Rndis<'a, SESSIONS> {
    pub fn new(user: &'a dyn RndisUser) -> Self {
        Rndis {
            user,
            sessions: Mutex::new(RefCell::new([Session::EMPTY; SESSIONS])),
        }
    }

    /// Session serving a communication or data interface of a device
    pub fn session(&self, device: DeviceHandle, interface: u8) -> Option<SessionId> {
        critical_section::with(|cs| {
            self.sessions
                .borrow_ref(cs)
                .iter()
                .position(|s| s.in_use && s.owns_interface(device, interface))
                .map(|index| SessionId(index as u8))
        })
    }

    pub fn state(&self, session: SessionId) -> Result<RndisState> {
        self.with_session(session, |s| s.state)
    }

    /// Sends an Ethernet frame to the host
    ///
    /// # Errors
    /// * [Error::InvalidArgument] - the session is not initialized, belongs
    ///   to another device or the frame does not fit a data message
    /// * [Error::NotFound] - no such session or no bulk IN pipe
    pub fn send<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        session: SessionId,
        frame: &[u8],
    ) -> Result<()> {
        let handle = ctx.handle();
        let (ready, in_pipe, max_transfer_size) = self.with_session(session, |s| {
            (
                s.device == Some(handle) && s.state == RndisState::Initialized,
                s.in_pipe,
                s.max_transfer_size as usize,
            )
        })?;
        if !ready {
            return Err(Error::InvalidArgument);
        }
        let in_pipe = in_pipe.ok_or(Error::NotFound)?;

        let mut buf = [0u8; MAX_TRANSFER_SIZE];
        let len = message::encode_packet(&mut buf, frame)?;
        // zero means the host put no limit
        if max_transfer_size != 0 && len > max_transfer_size {
            return Err(Error::InvalidArgument);
        }
        let mps = usize::from(in_pipe.max_packet_size());
        let irp = Irp::new(UsbDirection::In)
            .with_length(len as u32)
            .with_context(CONTEXT_DATA)
            .with_zero_packet(mps != 0 && len % mps == 0);
        trace!("usb: rndis: Send frame: {}", frame.len());
        ctx.submit_irp(&in_pipe, &irp, &buf[..len])
    }

    fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        critical_section::with(|cs| {
            let mut sessions = self.sessions.borrow_ref_mut(cs);
            match sessions.get_mut(id.0 as usize) {
                Some(session) if session.in_use => Ok(f(session)),
                _ => Err(Error::NotFound),
            }
        })
    }

    fn find(&self, f: impl Fn(&Session) -> bool) -> Option<SessionId> {
        critical_section::with(|cs| {
            self.sessions
                .borrow_ref(cs)
                .iter()
                .position(|s| s.in_use && f(s))
                .map(|index| SessionId(index as u8))
        })
    }

    fn claim_slot(&self, device: DeviceHandle, interface: u8) -> Result<SessionId> {
        critical_section::with(|cs| {
            let mut sessions = self.sessions.borrow_ref_mut(cs);
            let index = sessions
                .iter()
                .position(|s| s.in_use && s.device == Some(device) && s.interface == interface)
                .or_else(|| sessions.iter().position(|s| !s.in_use))
                .ok_or(Error::ResourceExhausted)?;

            sessions[index] = Session {
                in_use: true,
                device: Some(device),
                interface,
                ..Session::EMPTY
            };
            Ok(SessionId(index as u8))
        })
    }

    /// Looks up the pipes of the selected settings
    fn find_pipes<H: FunctionController>(
        &self,
        ctx: &DeviceContext<'_, H>,
        id: SessionId,
    ) -> Result<()> {
        let (interface, data_interface) = self.with_session(id, |s| (s.interface, s.data_interface))?;
        let notify_pipe = ctx.find_pipe(interface, TransferType::Interrupt, UsbDirection::In);
        let (in_pipe, out_pipe) = match data_interface {
            Some(data) => (
                ctx.find_pipe(data, TransferType::Bulk, UsbDirection::In),
                ctx.find_pipe(data, TransferType::Bulk, UsbDirection::Out),
            ),
            None => (None, None),
        };
        self.with_session(id, |s| {
            s.notify_pipe = notify_pipe;
            s.in_pipe = in_pipe;
            s.out_pipe = out_pipe;
        })
    }

    fn open<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        interface: u8,
    ) -> Result<()> {
        ctx.claim_interface(interface)?;

        // the data interface follows the communication interface
        let data = interface.wrapping_add(1);
        let is_data = ctx
            .interface(data)
            .map_or(false, |intf| intf.current().descriptor.class == CLASS_DATA);
        if is_data && !ctx.is_claimed(data) {
            ctx.claim_interface(data)?;
            self.with_session(id, |s| s.data_interface = Some(data))?;
        }

        self.find_pipes(ctx, id)?;
        self.user.connect(id)?;
        info!("usb: rndis: Session {} on interface {}", id, interface);
        Ok(())
    }

    fn close_device(&self, device: DeviceHandle) -> Result<()> {
        for index in 0..SESSIONS {
            let id = SessionId(index as u8);
            let Ok(true) = self.with_session(id, |s| s.device == Some(device)) else {
                continue;
            };
            self.user.disconnect(id)?;
            self.with_session(id, |s| *s = Session::EMPTY)?;
            info!("usb: rndis: Session {} released", id);
        }
        Ok(())
    }

    /// Queues the read of the next data message
    fn arm_receive<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
    ) -> Result<()> {
        let Some(out_pipe) = self.with_session(id, |s| s.out_pipe)? else {
            return Ok(());
        };
        let irp = Irp::new(UsbDirection::Out)
            .with_length(MAX_TRANSFER_SIZE as u32)
            .with_context(CONTEXT_DATA);
        ctx.submit_irp(&out_pipe, &irp, &[])
    }

    /// Decodes an encapsulated command, queues its completion and tells the
    /// host about it
    fn process_message<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        raw: &[u8],
    ) -> Result<()> {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(err) => {
                warn!("usb: rndis: Dropped message: {}", err);
                return Ok(());
            }
        };
        debug!("usb: rndis: Recv message: {}", request);

        let mut response = [0u8; RESPONSE_LEN];
        let len = match request {
            Request::Initialize {
                request_id,
                max_transfer_size,
                ..
            } => {
                self.with_session(id, |s| {
                    s.state = RndisState::Initialized;
                    s.max_transfer_size = max_transfer_size;
                })?;
                message::initialize_complete(&mut response, request_id, NdisStatus::Success)
            }
            Request::Halt => {
                self.with_session(id, |s| {
                    s.state = RndisState::Uninitialized;
                    s.response_len = 0;
                })?;
                self.user.halt(id);
                return Ok(());
            }
            Request::Query {
                request_id,
                oid,
                input,
            } => {
                let info = &mut response[message::QUERY_COMPLETE_LEN..];
                let (status, info_len) = match self.user.query(id, oid, input, info) {
                    Ok(len) => (NdisStatus::Success, len),
                    Err(status) => (status, 0),
                };
                message::query_complete(&mut response, request_id, status, info_len)
            }
            Request::Set {
                request_id,
                oid,
                input,
            } => {
                let status = self.user.set(id, oid, input);
                message::set_complete(&mut response, request_id, status)
            }
            Request::Reset => {
                self.user.reset(id);
                message::reset_complete(&mut response, NdisStatus::Success)
            }
            Request::KeepAlive { request_id } => {
                message::keepalive_complete(&mut response, request_id, NdisStatus::Success)
            }
        };

        let notify_pipe = self.with_session(id, |s| {
            s.response = response;
            s.response_len = len;
            s.notify_pipe
        })?;
        let notify_pipe = notify_pipe.ok_or(Error::NotFound)?;
        let irp = Irp::new(UsbDirection::In)
            .with_length(RESPONSE_AVAILABLE.len() as u32)
            .with_context(CONTEXT_NOTIFICATION);
        ctx.submit_irp(&notify_pipe, &irp, &RESPONSE_AVAILABLE)?;

        if matches!(request, Request::Initialize { .. }) {
            self.arm_receive(ctx, id)?;
        }
        Ok(())
    }

    fn data_received<H: FunctionController>(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        id: SessionId,
        completion: &Completion<'_>,
    ) -> Result<()> {
        if completion.is_ok() {
            match message::decode_packet(completion.data) {
                Ok(frame) => self.user.receive(id, frame),
                Err(_) => warn!("usb: rndis: Malformed data message"),
            }
        }
        match self.with_session(id, |s| s.state)? {
            RndisState::Initialized => self.arm_receive(ctx, id),
            RndisState::Uninitialized => Ok(()),
        }
    }
}

impl<'a, H, const SESSIONS: usize> ClassDriver<H> for Rndis<'a, SESSIONS>
where
    H: FunctionController,
{
    fn examine_interface(&self, descriptor: &InterfaceDescriptor) -> bool {
        descriptor.class == CLASS_COMMUNICATIONS
            && descriptor.subclass == SUBCLASS_ACM
            && descriptor.protocol == PROTOCOL_RNDIS
    }

    fn connect(&self, ctx: &mut DeviceContext<'_, H>, interface: u8) -> Result<()> {
        let id = self.claim_slot(ctx.handle(), interface)?;
        if let Err(err) = self.open(ctx, id, interface) {
            warn!("usb: rndis: Connect failed: {}", err);
            let data = self.with_session(id, |s| {
                let data = s.data_interface;
                *s = Session::EMPTY;
                data
            })?;
            for number in [Some(interface), data].into_iter().flatten() {
                let _ = ctx.release_interface(number);
            }
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
        self.find_pipes(ctx, id)?;
        match self.with_session(id, |s| s.state)? {
            RndisState::Initialized => self.arm_receive(ctx, id),
            RndisState::Uninitialized => Ok(()),
        }
    }

    fn notify(&self, ctx: &mut DeviceContext<'_, H>, event: Event) -> Result<()> {
        let handle = ctx.handle();
        for index in 0..SESSIONS {
            let id = SessionId(index as u8);
            if let Ok(true) = self.with_session(id, |s| s.device == Some(handle)) {
                self.user.notify(id, event)?;
            }
        }

        let auto_configured = ctx
            .capabilities()
            .contains(Capabilities::AUTO_SET_CONFIGURATION);
        if event == Event::Disconnect && !auto_configured {
            self.close_device(handle)?;
        }
        Ok(())
    }

    fn class_specific(&self, ctx: &mut DeviceContext<'_, H>, setup: &SetupPacket) -> Result<()> {
        if !(setup.kind() == RequestType::Class && setup.recipient() == Recipient::Interface) {
            return Err(Error::InvalidArgument);
        }
        let request = ClassRequest::try_from(setup.request).map_err(|_| Error::InvalidArgument)?;
        let handle = ctx.handle();
        let interface = (setup.index & 0xFF) as u8;
        let id = self
            .find(|s| s.device == Some(handle) && s.interface == interface)
            .ok_or(Error::InvalidArgument)?;
        let pipe = ctx.control_pipe();

        match request {
            ClassRequest::SendEncapsulatedCommand => {
                if setup.direction() != UsbDirection::Out || setup.length == 0 {
                    return Err(Error::InvalidArgument);
                }
                self.with_session(id, |s| s.command_pending = true)?;
                let irp = Irp::new(UsbDirection::Out)
                    .with_length(u32::from(setup.length))
                    .with_context(CONTEXT_COMMAND);
                ctx.submit_irp(&pipe, &irp, &[])
            }
            ClassRequest::GetEncapsulatedResponse => {
                if setup.direction() != UsbDirection::In || setup.length == 0 {
                    return Err(Error::InvalidArgument);
                }
                let (response, len) = self.with_session(id, |s| {
                    let len = s.response_len.min(usize::from(setup.length));
                    s.response_len = 0;
                    (s.response, len)
                })?;
                let irp = Irp::new(UsbDirection::In).with_context(CONTEXT_RESPONSE);
                if len == 0 {
                    // nothing queued
                    ctx.submit_irp(&pipe, &irp.with_length(1), &[0])
                } else {
                    ctx.submit_irp(&pipe, &irp.with_length(len as u32), &response[..len])
                }
            }
        }
    }

    fn transfer_complete(
        &self,
        ctx: &mut DeviceContext<'_, H>,
        pipe: &Pipe,
        completion: &Completion<'_>,
    ) -> Result<()> {
        let handle = ctx.handle();
        if pipe.is_control() {
            if completion.context != CONTEXT_COMMAND {
                return Ok(());
            }
            let id = self
                .find(|s| s.device == Some(handle) && s.command_pending)
                .ok_or(Error::InvalidArgument)?;
            self.with_session(id, |s| s.command_pending = false)?;
            if let Err(err) = completion.status {
                warn!("usb: rndis: Command stage failed: {}", err);
                return Ok(());
            }
            return self.process_message(ctx, id, completion.data);
        }

        let address = u8::from(pipe.address());
        let id = self
            .find(|s| s.owns_endpoint(handle, address))
            .ok_or(Error::InvalidArgument)?;
        match completion.context {
            CONTEXT_NOTIFICATION => Ok(()),
            CONTEXT_DATA if pipe.endpoint().map(|ep| ep.direction()) == Some(UsbDirection::In) => {
                self.user.sent(id, completion);
                Ok(())
            }
            CONTEXT_DATA => self.data_received(ctx, id, completion),
            _ => Err(Error::InvalidArgument),
        }
    }
}
