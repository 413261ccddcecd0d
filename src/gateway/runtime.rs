//! Per-device connection runtime.
//!
//! One thread per session: a reader thread decrypts inbound frames into
//! a channel, and the session loop selects over inbound frames, API
//! commands, subscribed-event deliveries and a tick. The loop thread is
//! the only writer to the outbound cipher stream, so counter
//! assignment, encryption and the socket write happen as one step.

use std::collections::BTreeMap;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Sender, bounded, unbounded};
use crossbeam::select;

use crate::config::Config;
use crate::crypto::ServerKeys;
use crate::error::{Error, IntrospectionError, ProtocolError};
use crate::gateway::DeviceId;
use crate::gateway::cipher::{CipherError, CipherReader, CipherWriter};
use crate::gateway::collaborators::{ApiClient, AttributeStore, DeviceKeyStore, FirmwareStore};
use crate::gateway::flasher::{FlashError, FlashStatus, FlashStep, Flasher};
use crate::gateway::handshake::{self, SERVER_HELLO_ID};
use crate::gateway::publisher::{EventRecord, Publisher, SubscriptionRequest};
use crate::gateway::registry::SessionRegistry;
use crate::gateway::session::{
    DeviceDescription, DeviceSession, DisconnectReason, Owner, SessionAction, SessionContext,
    SessionIdentity, SessionPhase,
};
use crate::proto::value::{Value, VarType};
use crate::proto::{self, Message, MessageKind};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

// close-flag states for a session handle
const CLOSE_OPEN: u8 = 0;
const CLOSE_REQUESTED: u8 = 1;
const CLOSE_SUPERSEDED: u8 = 2;

static SESSION_SERIAL: AtomicU64 = AtomicU64::new(1);

fn close_flag_reason(flag: u8) -> DisconnectReason {
    if flag == CLOSE_SUPERSEDED {
        DisconnectReason::Superseded
    } else {
        DisconnectReason::Requested
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct GatewayDeps {
    pub config: Arc<Config>,
    pub server_keys: Arc<ServerKeys>,
    pub device_keys: Arc<dyn DeviceKeyStore>,
    pub attributes: Arc<dyn AttributeStore>,
    pub api: Arc<dyn ApiClient>,
    pub publisher: Arc<dyn Publisher>,
    pub firmware: Arc<dyn FirmwareStore>,
    pub registry: SessionRegistry,
}

/// Commands the backend side feeds into a session.
#[derive(Debug, Clone)]
pub enum Command {
    Describe,
    GetVar { name: String, vtype: Option<VarType> },
    SetVar { name: String, value: Value },
    CallFn { name: String, args: String },
    Flash { binary: Vec<u8> },
    FlashKnown { app: String },
    RaiseHand { signal: bool },
    Ping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Describe {
        firmware_version: u16,
        product_id: u16,
        state: DeviceDescription,
    },
    Var {
        name: String,
        value: Value,
        raw: Vec<u8>,
    },
    Function {
        name: String,
        result: i32,
    },
    Flash {
        status: FlashStatus,
    },
    RaiseHand {
        accepted: bool,
    },
    Ping {
        connected: bool,
        last_ping_ms: Option<u64>,
        last_heard_ms: u64,
    },
}

struct CommandEnvelope {
    command: Command,
    reply: Sender<Result<CommandReply, Error>>,
}

/// Cloneable handle for routing API commands to a session.
#[derive(Clone)]
pub struct SessionHandle {
    device_id: DeviceId,
    serial: u64,
    commands: Sender<CommandEnvelope>,
    closed: Arc<AtomicU8>,
}

impl SessionHandle {
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Send one command and block for its reply.
    pub fn execute(&self, command: Command) -> Result<CommandReply, Error> {
        let (tx, rx) = bounded(1);
        self.commands
            .send(CommandEnvelope { command, reply: tx })
            .map_err(|_| Error::Protocol(ProtocolError::Disconnected))?;
        rx.recv()
            .map_err(|_| Error::Protocol(ProtocolError::Disconnected))?
    }

    /// Ask the session to close; takes effect on its next tick.
    pub fn close(&self) {
        let _ = self.closed.compare_exchange(
            CLOSE_OPEN,
            CLOSE_REQUESTED,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// A newer connection for the same device id is taking over.
    fn supersede(&self) {
        self.closed.store(CLOSE_SUPERSEDED, Ordering::Relaxed);
    }
}

/// Take ownership of an accepted socket and run its session on a new
/// thread. The session announces itself in `deps.registry` once READY.
pub fn attach(stream: TcpStream, deps: GatewayDeps) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Err(err) = run_device_session(stream, deps) {
            tracing::warn!("device session ended: {err}");
        }
    })
}

enum Inbound {
    Frame(Vec<u8>),
    /// `None`: clean EOF.
    Closed(Option<CipherError>),
}

fn run_reader_loop(reader: &mut CipherReader<TcpStream>, tx: Sender<Inbound>) {
    loop {
        match reader.read_next() {
            Ok(Some(frame)) => {
                if tx.send(Inbound::Frame(frame)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = tx.send(Inbound::Closed(None));
                break;
            }
            Err(err) => {
                let _ = tx.send(Inbound::Closed(Some(err)));
                break;
            }
        }
    }
}

fn close_reason(err: Option<CipherError>) -> DisconnectReason {
    match err {
        None => DisconnectReason::Io("connection closed by peer".to_string()),
        Some(CipherError::Io(err))
            if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            DisconnectReason::IdleTimeout
        }
        Some(CipherError::Io(err)) => DisconnectReason::Io(err.to_string()),
        Some(other) => DisconnectReason::Crypto(other.to_string()),
    }
}

fn run_device_session(mut stream: TcpStream, deps: GatewayDeps) -> Result<(), Error> {
    let limits = deps.config.limits.clone();
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_millis(limits.socket_timeout_ms)))?;

    let outcome = handshake::run_server_handshake(
        &mut stream,
        &deps.server_keys,
        deps.device_keys.as_ref(),
        &limits,
    )?;

    let attributes = deps.attributes.get_core_attributes(&outcome.device_id);
    let identity = SessionIdentity {
        device_id: outcome.device_id,
        product_id: outcome.hello.product_id,
        firmware_version: outcome.hello.firmware_version,
        platform_id: outcome.hello.platform_id,
        user_id: attributes.get("userid").cloned().unwrap_or_default(),
    };
    if deps.config.show_verbose_device_logs {
        tracing::info!(device_id = %identity.device_id, attributes = ?attributes, "device attributes loaded");
    }

    let started = now_ms();
    let session = DeviceSession::new(
        identity,
        limits.clone(),
        started,
        u32::from(SERVER_HELLO_ID),
        u32::from(outcome.hello_id),
    );

    let (command_tx, command_rx) = unbounded::<CommandEnvelope>();
    let (delivery_tx, delivery_rx) = unbounded::<EventRecord>();
    let (inbound_tx, inbound_rx) = unbounded::<Inbound>();

    let closed = Arc::new(AtomicU8::new(CLOSE_OPEN));
    let handle = SessionHandle {
        device_id: outcome.device_id,
        serial: SESSION_SERIAL.fetch_add(1, Ordering::Relaxed),
        commands: command_tx,
        closed: Arc::clone(&closed),
    };
    let serial = handle.serial();
    if let Some(previous) = deps.registry.insert(handle) {
        previous.supersede();
    }

    let mut reader = CipherReader::new(stream.try_clone()?, outcome.recv, limits.max_frame_bytes);
    let reader_handle = thread::spawn(move || run_reader_loop(&mut reader, inbound_tx));
    let writer = CipherWriter::new(stream.try_clone()?, outcome.send, limits.max_frame_bytes);

    let mut state = SessionLoop {
        deps: &deps,
        limits,
        session,
        writer,
        stream,
        delivery_tx,
        pending: BTreeMap::new(),
        flash: None,
        queued: Vec::new(),
        serial,
        last_probe_ms: started,
    };

    state.publish_internal("spark/status", b"online");
    // warm the introspection cache so CallFn has signatures to work with
    let mut ended = state.start_describe(PendingPurpose::WarmIntrospection);

    let tick = crossbeam::channel::tick(TICK_INTERVAL);
    while !ended {
        let close_flag = closed.load(Ordering::Relaxed);
        if close_flag != CLOSE_OPEN {
            state.disconnect(close_flag_reason(close_flag));
            break;
        }
        select! {
            recv(inbound_rx) -> msg => {
                ended = match msg {
                    Ok(Inbound::Frame(bytes)) => state.on_inbound(bytes),
                    Ok(Inbound::Closed(err)) => {
                        state.disconnect(close_reason(err));
                        true
                    }
                    Err(_) => {
                        state.disconnect(DisconnectReason::Io("reader thread gone".to_string()));
                        true
                    }
                };
            }
            recv(command_rx) -> msg => {
                if let Ok(envelope) = msg {
                    ended = state.on_command(envelope);
                }
            }
            recv(delivery_rx) -> msg => {
                if let Ok(record) = msg {
                    ended = state.on_delivery(record);
                }
            }
            recv(tick) -> _ => {
                ended = state.on_tick();
            }
        }
    }

    state.disconnect(DisconnectReason::Requested);
    drop(command_rx);
    let _ = reader_handle.join();
    Ok(())
}

enum PendingPurpose {
    Api {
        reply: Sender<Result<CommandReply, Error>>,
        shape: ResponseShape,
    },
    WarmIntrospection,
    SafeMode,
    Flash,
}

#[derive(Clone)]
enum ResponseShape {
    Describe,
    Var { name: String, vtype: VarType },
    Function { name: String },
    RaiseHand,
}

struct Pending {
    expect: MessageKind,
    purpose: PendingPurpose,
    deadline_ms: u64,
}

struct FlashRun {
    flasher: Flasher,
    reply: Sender<Result<CommandReply, Error>>,
}

/// Session loop state; lives on the session thread only.
struct SessionLoop<'a> {
    deps: &'a GatewayDeps,
    limits: crate::config::Limits,
    session: DeviceSession,
    writer: CipherWriter<TcpStream>,
    stream: TcpStream,
    delivery_tx: Sender<EventRecord>,
    pending: BTreeMap<u8, Pending>,
    flash: Option<FlashRun>,
    /// Deliveries held back while the flasher owns the stream.
    queued: Vec<EventRecord>,
    serial: u64,
    last_probe_ms: u64,
}

struct GatewayContext<'a> {
    deps: &'a GatewayDeps,
    device_id: DeviceId,
    deliveries: &'a Sender<EventRecord>,
}

impl SessionContext for GatewayContext<'_> {
    fn publish(&mut self, record: EventRecord) -> bool {
        self.deps.publisher.publish(&record)
    }

    fn subscribe(
        &mut self,
        prefix: String,
        user_scope: Option<String>,
        device_filter: Option<DeviceId>,
    ) {
        self.deps.publisher.subscribe(SubscriptionRequest {
            prefix,
            user_scope,
            device_filter,
            subscriber: self.device_id,
            sender: self.deliveries.clone(),
        });
    }

    fn core_attribute(&mut self, key: &str) -> Option<String> {
        self.deps
            .attributes
            .get_core_attributes(&self.device_id)
            .get(key)
            .cloned()
    }

    fn set_core_attribute(&mut self, key: &str, value: &str) {
        self.deps
            .attributes
            .set_core_attribute(&self.device_id, key, value);
    }

    fn link_device(&mut self, claim_code: &str, product_id: u16) {
        self.deps
            .api
            .link_device(&self.device_id, claim_code, product_id);
    }
}

impl SessionLoop<'_> {
    fn device_id(&self) -> DeviceId {
        self.session.identity().device_id
    }

    /// Returns true when the session has ended.
    fn on_inbound(&mut self, bytes: Vec<u8>) -> bool {
        let frame = match proto::coap::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                self.disconnect(DisconnectReason::BadFrame(err.to_string()));
                return true;
            }
        };
        if self.deps.config.show_verbose_device_logs {
            tracing::debug!(device_id = %self.device_id(), id = frame.id, code = %frame.code, uri = %frame.uri_path, "frame in");
        }
        let now = now_ms();
        let mut ctx = GatewayContext {
            deps: self.deps,
            device_id: self.device_id(),
            deliveries: &self.delivery_tx,
        };
        let actions = self.session.handle_frame(frame, &mut ctx, now);
        self.apply_actions(actions, now)
    }

    fn apply_actions(&mut self, actions: Vec<SessionAction>, now: u64) -> bool {
        for action in actions {
            let ended = match action {
                SessionAction::Send(msg) => self.write(msg),
                SessionAction::Response { token, kind, frame } => {
                    self.on_response(token, kind, frame, now)
                }
                SessionAction::SafeModeRequested => self.start_describe(PendingPurpose::SafeMode),
                SessionAction::Disconnect(reason) => {
                    self.disconnect(reason);
                    true
                }
            };
            if ended {
                return true;
            }
        }
        false
    }

    fn write(&mut self, msg: Message) -> bool {
        if self.deps.config.show_verbose_device_logs {
            tracing::debug!(device_id = %self.device_id(), id = msg.id, code = %msg.code, uri = %msg.uri_path, "frame out");
        }
        match self.writer.write_frame(&proto::coap::encode(&msg)) {
            Ok(_) => false,
            Err(CipherError::Io(err)) => {
                self.disconnect(DisconnectReason::Io(err.to_string()));
                true
            }
            Err(other) => {
                self.disconnect(DisconnectReason::Crypto(other.to_string()));
                true
            }
        }
    }

    fn register_and_send(
        &mut self,
        token: u8,
        msg: Message,
        expect: MessageKind,
        purpose: PendingPurpose,
        timeout_ms: u64,
    ) -> bool {
        self.pending.insert(
            token,
            Pending {
                expect,
                purpose,
                deadline_ms: now_ms() + timeout_ms,
            },
        );
        self.write(msg)
    }

    fn start_describe(&mut self, purpose: PendingPurpose) -> bool {
        match self.session.build_describe() {
            Ok((token, msg)) => self.register_and_send(
                token,
                msg,
                MessageKind::DescribeReturn,
                purpose,
                self.limits.request_timeout_ms,
            ),
            Err(err) => {
                tracing::warn!(device_id = %self.device_id(), "describe not started: {err}");
                false
            }
        }
    }

    fn on_response(
        &mut self,
        token: Option<u8>,
        kind: MessageKind,
        frame: Message,
        now: u64,
    ) -> bool {
        let Some(token) = token else {
            // bare keepalive ack; the session already recorded it
            return false;
        };
        let Some(pending) = self.pending.remove(&token) else {
            tracing::debug!(device_id = %self.device_id(), token, "reply with no pending listener");
            return false;
        };
        match pending.purpose {
            PendingPurpose::WarmIntrospection => {
                match DeviceDescription::parse(&frame.payload) {
                    Ok(description) => self.session.set_description(description),
                    Err(err) => {
                        tracing::warn!(device_id = %self.device_id(), "introspection unparsable: {err}");
                    }
                }
                false
            }
            PendingPurpose::SafeMode => {
                self.deps.api.safe_mode(&self.device_id(), &frame.payload);
                false
            }
            PendingPurpose::Api { reply, shape } => {
                let result = self.decode_response(shape, frame);
                let _ = reply.send(result);
                false
            }
            PendingPurpose::Flash => self.on_flash_response(kind, frame, now),
        }
    }

    fn decode_response(
        &mut self,
        shape: ResponseShape,
        frame: Message,
    ) -> Result<CommandReply, Error> {
        match shape {
            ResponseShape::Describe => {
                let state = DeviceDescription::parse(&frame.payload)?;
                self.session.set_description(state.clone());
                let identity = self.session.identity();
                Ok(CommandReply::Describe {
                    firmware_version: identity.firmware_version,
                    product_id: identity.product_id,
                    state,
                })
            }
            ResponseShape::Var { name, vtype } => {
                let value = Value::decode(vtype, &frame.payload).map_err(|err| {
                    Error::Introspection(IntrospectionError::BadVariable {
                        reason: err.to_string(),
                    })
                })?;
                Ok(CommandReply::Var {
                    name,
                    value,
                    raw: frame.payload,
                })
            }
            ResponseShape::Function { name } => {
                let value = Value::decode(VarType::Int32, &frame.payload).map_err(|err| {
                    Error::Introspection(IntrospectionError::BadVariable {
                        reason: err.to_string(),
                    })
                })?;
                let Value::Int32(result) = value else {
                    unreachable!("int32 decode yields Int32");
                };
                Ok(CommandReply::Function { name, result })
            }
            ResponseShape::RaiseHand => Ok(CommandReply::RaiseHand { accepted: true }),
        }
    }

    fn on_command(&mut self, envelope: CommandEnvelope) -> bool {
        let CommandEnvelope { command, reply } = envelope;
        if self.deps.config.log_api_messages {
            tracing::info!(device_id = %self.device_id(), command = ?command, "api command");
        }

        // Ping answers from session state and stays legal while flashing
        if matches!(command, Command::Ping) {
            let _ = reply.send(Ok(CommandReply::Ping {
                connected: self.session.phase() != SessionPhase::Disconnected,
                last_ping_ms: self.session.last_ping_ms(),
                last_heard_ms: self.session.last_heard_ms(),
            }));
            return false;
        }
        if let Err(err) = self.session.ensure_writable() {
            let _ = reply.send(Err(err.into()));
            return false;
        }

        match command {
            Command::Describe => {
                if let Some(state) = self.session.description().cloned() {
                    let identity = self.session.identity();
                    let _ = reply.send(Ok(CommandReply::Describe {
                        firmware_version: identity.firmware_version,
                        product_id: identity.product_id,
                        state,
                    }));
                    return false;
                }
                self.start_api_describe(reply)
            }
            Command::GetVar { name, vtype } => {
                let vtype = vtype.unwrap_or_else(|| self.session.variable_type(&name));
                match self.session.build_variable_request(&name, None) {
                    Ok((token, msg)) => self.register_and_send(
                        token,
                        msg,
                        MessageKind::VariableValue,
                        PendingPurpose::Api {
                            reply,
                            shape: ResponseShape::Var { name, vtype },
                        },
                        self.limits.request_timeout_ms,
                    ),
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        false
                    }
                }
            }
            Command::SetVar { name, value } => {
                let vtype = self.session.variable_type(&name);
                match self
                    .session
                    .build_variable_request(&name, Some(value.to_bytes()))
                {
                    Ok((token, msg)) => self.register_and_send(
                        token,
                        msg,
                        MessageKind::VariableValue,
                        PendingPurpose::Api {
                            reply,
                            shape: ResponseShape::Var { name, vtype },
                        },
                        self.limits.request_timeout_ms,
                    ),
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        false
                    }
                }
            }
            Command::CallFn { name, args } => match self.session.build_function_call(&name, &args)
            {
                Ok((token, msg)) => self.register_and_send(
                    token,
                    msg,
                    MessageKind::FunctionReturn,
                    PendingPurpose::Api {
                        reply,
                        shape: ResponseShape::Function { name },
                    },
                    self.limits.request_timeout_ms,
                ),
                Err(err) => {
                    let _ = reply.send(Err(err));
                    false
                }
            },
            Command::RaiseHand { signal } => match self.session.build_raise_hand(signal) {
                Ok((token, msg)) => self.register_and_send(
                    token,
                    msg,
                    MessageKind::RaiseYourHandReturn,
                    PendingPurpose::Api {
                        reply,
                        shape: ResponseShape::RaiseHand,
                    },
                    self.limits.raise_hand_timeout_ms,
                ),
                Err(err) => {
                    let _ = reply.send(Err(err.into()));
                    false
                }
            },
            Command::Flash { binary } => self.start_flash(binary, reply),
            Command::FlashKnown { app } => match self.deps.firmware.known_firmware(&app) {
                Ok(binary) => self.start_flash(binary, reply),
                Err(err) => {
                    self.publish_flash_status(FlashStatus::Failed);
                    let _ = reply.send(Err(err.into()));
                    false
                }
            },
            Command::Ping => unreachable!("handled above"),
        }
    }

    fn start_api_describe(&mut self, reply: Sender<Result<CommandReply, Error>>) -> bool {
        match self.session.build_describe() {
            Ok((token, msg)) => self.register_and_send(
                token,
                msg,
                MessageKind::DescribeReturn,
                PendingPurpose::Api {
                    reply,
                    shape: ResponseShape::Describe,
                },
                self.limits.request_timeout_ms,
            ),
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                false
            }
        }
    }

    fn start_flash(
        &mut self,
        binary: Vec<u8>,
        reply: Sender<Result<CommandReply, Error>>,
    ) -> bool {
        let mut flasher = match Flasher::prepare(&binary, &self.limits) {
            Ok(flasher) => flasher,
            Err(err) => {
                self.publish_flash_status(FlashStatus::Failed);
                let _ = reply.send(Err(err.into()));
                return false;
            }
        };
        if let Err(err) = self.session.take_ownership(Owner::Flasher) {
            let _ = reply.send(Err(err.into()));
            return false;
        }
        tracing::info!(
            device_id = %self.device_id(),
            bytes = flasher.binary_len(),
            chunks = flasher.chunk_count(),
            "flash started"
        );
        let payload = flasher.begin_payload(&self.limits);
        match self.session.build_update_begin(payload) {
            Ok((token, msg)) => {
                flasher.mark_begin_sent();
                self.flash = Some(FlashRun { flasher, reply });
                self.register_and_send(
                    token,
                    msg,
                    MessageKind::UpdateReady,
                    PendingPurpose::Flash,
                    self.limits.request_timeout_ms,
                )
            }
            Err(err) => {
                self.session.release_ownership(Owner::Flasher);
                let _ = reply.send(Err(err.into()));
                false
            }
        }
    }

    fn on_flash_response(&mut self, kind: MessageKind, frame: Message, _now: u64) -> bool {
        let Some(run) = self.flash.as_mut() else {
            return false;
        };
        let step = match kind {
            MessageKind::UpdateReady => run.flasher.on_update_ready(),
            MessageKind::ChunkReceived => {
                let crc = frame
                    .payload
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or_default();
                run.flasher.on_chunk_receipt(crc)
            }
            other => {
                tracing::debug!(kind = other.name(), "unexpected reply during flash");
                return false;
            }
        };
        self.advance_flash(step)
    }

    fn advance_flash(&mut self, step: FlashStep) -> bool {
        match step {
            FlashStep::SendChunk { index } => {
                let Some(chunk) = self
                    .flash
                    .as_ref()
                    .map(|run| run.flasher.chunk(index).to_vec())
                else {
                    return false;
                };
                match self.session.build_chunk(&chunk) {
                    Ok((token, msg)) => {
                        let ended = self.register_and_send(
                            token,
                            msg,
                            MessageKind::ChunkReceived,
                            PendingPurpose::Flash,
                            self.limits.request_timeout_ms,
                        );
                        if !ended && let Some(run) = self.flash.as_mut() {
                            run.flasher.mark_chunk_sent();
                        }
                        ended
                    }
                    Err(err) => {
                        self.finish_flash(Err(err.into()));
                        false
                    }
                }
            }
            FlashStep::SendDone => match self.session.build_update_done() {
                Ok((token, msg)) => {
                    // no reply awaited for the done marker
                    self.session.release_token(token);
                    if self.write(msg) {
                        return true;
                    }
                    self.finish_flash(Ok(()));
                    false
                }
                Err(err) => {
                    self.finish_flash(Err(err.into()));
                    false
                }
            },
            FlashStep::Failed(error) => {
                let abort = self.session.build_update_abort();
                if self.write(abort) {
                    return true;
                }
                self.finish_flash(Err(error.into()));
                false
            }
        }
    }

    fn finish_flash(&mut self, result: Result<(), Error>) {
        let Some(run) = self.flash.take() else {
            return;
        };
        self.session.release_ownership(Owner::Flasher);
        match result {
            Ok(()) => {
                tracing::info!(device_id = %self.device_id(), "flash complete");
                self.publish_flash_status(FlashStatus::Success);
                let _ = run.reply.send(Ok(CommandReply::Flash {
                    status: FlashStatus::Success,
                }));
            }
            Err(err) => {
                tracing::warn!(device_id = %self.device_id(), "flash failed: {err}");
                self.publish_flash_status(FlashStatus::Failed);
                let _ = run.reply.send(Err(err));
            }
        }
        self.flush_queued();
    }

    fn publish_flash_status(&self, status: FlashStatus) {
        self.publish_internal("spark/flash/status", status.as_str().as_bytes());
    }

    fn publish_internal(&self, name: &str, data: &[u8]) {
        let identity = self.session.identity();
        let record = EventRecord {
            name: name.to_string(),
            is_public: false,
            ttl_secs: self.limits.default_event_ttl_secs,
            data: (!data.is_empty()).then(|| data.to_vec()),
            device_id: identity.device_id,
            user_id: identity.user_id.clone(),
            published_at_secs: (now_ms() / 1000) as u32,
        };
        self.deps.publisher.publish(&record);
    }

    fn on_delivery(&mut self, record: EventRecord) -> bool {
        if self.session.phase() == SessionPhase::OwnedByFlasher {
            self.queued.push(record);
            return false;
        }
        let msg = self.session.build_event_delivery(&record);
        self.write(msg)
    }

    fn flush_queued(&mut self) {
        if self.session.phase() != SessionPhase::Ready {
            return;
        }
        for record in std::mem::take(&mut self.queued) {
            let msg = self.session.build_event_delivery(&record);
            if self.write(msg) {
                return;
            }
        }
    }

    fn on_tick(&mut self) -> bool {
        let now = now_ms();
        let expired: Vec<u8> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline_ms <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            let Some(pending) = self.pending.remove(&token) else {
                continue;
            };
            self.session.release_token(token);
            match pending.purpose {
                PendingPurpose::Api { reply, shape } => {
                    let result = match shape {
                        // a silent device answers a raise-hand with "no"
                        ResponseShape::RaiseHand => Ok(CommandReply::RaiseHand { accepted: false }),
                        _ => Err(Error::Protocol(ProtocolError::RequestTimeout {
                            waiting_for: pending.expect.name(),
                        })),
                    };
                    let _ = reply.send(result);
                }
                PendingPurpose::Flash => {
                    let step = self.flash.as_mut().map(|run| {
                        run.flasher.fail(FlashError::StageTimeout {
                            stage: pending.expect.name(),
                        })
                    });
                    if let Some(step) = step
                        && self.advance_flash(step)
                    {
                        return true;
                    }
                }
                PendingPurpose::WarmIntrospection | PendingPurpose::SafeMode => {}
            }
        }

        if now.saturating_sub(self.session.last_heard_ms()) > self.limits.socket_timeout_ms {
            self.disconnect(DisconnectReason::IdleTimeout);
            return true;
        }

        // keepalive probe for quiet devices
        if now.saturating_sub(self.session.last_heard_ms()) > self.limits.keepalive_ms
            && now.saturating_sub(self.last_probe_ms) > self.limits.keepalive_ms
        {
            self.last_probe_ms = now;
            let ping = self.session.build_ping();
            return self.write(ping);
        }
        false
    }

    /// Idempotent teardown; emits the disconnect signal exactly once.
    fn disconnect(&mut self, reason: DisconnectReason) {
        if !self.session.mark_disconnected() {
            return;
        }
        tracing::info!(device_id = %self.device_id(), reason = %reason, "device disconnected");

        for (_token, pending) in std::mem::take(&mut self.pending) {
            if let PendingPurpose::Api { reply, .. } = pending.purpose {
                let _ = reply.send(Err(Error::Protocol(ProtocolError::Disconnected)));
            }
        }
        if let Some(run) = self.flash.take() {
            self.publish_flash_status(FlashStatus::Failed);
            let _ = run.reply.send(Err(Error::Protocol(ProtocolError::Disconnected)));
        }
        self.queued.clear();

        self.deps.publisher.unsubscribe(&self.device_id());
        self.deps.registry.remove(&self.device_id(), self.serial);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.publish_internal("spark/status", b"offline");
    }
}
