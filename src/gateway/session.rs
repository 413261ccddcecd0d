//! Device session protocol machine.
//!
//! Sans-IO: `handle_frame` mutates counters, the token table and phase,
//! and returns the actions the runtime must perform. All session state
//! is confined to the one runtime thread that owns this value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Limits;
use crate::error::{Error, IntrospectionError, OwnershipError, ProtocolError};
use crate::gateway::DeviceId;
use crate::gateway::publisher::EventRecord;
use crate::proto::value::{Value, VarType};
use crate::proto::{self, Code, Message, MessageKind, MessageType};

/// Parsed introspection document: exposed variables and functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    #[serde(default)]
    pub v: BTreeMap<String, VarType>,
    #[serde(default)]
    pub f: Vec<FunctionSpec>,
}

impl DeviceDescription {
    pub fn parse(payload: &[u8]) -> Result<Self, IntrospectionError> {
        serde_json::from_slice(payload).map_err(|err| IntrospectionError::BadDescription {
            reason: err.to_string(),
        })
    }

    pub fn variable_type(&self, name: &str) -> VarType {
        self.v.get(name).copied().unwrap_or_default()
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.f.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<VarType>,
    #[serde(default = "default_return_type")]
    pub returns: VarType,
}

fn default_return_type() -> VarType {
    VarType::Int32
}

impl FunctionSpec {
    /// Encode a comma-separated argument string into URI-query
    /// components. `None` when the arguments do not fit the signature.
    pub fn transform_arguments(&self, args: &str) -> Option<Vec<String>> {
        let parts: Vec<&str> = if args.is_empty() {
            Vec::new()
        } else {
            args.split(',').collect()
        };
        if parts.len() != self.args.len() {
            return None;
        }
        for (part, vtype) in parts.iter().zip(&self.args) {
            if !Value::argument_fits(*vtype, part) {
                return None;
            }
        }
        Some(parts.into_iter().map(str::to_string).collect())
    }
}

#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub device_id: DeviceId,
    pub product_id: u16,
    pub firmware_version: u16,
    pub platform_id: u16,
    /// Owner of the device; empty when unclaimed.
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Ready,
    OwnedByFlasher,
    Disconnected,
}

/// Exclusive-owner tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Flasher,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    BadCounter { expected: u16, got: u16 },
    IgnoredFrame,
    IdleTimeout,
    Io(String),
    Crypto(String),
    BadFrame(String),
    Requested,
    Superseded,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::BadCounter { expected, got } => {
                write!(f, "Bad Counter: expected {expected} got {got}")
            }
            DisconnectReason::IgnoredFrame => write!(f, "ignored frame out of sequence"),
            DisconnectReason::IdleTimeout => write!(f, "socket idle timeout"),
            DisconnectReason::Io(err) => write!(f, "io: {err}"),
            DisconnectReason::Crypto(err) => write!(f, "crypto: {err}"),
            DisconnectReason::BadFrame(err) => write!(f, "bad frame: {err}"),
            DisconnectReason::Requested => write!(f, "close requested"),
            DisconnectReason::Superseded => write!(f, "superseded by a newer connection"),
        }
    }
}

/// Work the runtime performs after a `handle_frame` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Send(Message),
    /// An awaited reply arrived (or an unmatched ack, reported as
    /// `PingAck`).
    Response {
        token: Option<u8>,
        kind: MessageKind,
        frame: Message,
    },
    /// Device requested safe mode; the runtime describes it and
    /// forwards the result upstream.
    SafeModeRequested,
    Disconnect(DisconnectReason),
}

/// Collaborator seam the session calls into while routing one frame.
pub trait SessionContext {
    fn publish(&mut self, record: EventRecord) -> bool;
    fn subscribe(
        &mut self,
        prefix: String,
        user_scope: Option<String>,
        device_filter: Option<DeviceId>,
    );
    fn core_attribute(&mut self, key: &str) -> Option<String>;
    fn set_core_attribute(&mut self, key: &str, value: &str);
    fn link_device(&mut self, claim_code: &str, product_id: u16);
}

pub struct DeviceSession {
    identity: SessionIdentity,
    limits: Limits,
    phase: SessionPhase,
    send_counter: u32,
    recv_counter: u32,
    send_token: u8,
    tokens: BTreeMap<u8, MessageKind>,
    description: Option<DeviceDescription>,
    connected_at_ms: u64,
    last_heard_ms: u64,
    last_ping_ms: Option<u64>,
}

impl DeviceSession {
    /// `initial_send` / `initial_recv` are the ids already consumed by
    /// the handshake hellos.
    pub fn new(
        identity: SessionIdentity,
        limits: Limits,
        now_ms: u64,
        initial_send: u32,
        initial_recv: u32,
    ) -> Self {
        Self {
            identity,
            limits,
            phase: SessionPhase::Ready,
            send_counter: initial_send,
            recv_counter: initial_recv,
            send_token: 0,
            tokens: BTreeMap::new(),
            description: None,
            connected_at_ms: now_ms,
            last_heard_ms: now_ms,
            last_ping_ms: None,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn description(&self) -> Option<&DeviceDescription> {
        self.description.as_ref()
    }

    pub fn set_description(&mut self, description: DeviceDescription) {
        self.description = Some(description);
    }

    pub fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms
    }

    pub fn last_heard_ms(&self) -> u64 {
        self.last_heard_ms
    }

    pub fn last_ping_ms(&self) -> Option<u64> {
        self.last_ping_ms
    }

    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }

    pub fn recv_counter(&self) -> u32 {
        self.recv_counter
    }

    pub fn outstanding_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn variable_type(&self, name: &str) -> VarType {
        self.description
            .as_ref()
            .map(|d| d.variable_type(name))
            .unwrap_or_default()
    }

    fn next_id(&mut self) -> u16 {
        self.send_counter = (self.send_counter + 1) % self.limits.message_counter_max;
        self.send_counter as u16
    }

    /// Post-increment token allocation; skips values still awaited.
    fn next_token(&mut self) -> Result<u8, ProtocolError> {
        if self.tokens.len() > usize::from(u8::MAX) {
            return Err(ProtocolError::TokensExhausted);
        }
        loop {
            self.send_token = self.send_token.wrapping_add(1);
            if !self.tokens.contains_key(&self.send_token) {
                return Ok(self.send_token);
            }
        }
    }

    pub fn token_in_flight(&self, token: u8) -> bool {
        self.tokens.contains_key(&token)
    }

    /// Release a token whose reply timed out.
    pub fn release_token(&mut self, token: u8) {
        self.tokens.remove(&token);
    }

    /// Build an outbound request frame: counter assigned, token drawn
    /// and recorded in the outstanding table.
    pub fn start_request(
        &mut self,
        kind: MessageKind,
        uri: impl Into<String>,
        query: Vec<String>,
        payload: Vec<u8>,
    ) -> Result<(u8, Message), ProtocolError> {
        let spec = kind.spec();
        let token = self.next_token()?;
        let id = self.next_id();
        let mut msg = Message::new(spec.mtype, spec.code, id).with_token(vec![token]);
        msg.uri_path = uri.into();
        msg.uri_query = query;
        msg.payload = payload;
        self.tokens.insert(token, kind);
        Ok((token, msg))
    }

    pub fn build_describe(&mut self) -> Result<(u8, Message), ProtocolError> {
        self.start_request(MessageKind::Describe, "d", Vec::new(), Vec::new())
    }

    /// GetVar and SetVar share this wire shape; SetVar carries the
    /// value bytes as payload.
    pub fn build_variable_request(
        &mut self,
        name: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<(u8, Message), ProtocolError> {
        self.start_request(
            MessageKind::VariableRequest,
            format!("v/{name}"),
            Vec::new(),
            payload.unwrap_or_default(),
        )
    }

    pub fn build_function_call(&mut self, name: &str, args: &str) -> Result<(u8, Message), Error> {
        let unknown = || {
            Error::Introspection(IntrospectionError::UnknownFunction {
                name: name.to_string(),
            })
        };
        let spec = self
            .description
            .as_ref()
            .and_then(|d| d.function(name))
            .ok_or_else(unknown)?;
        let query = spec.transform_arguments(args).ok_or_else(unknown)?;
        Ok(self.start_request(MessageKind::FunctionCall, format!("f/{name}"), query, Vec::new())?)
    }

    pub fn build_raise_hand(&mut self, signal: bool) -> Result<(u8, Message), ProtocolError> {
        self.start_request(
            MessageKind::RaiseYourHand,
            "s/raise",
            vec![format!("sig={}", u8::from(signal))],
            Vec::new(),
        )
    }

    pub fn build_update_begin(&mut self, payload: Vec<u8>) -> Result<(u8, Message), ProtocolError> {
        self.start_request(MessageKind::UpdateBegin, "u", Vec::new(), payload)
    }

    pub fn build_chunk(&mut self, chunk: &[u8]) -> Result<(u8, Message), ProtocolError> {
        self.start_request(MessageKind::Chunk, "c", Vec::new(), chunk.to_vec())
    }

    pub fn build_update_done(&mut self) -> Result<(u8, Message), ProtocolError> {
        self.start_request(MessageKind::UpdateDone, "u", Vec::new(), Vec::new())
    }

    pub fn build_update_abort(&mut self) -> Message {
        let spec = MessageKind::UpdateAbort.spec();
        let id = self.next_id();
        Message::new(spec.mtype, spec.code, id)
    }

    /// Keepalive probe. Empty messages never consume a counter slot, so
    /// the current send counter is reused as the id.
    pub fn build_ping(&self) -> Message {
        let spec = MessageKind::Ping.spec();
        Message::new(spec.mtype, spec.code, self.send_counter as u16)
    }

    /// Outbound delivery of a subscribed event. A leading
    /// `<userid>/` prefix is stripped before the wire name is built.
    pub fn build_event_delivery(&mut self, record: &EventRecord) -> Message {
        let mut name = record.name.as_str();
        if !self.identity.user_id.is_empty()
            && let Some(stripped) = name.strip_prefix(&format!("{}/", self.identity.user_id))
        {
            name = stripped;
        }
        let kind = if record.is_public {
            MessageKind::PublicEvent
        } else {
            MessageKind::PrivateEvent
        };
        let spec = kind.spec();
        let prefix = if record.is_public { "E" } else { "e" };
        let id = self.next_id();
        let mut msg = Message::new(spec.mtype, spec.code, id).with_path(format!("{prefix}/{name}"));
        msg.max_age = Some(record.ttl_secs);
        msg.timestamp = Some(record.published_at_secs);
        msg.payload = record.data.clone().unwrap_or_default();
        msg
    }

    pub fn take_ownership(&mut self, _owner: Owner) -> Result<(), OwnershipError> {
        match self.phase {
            SessionPhase::Ready => {
                self.phase = SessionPhase::OwnedByFlasher;
                Ok(())
            }
            SessionPhase::OwnedByFlasher | SessionPhase::Disconnected => {
                Err(OwnershipError::AlreadyOwned)
            }
        }
    }

    /// No-op unless `owner` currently holds the session.
    pub fn release_ownership(&mut self, _owner: Owner) {
        if self.phase == SessionPhase::OwnedByFlasher {
            self.phase = SessionPhase::Ready;
        }
    }

    /// Gate for non-owner writers (API commands other than Ping).
    pub fn ensure_writable(&self) -> Result<(), OwnershipError> {
        match self.phase {
            SessionPhase::OwnedByFlasher => Err(OwnershipError::LockedDuringFlashing),
            _ => Ok(()),
        }
    }

    /// One-shot: true only on the first call. Clears the token table;
    /// the runtime fails the matching listeners.
    pub fn mark_disconnected(&mut self) -> bool {
        if self.phase == SessionPhase::Disconnected {
            return false;
        }
        self.phase = SessionPhase::Disconnected;
        self.tokens.clear();
        true
    }

    fn expected_recv(&self) -> u16 {
        ((self.recv_counter + 1) % self.limits.message_counter_max) as u16
    }

    /// Route one decrypted inbound frame.
    pub fn handle_frame(
        &mut self,
        frame: Message,
        ctx: &mut dyn SessionContext,
        now_ms: u64,
    ) -> Vec<SessionAction> {
        if self.phase == SessionPhase::Disconnected {
            return Vec::new();
        }
        self.last_heard_ms = now_ms;

        if frame.is_ack() {
            return self.handle_ack(frame, now_ms);
        }

        if frame.is_empty() && frame.is_confirmable() {
            self.last_ping_ms = Some(now_ms);
            let spec = MessageKind::PingAck.spec();
            return vec![SessionAction::Send(Message::new(spec.mtype, spec.code, frame.id))];
        }

        let kind = proto::classify_request(&frame);
        let expected = self.expected_recv();
        if frame.id != expected {
            let reason = if kind == MessageKind::Ignored {
                DisconnectReason::IgnoredFrame
            } else {
                DisconnectReason::BadCounter {
                    expected,
                    got: frame.id,
                }
            };
            return vec![SessionAction::Disconnect(reason)];
        }
        self.recv_counter = (self.recv_counter + 1) % self.limits.message_counter_max;

        match kind {
            // a reply sent as its own request still resolves by token
            MessageKind::Ignored
                if frame
                    .token_byte()
                    .is_some_and(|token| self.tokens.contains_key(&token)) =>
            {
                self.handle_ack(frame, now_ms)
            }
            MessageKind::PrivateEvent => self.handle_event(false, frame, ctx, now_ms),
            MessageKind::PublicEvent => self.handle_event(true, frame, ctx, now_ms),
            MessageKind::Subscribe => self.handle_subscribe(frame, ctx),
            MessageKind::GetTime => self.handle_get_time(frame, now_ms),
            MessageKind::KeyChange => {
                let mut ack =
                    Message::new(MessageType::Acknowledgement, Code::CHANGED, frame.id);
                ack.token = frame.token;
                vec![SessionAction::Send(ack)]
            }
            other => {
                tracing::debug!(
                    device_id = %self.identity.device_id,
                    kind = other.name(),
                    "dropping unroutable inbound frame"
                );
                Vec::new()
            }
        }
    }

    fn handle_ack(&mut self, frame: Message, now_ms: u64) -> Vec<SessionAction> {
        if let Some(token) = frame.token_byte()
            && let Some(request) = self.tokens.remove(&token)
        {
            let kind = request.response().unwrap_or(MessageKind::PingAck);
            return vec![SessionAction::Response {
                token: Some(token),
                kind,
                frame,
            }];
        }
        self.last_ping_ms = Some(now_ms);
        vec![SessionAction::Response {
            token: None,
            kind: MessageKind::PingAck,
            frame,
        }]
    }

    fn handle_event(
        &mut self,
        is_public: bool,
        frame: Message,
        ctx: &mut dyn SessionContext,
        now_ms: u64,
    ) -> Vec<SessionAction> {
        let raw_name = frame
            .path_segments()
            .skip(1)
            .collect::<Vec<_>>()
            .join("/");
        let name = truncate_name(&raw_name, self.limits.max_event_name_bytes);
        let ttl_secs = frame.max_age.unwrap_or(self.limits.default_event_ttl_secs);
        let data = (!frame.payload.is_empty()).then(|| frame.payload.clone());
        let confirmable = frame.is_confirmable();
        let id = frame.id;

        let mut actions = Vec::new();
        if let Some(internal) = name.strip_prefix("spark/") {
            match internal {
                "device/claim/code" => {
                    let code =
                        String::from_utf8_lossy(data.as_deref().unwrap_or_default()).into_owned();
                    if !code.is_empty()
                        && ctx.core_attribute("claimCode").as_deref() != Some(code.as_str())
                    {
                        ctx.set_core_attribute("claimCode", &code);
                        ctx.link_device(&code, self.identity.product_id);
                    }
                }
                "device/system/version" => {
                    let version =
                        String::from_utf8_lossy(data.as_deref().unwrap_or_default()).into_owned();
                    ctx.set_core_attribute("spark_system_version", &version);
                }
                "device/safemode" => actions.push(SessionAction::SafeModeRequested),
                _ => {
                    tracing::debug!(
                        device_id = %self.identity.device_id,
                        event = %name,
                        "internal event acknowledged and dropped"
                    );
                }
            }
            if confirmable {
                actions.push(SessionAction::Send(event_ack(id)));
            }
            return actions;
        }

        let record = EventRecord {
            name: name.into_owned(),
            is_public,
            ttl_secs,
            data,
            device_id: self.identity.device_id,
            user_id: self.identity.user_id.clone(),
            published_at_secs: (now_ms / 1000) as u32,
        };
        if !ctx.publish(record) {
            let spec = MessageKind::EventSlowdown.spec();
            actions.push(SessionAction::Send(Message::new(spec.mtype, spec.code, id)));
            return actions;
        }
        if confirmable {
            actions.push(SessionAction::Send(event_ack(id)));
        }
        actions
    }

    fn handle_subscribe(
        &mut self,
        frame: Message,
        ctx: &mut dyn SessionContext,
    ) -> Vec<SessionAction> {
        let name = frame
            .path_segments()
            .skip(1)
            .collect::<Vec<_>>()
            .join("/");
        if name.is_empty() {
            let spec = MessageKind::SubscribeFail.spec();
            return vec![SessionAction::Send(Message::new(spec.mtype, spec.code, frame.id))];
        }
        let user_scope = frame
            .uri_query
            .iter()
            .any(|q| q == "u" || q.starts_with("u="))
            .then(|| self.identity.user_id.clone());
        let device_filter = DeviceId::from_slice(&frame.payload);
        ctx.subscribe(name, user_scope, device_filter);

        let spec = MessageKind::SubscribeAck.spec();
        vec![SessionAction::Send(Message::new(spec.mtype, spec.code, frame.id))]
    }

    fn handle_get_time(&mut self, frame: Message, now_ms: u64) -> Vec<SessionAction> {
        let spec = MessageKind::GetTimeReturn.spec();
        let mut reply =
            Message::new(spec.mtype, spec.code, frame.id).with_token(frame.token.clone());
        reply.payload = Value::Uint32((now_ms / 1000) as u32).to_bytes();
        vec![SessionAction::Send(reply)]
    }
}

fn event_ack(id: u16) -> Message {
    let spec = MessageKind::EventAck.spec();
    Message::new(spec.mtype, spec.code, id)
}

/// Byte-cap a name without splitting a UTF-8 sequence.
fn truncate_name(name: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if name.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(name);
    }
    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Borrowed(&name[..end])
}
