//! Message model: kind table, response table, request classification.

pub mod coap;
pub mod value;

pub use coap::{Code, CoapError, Message, MessageType};

/// Token handling a kind requires on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenReq {
    /// Sender must attach a fresh token; a reply is awaited.
    Required,
    /// Reply kinds: the request's token is echoed back.
    Echoed,
    /// No token.
    None,
}

/// Static description of one message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSpec {
    pub mtype: MessageType,
    pub code: Code,
    /// URI template; `…` marks kinds that append a name after the prefix.
    pub uri: Option<&'static str>,
    pub token: TokenReq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageKind {
    Hello,
    KeyChange,
    Describe,
    DescribeReturn,
    VariableRequest,
    VariableValue,
    FunctionCall,
    FunctionReturn,
    UpdateBegin,
    UpdateReady,
    UpdateAbort,
    UpdateDone,
    Chunk,
    ChunkReceived,
    Event,
    PublicEvent,
    PrivateEvent,
    Subscribe,
    SubscribeAck,
    SubscribeFail,
    GetTime,
    GetTimeReturn,
    RaiseYourHand,
    RaiseYourHandReturn,
    SignalStart,
    EventAck,
    EventSlowdown,
    Ping,
    PingAck,
    Ignored,
}

impl MessageKind {
    pub fn spec(self) -> KindSpec {
        use MessageKind::*;
        use MessageType::*;
        match self {
            Hello => KindSpec {
                mtype: NonConfirmable,
                code: Code::POST,
                uri: Some("h"),
                token: TokenReq::None,
            },
            KeyChange => KindSpec {
                mtype: Confirmable,
                code: Code::PUT,
                uri: Some("k"),
                token: TokenReq::Required,
            },
            Describe => KindSpec {
                mtype: Confirmable,
                code: Code::GET,
                uri: Some("d"),
                token: TokenReq::Required,
            },
            DescribeReturn => KindSpec {
                mtype: Acknowledgement,
                code: Code::CONTENT,
                uri: None,
                token: TokenReq::Echoed,
            },
            VariableRequest => KindSpec {
                mtype: Confirmable,
                code: Code::GET,
                uri: Some("v/…"),
                token: TokenReq::Required,
            },
            VariableValue => KindSpec {
                mtype: Acknowledgement,
                code: Code::CONTENT,
                uri: None,
                token: TokenReq::Echoed,
            },
            FunctionCall => KindSpec {
                mtype: Confirmable,
                code: Code::POST,
                uri: Some("f/…"),
                token: TokenReq::Required,
            },
            FunctionReturn => KindSpec {
                mtype: Acknowledgement,
                code: Code::CHANGED,
                uri: None,
                token: TokenReq::Echoed,
            },
            UpdateBegin => KindSpec {
                mtype: Confirmable,
                code: Code::POST,
                uri: Some("u"),
                token: TokenReq::Required,
            },
            UpdateReady => KindSpec {
                mtype: Acknowledgement,
                code: Code::CHANGED,
                uri: None,
                token: TokenReq::Echoed,
            },
            UpdateAbort => KindSpec {
                mtype: NonConfirmable,
                code: Code::BAD_REQUEST,
                uri: None,
                token: TokenReq::None,
            },
            UpdateDone => KindSpec {
                mtype: Confirmable,
                code: Code::PUT,
                uri: Some("u"),
                token: TokenReq::Required,
            },
            Chunk => KindSpec {
                mtype: Confirmable,
                code: Code::POST,
                uri: Some("c"),
                token: TokenReq::Required,
            },
            ChunkReceived => KindSpec {
                mtype: Acknowledgement,
                code: Code::CHANGED,
                uri: None,
                token: TokenReq::Echoed,
            },
            Event => KindSpec {
                mtype: NonConfirmable,
                code: Code::POST,
                uri: Some("e/…"),
                token: TokenReq::None,
            },
            PublicEvent => KindSpec {
                mtype: NonConfirmable,
                code: Code::POST,
                uri: Some("E/…"),
                token: TokenReq::None,
            },
            PrivateEvent => KindSpec {
                mtype: NonConfirmable,
                code: Code::POST,
                uri: Some("e/…"),
                token: TokenReq::None,
            },
            Subscribe => KindSpec {
                mtype: Confirmable,
                code: Code::GET,
                uri: Some("e/…"),
                token: TokenReq::None,
            },
            SubscribeAck => KindSpec {
                mtype: Acknowledgement,
                code: Code::CHANGED,
                uri: None,
                token: TokenReq::None,
            },
            SubscribeFail => KindSpec {
                mtype: Acknowledgement,
                code: Code::BAD_REQUEST,
                uri: None,
                token: TokenReq::None,
            },
            GetTime => KindSpec {
                mtype: Confirmable,
                code: Code::GET,
                uri: Some("t"),
                token: TokenReq::Required,
            },
            GetTimeReturn => KindSpec {
                mtype: Acknowledgement,
                code: Code::CONTENT,
                uri: None,
                token: TokenReq::Echoed,
            },
            RaiseYourHand => KindSpec {
                mtype: Confirmable,
                code: Code::PUT,
                uri: Some("s/raise"),
                token: TokenReq::Required,
            },
            RaiseYourHandReturn => KindSpec {
                mtype: Acknowledgement,
                code: Code::CHANGED,
                uri: None,
                token: TokenReq::Echoed,
            },
            SignalStart => KindSpec {
                mtype: Confirmable,
                code: Code::PUT,
                uri: Some("s"),
                token: TokenReq::Required,
            },
            EventAck => KindSpec {
                mtype: Acknowledgement,
                code: Code::CHANGED,
                uri: None,
                token: TokenReq::None,
            },
            EventSlowdown => KindSpec {
                mtype: Acknowledgement,
                code: Code::TOO_MANY_REQUESTS,
                uri: None,
                token: TokenReq::None,
            },
            Ping => KindSpec {
                mtype: Confirmable,
                code: Code::EMPTY,
                uri: None,
                token: TokenReq::None,
            },
            PingAck => KindSpec {
                mtype: Acknowledgement,
                code: Code::EMPTY,
                uri: None,
                token: TokenReq::None,
            },
            Ignored => KindSpec {
                mtype: MessageType::Reset,
                code: Code::EMPTY,
                uri: None,
                token: TokenReq::None,
            },
        }
    }

    /// Expected reply kind for a request that awaits one.
    pub fn response(self) -> Option<MessageKind> {
        use MessageKind::*;
        match self {
            Hello => Some(Hello),
            Describe => Some(DescribeReturn),
            VariableRequest => Some(VariableValue),
            FunctionCall => Some(FunctionReturn),
            UpdateBegin => Some(UpdateReady),
            Chunk => Some(ChunkReceived),
            GetTime => Some(GetTimeReturn),
            RaiseYourHand | SignalStart => Some(RaiseYourHandReturn),
            _ => None,
        }
    }

    pub fn all() -> &'static [MessageKind] {
        use MessageKind::*;
        &[
            Hello,
            KeyChange,
            Describe,
            DescribeReturn,
            VariableRequest,
            VariableValue,
            FunctionCall,
            FunctionReturn,
            UpdateBegin,
            UpdateReady,
            UpdateAbort,
            UpdateDone,
            Chunk,
            ChunkReceived,
            Event,
            PublicEvent,
            PrivateEvent,
            Subscribe,
            SubscribeAck,
            SubscribeFail,
            GetTime,
            GetTimeReturn,
            RaiseYourHand,
            RaiseYourHandReturn,
            SignalStart,
            EventAck,
            EventSlowdown,
            Ping,
            PingAck,
            Ignored,
        ]
    }

    pub fn name(self) -> &'static str {
        use MessageKind::*;
        match self {
            Hello => "Hello",
            KeyChange => "KeyChange",
            Describe => "Describe",
            DescribeReturn => "DescribeReturn",
            VariableRequest => "VariableRequest",
            VariableValue => "VariableValue",
            FunctionCall => "FunctionCall",
            FunctionReturn => "FunctionReturn",
            UpdateBegin => "UpdateBegin",
            UpdateReady => "UpdateReady",
            UpdateAbort => "UpdateAbort",
            UpdateDone => "UpdateDone",
            Chunk => "Chunk",
            ChunkReceived => "ChunkReceived",
            Event => "Event",
            PublicEvent => "PublicEvent",
            PrivateEvent => "PrivateEvent",
            Subscribe => "Subscribe",
            SubscribeAck => "SubscribeAck",
            SubscribeFail => "SubscribeFail",
            GetTime => "GetTime",
            GetTimeReturn => "GetTimeReturn",
            RaiseYourHand => "RaiseYourHand",
            RaiseYourHandReturn => "RaiseYourHandReturn",
            SignalStart => "SignalStart",
            EventAck => "EventAck",
            EventSlowdown => "EventSlowdown",
            Ping => "Ping",
            PingAck => "PingAck",
            Ignored => "Ignored",
        }
    }
}

/// Classify a non-ack inbound frame by code and URI.
pub fn classify_request(msg: &Message) -> MessageKind {
    use MessageKind::*;
    if msg.mtype == MessageType::Reset {
        return Ignored;
    }
    if msg.is_empty() {
        return Ping;
    }
    let mut segments = msg.path_segments();
    let head = segments.next().unwrap_or("");
    let second = segments.next();
    match (msg.code, head) {
        (Code::POST, "h") => Hello,
        (Code::PUT, "k") => KeyChange,
        (Code::GET, "d") => Describe,
        (Code::GET, "v") => VariableRequest,
        (Code::POST, "f") => FunctionCall,
        (Code::POST, "e") => PrivateEvent,
        (Code::POST, "E") => PublicEvent,
        (Code::GET, "e") => Subscribe,
        (Code::GET, "t") => GetTime,
        (Code::PUT, "s") if second == Some("raise") => RaiseYourHand,
        (Code::PUT, "s") => SignalStart,
        (Code::POST, "u") => UpdateBegin,
        (Code::PUT, "u") => UpdateDone,
        (Code::POST, "c") => Chunk,
        _ => Ignored,
    }
}
