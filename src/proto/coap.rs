//! CoAP 1.0 frame wrap/unwrap.
//!
//! Only the options this protocol uses are modeled: Uri-Path (11),
//! Content-Format (12), Max-Age (14), Uri-Query (15) and a private
//! elective Timestamp option (2050). Unknown elective options are
//! skipped on decode.

use thiserror::Error;

pub const COAP_VERSION: u8 = 1;
pub const MAX_TOKEN_LEN: usize = 8;
pub const PAYLOAD_MARKER: u8 = 0xff;

pub const OPTION_URI_PATH: u16 = 11;
pub const OPTION_CONTENT_FORMAT: u16 = 12;
pub const OPTION_MAX_AGE: u16 = 14;
pub const OPTION_URI_QUERY: u16 = 15;
pub const OPTION_TIMESTAMP: u16 = 2050;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoapError {
    #[error("frame truncated: {context}")]
    Truncated { context: &'static str },
    #[error("unsupported coap version {got}")]
    BadVersion { got: u8 },
    #[error("token length {got} exceeds {MAX_TOKEN_LEN}")]
    BadTokenLength { got: usize },
    #[error("reserved option nibble 15 outside payload marker")]
    BadOptionNibble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// CoAP code byte, `class.detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    /// 2.04 Changed
    pub const CHANGED: Code = Code(0x44);
    /// 2.05 Content
    pub const CONTENT: Code = Code(0x45);
    /// 4.00 Bad Request
    pub const BAD_REQUEST: Code = Code(0x80);
    /// 4.29 Too Many Requests
    pub const TOO_MANY_REQUESTS: Code = Code(0x9d);
    /// 5.03 Service Unavailable
    pub const SERVICE_UNAVAILABLE: Code = Code(0xa3);

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1f
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// A decoded CoAP-like frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: Code,
    pub id: u16,
    pub token: Vec<u8>,
    /// Uri-Path segments joined with `/`, no leading slash.
    pub uri_path: String,
    pub uri_query: Vec<String>,
    pub content_format: Option<u32>,
    pub max_age: Option<u32>,
    pub timestamp: Option<u32>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(mtype: MessageType, code: Code, id: u16) -> Self {
        Self {
            mtype,
            code,
            id,
            token: Vec::new(),
            uri_path: String::new(),
            uri_query: Vec::new(),
            content_format: None,
            max_age: None,
            timestamp: None,
            payload: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.uri_path = path.into();
        self
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_confirmable(&self) -> bool {
        self.mtype == MessageType::Confirmable
    }

    pub fn is_ack(&self) -> bool {
        self.mtype == MessageType::Acknowledgement
    }

    /// Empty message in the CoAP sense: code 0.00, nothing else.
    pub fn is_empty(&self) -> bool {
        self.code == Code::EMPTY && self.payload.is_empty()
    }

    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.uri_path.split('/').filter(|s| !s.is_empty())
    }

    pub fn token_byte(&self) -> Option<u8> {
        self.token.first().copied()
    }
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + msg.token.len() + msg.payload.len());
    let tkl = msg.token.len().min(MAX_TOKEN_LEN) as u8;
    out.push((COAP_VERSION << 6) | (msg.mtype.bits() << 4) | tkl);
    out.push(msg.code.0);
    out.extend_from_slice(&msg.id.to_be_bytes());
    out.extend_from_slice(&msg.token[..tkl as usize]);

    let mut last_number = 0u16;
    for segment in msg.path_segments() {
        push_option(&mut out, &mut last_number, OPTION_URI_PATH, segment.as_bytes());
    }
    if let Some(format) = msg.content_format {
        push_option(&mut out, &mut last_number, OPTION_CONTENT_FORMAT, &uint_bytes(format));
    }
    if let Some(age) = msg.max_age {
        push_option(&mut out, &mut last_number, OPTION_MAX_AGE, &uint_bytes(age));
    }
    for query in &msg.uri_query {
        push_option(&mut out, &mut last_number, OPTION_URI_QUERY, query.as_bytes());
    }
    if let Some(stamp) = msg.timestamp {
        push_option(&mut out, &mut last_number, OPTION_TIMESTAMP, &uint_bytes(stamp));
    }

    if !msg.payload.is_empty() {
        out.push(PAYLOAD_MARKER);
        out.extend_from_slice(&msg.payload);
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<Message, CoapError> {
    if bytes.len() < 4 {
        return Err(CoapError::Truncated { context: "header" });
    }
    let version = bytes[0] >> 6;
    if version != COAP_VERSION {
        return Err(CoapError::BadVersion { got: version });
    }
    let mtype = MessageType::from_bits(bytes[0] >> 4);
    let tkl = (bytes[0] & 0x0f) as usize;
    if tkl > MAX_TOKEN_LEN {
        return Err(CoapError::BadTokenLength { got: tkl });
    }
    let code = Code(bytes[1]);
    let id = u16::from_be_bytes([bytes[2], bytes[3]]);

    let mut at = 4usize;
    if bytes.len() < at + tkl {
        return Err(CoapError::Truncated { context: "token" });
    }
    let token = bytes[at..at + tkl].to_vec();
    at += tkl;

    let mut msg = Message::new(mtype, code, id).with_token(token);
    let mut segments: Vec<String> = Vec::new();
    let mut number = 0u16;
    while at < bytes.len() {
        let first = bytes[at];
        if first == PAYLOAD_MARKER {
            at += 1;
            if at >= bytes.len() {
                return Err(CoapError::Truncated { context: "payload after marker" });
            }
            msg.payload = bytes[at..].to_vec();
            break;
        }
        at += 1;
        let delta = read_extended(bytes, &mut at, first >> 4)?;
        let length = read_extended(bytes, &mut at, first & 0x0f)? as usize;
        number = number.wrapping_add(delta);
        if bytes.len() < at + length {
            return Err(CoapError::Truncated { context: "option value" });
        }
        let value = &bytes[at..at + length];
        at += length;

        match number {
            OPTION_URI_PATH => segments.push(String::from_utf8_lossy(value).into_owned()),
            OPTION_CONTENT_FORMAT => msg.content_format = Some(uint_from(value)),
            OPTION_MAX_AGE => msg.max_age = Some(uint_from(value)),
            OPTION_URI_QUERY => msg.uri_query.push(String::from_utf8_lossy(value).into_owned()),
            OPTION_TIMESTAMP => msg.timestamp = Some(uint_from(value)),
            _ => {}
        }
    }
    msg.uri_path = segments.join("/");
    Ok(msg)
}

fn push_option(out: &mut Vec<u8>, last_number: &mut u16, number: u16, value: &[u8]) {
    let delta = number - *last_number;
    *last_number = number;
    let (delta_nibble, delta_ext) = split_extended(delta as u32);
    let (len_nibble, len_ext) = split_extended(value.len() as u32);
    out.push((delta_nibble << 4) | len_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);
    out.extend_from_slice(value);
}

fn split_extended(value: u32) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

fn read_extended(bytes: &[u8], at: &mut usize, nibble: u8) -> Result<u16, CoapError> {
    match nibble {
        0..=12 => Ok(u16::from(nibble)),
        13 => {
            let ext = *bytes.get(*at).ok_or(CoapError::Truncated { context: "option ext8" })?;
            *at += 1;
            Ok(u16::from(ext) + 13)
        }
        14 => {
            let ext = bytes
                .get(*at..*at + 2)
                .ok_or(CoapError::Truncated { context: "option ext16" })?;
            *at += 2;
            Ok(u16::from_be_bytes([ext[0], ext[1]]) + 269)
        }
        _ => Err(CoapError::BadOptionNibble),
    }
}

fn uint_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn uint_from(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}
