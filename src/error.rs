//! Gateway error taxonomy.
//!
//! Io, crypto, and protocol faults are fatal to a session and trigger
//! disconnect. Introspection and flash faults are reported to the API
//! caller and leave the session up. Ownership faults are returned
//! synchronously to the writer that lost the race.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::gateway::flasher::FlashError;
use crate::gateway::handshake::HandshakeError;
use crate::proto::coap::CoapError;

/// Protocol violations on an established session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Bad Counter: expected message id {expected} got {got}")]
    BadCounter { expected: u16, got: u16 },
    #[error("bad frame: {0}")]
    BadFrame(#[from] CoapError),
    #[error("unknown token {token}")]
    UnknownToken { token: u8 },
    #[error("all tokens in flight")]
    TokensExhausted,
    #[error("request timed out waiting for {waiting_for}")]
    RequestTimeout { waiting_for: &'static str },
    #[error("session disconnected")]
    Disconnected,
}

/// Faults in the cached device description.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntrospectionError {
    #[error("device description not available")]
    NoDescription,
    #[error("Unknown Function: {name}")]
    UnknownFunction { name: String },
    #[error("device description unparsable: {reason}")]
    BadDescription { reason: String },
    #[error("variable payload undecodable: {reason}")]
    BadVariable { reason: String },
}

/// Exclusive-writer violations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("locked during flashing")]
    LockedDuringFlashing,
    #[error("session already owned")]
    AlreadyOwned,
}

/// Crate-level error.
///
/// A thin wrapper over the per-concern enums; `is_fatal` tells the
/// runtime whether the session must come down.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Introspection(#[from] IntrospectionError),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(_) | Error::Crypto(_) | Error::Handshake(_) | Error::Protocol(_) => true,
            Error::Introspection(_) | Error::Flash(_) | Error::Ownership(_) => false,
        }
    }
}
