//! Per-device gateway: handshake, cipher session, protocol machine,
//! OTA flasher, collaborator seams.

use std::fmt;

pub mod cipher;
pub mod collaborators;
pub mod flasher;
pub mod handshake;
pub mod publisher;
pub mod registry;
pub mod runtime;
pub mod session;

pub use cipher::{CipherError, CipherReader, CipherWriter};
pub use collaborators::{
    ApiCall, ApiClient, AttributeStore, DeviceKeyStore, DirFirmwareStore, FirmwareStore,
    MemoryAttributeStore, MemoryKeyStore, RecordingApiClient,
};
pub use flasher::{FlashError, FlashStatus, Flasher};
pub use handshake::{HandshakeError, HandshakeOutcome, HelloInfo};
pub use publisher::{EventRecord, MemoryPublisher, Publisher, SubscriptionRequest};
pub use registry::SessionRegistry;
pub use runtime::{Command, CommandReply, GatewayDeps, SessionHandle, attach};
pub use session::{
    DeviceDescription, DeviceSession, DisconnectReason, FunctionSpec, Owner, SessionAction,
    SessionContext, SessionIdentity, SessionPhase,
};

pub const DEVICE_ID_LEN: usize = 12;

/// Opaque 12-byte device identifier, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    pub fn from_bytes(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn parse_hex(hex_str: &str) -> Option<Self> {
        let raw = hex::decode(hex_str).ok()?;
        Self::from_slice(&raw)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", hex::encode(self.0))
    }
}
