#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod proto;
pub mod telemetry;

pub use error::{Error, IntrospectionError, OwnershipError, ProtocolError};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types embedders touch at the crate root for convenience
pub use crate::config::{Config, Limits, LogFormat, LoggingConfig};
pub use crate::crypto::{CryptoError, ServerKeys};
pub use crate::gateway::{
    ApiClient, AttributeStore, Command, CommandReply, DeviceId, DeviceKeyStore, DirFirmwareStore,
    EventRecord, FirmwareStore, FlashError, GatewayDeps, HandshakeError, MemoryAttributeStore,
    MemoryKeyStore, MemoryPublisher, Publisher, RecordingApiClient, SessionHandle,
    SessionRegistry, SubscriptionRequest, attach,
};
pub use crate::proto::value::{Value, VarType};
pub use crate::proto::{Message, MessageKind};
