//! Four-step handshake over the raw socket.
//!
//! 1. Device sends `nonce(40) || device_id(12)` in the clear.
//! 2. Server replies one RSA-OAEP block to the device public key:
//!    `session_seed(40) || hmac_sha1(key = session_seed, data = device_pub_der)`.
//! 3. Device replies one RSA-OAEP block to the server public key
//!    carrying its chosen 40-byte session secret; both ends split it
//!    into the CBC key and the two direction IVs.
//! 4. The first ciphertext frame is the device Hello; the server
//!    answers with its own Hello and the session is up.

use std::io::{Read, Write};

use thiserror::Error;

use crate::config::Limits;
use crate::crypto::{
    self, CbcStream, CryptoError, SESSION_SECRET_LEN, ServerKeys, hmac_sha1, public_key_der,
    rsa_decrypt, rsa_encrypt,
};
use crate::gateway::cipher::{self, CipherError};
use crate::gateway::collaborators::DeviceKeyStore;
use crate::gateway::{DEVICE_ID_LEN, DeviceId};
use crate::proto::coap::CoapError;
use crate::proto::{self, Message, MessageKind};

pub const NONCE_LEN: usize = 40;
pub const RSA_BLOCK_LEN: usize = 128;

/// Message id carried by the server Hello; seeds the send counter.
pub const SERVER_HELLO_ID: u16 = 1;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("cipher session failed during hello: {0}")]
    Cipher(#[from] CipherError),
    #[error("hello frame invalid: {0}")]
    Frame(#[from] CoapError),
    #[error("device {device_id} not present in the key store")]
    UnknownDevice { device_id: DeviceId },
    #[error("session key length invalid: expected {SESSION_SECRET_LEN} got {got}")]
    BadSessionKey { got: usize },
    #[error("first ciphertext frame was not a hello")]
    FirstFrameNotHello,
}

/// Hello payload: up to three optional u16-LE values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HelloInfo {
    pub product_id: u16,
    pub firmware_version: u16,
    pub platform_id: u16,
}

impl HelloInfo {
    pub fn parse(payload: &[u8]) -> Self {
        let mut fields = payload
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        Self {
            product_id: fields.next().unwrap_or_default(),
            firmware_version: fields.next().unwrap_or_default(),
            platform_id: fields.next().unwrap_or_default(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.extend_from_slice(&self.product_id.to_le_bytes());
        out.extend_from_slice(&self.firmware_version.to_le_bytes());
        out.extend_from_slice(&self.platform_id.to_le_bytes());
        out
    }
}

pub struct HandshakeOutcome {
    pub device_id: DeviceId,
    pub hello: HelloInfo,
    /// The device Hello's message id; seeds the receive counter.
    pub hello_id: u16,
    /// Server-to-device cipher stream.
    pub send: CbcStream,
    /// Device-to-server cipher stream.
    pub recv: CbcStream,
}

pub fn run_server_handshake<S: Read + Write>(
    stream: &mut S,
    keys: &ServerKeys,
    key_store: &dyn DeviceKeyStore,
    limits: &Limits,
) -> Result<HandshakeOutcome, HandshakeError> {
    // step 1: clear nonce + device id
    let mut opening = [0u8; NONCE_LEN + DEVICE_ID_LEN];
    stream.read_exact(&mut opening)?;
    let device_id = DeviceId::from_slice(&opening[NONCE_LEN..])
        .expect("slice length fixed by the read above");

    let device_pub = key_store
        .public_key(&device_id)
        .ok_or(HandshakeError::UnknownDevice { device_id })?;

    // step 2: seeded challenge under the device key
    let seed = crypto::nonce_40();
    let digest = hmac_sha1(&seed, &public_key_der(&device_pub)?);
    let mut challenge = Vec::with_capacity(SESSION_SECRET_LEN + digest.len());
    challenge.extend_from_slice(&seed);
    challenge.extend_from_slice(&digest);
    stream.write_all(&rsa_encrypt(&device_pub, &challenge)?)?;

    // step 3: device-chosen session secret under the server key
    let mut block = [0u8; RSA_BLOCK_LEN];
    stream.read_exact(&mut block)?;
    let secret = rsa_decrypt(&keys.private, &block)?;
    let secret: [u8; SESSION_SECRET_LEN] = secret
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::BadSessionKey { got: secret.len() })?;
    let (key, iv_send, iv_recv) = crypto::split_session_secret(&secret);
    let mut send = CbcStream::new(key, iv_send);
    let mut recv = CbcStream::new(key, iv_recv);

    // step 4: device hello, then ours
    let frame = cipher::read_frame(stream, &mut recv, limits.max_frame_bytes)?;
    let msg = proto::coap::decode(&frame)?;
    if proto::classify_request(&msg) != MessageKind::Hello {
        return Err(HandshakeError::FirstFrameNotHello);
    }
    let hello = HelloInfo::parse(&msg.payload);
    let hello_id = msg.id;

    let spec = MessageKind::Hello.spec();
    let server_hello = Message::new(spec.mtype, spec.code, SERVER_HELLO_ID).with_path("h");
    cipher::write_frame(
        stream,
        &mut send,
        limits.max_frame_bytes,
        &proto::coap::encode(&server_hello),
    )?;

    tracing::debug!(
        device_id = %device_id,
        product_id = hello.product_id,
        firmware_version = hello.firmware_version,
        platform_id = hello.platform_id,
        "handshake complete"
    );

    Ok(HandshakeOutcome {
        device_id,
        hello,
        hello_id,
        send,
        recv,
    })
}
