//! Cipher session framing (2-byte big-endian length + AES-128-CBC).
//!
//! One whole protocol frame per length-prefixed ciphertext record. The
//! length travels in the clear; everything after it is one CBC message.

use std::io::{Read, Write};

use thiserror::Error;

use crate::crypto::{CbcStream, CryptoError};

pub const LENGTH_PREFIX_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame length cannot be zero")]
    ZeroLength,
}

pub struct CipherReader<R> {
    reader: R,
    cipher: CbcStream,
    max_frame_bytes: usize,
}

impl<R: Read> CipherReader<R> {
    pub fn new(reader: R, cipher: CbcStream, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            cipher,
            max_frame_bytes,
        }
    }

    /// Read one frame; `Ok(None)` on clean EOF before a length prefix.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, CipherError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let mut read = 0usize;
        while read < prefix.len() {
            let n = self.reader.read(&mut prefix[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "length prefix truncated",
                )
                .into());
            }
            read += n;
        }

        let length = u16::from_be_bytes(prefix) as usize;
        if length == 0 {
            return Err(CipherError::ZeroLength);
        }
        if length > self.max_frame_bytes {
            return Err(CipherError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut body[read_body..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "ciphertext truncated",
                )
                .into());
            }
            read_body += n;
        }

        Ok(Some(self.cipher.decrypt(&body)?))
    }
}

pub struct CipherWriter<W> {
    writer: W,
    cipher: CbcStream,
    max_frame_bytes: usize,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(writer: W, cipher: CbcStream, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            cipher,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, plain: &[u8]) -> Result<usize, CipherError> {
        let body = self.cipher.encrypt(plain);
        if body.len() > self.max_frame_bytes || body.len() > u16::MAX as usize {
            return Err(CipherError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes.min(u16::MAX as usize),
                got_bytes: body.len(),
            });
        }
        let mut record = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        self.writer.write_all(&record)?;
        Ok(record.len())
    }
}

/// One-shot frame read over a borrowed stream, used before the session
/// loop owns a reader (handshake step four).
pub fn read_frame<R: Read>(
    reader: &mut R,
    cipher: &mut CbcStream,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, CipherError> {
    let mut shim = CipherReader::new(reader, cipher.clone(), max_frame_bytes);
    let frame = shim.read_next()?.ok_or_else(|| {
        CipherError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before first frame",
        ))
    })?;
    *cipher = shim.cipher;
    Ok(frame)
}

/// One-shot frame write over a borrowed stream (handshake step four).
pub fn write_frame<W: Write>(
    writer: &mut W,
    cipher: &mut CbcStream,
    max_frame_bytes: usize,
    plain: &[u8],
) -> Result<(), CipherError> {
    let mut shim = CipherWriter::new(writer, cipher.clone(), max_frame_bytes);
    shim.write_frame(plain)?;
    *cipher = shim.cipher;
    Ok(())
}
