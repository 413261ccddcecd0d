//! OTA flasher state machine.
//!
//! Sans-IO like the session: the runtime performs the sends the steps
//! describe and feeds device acknowledgements back in. The flasher
//! holds exclusive ownership of the session for its whole run.

use thiserror::Error;

use crate::config::Limits;
use crate::crypto::{AES_BLOCK, crc32};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FlashError {
    #[error("binary is empty")]
    EmptyBinary,
    #[error("binary too large: max {max} got {got}")]
    OversizeBinary { max: usize, got: usize },
    #[error("chunk {index} failed after {attempts} retransmits")]
    RetriesExhausted { index: usize, attempts: u32 },
    #[error("no known firmware for {app}")]
    UnknownFirmware { app: String },
    #[error("device never acknowledged {stage}")]
    StageTimeout { stage: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStatus {
    Success,
    Failed,
}

impl FlashStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlashStatus::Success => "success",
            FlashStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlasherPhase {
    Preparing,
    BeginSent,
    SendingChunks,
    AwaitingChunkAck,
    Done,
    Failed,
}

/// What the runtime must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashStep {
    SendChunk { index: usize },
    SendDone,
    Failed(FlashError),
}

pub struct Flasher {
    chunks: Vec<Vec<u8>>,
    binary_len: usize,
    index: usize,
    attempts: u32,
    max_retries: u32,
    phase: FlasherPhase,
}

impl Flasher {
    /// Validate and chunk the binary. The final chunk is zero-padded to
    /// the cipher block boundary; receipts CRC the padded bytes as sent.
    pub fn prepare(binary: &[u8], limits: &Limits) -> Result<Self, FlashError> {
        if binary.is_empty() {
            return Err(FlashError::EmptyBinary);
        }
        if binary.len() > limits.max_binary_size {
            return Err(FlashError::OversizeBinary {
                max: limits.max_binary_size,
                got: binary.len(),
            });
        }
        let mut chunks: Vec<Vec<u8>> = binary
            .chunks(limits.flash_chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        if let Some(last) = chunks.last_mut() {
            last.resize(last.len().next_multiple_of(AES_BLOCK), 0);
        }
        Ok(Self {
            chunks,
            binary_len: binary.len(),
            index: 0,
            attempts: 0,
            max_retries: limits.max_chunk_retries,
            phase: FlasherPhase::Preparing,
        })
    }

    pub fn phase(&self) -> FlasherPhase {
        self.phase
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn binary_len(&self) -> usize {
        self.binary_len
    }

    pub fn chunk(&self, index: usize) -> &[u8] {
        &self.chunks[index]
    }

    pub fn mark_begin_sent(&mut self) {
        self.phase = FlasherPhase::BeginSent;
    }

    /// Device acknowledged UpdateBegin with UpdateReady.
    pub fn on_update_ready(&mut self) -> FlashStep {
        self.phase = FlasherPhase::SendingChunks;
        FlashStep::SendChunk { index: 0 }
    }

    /// The runtime wrote the chunk; its receipt is now awaited.
    pub fn mark_chunk_sent(&mut self) {
        if self.phase == FlasherPhase::SendingChunks {
            self.phase = FlasherPhase::AwaitingChunkAck;
        }
    }

    /// Device receipt for the in-flight chunk.
    pub fn on_chunk_receipt(&mut self, receipt_crc: u32) -> FlashStep {
        let expected = crc32(&self.chunks[self.index]);
        if receipt_crc == expected {
            self.index += 1;
            self.attempts = 0;
            if self.index == self.chunks.len() {
                self.phase = FlasherPhase::Done;
                return FlashStep::SendDone;
            }
            self.phase = FlasherPhase::SendingChunks;
            return FlashStep::SendChunk { index: self.index };
        }

        if self.attempts >= self.max_retries {
            let error = FlashError::RetriesExhausted {
                index: self.index,
                attempts: self.attempts,
            };
            self.phase = FlasherPhase::Failed;
            return FlashStep::Failed(error);
        }
        self.attempts += 1;
        self.phase = FlasherPhase::SendingChunks;
        FlashStep::SendChunk { index: self.index }
    }

    /// A stage deadline expired; the run is over.
    pub fn fail(&mut self, error: FlashError) -> FlashStep {
        self.phase = FlasherPhase::Failed;
        FlashStep::Failed(error)
    }

    /// UpdateBegin payload: binary length (u32 LE) + chunk size (u16 LE).
    pub fn begin_payload(&self, limits: &Limits) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.extend_from_slice(&(self.binary_len as u32).to_le_bytes());
        out.extend_from_slice(&(limits.flash_chunk_size as u16).to_le_bytes());
        out
    }
}
