//! Protocol codec for framing firmware chunks
//!
//! Handles the `!xxxx` length-prefixed frame format and the device-side
//! reassembly of records from a byte stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{CHUNK_SIZE, COMMAND_MARKER, FRAME_HEADER_SIZE, LINE_TERMINATOR};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame payload too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame length indicator: {0}")]
    InvalidLength(usize),
}

/// Number of frames needed to carry `size` bytes of firmware
pub fn frame_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Encode one chunk of firmware as `!` + 4 hex digits + payload
///
/// The length indicator counts the header itself, so a full 4096-byte chunk
/// is announced as `!1005`.
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) -> Result<(), CodecError> {
    if payload.len() > CHUNK_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len(), CHUNK_SIZE));
    }

    let header = format!("!{:04x}", payload.len() + FRAME_HEADER_SIZE);

    buf.reserve(FRAME_HEADER_SIZE + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    Ok(())
}

/// A complete unit of input as the device reassembles it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Length-indicated record; holds the payload without its header
    Frame(Bytes),
    /// Newline-terminated record, terminator included
    Line(Bytes),
}

/// Attempt to take one complete record off the front of the buffer
/// Returns Ok(None) if more data is needed
pub fn decode_record(buf: &mut BytesMut) -> Result<Option<Record>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] == COMMAND_MARKER {
        let digits = &buf[1..buf.len().min(FRAME_HEADER_SIZE)];
        let all_hex = digits.iter().all(u8::is_ascii_hexdigit);

        if all_hex && digits.len() < FRAME_HEADER_SIZE - 1 {
            // Could still turn out to be a length indicator.
            return Ok(None);
        }

        if all_hex {
            let length = parse_length(digits);
            if length < FRAME_HEADER_SIZE {
                return Err(CodecError::InvalidLength(length));
            }
            if buf.len() < length {
                return Ok(None);
            }

            let mut record = buf.split_to(length);
            record.advance(FRAME_HEADER_SIZE);
            return Ok(Some(Record::Frame(record.freeze())));
        }
    }

    match buf.iter().position(|&b| b == LINE_TERMINATOR) {
        Some(pos) => Ok(Some(Record::Line(buf.split_to(pos + 1).freeze()))),
        None => Ok(None),
    }
}

fn parse_length(digits: &[u8]) -> usize {
    digits.iter().fold(0, |acc, &d| {
        // Digits are checked by the caller.
        acc * 16 + (d as char).to_digit(16).unwrap_or(0) as usize
    })
}
